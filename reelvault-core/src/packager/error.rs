use std::path::PathBuf;

use thiserror::Error;

use crate::asset::{AssetId, AssetIdError};
use crate::cipher::CipherError;
use crate::error::ErrorKind;
use crate::keys::KeyStoreError;
use crate::queue::SubmitError;

#[derive(Debug, Error)]
pub enum PackagerError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("asset {0} not found")]
    AssetNotFound(AssetId),
    #[error("asset {asset_id} is {state}; competing operation rejected")]
    Conflict { asset_id: AssetId, state: String },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("encoder could not be started: {0}")]
    Spawn(std::io::Error),
    #[error("encoder exited with status {status:?}")]
    EncoderFailed { status: Option<i32> },
    #[error("encoder terminated before completion")]
    Terminated,
    #[error("encoder output incomplete: {0}")]
    MissingOutput(String),
    #[error("packaging job timed out")]
    Timeout,
    #[error("packaging interrupted before completion")]
    Interrupted,
    #[error("admission queue full")]
    QueueFull,
    #[error("admission queue dropped the job")]
    Abandoned,
    #[error("key store error: {0}")]
    Keys(#[from] KeyStoreError),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PackagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PackagerError::Validation(_) => ErrorKind::Validation,
            PackagerError::AssetNotFound(_) => ErrorKind::NotFound,
            PackagerError::Conflict { .. } => ErrorKind::Conflict,
            PackagerError::Keys(err) => err.kind(),
            _ => ErrorKind::Internal,
        }
    }
}

impl From<AssetIdError> for PackagerError {
    fn from(error: AssetIdError) -> Self {
        PackagerError::Validation(error.to_string())
    }
}

impl From<SubmitError<PackagerError>> for PackagerError {
    fn from(error: SubmitError<PackagerError>) -> Self {
        match error {
            SubmitError::QueueFull { .. } => PackagerError::QueueFull,
            SubmitError::Timeout { .. } => PackagerError::Timeout,
            SubmitError::Abandoned(_) => PackagerError::Abandoned,
            SubmitError::Job(inner) => inner,
        }
    }
}

pub type PackagerResult<T> = Result<T, PackagerError>;
