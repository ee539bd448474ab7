use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MANIFEST_NAME: &str = "manifest.mpd";
pub const CONTENT_KEY_NAME: &str = "content.key";
pub const KEY_REFERENCE_NAME: &str = "key-reference.txt";
pub const ASSET_RECORD_NAME: &str = "asset.json";
pub const ENCODER_LOG_NAME: &str = "encoder.log";

const MAX_ASSET_ID_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssetIdError {
    #[error("asset id must not be empty")]
    Empty,
    #[error("asset id exceeds {MAX_ASSET_ID_LEN} characters")]
    TooLong,
    #[error("asset id contains characters outside [A-Za-z0-9_-]")]
    InvalidCharacter,
}

/// Opaque asset identity. Restricted to a filename-safe alphabet because it
/// names the asset's workspace directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetId(String);

impl AssetId {
    pub fn parse(value: impl Into<String>) -> Result<Self, AssetIdError> {
        let value = value.into();
        if value.is_empty() {
            return Err(AssetIdError::Empty);
        }
        if value.len() > MAX_ASSET_ID_LEN {
            return Err(AssetIdError::TooLong);
        }
        if !value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(AssetIdError::InvalidCharacter);
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AssetId {
    type Err = AssetIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AssetId {
    type Error = AssetIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<AssetId> for String {
    fn from(value: AssetId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackagingFormat {
    SingleFile,
    SegmentedManifest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetState {
    Pending,
    Queued,
    Packaging,
    Ready,
    Failed,
}

impl AssetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetState::Pending => "pending",
            AssetState::Queued => "queued",
            AssetState::Packaging => "packaging",
            AssetState::Ready => "ready",
            AssetState::Failed => "failed",
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, AssetState::Queued | AssetState::Packaging)
    }
}

impl fmt::Display for AssetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub source_path: Option<PathBuf>,
    pub duration_seconds: Option<f64>,
    pub format: PackagingFormat,
    pub state: AssetState,
    pub workspace: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Asset {
    pub fn new(id: AssetId, source_path: PathBuf, workspace: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            source_path: Some(source_path),
            duration_seconds: None,
            format: PackagingFormat::SingleFile,
            state: AssetState::Pending,
            workspace,
            created_at: now,
            updated_at: now,
            failure_reason: None,
        }
    }

    pub fn transition(&mut self, state: AssetState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

/// Filesystem layout of one asset workspace.
#[derive(Debug, Clone)]
pub struct AssetWorkspace {
    pub root: PathBuf,
    pub source_dir: PathBuf,
    pub package_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl AssetWorkspace {
    pub fn new(workspace_root: &Path, asset_id: &AssetId) -> Self {
        let root = workspace_root.join(asset_id.as_str());
        let source_dir = root.join("source");
        let package_dir = root.join("package");
        let logs_dir = root.join("logs");
        Self {
            root,
            source_dir,
            package_dir,
            logs_dir,
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.package_dir.join(MANIFEST_NAME)
    }

    pub fn key_path(&self) -> PathBuf {
        self.root.join(CONTENT_KEY_NAME)
    }

    pub fn key_reference_path(&self) -> PathBuf {
        self.root.join(KEY_REFERENCE_NAME)
    }

    pub fn record_path(&self) -> PathBuf {
        self.root.join(ASSET_RECORD_NAME)
    }

    pub fn encoder_log_path(&self) -> PathBuf {
        self.logs_dir.join(ENCODER_LOG_NAME)
    }

    pub fn staging_dir(&self, job: &str) -> PathBuf {
        self.root.join(format!(".staging-{job}"))
    }

    pub fn retired_dir(&self, job: &str) -> PathBuf {
        self.root.join(format!(".retired-{job}"))
    }
}
