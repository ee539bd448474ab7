use std::fmt;
use std::path::{Path, PathBuf};

use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use url::Url;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::asset::{AssetId, AssetWorkspace};
use crate::config::KeysSection;
use crate::error::ErrorKind;

pub const CONTENT_KEY_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("content key not found for asset {0}")]
    NotFound(AssetId),
    #[error("content key for asset {asset_id} is corrupt ({len} bytes)")]
    Corrupt { asset_id: AssetId, len: usize },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("invalid license url: {0}")]
    LicenseUrl(String),
}

impl KeyStoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeyStoreError::NotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        }
    }
}

pub type KeyStoreResult<T> = Result<T, KeyStoreError>;

/// 16-byte content key. Debug output never shows the key bytes and the
/// bytes are wiped when the value is dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ContentKey([u8; CONTENT_KEY_LEN]);

impl ContentKey {
    pub fn from_bytes(bytes: [u8; CONTENT_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CONTENT_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContentKey(<redacted>)")
    }
}

/// Stable public identifier for an asset's key, shared by the encoder
/// invocation and the license envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyId([u8; CONTENT_KEY_LEN]);

impl KeyId {
    pub fn for_asset(asset_id: &AssetId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"reelvault/kid/");
        hasher.update(asset_id.as_str().as_bytes());
        let digest = hasher.finalize();
        let mut kid = [0u8; CONTENT_KEY_LEN];
        kid.copy_from_slice(&digest[..CONTENT_KEY_LEN]);
        Self(kid)
    }

    pub fn as_bytes(&self) -> &[u8; CONTENT_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Derives per-asset keys from the master secret and caches them in each
/// asset's workspace.
#[derive(Clone)]
pub struct ContentKeyStore {
    master_secret: Vec<u8>,
    salt_prefix: String,
    rounds: u32,
    workspace_root: PathBuf,
    license_base_url: String,
}

impl fmt::Debug for ContentKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentKeyStore")
            .field("salt_prefix", &self.salt_prefix)
            .field("rounds", &self.rounds)
            .field("workspace_root", &self.workspace_root)
            .finish()
    }
}

impl ContentKeyStore {
    pub fn new(section: &KeysSection, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            master_secret: section.master_secret.as_bytes().to_vec(),
            salt_prefix: section.salt_prefix.clone(),
            rounds: section.rounds,
            workspace_root: workspace_root.into(),
            license_base_url: section.license_base_url.clone(),
        }
    }

    pub fn workspace(&self, asset_id: &AssetId) -> AssetWorkspace {
        AssetWorkspace::new(&self.workspace_root, asset_id)
    }

    /// `PBKDF2-HMAC-SHA256(master, SHA256(salt_prefix || asset_id), rounds)`.
    /// Pure and deterministic; performs no I/O.
    pub fn derive(&self, asset_id: &AssetId) -> ContentKey {
        let mut hasher = Sha256::new();
        hasher.update(self.salt_prefix.as_bytes());
        hasher.update(asset_id.as_str().as_bytes());
        let salt = hasher.finalize();
        let mut key = [0u8; CONTENT_KEY_LEN];
        pbkdf2_hmac::<Sha256>(&self.master_secret, &salt, self.rounds, &mut key);
        ContentKey(key)
    }

    pub fn key_id(&self, asset_id: &AssetId) -> KeyId {
        KeyId::for_asset(asset_id)
    }

    pub async fn store(&self, asset_id: &AssetId, key: &ContentKey) -> KeyStoreResult<PathBuf> {
        let workspace = self.workspace(asset_id);
        create_dir(&workspace.root).await?;
        let path = workspace.key_path();
        fs::write(&path, key.as_bytes())
            .await
            .map_err(|source| KeyStoreError::Io {
                source,
                path: path.clone(),
            })?;
        debug!(asset_id = %asset_id, "content key stored");
        Ok(path)
    }

    /// Derives the key and persists it, returning the stored value.
    pub async fn provision(&self, asset_id: &AssetId) -> KeyStoreResult<ContentKey> {
        let key = self.derive(asset_id);
        self.store(asset_id, &key).await?;
        Ok(key)
    }

    pub async fn exists(&self, asset_id: &AssetId) -> bool {
        fs::metadata(self.workspace(asset_id).key_path())
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    pub async fn load(&self, asset_id: &AssetId) -> KeyStoreResult<ContentKey> {
        let path = self.workspace(asset_id).key_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeyStoreError::NotFound(asset_id.clone()))
            }
            Err(source) => return Err(KeyStoreError::Io { source, path }),
        };
        let key: [u8; CONTENT_KEY_LEN] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| KeyStoreError::Corrupt {
                    asset_id: asset_id.clone(),
                    len: bytes.len(),
                })?;
        Ok(ContentKey(key))
    }

    pub fn license_url(&self, asset_id: &AssetId) -> KeyStoreResult<Url> {
        let base = Url::parse(&self.license_base_url)
            .map_err(|err| KeyStoreError::LicenseUrl(err.to_string()))?;
        let mut url = base;
        url.path_segments_mut()
            .map_err(|_| KeyStoreError::LicenseUrl("base url cannot carry a path".into()))?
            .pop_if_empty()
            .push("license")
            .push(asset_id.as_str());
        Ok(url)
    }

    /// Writes the two-line out-of-band key reference (license URL, local key
    /// path) consumed by encoders that do not take keys inline.
    pub async fn create_key_reference_file(&self, asset_id: &AssetId) -> KeyStoreResult<PathBuf> {
        let workspace = self.workspace(asset_id);
        let key_path = workspace.key_path();
        if !self.exists(asset_id).await {
            return Err(KeyStoreError::NotFound(asset_id.clone()));
        }
        let url = self.license_url(asset_id)?;
        let path = workspace.key_reference_path();
        let contents = format!("{}\n{}\n", url, key_path.display());
        fs::write(&path, contents)
            .await
            .map_err(|source| KeyStoreError::Io {
                source,
                path: path.clone(),
            })?;
        Ok(path)
    }

    /// Removes the transient key reference. Failures are logged, never raised.
    pub async fn cleanup(&self, asset_id: &AssetId) {
        let path = self.workspace(asset_id).key_reference_path();
        match fs::remove_file(&path).await {
            Ok(()) => info!(asset_id = %asset_id, "key reference removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(asset_id = %asset_id, path = %path.display(), error = %err, "failed to remove key reference")
            }
        }
    }
}

async fn create_dir(path: &Path) -> KeyStoreResult<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|source| KeyStoreError::Io {
            source,
            path: path.to_path_buf(),
        })
}
