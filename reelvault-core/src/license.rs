use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::asset::AssetId;
use crate::error::ErrorKind;
use crate::keys::{ContentKeyStore, KeyStoreError};
use crate::token::{TokenError, VerifiedToken};

pub const LICENSE_TYPE: &str = "temporary";
pub const KEY_TYPE: &str = "oct";

/// Headers that keep a delivered key out of every cache on the way.
pub const NO_STORE_HEADERS: [(&str, &str); 3] = [
    ("cache-control", "no-cache, no-store, must-revalidate"),
    ("pragma", "no-cache"),
    ("expires", "0"),
];

#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] TokenError),
    #[error("no content key for asset {0}")]
    NotFound(AssetId),
    #[error("license internal failure: {0}")]
    Internal(String),
}

impl LicenseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LicenseError::Unauthorized(_) => ErrorKind::Unauthorized,
            LicenseError::NotFound(_) => ErrorKind::NotFound,
            LicenseError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Wrong token and missing key read the same to a client.
    pub fn client_message(&self) -> &'static str {
        match self {
            LicenseError::Unauthorized(_) | LicenseError::NotFound(_) => "license not available",
            LicenseError::Internal(_) => "license access denied",
        }
    }
}

pub type LicenseResult<T> = Result<T, LicenseError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearKeyEntry {
    pub kty: String,
    pub kid: String,
    pub k: String,
}

/// W3C Clear Key license body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearKeyLicense {
    pub keys: Vec<ClearKeyEntry>,
    #[serde(rename = "type")]
    pub license_type: String,
}

#[derive(Debug, Clone)]
pub struct LicenseService {
    keys: ContentKeyStore,
}

impl LicenseService {
    pub fn new(keys: ContentKeyStore) -> Self {
        Self { keys }
    }

    pub async fn issue(
        &self,
        asset_id: &AssetId,
        token: &VerifiedToken,
    ) -> LicenseResult<ClearKeyLicense> {
        if token.claims.asset_id != asset_id.as_str() {
            return Err(LicenseError::Unauthorized(TokenError::AssetMismatch));
        }
        if !self.keys.exists(asset_id).await {
            warn!(asset_id = %asset_id, subject_id = %token.claims.subject_id, "license requested for asset without key");
            return Err(LicenseError::NotFound(asset_id.clone()));
        }
        let key = self.keys.load(asset_id).await.map_err(|err| match err {
            KeyStoreError::NotFound(id) => LicenseError::NotFound(id),
            other => {
                error!(asset_id = %asset_id, error = %other, "failed to load content key");
                LicenseError::Internal("key load failed".into())
            }
        })?;
        let kid = self.keys.key_id(asset_id);
        let license = ClearKeyLicense {
            keys: vec![ClearKeyEntry {
                kty: KEY_TYPE.to_string(),
                kid: URL_SAFE_NO_PAD.encode(kid.as_bytes()),
                k: URL_SAFE_NO_PAD.encode(key.as_bytes()),
            }],
            license_type: LICENSE_TYPE.to_string(),
        };
        info!(asset_id = %asset_id, subject_id = %token.claims.subject_id, key_id = %kid.to_hex(), "license issued");
        Ok(license)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeysSection;
    use crate::token::AccessClaims;
    use tempfile::TempDir;

    fn service(root: &std::path::Path) -> (LicenseService, ContentKeyStore) {
        let keys = ContentKeyStore::new(
            &KeysSection {
                master_secret: "master".into(),
                salt_prefix: "reelvault:".into(),
                rounds: 1_000,
                license_base_url: "http://127.0.0.1:8080".into(),
            },
            root,
        );
        (LicenseService::new(keys.clone()), keys)
    }

    fn token_for(asset: &str) -> VerifiedToken {
        VerifiedToken {
            claims: AccessClaims {
                asset_id: asset.into(),
                subject_id: "viewer".into(),
                iat: 0,
                exp: i64::MAX,
                iss: "reelvault".into(),
                aud: "reelvault-player".into(),
                ip: None,
                user_agent: None,
            },
            mismatches: Vec::new(),
        }
    }

    #[tokio::test]
    async fn license_carries_stable_kid_and_raw_key() {
        let dir = TempDir::new().unwrap();
        let (service, keys) = service(dir.path());
        let asset = AssetId::parse("movie").unwrap();
        let key = keys.provision(&asset).await.unwrap();

        let first = service.issue(&asset, &token_for("movie")).await.unwrap();
        let second = service.issue(&asset, &token_for("movie")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.license_type, "temporary");
        let entry = &first.keys[0];
        assert_eq!(entry.kty, "oct");
        assert_eq!(URL_SAFE_NO_PAD.decode(&entry.k).unwrap(), key.as_bytes());
        assert_eq!(
            URL_SAFE_NO_PAD.decode(&entry.kid).unwrap(),
            keys.key_id(&asset).as_bytes()
        );
        assert!(!entry.k.contains('=') && !entry.k.contains('+') && !entry.k.contains('/'));
    }

    #[tokio::test]
    async fn missing_key_and_wrong_scope_share_client_message() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(dir.path());
        let asset = AssetId::parse("movie").unwrap();

        let missing = service.issue(&asset, &token_for("movie")).await.unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        let scoped = service.issue(&asset, &token_for("other")).await.unwrap_err();
        assert_eq!(scoped.kind(), ErrorKind::Unauthorized);
        assert_eq!(missing.client_message(), scoped.client_message());
    }

    #[tokio::test]
    async fn corrupt_key_is_generic_internal_error() {
        let dir = TempDir::new().unwrap();
        let (service, keys) = service(dir.path());
        let asset = AssetId::parse("movie").unwrap();
        let path = keys.workspace(&asset).key_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"short").unwrap();

        let err = service.issue(&asset, &token_for("movie")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.client_message(), "license access denied");
    }
}
