pub mod asset;
pub mod cipher;
pub mod config;
pub mod delivery;
pub mod error;
pub mod http;
pub mod keys;
pub mod license;
pub mod logging;
pub mod packager;
pub mod queue;
pub mod token;

pub use asset::{Asset, AssetId, AssetIdError, AssetState, AssetWorkspace, PackagingFormat};
pub use cipher::{file_scope, CipherError, CipherResult, CipherTransform, StreamCipher};
pub use config::{load_reelvault_config, parse_reelvault_config, ReelvaultConfig};
pub use delivery::{
    parse_range, ByteRange, DeliveryError, DeliveryResult, MissingPart, PackageServer,
    SegmentBody, SegmentKind, SegmentName, StreamKind,
};
pub use error::{ConfigError, ErrorKind, Result};
pub use http::{router, serve, ApiError, AppState};
pub use keys::{ContentKey, ContentKeyStore, KeyId, KeyStoreError, KeyStoreResult};
pub use license::{ClearKeyEntry, ClearKeyLicense, LicenseError, LicenseService};
pub use logging::{init_logging, LoggingError};
pub use packager::{
    EncodeRequest, EncoderSettings, PackageOrchestrator, PackageOutcome, PackagerError,
    PackagerResult, ProcessArena,
};
pub use queue::{
    AdmissionConfig, AdmissionQueue, AdmissionStatus, JobId, ProcessingJob, SubmitError,
};
pub use token::{AccessClaims, RequestMeta, TokenError, TokenValidator, VerifiedToken};
