use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

pub const MASTER_SECRET_ENV: &str = "REELVAULT_MASTER_SECRET";
pub const CIPHER_SECRET_ENV: &str = "REELVAULT_CIPHER_SECRET";
pub const TOKEN_SECRET_ENV: &str = "REELVAULT_TOKEN_SECRET";
pub const ADMIN_TOKEN_ENV: &str = "REELVAULT_ADMIN_TOKEN";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReelvaultConfig {
    #[serde(default)]
    pub server: ServerSection,
    pub paths: PathsSection,
    #[serde(default)]
    pub queue: QueueSection,
    pub keys: KeysSection,
    pub cipher: CipherSection,
    pub tokens: TokensSection,
    #[serde(default)]
    pub encoder: EncoderSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ReelvaultConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, base_dir: &Path, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    /// Replaces configured secrets with values from the environment when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var(MASTER_SECRET_ENV) {
            self.keys.master_secret = value;
        }
        if let Ok(value) = std::env::var(CIPHER_SECRET_ENV) {
            self.cipher.secret = value;
        }
        if let Ok(value) = std::env::var(TOKEN_SECRET_ENV) {
            self.tokens.secret = value;
        }
        if let Ok(value) = std::env::var(ADMIN_TOKEN_ENV) {
            self.server.admin_token = Some(value);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(ConfigError::Invalid(message.to_string()));
        if self.keys.master_secret.is_empty() {
            return invalid("keys.master_secret must not be empty");
        }
        if self.cipher.secret.is_empty() {
            return invalid("cipher.secret must not be empty");
        }
        if self.tokens.secret.is_empty() {
            return invalid("tokens.secret must not be empty");
        }
        if matches!(self.server.admin_token.as_deref(), Some("")) {
            return invalid("server.admin_token must not be empty when set");
        }
        if self.keys.rounds == 0 {
            return invalid("keys.rounds must be greater than zero");
        }
        if self.queue.max_concurrent == 0 {
            return invalid("queue.max_concurrent must be greater than zero");
        }
        if self.queue.max_queue_size < self.queue.max_concurrent {
            return invalid("queue.max_queue_size must be at least queue.max_concurrent");
        }
        if self.cipher.chunk_size == 0 {
            return invalid("cipher.chunk_size must be greater than zero");
        }
        if !(1..=60).contains(&self.encoder.segment_duration) {
            return invalid("encoder.segment_duration must be within 1..=60 seconds");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    #[serde(default)]
    pub trust_forwarded_for: bool,
    #[serde(default = "default_manifest_max_age")]
    pub manifest_max_age_seconds: u64,
    /// Bearer token for `/admin`; the control routes are not mounted without it.
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl ServerSection {
    /// Base URL a local client uses to reach this server.
    pub fn control_url(&self) -> String {
        let ip = if self.bind.ip().is_unspecified() {
            match self.bind {
                SocketAddr::V4(_) => std::net::IpAddr::from([127, 0, 0, 1]),
                SocketAddr::V6(_) => std::net::IpAddr::from(std::net::Ipv6Addr::LOCALHOST),
            }
        } else {
            self.bind.ip()
        };
        format!("http://{}", SocketAddr::new(ip, self.bind.port()))
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            trust_forwarded_for: false,
            manifest_max_age_seconds: default_manifest_max_age(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub workspace_root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
}

impl QueueSection {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queue_size: default_max_queue_size(),
            job_timeout_ms: default_job_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeysSection {
    pub master_secret: String,
    #[serde(default = "default_salt_prefix")]
    pub salt_prefix: String,
    #[serde(default = "default_rounds")]
    pub rounds: u32,
    #[serde(default = "default_license_base_url")]
    pub license_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CipherSection {
    pub secret: String,
    #[serde(default = "default_true")]
    pub encrypt_segments: bool,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokensSection {
    pub secret: String,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_audience")]
    pub audience: String,
    #[serde(default = "default_leeway")]
    pub leeway_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncoderSection {
    #[serde(default = "default_encoder_program")]
    pub program: PathBuf,
    #[serde(default = "default_codec")]
    pub codec: String,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_quality_metric")]
    pub quality_metric: String,
    #[serde(default = "default_quality")]
    pub quality: u32,
    #[serde(default = "default_segment_duration")]
    pub segment_duration: u32,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    #[serde(default)]
    pub extra_flags: Vec<[String; 2]>,
}

impl EncoderSection {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl Default for EncoderSection {
    fn default() -> Self {
        Self {
            program: default_encoder_program(),
            codec: default_codec(),
            preset: default_preset(),
            quality_metric: default_quality_metric(),
            quality: default_quality(),
            segment_duration: default_segment_duration(),
            kill_grace_ms: default_kill_grace_ms(),
            extra_flags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_manifest_max_age() -> u64 {
    10
}

fn default_max_concurrent() -> usize {
    1
}

fn default_max_queue_size() -> usize {
    20
}

fn default_job_timeout_ms() -> u64 {
    600_000
}

fn default_salt_prefix() -> String {
    "reelvault:".to_string()
}

fn default_rounds() -> u32 {
    100_000
}

fn default_license_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_issuer() -> String {
    "reelvault".to_string()
}

fn default_audience() -> String {
    "reelvault-player".to_string()
}

fn default_leeway() -> u64 {
    30
}

fn default_encoder_program() -> PathBuf {
    PathBuf::from("reelvault-encode")
}

fn default_codec() -> String {
    "libx264".to_string()
}

fn default_preset() -> String {
    "medium".to_string()
}

fn default_quality_metric() -> String {
    "crf".to_string()
}

fn default_quality() -> u32 {
    23
}

fn default_segment_duration() -> u32 {
    4
}

fn default_kill_grace_ms() -> u64 {
    3_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Loads, overrides from the environment, resolves and validates the
/// configuration file.
pub fn load_reelvault_config<P: AsRef<Path>>(path: P) -> Result<ReelvaultConfig> {
    let path = path.as_ref();
    let mut config: ReelvaultConfig = load_toml(path)?;
    config.apply_env_overrides();
    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    config.paths.workspace_root = config.resolve_path(&base_dir, &config.paths.workspace_root);
    config.validate()?;
    Ok(config)
}

pub fn parse_reelvault_config(contents: &str) -> Result<ReelvaultConfig> {
    let config: ReelvaultConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
        source,
        path: PathBuf::from("<inline>"),
    })?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [paths]
        workspace_root = "/srv/reelvault"

        [keys]
        master_secret = "master"

        [cipher]
        secret = "at-rest"

        [tokens]
        secret = "tokens"
    "#;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/reelvault.toml");
        let config = load_reelvault_config(&path).expect("config should parse");
        assert_eq!(config.queue.max_concurrent, 1);
        assert_eq!(config.queue.max_queue_size, 20);
        assert_eq!(config.encoder.codec, "libx264");
        assert!(config.paths.workspace_root.is_absolute());
        assert_eq!(config.server.control_url(), "http://127.0.0.1:8080");
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_reelvault_config(MINIMAL).unwrap();
        assert_eq!(config.queue.job_timeout(), Duration::from_millis(600_000));
        assert_eq!(config.encoder.kill_grace(), Duration::from_secs(3));
        assert_eq!(config.server.bind.port(), 8080);
        assert!(config.cipher.encrypt_segments);
        assert_eq!(config.tokens.issuer, "reelvault");
    }

    #[test]
    fn rejects_queue_smaller_than_concurrency() {
        let contents = format!("{MINIMAL}\n[queue]\nmax_concurrent = 4\nmax_queue_size = 2\n");
        let err = parse_reelvault_config(&contents).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn control_url_replaces_wildcard_bind() {
        let contents = format!("[server]\nbind = \"0.0.0.0:9000\"\n{MINIMAL}");
        let config = parse_reelvault_config(&contents).unwrap();
        assert_eq!(config.server.control_url(), "http://127.0.0.1:9000");
        assert!(config.server.admin_token.is_none());
    }

    #[test]
    fn rejects_empty_secret() {
        let contents = MINIMAL.replace("\"tokens\"", "\"\"");
        assert!(parse_reelvault_config(&contents).is_err());
    }
}
