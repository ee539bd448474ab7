pub mod client;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

use reelvault_core::{
    init_logging, load_reelvault_config, AdmissionStatus, AppState, Asset, AssetId,
    AssetIdError, CipherError, ConfigError, ContentKeyStore, EncodeRequest, KeyStoreError,
    LoggingError, PackageOutcome, ReelvaultConfig, StreamCipher,
};

use client::ControlClient;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("logging error: {0}")]
    Logging(#[from] LoggingError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },
    #[error("no admin token configured; set server.admin_token or REELVAULT_ADMIN_TOKEN")]
    AdminTokenMissing,
    #[error("key store error: {0}")]
    Keys(#[from] KeyStoreError),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("invalid asset id: {0}")]
    AssetId(#[from] AssetIdError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "reelvault packaging and delivery control", long_about = None)]
pub struct Cli {
    /// Path to reelvault.toml
    #[arg(long, default_value = "configs/reelvault.toml")]
    pub config: PathBuf,
    /// Base URL of the running server; defaults to the configured bind address
    #[arg(long)]
    pub server: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the delivery server, which also runs all packaging jobs
    Serve,
    /// Have the server copy a source file into an asset workspace
    Ingest(IngestArgs),
    /// Submit an ingested asset for packaging and wait for the result
    Package(PackageArgs),
    /// Show asset records and the server's admission queue
    Status(StatusArgs),
    /// Delete an asset and its workspace
    Purge(AssetArgs),
    /// Show the key id of an asset and whether its key is stored
    Key(AssetArgs),
    /// Encrypt a file with the at-rest cipher
    EncryptFile(FileArgs),
    /// Decrypt a file produced by encrypt-file
    DecryptFile(FileArgs),
    /// Print shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct AssetArgs {
    #[arg(long)]
    pub asset_id: String,
}

#[derive(Args, Debug)]
pub struct IngestArgs {
    #[arg(long)]
    pub asset_id: String,
    /// Source media file
    #[arg(long)]
    pub source: PathBuf,
}

#[derive(Args, Debug, Default)]
pub struct PackageArgs {
    #[arg(long)]
    pub asset_id: String,
    #[arg(long)]
    pub codec: Option<String>,
    #[arg(long)]
    pub preset: Option<String>,
    #[arg(long)]
    pub quality_metric: Option<String>,
    #[arg(long)]
    pub quality: Option<u32>,
    /// Segment length in seconds
    #[arg(long)]
    pub segment_duration: Option<u32>,
    /// Extra encoder flag as name=value; replaces the configured flags
    #[arg(long = "flag", value_parser = parse_flag)]
    pub flags: Vec<(String, String)>,
    /// Re-encode even when the package is already ready
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[arg(long)]
    pub asset_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct FileArgs {
    pub src: PathBuf,
    pub dst: PathBuf,
    /// Nonce label; package files use `<asset_id>/<path inside package>`
    #[arg(long)]
    pub scope: Option<String>,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

fn parse_flag(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() && !value.is_empty() => {
            Ok((name.to_string(), value.to_string()))
        }
        _ => Err(format!("expected name=value, got {raw:?}")),
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        clap_complete::generate(args.shell, &mut command, name, &mut io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli.config, cli.server.as_deref())?;
    init_logging(&context.config.logging)?;

    match &cli.command {
        Commands::Serve => context.serve().await?,
        Commands::Ingest(args) => {
            let asset = context.ingest(args).await?;
            render(&AssetView(asset), cli.format)?;
        }
        Commands::Package(args) => {
            let outcome = context.package(args).await?;
            render(&outcome, cli.format)?;
        }
        Commands::Status(args) => {
            let report = context.status(args).await?;
            render(&report, cli.format)?;
        }
        Commands::Purge(args) => {
            let purged = context.purge(args).await?;
            render(&purged, cli.format)?;
        }
        Commands::Key(args) => {
            let report = context.key(args).await?;
            render(&report, cli.format)?;
        }
        Commands::EncryptFile(args) => {
            let report = context.transform_file(args, CipherDirection::Encrypt).await?;
            render(&report, cli.format)?;
        }
        Commands::DecryptFile(args) => {
            let report = context.transform_file(args, CipherDirection::Decrypt).await?;
            render(&report, cli.format)?;
        }
        Commands::Completions(_) => {}
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: ReelvaultConfig,
    client: ControlClient,
}

impl AppContext {
    fn new(config_path: &Path, server: Option<&str>) -> Result<Self> {
        let config = load_reelvault_config(config_path)?;
        let base = server
            .map(str::to_string)
            .unwrap_or_else(|| config.server.control_url());
        let client = ControlClient::new(base, config.server.admin_token.clone())?;
        Ok(Self { config, client })
    }

    async fn serve(&self) -> Result<()> {
        if self.config.server.admin_token.is_none() {
            warn!("no admin token configured; ingest and package commands cannot reach this server");
        }
        let state = AppState::from_config(&self.config);
        let listener = TcpListener::bind(self.config.server.bind).await?;
        info!(
            workspace_root = %self.config.paths.workspace_root.display(),
            encrypt_segments = self.config.cipher.encrypt_segments,
            "starting delivery server"
        );
        reelvault_core::serve(listener, state).await?;
        Ok(())
    }

    async fn ingest(&self, args: &IngestArgs) -> Result<Asset> {
        let asset_id = AssetId::parse(args.asset_id.as_str())?;
        let source = tokio::fs::canonicalize(&args.source).await?;
        self.client.ingest(&asset_id, &source).await
    }

    fn encode_request(&self, args: &PackageArgs) -> EncodeRequest {
        let mut request = EncodeRequest::from(&self.config.encoder);
        if let Some(codec) = &args.codec {
            request.codec = codec.clone();
        }
        if let Some(preset) = &args.preset {
            request.preset = preset.clone();
        }
        if let Some(metric) = &args.quality_metric {
            request.quality_metric = metric.clone();
        }
        if let Some(quality) = args.quality {
            request.quality = quality;
        }
        if let Some(duration) = args.segment_duration {
            request.segment_duration = duration;
        }
        if !args.flags.is_empty() {
            request.extra_flags = args.flags.clone();
        }
        request
    }

    async fn package(&self, args: &PackageArgs) -> Result<PackageOutcome> {
        let asset_id = AssetId::parse(args.asset_id.as_str())?;
        let request = self.encode_request(args);
        self.client.package(&asset_id, &request, args.force).await
    }

    async fn status(&self, args: &StatusArgs) -> Result<StatusReport> {
        let assets = match &args.asset_id {
            Some(raw) => {
                let asset_id = AssetId::parse(raw.as_str())?;
                vec![self.client.asset(&asset_id).await?]
            }
            None => self.client.assets().await?,
        };
        Ok(StatusReport {
            server: self.client.base().to_string(),
            queue: self.client.queue().await?,
            assets,
        })
    }

    async fn purge(&self, args: &AssetArgs) -> Result<PurgeReport> {
        let asset_id = AssetId::parse(args.asset_id.as_str())?;
        self.client.purge(&asset_id).await?;
        Ok(PurgeReport {
            asset_id: asset_id.to_string(),
        })
    }

    async fn key(&self, args: &AssetArgs) -> Result<KeyReport> {
        let asset_id = AssetId::parse(args.asset_id.as_str())?;
        let keys = ContentKeyStore::new(&self.config.keys, &self.config.paths.workspace_root);
        Ok(KeyReport {
            asset_id: asset_id.to_string(),
            key_id: keys.key_id(&asset_id).to_hex(),
            stored: keys.exists(&asset_id).await,
            license_url: keys.license_url(&asset_id)?.to_string(),
        })
    }

    async fn transform_file(
        &self,
        args: &FileArgs,
        direction: CipherDirection,
    ) -> Result<FileReport> {
        let mut cipher = StreamCipher::from_section(&self.config.cipher);
        if let Some(label) = &args.scope {
            cipher = cipher.scoped(label);
        }
        let bytes = match direction {
            CipherDirection::Encrypt => cipher.encrypt_file(&args.src, &args.dst).await?,
            CipherDirection::Decrypt => cipher.decrypt_file(&args.src, &args.dst).await?,
        };
        Ok(FileReport {
            direction,
            src: args.src.clone(),
            dst: args.dst.clone(),
            bytes,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
struct AssetView(Asset);

impl DisplayFallback for AssetView {
    fn display(&self) -> String {
        asset_line(&self.0)
    }
}

fn asset_line(asset: &Asset) -> String {
    let duration = asset
        .duration_seconds
        .map(|v| format!("{v:.1}s"))
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "{} | state={} | dur={} | updated={}",
        asset.id,
        asset.state,
        duration,
        asset.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(reason) = &asset.failure_reason {
        line.push_str(&format!(" | last_error={reason}"));
    }
    line
}

impl DisplayFallback for PackageOutcome {
    fn display(&self) -> String {
        match self {
            PackageOutcome::Ready(asset) => format!("packaged: {}", asset_line(asset)),
            PackageOutcome::AlreadyReady(asset) => {
                format!("already ready (use --force to re-encode): {}", asset_line(asset))
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusReport {
    server: String,
    queue: AdmissionStatus,
    assets: Vec<Asset>,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Server: {}", self.server),
            format!(
                "Queue: {}/{} running, {} waiting{}",
                self.queue.running,
                self.queue.max_concurrent,
                self.queue.waiting,
                if self.queue.queue_full { " (full)" } else { "" }
            ),
        ];
        if self.assets.is_empty() {
            lines.push("No assets".to_string());
        } else {
            lines.push("Assets:".to_string());
            for asset in &self.assets {
                lines.push(format!("  - {}", asset_line(asset)));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct PurgeReport {
    asset_id: String,
}

impl DisplayFallback for PurgeReport {
    fn display(&self) -> String {
        format!("purged {}", self.asset_id)
    }
}

#[derive(Debug, Serialize)]
struct KeyReport {
    asset_id: String,
    key_id: String,
    stored: bool,
    license_url: String,
}

impl DisplayFallback for KeyReport {
    fn display(&self) -> String {
        format!(
            "{} | key_id={} | stored={} | license={}",
            self.asset_id, self.key_id, self.stored, self.license_url
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CipherDirection {
    Encrypt,
    Decrypt,
}

impl fmt::Display for CipherDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherDirection::Encrypt => f.write_str("encrypted"),
            CipherDirection::Decrypt => f.write_str("decrypted"),
        }
    }
}

#[derive(Debug, Serialize)]
struct FileReport {
    direction: CipherDirection,
    src: PathBuf,
    dst: PathBuf,
    bytes: u64,
}

impl DisplayFallback for FileReport {
    fn display(&self) -> String {
        format!(
            "{} {} -> {} ({} bytes)",
            self.direction,
            self.src.display(),
            self.dst.display(),
            self.bytes
        )
    }
}
