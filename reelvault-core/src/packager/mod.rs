pub mod encoder;
pub mod error;
pub mod process;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::asset::{Asset, AssetId, AssetState, AssetWorkspace, PackagingFormat};
use crate::cipher::{file_scope, StreamCipher};
use crate::config::ReelvaultConfig;
use crate::keys::ContentKeyStore;
use crate::queue::{AdmissionQueue, AdmissionStatus, JobId, ProcessingJob};

pub use encoder::{
    EncodeRequest, EncoderFamily, EncoderInvocation, EncoderSettings, ExtraFlag, QualityMetric,
    VideoCodec,
};
pub use error::{PackagerError, PackagerResult};
pub use process::{ProcessArena, ProcessOutcome};

pub const STREAMS: [&str; 2] = ["video", "audio"];

const TEARDOWN_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "asset", rename_all = "snake_case")]
pub enum PackageOutcome {
    Ready(Asset),
    AlreadyReady(Asset),
}

impl PackageOutcome {
    pub fn asset(&self) -> &Asset {
        match self {
            PackageOutcome::Ready(asset) | PackageOutcome::AlreadyReady(asset) => asset,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub workspace_root: PathBuf,
    pub program: PathBuf,
    pub kill_grace: Duration,
    pub encrypt_segments: bool,
}

impl From<&ReelvaultConfig> for OrchestratorSettings {
    fn from(config: &ReelvaultConfig) -> Self {
        Self {
            workspace_root: config.paths.workspace_root.clone(),
            program: config.encoder.program.clone(),
            kill_grace: config.encoder.kill_grace(),
            encrypt_segments: config.cipher.encrypt_segments,
        }
    }
}

struct Inner {
    settings: OrchestratorSettings,
    keys: ContentKeyStore,
    cipher: StreamCipher,
    queue: AdmissionQueue,
    arena: ProcessArena,
    assets: Mutex<HashMap<AssetId, Asset>>,
}

/// Drives assets from ingestion to a served package. The only writer of an
/// asset's workspace.
#[derive(Clone)]
pub struct PackageOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PackageOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageOrchestrator")
            .field("settings", &self.inner.settings)
            .field("queue", &self.inner.queue)
            .finish()
    }
}

impl PackageOrchestrator {
    pub fn new(config: &ReelvaultConfig, queue: AdmissionQueue) -> Self {
        Self::with_parts(
            OrchestratorSettings::from(config),
            ContentKeyStore::new(&config.keys, &config.paths.workspace_root),
            StreamCipher::from_section(&config.cipher),
            queue,
        )
    }

    pub fn with_parts(
        settings: OrchestratorSettings,
        keys: ContentKeyStore,
        cipher: StreamCipher,
        queue: AdmissionQueue,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                keys,
                cipher,
                queue,
                arena: ProcessArena::new(),
                assets: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn keys(&self) -> &ContentKeyStore {
        &self.inner.keys
    }

    pub fn queue_status(&self) -> AdmissionStatus {
        self.inner.queue.status()
    }

    pub fn arena(&self) -> &ProcessArena {
        &self.inner.arena
    }

    fn workspace(&self, asset_id: &AssetId) -> AssetWorkspace {
        AssetWorkspace::new(&self.inner.settings.workspace_root, asset_id)
    }

    /// Copies `source` into the asset's workspace and records it as pending.
    pub async fn ingest(&self, asset_id: &AssetId, source: &Path) -> PackagerResult<Asset> {
        let file_name = source
            .file_name()
            .ok_or_else(|| PackagerError::Validation("source path has no file name".into()))?;
        let meta = fs::metadata(source).await.map_err(|source_err| PackagerError::Io {
            source: source_err,
            path: source.to_path_buf(),
        })?;
        if !meta.is_file() {
            return Err(PackagerError::Validation("source is not a regular file".into()));
        }

        let existing = match self.asset(asset_id).await {
            Ok(asset) => Some(asset),
            Err(PackagerError::AssetNotFound(_)) => None,
            Err(err) => return Err(err),
        };
        if let Some(asset) = &existing {
            if asset.state.is_in_flight() {
                return Err(PackagerError::Conflict {
                    asset_id: asset_id.clone(),
                    state: asset.state.to_string(),
                });
            }
        }

        let workspace = self.workspace(asset_id);
        if let Some(previous) = existing.as_ref().and_then(|a| a.source_path.clone()) {
            remove_file_logged(asset_id, &previous).await;
        }
        create_dir(&workspace.source_dir).await?;
        let target = workspace.source_dir.join(file_name);
        fs::copy(source, &target)
            .await
            .map_err(|source_err| PackagerError::Io {
                source: source_err,
                path: target.clone(),
            })?;

        let asset = match existing {
            Some(mut asset) => {
                asset.source_path = Some(target);
                asset.updated_at = chrono::Utc::now();
                asset
            }
            None => Asset::new(asset_id.clone(), target, workspace.root.clone()),
        };
        self.save(&asset).await?;
        info!(asset_id = %asset_id, bytes = meta.len(), "asset ingested");
        Ok(asset)
    }

    /// Current record, from memory or the workspace's `asset.json`.
    pub async fn asset(&self, asset_id: &AssetId) -> PackagerResult<Asset> {
        if let Some(asset) = self.inner.assets.lock().get(asset_id) {
            return Ok(asset.clone());
        }
        let path = self.workspace(asset_id).record_path();
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PackagerError::AssetNotFound(asset_id.clone()))
            }
            Err(source) => return Err(PackagerError::Io { source, path }),
        };
        let mut asset: Asset = serde_json::from_slice(&raw)?;

        // Jobs of this process are always in memory, so an in-flight record
        // on disk belongs to a process that died or dropped the job.
        let interrupted = asset.state.is_in_flight();
        let workspace = self.workspace(asset_id);
        if interrupted {
            restore_retired_package(&workspace).await;
            let had_package = has_manifest(&workspace).await;
            warn!(
                asset_id = %asset_id,
                state = %asset.state,
                kept_previous = had_package,
                "recovering interrupted packaging"
            );
            asset.transition(if had_package {
                AssetState::Ready
            } else {
                AssetState::Failed
            });
            asset.failure_reason = Some(PackagerError::Interrupted.to_string());
        }

        let (asset, inserted) = match self.inner.assets.lock().entry(asset_id.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => (entry.insert(asset).clone(), true),
        };
        if interrupted && inserted {
            remove_scratch_dirs(asset_id, &workspace).await;
            self.inner.keys.cleanup(asset_id).await;
            self.persist(&asset).await?;
        }
        Ok(asset)
    }

    pub async fn list(&self) -> PackagerResult<Vec<Asset>> {
        let root = &self.inner.settings.workspace_root;
        let mut entries = match fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PackagerError::Io {
                    source,
                    path: root.clone(),
                })
            }
        };
        let mut assets = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| PackagerError::Io {
            source,
            path: root.clone(),
        })? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(asset_id) = AssetId::parse(name) else {
                continue;
            };
            match self.asset(&asset_id).await {
                Ok(asset) => assets.push(asset),
                Err(PackagerError::AssetNotFound(_)) => {}
                Err(err) => warn!(asset_id = %asset_id, error = %err, "skipping unreadable asset record"),
            }
        }
        assets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(assets)
    }

    /// Removes the asset and its whole workspace.
    pub async fn purge(&self, asset_id: &AssetId) -> PackagerResult<()> {
        let asset = self.asset(asset_id).await?;
        {
            let mut assets = self.inner.assets.lock();
            if let Some(current) = assets.get(asset_id) {
                if current.state.is_in_flight() {
                    return Err(PackagerError::Conflict {
                        asset_id: asset_id.clone(),
                        state: current.state.to_string(),
                    });
                }
            }
            assets.remove(asset_id);
        }
        fs::remove_dir_all(&asset.workspace)
            .await
            .map_err(|source| PackagerError::Io {
                source,
                path: asset.workspace.clone(),
            })?;
        info!(asset_id = %asset_id, "asset purged");
        Ok(())
    }

    /// Packages the asset through the admission queue and waits for a
    /// terminal state.
    pub async fn package(
        &self,
        asset_id: &AssetId,
        request: &EncodeRequest,
        force: bool,
    ) -> PackagerResult<PackageOutcome> {
        let settings = EncoderSettings::try_from(request)?;
        self.asset(asset_id).await?;

        let claimed = {
            let mut assets = self.inner.assets.lock();
            let asset = assets
                .get_mut(asset_id)
                .ok_or_else(|| PackagerError::AssetNotFound(asset_id.clone()))?;
            if asset.state.is_in_flight() {
                return Err(PackagerError::Conflict {
                    asset_id: asset_id.clone(),
                    state: asset.state.to_string(),
                });
            }
            if asset.state == AssetState::Ready && !force {
                info!(asset_id = %asset_id, "package already ready; nothing to do");
                return Ok(PackageOutcome::AlreadyReady(asset.clone()));
            }
            asset.transition(AssetState::Queued);
            asset.clone()
        };

        let job_id = JobId::new();
        let mut guard = PackagingGuard {
            orchestrator: self.clone(),
            asset_id: asset_id.clone(),
            job_id,
            armed: true,
        };
        let result = self.run_packaging(&claimed, &settings, job_id).await;
        let result = match result {
            Ok(asset) => Ok(PackageOutcome::Ready(asset)),
            Err(err) => {
                self.record_failure(asset_id, &err).await;
                Err(err)
            }
        };
        guard.armed = false;
        result
    }

    async fn run_packaging(
        &self,
        asset: &Asset,
        settings: &EncoderSettings,
        job_id: JobId,
    ) -> PackagerResult<Asset> {
        let asset_id = asset.id.clone();
        let source = asset
            .source_path
            .clone()
            .ok_or_else(|| PackagerError::Validation("asset has no source to package".into()))?;
        if fs::metadata(&source).await.is_err() {
            return Err(PackagerError::Validation("asset source is missing; ingest it again".into()));
        }
        self.save(asset).await?;

        let keys = &self.inner.keys;
        keys.provision(&asset_id).await?;
        let workspace = self.workspace(&asset_id);
        let staging = workspace.staging_dir(&job_id.simple());

        let outcome = async {
            let key_reference = keys.create_key_reference_file(&asset_id).await?;
            create_dir(&staging).await?;
            let invocation = EncoderInvocation::build(
                &self.inner.settings.program,
                settings,
                &source,
                &staging,
                &key_reference,
                &keys.key_id(&asset_id),
            );
            self.encode(job_id, &asset_id, invocation).await?;
            let duration = validate_output(&staging).await?;
            if self.inner.settings.encrypt_segments {
                self.encrypt_segments(&asset_id, &staging).await?;
            }
            swap_package(&workspace, &staging, &job_id.simple()).await?;
            Ok::<_, PackagerError>(duration)
        }
        .await;

        keys.cleanup(&asset_id).await;
        self.inner.arena.release(job_id);

        let duration = match outcome {
            Ok(duration) => duration,
            Err(err) => {
                remove_dir_logged(&asset_id, &staging).await;
                return Err(err);
            }
        };

        remove_file_logged(&asset_id, &source).await;
        let ready = self
            .update(&asset_id, |asset| {
                asset.transition(AssetState::Ready);
                asset.format = PackagingFormat::SegmentedManifest;
                asset.duration_seconds = duration;
                asset.source_path = None;
                asset.failure_reason = None;
            })
            .await?;
        info!(asset_id = %asset_id, job_id = %job_id, duration_seconds = ?duration, "package ready");
        Ok(ready)
    }

    async fn encode(
        &self,
        job_id: JobId,
        asset_id: &AssetId,
        invocation: EncoderInvocation,
    ) -> PackagerResult<()> {
        let arena = self.inner.arena.clone();
        arena.register(job_id);
        let log_path = self.workspace(asset_id).encoder_log_path();
        let kill_grace = self.inner.settings.kill_grace;
        let runner = self.clone();
        let job_asset = asset_id.clone();
        let hook_arena = arena.clone();

        let job = ProcessingJob::with_id(job_id, format!("package {asset_id}"), move || async move {
            runner
                .update(&job_asset, |asset| asset.transition(AssetState::Packaging))
                .await?;
            let outcome = runner
                .inner
                .arena
                .run(job_id, &invocation, &log_path, kill_grace)
                .await?;
            if outcome.terminated {
                return Err(PackagerError::Terminated);
            }
            if !outcome.status.success() {
                error!(
                    asset_id = %job_asset,
                    job_id = %job_id,
                    status = ?outcome.status.code(),
                    stderr = %outcome.stderr_tail.join("\n"),
                    "encoder failed"
                );
                return Err(PackagerError::EncoderFailed {
                    status: outcome.status.code(),
                });
            }
            Ok(())
        })
        .on_timeout(move || {
            hook_arena.terminate(job_id);
        });

        let result = self.inner.queue.submit(job).await.map_err(PackagerError::from);
        if matches!(result, Err(PackagerError::Timeout)) {
            let limit = kill_grace + TEARDOWN_MARGIN;
            if !arena.wait_stopped(job_id, limit).await {
                warn!(asset_id = %asset_id, job_id = %job_id, "encoder outlived teardown window");
            }
        }
        result
    }

    async fn encrypt_segments(&self, asset_id: &AssetId, staging: &Path) -> PackagerResult<()> {
        let mut count = 0usize;
        for path in segment_files(staging) {
            let relative = path
                .strip_prefix(staging)
                .map(|rel| rel.to_string_lossy().replace('\\', "/"))
                .map_err(|_| PackagerError::MissingOutput("segment outside staging".into()))?;
            self.inner
                .cipher
                .scoped(&file_scope(asset_id, &relative))
                .encrypt_file(&path, &path)
                .await?;
            count += 1;
        }
        debug!(staging = %staging.display(), segments = count, "segments encrypted at rest");
        Ok(())
    }

    /// Tears down a job whose `package` future was dropped: stops the
    /// encoder, clears scratch output and records the interruption.
    async fn abandon(&self, asset_id: AssetId, job_id: JobId) {
        let limit = self.inner.settings.kill_grace + TEARDOWN_MARGIN;
        if !self.inner.arena.wait_stopped(job_id, limit).await {
            warn!(asset_id = %asset_id, job_id = %job_id, "encoder outlived teardown window");
        }
        self.inner.arena.release(job_id);
        let workspace = self.workspace(&asset_id);
        remove_dir_logged(&asset_id, &workspace.staging_dir(&job_id.simple())).await;
        restore_retired_package(&workspace).await;
        self.inner.keys.cleanup(&asset_id).await;
        self.record_failure(&asset_id, &PackagerError::Interrupted).await;
    }

    async fn record_failure(&self, asset_id: &AssetId, err: &PackagerError) {
        let had_package = has_manifest(&self.workspace(asset_id)).await;
        let reason = err.to_string();
        let result = self
            .update(asset_id, |asset| {
                asset.transition(if had_package {
                    AssetState::Ready
                } else {
                    AssetState::Failed
                });
                asset.failure_reason = Some(reason);
            })
            .await;
        match err {
            PackagerError::Timeout => {
                warn!(asset_id = %asset_id, "packaging timed out");
            }
            PackagerError::QueueFull => {
                warn!(asset_id = %asset_id, "packaging rejected: admission queue full");
            }
            other => {
                warn!(asset_id = %asset_id, error = %other, kept_previous = had_package, "packaging failed");
            }
        }
        if let Err(save_err) = result {
            error!(asset_id = %asset_id, error = %save_err, "failed to persist failure state");
        }
    }

    async fn update<F>(&self, asset_id: &AssetId, apply: F) -> PackagerResult<Asset>
    where
        F: FnOnce(&mut Asset),
    {
        let updated = {
            let mut assets = self.inner.assets.lock();
            let asset = assets
                .get_mut(asset_id)
                .ok_or_else(|| PackagerError::AssetNotFound(asset_id.clone()))?;
            apply(asset);
            asset.clone()
        };
        self.persist(&updated).await?;
        Ok(updated)
    }

    async fn save(&self, asset: &Asset) -> PackagerResult<()> {
        self.inner
            .assets
            .lock()
            .insert(asset.id.clone(), asset.clone());
        self.persist(asset).await
    }

    async fn persist(&self, asset: &Asset) -> PackagerResult<()> {
        let workspace = self.workspace(&asset.id);
        create_dir(&workspace.root).await?;
        let path = workspace.record_path();
        let partial = path.with_extension("json.partial");
        let body = serde_json::to_vec_pretty(asset)?;
        fs::write(&partial, body)
            .await
            .map_err(|source| PackagerError::Io {
                source,
                path: partial.clone(),
            })?;
        fs::rename(&partial, &path)
            .await
            .map_err(|source| PackagerError::Io { source, path })
    }
}

/// Armed while a `package` call is in progress. Dropping it armed means the
/// caller went away mid-job: the encoder is signalled at once and the rest
/// of the teardown runs on a spawned task.
struct PackagingGuard {
    orchestrator: PackageOrchestrator,
    asset_id: AssetId,
    job_id: JobId,
    armed: bool,
}

impl Drop for PackagingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.orchestrator.inner.arena.terminate(self.job_id);
        warn!(asset_id = %self.asset_id, job_id = %self.job_id, "packaging dropped before completion");
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let orchestrator = self.orchestrator.clone();
        let asset_id = self.asset_id.clone();
        let job_id = self.job_id;
        handle.spawn(async move { orchestrator.abandon(asset_id, job_id).await });
    }
}

async fn has_manifest(workspace: &AssetWorkspace) -> bool {
    fs::metadata(workspace.manifest_path())
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// Puts back a live package that was moved aside by an unfinished swap.
async fn restore_retired_package(workspace: &AssetWorkspace) {
    if fs::metadata(&workspace.package_dir).await.is_ok() {
        return;
    }
    let Ok(mut entries) = fs::read_dir(&workspace.root).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if !entry.file_name().to_string_lossy().starts_with(".retired-") {
            continue;
        }
        match fs::rename(entry.path(), &workspace.package_dir).await {
            Ok(()) => {
                info!(path = %workspace.package_dir.display(), "restored previous package");
                return;
            }
            Err(err) => warn!(path = %entry.path().display(), error = %err, "failed to restore previous package"),
        }
    }
}

/// Removes staging and retired directories left by an interrupted job.
async fn remove_scratch_dirs(asset_id: &AssetId, workspace: &AssetWorkspace) {
    let Ok(mut entries) = fs::read_dir(&workspace.root).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(".staging-") || name.starts_with(".retired-") {
            remove_dir_logged(asset_id, &entry.path()).await;
        }
    }
}

/// Checks the encoder left a manifest and at least one stream with an init
/// segment and a media segment. Returns the presentation duration if the
/// manifest declares one.
async fn validate_output(staging: &Path) -> PackagerResult<Option<f64>> {
    let manifest = staging.join(crate::asset::MANIFEST_NAME);
    let body = fs::read_to_string(&manifest)
        .await
        .map_err(|_| PackagerError::MissingOutput("manifest not written".into()))?;

    let mut complete_streams = 0;
    for stream in STREAMS {
        let dir = staging.join(stream);
        let mut has_init = false;
        let mut has_media = false;
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1).into_iter().flatten() {
            let name = entry.file_name().to_string_lossy();
            if !entry.file_type().is_file() {
                continue;
            }
            has_init |= name.starts_with("init.");
            has_media |= name.starts_with("segment-");
        }
        if has_init && has_media {
            complete_streams += 1;
        }
    }
    if complete_streams == 0 {
        return Err(PackagerError::MissingOutput(
            "no stream has both an init and a media segment".into(),
        ));
    }
    Ok(parse_presentation_duration(&body))
}

fn segment_files(staging: &Path) -> Vec<PathBuf> {
    STREAMS
        .iter()
        .flat_map(|stream| {
            WalkDir::new(staging.join(stream))
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .flatten()
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
        })
        .collect()
}

/// Replaces the live package with `staging` without ever mutating the old
/// package in place.
async fn swap_package(workspace: &AssetWorkspace, staging: &Path, job: &str) -> PackagerResult<()> {
    let live = &workspace.package_dir;
    let retired = workspace.retired_dir(job);
    let had_live = fs::metadata(live).await.is_ok();
    if had_live {
        fs::rename(live, &retired)
            .await
            .map_err(|source| PackagerError::Io {
                source,
                path: live.clone(),
            })?;
    }
    if let Err(source) = fs::rename(staging, live).await {
        if had_live {
            if let Err(restore) = fs::rename(&retired, live).await {
                error!(path = %live.display(), error = %restore, "failed to restore previous package");
            }
        }
        return Err(PackagerError::Io {
            source,
            path: live.clone(),
        });
    }
    if had_live {
        if let Err(err) = fs::remove_dir_all(&retired).await {
            warn!(path = %retired.display(), error = %err, "failed to remove retired package");
        }
    }
    Ok(())
}

fn duration_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r#"mediaPresentationDuration="P(?:0D)?T(?:([0-9.]+)H)?(?:([0-9.]+)M)?(?:([0-9.]+)S)?""#,
            )
            .ok()
        })
        .as_ref()
}

/// Reads `mediaPresentationDuration="PT#H#M#S"` from a DASH manifest.
pub fn parse_presentation_duration(manifest: &str) -> Option<f64> {
    let captures = duration_pattern()?.captures(manifest)?;
    let part = |index: usize| {
        captures
            .get(index)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .unwrap_or(0.0)
    };
    let total = part(1) * 3600.0 + part(2) * 60.0 + part(3);
    (total > 0.0).then_some(total)
}

async fn create_dir(path: &Path) -> PackagerResult<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|source| PackagerError::Io {
            source,
            path: path.to_path_buf(),
        })
}

async fn remove_file_logged(asset_id: &AssetId, path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(asset_id = %asset_id, path = %path.display(), "removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(asset_id = %asset_id, path = %path.display(), error = %err, "failed to remove file"),
    }
}

async fn remove_dir_logged(asset_id: &AssetId, path: &Path) {
    match fs::remove_dir_all(path).await {
        Ok(()) => debug!(asset_id = %asset_id, path = %path.display(), "partial output removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(asset_id = %asset_id, path = %path.display(), error = %err, "failed to remove partial output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn presentation_duration_is_parsed() {
        let manifest = r#"<MPD mediaPresentationDuration="PT1M4.5S" type="static">"#;
        assert_eq!(parse_presentation_duration(manifest), Some(64.5));
        let hours = r#"<MPD mediaPresentationDuration="PT1H0M0.000S">"#;
        assert_eq!(parse_presentation_duration(hours), Some(3600.0));
        assert_eq!(parse_presentation_duration("<MPD>"), None);
    }

    #[tokio::test]
    async fn output_validation_requires_manifest_and_segment_pair() {
        let dir = TempDir::new().unwrap();
        let staging = dir.path();
        assert!(matches!(
            validate_output(staging).await,
            Err(PackagerError::MissingOutput(_))
        ));

        std::fs::write(
            staging.join("manifest.mpd"),
            r#"<MPD mediaPresentationDuration="PT8S"/>"#,
        )
        .unwrap();
        std::fs::create_dir_all(staging.join("video")).unwrap();
        std::fs::write(staging.join("video/init.mp4"), b"init").unwrap();
        assert!(validate_output(staging).await.is_err());

        std::fs::write(staging.join("video/segment-0001.m4s"), b"media").unwrap();
        assert_eq!(validate_output(staging).await.unwrap(), Some(8.0));
        assert_eq!(segment_files(staging).len(), 2);
    }

    #[tokio::test]
    async fn swap_replaces_live_package_and_drops_retired() {
        let dir = TempDir::new().unwrap();
        let asset_id = AssetId::parse("swap").unwrap();
        let workspace = AssetWorkspace::new(dir.path(), &asset_id);
        std::fs::create_dir_all(&workspace.package_dir).unwrap();
        std::fs::write(workspace.package_dir.join("manifest.mpd"), b"old").unwrap();
        let staging = workspace.staging_dir("job1");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("manifest.mpd"), b"new").unwrap();

        swap_package(&workspace, &staging, "job1").await.unwrap();
        assert_eq!(std::fs::read(workspace.manifest_path()).unwrap(), b"new");
        assert!(!staging.exists());
        assert!(!workspace.retired_dir("job1").exists());
    }
}
