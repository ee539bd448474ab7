use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::asset::{AssetId, AssetWorkspace};
use crate::cipher::{file_scope, StreamCipher};
use crate::error::ErrorKind;
use crate::keys::ContentKeyStore;

pub const MANIFEST_CONTENT_TYPE: &str = "application/dash+xml";

const SEGMENT_PATTERN: &str =
    r"^(video|audio)/(init\.([a-z0-9]{1,5})|segment-(\d{4})\.([a-z0-9]{1,5}))$";
const STREAM_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPart {
    Workspace,
    Manifest,
    Key,
}

impl fmt::Display for MissingPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MissingPart::Workspace => "workspace",
            MissingPart::Manifest => "manifest",
            MissingPart::Key => "content key",
        })
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid segment name: {0}")]
    InvalidName(&'static str),
    #[error("asset {asset_id} unavailable: {missing} missing")]
    Unavailable {
        asset_id: AssetId,
        missing: MissingPart,
    },
    #[error("segment {segment} of asset {asset_id} not found")]
    SegmentNotFound { asset_id: AssetId, segment: String },
    #[error("range not satisfiable for {size} bytes")]
    RangeNotSatisfiable { size: u64 },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl DeliveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeliveryError::InvalidName(_) | DeliveryError::RangeNotSatisfiable { .. } => {
                ErrorKind::Validation
            }
            DeliveryError::Unavailable { .. } | DeliveryError::SegmentNotFound { .. } => {
                ErrorKind::NotFound
            }
            DeliveryError::Io { .. } => ErrorKind::Internal,
        }
    }
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Init,
    Media { sequence: u16 },
}

/// A segment path that passed validation, relative to the package directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentName {
    pub stream: StreamKind,
    pub kind: SegmentKind,
    pub extension: String,
    relative: String,
}

fn segment_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(SEGMENT_PATTERN).ok()).as_ref()
}

impl SegmentName {
    /// Accepts `{stream}/init.<ext>` and `{stream}/segment-NNNN.<ext>` only.
    /// Traversal indicators are rejected before the pattern is consulted.
    pub fn parse(name: &str) -> DeliveryResult<Self> {
        if name.contains('\0') {
            return Err(DeliveryError::InvalidName("embedded nul"));
        }
        if name.contains("..") {
            return Err(DeliveryError::InvalidName("parent reference"));
        }
        if name.starts_with('/') || name.ends_with('/') {
            return Err(DeliveryError::InvalidName("leading or trailing slash"));
        }
        if name.contains('\\') {
            return Err(DeliveryError::InvalidName("backslash"));
        }
        let pattern = segment_pattern().ok_or(DeliveryError::InvalidName("pattern unavailable"))?;
        let captures = pattern
            .captures(name)
            .ok_or(DeliveryError::InvalidName("unexpected shape"))?;
        let stream = match captures.get(1).map(|m| m.as_str()) {
            Some("video") => StreamKind::Video,
            Some("audio") => StreamKind::Audio,
            _ => return Err(DeliveryError::InvalidName("unknown stream")),
        };
        let (kind, extension) = match (captures.get(3), captures.get(4), captures.get(5)) {
            (Some(ext), _, _) => (SegmentKind::Init, ext.as_str()),
            (None, Some(number), Some(ext)) => {
                let sequence = number
                    .as_str()
                    .parse()
                    .map_err(|_| DeliveryError::InvalidName("bad sequence number"))?;
                (SegmentKind::Media { sequence }, ext.as_str())
            }
            _ => return Err(DeliveryError::InvalidName("unexpected shape")),
        };
        Ok(Self {
            stream,
            kind,
            extension: extension.to_string(),
            relative: name.to_string(),
        })
    }

    pub fn from_parts(stream: &str, filename: &str) -> DeliveryResult<Self> {
        Self::parse(&format!("{stream}/{filename}"))
    }

    pub fn as_str(&self) -> &str {
        &self.relative
    }

    pub fn content_type(&self) -> &'static str {
        match (self.extension.as_str(), self.stream) {
            ("mp4" | "m4s" | "m4v" | "m4a" | "cmfv" | "cmfa", StreamKind::Video) => "video/mp4",
            ("mp4" | "m4s" | "m4v" | "m4a" | "cmfv" | "cmfa", StreamKind::Audio) => "audio/mp4",
            ("webm", StreamKind::Video) => "video/webm",
            ("webm", StreamKind::Audio) => "audio/webm",
            ("ts", _) => "video/mp2t",
            _ => "application/octet-stream",
        }
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative)
    }
}

/// Inclusive byte range within a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

/// Parses a single `bytes=` range against a resource of `size` bytes. Lists
/// of ranges, other units and out-of-bounds ranges are unsatisfiable.
pub fn parse_range(header: &str, size: u64) -> DeliveryResult<ByteRange> {
    let unsatisfiable = || DeliveryError::RangeNotSatisfiable { size };
    let bounds = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(unsatisfiable)?
        .trim();
    if bounds.contains(',') || size == 0 {
        return Err(unsatisfiable());
    }
    let (start, end) = bounds.split_once('-').ok_or_else(unsatisfiable)?;
    let (start, end) = (start.trim(), end.trim());
    let range = if start.is_empty() {
        let suffix: u64 = end.parse().map_err(|_| unsatisfiable())?;
        if suffix == 0 {
            return Err(unsatisfiable());
        }
        ByteRange {
            start: size.saturating_sub(suffix),
            end: size - 1,
        }
    } else {
        let start: u64 = start.parse().map_err(|_| unsatisfiable())?;
        let end: u64 = if end.is_empty() {
            size - 1
        } else {
            end.parse::<u64>().map_err(|_| unsatisfiable())?.min(size - 1)
        };
        ByteRange { start, end }
    };
    if range.start > range.end || range.start >= size {
        return Err(unsatisfiable());
    }
    Ok(range)
}

pub struct SegmentBody {
    pub segment: SegmentName,
    pub size: u64,
    pub range: Option<ByteRange>,
    pub body: BoxStream<'static, std::io::Result<Bytes>>,
}

impl SegmentBody {
    pub fn content_length(&self) -> u64 {
        self.range.map(|range| range.len()).unwrap_or(self.size)
    }
}

impl fmt::Debug for SegmentBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentBody")
            .field("segment", &self.segment)
            .field("size", &self.size)
            .field("range", &self.range)
            .finish()
    }
}

/// Read-only view over packaged assets.
#[derive(Debug, Clone)]
pub struct PackageServer {
    workspace_root: PathBuf,
    keys: ContentKeyStore,
    cipher: Option<StreamCipher>,
}

impl PackageServer {
    /// `cipher` is set when segments are stored encrypted at rest.
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        keys: ContentKeyStore,
        cipher: Option<StreamCipher>,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            keys,
            cipher,
        }
    }

    fn workspace(&self, asset_id: &AssetId) -> AssetWorkspace {
        AssetWorkspace::new(&self.workspace_root, asset_id)
    }

    /// Reason the asset cannot be served, if any.
    pub async fn availability(&self, asset_id: &AssetId) -> Option<MissingPart> {
        let workspace = self.workspace(asset_id);
        if !is_dir(&workspace.root).await {
            return Some(MissingPart::Workspace);
        }
        if !is_file(&workspace.manifest_path()).await {
            return Some(MissingPart::Manifest);
        }
        if !self.keys.exists(asset_id).await {
            return Some(MissingPart::Key);
        }
        None
    }

    pub async fn manifest(&self, asset_id: &AssetId) -> DeliveryResult<Bytes> {
        if let Some(missing) = self.availability(asset_id).await {
            return Err(DeliveryError::Unavailable {
                asset_id: asset_id.clone(),
                missing,
            });
        }
        let path = self.workspace(asset_id).manifest_path();
        let body = fs::read(&path)
            .await
            .map_err(|source| DeliveryError::Io { source, path })?;
        info!(asset_id = %asset_id, size = body.len(), "manifest served");
        Ok(Bytes::from(body))
    }

    /// Opens a segment for streaming, honoring an optional `Range` header.
    /// Stored ciphertext is decrypted from the range start.
    pub async fn segment(
        &self,
        asset_id: &AssetId,
        segment: SegmentName,
        range_header: Option<&str>,
    ) -> DeliveryResult<SegmentBody> {
        let path = self.workspace(asset_id).package_dir.join(segment.as_str());
        if !is_file(&path).await {
            return Err(DeliveryError::SegmentNotFound {
                asset_id: asset_id.clone(),
                segment: segment.to_string(),
            });
        }
        let io_err = |source| DeliveryError::Io {
            source,
            path: path.clone(),
        };
        let size = fs::metadata(&path).await.map_err(io_err)?.len();
        let range = range_header
            .map(|header| parse_range(header, size))
            .transpose()?;

        let mut file = fs::File::open(&path).await.map_err(io_err)?;
        let (offset, length) = match range {
            Some(range) => (range.start, range.len()),
            None => (0, size),
        };
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
        }
        let reader = file.take(length);
        let body = match &self.cipher {
            Some(cipher) => cipher
                .scoped(&file_scope(asset_id, segment.as_str()))
                .decrypt_stream(reader, offset)
                .boxed(),
            None => ReaderStream::with_capacity(reader, STREAM_CHUNK).boxed(),
        };

        match range {
            Some(range) => {
                info!(asset_id = %asset_id, segment = %segment, size, start = range.start, end = range.end, "segment range served")
            }
            None => info!(asset_id = %asset_id, segment = %segment, size, "segment served"),
        }
        Ok(SegmentBody {
            segment,
            size,
            range,
            body,
        })
    }
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

async fn is_file(path: &Path) -> bool {
    match fs::metadata(path).await {
        Ok(meta) => meta.is_file(),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "stat failed");
            false
        }
    }
}
