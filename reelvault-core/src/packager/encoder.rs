use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::EncoderSection;
use crate::keys::KeyId;

use super::error::PackagerError;

pub const MIN_SEGMENT_DURATION: u32 = 1;
pub const MAX_SEGMENT_DURATION: u32 = 60;

pub const INIT_TEMPLATE: &str = "$Stream$/init.mp4";
pub const SEGMENT_TEMPLATE: &str = "$Stream$/segment-$Number%04d$.m4s";

const X26X_PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];
const NVENC_PRESETS: &[&str] = &["p1", "p2", "p3", "p4", "p5", "p6", "p7"];
const VPX_PRESETS: &[&str] = &["good", "best", "realtime"];
const SVT_PRESETS: &[&str] = &[
    "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    Libx264,
    Libx265,
    H264Nvenc,
    HevcNvenc,
    LibvpxVp9,
    Libsvtav1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderFamily {
    X26x,
    Nvenc,
    Vpx,
    SvtAv1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityMetric {
    Crf,
    Cq,
}

impl QualityMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityMetric::Crf => "crf",
            QualityMetric::Cq => "cq",
        }
    }
}

impl VideoCodec {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "libx264" => Some(Self::Libx264),
            "libx265" => Some(Self::Libx265),
            "h264_nvenc" => Some(Self::H264Nvenc),
            "hevc_nvenc" => Some(Self::HevcNvenc),
            "libvpx-vp9" => Some(Self::LibvpxVp9),
            "libsvtav1" => Some(Self::Libsvtav1),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Libx264 => "libx264",
            Self::Libx265 => "libx265",
            Self::H264Nvenc => "h264_nvenc",
            Self::HevcNvenc => "hevc_nvenc",
            Self::LibvpxVp9 => "libvpx-vp9",
            Self::Libsvtav1 => "libsvtav1",
        }
    }

    pub fn family(&self) -> EncoderFamily {
        match self {
            Self::Libx264 | Self::Libx265 => EncoderFamily::X26x,
            Self::H264Nvenc | Self::HevcNvenc => EncoderFamily::Nvenc,
            Self::LibvpxVp9 => EncoderFamily::Vpx,
            Self::Libsvtav1 => EncoderFamily::SvtAv1,
        }
    }

    fn is_h264(&self) -> bool {
        matches!(self, Self::Libx264 | Self::H264Nvenc)
    }

    fn is_hevc(&self) -> bool {
        matches!(self, Self::Libx265 | Self::HevcNvenc)
    }
}

impl EncoderFamily {
    pub fn presets(&self) -> &'static [&'static str] {
        match self {
            EncoderFamily::X26x => X26X_PRESETS,
            EncoderFamily::Nvenc => NVENC_PRESETS,
            EncoderFamily::Vpx => VPX_PRESETS,
            EncoderFamily::SvtAv1 => SVT_PRESETS,
        }
    }

    pub fn quality_metric(&self) -> QualityMetric {
        match self {
            EncoderFamily::Nvenc => QualityMetric::Cq,
            _ => QualityMetric::Crf,
        }
    }

    pub fn quality_max(&self) -> u32 {
        match self {
            EncoderFamily::X26x | EncoderFamily::Nvenc => 51,
            EncoderFamily::Vpx | EncoderFamily::SvtAv1 => 63,
        }
    }
}

/// Additional encoder flags. Each variant carries only values from a closed
/// set, so nothing free-form reaches the process arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ExtraFlag {
    Tune(&'static str),
    Profile(&'static str),
    PixelFormat(&'static str),
    AudioBitrate(&'static str),
    AudioChannels(&'static str),
}

impl ExtraFlag {
    fn parse(codec: VideoCodec, name: &str, value: &str) -> Result<Self, PackagerError> {
        let pick = |allowed: &[&'static str]| -> Result<&'static str, PackagerError> {
            allowed
                .iter()
                .copied()
                .find(|candidate| *candidate == value)
                .ok_or_else(|| {
                    PackagerError::Validation(format!("value not allowed for flag {name}"))
                })
        };
        match name {
            "tune" if codec.family() == EncoderFamily::X26x => Ok(Self::Tune(pick(&[
                "film",
                "animation",
                "grain",
                "stillimage",
                "fastdecode",
                "zerolatency",
            ])?)),
            "profile" if codec.is_h264() => {
                Ok(Self::Profile(pick(&["baseline", "main", "high"])?))
            }
            "profile" if codec.is_hevc() => Ok(Self::Profile(pick(&["main", "main10"])?)),
            "pix-fmt" => Ok(Self::PixelFormat(pick(&["yuv420p", "yuv420p10le"])?)),
            "audio-bitrate" => Ok(Self::AudioBitrate(pick(&[
                "96k", "128k", "160k", "192k", "256k",
            ])?)),
            "audio-channels" => Ok(Self::AudioChannels(pick(&["1", "2", "6"])?)),
            _ => Err(PackagerError::Validation(format!(
                "flag {name} is not allowed for codec {}",
                codec.as_str()
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Tune(_) => "tune",
            Self::Profile(_) => "profile",
            Self::PixelFormat(_) => "pix-fmt",
            Self::AudioBitrate(_) => "audio-bitrate",
            Self::AudioChannels(_) => "audio-channels",
        }
    }

    pub fn value(&self) -> &'static str {
        match self {
            Self::Tune(v)
            | Self::Profile(v)
            | Self::PixelFormat(v)
            | Self::AudioBitrate(v)
            | Self::AudioChannels(v) => *v,
        }
    }
}

/// Untrusted encode parameters, as they arrive from a caller or config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeRequest {
    pub codec: String,
    pub preset: String,
    pub quality_metric: String,
    pub quality: u32,
    pub segment_duration: u32,
    #[serde(default)]
    pub extra_flags: Vec<(String, String)>,
}

impl From<&EncoderSection> for EncodeRequest {
    fn from(section: &EncoderSection) -> Self {
        Self {
            codec: section.codec.clone(),
            preset: section.preset.clone(),
            quality_metric: section.quality_metric.clone(),
            quality: section.quality,
            segment_duration: section.segment_duration,
            extra_flags: section
                .extra_flags
                .iter()
                .map(|[name, value]| (name.clone(), value.clone()))
                .collect(),
        }
    }
}

/// Encode parameters that passed the allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncoderSettings {
    pub codec: VideoCodec,
    pub preset: &'static str,
    pub quality_metric: QualityMetric,
    pub quality: u32,
    pub segment_duration: u32,
    pub extra_flags: Vec<ExtraFlag>,
}

impl TryFrom<&EncodeRequest> for EncoderSettings {
    type Error = PackagerError;

    fn try_from(request: &EncodeRequest) -> Result<Self, Self::Error> {
        let codec = VideoCodec::parse(&request.codec)
            .ok_or_else(|| PackagerError::Validation("codec is not allowed".into()))?;
        let family = codec.family();
        let preset = family
            .presets()
            .iter()
            .copied()
            .find(|preset| *preset == request.preset)
            .ok_or_else(|| {
                PackagerError::Validation(format!("preset not allowed for {}", codec.as_str()))
            })?;
        let metric = family.quality_metric();
        if request.quality_metric != metric.as_str() {
            return Err(PackagerError::Validation(format!(
                "quality metric for {} must be {}",
                codec.as_str(),
                metric.as_str()
            )));
        }
        if request.quality > family.quality_max() {
            return Err(PackagerError::Validation(format!(
                "quality must be within 0..={}",
                family.quality_max()
            )));
        }
        if !(MIN_SEGMENT_DURATION..=MAX_SEGMENT_DURATION).contains(&request.segment_duration) {
            return Err(PackagerError::Validation(format!(
                "segment duration must be within {MIN_SEGMENT_DURATION}..={MAX_SEGMENT_DURATION} seconds"
            )));
        }
        let mut extra_flags: Vec<ExtraFlag> = Vec::with_capacity(request.extra_flags.len());
        for (name, value) in &request.extra_flags {
            let flag = ExtraFlag::parse(codec, name, value)?;
            if extra_flags.iter().any(|seen| seen.name() == flag.name()) {
                return Err(PackagerError::Validation(format!("flag {name} given twice")));
            }
            extra_flags.push(flag);
        }
        Ok(Self {
            codec,
            preset,
            quality_metric: metric,
            quality: request.quality,
            segment_duration: request.segment_duration,
            extra_flags,
        })
    }
}

/// Fully resolved command line for one encoder run.
#[derive(Clone)]
pub struct EncoderInvocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub manifest: PathBuf,
}

impl fmt::Debug for EncoderInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderInvocation")
            .field("program", &self.program)
            .field("args", &self.args.len())
            .field("manifest", &self.manifest)
            .finish()
    }
}

impl EncoderInvocation {
    pub fn build(
        program: &Path,
        settings: &EncoderSettings,
        source: &Path,
        staging: &Path,
        key_reference: &Path,
        key_id: &KeyId,
    ) -> Self {
        let manifest = staging.join(crate::asset::MANIFEST_NAME);
        let mut args: Vec<OsString> = Vec::new();
        let mut push = |flag: &str, value: OsString| {
            args.push(OsString::from(flag));
            args.push(value);
        };
        push("--input", source.as_os_str().to_os_string());
        push("--manifest", manifest.as_os_str().to_os_string());
        push("--init-template", staging.join(INIT_TEMPLATE).into_os_string());
        push(
            "--segment-template",
            staging.join(SEGMENT_TEMPLATE).into_os_string(),
        );
        push("--key-reference", key_reference.as_os_str().to_os_string());
        push("--key-id", key_id.to_hex().into());
        push("--codec", settings.codec.as_str().into());
        push("--preset", settings.preset.into());
        push(
            &format!("--{}", settings.quality_metric.as_str()),
            settings.quality.to_string().into(),
        );
        push(
            "--segment-duration",
            settings.segment_duration.to_string().into(),
        );
        for flag in &settings.extra_flags {
            push(&format!("--{}", flag.name()), flag.value().into());
        }
        Self {
            program: program.to_path_buf(),
            args,
            manifest,
        }
    }

    /// Rendering for logs; excludes nothing secret because no argument is.
    pub fn display_command(&self) -> String {
        let mut rendered = self.program.display().to_string();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&arg.to_string_lossy());
        }
        rendered
    }
}
