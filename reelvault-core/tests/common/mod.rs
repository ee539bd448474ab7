#![allow(dead_code)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use reelvault_core::config::{load_reelvault_config, ReelvaultConfig};

pub const SEGMENT_BYTES: usize = 1000;

fn fixture_path(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join(relative)
}

/// Fixture config pointed at a temp workspace, with cheap key derivation.
pub fn test_config(base: &TempDir, program: &Path) -> ReelvaultConfig {
    let mut config = load_reelvault_config(fixture_path("configs/reelvault.toml")).unwrap();
    config.paths.workspace_root = base.path().join("workspaces");
    config.keys.rounds = 1_000;
    config.encoder.program = program.to_path_buf();
    config.encoder.kill_grace_ms = 500;
    config.queue.job_timeout_ms = 10_000;
    config
}

/// Plaintext written for every segment by the fake encoder.
pub fn segment_plaintext() -> Vec<u8> {
    (0..SEGMENT_BYTES).map(|i| b'A' + (i % 26) as u8).collect()
}

#[derive(Debug, Clone, Copy)]
pub enum EncoderMode {
    /// Writes a full package and exits 0.
    Succeed,
    /// Sleeps briefly, then behaves like `Succeed`.
    Slow,
    /// Prints to stderr and exits 2.
    Fail,
    /// Exits 0 after writing only the manifest.
    Partial,
    /// Loops until interrupted; records the interrupt.
    Hang,
}

/// Writes a POSIX shell stand-in for the encoder. Every run appends a line to
/// `invocations.log` next to the script.
#[cfg(unix)]
pub fn fake_encoder(dir: &Path, mode: EncoderMode) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let mode = match mode {
        EncoderMode::Succeed => "succeed",
        EncoderMode::Slow => "slow",
        EncoderMode::Fail => "fail",
        EncoderMode::Partial => "partial",
        EncoderMode::Hang => "hang",
    };
    let script = format!(
        r#"#!/bin/sh
MODE="{mode}"
LOG_DIR="{dir}"
while [ $# -gt 0 ]; do
  case "$1" in
    --manifest) MANIFEST="$2" ;;
    --key-reference) KEYREF="$2" ;;
    --key-id) KEYID="$2" ;;
  esac
  shift 2
done
echo "run $KEYID" >> "$LOG_DIR/invocations.log"
if [ ! -f "$KEYREF" ]; then
  echo "key reference missing" >&2
  exit 7
fi
STAGING=$(dirname "$MANIFEST")
write_package() {{
  printf '<?xml version="1.0"?>\n<MPD mediaPresentationDuration="PT8.0S" type="static"></MPD>\n' > "$MANIFEST"
  for stream in video audio; do
    mkdir -p "$STAGING/$stream"
    printf 'init-%s' "$stream" > "$STAGING/$stream/init.mp4"
    for n in 0001 0002; do
      awk 'BEGIN {{ for (i = 0; i < {bytes}; i++) printf "%c", 65 + (i % 26) }}' > "$STAGING/$stream/segment-$n.m4s"
    done
  done
}}
case "$MODE" in
  succeed)
    echo "encoding done"
    write_package
    ;;
  slow)
    sleep 0.3
    write_package
    ;;
  fail)
    echo "codec exploded" >&2
    exit 2
    ;;
  partial)
    printf '<MPD/>' > "$MANIFEST"
    ;;
  hang)
    trap 'echo interrupted >> "$LOG_DIR/signals.log"; exit 130' INT
    while true; do sleep 0.05; done
    ;;
esac
exit 0
"#,
        mode = mode,
        dir = dir.display(),
        bytes = SEGMENT_BYTES,
    );
    let path = dir.join(format!("encode-{mode}.sh"));
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

pub fn invocation_count(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join("invocations.log"))
        .map(|log| log.lines().count())
        .unwrap_or(0)
}

pub fn write_source(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"not really a video").unwrap();
    path
}
