use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use aes::Aes128;
use bytes::{Bytes, BytesMut};
use ctr::cipher::{KeyIvInit, StreamCipher as _, StreamCipherSeek};
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::asset::AssetId;
use crate::config::CipherSection;
use crate::error::ErrorKind;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

const KEY_DOMAIN: &[u8] = b"reelvault/at-rest/key";
const IV_DOMAIN: &[u8] = b"reelvault/at-rest/iv";
const SCOPE_DOMAIN: &[u8] = b"reelvault/at-rest/scope";
const PARTIAL_SUFFIX: &str = "partial";

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("io error at {path}: {source}")]
    Io {
        source: io::Error,
        path: PathBuf,
    },
}

impl CipherError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

pub type CipherResult<T> = Result<T, CipherError>;

/// Offset-addressable keystream transform. Encryption and decryption are the
/// same operation; the two constructors exist to keep call sites readable.
pub struct CipherTransform {
    inner: Aes128Ctr,
    position: u64,
}

impl CipherTransform {
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.inner.apply_keystream(buf);
        self.position += buf.len() as u64;
    }

    pub fn apply_bytes(&mut self, chunk: Bytes) -> Bytes {
        let mut owned = BytesMut::from(chunk.as_ref());
        self.apply(&mut owned);
        owned.freeze()
    }

    /// Absolute byte position of the next byte this transform will process.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl fmt::Debug for CipherTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherTransform")
            .field("position", &self.position)
            .finish()
    }
}

/// At-rest file cipher keyed by a process-wide secret.
#[derive(Clone)]
pub struct StreamCipher {
    key: [u8; 16],
    iv: [u8; 16],
    chunk_size: usize,
}

impl fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCipher")
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl StreamCipher {
    pub fn new(secret: &[u8], chunk_size: usize) -> Self {
        Self {
            key: domain_digest(KEY_DOMAIN, secret),
            iv: domain_digest(IV_DOMAIN, secret),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn from_section(section: &CipherSection) -> Self {
        Self::new(section.secret.as_bytes(), section.chunk_size)
    }

    /// Same key with a nonce bound to `label`, so files with different labels
    /// never share keystream. Package files are labelled by [`file_scope`].
    pub fn scoped(&self, label: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(SCOPE_DOMAIN);
        hasher.update(self.iv);
        hasher.update(label.as_bytes());
        let digest = hasher.finalize();
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&digest[..16]);
        Self {
            key: self.key,
            iv,
            chunk_size: self.chunk_size,
        }
    }

    pub fn create_encrypt_transform(&self, offset: u64) -> CipherTransform {
        self.transform_at(offset)
    }

    pub fn create_decrypt_transform(&self, offset: u64) -> CipherTransform {
        self.transform_at(offset)
    }

    fn transform_at(&self, offset: u64) -> CipherTransform {
        let mut inner = Aes128Ctr::new(&self.key.into(), &self.iv.into());
        inner.seek(offset);
        CipherTransform {
            inner,
            position: offset,
        }
    }

    /// Wraps a reader positioned at `offset` of the ciphertext and yields the
    /// matching plaintext chunks.
    pub fn decrypt_stream<R>(
        &self,
        reader: R,
        offset: u64,
    ) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
    where
        R: AsyncRead + Send + 'static,
    {
        let mut transform = self.create_decrypt_transform(offset);
        ReaderStream::with_capacity(reader, self.chunk_size)
            .map(move |chunk| chunk.map(|bytes| transform.apply_bytes(bytes)))
    }

    pub async fn encrypt_file(&self, src: &Path, dst: &Path) -> CipherResult<u64> {
        self.transform_file(src, dst).await
    }

    pub async fn decrypt_file(&self, src: &Path, dst: &Path) -> CipherResult<u64> {
        self.transform_file(src, dst).await
    }

    /// Streams `src` through the keystream into `dst` in bounded chunks. The
    /// output is written to a sibling partial file and renamed only once
    /// complete, so `src == dst` is allowed.
    async fn transform_file(&self, src: &Path, dst: &Path) -> CipherResult<u64> {
        let partial = partial_path(dst);
        match self.copy_through(src, &partial).await {
            Ok(written) => {
                fs::rename(&partial, dst)
                    .await
                    .map_err(|source| CipherError::Io {
                        source,
                        path: dst.to_path_buf(),
                    })?;
                debug!(src = %src.display(), dst = %dst.display(), bytes = written, "file transformed");
                Ok(written)
            }
            Err(err) => {
                if let Err(cleanup) = fs::remove_file(&partial).await {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!(path = %partial.display(), error = %cleanup, "failed to remove partial output");
                    }
                }
                Err(err)
            }
        }
    }

    async fn copy_through(&self, src: &Path, out: &Path) -> CipherResult<u64> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CipherError::Io { source, path }
        };
        let mut reader = fs::File::open(src).await.map_err(io_err(src))?;
        let mut writer = fs::File::create(out).await.map_err(io_err(out))?;
        let mut transform = self.create_encrypt_transform(0);
        let mut buffer = vec![0u8; self.chunk_size];
        loop {
            let read = reader.read(&mut buffer).await.map_err(io_err(src))?;
            if read == 0 {
                break;
            }
            transform.apply(&mut buffer[..read]);
            writer
                .write_all(&buffer[..read])
                .await
                .map_err(io_err(out))?;
        }
        writer.flush().await.map_err(io_err(out))?;
        writer.sync_all().await.map_err(io_err(out))?;
        Ok(transform.position())
    }
}

/// Label for a package file: the asset id and the path inside `package/`.
pub fn file_scope(asset_id: &AssetId, relative: &str) -> String {
    format!("{asset_id}/{relative}")
}

fn domain_digest(domain: &[u8], secret: &[u8]) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(secret);
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

fn partial_path(dst: &Path) -> PathBuf {
    let mut name = dst
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    dst.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn plaintext(len: usize) -> Vec<u8> {
        (0..len).map(|n| (n * 31 % 251) as u8).collect()
    }

    #[test]
    fn slice_decrypts_independently_at_offset() {
        let cipher = StreamCipher::new(b"secret", 64);
        let plain = plaintext(1_000);
        let mut encrypted = plain.clone();
        cipher.create_encrypt_transform(0).apply(&mut encrypted);
        assert_ne!(encrypted, plain);

        for (start, end) in [(0usize, 1_000usize), (100, 200), (15, 17), (999, 1_000), (333, 777)] {
            let mut slice = encrypted[start..end].to_vec();
            cipher
                .create_decrypt_transform(start as u64)
                .apply(&mut slice);
            assert_eq!(slice, &plain[start..end], "slice {start}..{end}");
        }
    }

    #[test]
    fn chunked_application_matches_single_pass() {
        let cipher = StreamCipher::new(b"secret", 64);
        let plain = plaintext(517);
        let mut whole = plain.clone();
        cipher.create_encrypt_transform(0).apply(&mut whole);

        let mut chunked = plain.clone();
        let mut transform = cipher.create_encrypt_transform(0);
        for chunk in chunked.chunks_mut(7) {
            transform.apply(chunk);
        }
        assert_eq!(chunked, whole);
        assert_eq!(transform.position(), 517);
    }

    #[test]
    fn different_secrets_produce_different_ciphertext() {
        let plain = plaintext(64);
        let mut a = plain.clone();
        let mut b = plain.clone();
        StreamCipher::new(b"one", 16).create_encrypt_transform(0).apply(&mut a);
        StreamCipher::new(b"two", 16).create_encrypt_transform(0).apply(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn scoped_files_do_not_share_keystream() {
        let cipher = StreamCipher::new(b"secret", 64);
        let asset = AssetId::parse("film").unwrap();
        let first = cipher.scoped(&file_scope(&asset, "video/segment-0001.m4s"));
        let second = cipher.scoped(&file_scope(&asset, "video/segment-0002.m4s"));
        let other = cipher.scoped(&file_scope(&AssetId::parse("other").unwrap(), "video/segment-0001.m4s"));

        let plain = plaintext(256);
        let encrypt = |c: &StreamCipher| {
            let mut buf = plain.clone();
            c.create_encrypt_transform(0).apply(&mut buf);
            buf
        };
        let (a, b, c) = (encrypt(&first), encrypt(&second), encrypt(&other));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, encrypt(&cipher));

        // Equal plaintexts under two scopes must not XOR to zero.
        let xor: Vec<u8> = a.iter().zip(&b).map(|(x, y)| x ^ y).collect();
        assert!(xor.iter().any(|byte| *byte != 0));

        let mut back = a.clone();
        cipher
            .scoped(&file_scope(&asset, "video/segment-0001.m4s"))
            .create_decrypt_transform(0)
            .apply(&mut back);
        assert_eq!(back, plain);
    }

    #[tokio::test]
    async fn file_roundtrip_in_bounded_chunks() {
        let dir = TempDir::new().unwrap();
        let cipher = StreamCipher::new(b"secret", 100);
        let src = dir.path().join("plain.bin");
        let enc = dir.path().join("cipher.bin");
        let dec = dir.path().join("roundtrip.bin");
        let plain = plaintext(10_001);
        std::fs::write(&src, &plain).unwrap();

        assert_eq!(cipher.encrypt_file(&src, &enc).await.unwrap(), 10_001);
        assert_ne!(std::fs::read(&enc).unwrap(), plain);
        cipher.decrypt_file(&enc, &dec).await.unwrap();
        assert_eq!(std::fs::read(&dec).unwrap(), plain);
        assert!(!partial_path(&enc).exists());
    }

    #[tokio::test]
    async fn in_place_encryption_replaces_file() {
        let dir = TempDir::new().unwrap();
        let cipher = StreamCipher::new(b"secret", 32);
        let path = dir.path().join("segment.m4s");
        let plain = plaintext(300);
        std::fs::write(&path, &plain).unwrap();
        cipher.encrypt_file(&path, &path).await.unwrap();
        let mut stored = std::fs::read(&path).unwrap();
        cipher.create_decrypt_transform(0).apply(&mut stored);
        assert_eq!(stored, plain);
    }

    #[tokio::test]
    async fn missing_source_leaves_no_output() {
        let dir = TempDir::new().unwrap();
        let cipher = StreamCipher::new(b"secret", 32);
        let dst = dir.path().join("out.bin");
        let err = cipher
            .encrypt_file(&dir.path().join("absent.bin"), &dst)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!dst.exists());
        assert!(!partial_path(&dst).exists());
    }

    #[tokio::test]
    async fn decrypt_stream_yields_plaintext_from_offset() {
        let cipher = StreamCipher::new(b"secret", 16);
        let plain = plaintext(200);
        let mut encrypted = plain.clone();
        cipher.create_encrypt_transform(0).apply(&mut encrypted);

        let reader = std::io::Cursor::new(encrypted[50..150].to_vec());
        let chunks: Vec<Bytes> = cipher
            .decrypt_stream(reader, 50)
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(joined, &plain[50..150]);
    }
}
