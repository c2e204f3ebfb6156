//! Object storage: asset bytes by content address and byte range.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info};

use crate::verify;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid content address: {0}")]
    InvalidAddress(String),
    #[error("range {start}..{end} outside object of {size} bytes")]
    OutOfRange { start: u64, end: u64, size: u64 },
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug + 'static {
    /// Size in bytes of the object.
    async fn size(&self, address: &str) -> Result<u64, StorageError>;

    /// Bytes `[start, end)` of the object.
    async fn read_range(&self, address: &str, start: u64, end: u64) -> Result<Bytes, StorageError>;
}

/// Objects as files named by content address under one directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, address: &str) -> Result<PathBuf, StorageError> {
        if !verify::is_content_address(address) {
            return Err(StorageError::InvalidAddress(address.to_string()));
        }
        Ok(self.root.join(address))
    }

    /// Hash `src` and copy it into the store. Returns the content address and
    /// size. Importing the same bytes twice is a no-op.
    pub fn import_file(&self, src: &Path) -> Result<(String, u64), StorageError> {
        let (address, size) = verify::content_address_of_file(src)?;
        let dest = self.root.join(&address);
        if dest.exists() {
            debug!(%address, "object already stored");
        } else {
            // Copy then rename so readers never see a partial object.
            let tmp = self.root.join(format!("{address}.partial"));
            std::fs::copy(src, &tmp)?;
            std::fs::rename(&tmp, &dest)?;
            info!(%address, size, "object stored");
        }
        Ok((address, size))
    }
}

fn not_found(address: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(address.to_string())
    } else {
        StorageError::Io(e)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn size(&self, address: &str) -> Result<u64, StorageError> {
        let path = self.object_path(address)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| not_found(address, e))?;
        Ok(meta.len())
    }

    async fn read_range(&self, address: &str, start: u64, end: u64) -> Result<Bytes, StorageError> {
        let path = self.object_path(address)?;
        let address = address.to_string();
        // Seek-based read of just the requested range, off the async runtime.
        tokio::task::spawn_blocking(move || {
            let mut f = std::fs::File::open(&path).map_err(|e| not_found(&address, e))?;
            let size = f.metadata()?.len();
            if start > end || end > size {
                return Err(StorageError::OutOfRange { start, end, size });
            }
            f.seek(SeekFrom::Start(start))?;
            let mut buf = vec![0u8; (end - start) as usize];
            f.read_exact(&mut buf)?;
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        (0..10_000u32).map(|i| (i % 256) as u8).collect()
    }

    fn put(store: &FsObjectStore, dir: &Path, data: &[u8]) -> String {
        let src = dir.join("upload.bin");
        std::fs::write(&src, data).unwrap();
        store.import_file(&src).unwrap().0
    }

    #[tokio::test]
    async fn test_put_and_read_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("objects")).unwrap();
        let data = sample();
        let addr = put(&store, dir.path(), &data);

        assert_eq!(store.size(&addr).await.unwrap(), data.len() as u64);
        let bytes = store.read_range(&addr, 100, 356).await.unwrap();
        assert_eq!(&bytes[..], &data[100..356]);
        assert!(store.read_range(&addr, 0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_range_past_end_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("objects")).unwrap();
        let addr = put(&store, dir.path(), &sample());
        assert!(matches!(
            store.read_range(&addr, 9_000, 10_001).await,
            Err(StorageError::OutOfRange { size: 10_000, .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_and_invalid_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();
        let missing = verify::sha256_hex(b"never stored");
        assert!(matches!(store.size(&missing).await, Err(StorageError::NotFound(_))));
        assert!(matches!(
            store.read_range("../secret", 0, 1).await,
            Err(StorageError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_import_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("objects")).unwrap();
        let src = dir.path().join("movie.mp4");
        std::fs::write(&src, sample()).unwrap();

        let (a1, size) = store.import_file(&src).unwrap();
        let (a2, _) = store.import_file(&src).unwrap();
        assert_eq!(a1, a2);
        assert_eq!(size, 10_000);
        assert!(dir.path().join("objects").join(&a1).exists());
    }
}
