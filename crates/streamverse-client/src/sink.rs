//! Playback sinks: where delivered chunks go, strictly in index order.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("chunk {got} out of order, expected {expected}")]
    OutOfOrder { expected: u32, got: u32 },
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait PlaybackSink: Send {
    /// Append chunk `index`. Called once per chunk, in order.
    async fn append(&mut self, index: u32, bytes: Bytes) -> Result<(), SinkError>;

    /// Called after the last chunk.
    async fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Keeps chunks in memory. The first index is arbitrary; later ones must follow it.
#[derive(Debug, Default)]
pub struct MemorySink {
    chunks: Vec<(u32, Bytes)>,
    finished: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> &[(u32, Bytes)] {
        &self.chunks
    }

    pub fn indices(&self) -> Vec<u32> {
        self.chunks.iter().map(|(i, _)| *i).collect()
    }

    /// All delivered bytes, concatenated.
    pub fn data(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|(_, b)| b.iter().copied()).collect()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[async_trait]
impl PlaybackSink for MemorySink {
    async fn append(&mut self, index: u32, bytes: Bytes) -> Result<(), SinkError> {
        if let Some(&(last, _)) = self.chunks.last() {
            if index != last + 1 {
                return Err(SinkError::OutOfOrder {
                    expected: last + 1,
                    got: index,
                });
            }
        }
        self.chunks.push((index, bytes));
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        self.finished = true;
        Ok(())
    }
}

/// Appends chunks to a file. Starting at index 0 truncates it; any later
/// first index continues an earlier session's output.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    next: Option<u32>,
    written: u64,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            next: None,
            written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written by this sink.
    pub fn written(&self) -> u64 {
        self.written
    }
}

#[async_trait]
impl PlaybackSink for FileSink {
    async fn append(&mut self, index: u32, bytes: Bytes) -> Result<(), SinkError> {
        if let Some(expected) = self.next {
            if index != expected {
                return Err(SinkError::OutOfOrder {
                    expected,
                    got: index,
                });
            }
        }
        if self.file.is_none() {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .append(index != 0)
                .truncate(index == 0)
                .open(&self.path)
                .await?;
            self.file = Some(file);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(&bytes).await?;
        }
        self.written += bytes.len() as u64;
        self.next = Some(index + 1);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}
