//! Write-then-read byte container that lives in RAM up to a threshold, then
//! transparently promotes to a temp file (§4.A).
//!
//! `write` is legal only before the first `read`/`read_at`/`seek` call;
//! calling `write` afterwards is a programming error and aborts the process,
//! matching the source's `"write after read"` invariant (§3, §9).

use crate::error::SpoolError;
use crate::spool_pool::SpoolPool;
use std::io::{Cursor, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

enum Body {
    Memory(Vec<u8>),
    MemoryReading(Cursor<Vec<u8>>),
    Disk(tokio::fs::File, PathBuf),
}

pub struct SpooledBuffer {
    pool: Arc<SpoolPool>,
    body: Body,
    reading: bool,
    closed: bool,
}

impl SpooledBuffer {
    pub fn new(pool: Arc<SpoolPool>) -> Self {
        Self {
            pool,
            body: Body::Memory(Vec::new()),
            reading: false,
            closed: false,
        }
    }

    /// Append `bytes`. Panics with `"write after read"` if any read/seek has
    /// already occurred — this is a programming error, not a recoverable one.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<usize, SpoolError> {
        if self.closed {
            return Err(SpoolError::Closed);
        }
        if self.reading {
            panic!("write after read");
        }
        match &mut self.body {
            Body::Memory(buf) => {
                if self.pool.should_promote(buf.len() as u64, bytes.len() as u64) {
                    self.promote_to_disk(bytes).await?;
                } else {
                    buf.extend_from_slice(bytes);
                }
            }
            Body::Disk(file, _) => {
                file.write_all(bytes).await?;
            }
            Body::MemoryReading(_) => unreachable!("reading flag guards this arm"),
        }
        Ok(bytes.len())
    }

    async fn promote_to_disk(&mut self, extra: &[u8]) -> Result<(), SpoolError> {
        let existing = match std::mem::replace(&mut self.body, Body::Memory(Vec::new())) {
            Body::Memory(buf) => buf,
            other => {
                self.body = other;
                return Ok(());
            }
        };

        let temp_dir = self.pool.policy().temp_dir.clone();
        let named = tempfile::NamedTempFile::new_in(&temp_dir)?;
        let (std_file, path) = named.keep().map_err(|e| e.error)?;
        let mut file = tokio::fs::File::from_std(std_file);
        file.write_all(&existing).await?;
        file.write_all(extra).await?;
        file.flush().await?;

        let capacity = existing.capacity();
        self.pool.return_buffer(existing);
        let _ = capacity;
        self.body = Body::Disk(file, path);
        Ok(())
    }

    /// Read up to `buf.len()` bytes sequentially. Switches the buffer into
    /// reading mode on first call, forever forbidding further writes.
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.enter_reading().await?;
        match &mut self.body {
            Body::MemoryReading(cursor) => std::io::Read::read(cursor, buf),
            Body::Disk(file, _) => file.read(buf).await,
            Body::Memory(_) => unreachable!("enter_reading transitions out of Memory"),
        }
    }

    pub async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        self.seek(SeekFrom::Start(offset)).await?;
        self.read(buf).await
    }

    pub async fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.enter_reading().await?;
        match &mut self.body {
            Body::MemoryReading(cursor) => std::io::Seek::seek(cursor, pos),
            Body::Disk(file, _) => file.seek(pos).await,
            Body::Memory(_) => unreachable!("enter_reading transitions out of Memory"),
        }
    }

    async fn enter_reading(&mut self) -> std::io::Result<()> {
        self.reading = true;
        if let Body::Memory(buf) = &mut self.body {
            let taken = std::mem::take(buf);
            self.body = Body::MemoryReading(Cursor::new(taken));
        }
        Ok(())
    }

    /// Current logical size. On disk this is the file's real length (a
    /// `stat` call); in memory it is the buffer length.
    pub fn len(&self) -> u64 {
        match &self.body {
            Body::Memory(buf) => buf.len() as u64,
            Body::MemoryReading(cursor) => cursor.get_ref().len() as u64,
            Body::Disk(_, path) => std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty while in memory; the temp file path once promoted to disk.
    pub fn file_name(&self) -> Option<&Path> {
        match &self.body {
            Body::Disk(_, path) => Some(path.as_path()),
            _ => None,
        }
    }

    /// Idempotent. Removes the backing temp file, if any.
    pub async fn close(&mut self) -> std::io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Body::Disk(_, path) = &self.body {
            let path = path.clone();
            let _ = tokio::fs::remove_file(path).await;
        }
        Ok(())
    }
}

impl Drop for SpooledBuffer {
    fn drop(&mut self) {
        if !self.closed {
            if let Body::Disk(_, path) = &self.body {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool_pool::SpoolPolicy;

    fn pool(max_in_memory: u64) -> Arc<SpoolPool> {
        Arc::new(SpoolPool::new(SpoolPolicy {
            max_in_memory,
            max_ram_fraction: 2.0, // disable the pressure probe for determinism
            full_on_disk: false,
            temp_dir: std::env::temp_dir(),
        }))
    }

    #[tokio::test]
    async fn write_then_read_roundtrips_in_memory() {
        let mut sb = SpooledBuffer::new(pool(1024));
        sb.write(b"hello ").await.unwrap();
        sb.write(b"world").await.unwrap();
        assert_eq!(sb.len(), 11);
        assert!(sb.file_name().is_none());

        let mut out = vec![0u8; 11];
        let mut off = 0;
        while off < out.len() {
            let n = sb.read(&mut out[off..]).await.unwrap();
            assert!(n > 0);
            off += n;
        }
        assert_eq!(&out, b"hello world");
        sb.close().await.unwrap();
    }

    #[tokio::test]
    async fn promotes_to_disk_past_threshold() {
        let mut sb = SpooledBuffer::new(pool(8));
        sb.write(b"0123456789").await.unwrap(); // 10 bytes > 8
        assert!(sb.file_name().is_some());
        assert_eq!(sb.len(), 10);

        let mut out = vec![0u8; 10];
        sb.read_at(&mut out, 0).await.unwrap();
        assert_eq!(&out, b"0123456789");
        sb.close().await.unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "write after read")]
    async fn write_after_read_panics() {
        let mut sb = SpooledBuffer::new(pool(1024));
        sb.write(b"abc").await.unwrap();
        let mut buf = [0u8; 1];
        sb.read(&mut buf).await.unwrap();
        let _ = sb.write(b"def").await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_removes_temp_file() {
        let mut sb = SpooledBuffer::new(pool(1));
        sb.write(b"abc").await.unwrap();
        let path = sb.file_name().unwrap().to_path_buf();
        sb.close().await.unwrap();
        assert!(!path.exists());
        sb.close().await.unwrap(); // idempotent
    }
}
