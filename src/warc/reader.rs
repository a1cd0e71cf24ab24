//! Streaming WARC reader (§4.J): transparently handles gzip/bzip2/raw framing
//! via magic-byte sniffing, used by the `extract`/`verify` collaborators.

use crate::error::ReaderError;
use crate::spool_pool::SpoolPool;
use crate::warc::record::{parse_record, Record};
use async_compression::tokio::bufread::{BzDecoder, GzipDecoder};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

enum Framing {
    Raw,
    Gzip,
    Bzip2,
}

fn sniff(magic: &[u8]) -> Framing {
    if magic.len() >= 2 && magic[0] == 0x1F && magic[1] == 0x8B {
        Framing::Gzip
    } else if magic.len() >= 2 && magic[0] == b'B' && magic[1] == b'Z' {
        Framing::Bzip2
    } else {
        Framing::Raw
    }
}

/// Streams records out of a (possibly compressed) WARC file one at a time.
pub struct WarcReader {
    pool: Arc<SpoolPool>,
    inner: Pin<Box<dyn AsyncBufRead + Unpin + Send>>,
}

impl WarcReader {
    pub async fn open(path: &Path, pool: Arc<SpoolPool>) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let mut buffered = BufReader::new(file);
        let framing = {
            let magic = buffered.fill_buf().await?;
            sniff(magic)
        };
        let inner: Pin<Box<dyn AsyncBufRead + Unpin + Send>> = match framing {
            Framing::Gzip => Box::pin(BufReader::new(GzipDecoder::new(buffered))),
            Framing::Bzip2 => Box::pin(BufReader::new(BzDecoder::new(buffered))),
            Framing::Raw => Box::pin(buffered),
        };
        Ok(Self { pool, inner })
    }

    /// Read the next record. Returns `Ok(None)` at end of file.
    pub async fn read_record(&mut self) -> Result<Option<Record>, ReaderError> {
        Ok(parse_record(&mut self.inner, self.pool.clone()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_gzip_magic() {
        assert!(matches!(sniff(&[0x1F, 0x8B, 0x08]), Framing::Gzip));
    }

    #[test]
    fn sniffs_bzip2_magic() {
        assert!(matches!(sniff(b"BZh9"), Framing::Bzip2));
    }

    #[test]
    fn falls_back_to_raw() {
        assert!(matches!(sniff(b"WARC/1.1"), Framing::Raw));
    }
}
