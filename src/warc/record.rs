//! A single WARC record: header block + content, with the explicit
//! writing/reading state machine from §3.
//!
//! Serialisation renders:
//! ```text
//! "WARC/1.1\r\n"
//! (Header-Key: Header-Value "\r\n")*
//! "\r\n"
//! <content bytes, exactly Content-Length>
//! "\r\n\r\n"
//! ```

use crate::error::CodecError;
use crate::spool::SpooledBuffer;
use crate::spool_pool::SpoolPool;
use crate::warc::digest::sha1_digest_string;
use crate::warc::headers::WarcHeaders;
use chrono::{SecondsFormat, Utc};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Maximum bytes a single header line (or the version line) may occupy
/// before parsing fails, bounding pathological inputs (§9 design notes).
pub const MAX_HEADER_LINE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarcVersion {
    V1_0,
    V1_1,
}

impl WarcVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            WarcVersion::V1_0 => "WARC/1.0",
            WarcVersion::V1_1 => "WARC/1.1",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CodecError> {
        match s {
            "WARC/1.1" => Ok(WarcVersion::V1_1),
            "WARC/1.0" => Ok(WarcVersion::V1_0),
            other => Err(CodecError::UnsupportedVersion(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Writing,
    Reading,
}

pub struct Record {
    pub version: WarcVersion,
    headers: WarcHeaders,
    pub content: SpooledBuffer,
    state: RecordState,
}

impl Record {
    /// A fresh record under construction. New records are always WARC/1.1;
    /// 1.0 is only ever seen on read (§9 open question).
    pub fn new(pool: Arc<SpoolPool>) -> Self {
        Self {
            version: WarcVersion::V1_1,
            headers: WarcHeaders::new(),
            content: SpooledBuffer::new(pool),
            state: RecordState::Writing,
        }
    }

    pub fn from_parts(version: WarcVersion, headers: WarcHeaders, content: SpooledBuffer) -> Self {
        Self {
            version,
            headers,
            content,
            state: RecordState::Reading,
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    pub fn headers(&self) -> &WarcHeaders {
        &self.headers
    }

    /// Set a header. Aborts the process if content has already been read or
    /// serialised — headers are fixed at that point (mirrors the
    /// write-after-read invariant on `content`).
    pub fn set_header(&mut self, key: &str, value: impl Into<String>) {
        if self.state == RecordState::Reading {
            panic!("write after read");
        }
        self.headers.set(key, value);
    }

    /// Remove a header, e.g. to force [`Self::finalize_mandatory_headers`] to
    /// recompute it after the content has changed. Same write-after-read
    /// guard as [`Self::set_header`].
    pub fn remove_header(&mut self, key: &str) {
        if self.state == RecordState::Reading {
            panic!("write after read");
        }
        self.headers.remove(key);
    }

    pub async fn write_content(&mut self, bytes: &[u8]) -> Result<usize, CodecError> {
        Ok(self.content.write(bytes).await?)
    }

    /// Stamp every header the codec can fill in mechanically: date, type,
    /// record id, content-length, block digest. Caller-supplied values are
    /// never overwritten.
    pub async fn finalize_mandatory_headers(&mut self) -> Result<(), CodecError> {
        if !self.headers.contains("WARC-Date") {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
            self.headers.set("WARC-Date", now);
        }
        if !self.headers.contains("WARC-Type") {
            self.headers.set("WARC-Type", "resource");
        }
        if !self.headers.contains("WARC-Record-ID") {
            self.headers.set("WARC-Record-ID", format!("<urn:uuid:{}>", Uuid::new_v4()));
        }
        if !self.headers.contains("Content-Length") {
            let len = self.content.len();
            self.headers.set("Content-Length", len.to_string());
        }
        if !self.headers.contains("WARC-Block-Digest") {
            let digest = self.digest_content().await?;
            self.headers.set("WARC-Block-Digest", digest);
        }
        Ok(())
    }

    /// Read the entire content body and return its sha1 digest string. This
    /// transitions the record into reading state, so it must be the last
    /// content-touching call before `serialize`.
    async fn digest_content(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_all_content().await?;
        Ok(sha1_digest_string(&bytes))
    }

    /// Read the full content body into memory, rewinding first. Used both
    /// for digesting and for serialisation.
    pub async fn read_all_content(&mut self) -> Result<Vec<u8>, CodecError> {
        self.content.seek(SeekFrom::Start(0)).await?;
        let len = self.content.len();
        let mut buf = vec![0u8; len as usize];
        let mut off = 0usize;
        while off < buf.len() {
            let n = self.content.read(&mut buf[off..]).await?;
            if n == 0 {
                break;
            }
            off += n;
        }
        buf.truncate(off);
        Ok(buf)
    }

    /// Require a mandatory header set; fatal-to-process if missing (§7) —
    /// this should be unreachable in practice once `finalize_mandatory_headers`
    /// has run, and exists only as a last-line sanity check.
    fn require(&self, key: &'static str) {
        if !self.headers.contains(key) {
            panic!("mandatory WARC header missing at serialisation: {key}");
        }
    }

    /// Serialise the record to `w`, returning the number of bytes written
    /// (used by the rotator to track file size for rotation).
    pub async fn serialize<W: AsyncWrite + Unpin>(&mut self, w: &mut W) -> Result<u64, CodecError> {
        self.require("WARC-Type");
        self.require("WARC-Record-ID");
        self.require("WARC-Date");
        self.require("Content-Length");
        self.require("WARC-Block-Digest");

        let mut written: u64 = 0;

        let version_line = format!("{}\r\n", self.version.as_str());
        w.write_all(version_line.as_bytes()).await?;
        written += version_line.len() as u64;

        for (key, value) in self.headers.render_ordered() {
            let line = format!("{key}: {value}\r\n");
            w.write_all(line.as_bytes()).await?;
            written += line.len() as u64;
        }
        w.write_all(b"\r\n").await?;
        written += 2;

        let content = self.read_all_content().await?;
        w.write_all(&content).await?;
        written += content.len() as u64;

        w.write_all(b"\r\n\r\n").await?;
        written += 4;

        self.state = RecordState::Reading;
        Ok(written)
    }

    pub async fn close(&mut self) -> std::io::Result<()> {
        self.content.close().await
    }
}

/// Read a single CRLF-terminated line, stripping the terminator. Returns
/// `Ok(None)` on clean EOF (nothing read at all). Bounded by
/// [`MAX_HEADER_LINE`] to reject pathological inputs.
pub async fn read_crlf_line<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Option<String>, CodecError> {
    let mut raw = Vec::new();
    let n = r.read_until(b'\n', &mut raw).await?;
    if n == 0 {
        return Ok(None);
    }
    if raw.len() > MAX_HEADER_LINE {
        return Err(CodecError::MalformedBoundary);
    }
    while raw.last() == Some(&b'\n') || raw.last() == Some(&b'\r') {
        raw.pop();
    }
    Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
}

/// Parse one record from `r`, given a spool pool to allocate its content
/// buffer from. Returns `Ok(None)` at clean EOF before any version line is
/// read (the Reader's signal that the file is exhausted).
pub async fn parse_record<R: AsyncBufRead + Unpin>(
    r: &mut R,
    pool: Arc<SpoolPool>,
) -> Result<Option<Record>, CodecError> {
    let Some(version_line) = read_crlf_line(r).await? else {
        return Ok(None);
    };
    let version = WarcVersion::parse(version_line.trim())?;

    let mut headers = WarcHeaders::new();
    loop {
        let Some(line) = read_crlf_line(r).await? else {
            return Err(CodecError::MalformedBoundary);
        };
        if line.is_empty() {
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(CodecError::MalformedBoundary);
        };
        headers.push_raw(key.trim().to_string(), value.trim().to_string());
    }

    let content_length: u64 = headers
        .get("Content-Length")
        .ok_or(CodecError::MissingHeader("Content-Length"))?
        .parse()
        .map_err(|_| CodecError::InvalidContentLength(headers.get("Content-Length").unwrap_or("").to_string()))?;

    let mut content = SpooledBuffer::new(pool);
    let mut remaining = content_length;
    let mut chunk = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = remaining.min(chunk.len() as u64) as usize;
        let n = r.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(CodecError::EarlyEofBoundary);
        }
        content.write(&chunk[..n]).await?;
        remaining -= n as u64;
    }

    let boundary1 = read_crlf_line(r).await?;
    match boundary1 {
        Some(ref s) if !s.is_empty() => return Err(CodecError::MalformedBoundary),
        None => return Err(CodecError::EarlyEofBoundary),
        Some(_) => {}
    }
    let boundary2 = read_crlf_line(r).await?;
    match boundary2 {
        Some(ref s) if !s.is_empty() => return Err(CodecError::MalformedBoundary),
        None => return Err(CodecError::EarlyEofBoundary),
        Some(_) => {}
    }

    Ok(Some(Record::from_parts(version, headers, content)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool_pool::SpoolPolicy;
    use std::io::Cursor;

    fn pool() -> Arc<SpoolPool> {
        Arc::new(SpoolPool::new(SpoolPolicy::default()))
    }

    #[tokio::test]
    async fn serialize_then_parse_roundtrips() {
        let mut record = Record::new(pool());
        record.set_header("WARC-Type", "resource");
        record.write_content(b"hello warc").await.unwrap();
        record.finalize_mandatory_headers().await.unwrap();

        let mut out = Vec::new();
        record.serialize(&mut out).await.unwrap();

        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("WARC/1.1\r\n"));
        assert!(text.contains("WARC-Block-Digest: sha1:"));
        assert!(text.ends_with("\r\n\r\n"));

        let mut reader = tokio::io::BufReader::new(Cursor::new(out));
        let mut parsed = parse_record(&mut reader, pool()).await.unwrap().unwrap();
        assert_eq!(parsed.header("WARC-Type"), Some("resource"));
        let body = parsed.read_all_content().await.unwrap();
        assert_eq!(body, b"hello warc");
    }

    #[tokio::test]
    async fn content_length_matches_body() {
        let mut record = Record::new(pool());
        record.write_content(b"0123456789").await.unwrap();
        record.finalize_mandatory_headers().await.unwrap();
        assert_eq!(record.header("Content-Length"), Some("10"));
    }

    #[tokio::test]
    #[should_panic(expected = "write after read")]
    async fn set_header_after_serialize_panics() {
        let mut record = Record::new(pool());
        record.finalize_mandatory_headers().await.unwrap();
        let mut out = Vec::new();
        record.serialize(&mut out).await.unwrap();
        record.set_header("X-Late", "too-late");
    }
}
