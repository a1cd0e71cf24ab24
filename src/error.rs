//! Error taxonomy.
//!
//! Three tiers, matching how failures are allowed to propagate:
//!   - fatal-to-process: programming errors, handled by `panic!` at the call
//!     site (see `SpooledBuffer::write`, `Record::finish`).
//!   - fatal-to-exchange: [`ExchangeError`], published on the client's error
//!     channel; the caller still gets their HTTP response.
//!   - non-fatal: logged via `tracing::warn!` and swallowed where it occurs.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spooled buffer is closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("missing mandatory header: {0}")]
    MissingHeader(&'static str),
    #[error("invalid Content-Length: {0}")]
    InvalidContentLength(String),
    #[error("malformed record boundary")]
    MalformedBoundary,
    #[error("early EOF record boundary")]
    EarlyEofBoundary,
    #[error("unsupported WARC version: {0}")]
    UnsupportedVersion(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Spool(#[from] SpoolError),
}

#[derive(Debug, Error)]
pub enum RotatorError {
    #[error("could not generate a unique filename after {0} attempts")]
    FilenameExhausted(u32),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("dns resolution failed for {host}: {source}")]
    Dns {
        host: String,
        #[source]
        source: DnsError,
    },
    #[error("tcp connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("socks5 proxy handshake failed: {0}")]
    Socks(String),
    #[error("tls handshake timed out")]
    TlsTimeout,
    #[error("tls handshake failed: {0}")]
    Tls(String),
}

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("no DNS servers configured")]
    NoServers,
    #[error("host unresolvable: {0}")]
    Unresolvable(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("request URI unparseable")]
    UnparseableRequest,
    #[error("response parse failed: {0}")]
    ResponseParse(String),
    #[error("response code was blocked by config")]
    BlockedStatusCode,
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Dedupe(#[from] DedupeError),
    #[error(transparent)]
    Spool(#[from] SpoolError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum DedupeError {
    #[error("CDX lookup request failed: {0}")]
    Http(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Published on the HTTP client facade's error channel. Carries enough
/// context to diagnose without the caller having to reconstruct it.
#[derive(Debug, Error)]
#[error("archival failed for {url}: {reason}")]
pub struct ExchangeError {
    pub url: String,
    pub reason: String,
    #[source]
    pub source: CaptureError,
}

/// Top-level error returned by the facade's own operations (construction,
/// configuration validation, shutdown).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid settings: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Rotator(#[from] RotatorError),
}

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
