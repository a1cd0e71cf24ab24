//! Capture pipeline (§4.G): per connection, two cooperating producers turn
//! the tee'd request/response pipes into a `RecordBatch`.
//!
//! Grounded in the teacher's per-connection worker (`ingestion::handle_connection`)
//! for the "one task per side, join, tear down the sibling on failure" shape,
//! generalised from a single ingest stream to two concurrent producers
//! joined by a one-shot URI hand-off and cancelled together on either
//! failure (the teacher's `JoinHandle::abort()` pattern for sibling
//! teardown, applied to peer-producer cancellation instead of
//! manager-command cancellation).

use crate::config::Settings;
use crate::dedupe::{self, DedupEntry, DedupeIndex};
use crate::error::{CaptureError, ExchangeError};
use crate::rotator::RecordBatch;
use crate::spool::SpooledBuffer;
use crate::spool_pool::SpoolPool;
use crate::warc::digest::sha1_digest_string;
use crate::warc::record::Record;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// Everything a capture task needs beyond the two tee'd pipes: shared
/// collaborators and the channels it publishes onto.
pub struct CaptureContext {
    pub pool: Arc<SpoolPool>,
    pub dedupe: Arc<DedupeIndex>,
    pub batch_tx: mpsc::Sender<RecordBatch>,
    pub error_tx: mpsc::Sender<ExchangeError>,
    pub skip_status_codes: Vec<u16>,
    pub remote_ip: Option<IpAddr>,
    /// Set when the caller passed the `feedback` context value to `Client::do`;
    /// fired once the batch has been durably written.
    pub feedback: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

struct ParsedRequest {
    target_uri: String,
    record: Record,
}

struct ParsedResponse {
    status: u16,
    payload_digest: String,
    payload_len: u64,
    record: Record,
}

/// Run the two producers for one connection, join them, and publish the
/// resulting batch — or surface the failure on the error channel.
pub async fn run(
    ctx: Arc<CaptureContext>,
    request_pipe: tokio::io::DuplexStream,
    response_pipe: tokio::io::DuplexStream,
    connection_url: String,
) {
    let (uri_tx, uri_rx) = oneshot::channel::<String>();
    let cancel = CancellationToken::new();

    let request_ctx = ctx.clone();
    let request_cancel = cancel.clone();
    let request_task = tokio::spawn(async move {
        tokio::select! {
            result = read_request(request_ctx, request_pipe, uri_tx) => result,
            _ = request_cancel.cancelled() => Err(CaptureError::UnparseableRequest),
        }
    });

    let response_ctx = ctx.clone();
    let response_cancel = cancel.clone();
    let response_task = tokio::spawn(async move {
        tokio::select! {
            result = read_response(response_ctx, response_pipe, uri_rx) => result,
            _ = response_cancel.cancelled() => Err(CaptureError::ResponseParse("cancelled".to_string())),
        }
    });

    let (request_result, response_result) = tokio::join!(request_task, response_task);

    let request_outcome = request_result.unwrap_or_else(|e| Err(CaptureError::Io(std::io::Error::other(e))));
    let response_outcome = response_result.unwrap_or_else(|e| Err(CaptureError::Io(std::io::Error::other(e))));

    match (request_outcome, response_outcome) {
        (Ok(mut req), Ok(mut resp)) => {
            cancel.cancel();
            if let Err(e) = finalize_and_publish(&ctx, &mut req, &mut resp).await {
                publish_error(&ctx, &connection_url, e).await;
            }
        }
        (req, resp) => {
            cancel.cancel();
            if let Ok(mut req) = req {
                let _ = req.record.close().await;
            } else if let Err(e) = req {
                publish_error(&ctx, &connection_url, e).await;
            }
            if let Ok(mut resp) = resp {
                let _ = resp.record.close().await;
            } else if let Err(e) = resp {
                publish_error(&ctx, &connection_url, e).await;
            }
        }
    }
}

async fn publish_error(ctx: &CaptureContext, url: &str, source: CaptureError) {
    let err = ExchangeError {
        url: url.to_string(),
        reason: source.to_string(),
        source,
    };
    if ctx.error_tx.send(err).await.is_err() {
        warn!("error channel closed, dropping capture error (caller stopped draining)");
    }
}

/// Reads the request pipe, extracting `GET <target> HTTP/1.x` and `Host:`,
/// reconstructing `WARC-Target-URI`, and publishing it for the response
/// producer before the request body has necessarily finished spooling.
async fn read_request(
    ctx: Arc<CaptureContext>,
    mut pipe: tokio::io::DuplexStream,
    uri_tx: oneshot::Sender<String>,
) -> Result<ParsedRequest, CaptureError> {
    use tokio::io::AsyncReadExt;

    let mut content = SpooledBuffer::new(ctx.pool.clone());
    let mut raw = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..n]);
        content.write(&chunk[..n]).await?;
    }

    let text = String::from_utf8_lossy(&raw);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or(CaptureError::UnparseableRequest)?;
    let mut parts = request_line.split_whitespace();
    let _method = parts.next().ok_or(CaptureError::UnparseableRequest)?;
    let target = parts.next().ok_or(CaptureError::UnparseableRequest)?;
    let _version = parts.next().ok_or(CaptureError::UnparseableRequest)?;

    let host = text
        .split("\r\n")
        .find_map(|line| line.strip_prefix("Host:").or_else(|| line.strip_prefix("host:")))
        .map(|h| h.trim().to_string())
        .ok_or(CaptureError::UnparseableRequest)?;

    let scheme = if target.starts_with("https://") || target.starts_with("http://") {
        None
    } else {
        Some("http")
    };
    let target_uri = match scheme {
        None => target.to_string(),
        Some(scheme) => format!("{scheme}://{host}{target}"),
    };

    let _ = uri_tx.send(target_uri.clone());

    let mut record = Record::new(ctx.pool.clone());
    record.set_header("WARC-Type", "request");
    record.set_header("Content-Type", "application/http; msgtype=request");
    record.set_header("WARC-Target-URI", target_uri.clone());
    record.content = content;

    Ok(ParsedRequest { target_uri, record })
}

/// Reads the response pipe, extracts the status line, consults dedupe, and
/// transforms duplicate payloads into `revisit` records.
async fn read_response(
    ctx: Arc<CaptureContext>,
    mut pipe: tokio::io::DuplexStream,
    uri_rx: oneshot::Receiver<String>,
) -> Result<ParsedResponse, CaptureError> {
    use tokio::io::AsyncReadExt;

    let mut content = SpooledBuffer::new(ctx.pool.clone());
    let mut raw = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..n]);
        content.write(&chunk[..n]).await?;
    }

    let text_prefix_len = raw.len().min(4096);
    let text = String::from_utf8_lossy(&raw[..text_prefix_len]);
    let status_line = text.split("\r\n").next().ok_or(CaptureError::ResponseParse("empty response".to_string()))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CaptureError::ResponseParse(format!("unparseable status line: {status_line}")))?;

    if ctx.skip_status_codes.contains(&status) {
        content.close().await.ok();
        return Err(CaptureError::BlockedStatusCode);
    }

    let header_end = find_header_boundary(&raw).unwrap_or(raw.len());
    let body = &raw[header_end..];
    let payload_digest = sha1_digest_string(body);
    let payload_len = body.len() as u64;

    let target_uri = uri_rx.await.map_err(|_| CaptureError::UnparseableRequest)?;

    let mut record = Record::new(ctx.pool.clone());
    record.set_header("WARC-Type", "response");
    record.set_header("Content-Type", "application/http; msgtype=response");
    record.set_header("WARC-Target-URI", target_uri);
    record.set_header("WARC-Payload-Digest", format!("sha1:{payload_digest}"));
    record.content = content;

    if let Some(hit) = ctx
        .dedupe
        .lookup(&payload_digest, payload_len, record.header("WARC-Target-URI").unwrap_or_default())
        .await?
    {
        dedupe::transform_to_revisit(&mut record, &hit, ctx.pool.clone()).await?;
    }

    Ok(ParsedResponse {
        status,
        payload_digest,
        payload_len,
        record,
    })
}

fn find_header_boundary(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n").map(|idx| idx + 4)
}

/// Cross-stamp the two records, compute their block digests/content-length,
/// register a dedupe entry if eligible, and publish the batch.
async fn finalize_and_publish(
    ctx: &CaptureContext,
    req: &mut ParsedRequest,
    resp: &mut ParsedResponse,
) -> Result<(), CaptureError> {
    let request_id = Uuid::new_v4();
    let response_id = Uuid::new_v4();

    req.record.set_header("WARC-Record-ID", format!("<urn:uuid:{request_id}>"));
    req.record.set_header("WARC-Concurrent-To", format!("<urn:uuid:{response_id}>"));
    resp.record.set_header("WARC-Record-ID", format!("<urn:uuid:{response_id}>"));
    resp.record.set_header("WARC-Concurrent-To", format!("<urn:uuid:{request_id}>"));

    // WARC-IP-Address is only stamped when the connection was not proxied;
    // the client leaves `remote_ip` unset for proxied connections.
    if let Some(ip) = ctx.remote_ip {
        req.record.set_header("WARC-IP-Address", ip.to_string());
        resp.record.set_header("WARC-IP-Address", ip.to_string());
    }

    req.record.finalize_mandatory_headers().await?;
    resp.record.finalize_mandatory_headers().await?;

    if resp.record.header("WARC-Type") == Some("response") {
        ctx.dedupe.record(
            &resp.payload_digest,
            resp.payload_len,
            DedupEntry {
                response_uuid: response_id,
                target_uri: resp.record.header("WARC-Target-URI").unwrap_or_default().to_string(),
                date: chrono::Utc::now(),
            },
        );
    }

    tracing::debug!(status = resp.status, "capture pipeline publishing batch");

    let batch = RecordBatch {
        records: vec![std::mem::replace(&mut req.record, Record::new(ctx.pool.clone())), std::mem::replace(&mut resp.record, Record::new(ctx.pool.clone()))],
        capture_time: chrono::Utc::now(),
        done: ctx.feedback.lock().take(),
    };
    ctx.batch_tx.send(batch).await.map_err(|_| CaptureError::Io(std::io::Error::other("writer pool channel closed")))?;
    Ok(())
}

/// Build a [`CaptureContext`] from top-level settings and the shared
/// collaborators a client constructs once at startup.
pub fn context_from_settings(
    settings: &Settings,
    pool: Arc<SpoolPool>,
    dedupe: Arc<DedupeIndex>,
    batch_tx: mpsc::Sender<RecordBatch>,
    error_tx: mpsc::Sender<ExchangeError>,
    remote_ip: Option<IpAddr>,
    feedback: Option<oneshot::Sender<()>>,
) -> CaptureContext {
    CaptureContext {
        pool,
        dedupe,
        batch_tx,
        error_tx,
        skip_status_codes: settings.skip_http_status_codes.clone(),
        remote_ip,
        feedback: parking_lot::Mutex::new(feedback),
    }
}
