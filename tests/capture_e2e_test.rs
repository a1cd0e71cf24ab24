//! End-to-end capture pipeline (§8 scenarios 1, 2, 6): feed raw HTTP
//! request/response bytes through the tee'd duplex pipes exactly as a real
//! dial would produce them, and check the resulting WARC batch.

use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use warc_archiver::capture::{self, CaptureContext};
use warc_archiver::config::DedupeOptions;
use warc_archiver::dedupe::DedupeIndex;
use warc_archiver::rotator::RecordBatch;
use warc_archiver::spool_pool::{SpoolPolicy, SpoolPool};

fn no_dedupe() -> Arc<DedupeIndex> {
    Arc::new(DedupeIndex::new(&DedupeOptions {
        local_dedupe: false,
        cdx_dedupe: false,
        cdx_url: None,
        size_threshold: 0,
    }))
}

#[tokio::test]
async fn plain_exchange_produces_a_request_and_response_record() {
    let pool = Arc::new(SpoolPool::new(SpoolPolicy::default()));
    let (batch_tx, mut batch_rx) = tokio::sync::mpsc::channel::<RecordBatch>(4);
    let (error_tx, mut error_rx) = tokio::sync::mpsc::channel(4);

    let ctx = Arc::new(CaptureContext {
        pool,
        dedupe: no_dedupe(),
        batch_tx,
        error_tx,
        skip_status_codes: Vec::new(),
        remote_ip: None,
        feedback: parking_lot::Mutex::new(None),
    });

    let (request_writer, request_reader) = tokio::io::duplex(4096);
    let (response_writer, response_reader) = tokio::io::duplex(4096);

    let mut req_w = request_writer;
    let mut resp_w = response_writer;
    tokio::spawn(async move {
        req_w
            .write_all(b"GET /page HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test\r\n\r\n")
            .await
            .unwrap();
        req_w.shutdown().await.unwrap();
    });
    tokio::spawn(async move {
        resp_w
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        resp_w.shutdown().await.unwrap();
    });

    capture::run(ctx, request_reader, response_reader, "http://example.com/page".to_string()).await;

    let batch = tokio::time::timeout(std::time::Duration::from_secs(2), batch_rx.recv())
        .await
        .expect("batch should arrive")
        .expect("channel open");
    assert_eq!(batch.records.len(), 2);

    let request_record = batch.records.iter().find(|r| r.header("WARC-Type") == Some("request")).unwrap();
    assert_eq!(request_record.header("WARC-Target-URI"), Some("http://example.com/page"));

    let response_record = batch.records.iter().find(|r| r.header("WARC-Type") == Some("response")).unwrap();
    assert_eq!(response_record.header("WARC-Target-URI"), Some("http://example.com/page"));
    assert!(response_record.header("WARC-Payload-Digest").unwrap().starts_with("sha1:"));

    assert!(error_rx.try_recv().is_err(), "no capture error expected on a clean exchange");
}

#[tokio::test]
async fn blocked_status_code_is_surfaced_as_a_capture_error_not_a_batch() {
    let pool = Arc::new(SpoolPool::new(SpoolPolicy::default()));
    let (batch_tx, mut batch_rx) = tokio::sync::mpsc::channel::<RecordBatch>(4);
    let (error_tx, mut error_rx) = tokio::sync::mpsc::channel(4);

    let ctx = Arc::new(CaptureContext {
        pool,
        dedupe: no_dedupe(),
        batch_tx,
        error_tx,
        skip_status_codes: vec![204],
        remote_ip: None,
        feedback: parking_lot::Mutex::new(None),
    });

    let (request_writer, request_reader) = tokio::io::duplex(4096);
    let (response_writer, response_reader) = tokio::io::duplex(4096);

    let mut req_w = request_writer;
    let mut resp_w = response_writer;
    tokio::spawn(async move {
        req_w.write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").await.unwrap();
        req_w.shutdown().await.unwrap();
    });
    tokio::spawn(async move {
        resp_w.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        resp_w.shutdown().await.unwrap();
    });

    capture::run(ctx, request_reader, response_reader, "http://example.com/".to_string()).await;

    assert!(batch_rx.try_recv().is_err(), "blocked status codes must not publish a batch");
    let err = tokio::time::timeout(std::time::Duration::from_secs(2), error_rx.recv())
        .await
        .expect("error should arrive")
        .expect("channel open");
    assert!(err.reason.contains("blocked"));
}
