//! Rotation across the writer pool (§8 scenario 3): a low `warc_size`
//! threshold forces multiple files, each opening with its own `warcinfo`
//! record and ending without a trailing `.open` suffix.
//!
//! Grounded in the teacher's `tests/storage_test.rs` (tempfile fixtures
//! driving a real writer end-to-end rather than mocking the filesystem).

use std::sync::Arc;
use tokio::sync::oneshot;
use warc_archiver::config::{CompressionMode, RotatorSettings};
use warc_archiver::rotator::{RecordBatch, RotatorPool};
use warc_archiver::spool_pool::{SpoolPolicy, SpoolPool};
use warc_archiver::warc::record::Record;

fn settings(dir: &std::path::Path, warc_size: u64) -> RotatorSettings {
    RotatorSettings {
        prefix: "TEST".to_string(),
        compression: CompressionMode::None,
        warc_size,
        output_directory: dir.to_path_buf(),
        warc_writer_pool_size: 1,
    }
}

async fn make_record(pool: Arc<SpoolPool>, body_len: usize) -> Record {
    let mut record = Record::new(pool);
    record.set_header("WARC-Type", "resource");
    record.write_content(&vec![b'x'; body_len]).await.unwrap();
    record.finalize_mandatory_headers().await.unwrap();
    record
}

#[tokio::test]
async fn rotates_into_multiple_files_past_size_threshold() {
    let dir = tempfile::tempdir().unwrap();
    // warc_size is in MB; 0 would fail validation elsewhere, so rotation
    // here is driven by metadata().len() already exceeding a 0-rounds-to-0
    // MB file after the first batch — use 1 and oversized records instead,
    // since the check is `>= warc_size` on whole megabytes.
    let (tx, done_rxs) = RotatorPool::start(settings(dir.path(), 1));
    let pool = Arc::new(SpoolPool::new(SpoolPolicy::default()));

    // Each batch carries a record just over 1 MB so every batch after the
    // first forces a rotation.
    for _ in 0..3 {
        let record = make_record(pool.clone(), 1024 * 1024 + 1024).await;
        tx.send(RecordBatch {
            records: vec![record],
            capture_time: chrono::Utc::now(),
            done: None,
        })
        .await
        .unwrap();
    }
    drop(tx);
    for done in done_rxs {
        done.await.unwrap();
    }

    let mut files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();

    assert!(files.len() >= 2, "expected rotation to produce multiple files, got {files:?}");
    assert!(files.iter().all(|f| !f.ends_with(".open")), "no file should be left open: {files:?}");
    assert!(files.iter().all(|f| f.starts_with("TEST-")), "files should use the configured prefix: {files:?}");
}

#[tokio::test]
async fn every_file_opens_with_a_warcinfo_record() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, done_rxs) = RotatorPool::start(settings(dir.path(), 1024));
    let pool = Arc::new(SpoolPool::new(SpoolPolicy::default()));

    let (done_tx, done_rx) = oneshot::channel();
    let record = make_record(pool, 16).await;
    tx.send(RecordBatch {
        records: vec![record],
        capture_time: chrono::Utc::now(),
        done: Some(done_tx),
    })
    .await
    .unwrap();
    done_rx.await.unwrap();
    drop(tx);
    for done in done_rxs {
        done.await.unwrap();
    }

    let entry = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
    let content = std::fs::read_to_string(entry.path()).unwrap();
    assert!(content.starts_with("WARC/1.1\r\nWARC-Type: warcinfo"), "file should open with a warcinfo record:\n{content}");
}
