//! Writer-pool fan-out (§8 scenario 5): several writer tasks share one
//! inbound batch channel; every published batch must land in exactly one
//! writer's file, and no record may be dropped or duplicated.

use std::collections::HashSet;
use std::sync::Arc;
use warc_archiver::config::{CompressionMode, RotatorSettings};
use warc_archiver::rotator::{RecordBatch, RotatorPool};
use warc_archiver::spool_pool::{SpoolPolicy, SpoolPool};
use warc_archiver::warc::reader::WarcReader;
use warc_archiver::warc::record::Record;

#[tokio::test]
async fn every_batch_is_durably_written_exactly_once_across_the_pool() {
    let dir = tempfile::tempdir().unwrap();
    let settings = RotatorSettings {
        prefix: "POOL".to_string(),
        compression: CompressionMode::None,
        warc_size: 1024,
        output_directory: dir.path().to_path_buf(),
        warc_writer_pool_size: 4,
    };
    let (tx, done_rxs) = RotatorPool::start(settings);
    let pool = Arc::new(SpoolPool::new(SpoolPolicy::default()));

    let mut expected_ids = HashSet::new();
    for i in 0..40u32 {
        let mut record = Record::new(pool.clone());
        record.set_header("WARC-Type", "resource");
        record.set_header("WARC-Target-URI", format!("urn:test:{i}"));
        record.write_content(format!("record {i}").as_bytes()).await.unwrap();
        record.finalize_mandatory_headers().await.unwrap();
        expected_ids.insert(record.header("WARC-Target-URI").unwrap().to_string());

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

    let mut seen_ids = HashSet::new();
    let mut total_non_warcinfo = 0u32;
    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        let mut reader = WarcReader::open(&path, pool.clone()).await.unwrap();
        while let Some(mut record) = reader.read_record().await.unwrap() {
            if record.header("WARC-Type") == Some("warcinfo") {
                continue;
            }
            total_non_warcinfo += 1;
            let uri = record.header("WARC-Target-URI").unwrap().to_string();
            assert!(seen_ids.insert(uri), "no record should be written twice");
        }
    }

    assert_eq!(total_non_warcinfo, 40, "every batch should survive the fan-out exactly once");
    assert_eq!(seen_ids, expected_ids);
}
