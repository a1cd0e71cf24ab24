//! Writer pool: owns `poolSize` concurrent writers, each consuming batches
//! off a single shared channel and writing to its own file, rotating by
//! size and emitting one `warcinfo` record per file (§4.C).
//!
//! Generalises the teacher's single `GlobalChunkWriter` task
//! (`storage::global_writer::spawn_writer`) from one writer to a pool of
//! `poolSize` writers sharing one inbound channel: the writer-loop body is
//! unchanged in shape (drain a channel, append, rotate-on-full), only the
//! number of loops and the fan-in over a shared receiver are new.

use crate::config::{CompressionMode, RotatorSettings};
use crate::error::RotatorError;
use crate::warc::record::Record;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One record, or several, sharing a single capture time; optionally
/// acknowledged once durably written (§3).
pub struct RecordBatch {
    pub records: Vec<Record>,
    pub capture_time: chrono::DateTime<Utc>,
    pub done: Option<oneshot::Sender<()>>,
}

/// Shared state every writer task reads from: the atomic file serial and
/// the filename-collision-check lock (§5's two cross-writer locks).
struct SharedCounters {
    serial: AtomicU32,
    filename_lock: StdMutex<()>,
}

pub struct RotatorPool;

impl RotatorPool {
    /// Spawn `settings.warc_writer_pool_size` writer tasks sharing one
    /// inbound batch channel. Returns the sender callers publish batches on
    /// and one completion receiver per writer, each resolved when that
    /// writer has finished its final rename and exited.
    pub fn start(settings: RotatorSettings) -> (mpsc::Sender<RecordBatch>, Vec<oneshot::Receiver<()>>) {
        let (tx, rx) = mpsc::channel::<RecordBatch>(256);
        let shared_rx = Arc::new(AsyncMutex::new(rx));
        let counters = Arc::new(SharedCounters {
            serial: AtomicU32::new(0),
            filename_lock: StdMutex::new(()),
        });

        let mut done_rxs = Vec::with_capacity(settings.warc_writer_pool_size);
        for writer_id in 0..settings.warc_writer_pool_size {
            let (done_tx, done_rx) = oneshot::channel();
            done_rxs.push(done_rx);
            let rx = shared_rx.clone();
            let counters = counters.clone();
            let settings = settings.clone();
            tokio::spawn(async move {
                if let Err(e) = writer_loop(writer_id, settings, rx, counters).await {
                    tracing::error!(writer_id, error = %e, "writer task exited with error");
                }
                let _ = done_tx.send(());
            });
        }
        (tx, done_rxs)
    }
}

async fn writer_loop(
    writer_id: usize,
    settings: RotatorSettings,
    rx: Arc<AsyncMutex<mpsc::Receiver<RecordBatch>>>,
    counters: Arc<SharedCounters>,
) -> Result<(), RotatorError> {
    let mut file = OpenFile::create(&settings, &counters).await?;
    info!(writer_id, path = ?file.open_path, "WARC writer started");

    loop {
        let batch = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(batch) = batch else {
            break;
        };

        if file.size_mb()? >= settings.warc_size {
            file = file.rotate(&settings, &counters).await?;
        }

        for mut record in batch.records {
            record.set_header(
                "WARC-Date",
                batch.capture_time.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
            );
            record.set_header("WARC-Warcinfo-ID", format!("<urn:uuid:{}>", file.warcinfo_id));
            record.finalize_mandatory_headers().await?;
            file.write_record(&mut record, settings.compression).await?;
        }
        file.flush()?;

        if let Some(done) = batch.done {
            let _ = done.send(());
        }
    }

    file.finish()?;
    info!(writer_id, path = ?file.final_path, "WARC writer shut down");
    Ok(())
}

/// A writer's currently open output file plus everything needed to rotate
/// it (§4.C `RotatorState`).
struct OpenFile {
    writer: std::io::BufWriter<std::fs::File>,
    open_path: PathBuf,
    final_path: PathBuf,
    warcinfo_id: Uuid,
}

impl OpenFile {
    async fn create(settings: &RotatorSettings, counters: &SharedCounters) -> Result<Self, RotatorError> {
        let (open_path, final_path) = next_filename(settings, counters)?;
        std::fs::create_dir_all(&settings.output_directory)?;
        let file = std::fs::File::create(&open_path)?;
        let mut writer = std::io::BufWriter::new(file);

        let warcinfo_id = Uuid::new_v4();
        write_warcinfo(&mut writer, settings, &final_path, warcinfo_id).await?;
        writer.flush()?;

        Ok(Self {
            writer,
            open_path,
            final_path,
            warcinfo_id,
        })
    }

    fn size_mb(&self) -> Result<u64, RotatorError> {
        Ok(std::fs::metadata(&self.open_path)?.len() / (1024 * 1024))
    }

    async fn write_record(&mut self, record: &mut Record, compression: CompressionMode) -> Result<(), RotatorError> {
        let mut serialized = Vec::new();
        record.serialize(&mut serialized).await?;
        write_frame(&mut self.writer, &serialized, compression)?;
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    /// Rotate into a new file: flush/close the current one (renaming off
    /// `.open`), then open and warcinfo-stamp a fresh one.
    async fn rotate(mut self, settings: &RotatorSettings, counters: &SharedCounters) -> Result<Self, RotatorError> {
        self.writer.flush()?;
        drop(self.writer);
        std::fs::rename(&self.open_path, &self.final_path)?;
        warn!(path = ?self.final_path, "WARC file rotated");
        Self::create(settings, counters).await
    }

    /// Final close on shutdown: flush and rename off `.open`.
    fn finish(mut self) -> Result<(), RotatorError> {
        self.writer.flush()?;
        drop(self.writer);
        std::fs::rename(&self.open_path, &self.final_path)?;
        Ok(())
    }
}

fn write_frame(
    writer: &mut std::io::BufWriter<std::fs::File>,
    buf: &[u8],
    compression: CompressionMode,
) -> std::io::Result<()> {
    match compression {
        CompressionMode::None => writer.write_all(buf),
        CompressionMode::Gzip => {
            let mut enc = GzEncoder::new(writer, Compression::default());
            enc.write_all(buf)?;
            enc.finish()?;
            Ok(())
        }
        CompressionMode::Zstd => {
            let mut enc = zstd::stream::write::Encoder::new(writer, 0)?;
            enc.write_all(buf)?;
            enc.finish()?;
            Ok(())
        }
    }
}

async fn write_warcinfo(
    writer: &mut std::io::BufWriter<std::fs::File>,
    settings: &RotatorSettings,
    final_path: &PathBuf,
    warcinfo_id: Uuid,
) -> Result<(), RotatorError> {
    let filename = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let fields = format!(
        "software: warc_archiver\r\nfilename: {filename}\r\nformat: WARC File Format 1.1\r\nwarc-writer-pool-size: {}\r\n",
        settings.warc_writer_pool_size
    );

    let pool = Arc::new(crate::spool_pool::SpoolPool::new(crate::spool_pool::SpoolPolicy {
        full_on_disk: false,
        ..Default::default()
    }));
    let mut record = Record::new(pool);
    record.set_header("WARC-Type", "warcinfo");
    record.set_header("WARC-Record-ID", format!("<urn:uuid:{warcinfo_id}>"));
    record.set_header("Content-Type", "application/warc-fields");
    record.set_header("WARC-Filename", filename);

    record.write_content(fields.as_bytes()).await?;
    record.finalize_mandatory_headers().await?;
    let mut serialized = Vec::new();
    record.serialize(&mut serialized).await?;
    write_frame(writer, &serialized, settings.compression)?;

    debug!(warcinfo_id = %warcinfo_id, "warcinfo record written");
    Ok(())
}

/// Generate the next filename, retrying on collision with an
/// auto-incremented serial; guarded so two writers never race on the same
/// name (§4.C).
fn next_filename(
    settings: &RotatorSettings,
    counters: &SharedCounters,
) -> Result<(PathBuf, PathBuf), RotatorError> {
    let _guard = counters
        .filename_lock
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    let ext = match settings.compression {
        CompressionMode::None => "",
        CompressionMode::Gzip => ".gz",
        CompressionMode::Zstd => ".zst",
    };

    for _ in 0..1000 {
        let now = Utc::now();
        let ts = now.format("%Y%m%d%H%M%S");
        let nnn = now.timestamp_subsec_nanos() / 1_000_000;
        let serial = next_serial(&counters.serial);
        let final_name = format!(
            "{prefix}-{ts}{nnn:03}-{serial:05}-{hostname}.warc{ext}",
            prefix = settings.prefix,
        );
        let final_path = settings.output_directory.join(&final_name);
        let open_path = settings.output_directory.join(format!("{final_name}.open"));
        if !final_path.exists() && !open_path.exists() {
            return Ok((open_path, final_path));
        }
    }
    Err(RotatorError::FilenameExhausted(1000))
}

/// Atomically fetch-and-increment the file serial, wrapping 99999 → 0.
fn next_serial(counter: &AtomicU32) -> u32 {
    loop {
        let current = counter.load(Ordering::SeqCst);
        let next = if current >= 99999 { 0 } else { current + 1 };
        if counter
            .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return current;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_wraps_at_99999() {
        let counter = AtomicU32::new(99999);
        assert_eq!(next_serial(&counter), 99999);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn serial_increments_normally() {
        let counter = AtomicU32::new(5);
        assert_eq!(next_serial(&counter), 5);
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }
}
