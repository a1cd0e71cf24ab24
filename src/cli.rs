//! CLI surface (§6): `run` drives the archiving client against a settings
//! file; `extract`/`verify` drive the streaming reader over existing WARC
//! files, both fanned out across a thread pool.
//!
//! Grounded in the teacher's `main.rs` for the clap-derive `Cli`/`Subcommand`
//! shape and the `tracing_subscriber::EnvFilter` init pattern; the
//! multi-file worker-pool fan-out below is grounded in the teacher's
//! `storage::chunk_pool::ChunkPool` bounded-concurrency idiom (a semaphore
//! gating a fixed number of concurrent tasks over a work list).

use crate::client::Client;
use crate::config::Settings;
use crate::warc::digest::sha1_digest_string;
use crate::warc::reader::WarcReader;
use crate::spool_pool::{SpoolPolicy, SpoolPool};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "warcprox-rs", about = "Transparent web-archiving HTTP client", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the archiving client, serving until interrupted with Ctrl-C.
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Extract record content from WARC files into a directory.
    Extract {
        files: Vec<PathBuf>,
        #[arg(short = 't', long, default_value_t = 4)]
        threads: usize,
        #[arg(short, long)]
        output: PathBuf,
        /// Only extract records whose Content-Type matches, e.g. `response`.
        #[arg(short = 'c', long = "ctype")]
        content_type: Option<String>,
        /// Nest output under a directory per WARC-Target-URI host.
        #[arg(long)]
        host_sort: bool,
        /// Suffix each filename with its block digest, to disambiguate.
        #[arg(long)]
        hash_suffix: bool,
        #[arg(long)]
        allow_overwrite: bool,
    },
    /// Verify every record's block digest and framing in WARC files.
    Verify {
        files: Vec<PathBuf>,
        #[arg(short = 't', long, default_value_t = 4)]
        threads: usize,
        #[arg(long)]
        json: bool,
    },
}

/// Dispatch a parsed [`Cli`] invocation.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run { config } => run_client(config).await,
        Command::Extract {
            files,
            threads,
            output,
            content_type,
            host_sort,
            hash_suffix,
            allow_overwrite,
        } => extract(files, threads, output, content_type, host_sort, hash_suffix, allow_overwrite).await,
        Command::Verify { files, threads, json } => verify(files, threads, json).await,
    }
}

async fn run_client(config: PathBuf) -> anyhow::Result<()> {
    let settings = Settings::from_file(&config)?;
    let client = Client::new(settings)?;

    let mut errors = client.errors().expect("errors() called once, right after construction");
    tokio::spawn(async move {
        while let Some(err) = errors.recv().await {
            warn!(url = %err.url, reason = %err.reason, "archival failed for exchange");
        }
    });

    info!("client serving, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    client.close().await;
    Ok(())
}

fn pool() -> Arc<SpoolPool> {
    Arc::new(SpoolPool::new(SpoolPolicy::default()))
}

async fn extract(
    files: Vec<PathBuf>,
    threads: usize,
    output: PathBuf,
    content_type: Option<String>,
    host_sort: bool,
    hash_suffix: bool,
    allow_overwrite: bool,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(&output)?;
    let semaphore = Arc::new(Semaphore::new(threads.max(1)));
    let mut tasks = Vec::with_capacity(files.len());

    for file in files {
        let semaphore = semaphore.clone();
        let output = output.clone();
        let content_type = content_type.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            if let Err(e) = extract_one(&file, &output, content_type.as_deref(), host_sort, hash_suffix, allow_overwrite).await {
                error!(file = %file.display(), error = %e, "extraction failed");
            }
        }));
    }
    for task in tasks {
        task.await?;
    }
    Ok(())
}

async fn extract_one(
    file: &std::path::Path,
    output: &std::path::Path,
    content_type: Option<&str>,
    host_sort: bool,
    hash_suffix: bool,
    allow_overwrite: bool,
) -> anyhow::Result<()> {
    let mut reader = WarcReader::open(file, pool()).await?;
    let mut index = 0u64;
    while let Some(mut record) = reader.read_record().await? {
        index += 1;
        if let Some(wanted) = content_type {
            if record.header("WARC-Type") != Some(wanted) {
                continue;
            }
        }

        let mut dir = output.to_path_buf();
        if host_sort {
            let host = record
                .header("WARC-Target-URI")
                .and_then(|uri| uri.parse::<http::Uri>().ok())
                .and_then(|uri| uri.host().map(str::to_string))
                .unwrap_or_else(|| "unknown-host".to_string());
            dir.push(host);
            std::fs::create_dir_all(&dir)?;
        }

        let record_id = record
            .header("WARC-Record-ID")
            .map(|id| id.trim_start_matches("<urn:uuid:").trim_end_matches('>').to_string())
            .unwrap_or_else(|| index.to_string());
        let body = record.read_all_content().await?;

        let mut filename = record_id;
        if hash_suffix {
            let digest = sha1_digest_string(&body);
            let hex = digest.split(':').nth(1).unwrap_or(&digest);
            filename.push('-');
            filename.push_str(&hex[..hex.len().min(12)]);
        }
        let path = dir.join(filename);

        if path.exists() && !allow_overwrite {
            warn!(path = %path.display(), "skipping existing file (pass --allow-overwrite to replace)");
            continue;
        }
        tokio::fs::write(&path, &body).await?;
    }
    Ok(())
}

async fn verify(files: Vec<PathBuf>, threads: usize, json: bool) -> anyhow::Result<()> {
    let semaphore = Arc::new(Semaphore::new(threads.max(1)));
    let mut tasks = Vec::with_capacity(files.len());

    for file in files {
        let semaphore = semaphore.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            verify_one(&file).await
        }));
    }

    let mut all_ok = true;
    for task in tasks {
        let (file, result) = task.await?;
        match result {
            Ok(count) if json => println!(r#"{{"file":"{}","records":{},"ok":true}}"#, file.display(), count),
            Ok(count) => info!(file = %file.display(), records = count, "verified ok"),
            Err(e) if json => {
                all_ok = false;
                println!(r#"{{"file":"{}","ok":false,"error":"{}"}}"#, file.display(), e);
            }
            Err(e) => {
                all_ok = false;
                error!(file = %file.display(), error = %e, "verification failed");
            }
        }
    }
    if !all_ok {
        anyhow::bail!("one or more WARC files failed verification");
    }
    Ok(())
}

async fn verify_one(file: &std::path::Path) -> (PathBuf, anyhow::Result<u64>) {
    let result = verify_one_inner(file).await;
    (file.to_path_buf(), result)
}

async fn verify_one_inner(file: &std::path::Path) -> anyhow::Result<u64> {
    let mut reader = WarcReader::open(file, pool()).await?;
    let mut count = 0u64;
    while let Some(mut record) = reader.read_record().await? {
        count += 1;
        let expected = record
            .header("WARC-Block-Digest")
            .ok_or_else(|| anyhow::anyhow!("record {count} missing WARC-Block-Digest"))?
            .to_string();
        let body = record.read_all_content().await?;
        let actual = sha1_digest_string(&body);
        if actual != expected {
            anyhow::bail!("record {count} digest mismatch: expected {expected}, computed {actual}");
        }
    }
    Ok(count)
}
