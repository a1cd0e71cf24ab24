//! Top-level settings tree, loadable from TOML.

use crate::error::ClientError;
use serde::Deserialize;
use std::path::PathBuf;

/// Everything the HTTP client facade needs to start.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub rotator: RotatorSettings,
    #[serde(default)]
    pub dedupe: DedupeOptions,
    /// SOCKS5 proxy URL, e.g. `socks5://127.0.0.1:1080`.
    #[serde(default)]
    pub proxy: Option<String>,
    /// Transport auto-decompression of `Content-Encoding`.
    #[serde(default)]
    pub decompress_body: bool,
    /// HTTP status codes that abort archival of the exchange.
    #[serde(default)]
    pub skip_http_status_codes: Vec<u16>,
    /// Verify TLS certificates and hostname.
    #[serde(default = "default_verify_certs")]
    pub verify_certs: bool,
    /// Directory for spooled-to-disk record content.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Force every record body to disk regardless of size.
    #[serde(default)]
    pub full_on_disk: bool,
    /// Cap on in-memory bytes per spooled buffer before promotion.
    #[serde(default = "default_max_in_memory")]
    pub max_in_memory: u64,
    /// Pin dials to tcp4 only.
    #[serde(default)]
    pub force_ipv4: bool,
    /// DNS servers to query, in preference order.
    #[serde(default)]
    pub dns_servers: Vec<String>,
    /// How long a resolved DNS answer is cached.
    #[serde(default = "default_dns_cache_ttl_secs")]
    pub dns_cache_ttl_secs: u64,
    /// Per-query DNS timeout.
    #[serde(default = "default_dns_query_timeout_secs")]
    pub dns_query_timeout_secs: u64,
    /// Enable AnyIP random host-suffix selection for IPv6 local addresses.
    #[serde(default)]
    pub any_ip: bool,
}

/// Rotator / writer-pool parameters (§4.C).
#[derive(Debug, Deserialize, Clone)]
pub struct RotatorSettings {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// `""`, `GZIP`, or `ZSTD`.
    #[serde(default)]
    pub compression: CompressionMode,
    /// MB threshold for rotation.
    #[serde(default = "default_warc_size")]
    pub warc_size: u64,
    pub output_directory: PathBuf,
    #[serde(default = "default_pool_size")]
    pub warc_writer_pool_size: usize,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompressionMode {
    #[default]
    #[serde(alias = "")]
    None,
    Gzip,
    Zstd,
}

/// Deduplication parameters (§4.D).
#[derive(Debug, Deserialize, Clone)]
pub struct DedupeOptions {
    #[serde(default)]
    pub local_dedupe: bool,
    #[serde(default)]
    pub cdx_dedupe: bool,
    #[serde(default)]
    pub cdx_url: Option<String>,
    #[serde(default = "default_size_threshold")]
    pub size_threshold: u64,
}

impl Default for DedupeOptions {
    fn default() -> Self {
        Self {
            local_dedupe: false,
            cdx_dedupe: false,
            cdx_url: None,
            size_threshold: default_size_threshold(),
        }
    }
}

fn default_verify_certs() -> bool {
    true
}
fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}
fn default_max_in_memory() -> u64 {
    1024 * 1024
}
fn default_prefix() -> String {
    "CRAWL".to_string()
}
fn default_warc_size() -> u64 {
    1024
}
fn default_pool_size() -> usize {
    1
}
fn default_size_threshold() -> u64 {
    1024
}
fn default_dns_cache_ttl_secs() -> u64 {
    300
}
fn default_dns_query_timeout_secs() -> u64 {
    2
}

impl Settings {
    /// Load settings from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ClientError> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings =
            toml::from_str(&content).map_err(|e| ClientError::Config(format!("invalid TOML: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.rotator.warc_size == 0 {
            return Err(ClientError::Config("rotator.warc_size must be > 0".into()));
        }
        if self.rotator.warc_writer_pool_size == 0 {
            return Err(ClientError::Config(
                "rotator.warc_writer_pool_size must be > 0".into(),
            ));
        }
        if self.dedupe.cdx_dedupe && self.dedupe.cdx_url.is_none() {
            return Err(ClientError::Config(
                "dedupe.cdx_url is required when cdx_dedupe is enabled".into(),
            ));
        }
        if !self.temp_dir.exists() {
            std::fs::create_dir_all(&self.temp_dir)?;
        }
        Ok(())
    }
}
