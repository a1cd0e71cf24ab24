//! DNS resolver with archival side effects (§4.E).
//!
//! The wire-protocol client itself is out of scope — we specify only what
//! we require of it via [`DnsTransport`] — so [`HickoryTransport`] is a thin
//! adapter over `hickory-proto`'s message encode/decode, used instead of
//! hand-rolling a DNS wire parser.

use crate::error::DnsError;
use crate::rotator::RecordBatch;
use crate::spool_pool::SpoolPool;
use crate::warc::record::Record;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncodable, BinEncoder};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct DnsAnswer {
    pub ips: Vec<IpAddr>,
    pub raw_wire: Vec<u8>,
}

#[derive(Debug, Clone)]
struct DnsCacheEntry {
    ip: IpAddr,
    expires_at: Instant,
}

/// What the resolver requires of a wire-protocol client: send one query of
/// `qtype` for `host` to `server` and return its decoded answer.
pub trait DnsTransport: Send + Sync + Clone {
    fn query(
        &self,
        server: SocketAddr,
        host: &str,
        qtype: RecordType,
        timeout: Duration,
    ) -> impl std::future::Future<Output = std::io::Result<DnsAnswer>> + Send;
}

/// `DnsTransport` backed by `hickory-proto`'s message codec over a one-shot
/// UDP socket per query.
#[derive(Default)]
pub struct HickoryTransport;

impl DnsTransport for HickoryTransport {
    async fn query(
        &self,
        server: SocketAddr,
        host: &str,
        qtype: RecordType,
        timeout: Duration,
    ) -> std::io::Result<DnsAnswer> {
        let name = Name::from_str(host)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;

        let mut message = Message::new();
        message.set_id(rand::random());
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.set_recursion_desired(true);
        message.add_query(Query::query(name, qtype));

        let mut buf = Vec::with_capacity(128);
        {
            let mut encoder = BinEncoder::new(&mut buf);
            message
                .emit(&mut encoder)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        }

        let bind_addr: SocketAddr = if server.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" }.parse().unwrap();
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server).await?;
        socket.send(&buf).await?;

        let mut recv_buf = vec![0u8; 4096];
        let n = tokio::time::timeout(timeout, socket.recv(&mut recv_buf))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "dns query timed out"))??;
        recv_buf.truncate(n);

        let mut decoder = BinDecoder::new(&recv_buf);
        let response = Message::read(&mut decoder)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

        let ips = response
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                Some(RData::A(A(addr))) => Some(IpAddr::V4(*addr)),
                Some(RData::AAAA(AAAA(addr))) => Some(IpAddr::V6(*addr)),
                _ => None,
            })
            .collect();

        Ok(DnsAnswer { ips, raw_wire: recv_buf })
    }
}

/// Resolves `host:port` strings to a single IP, consulting a TTL-bounded
/// cache and persisting every raw answer as a WARC `resource` record (§4.E).
pub struct DnsResolver<T: DnsTransport = HickoryTransport> {
    transport: T,
    servers: Vec<SocketAddr>,
    force_ipv4: bool,
    ttl: Duration,
    query_timeout: Duration,
    cache: RwLock<HashMap<String, DnsCacheEntry>>,
    side_effects: mpsc::Sender<RecordBatch>,
    pool: Arc<SpoolPool>,
}

impl DnsResolver<HickoryTransport> {
    pub fn new(settings: &crate::config::Settings, side_effects: mpsc::Sender<RecordBatch>, pool: Arc<SpoolPool>) -> Self {
        Self::with_transport(HickoryTransport, settings, side_effects, pool)
    }
}

impl<T: DnsTransport> DnsResolver<T> {
    pub fn with_transport(
        transport: T,
        settings: &crate::config::Settings,
        side_effects: mpsc::Sender<RecordBatch>,
        pool: Arc<SpoolPool>,
    ) -> Self {
        let servers = settings
            .dns_servers
            .iter()
            .filter_map(|s| s.parse::<SocketAddr>().ok())
            .collect();
        Self {
            transport,
            servers,
            force_ipv4: settings.force_ipv4,
            ttl: Duration::from_secs(settings.dns_cache_ttl_secs),
            query_timeout: Duration::from_secs(settings.dns_query_timeout_secs),
            cache: RwLock::new(HashMap::new()),
            side_effects,
            pool,
        }
    }

    /// Resolve `host:port` (or a bare host) to a single IP address.
    pub async fn resolve(&self, host_port: &str) -> Result<IpAddr, DnsError> {
        let host = strip_port(host_port);

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        if let Some(entry) = self.cache.read().get(&host) {
            if entry.expires_at > Instant::now() {
                return Ok(entry.ip);
            }
        }

        if self.servers.is_empty() {
            return Err(DnsError::NoServers);
        }

        let fanout = std::cmp::min(3, self.servers.len().saturating_sub(1)) + 1;
        let candidates = &self.servers[..fanout.min(self.servers.len())];

        let mut join_set = tokio::task::JoinSet::new();
        for &server in candidates {
            let host = host.clone();
            let force_ipv4 = self.force_ipv4;
            join_set.spawn(query_one_server(self.clone_transport(), server, host, force_ipv4, self.query_timeout));
        }

        let mut winning: Option<(Option<DnsAnswer>, Option<DnsAnswer>)> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok((a, aaaa))) if a.is_some() || aaaa.is_some() => {
                    winning = Some((a, aaaa));
                    break;
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => warn!(error = %e, "dns query failed, trying next server"),
                Err(e) => warn!(error = %e, "dns query task panicked"),
            }
        }
        join_set.abort_all();

        let (a_answer, aaaa_answer) = winning.ok_or_else(|| DnsError::Unresolvable(host.clone()))?;

        if let Some(answer) = &a_answer {
            self.emit_resource_record(&host, "A", answer).await;
        }
        if let Some(answer) = &aaaa_answer {
            self.emit_resource_record(&host, "AAAA", answer).await;
        }

        let chosen = if !self.force_ipv4 {
            aaaa_answer
                .as_ref()
                .and_then(|a| a.ips.first().copied())
                .or_else(|| a_answer.as_ref().and_then(|a| a.ips.first().copied()))
        } else {
            a_answer.as_ref().and_then(|a| a.ips.first().copied())
        };

        let ip = chosen.ok_or_else(|| DnsError::Unresolvable(host.clone()))?;
        self.cache.write().insert(
            host,
            DnsCacheEntry {
                ip,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(ip)
    }

    async fn emit_resource_record(&self, host: &str, qtype: &str, answer: &DnsAnswer) {
        let mut record = Record::new(self.pool.clone());
        record.set_header("WARC-Type", "resource");
        record.set_header("Content-Type", "text/dns");
        record.set_header("WARC-Target-URI", format!("dns:{host}?TYPE={qtype}"));
        if let Err(e) = record.write_content(&answer.raw_wire).await {
            warn!(error = %e, "failed to spool dns resource record body");
            return;
        }
        if let Err(e) = record.finalize_mandatory_headers().await {
            warn!(error = %e, "failed to finalise dns resource record headers");
            return;
        }
        let batch = RecordBatch {
            records: vec![record],
            capture_time: chrono::Utc::now(),
            done: None,
        };
        if self.side_effects.send(batch).await.is_err() {
            debug!("writer pool closed, dropping dns side-effect record");
        }
    }
}

impl<T: DnsTransport> DnsResolver<T> {
    /// `T` is typically zero-sized ([`HickoryTransport`]); cloning it per
    /// spawned task avoids threading lifetimes through `tokio::spawn`.
    fn clone_transport(&self) -> T {
        self.transport.clone()
    }
}

impl Clone for HickoryTransport {
    fn clone(&self) -> Self {
        HickoryTransport
    }
}

async fn query_one_server<T: DnsTransport>(
    transport: T,
    server: SocketAddr,
    host: String,
    force_ipv4: bool,
    timeout: Duration,
) -> Result<(Option<DnsAnswer>, Option<DnsAnswer>), DnsError> {
    let a_future = transport.query(server, &host, RecordType::A, timeout);
    if force_ipv4 {
        let a = a_future.await.ok();
        return Ok((a, None));
    }
    let aaaa_future = transport.query(server, &host, RecordType::AAAA, timeout);
    let (a, aaaa) = tokio::join!(a_future, aaaa_future);
    Ok((a.ok(), aaaa.ok()))
}

/// Strip a trailing `:port`, respecting bracketed IPv6 literals
/// (`[::1]:443` → `::1`).
fn strip_port(host_port: &str) -> String {
    if let Some(rest) = host_port.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }
    match host_port.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !host.contains(':') => host.to_string(),
        _ => host_port.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_plain_port() {
        assert_eq!(strip_port("example.com:443"), "example.com");
    }

    #[test]
    fn strips_bracketed_ipv6_port() {
        assert_eq!(strip_port("[::1]:443"), "::1");
    }

    #[test]
    fn leaves_bare_ipv6_alone() {
        assert_eq!(strip_port("::1"), "::1");
    }

    #[test]
    fn leaves_bare_host_alone() {
        assert_eq!(strip_port("example.com"), "example.com");
    }
}
