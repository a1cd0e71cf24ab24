//! HTTP client facade (§4.H): a thin wrapper over `hyper`'s connection-level
//! API, not a black-box client, so the dialer/tee sits inside the connect
//! step of every exchange and every response is archived as a side effect.
//!
//! Grounded in the teacher's `manager::Manager` for the
//! new/serving/closing/closed lifecycle shape, generalised from
//! camera-session lifecycle to per-exchange capture-task lifecycle. The
//! custom-transport pattern of wiring a dialer underneath the client is
//! grounded in the pack's `jhol/http_client.rs` and `tangram_history/client.rs`
//! files; both build on `reqwest`, but this crate already speaks
//! `hyper`/`hyper-util` everywhere else (§4.D's CDX client), so the facade
//! stays on that stack instead of adding a second HTTP client dependency —
//! recorded as a deviation in DESIGN.md.
//!
//! Each exchange dials its own connection and sends `Connection: close`,
//! rather than pooling keep-alive connections the way `jhol/http_client.rs`
//! does: the capture pipeline reads each tee'd pipe until EOF as exactly one
//! request/response pair (§4.G), which keep-alive reuse would violate.

use crate::capture::{self, CaptureContext};
use crate::config::Settings;
use crate::dedupe::DedupeIndex;
use crate::dial::Dialer;
use crate::dns::{DnsResolver, HickoryTransport};
use crate::error::{ClientError, ExchangeError};
use crate::rotator::{RecordBatch, RotatorPool};
use crate::spool_pool::{SpoolPolicy, SpoolPool};
use crate::tee::{TeeStream, DEFAULT_PIPE_CAPACITY};
use bytes::Bytes;
use http::{HeaderValue, Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tracing::warn;

const NEW: u8 = 0;
const SERVING: u8 = 1;
const CLOSING: u8 = 2;
const CLOSED: u8 = 3;

/// Either leg of a dial: plain TCP or TLS-wrapped TCP, unified so the tee
/// wraps one concrete type regardless of scheme.
enum Conn {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Conn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_flush(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Conn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// The transparent archiving HTTP client. One instance owns one rotator
/// pool, one dedupe index, one DNS resolver — all per-client, never
/// process-wide (§9).
pub struct Client {
    settings: Settings,
    dialer: Dialer,
    resolver: Arc<DnsResolver<HickoryTransport>>,
    dedupe: Arc<DedupeIndex>,
    pool: Arc<SpoolPool>,
    batch_tx: StdMutex<Option<mpsc::Sender<RecordBatch>>>,
    writer_done: StdMutex<Vec<oneshot::Receiver<()>>>,
    error_tx: StdMutex<Option<mpsc::Sender<ExchangeError>>>,
    error_rx: StdMutex<Option<mpsc::Receiver<ExchangeError>>>,
    in_flight: StdMutex<Vec<JoinHandle<()>>>,
    state: AtomicU8,
}

impl Client {
    /// Validate settings, spin up the writer pool, and build the dialer /
    /// resolver / dedupe collaborators. The client starts in `serving`.
    pub fn new(settings: Settings) -> Result<Arc<Self>, ClientError> {
        settings.validate()?;

        let pool = Arc::new(SpoolPool::new(SpoolPolicy {
            max_in_memory: settings.max_in_memory,
            full_on_disk: settings.full_on_disk,
            temp_dir: settings.temp_dir.clone(),
            ..Default::default()
        }));

        let (batch_tx, writer_done) = RotatorPool::start(settings.rotator.clone());
        // unbounded in spirit: the caller MUST drain this, backpressure is
        // provided by the bounded capacity instead of by blocking callers.
        let (error_tx, error_rx) = mpsc::channel(256);

        let dedupe = Arc::new(DedupeIndex::new(&settings.dedupe));
        let resolver = Arc::new(DnsResolver::new(&settings, batch_tx.clone(), pool.clone()));
        let dialer = Dialer::new(&settings).map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Arc::new(Self {
            settings,
            dialer,
            resolver,
            dedupe,
            pool,
            batch_tx: StdMutex::new(Some(batch_tx)),
            writer_done: StdMutex::new(writer_done),
            error_tx: StdMutex::new(Some(error_tx)),
            error_rx: StdMutex::new(Some(error_rx)),
            in_flight: StdMutex::new(Vec::new()),
            state: AtomicU8::new(SERVING),
        }))
    }

    /// Take the error-channel receiver. Callers MUST keep draining it for
    /// the client's lifetime — capture failures that can't be delivered here
    /// are logged and dropped (§7).
    pub fn errors(&self) -> Option<mpsc::Receiver<ExchangeError>> {
        self.error_rx.lock().unwrap().take()
    }

    /// Perform one HTTP exchange, archiving it as a side effect.
    ///
    /// `Accept-Encoding` is forced to `gzip`; redirects are never followed
    /// (the caller decides, same as any connection-level hyper client). If
    /// `feedback` is `true`, the returned receiver resolves once the
    /// resulting records have been durably written.
    pub async fn do_request(
        self: &Arc<Self>,
        mut request: Request<Full<Bytes>>,
        feedback: bool,
    ) -> Result<(Response<Incoming>, Option<oneshot::Receiver<()>>), ClientError> {
        if self.state.load(Ordering::SeqCst) != SERVING {
            return Err(ClientError::Config("client is not in the serving state".into()));
        }

        request.headers_mut().insert(http::header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        request.headers_mut().insert(http::header::CONNECTION, HeaderValue::from_static("close"));

        let uri = request.uri().clone();
        let host = uri
            .host()
            .ok_or_else(|| ClientError::Config("request URI has no host".into()))?
            .to_string();
        let is_tls = uri.scheme_str() == Some("https");
        let port = uri.port_u16().unwrap_or(if is_tls { 443 } else { 80 });
        let host_port = format!("{host}:{port}");

        let tcp = self
            .dialer
            .dial_tcp(&self.resolver, &host_port)
            .await
            .map_err(|e| ClientError::Config(e.to_string()))?;
        // peer_addr() on a proxied dial reports the proxy, not the target;
        // WARC-IP-Address must only be stamped for direct connections (§4.G).
        let remote_ip = if self.settings.proxy.is_some() {
            None
        } else {
            tcp.peer_addr().ok().map(|a| a.ip())
        };

        let conn = if is_tls {
            Conn::Tls(Box::new(
                self.dialer.dial_tls(tcp, &host).await.map_err(|e| ClientError::Config(e.to_string()))?,
            ))
        } else {
            Conn::Plain(tcp)
        };

        let (tee, pipes) = TeeStream::wrap(conn, DEFAULT_PIPE_CAPACITY);
        let io = TokioIo::new(tee);

        let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ClientError::Config(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "connection driver exited with error");
            }
        });

        let (feedback_tx, feedback_rx) = if feedback {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let batch_tx = self
            .batch_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ClientError::Config("client is closing".into()))?;
        let error_tx = self
            .error_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ClientError::Config("client is closing".into()))?;

        let ctx = Arc::new(capture::context_from_settings(
            &self.settings,
            self.pool.clone(),
            self.dedupe.clone(),
            batch_tx,
            error_tx,
            remote_ip,
            feedback_tx,
        ));
        let connection_url = uri.to_string();
        let capture_task = tokio::spawn(capture::run(ctx, pipes.request_reader, pipes.response_reader, connection_url));
        self.in_flight.lock().unwrap().push(capture_task);

        let response = sender.send_request(request).await.map_err(|e| ClientError::Config(e.to_string()))?;
        Ok((response, feedback_rx))
    }

    /// Drain in-flight capture tasks, close the batch channel, wait for
    /// every writer to finish its final rename, then close the error
    /// channel. Idempotent.
    pub async fn close(&self) {
        if self.state.swap(CLOSING, Ordering::SeqCst) == CLOSED {
            return;
        }

        let tasks = std::mem::take(&mut *self.in_flight.lock().unwrap());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "capture task panicked during shutdown");
            }
        }

        // Dropping our clone lets the channel close once every other
        // holder (the DNS resolver's side-effect sender) also drops.
        self.batch_tx.lock().unwrap().take();

        let done_rxs = std::mem::take(&mut *self.writer_done.lock().unwrap());
        for done in done_rxs {
            let _ = done.await;
        }

        self.error_tx.lock().unwrap().take();
        self.state.store(CLOSED, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompressionMode, DedupeOptions, RotatorSettings};

    fn test_settings(dir: &std::path::Path) -> Settings {
        Settings {
            rotator: RotatorSettings {
                prefix: "TEST".to_string(),
                compression: CompressionMode::None,
                warc_size: 1024,
                output_directory: dir.to_path_buf(),
                warc_writer_pool_size: 1,
            },
            dedupe: DedupeOptions::default(),
            proxy: None,
            decompress_body: false,
            skip_http_status_codes: Vec::new(),
            verify_certs: true,
            temp_dir: dir.to_path_buf(),
            full_on_disk: false,
            max_in_memory: 1024 * 1024,
            force_ipv4: false,
            dns_servers: Vec::new(),
            dns_cache_ttl_secs: 300,
            dns_query_timeout_secs: 2,
            any_ip: false,
        }
    }

    #[tokio::test]
    async fn new_client_starts_serving_and_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new(test_settings(dir.path())).unwrap();
        assert_eq!(client.state.load(Ordering::SeqCst), SERVING);
        client.close().await;
        assert_eq!(client.state.load(Ordering::SeqCst), CLOSED);
        client.close().await;
        assert_eq!(client.state.load(Ordering::SeqCst), CLOSED);
    }

    #[tokio::test]
    async fn do_request_rejected_once_closing() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new(test_settings(dir.path())).unwrap();
        client.close().await;

        let request = Request::builder()
            .uri("http://example.invalid/")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let result = client.do_request(request, false).await;
        assert!(result.is_err());
    }
}
