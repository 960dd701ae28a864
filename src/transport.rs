//! # Transport Dialers
//!
//! One dialer per transport technology, all implementing the same small
//! capability contract so the selector can treat them uniformly:
//!
//! | Dialer | Reaches peers via |
//! |--------|-------------------|
//! | [`QuicDialer`] | direct QUIC with identity-bound TLS |
//! | [`TorDialer`] | local Tor SOCKS5 proxy, per-destination circuit isolation |
//! | [`I2pDialer`] | local I2P SOCKS5 proxy |
//! | [`WsTunnelDialer`] | WebSocket tunnel server for restrictive networks |
//! | [`FrontedHttpDialer`] | domain-fronted HTTPS bridge |
//! | [`ObfsDialer`] | external pluggable-obfuscation helper process |
//!
//! No dialer is aware of any other; the selector holds them as trait objects
//! and composes availability, policy, and downgrade checks on top.
//!
//! ## Circuit Isolation
//!
//! The Tor dialer derives SOCKS5 credentials from `BLAKE3(session_key ||
//! destination)`. Tor isolates streams with different credentials onto
//! different circuits, so unrelated destinations never share a circuit and
//! cannot be correlated by an exit.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use async_trait::async_trait;
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::descriptor::{TransportEndpoint, TransportKind};
use crate::identity::{Keypair, PeerId};
use crate::pinning::{fingerprint, PinFingerprint};
use crate::tls;

/// Probe timeout for local proxy availability checks.
const AVAILABILITY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for validating the obfuscation helper binary.
const HELPER_VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Streams
// ============================================================================

/// Object-safe duplex byte stream trait for dialed connections.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// The byte stream a dialer yields.
pub type MeshStream = Box<dyn StreamIo>;

/// An established connection plus the transport-layer identity evidence.
pub struct MeshConnection {
    pub stream: MeshStream,
    pub kind: TransportKind,
    /// Fingerprint of the certificate key the remote presented, for
    /// transports that surface one (QUIC). Proxied transports authenticate
    /// on the inner handshake instead.
    pub cert_fingerprint: Option<PinFingerprint>,
}

impl std::fmt::Debug for MeshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshConnection")
            .field("stream", &"<dyn StreamIo>")
            .field("kind", &self.kind)
            .field("cert_fingerprint", &self.cert_fingerprint)
            .finish()
    }
}

/// Bidirectional QUIC stream adapter.
struct QuicStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    /// Held so the connection outlives the stream.
    _connection: quinn::Connection,
}

impl AsyncRead for QuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}

/// Byte-stream adapter over a WebSocket: writes become binary messages,
/// binary messages become readable bytes. Control frames are consumed.
pub struct WsByteStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
    read_buf: Vec<u8>,
    read_pos: usize,
}

impl WsByteStream {
    pub fn new(inner: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self {
            inner,
            read_buf: Vec::new(),
            read_pos: 0,
        }
    }
}

impl AsyncRead for WsByteStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.read_pos < this.read_buf.len() {
                let n = buf.remaining().min(this.read_buf.len() - this.read_pos);
                buf.put_slice(&this.read_buf[this.read_pos..this.read_pos + n]);
                this.read_pos += n;
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    this.read_buf = data;
                    this.read_pos = 0;
                }
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Poll::Ready(Err(io::Error::other(e))),
            }
        }
    }
}

impl AsyncWrite for WsByteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(io::Error::other)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(io::Error::other)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner)
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}

// ============================================================================
// Dialer Contract
// ============================================================================

/// Counters every dialer keeps. Snapshot with [`Dialer::statistics`].
#[derive(Debug, Default)]
pub struct DialerCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialerStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

impl DialerCounters {
    fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_outcome(&self, success: bool) {
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> DialerStats {
        DialerStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Uniform dial contract implemented by every transport.
#[async_trait]
pub trait Dialer: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Type and validity-window check: can this dialer take the endpoint.
    fn can_handle(&self, endpoint: &TransportEndpoint) -> bool {
        endpoint.transport == self.kind() && endpoint.is_valid_at(crate::identity::now_ms())
    }

    /// Liveness probe (local proxy reachable, helper present, ...).
    async fn is_available(&self) -> bool;

    /// Open a stream to the endpoint without identity expectations.
    async fn dial(&self, endpoint: &TransportEndpoint, dial_timeout: Duration)
        -> Result<MeshConnection>;

    /// Open a stream expecting `peer`, verifying the presented certificate
    /// against `pins` where the transport surfaces one.
    async fn dial_with_pins(
        &self,
        endpoint: &TransportEndpoint,
        peer: &PeerId,
        pins: &[PinFingerprint],
        dial_timeout: Duration,
    ) -> Result<MeshConnection> {
        let _ = (peer, pins);
        self.dial(endpoint, dial_timeout).await
    }

    fn statistics(&self) -> DialerStats;
}

// ============================================================================
// Transport Configuration
// ============================================================================

/// Per-transport configuration supplied by the host application.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    pub enable_quic: bool,
    pub enable_tor: bool,
    pub enable_i2p: bool,
    pub enable_ws_tunnel: bool,
    pub enable_fronted_http: bool,
    pub enable_obfs: bool,
    /// Local Tor SOCKS5 proxy, e.g. "127.0.0.1:9050".
    pub tor_proxy: Option<String>,
    /// Local I2P SOCKS5 proxy, e.g. "127.0.0.1:4447".
    pub i2p_proxy: Option<String>,
    /// WebSocket tunnel server URL, e.g. "wss://tunnel.example.net/mesh".
    pub ws_tunnel_url: Option<String>,
    /// Extra headers sent on the WebSocket upgrade.
    pub ws_headers: HashMap<String, String>,
    /// Popular domain presented on the wire for fronted dials.
    pub front_domain: Option<String>,
    /// Real bridge host reached behind the front.
    pub front_bridge_host: Option<String>,
    /// Path to the pluggable-obfuscation helper binary.
    pub obfs_helper_path: Option<PathBuf>,
    /// Local SOCKS5 listener exposed by the helper.
    pub obfs_proxy: Option<String>,
    /// Bridge lines passed to the helper as per-dial credentials.
    pub obfs_bridges: Vec<String>,
}

// ============================================================================
// QUIC Direct Dialer
// ============================================================================

/// Direct encrypted transport: QUIC with identity-bound mutual TLS.
pub struct QuicDialer {
    endpoint: quinn::Endpoint,
    client_config: quinn::ClientConfig,
    counters: DialerCounters,
}

impl QuicDialer {
    pub fn new(keypair: &Keypair) -> Result<Self> {
        let (certs, key) = tls::generate_identity_cert(keypair)?;
        let client_config = tls::create_client_config(certs, key)?;
        let endpoint = quinn::Endpoint::client(
            "0.0.0.0:0"
                .parse::<SocketAddr>()
                .expect("static address parses"),
        )
        .context("failed to bind QUIC client endpoint")?;
        Ok(Self {
            endpoint,
            client_config,
            counters: DialerCounters::default(),
        })
    }

    async fn resolve(endpoint: &TransportEndpoint) -> Result<SocketAddr> {
        let mut addrs = tokio::net::lookup_host(endpoint.addr())
            .await
            .with_context(|| format!("failed to resolve {}", endpoint.addr()))?;
        addrs
            .next()
            .ok_or_else(|| anyhow!("no addresses for {}", endpoint.addr()))
    }
}

#[async_trait]
impl Dialer for QuicDialer {
    fn kind(&self) -> TransportKind {
        TransportKind::Quic
    }

    async fn is_available(&self) -> bool {
        // The endpoint is bound at construction; nothing external to probe.
        true
    }

    async fn dial(
        &self,
        _endpoint: &TransportEndpoint,
        _dial_timeout: Duration,
    ) -> Result<MeshConnection> {
        // The direct transport always authenticates the remote identity;
        // there is no anonymous dial.
        bail!("QUIC transport requires the expected peer identity; use dial_with_pins")
    }

    async fn dial_with_pins(
        &self,
        endpoint: &TransportEndpoint,
        peer: &PeerId,
        pins: &[PinFingerprint],
        dial_timeout: Duration,
    ) -> Result<MeshConnection> {
        self.counters.record_attempt();
        let result = timeout(dial_timeout, async {
            let addr = Self::resolve(endpoint).await?;
            let sni = tls::peer_to_sni(peer);
            let connection = self
                .endpoint
                .connect_with(self.client_config.clone(), addr, &sni)
                .with_context(|| format!("failed to initiate connection to {}", addr))?
                .await
                .with_context(|| format!("failed to establish connection to {}", addr))?;

            let verified = tls::extract_verified_peer(&connection)
                .ok_or_else(|| anyhow!("connection carries no verifiable peer certificate"))?;
            if verified != *peer {
                bail!("remote identity {} does not match expected {}", verified, peer);
            }
            let presented = fingerprint(verified.as_bytes());
            if !pins.is_empty() && !pins.contains(&presented) {
                bail!("remote certificate does not match any descriptor pin");
            }

            let (send, recv) = connection
                .open_bi()
                .await
                .context("failed to open control stream")?;

            Ok(MeshConnection {
                stream: Box::new(QuicStream {
                    send,
                    recv,
                    _connection: connection,
                }) as MeshStream,
                kind: TransportKind::Quic,
                cert_fingerprint: Some(presented),
            })
        })
        .await
        .map_err(|_| anyhow!("dial timed out"))
        .and_then(|r| r);

        self.counters.record_outcome(result.is_ok());
        result
    }

    fn statistics(&self) -> DialerStats {
        self.counters.snapshot()
    }
}

// ============================================================================
// SOCKS5-Proxied Dialers (Tor, I2P)
// ============================================================================

async fn probe_tcp(addr: &str) -> bool {
    matches!(
        timeout(AVAILABILITY_PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Tor transport via the local SOCKS5 proxy.
///
/// Stream isolation: credentials are derived deterministically from a
/// per-session key and the destination, so repeated dials to one destination
/// reuse a circuit while distinct destinations are isolated from each other.
pub struct TorDialer {
    proxy: String,
    session_key: [u8; 32],
    counters: DialerCounters,
}

impl TorDialer {
    pub fn new(proxy: String) -> Self {
        let mut session_key = [0u8; 32];
        let _ = getrandom::getrandom(&mut session_key);
        Self {
            proxy,
            session_key,
            counters: DialerCounters::default(),
        }
    }

    /// Deterministic per-destination SOCKS credentials.
    fn isolation_credentials(&self, destination: &str) -> (String, String) {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.session_key);
        hasher.update(destination.as_bytes());
        let digest = hasher.finalize();
        let bytes = digest.as_bytes();
        (hex::encode(&bytes[..8]), hex::encode(&bytes[8..16]))
    }
}

#[async_trait]
impl Dialer for TorDialer {
    fn kind(&self) -> TransportKind {
        TransportKind::Tor
    }

    async fn is_available(&self) -> bool {
        probe_tcp(&self.proxy).await
    }

    async fn dial(
        &self,
        endpoint: &TransportEndpoint,
        dial_timeout: Duration,
    ) -> Result<MeshConnection> {
        self.counters.record_attempt();
        let destination = endpoint.addr();
        let (username, password) = self.isolation_credentials(&destination);

        let result = timeout(dial_timeout, async {
            let stream = tokio_socks::tcp::Socks5Stream::connect_with_password(
                self.proxy.as_str(),
                (endpoint.host.as_str(), endpoint.port),
                &username,
                &password,
            )
            .await
            .with_context(|| format!("SOCKS5 connect to {} via Tor failed", destination))?;
            trace!(destination = %destination, "tor stream established");
            Ok(MeshConnection {
                stream: Box::new(stream) as MeshStream,
                kind: TransportKind::Tor,
                cert_fingerprint: None,
            })
        })
        .await
        .map_err(|_| anyhow!("dial timed out"))
        .and_then(|r| r);

        self.counters.record_outcome(result.is_ok());
        result
    }

    fn statistics(&self) -> DialerStats {
        self.counters.snapshot()
    }
}

/// I2P transport via the local SOCKS5 proxy.
pub struct I2pDialer {
    proxy: String,
    counters: DialerCounters,
}

impl I2pDialer {
    pub fn new(proxy: String) -> Self {
        Self {
            proxy,
            counters: DialerCounters::default(),
        }
    }
}

#[async_trait]
impl Dialer for I2pDialer {
    fn kind(&self) -> TransportKind {
        TransportKind::I2p
    }

    async fn is_available(&self) -> bool {
        probe_tcp(&self.proxy).await
    }

    async fn dial(
        &self,
        endpoint: &TransportEndpoint,
        dial_timeout: Duration,
    ) -> Result<MeshConnection> {
        self.counters.record_attempt();
        let result = timeout(dial_timeout, async {
            let stream = tokio_socks::tcp::Socks5Stream::connect(
                self.proxy.as_str(),
                (endpoint.host.as_str(), endpoint.port),
            )
            .await
            .with_context(|| format!("SOCKS5 connect to {} via I2P failed", endpoint.addr()))?;
            Ok(MeshConnection {
                stream: Box::new(stream) as MeshStream,
                kind: TransportKind::I2p,
                cert_fingerprint: None,
            })
        })
        .await
        .map_err(|_| anyhow!("dial timed out"))
        .and_then(|r| r);

        self.counters.record_outcome(result.is_ok());
        result
    }

    fn statistics(&self) -> DialerStats {
        self.counters.snapshot()
    }
}

// ============================================================================
// WebSocket Tunnel Dialer
// ============================================================================

/// WebSocket tunnel for networks where UDP and exotic TCP are blocked.
/// The endpoint host/port are passed to the tunnel server via headers;
/// the tunnel relays opaque binary frames.
pub struct WsTunnelDialer {
    tunnel_url: String,
    headers: HashMap<String, String>,
    counters: DialerCounters,
}

impl WsTunnelDialer {
    pub fn new(tunnel_url: String, headers: HashMap<String, String>) -> Self {
        Self {
            tunnel_url,
            headers,
            counters: DialerCounters::default(),
        }
    }

    fn tunnel_host(&self) -> Option<String> {
        let rest = self
            .tunnel_url
            .strip_prefix("wss://")
            .or_else(|| self.tunnel_url.strip_prefix("ws://"))?;
        let host = rest.split('/').next()?;
        if host.contains(':') {
            Some(host.to_string())
        } else if self.tunnel_url.starts_with("wss://") {
            Some(format!("{}:443", host))
        } else {
            Some(format!("{}:80", host))
        }
    }
}

#[async_trait]
impl Dialer for WsTunnelDialer {
    fn kind(&self) -> TransportKind {
        TransportKind::WsTunnel
    }

    async fn is_available(&self) -> bool {
        match self.tunnel_host() {
            Some(host) => probe_tcp(&host).await,
            None => false,
        }
    }

    async fn dial(
        &self,
        endpoint: &TransportEndpoint,
        dial_timeout: Duration,
    ) -> Result<MeshConnection> {
        self.counters.record_attempt();
        let result = timeout(dial_timeout, async {
            let mut request = self
                .tunnel_url
                .as_str()
                .into_client_request()
                .context("invalid tunnel URL")?;
            {
                let headers = request.headers_mut();
                headers.insert(
                    "X-Mesh-Target",
                    endpoint
                        .addr()
                        .parse()
                        .context("endpoint address is not a valid header value")?,
                );
                for (name, value) in &self.headers {
                    let name: tokio_tungstenite::tungstenite::http::header::HeaderName =
                        name.parse().context("invalid custom header name")?;
                    headers.insert(name, value.parse().context("invalid custom header value")?);
                }
            }

            let (ws, _response) = tokio_tungstenite::connect_async(request)
                .await
                .context("WebSocket tunnel handshake failed")?;
            debug!(tunnel = %self.tunnel_url, target = %endpoint.addr(), "tunnel established");
            Ok(MeshConnection {
                stream: Box::new(WsByteStream::new(ws)) as MeshStream,
                kind: TransportKind::WsTunnel,
                cert_fingerprint: None,
            })
        })
        .await
        .map_err(|_| anyhow!("dial timed out"))
        .and_then(|r| r);

        self.counters.record_outcome(result.is_ok());
        result
    }

    fn statistics(&self) -> DialerStats {
        self.counters.snapshot()
    }
}

// ============================================================================
// Domain-Fronted HTTPS Dialer
// ============================================================================

/// Domain-fronted HTTPS: the TLS handshake names a popular front domain,
/// the HTTP request inside names the real bridge. Only the front name is
/// visible to on-path observers.
pub struct FrontedHttpDialer {
    front_domain: String,
    bridge_host: String,
    counters: DialerCounters,
}

impl FrontedHttpDialer {
    pub fn new(front_domain: String, bridge_host: String) -> Self {
        Self {
            front_domain,
            bridge_host,
            counters: DialerCounters::default(),
        }
    }

    fn tls_config() -> Arc<rustls::ClientConfig> {
        static CONFIG: std::sync::OnceLock<Arc<rustls::ClientConfig>> = std::sync::OnceLock::new();
        CONFIG
            .get_or_init(|| {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                Arc::new(
                    rustls::ClientConfig::builder()
                        .with_root_certificates(roots)
                        .with_no_client_auth(),
                )
            })
            .clone()
    }
}

#[async_trait]
impl Dialer for FrontedHttpDialer {
    fn kind(&self) -> TransportKind {
        TransportKind::FrontedHttp
    }

    async fn is_available(&self) -> bool {
        probe_tcp(&format!("{}:443", self.front_domain)).await
    }

    async fn dial(
        &self,
        endpoint: &TransportEndpoint,
        dial_timeout: Duration,
    ) -> Result<MeshConnection> {
        self.counters.record_attempt();
        let result = timeout(dial_timeout, async {
            let tcp = TcpStream::connect(format!("{}:443", self.front_domain))
                .await
                .with_context(|| format!("TCP connect to front {} failed", self.front_domain))?;

            // SNI carries the front domain; the Host header inside the
            // encrypted channel carries the real bridge.
            let server_name = rustls::pki_types::ServerName::try_from(self.front_domain.clone())
                .context("front domain is not a valid server name")?;
            let connector = tokio_rustls::TlsConnector::from(Self::tls_config());
            let mut stream = connector
                .connect(server_name, tcp)
                .await
                .context("TLS handshake with front failed")?;

            let upgrade = format!(
                "GET /tunnel HTTP/1.1\r\n\
                 Host: {}\r\n\
                 Connection: Upgrade\r\n\
                 Upgrade: mesh-bridge\r\n\
                 X-Mesh-Target: {}\r\n\
                 \r\n",
                self.bridge_host,
                endpoint.addr()
            );
            stream.write_all(upgrade.as_bytes()).await?;
            stream.flush().await?;

            // Read the status line and headers of the upgrade response.
            let mut response = Vec::with_capacity(512);
            let mut byte = [0u8; 1];
            while !response.ends_with(b"\r\n\r\n") {
                if response.len() > 8192 {
                    bail!("oversized upgrade response from bridge");
                }
                let n = stream.read(&mut byte).await?;
                if n == 0 {
                    bail!("bridge closed during upgrade");
                }
                response.push(byte[0]);
            }
            let status_line = std::str::from_utf8(&response)
                .unwrap_or("")
                .lines()
                .next()
                .unwrap_or("");
            if !status_line.contains("101") {
                bail!("bridge refused upgrade: {}", status_line);
            }

            debug!(front = %self.front_domain, bridge = %self.bridge_host, "fronted tunnel established");
            Ok(MeshConnection {
                stream: Box::new(stream) as MeshStream,
                kind: TransportKind::FrontedHttp,
                cert_fingerprint: None,
            })
        })
        .await
        .map_err(|_| anyhow!("dial timed out"))
        .and_then(|r| r);

        self.counters.record_outcome(result.is_ok());
        result
    }

    fn statistics(&self) -> DialerStats {
        self.counters.snapshot()
    }
}

// ============================================================================
// Pluggable-Obfuscation Dialer
// ============================================================================

/// Dials through an external pluggable-transport helper (obfs4-style).
/// The helper exposes a local SOCKS5 listener; per-bridge parameters travel
/// as SOCKS credentials. The helper binary is validated before first use.
pub struct ObfsDialer {
    helper_path: PathBuf,
    proxy: String,
    bridges: Vec<String>,
    counters: DialerCounters,
}

impl ObfsDialer {
    pub fn new(helper_path: PathBuf, proxy: String, bridges: Vec<String>) -> Self {
        Self {
            helper_path,
            proxy,
            bridges,
            counters: DialerCounters::default(),
        }
    }

    /// Validate helper presence and version output.
    pub async fn validate_helper(&self) -> Result<String> {
        if !self.helper_path.exists() {
            bail!("obfuscation helper not found at {}", self.helper_path.display());
        }
        let output = timeout(
            HELPER_VALIDATE_TIMEOUT,
            tokio::process::Command::new(&self.helper_path)
                .arg("--version")
                .output(),
        )
        .await
        .map_err(|_| anyhow!("helper version check timed out"))?
        .context("failed to execute obfuscation helper")?;

        if !output.status.success() {
            bail!("helper version check exited with {}", output.status);
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if version.is_empty() {
            bail!("helper produced no version output");
        }
        debug!(helper = %self.helper_path.display(), version = %version, "obfuscation helper validated");
        Ok(version)
    }

    /// SOCKS credentials carrying the bridge line, split per the
    /// pluggable-transport convention (username caps at 255 bytes).
    fn bridge_credentials(&self) -> (String, String) {
        let line = self.bridges.first().cloned().unwrap_or_default();
        if line.len() <= 255 {
            (line, "\0".to_string())
        } else {
            let (user, pass) = line.split_at(255);
            (user.to_string(), pass.to_string())
        }
    }
}

#[async_trait]
impl Dialer for ObfsDialer {
    fn kind(&self) -> TransportKind {
        TransportKind::Obfs
    }

    async fn is_available(&self) -> bool {
        if self.validate_helper().await.is_err() {
            return false;
        }
        probe_tcp(&self.proxy).await
    }

    async fn dial(
        &self,
        endpoint: &TransportEndpoint,
        dial_timeout: Duration,
    ) -> Result<MeshConnection> {
        self.counters.record_attempt();
        let result = timeout(dial_timeout, async {
            self.validate_helper().await?;
            let (username, password) = self.bridge_credentials();
            let stream = tokio_socks::tcp::Socks5Stream::connect_with_password(
                self.proxy.as_str(),
                (endpoint.host.as_str(), endpoint.port),
                &username,
                &password,
            )
            .await
            .with_context(|| format!("obfuscated connect to {} failed", endpoint.addr()))?;
            Ok(MeshConnection {
                stream: Box::new(stream) as MeshStream,
                kind: TransportKind::Obfs,
                cert_fingerprint: None,
            })
        })
        .await
        .map_err(|_| anyhow!("dial timed out"))
        .and_then(|r| r);

        self.counters.record_outcome(result.is_ok());
        result
    }

    fn statistics(&self) -> DialerStats {
        self.counters.snapshot()
    }
}

// ============================================================================
// Dialer Set Construction
// ============================================================================

/// Build the dialer list from configuration. Disabled or unconfigured
/// transports are simply absent; the selector skips what is not there.
pub fn build_dialers(keypair: &Keypair, config: &TransportConfig) -> Result<Vec<Arc<dyn Dialer>>> {
    let mut dialers: Vec<Arc<dyn Dialer>> = Vec::new();

    if config.enable_quic {
        dialers.push(Arc::new(QuicDialer::new(keypair)?));
    }
    if config.enable_tor {
        match &config.tor_proxy {
            Some(proxy) => dialers.push(Arc::new(TorDialer::new(proxy.clone()))),
            None => warn!("tor enabled but no proxy configured, skipping"),
        }
    }
    if config.enable_i2p {
        match &config.i2p_proxy {
            Some(proxy) => dialers.push(Arc::new(I2pDialer::new(proxy.clone()))),
            None => warn!("i2p enabled but no proxy configured, skipping"),
        }
    }
    if config.enable_ws_tunnel {
        match &config.ws_tunnel_url {
            Some(url) => dialers.push(Arc::new(WsTunnelDialer::new(
                url.clone(),
                config.ws_headers.clone(),
            ))),
            None => warn!("ws tunnel enabled but no URL configured, skipping"),
        }
    }
    if config.enable_fronted_http {
        match (&config.front_domain, &config.front_bridge_host) {
            (Some(front), Some(bridge)) => {
                dialers.push(Arc::new(FrontedHttpDialer::new(front.clone(), bridge.clone())))
            }
            _ => warn!("fronted http enabled but front/bridge not configured, skipping"),
        }
    }
    if config.enable_obfs {
        match (&config.obfs_helper_path, &config.obfs_proxy) {
            (Some(path), Some(proxy)) => dialers.push(Arc::new(ObfsDialer::new(
                path.clone(),
                proxy.clone(),
                config.obfs_bridges.clone(),
            ))),
            _ => warn!("obfs enabled but helper/proxy not configured, skipping"),
        }
    }

    Ok(dialers)
}
