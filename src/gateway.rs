//! # Private Gateway Tunnel
//!
//! Tunnels TCP between pod members under strict destination filtering. The
//! gateway is a registered mesh service: `OpenTunnel` requests arrive over
//! the control channel, and on acceptance the gateway itself opens the
//! outbound connection - a client-supplied socket is never trusted - and
//! relays bytes bidirectionally.
//!
//! ## Acceptance Pipeline
//!
//! An `OpenTunnel` is accepted only when all of these hold, in order:
//!
//! 1. The caller is a member of the target pod with gateway capability.
//! 2. The port is valid (non-zero).
//! 3. The destination matches policy: an explicit allow-pattern (exact or
//!    `*.` wildcard host with matching port), a registered named service
//!    (name + host + port), or an IP literal permitted by the
//!    private-range / public-internet flags.
//! 4. The destination is not hard-blocked - loopback, link-local, the cloud
//!    metadata address, multicast, unspecified - regardless of any
//!    allowance above.
//! 5. Hostname resolution succeeds and every resolved address passes the
//!    same hard-block check. One blocked resolved address fails the whole
//!    request; this closes the hostname-based IP-filter bypass.
//! 6. Per-peer concurrent, per-pod concurrent, and sliding
//!    per-peer-per-minute quotas all pass.
//!
//! ## Lifecycle
//!
//! Sessions die on explicit `CloseTunnel` (allowed only for the tunnel's
//! own client or the pod's gateway peer), idle timeout, lifetime expiry, or
//! disconnect. The cleanup sweep exposes a single-iteration entry point for
//! deterministic tests and is stop/restart-safe: removal from the session
//! table is the one commit point, so nothing double-closes.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::identity::PeerId;
use crate::messages::{
    CloseTunnelRequest, CloseTunnelResponse, OpenTunnelRequest, OpenTunnelResponse,
};
use crate::transport::MeshStream;

/// Timeout for the gateway's own outbound connection attempt.
const OUTBOUND_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum peers tracked in the new-tunnel rate window.
const MAX_TRACKED_RATE_PEERS: usize = 10_000;

/// Sliding window length for the new-tunnel quota.
const RATE_WINDOW: Duration = Duration::from_secs(60);

// ============================================================================
// Pod Policy (external collaborator's data, read-only here)
// ============================================================================

/// An explicit destination allowance: exact or `*.` wildcard host plus port.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllowPattern {
    pub host_pattern: String,
    pub port: u16,
}

/// A named service the pod exposes through the gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisteredService {
    pub name: String,
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PodMember {
    pub gateway_allowed: bool,
}

/// Per-pod gateway policy. Owned by the pod layer; the gateway reads it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PodPolicy {
    pub pod_id: String,
    pub members: HashMap<PeerId, PodMember>,
    pub gateway_peer: PeerId,
    pub allow_private_ranges: bool,
    pub allow_public_internet: bool,
    pub allow_patterns: Vec<AllowPattern>,
    pub registered_services: Vec<RegisteredService>,
    pub max_tunnels_per_peer: usize,
    pub max_tunnels_per_pod: usize,
    pub new_tunnels_per_minute: usize,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

impl PodPolicy {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

// ============================================================================
// Destination Filtering
// ============================================================================

/// Addresses the gateway refuses to reach no matter what policy allows.
/// SECURITY: This is the SSRF backstop - loopback, link-local (which
/// contains the cloud metadata address 169.254.169.254), multicast,
/// unspecified, and broadcast.
pub fn is_hard_blocked(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || *v4 == Ipv4Addr::new(169, 254, 169, 254)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                // link-local fe80::/10
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// RFC 1918 / ULA private ranges.
fn is_private_range(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        // fc00::/7 unique local addresses
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Case-insensitive host match: exact, `*` (any), or `*.suffix` wildcard.
/// The wildcard requires at least one label before the suffix - `*.example.com`
/// matches `api.example.com` but not `example.com` itself.
pub fn host_matches_pattern(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host
            .strip_suffix(suffix)
            .map(|prefix| prefix.ends_with('.') && prefix.len() > 1)
            .unwrap_or(false);
    }
    pattern == host
}

/// Typed tunnel rejection. Expected, peer-visible, never retried internally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    UnknownPod,
    NotPodMember,
    GatewayNotEnabled,
    InvalidPort,
    /// Destination matches no pattern, service, or IP allowance.
    PolicyDenied,
    /// Destination (or a resolved address) is on the hard-blocked list.
    HardBlocked,
    ResolutionFailed,
    PeerTunnelLimit,
    PodTunnelLimit,
    RateLimited,
    UnknownTunnel,
    NotAuthorized,
    ConnectFailed,
}

impl TunnelError {
    /// Stable reason tag carried in rejection responses.
    pub fn reason(&self) -> &'static str {
        match self {
            TunnelError::UnknownPod => "unknown_pod",
            TunnelError::NotPodMember => "not_pod_member",
            TunnelError::GatewayNotEnabled => "gateway_not_enabled",
            TunnelError::InvalidPort => "invalid_port",
            TunnelError::PolicyDenied => "policy_denied",
            TunnelError::HardBlocked => "destination_blocked",
            TunnelError::ResolutionFailed => "resolution_failed",
            TunnelError::PeerTunnelLimit => "peer_tunnel_limit",
            TunnelError::PodTunnelLimit => "pod_tunnel_limit",
            TunnelError::RateLimited => "rate_limited",
            TunnelError::UnknownTunnel => "unknown_tunnel",
            TunnelError::NotAuthorized => "not_authorized",
            TunnelError::ConnectFailed => "connect_failed",
        }
    }
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason())
    }
}

impl std::error::Error for TunnelError {}

// ============================================================================
// Tunnel Sessions
// ============================================================================

/// Diagnostic snapshot of one tunnel.
#[derive(Clone, Debug)]
pub struct TunnelSession {
    pub tunnel_id: [u8; 16],
    pub client: PeerId,
    pub pod_id: String,
    pub destination_host: String,
    pub destination_port: u16,
    pub age: Duration,
    pub idle: Duration,
}

struct TunnelEntry {
    client: PeerId,
    pod_id: String,
    destination_host: String,
    destination_port: u16,
    created_at: Instant,
    last_activity: Arc<Mutex<Instant>>,
    /// Outbound stream held until the client data stream attaches.
    outbound: Option<MeshStream>,
    relay: Option<tokio::task::JoinHandle<()>>,
}

impl TunnelEntry {
    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .elapsed()
    }
}

/// Stream wrapper bumping a shared activity timestamp on every transfer,
/// so the sweep sees live tunnels as live.
struct ActivityStream<S> {
    inner: S,
    last_activity: Arc<Mutex<Instant>>,
}

impl<S> ActivityStream<S> {
    fn new(inner: S, last_activity: Arc<Mutex<Instant>>) -> Self {
        Self {
            inner,
            last_activity,
        }
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Instant::now();
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ActivityStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(result, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.touch();
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ActivityStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(result, Poll::Ready(Ok(n)) if n > 0) {
            this.touch();
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// ============================================================================
// Gateway
// ============================================================================

pub struct PrivateGateway {
    policies: Mutex<HashMap<String, PodPolicy>>,
    tunnels: Mutex<HashMap<[u8; 16], TunnelEntry>>,
    /// Sliding per-peer window of recent tunnel admissions.
    recent_opens: Mutex<LruCache<PeerId, VecDeque<Instant>>>,
}

impl PrivateGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            policies: Mutex::new(HashMap::new()),
            tunnels: Mutex::new(HashMap::new()),
            recent_opens: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_TRACKED_RATE_PEERS).expect("non-zero"),
            )),
        })
    }

    pub fn set_pod_policy(&self, policy: PodPolicy) {
        self.policies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(policy.pod_id.clone(), policy);
    }

    fn policy_for(&self, pod_id: &str) -> Option<PodPolicy> {
        self.policies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(pod_id)
            .cloned()
    }

    /// Destination policy decision for a request, before resolution.
    fn destination_allowed(
        policy: &PodPolicy,
        host: &str,
        port: u16,
        service_name: Option<&str>,
    ) -> Result<(), TunnelError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            // SECURITY: Hard block wins over every allowance.
            if is_hard_blocked(&ip) {
                return Err(TunnelError::HardBlocked);
            }
            if policy
                .allow_patterns
                .iter()
                .any(|p| p.port == port && host_matches_pattern(&p.host_pattern, host))
            {
                return Ok(());
            }
            let permitted = if is_private_range(&ip) {
                policy.allow_private_ranges
            } else {
                policy.allow_public_internet
            };
            return if permitted {
                Ok(())
            } else {
                Err(TunnelError::PolicyDenied)
            };
        }

        if let Some(name) = service_name {
            let matched = policy.registered_services.iter().any(|s| {
                s.name == name && s.host.eq_ignore_ascii_case(host) && s.port == port
            });
            if matched {
                return Ok(());
            }
        }

        if policy
            .allow_patterns
            .iter()
            .any(|p| p.port == port && host_matches_pattern(&p.host_pattern, host))
        {
            return Ok(());
        }

        Err(TunnelError::PolicyDenied)
    }

    fn check_quotas(&self, policy: &PodPolicy, caller: &PeerId) -> Result<(), TunnelError> {
        let tunnels = self
            .tunnels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let peer_count = tunnels.values().filter(|t| t.client == *caller).count();
        if peer_count >= policy.max_tunnels_per_peer {
            return Err(TunnelError::PeerTunnelLimit);
        }
        let pod_count = tunnels
            .values()
            .filter(|t| t.pod_id == policy.pod_id)
            .count();
        if pod_count >= policy.max_tunnels_per_pod {
            return Err(TunnelError::PodTunnelLimit);
        }
        drop(tunnels);

        let mut recent = self
            .recent_opens
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let window = recent.get_or_insert_mut(*caller, VecDeque::new);
        let now = Instant::now();
        while let Some(front) = window.front() {
            if now.duration_since(*front) > RATE_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= policy.new_tunnels_per_minute {
            return Err(TunnelError::RateLimited);
        }
        window.push_back(now);
        Ok(())
    }

    /// Run the full acceptance pipeline and register the session.
    ///
    /// Returns the tunnel id and the vetted addresses the outbound
    /// connection may use. No socket is opened here.
    pub async fn admit_tunnel(
        &self,
        caller: PeerId,
        request: &OpenTunnelRequest,
    ) -> Result<([u8; 16], Vec<SocketAddr>), TunnelError> {
        let policy = self
            .policy_for(&request.pod_id)
            .ok_or(TunnelError::UnknownPod)?;

        let member = policy
            .members
            .get(&caller)
            .ok_or(TunnelError::NotPodMember)?;
        if !member.gateway_allowed {
            return Err(TunnelError::GatewayNotEnabled);
        }
        if request.destination_port == 0 {
            return Err(TunnelError::InvalidPort);
        }

        Self::destination_allowed(
            &policy,
            &request.destination_host,
            request.destination_port,
            request.service_name.as_deref(),
        )?;

        // Resolve and re-check every address. Connecting only to the vetted
        // addresses below also closes the resolve-twice TOCTOU hole.
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((
            request.destination_host.as_str(),
            request.destination_port,
        ))
        .await
        .map_err(|_| TunnelError::ResolutionFailed)?
        .collect();
        if addrs.is_empty() {
            return Err(TunnelError::ResolutionFailed);
        }
        if addrs.iter().any(|a| is_hard_blocked(&a.ip())) {
            warn!(
                host = %request.destination_host,
                "hostname resolves to a blocked address, refusing tunnel"
            );
            return Err(TunnelError::HardBlocked);
        }

        self.check_quotas(&policy, &caller)?;

        let mut tunnel_id = [0u8; 16];
        getrandom::getrandom(&mut tunnel_id).map_err(|_| TunnelError::ConnectFailed)?;

        let now = Instant::now();
        let entry = TunnelEntry {
            client: caller,
            pod_id: request.pod_id.clone(),
            destination_host: request.destination_host.clone(),
            destination_port: request.destination_port,
            created_at: now,
            last_activity: Arc::new(Mutex::new(now)),
            outbound: None,
            relay: None,
        };
        self.tunnels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(tunnel_id, entry);

        info!(
            tunnel = %hex::encode(tunnel_id),
            client = %caller,
            destination = %format!("{}:{}", request.destination_host, request.destination_port),
            "tunnel admitted"
        );
        Ok((tunnel_id, addrs))
    }

    /// Full open: admission, then the gateway opens the outbound connection
    /// itself. A connect failure tears the session back down - no half-open
    /// state survives.
    pub async fn open_tunnel(
        &self,
        caller: PeerId,
        request: &OpenTunnelRequest,
    ) -> OpenTunnelResponse {
        let (tunnel_id, addrs) = match self.admit_tunnel(caller, request).await {
            Ok(admitted) => admitted,
            Err(e) => {
                debug!(client = %caller, reason = %e, "tunnel rejected");
                return OpenTunnelResponse {
                    tunnel_id: [0u8; 16],
                    accepted: false,
                    reason: e.reason().to_string(),
                };
            }
        };

        let mut outbound = None;
        for addr in &addrs {
            match timeout(OUTBOUND_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    outbound = Some(stream);
                    break;
                }
                Ok(Err(e)) => debug!(addr = %addr, error = %e, "outbound connect failed"),
                Err(_) => debug!(addr = %addr, "outbound connect timed out"),
            }
        }

        let Some(stream) = outbound else {
            self.remove_entry(&tunnel_id);
            return OpenTunnelResponse {
                tunnel_id: [0u8; 16],
                accepted: false,
                reason: TunnelError::ConnectFailed.reason().to_string(),
            };
        };

        let mut tunnels = self
            .tunnels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(entry) = tunnels.get_mut(&tunnel_id) {
            entry.outbound = Some(Box::new(stream));
        } else {
            // The sweep removed the session while we were connecting; the
            // socket drops here and nothing leaks.
            return OpenTunnelResponse {
                tunnel_id: [0u8; 16],
                accepted: false,
                reason: TunnelError::UnknownTunnel.reason().to_string(),
            };
        }
        drop(tunnels);

        OpenTunnelResponse {
            tunnel_id,
            accepted: true,
            reason: String::new(),
        }
    }

    /// Attach the client's data stream and start relaying. The relay runs
    /// until either side closes or the sweep terminates the session.
    pub fn attach_client(
        self: &Arc<Self>,
        tunnel_id: [u8; 16],
        client_stream: MeshStream,
    ) -> Result<(), TunnelError> {
        let mut tunnels = self
            .tunnels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = tunnels
            .get_mut(&tunnel_id)
            .ok_or(TunnelError::UnknownTunnel)?;
        let outbound = entry.outbound.take().ok_or(TunnelError::UnknownTunnel)?;
        let last_activity = entry.last_activity.clone();

        let gateway = self.clone();
        let relay = tokio::spawn(async move {
            let mut client = ActivityStream::new(client_stream, last_activity.clone());
            let mut upstream = ActivityStream::new(outbound, last_activity);
            match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                Ok((to_upstream, to_client)) => {
                    debug!(
                        tunnel = %hex::encode(tunnel_id),
                        to_upstream,
                        to_client,
                        "tunnel relay finished"
                    );
                }
                Err(e) => {
                    debug!(tunnel = %hex::encode(tunnel_id), error = %e, "tunnel relay ended with error");
                }
            }
            gateway.remove_entry(&tunnel_id);
        });
        entry.relay = Some(relay);
        Ok(())
    }

    fn remove_entry(&self, tunnel_id: &[u8; 16]) -> bool {
        let entry = self
            .tunnels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(tunnel_id);
        match entry {
            Some(entry) => {
                if let Some(relay) = entry.relay {
                    relay.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Close a tunnel. Allowed only for the tunnel's own client or the
    /// pod's designated gateway peer.
    pub fn close_tunnel(&self, caller: PeerId, tunnel_id: &[u8; 16]) -> Result<(), TunnelError> {
        let authorized = {
            let tunnels = self
                .tunnels
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let entry = tunnels.get(tunnel_id).ok_or(TunnelError::UnknownTunnel)?;
            entry.client == caller
                || self
                    .policy_for(&entry.pod_id)
                    .map(|p| p.gateway_peer == caller)
                    .unwrap_or(false)
        };
        if !authorized {
            return Err(TunnelError::NotAuthorized);
        }
        if self.remove_entry(tunnel_id) {
            info!(tunnel = %hex::encode(tunnel_id), client = %caller, "tunnel closed");
            Ok(())
        } else {
            Err(TunnelError::UnknownTunnel)
        }
    }

    /// Close every tunnel belonging to a disconnected peer.
    pub fn close_for_peer(&self, peer: &PeerId) -> usize {
        let ids: Vec<[u8; 16]> = {
            let tunnels = self
                .tunnels
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            tunnels
                .iter()
                .filter(|(_, t)| t.client == *peer)
                .map(|(id, _)| *id)
                .collect()
        };
        let mut closed = 0;
        for id in ids {
            if self.remove_entry(&id) {
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(peer = %peer, closed, "closed tunnels for disconnected peer");
        }
        closed
    }

    /// One sweep iteration: close tunnels past idle timeout or max lifetime.
    /// Safe to call concurrently with closes - removal is the commit point.
    pub fn sweep_once(&self) -> usize {
        let expired: Vec<[u8; 16]> = {
            let tunnels = self
                .tunnels
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            tunnels
                .iter()
                .filter(|(_, entry)| {
                    let policy = match self.policy_for(&entry.pod_id) {
                        Some(p) => p,
                        None => return true,
                    };
                    entry.idle_for() > policy.idle_timeout()
                        || entry.created_at.elapsed() > policy.max_lifetime()
                })
                .map(|(id, _)| *id)
                .collect()
        };
        let mut closed = 0;
        for id in expired {
            if self.remove_entry(&id) {
                closed += 1;
                debug!(tunnel = %hex::encode(id), "sweep closed expired tunnel");
            }
        }
        closed
    }

    /// Spawn the periodic sweep. Abort the handle to stop; a restarted
    /// sweep picks up cleanly because `sweep_once` is idempotent.
    pub fn spawn_sweep(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let closed = gateway.sweep_once();
                if closed > 0 {
                    debug!(closed, "tunnel sweep iteration");
                }
            }
        })
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Diagnostic snapshot of live tunnels.
    pub fn sessions(&self) -> Vec<TunnelSession> {
        let tunnels = self
            .tunnels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        tunnels
            .iter()
            .map(|(id, entry)| TunnelSession {
                tunnel_id: *id,
                client: entry.client,
                pod_id: entry.pod_id.clone(),
                destination_host: entry.destination_host.clone(),
                destination_port: entry.destination_port,
                age: entry.created_at.elapsed(),
                idle: entry.idle_for(),
            })
            .collect()
    }
}

// ============================================================================
// Router Integration
// ============================================================================

/// The gateway's registered-service face: control methods arrive as routed
/// service calls, the relay itself runs on attached data streams.
pub struct GatewayService {
    gateway: Arc<PrivateGateway>,
}

impl GatewayService {
    pub const SERVICE_NAME: &'static str = "mesh.gateway";

    pub fn new(gateway: Arc<PrivateGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait::async_trait]
impl crate::router::MeshService for GatewayService {
    fn call_cost(&self, method: &str) -> u32 {
        match method {
            "open" => 5,
            _ => 1,
        }
    }

    async fn handle(
        &self,
        caller: PeerId,
        method: &str,
        payload: &[u8],
    ) -> anyhow::Result<Vec<u8>> {
        match method {
            "open" => {
                let request: OpenTunnelRequest = crate::messages::deserialize_bounded(payload)?;
                let response = self.gateway.open_tunnel(caller, &request).await;
                Ok(crate::messages::serialize(&response)?)
            }
            "close" => {
                let request: CloseTunnelRequest = crate::messages::deserialize_bounded(payload)?;
                let response = match self.gateway.close_tunnel(caller, &request.tunnel_id) {
                    Ok(()) => CloseTunnelResponse {
                        closed: true,
                        reason: String::new(),
                    },
                    Err(e) => CloseTunnelResponse {
                        closed: false,
                        reason: e.reason().to_string(),
                    },
                };
                Ok(crate::messages::serialize(&response)?)
            }
            other => anyhow::bail!("unknown gateway method: {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn peer() -> PeerId {
        Keypair::generate().peer_id()
    }

    fn policy(pod: &str, members: &[(PeerId, bool)]) -> PodPolicy {
        PodPolicy {
            pod_id: pod.to_string(),
            members: members
                .iter()
                .map(|(id, allowed)| {
                    (
                        *id,
                        PodMember {
                            gateway_allowed: *allowed,
                        },
                    )
                })
                .collect(),
            gateway_peer: peer(),
            allow_private_ranges: false,
            allow_public_internet: true,
            allow_patterns: vec![],
            registered_services: vec![],
            max_tunnels_per_peer: 8,
            max_tunnels_per_pod: 32,
            new_tunnels_per_minute: 30,
            idle_timeout_secs: 300,
            max_lifetime_secs: 3600,
        }
    }

    fn request(host: &str, port: u16) -> OpenTunnelRequest {
        OpenTunnelRequest {
            pod_id: "pod-1".to_string(),
            destination_host: host.to_string(),
            destination_port: port,
            service_name: None,
            request_nonce: [1u8; 16],
            request_timestamp_ms: crate::identity::now_ms(),
        }
    }

    // ------------------------------------------------------------------
    // Pattern matching
    // ------------------------------------------------------------------

    #[test]
    fn wildcard_pattern_matches_subdomains_only() {
        assert!(host_matches_pattern("*.example.com", "api.example.com"));
        assert!(host_matches_pattern("*.example.com", "Deep.Sub.Example.Com"));
        assert!(!host_matches_pattern("*.example.com", "example.com"));
        assert!(!host_matches_pattern("*.example.com", "evil.com"));
        assert!(!host_matches_pattern("*.example.com", "notexample.com"));
    }

    #[test]
    fn exact_pattern_is_case_insensitive() {
        assert!(host_matches_pattern("Bridge.Example.Net", "bridge.example.net"));
        assert!(!host_matches_pattern("bridge.example.net", "other.example.net"));
    }

    #[test]
    fn star_pattern_matches_everything() {
        assert!(host_matches_pattern("*", "anything.at.all"));
    }

    // ------------------------------------------------------------------
    // Hard blocking
    // ------------------------------------------------------------------

    #[test]
    fn hard_blocked_addresses() {
        for blocked in [
            "127.0.0.1",
            "127.8.8.8",
            "169.254.169.254",
            "169.254.1.1",
            "224.0.0.1",
            "0.0.0.0",
            "255.255.255.255",
            "::1",
            "fe80::1",
            "ff02::1",
            "::",
        ] {
            let ip: IpAddr = blocked.parse().unwrap();
            assert!(is_hard_blocked(&ip), "{} must be hard-blocked", blocked);
        }

        for ok in ["8.8.8.8", "10.1.2.3", "192.168.1.1", "2001:db8::1"] {
            let ip: IpAddr = ok.parse().unwrap();
            assert!(!is_hard_blocked(&ip), "{} must not be hard-blocked", ok);
        }
    }

    #[test]
    fn private_range_classification() {
        for private in ["10.0.0.1", "172.16.5.5", "192.168.0.9", "fc00::1", "fd12::1"] {
            let ip: IpAddr = private.parse().unwrap();
            assert!(is_private_range(&ip), "{} is private", private);
        }
        for public in ["8.8.8.8", "203.0.113.7", "2001:db8::1"] {
            let ip: IpAddr = public.parse().unwrap();
            assert!(!is_private_range(&ip), "{} is public", public);
        }
    }

    // ------------------------------------------------------------------
    // Destination policy
    // ------------------------------------------------------------------

    #[test]
    fn allowlist_pattern_accepts_matching_host_and_port() {
        let mut p = policy("pod-1", &[]);
        p.allow_public_internet = false;
        p.allow_patterns = vec![AllowPattern {
            host_pattern: "*.example.com".to_string(),
            port: 443,
        }];

        assert!(PrivateGateway::destination_allowed(&p, "api.example.com", 443, None).is_ok());
        assert_eq!(
            PrivateGateway::destination_allowed(&p, "evil.com", 443, None),
            Err(TunnelError::PolicyDenied)
        );
        assert_eq!(
            PrivateGateway::destination_allowed(&p, "api.example.com", 8443, None),
            Err(TunnelError::PolicyDenied)
        );
    }

    #[test]
    fn loopback_rejected_regardless_of_allowlist() {
        let mut p = policy("pod-1", &[]);
        p.allow_private_ranges = true;
        p.allow_public_internet = true;
        p.allow_patterns = vec![AllowPattern {
            host_pattern: "*".to_string(),
            port: 80,
        }];

        assert_eq!(
            PrivateGateway::destination_allowed(&p, "127.0.0.1", 80, None),
            Err(TunnelError::HardBlocked)
        );
        assert_eq!(
            PrivateGateway::destination_allowed(&p, "169.254.169.254", 80, None),
            Err(TunnelError::HardBlocked)
        );
    }

    #[test]
    fn ip_literal_gated_by_range_flags() {
        let mut p = policy("pod-1", &[]);
        p.allow_private_ranges = false;
        p.allow_public_internet = false;

        assert_eq!(
            PrivateGateway::destination_allowed(&p, "10.0.0.5", 80, None),
            Err(TunnelError::PolicyDenied)
        );
        assert_eq!(
            PrivateGateway::destination_allowed(&p, "8.8.8.8", 53, None),
            Err(TunnelError::PolicyDenied)
        );

        p.allow_private_ranges = true;
        assert!(PrivateGateway::destination_allowed(&p, "10.0.0.5", 80, None).is_ok());
        assert_eq!(
            PrivateGateway::destination_allowed(&p, "8.8.8.8", 53, None),
            Err(TunnelError::PolicyDenied)
        );

        p.allow_public_internet = true;
        assert!(PrivateGateway::destination_allowed(&p, "8.8.8.8", 53, None).is_ok());
    }

    #[test]
    fn registered_service_requires_full_match() {
        let mut p = policy("pod-1", &[]);
        p.allow_public_internet = false;
        p.registered_services = vec![RegisteredService {
            name: "media-index".to_string(),
            host: "index.pod.internal".to_string(),
            port: 9000,
        }];

        assert!(PrivateGateway::destination_allowed(
            &p,
            "index.pod.internal",
            9000,
            Some("media-index")
        )
        .is_ok());
        // Wrong name
        assert_eq!(
            PrivateGateway::destination_allowed(&p, "index.pod.internal", 9000, Some("other")),
            Err(TunnelError::PolicyDenied)
        );
        // Wrong port
        assert_eq!(
            PrivateGateway::destination_allowed(
                &p,
                "index.pod.internal",
                9001,
                Some("media-index")
            ),
            Err(TunnelError::PolicyDenied)
        );
        // No service name supplied
        assert_eq!(
            PrivateGateway::destination_allowed(&p, "index.pod.internal", 9000, None),
            Err(TunnelError::PolicyDenied)
        );
    }

    // ------------------------------------------------------------------
    // Admission pipeline
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn non_member_is_rejected() {
        let gateway = PrivateGateway::new();
        let member = peer();
        gateway.set_pod_policy(policy("pod-1", &[(member, true)]));

        let outsider = peer();
        let result = gateway.admit_tunnel(outsider, &request("203.0.113.5", 80)).await;
        assert_eq!(result.unwrap_err(), TunnelError::NotPodMember);
    }

    #[tokio::test]
    async fn member_without_gateway_capability_is_rejected() {
        let gateway = PrivateGateway::new();
        let member = peer();
        gateway.set_pod_policy(policy("pod-1", &[(member, false)]));

        let result = gateway.admit_tunnel(member, &request("203.0.113.5", 80)).await;
        assert_eq!(result.unwrap_err(), TunnelError::GatewayNotEnabled);
    }

    #[tokio::test]
    async fn unknown_pod_is_rejected() {
        let gateway = PrivateGateway::new();
        let member = peer();
        let mut req = request("203.0.113.5", 80);
        req.pod_id = "ghost-pod".to_string();
        let result = gateway.admit_tunnel(member, &req).await;
        assert_eq!(result.unwrap_err(), TunnelError::UnknownPod);
    }

    #[tokio::test]
    async fn zero_port_is_rejected() {
        let gateway = PrivateGateway::new();
        let member = peer();
        gateway.set_pod_policy(policy("pod-1", &[(member, true)]));

        let result = gateway.admit_tunnel(member, &request("203.0.113.5", 0)).await;
        assert_eq!(result.unwrap_err(), TunnelError::InvalidPort);
    }

    #[tokio::test]
    async fn hostname_resolving_to_blocked_address_is_rejected() {
        // "localhost" resolves to loopback; the per-address check must
        // catch what the literal check cannot see.
        let gateway = PrivateGateway::new();
        let member = peer();
        let mut p = policy("pod-1", &[(member, true)]);
        p.allow_patterns = vec![AllowPattern {
            host_pattern: "localhost".to_string(),
            port: 80,
        }];
        gateway.set_pod_policy(p);

        let result = gateway.admit_tunnel(member, &request("localhost", 80)).await;
        assert_eq!(result.unwrap_err(), TunnelError::HardBlocked);
        assert_eq!(gateway.tunnel_count(), 0);
    }

    #[tokio::test]
    async fn per_peer_concurrent_quota_enforced() {
        let gateway = PrivateGateway::new();
        let member = peer();
        let mut p = policy("pod-1", &[(member, true)]);
        p.max_tunnels_per_peer = 2;
        gateway.set_pod_policy(p);

        let (id1, _) = gateway.admit_tunnel(member, &request("203.0.113.5", 80)).await.unwrap();
        let (_id2, _) = gateway.admit_tunnel(member, &request("203.0.113.6", 80)).await.unwrap();

        // Third simultaneous open is rejected
        let result = gateway.admit_tunnel(member, &request("203.0.113.7", 80)).await;
        assert_eq!(result.unwrap_err(), TunnelError::PeerTunnelLimit);

        // Closing one permits a new one
        gateway.close_tunnel(member, &id1).unwrap();
        assert!(gateway.admit_tunnel(member, &request("203.0.113.7", 80)).await.is_ok());
    }

    #[tokio::test]
    async fn per_pod_concurrent_quota_enforced() {
        let gateway = PrivateGateway::new();
        let a = peer();
        let b = peer();
        let mut p = policy("pod-1", &[(a, true), (b, true)]);
        p.max_tunnels_per_pod = 2;
        gateway.set_pod_policy(p);

        gateway.admit_tunnel(a, &request("203.0.113.5", 80)).await.unwrap();
        gateway.admit_tunnel(b, &request("203.0.113.6", 80)).await.unwrap();

        let result = gateway.admit_tunnel(a, &request("203.0.113.7", 80)).await;
        assert_eq!(result.unwrap_err(), TunnelError::PodTunnelLimit);
    }

    #[tokio::test]
    async fn per_minute_rate_quota_enforced() {
        let gateway = PrivateGateway::new();
        let member = peer();
        let mut p = policy("pod-1", &[(member, true)]);
        p.new_tunnels_per_minute = 2;
        p.max_tunnels_per_peer = 100;
        gateway.set_pod_policy(p);

        let (id1, _) = gateway.admit_tunnel(member, &request("203.0.113.5", 80)).await.unwrap();
        gateway.admit_tunnel(member, &request("203.0.113.6", 80)).await.unwrap();

        // Rate window still holds both opens even after a close
        gateway.close_tunnel(member, &id1).unwrap();
        let result = gateway.admit_tunnel(member, &request("203.0.113.7", 80)).await;
        assert_eq!(result.unwrap_err(), TunnelError::RateLimited);
    }

    // ------------------------------------------------------------------
    // Close authorization and sweeps
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn close_requires_owner_or_gateway_peer() {
        let gateway = PrivateGateway::new();
        let owner = peer();
        let gateway_peer = peer();
        let stranger = peer();
        let mut p = policy("pod-1", &[(owner, true)]);
        p.gateway_peer = gateway_peer;
        gateway.set_pod_policy(p);

        let (id, _) = gateway.admit_tunnel(owner, &request("203.0.113.5", 80)).await.unwrap();

        assert_eq!(
            gateway.close_tunnel(stranger, &id),
            Err(TunnelError::NotAuthorized)
        );
        // The pod's gateway peer may close it
        assert!(gateway.close_tunnel(gateway_peer, &id).is_ok());
        // Double close reports unknown
        assert_eq!(
            gateway.close_tunnel(owner, &id),
            Err(TunnelError::UnknownTunnel)
        );
    }

    #[tokio::test]
    async fn disconnect_closes_all_peer_tunnels() {
        let gateway = PrivateGateway::new();
        let member = peer();
        let other = peer();
        gateway.set_pod_policy(policy("pod-1", &[(member, true), (other, true)]));

        gateway.admit_tunnel(member, &request("203.0.113.5", 80)).await.unwrap();
        gateway.admit_tunnel(member, &request("203.0.113.6", 80)).await.unwrap();
        gateway.admit_tunnel(other, &request("203.0.113.7", 80)).await.unwrap();

        assert_eq!(gateway.close_for_peer(&member), 2);
        assert_eq!(gateway.tunnel_count(), 1);
    }

    #[tokio::test]
    async fn sweep_closes_over_lifetime_tunnels_and_is_idempotent() {
        let gateway = PrivateGateway::new();
        let member = peer();
        let mut p = policy("pod-1", &[(member, true)]);
        p.max_lifetime_secs = 0; // everything is immediately over-lifetime
        gateway.set_pod_policy(p);

        gateway.admit_tunnel(member, &request("203.0.113.5", 80)).await.unwrap();
        gateway.admit_tunnel(member, &request("203.0.113.6", 80)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(gateway.sweep_once(), 2);
        // Restarted or repeated sweep finds nothing: no double close
        assert_eq!(gateway.sweep_once(), 0);
        assert_eq!(gateway.tunnel_count(), 0);
    }

    #[tokio::test]
    async fn idle_sweep_spares_fresh_tunnels() {
        let gateway = PrivateGateway::new();
        let member = peer();
        gateway.set_pod_policy(policy("pod-1", &[(member, true)]));

        gateway.admit_tunnel(member, &request("203.0.113.5", 80)).await.unwrap();
        assert_eq!(gateway.sweep_once(), 0);
        assert_eq!(gateway.tunnel_count(), 1);
    }

    #[tokio::test]
    async fn sessions_snapshot_reports_tunnels() {
        let gateway = PrivateGateway::new();
        let member = peer();
        gateway.set_pod_policy(policy("pod-1", &[(member, true)]));

        gateway.admit_tunnel(member, &request("203.0.113.5", 8080)).await.unwrap();
        let sessions = gateway.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].client, member);
        assert_eq!(sessions[0].destination_port, 8080);
    }

    // ------------------------------------------------------------------
    // Full open + relay
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn relay_copies_bytes_both_ways_and_updates_activity() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let gateway = PrivateGateway::new();
        let member = peer();
        gateway.set_pod_policy(policy("pod-1", &[(member, true)]));

        let (id, _) = gateway
            .admit_tunnel(member, &request("203.0.113.5", 80))
            .await
            .unwrap();

        // Wire up both ends with in-memory duplex pairs instead of sockets.
        let (upstream_local, mut upstream_remote) = tokio::io::duplex(4096);
        let (client_local, mut client_remote) = tokio::io::duplex(4096);
        {
            let mut tunnels = gateway.tunnels.lock().unwrap();
            tunnels.get_mut(&id).unwrap().outbound = Some(Box::new(upstream_local));
        }
        gateway
            .attach_client(id, Box::new(client_local))
            .unwrap();

        // client -> destination
        client_remote.write_all(b"GET /").await.unwrap();
        let mut buf = [0u8; 5];
        upstream_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET /");

        // destination -> client
        upstream_remote.write_all(b"200").await.unwrap();
        let mut buf = [0u8; 3];
        client_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"200");

        // Relay traffic kept the session fresh
        let sessions = gateway.sessions();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].idle < Duration::from_secs(5));

        // Closing both remote ends finishes the relay and the session
        // self-cleans.
        drop(client_remote);
        drop(upstream_remote);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(gateway.tunnel_count(), 0);
    }

    #[tokio::test]
    async fn attach_without_outbound_is_rejected() {
        let gateway = PrivateGateway::new();
        let member = peer();
        gateway.set_pod_policy(policy("pod-1", &[(member, true)]));

        let (id, _) = gateway
            .admit_tunnel(member, &request("203.0.113.5", 80))
            .await
            .unwrap();
        let (client_local, _client_remote) = tokio::io::duplex(64);
        assert_eq!(
            gateway.attach_client(id, Box::new(client_local)).unwrap_err(),
            TunnelError::UnknownTunnel
        );
    }

    #[tokio::test]
    async fn rejected_open_returns_reason() {
        let gateway = PrivateGateway::new();
        let member = peer();
        gateway.set_pod_policy(policy("pod-1", &[(member, true)]));

        let response = gateway.open_tunnel(member, &request("127.0.0.1", 80)).await;
        assert!(!response.accepted);
        assert_eq!(response.reason, "destination_blocked");
        assert_eq!(gateway.tunnel_count(), 0);
    }
}
