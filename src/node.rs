//! # Mesh Node
//!
//! Ties the substrate together: a [`MeshNode`] owns the descriptor table,
//! pin manager, throttler, transport selector, DHT, service router, and
//! private gateway, and runs the QUIC listener that feeds inbound control
//! envelopes into them.
//!
//! ## Control Plane
//!
//! Every control exchange is one signed envelope per direction over a
//! bidirectional stream: the caller seals a [`MeshRequest`], the responder
//! verifies it (signature, payload hash, freshness, signer matching the
//! mTLS identity, and the per-peer envelope budget) before touching any
//! handler, then seals a [`MeshResponse`] back.
//!
//! ## Wiring Rules
//!
//! Components hold peer ids and handles, never back-references into each
//! other; the node is the only place that sees everything.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::descriptor::{
    DescriptorTable, EndpointScope, NatClass, PeerDescriptor, TransportEndpoint,
};
use crate::dht::{DhtNode, Key, NodeId, NodeRecord};
use crate::gateway::{GatewayService, PrivateGateway};
use crate::identity::{Keypair, PeerId};
use crate::messages::{
    self, CallStatus, DhtRequest, DhtResponse, MeshRequest, MeshResponse, ServiceCall,
};
use crate::pinning::PinManager;
use crate::protocols::DhtRpc;
use crate::router::{RouterConfig, ServiceRouter};
use crate::selector::{PolicyManager, SelectError, StrengthRanking, TransportSelector};
use crate::signing::SignedEnvelope;
use crate::throttle::{ConnectionThrottler, ThrottleConfig};
use crate::tls;
use crate::transport::{build_dialers, TransportConfig};

/// Timeout for one request/reply exchange on a control stream.
const RPC_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval for the gateway tunnel sweep.
const GATEWAY_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Default TTL for published peer descriptors in the DHT.
const DESCRIPTOR_TTL_SECS: u64 = 60 * 60;

/// Node construction parameters.
pub struct MeshNodeConfig {
    pub listen_addr: SocketAddr,
    pub transport: TransportConfig,
    pub throttle: ThrottleConfig,
    pub router: RouterConfig,
    pub ranking: StrengthRanking,
}

impl Default for MeshNodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".parse().expect("static address parses"),
            transport: TransportConfig {
                enable_quic: true,
                ..Default::default()
            },
            throttle: ThrottleConfig::default(),
            router: RouterConfig::default(),
            ranking: StrengthRanking::default(),
        }
    }
}

/// Client-side RPC: seals requests into signed envelopes and sends them
/// over selector-established streams. Implements [`DhtRpc`] so the DHT can
/// drive it.
pub struct EnvelopeRpc {
    keypair: Keypair,
    selector: Arc<TransportSelector>,
    /// Our own DHT record, attached as `from` on outbound DHT requests.
    self_record: RwLock<Option<NodeRecord>>,
    /// NodeId -> PeerId index fed by applied descriptors; a DHT contact is
    /// dialable once its descriptor is known.
    known_peers: RwLock<HashMap<NodeId, PeerId>>,
}

impl EnvelopeRpc {
    fn new(keypair: Keypair, selector: Arc<TransportSelector>) -> Self {
        Self {
            keypair,
            selector,
            self_record: RwLock::new(None),
            known_peers: RwLock::new(HashMap::new()),
        }
    }

    fn set_self_record(&self, record: NodeRecord) {
        *self
            .self_record
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(record);
    }

    fn from_record(&self) -> NodeRecord {
        self.self_record
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| {
                NodeRecord::new(NodeId::from_peer(&self.keypair.peer_id()), String::new())
            })
    }

    fn learn_peer(&self, peer: PeerId) {
        self.known_peers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(NodeId::from_peer(&peer), peer);
    }

    fn peer_for(&self, id: &NodeId) -> Option<PeerId> {
        self.known_peers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .copied()
    }

    /// One sealed request/reply exchange with the peer behind `record`.
    async fn exchange(&self, record: &NodeRecord, request: MeshRequest) -> Result<MeshResponse> {
        let peer = self
            .peer_for(&record.id)
            .ok_or_else(|| anyhow!("no descriptor known for contact {}", record.id))?;

        let established = self
            .selector
            .connect(&peer, EndpointScope::Control, None)
            .await
            .map_err(|e| anyhow!("connect failed: {}", e))?;
        let mut stream = established.connection.stream;

        let payload = messages::serialize(&request)?;
        let envelope = SignedEnvelope::seal(&self.keypair, request_type(&request), payload);

        timeout(RPC_EXCHANGE_TIMEOUT, async {
            messages::write_envelope(&mut stream, &envelope).await?;
            let reply = messages::read_envelope(&mut stream).await?;
            reply
                .verify()
                .map_err(|e| anyhow!("reply envelope invalid: {}", e))?;
            if reply.signer != peer {
                bail!("reply signed by {} instead of {}", reply.signer, peer);
            }
            Ok(messages::deserialize_bounded::<MeshResponse>(&reply.payload)?)
        })
        .await
        .map_err(|_| anyhow!("rpc exchange timed out"))?
    }
}

fn request_type(request: &MeshRequest) -> &'static str {
    match request {
        MeshRequest::Dht(DhtRequest::Ping { .. }) => "dht.ping",
        MeshRequest::Dht(DhtRequest::FindNode { .. }) => "dht.find_node",
        MeshRequest::Dht(DhtRequest::FindValue { .. }) => "dht.find_value",
        MeshRequest::Dht(DhtRequest::Store { .. }) => "dht.store",
        MeshRequest::Service(_) => "svc.call",
    }
}

#[async_trait]
impl DhtRpc for EnvelopeRpc {
    async fn ping(&self, to: &NodeRecord) -> Result<()> {
        let request = MeshRequest::Dht(DhtRequest::Ping {
            from: self.from_record(),
        });
        match self.exchange(to, request).await? {
            MeshResponse::Dht(DhtResponse::Ack) => Ok(()),
            other => bail!("unexpected ping response: {:?}", other),
        }
    }

    async fn find_node(&self, to: &NodeRecord, target: Key) -> Result<Vec<NodeRecord>> {
        let request = MeshRequest::Dht(DhtRequest::FindNode {
            from: self.from_record(),
            target,
        });
        match self.exchange(to, request).await? {
            MeshResponse::Dht(DhtResponse::Nodes(nodes)) => Ok(nodes),
            other => bail!("unexpected find_node response: {:?}", other),
        }
    }

    async fn find_value(
        &self,
        to: &NodeRecord,
        key: Key,
    ) -> Result<(Option<(Vec<u8>, u64)>, Vec<NodeRecord>)> {
        let request = MeshRequest::Dht(DhtRequest::FindValue {
            from: self.from_record(),
            key,
        });
        match self.exchange(to, request).await? {
            MeshResponse::Dht(DhtResponse::Value {
                value,
                ttl_secs,
                closer,
            }) => Ok((value.map(|v| (v, ttl_secs)), closer)),
            other => bail!("unexpected find_value response: {:?}", other),
        }
    }

    async fn store(&self, to: &NodeRecord, key: Key, value: Vec<u8>, ttl_secs: u64) -> Result<()> {
        let request = MeshRequest::Dht(DhtRequest::Store {
            from: self.from_record(),
            key,
            value,
            ttl_secs,
        });
        match self.exchange(to, request).await? {
            MeshResponse::Dht(DhtResponse::Ack) => Ok(()),
            MeshResponse::Dht(DhtResponse::Error { message }) => bail!("store refused: {}", message),
            other => bail!("unexpected store response: {:?}", other),
        }
    }
}

pub struct MeshNode {
    keypair: Keypair,
    listen_addr: SocketAddr,
    pub descriptors: Arc<DescriptorTable>,
    pub pins: Arc<PinManager>,
    pub throttler: Arc<ConnectionThrottler>,
    pub policies: Arc<PolicyManager>,
    pub selector: Arc<TransportSelector>,
    pub router: Arc<ServiceRouter>,
    pub gateway: Arc<PrivateGateway>,
    pub dht: DhtNode<ArcRpc>,
    rpc: Arc<EnvelopeRpc>,
    endpoint: quinn::Endpoint,
    background: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl MeshNode {
    pub async fn start(keypair: Keypair, config: MeshNodeConfig) -> Result<Arc<Self>> {
        let descriptors = Arc::new(DescriptorTable::new());
        let pins = Arc::new(PinManager::new());
        let throttler = ConnectionThrottler::new(config.throttle);
        let policies = Arc::new(PolicyManager::new());

        let dialers = build_dialers(&keypair, &config.transport)?;
        let selector = Arc::new(TransportSelector::new(
            dialers,
            policies.clone(),
            config.ranking,
            throttler.clone(),
            pins.clone(),
            descriptors.clone(),
        ));

        let (certs, key) = tls::generate_identity_cert(&keypair)?;
        let server_config = tls::create_server_config(certs, key)?;
        let endpoint = quinn::Endpoint::server(server_config, config.listen_addr)
            .context("failed to bind mesh listener")?;
        let listen_addr = endpoint.local_addr()?;

        let rpc = Arc::new(EnvelopeRpc::new(keypair.clone(), selector.clone()));
        let self_id = NodeId::from_peer(&keypair.peer_id());
        rpc.set_self_record(NodeRecord::new(self_id, listen_addr.to_string()));
        let dht = DhtNode::new(self_id, listen_addr.to_string(), ArcRpc(rpc.clone()));

        let router = ServiceRouter::new(config.router);
        let gateway = PrivateGateway::new();
        router.register(
            GatewayService::SERVICE_NAME,
            Arc::new(GatewayService::new(gateway.clone())),
        );

        let node = Arc::new(Self {
            keypair,
            listen_addr,
            descriptors,
            pins,
            throttler,
            policies,
            selector,
            router,
            gateway,
            dht,
            rpc,
            endpoint,
            background: std::sync::Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        handles.push(node.clone().spawn_listener());
        handles.push(node.pins.spawn_sweep());
        handles.push(node.gateway.spawn_sweep(GATEWAY_SWEEP_INTERVAL));
        *node
            .background
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = handles;

        info!(peer = %node.peer_id(), addr = %listen_addr, "mesh node listening");
        Ok(node)
    }

    pub fn peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// The node's own DHT record.
    pub fn self_record(&self) -> NodeRecord {
        NodeRecord::new(NodeId::from_peer(&self.peer_id()), self.listen_addr.to_string())
    }

    /// Build and sign this node's descriptor for the current listen address.
    pub fn own_descriptor(&self, sequence: u64) -> PeerDescriptor {
        let endpoint = TransportEndpoint {
            transport: crate::descriptor::TransportKind::Quic,
            host: self.listen_addr.ip().to_string(),
            port: self.listen_addr.port(),
            not_before_ms: 0,
            not_after_ms: 0,
            scope: EndpointScope::Control,
            preference: 0,
            cost: 0,
        };
        PeerDescriptor::create(
            &self.keypair,
            sequence,
            DESCRIPTOR_TTL_SECS * 1000,
            vec![endpoint],
            vec![crate::pinning::fingerprint(self.peer_id().as_bytes())],
            NatClass::Unknown,
            false,
        )
    }

    /// Apply a remote peer's descriptor: verify, store, index for the DHT,
    /// and seed the routing table with its control endpoint.
    pub async fn apply_descriptor(&self, descriptor: PeerDescriptor) -> Result<()> {
        let peer = descriptor.peer;
        let control_addr = descriptor
            .live_endpoints(EndpointScope::Control)
            .first()
            .map(|ep| ep.addr());
        self.descriptors
            .apply(descriptor)
            .map_err(|e| anyhow!("descriptor rejected: {}", e))?;
        self.rpc.learn_peer(peer);
        if let Some(addr) = control_addr {
            self.dht
                .observe_record(NodeRecord::new(NodeId::from_peer(&peer), addr))
                .await;
        }
        Ok(())
    }

    /// Publish our descriptor into the DHT under our peer-derived key.
    pub async fn publish_descriptor(&self, sequence: u64) -> Result<usize> {
        let descriptor = self.own_descriptor(sequence);
        let key = NodeId::from_peer(&self.peer_id());
        let value = messages::serialize(&descriptor)?;
        self.dht.put(key, value, DESCRIPTOR_TTL_SECS).await
    }

    /// Fetch and apply a peer's descriptor from the DHT.
    /// The fetch is charged to the requesting peer's budget.
    pub async fn fetch_descriptor(&self, peer: &PeerId) -> Result<Option<PeerDescriptor>> {
        self.throttler
            .admit_descriptor_fetch(peer)
            .map_err(|e| anyhow!("descriptor fetch throttled: {}", e))?;
        let key = NodeId::from_peer(peer);
        let Some(bytes) = self.dht.get(key).await? else {
            return Ok(None);
        };
        let descriptor: PeerDescriptor = messages::deserialize_bounded(&bytes)?;
        if descriptor.peer != *peer {
            bail!("descriptor key does not match embedded peer id");
        }
        self.apply_descriptor(descriptor.clone()).await?;
        Ok(Some(descriptor))
    }

    /// Call a service on a remote peer over the control plane.
    pub async fn call_service(
        &self,
        peer: &PeerId,
        service: &str,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<(CallStatus, Vec<u8>)> {
        let mut correlation_id = [0u8; 16];
        let _ = getrandom::getrandom(&mut correlation_id);
        let call = ServiceCall {
            service: service.to_string(),
            method: method.to_string(),
            correlation_id,
            payload,
        };

        let record = NodeRecord::new(NodeId::from_peer(peer), String::new());
        match self.rpc.exchange(&record, MeshRequest::Service(call)).await? {
            MeshResponse::Service(reply) => {
                if reply.correlation_id != correlation_id {
                    bail!("reply correlation id mismatch");
                }
                Ok((reply.status, reply.payload))
            }
            other => bail!("unexpected service response: {:?}", other),
        }
    }

    /// Connect to a peer for a given scope via the selector (dial path only).
    pub async fn connect(
        &self,
        peer: &PeerId,
        scope: EndpointScope,
        pod: Option<&str>,
    ) -> Result<crate::selector::Established, SelectError> {
        self.selector.connect(peer, scope, pod).await
    }

    fn spawn_listener(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(incoming) = self.endpoint.accept().await {
                let node = self.clone();
                tokio::spawn(async move {
                    let connection = match incoming.await {
                        Ok(c) => c,
                        Err(e) => {
                            debug!(error = %e, "inbound connection failed");
                            return;
                        }
                    };
                    let Some(peer) = tls::extract_verified_peer(&connection) else {
                        warn!("inbound connection without verifiable identity, dropping");
                        return;
                    };
                    node.rpc.learn_peer(peer);
                    debug!(peer = %peer, "inbound connection accepted");

                    loop {
                        let (send, recv) = match connection.accept_bi().await {
                            Ok(streams) => streams,
                            Err(_) => break,
                        };
                        let node = node.clone();
                        tokio::spawn(async move {
                            if let Err(e) = node.serve_stream(peer, send, recv).await {
                                debug!(peer = %peer, error = %e, "control stream ended");
                            }
                        });
                    }
                    node.gateway.close_for_peer(&peer);
                });
            }
        })
    }

    /// Serve one control stream: one verified envelope in, one sealed
    /// envelope out.
    async fn serve_stream(
        &self,
        peer: PeerId,
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
    ) -> Result<()> {
        let envelope = messages::read_envelope(&mut recv).await?;

        // Admission before any verification work beyond the cheap reads:
        // the envelope budget is keyed by the mTLS-verified peer, not the
        // claimed signer.
        self.throttler
            .admit_envelope(&peer)
            .map_err(|e| anyhow!("envelope budget: {}", e))?;

        envelope
            .verify()
            .map_err(|e| anyhow!("envelope rejected: {}", e))?;
        if envelope.signer != peer {
            bail!("envelope signer {} does not match connection peer {}", envelope.signer, peer);
        }

        let request: MeshRequest = messages::deserialize_bounded(&envelope.payload)?;
        let response = self.handle_request(peer, request).await;

        let payload = messages::serialize(&response)?;
        let reply = SignedEnvelope::seal(&self.keypair, "reply", payload);
        messages::write_envelope(&mut send, &reply).await?;
        let _ = send.finish();
        Ok(())
    }

    async fn handle_request(&self, peer: PeerId, request: MeshRequest) -> MeshResponse {
        match request {
            MeshRequest::Dht(dht_request) => {
                // The claimed `from` record is untrusted; rebuild it from
                // the authenticated connection instead.
                let from = NodeRecord::new(
                    NodeId::from_peer(&peer),
                    self.descriptors
                        .get(&peer)
                        .and_then(|d| {
                            d.live_endpoints(EndpointScope::Control)
                                .first()
                                .map(|ep| ep.addr())
                        })
                        .unwrap_or_default(),
                );
                match dht_request {
                    DhtRequest::Ping { .. } => {
                        self.dht.handle_ping(from).await;
                        MeshResponse::Dht(DhtResponse::Ack)
                    }
                    DhtRequest::FindNode { target, .. } => {
                        let nodes = self.dht.handle_find_node(from, target).await;
                        MeshResponse::Dht(DhtResponse::Nodes(nodes))
                    }
                    DhtRequest::FindValue { key, .. } => {
                        let (value, closer) = self.dht.handle_find_value(from, key).await;
                        let (value, ttl_secs) = match value {
                            Some((v, ttl)) => (Some(v), ttl),
                            None => (None, 0),
                        };
                        MeshResponse::Dht(DhtResponse::Value {
                            value,
                            ttl_secs,
                            closer,
                        })
                    }
                    DhtRequest::Store {
                        key, value, ttl_secs, ..
                    } => {
                        if self.dht.handle_store(from, key, value, ttl_secs).await {
                            MeshResponse::Dht(DhtResponse::Ack)
                        } else {
                            MeshResponse::Dht(DhtResponse::Error {
                                message: "store rejected".to_string(),
                            })
                        }
                    }
                }
            }
            MeshRequest::Service(call) => {
                MeshResponse::Service(self.router.dispatch(peer, call).await)
            }
        }
    }

    /// Stop background tasks and close the listener.
    pub async fn shutdown(&self) {
        let handles = std::mem::take(
            &mut *self
                .background
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for handle in handles {
            handle.abort();
        }
        self.dht.quit().await;
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

/// Arc adapter so the DHT's generic network parameter can share the node's
/// RPC client.
pub struct ArcRpc(pub Arc<EnvelopeRpc>);

#[async_trait]
impl DhtRpc for ArcRpc {
    async fn ping(&self, to: &NodeRecord) -> Result<()> {
        self.0.ping(to).await
    }

    async fn find_node(&self, to: &NodeRecord, target: Key) -> Result<Vec<NodeRecord>> {
        self.0.find_node(to, target).await
    }

    async fn find_value(
        &self,
        to: &NodeRecord,
        key: Key,
    ) -> Result<(Option<(Vec<u8>, u64)>, Vec<NodeRecord>)> {
        self.0.find_value(to, key).await
    }

    async fn store(&self, to: &NodeRecord, key: Key, value: Vec<u8>, ttl_secs: u64) -> Result<()> {
        self.0.store(to, key, value, ttl_secs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn local_node() -> Arc<MeshNode> {
        let config = MeshNodeConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        MeshNode::start(Keypair::generate(), config).await.unwrap()
    }

    /// Introduce `b` to `a` by applying b's descriptor.
    async fn introduce(a: &Arc<MeshNode>, b: &Arc<MeshNode>) {
        a.apply_descriptor(b.own_descriptor(1)).await.unwrap();
    }

    #[tokio::test]
    async fn nodes_exchange_service_calls_over_quic() {
        let a = local_node().await;
        let b = local_node().await;
        introduce(&a, &b).await;

        struct Shout;
        #[async_trait]
        impl crate::router::MeshService for Shout {
            async fn handle(
                &self,
                _caller: PeerId,
                _method: &str,
                payload: &[u8],
            ) -> Result<Vec<u8>> {
                Ok(payload.to_ascii_uppercase())
            }
        }
        b.router.register("shout", Arc::new(Shout));

        let (status, payload) = a
            .call_service(&b.peer_id(), "shout", "run", b"quiet".to_vec())
            .await
            .unwrap();
        assert_eq!(status, CallStatus::Ok);
        assert_eq!(payload, b"QUIET");

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_service_returns_not_found_status() {
        let a = local_node().await;
        let b = local_node().await;
        introduce(&a, &b).await;

        let (status, _) = a
            .call_service(&b.peer_id(), "missing", "run", vec![])
            .await
            .unwrap();
        assert_eq!(status, CallStatus::ServiceNotFound);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn dht_store_and_fetch_between_nodes() {
        let a = local_node().await;
        let b = local_node().await;
        introduce(&a, &b).await;
        introduce(&b, &a).await;

        let key = NodeId::from_material(b"shared-key");
        a.dht.put(key, b"shared-value".to_vec(), 600).await.unwrap();

        let fetched = b.dht.get(key).await.unwrap();
        assert_eq!(fetched, Some(b"shared-value".to_vec()));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn descriptor_publish_and_fetch_via_dht() {
        let a = local_node().await;
        let b = local_node().await;
        introduce(&a, &b).await;
        introduce(&b, &a).await;

        a.publish_descriptor(2).await.unwrap();

        let fetched = b.fetch_descriptor(&a.peer_id()).await.unwrap();
        let descriptor = fetched.expect("descriptor should be discoverable");
        assert_eq!(descriptor.peer, a.peer_id());
        assert_eq!(descriptor.sequence, 2);
        // b can now dial a without out-of-band introduction
        assert!(b.descriptors.get(&a.peer_id()).is_some());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn first_contact_pins_peer_certificate() {
        let a = local_node().await;
        let b = local_node().await;
        introduce(&a, &b).await;

        let _ = a
            .call_service(&b.peer_id(), "anything", "run", vec![])
            .await
            .unwrap();
        assert!(a.pins.is_pinned(&b.peer_id()));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn gateway_service_is_registered_and_enforces_policy() {
        let a = local_node().await;
        let b = local_node().await;
        introduce(&a, &b).await;

        // No pod policy on b: every open is rejected as unknown pod.
        let request = crate::messages::OpenTunnelRequest {
            pod_id: "pod-x".to_string(),
            destination_host: "203.0.113.5".to_string(),
            destination_port: 80,
            service_name: None,
            request_nonce: [0u8; 16],
            request_timestamp_ms: crate::identity::now_ms(),
        };
        let (status, payload) = a
            .call_service(
                &b.peer_id(),
                GatewayService::SERVICE_NAME,
                "open",
                messages::serialize(&request).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(status, CallStatus::Ok);
        let response: crate::messages::OpenTunnelResponse =
            messages::deserialize_bounded(&payload).unwrap();
        assert!(!response.accepted);
        assert_eq!(response.reason, "unknown_pod");

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn stale_sequence_descriptor_is_discarded() {
        let a = local_node().await;
        let b = local_node().await;

        a.apply_descriptor(b.own_descriptor(5)).await.unwrap();
        assert!(a.apply_descriptor(b.own_descriptor(3)).await.is_err());

        a.shutdown().await;
        b.shutdown().await;
    }
}
