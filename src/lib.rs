//! # Soulmesh - Censorship-Resistant Mesh Overlay
//!
//! Soulmesh is the peer-to-peer overlay substrate of a Soulseek-compatible
//! file-sharing client: a trust-and-transport layer used for distributed
//! service discovery, encrypted tunneling, and swarm coordination when the
//! legacy server is degraded or undesirable.
//!
//! ## What Lives Here
//!
//! - **Identity & signing**: Ed25519 identities, canonical encoding,
//!   domain-separated signatures, tamper-evident control envelopes
//! - **Trust**: TOFU certificate pinning with signed-rotation grace periods
//! - **Transports**: six pluggable dialers (QUIC, Tor, I2P, WebSocket
//!   tunnel, domain-fronted HTTPS, pluggable obfuscation) behind one
//!   capability contract, with policy-driven selection and anti-downgrade
//!   protection
//! - **Admission**: token-bucket throttling per connection, endpoint,
//!   transport, and peer, with auth-failure backoff
//! - **Discovery**: a Kademlia-style DHT with splitting k-buckets,
//!   ping-before-evict, and iterative lookups
//! - **Service fabric**: signed service descriptors, a call router with
//!   circuit breakers and work budgets, and a private gateway that tunnels
//!   TCP between pod members under strict destination filtering
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | Keypairs and peer ids |
//! | `signing` | Canonical encoding, signatures, envelopes |
//! | `descriptor` | Peer descriptors and transport endpoints |
//! | `pinning` | TOFU certificate pin manager |
//! | `ratelimit` | Token buckets |
//! | `throttle` | Connection admission control |
//! | `tls` | Identity-bound certificates |
//! | `transport` | The six transport dialers |
//! | `selector` | Policy, downgrade protection, selection |
//! | `dht` | Kademlia routing, storage, lookups |
//! | `messages` | Wire types and framing |
//! | `protocols` | RPC trait seams |
//! | `services` | Signed service descriptors |
//! | `router` | Service call routing |
//! | `gateway` | Private TCP tunnel gateway |
//! | `node` | The assembled mesh node |
//!
//! ## Concurrency Model
//!
//! Components serve many concurrent callers over concurrency-safe shared
//! state: the DHT owns its mutable state in an actor behind a cloneable
//! handle, and everything else uses lock-scoped maps and atomic counters.
//! Every suspending operation carries a timeout, and a hung dial to one
//! peer never delays work for unrelated peers.

mod descriptor;
mod dht;
mod gateway;
mod identity;
mod messages;
mod node;
mod pinning;
mod protocols;
mod ratelimit;
mod router;
mod selector;
mod services;
mod signing;
mod throttle;
mod tls;
mod transport;

pub use descriptor::{
    DescriptorError, DescriptorTable, EndpointScope, NatClass, PeerDescriptor, TransportEndpoint,
    TransportKind,
};
pub use dht::{DhtNode, Key, NodeId, NodeRecord, PendingEviction, RoutingTable, ALPHA, K};
pub use gateway::{
    host_matches_pattern, is_hard_blocked, AllowPattern, GatewayService, PodMember, PodPolicy,
    PrivateGateway, RegisteredService, TunnelError, TunnelSession,
};
pub use identity::{Keypair, PeerId};
pub use messages::{
    deserialize_bounded, read_envelope, serialize, write_envelope, CallStatus,
    CloseTunnelRequest, CloseTunnelResponse, DhtRequest, DhtResponse, MeshRequest, MeshResponse,
    OpenTunnelRequest, OpenTunnelResponse, ServiceCall, ServiceReply,
};
pub use node::{ArcRpc, EnvelopeRpc, MeshNode, MeshNodeConfig};
pub use pinning::{fingerprint, PinError, PinFingerprint, PinManager, PinRotation, PinVerdict};
pub use protocols::DhtRpc;
pub use ratelimit::{KeyedBuckets, TokenBucket};
pub use router::{MeshService, RouterConfig, ServiceRouter};
pub use selector::{
    DowngradeBlocked, DowngradeProtector, Established, PolicyManager, SelectError,
    StrengthRanking, TransportPolicy, TransportSelector,
};
pub use services::{
    derive_service_id, publish as publish_service, resolve as resolve_service, ServiceDescriptor,
    ServiceDescriptorError,
};
pub use signing::{
    sign_with_domain, verify_with_domain, Canonical, EnvelopeError, SignatureError,
    SignedEnvelope,
};
pub use throttle::{ConnectionThrottler, DialPermit, ThrottleConfig, ThrottleDenied};
pub use transport::{
    build_dialers, Dialer, DialerStats, FrontedHttpDialer, I2pDialer, MeshConnection, MeshStream,
    ObfsDialer, QuicDialer, StreamIo, TorDialer, TransportConfig, WsByteStream, WsTunnelDialer,
};
