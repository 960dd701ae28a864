//! # Peer Descriptors
//!
//! A peer descriptor is the signed, self-published record describing how to
//! reach a peer: its transport endpoints, certificate pins, control-signing
//! keys, NAT class, and whether a relay is required.
//!
//! ## Ordering Invariant
//!
//! Descriptors from the same peer are totally ordered by `sequence`. A higher
//! sequence number supersedes older ones; a lower-sequence descriptor
//! arriving later is discarded. Past-expiry descriptors are inert: the
//! [`DescriptorTable`] refuses to hand them out.
//!
//! ## Trust Boundary
//!
//! Descriptors travel through the DHT and direct exchange, so every field is
//! attacker-controlled until the Ed25519 signature over the canonical
//! encoding verifies against the embedded peer id. Structural bounds are
//! checked before signature verification to avoid wasting cycles on
//! obviously malformed records.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::identity::{now_ms, Keypair, PeerId};
use crate::signing::{
    sign_with_domain, verify_with_domain, Canonical, SignatureError, DESCRIPTOR_SIGNATURE_DOMAIN,
};

/// Maximum endpoints a descriptor may carry.
/// SECURITY: Bounds deserialization of untrusted records.
const MAX_ENDPOINTS: usize = 16;

/// Maximum host string length in an endpoint.
const MAX_HOST_LEN: usize = 256;

/// Maximum certificate pins in a descriptor.
const MAX_PINS: usize = 8;

/// Maximum control-signing keys in a descriptor.
const MAX_CONTROL_KEYS: usize = 4;

// ============================================================================
// Transport Endpoint
// ============================================================================

/// The transport technologies the mesh can dial.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportKind {
    /// Direct QUIC with identity-bound TLS.
    Quic,
    /// Tor via local SOCKS5 proxy with per-destination stream isolation.
    Tor,
    /// I2P via local SOCKS5 proxy.
    I2p,
    /// WebSocket tunnel for restrictive networks.
    WsTunnel,
    /// Domain-fronted HTTPS bridge.
    FrontedHttp,
    /// Pluggable obfuscation via an external helper process.
    Obfs,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::Quic => "quic",
            TransportKind::Tor => "tor",
            TransportKind::I2p => "i2p",
            TransportKind::WsTunnel => "ws-tunnel",
            TransportKind::FrontedHttp => "fronted-http",
            TransportKind::Obfs => "obfs",
        };
        write!(f, "{}", s)
    }
}

/// Whether an endpoint carries control RPCs or bulk data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointScope {
    Control,
    Data,
}

/// NAT classification published by the peer itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatClass {
    #[default]
    Unknown,
    /// Publicly reachable.
    Open,
    /// Behind NAT, hole punching feasible.
    Restricted,
    /// Symmetric NAT, relay required.
    Symmetric,
}

/// One dialable endpoint. Owned by the descriptor, immutable once published.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportEndpoint {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    /// Validity window start, ms since epoch (0 = always valid from creation).
    pub not_before_ms: u64,
    /// Validity window end, ms since epoch (0 = no expiry).
    pub not_after_ms: u64,
    pub scope: EndpointScope,
    /// Selection preference; lower wins within a policy class.
    pub preference: u8,
    /// Relative resource cost of using this endpoint (relay bandwidth etc.).
    pub cost: u8,
}

impl TransportEndpoint {
    /// Whether the endpoint is inside its validity window at `at_ms`.
    pub fn is_valid_at(&self, at_ms: u64) -> bool {
        if self.not_before_ms != 0 && at_ms < self.not_before_ms {
            return false;
        }
        if self.not_after_ms != 0 && at_ms > self.not_after_ms {
            return false;
        }
        true
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn encode(&self, c: &mut Canonical) {
        c.str(&self.transport.to_string())
            .str(&self.host)
            .u16(self.port)
            .u64(self.not_before_ms)
            .u64(self.not_after_ms)
            .u8(match self.scope {
                EndpointScope::Control => 0,
                EndpointScope::Data => 1,
            })
            .u8(self.preference)
            .u8(self.cost);
    }
}

// ============================================================================
// Peer Descriptor
// ============================================================================

/// Reasons a descriptor fails verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorError {
    /// Structural bounds violated (too many endpoints, oversized host, ...).
    MalformedStructure,
    /// Cryptographic signature verification failed.
    Signature(SignatureError),
    /// The descriptor is past its expiry timestamp.
    Expired { expired_ms_ago: u64 },
    /// A newer sequence for this peer is already known.
    StaleSequence { known: u64, offered: u64 },
}

impl std::fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescriptorError::MalformedStructure => write!(f, "descriptor structure out of bounds"),
            DescriptorError::Signature(e) => write!(f, "descriptor signature invalid: {}", e),
            DescriptorError::Expired { expired_ms_ago } => {
                write!(f, "descriptor expired {} ms ago", expired_ms_ago)
            }
            DescriptorError::StaleSequence { known, offered } => {
                write!(f, "descriptor sequence {} superseded by {}", offered, known)
            }
        }
    }
}

impl std::error::Error for DescriptorError {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub peer: PeerId,
    /// Monotonically increasing per-peer sequence number.
    pub sequence: u64,
    /// Expiry, ms since epoch. Past-expiry descriptors are inert.
    pub expires_at_ms: u64,
    pub endpoints: Vec<TransportEndpoint>,
    /// BLAKE3 fingerprints of acceptable transport certificate keys.
    pub cert_pins: Vec<[u8; 32]>,
    /// Additional Ed25519 keys authorized to sign control messages.
    pub control_keys: Vec<[u8; 32]>,
    pub nat_class: NatClass,
    pub relay_required: bool,
    pub signature: Vec<u8>,
}

impl PeerDescriptor {
    /// Create and sign a descriptor for the local peer.
    pub fn create(
        keypair: &Keypair,
        sequence: u64,
        ttl_ms: u64,
        endpoints: Vec<TransportEndpoint>,
        cert_pins: Vec<[u8; 32]>,
        nat_class: NatClass,
        relay_required: bool,
    ) -> Self {
        let peer = keypair.peer_id();
        let expires_at_ms = now_ms().saturating_add(ttl_ms);
        let mut descriptor = Self {
            peer,
            sequence,
            expires_at_ms,
            endpoints,
            cert_pins,
            control_keys: Vec::new(),
            nat_class,
            relay_required,
            signature: Vec::new(),
        };
        let payload = descriptor.canonical_payload();
        descriptor.signature = sign_with_domain(keypair, DESCRIPTOR_SIGNATURE_DOMAIN, &payload);
        descriptor
    }

    fn canonical_payload(&self) -> Vec<u8> {
        let mut c = Canonical::new();
        c.fixed(self.peer.as_bytes())
            .u64(self.sequence)
            .u64(self.expires_at_ms);
        c.u64(self.endpoints.len() as u64);
        for ep in &self.endpoints {
            ep.encode(&mut c);
        }
        c.u64(self.cert_pins.len() as u64);
        for pin in &self.cert_pins {
            c.fixed(pin);
        }
        c.u64(self.control_keys.len() as u64);
        for key in &self.control_keys {
            c.fixed(key);
        }
        c.u8(match self.nat_class {
            NatClass::Unknown => 0,
            NatClass::Open => 1,
            NatClass::Restricted => 2,
            NatClass::Symmetric => 3,
        });
        c.u8(self.relay_required as u8);
        c.finish()
    }

    /// Validate structural bounds without touching cryptography.
    ///
    /// SECURITY: Prevents memory and CPU burn on grossly malformed records
    /// deserialized from the network.
    pub fn validate_structure(&self) -> bool {
        if self.endpoints.len() > MAX_ENDPOINTS {
            return false;
        }
        for ep in &self.endpoints {
            if ep.host.is_empty() || ep.host.len() > MAX_HOST_LEN {
                return false;
            }
        }
        if self.cert_pins.len() > MAX_PINS || self.control_keys.len() > MAX_CONTROL_KEYS {
            return false;
        }
        if !self.signature.is_empty() && self.signature.len() != 64 {
            return false;
        }
        true
    }

    /// Verify structure, signature, and expiry.
    pub fn verify(&self) -> Result<(), DescriptorError> {
        if !self.validate_structure() {
            return Err(DescriptorError::MalformedStructure);
        }
        let payload = self.canonical_payload();
        verify_with_domain(
            &self.peer,
            DESCRIPTOR_SIGNATURE_DOMAIN,
            &payload,
            &self.signature,
        )
        .map_err(DescriptorError::Signature)?;

        let now = now_ms();
        if now > self.expires_at_ms {
            return Err(DescriptorError::Expired {
                expired_ms_ago: now - self.expires_at_ms,
            });
        }
        Ok(())
    }

    pub fn is_expired(&self) -> bool {
        now_ms() > self.expires_at_ms
    }

    /// Endpoints matching a scope, still inside their validity window.
    pub fn live_endpoints(&self, scope: EndpointScope) -> Vec<&TransportEndpoint> {
        let now = now_ms();
        self.endpoints
            .iter()
            .filter(|ep| ep.scope == scope && ep.is_valid_at(now))
            .collect()
    }
}

// ============================================================================
// Descriptor Table
// ============================================================================

/// Per-peer descriptor storage enforcing sequence ordering and expiry.
///
/// Read-only to the selector and DHT; only `apply` mutates, and only with a
/// verified, newer-sequence descriptor.
#[derive(Default)]
pub struct DescriptorTable {
    inner: RwLock<HashMap<PeerId, PeerDescriptor>>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a descriptor after full verification.
    ///
    /// Returns `Ok(true)` if it replaced or inserted state, or the typed
    /// rejection otherwise. A lower-or-equal sequence from a peer we already
    /// know is discarded without touching stored state.
    pub fn apply(&self, descriptor: PeerDescriptor) -> Result<bool, DescriptorError> {
        descriptor.verify()?;

        let mut table = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(existing) = table.get(&descriptor.peer) {
            if existing.sequence >= descriptor.sequence {
                return Err(DescriptorError::StaleSequence {
                    known: existing.sequence,
                    offered: descriptor.sequence,
                });
            }
        }
        tracing::debug!(
            peer = %descriptor.peer,
            sequence = descriptor.sequence,
            endpoints = descriptor.endpoints.len(),
            "descriptor applied"
        );
        table.insert(descriptor.peer, descriptor);
        Ok(true)
    }

    /// Fetch the live descriptor for a peer. Expired descriptors are inert
    /// and never returned.
    pub fn get(&self, peer: &PeerId) -> Option<PeerDescriptor> {
        let table = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        table.get(peer).filter(|d| !d.is_expired()).cloned()
    }

    /// Drop expired descriptors. Returns the number removed.
    pub fn sweep_expired_once(&self) -> usize {
        let mut table = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = table.len();
        table.retain(|_, d| !d.is_expired());
        before - table.len()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
