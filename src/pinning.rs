//! # Certificate Pin Manager
//!
//! Trust-on-first-use (TOFU) certificate pinning with signed-rotation grace
//! periods.
//!
//! ## Trust Model
//!
//! The first certificate key fingerprint seen for a peer is pinned. Later
//! handshakes must present a key matching a current pin or fail closed. A pin
//! is never silently overwritten: replacing it requires a rotation statement
//! signed by the peer's identity key, after which the old pin set is retained
//! in a timestamped "previous" slot for a bounded grace window so in-flight
//! peers and stale descriptors keep working during the rollover.
//!
//! ## Fingerprints
//!
//! A pin is `BLAKE3(certificate public key)`. Since transport certificates
//! embed the peer's Ed25519 key directly (see [`crate::transport`]), the pin
//! binds the TLS layer to the mesh identity.
//!
//! ## Sweeping
//!
//! Out-of-grace previous sets are purged by [`PinManager::sweep_expired_once`],
//! exposed as a single-iteration entry point so tests are deterministic; the
//! spawned periodic task just calls it in a loop.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::identity::{Keypair, PeerId};
use crate::signing::{
    sign_with_domain, verify_with_domain, Canonical, SignatureError, PIN_ROTATION_DOMAIN,
};

/// Default grace window during which a rotated-out pin still validates.
pub const DEFAULT_ROTATION_GRACE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Interval between sweep iterations of the background task.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// A certificate key fingerprint: BLAKE3 of the certificate's public key.
pub type PinFingerprint = [u8; 32];

/// Compute the pin fingerprint for a certificate public key.
#[inline]
pub fn fingerprint(cert_public_key: &[u8]) -> PinFingerprint {
    *blake3::hash(cert_public_key).as_bytes()
}

/// Outcome of validating a presented certificate against pinned state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinVerdict {
    /// Matched the current pin set.
    MatchesCurrent,
    /// Matched the previous pin set inside the rotation grace window.
    MatchesPreviousInGrace,
    /// First contact: the fingerprint was pinned (TOFU).
    PinnedFirstUse,
}

/// Reasons pin validation fails closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinError {
    /// The presented fingerprint matches neither current nor in-grace pins.
    Mismatch,
    /// Matched only a previous pin whose grace window has elapsed.
    GraceExpired,
    /// A rotation statement failed signature verification.
    RotationSignature(SignatureError),
    /// A rotation statement names a peer with no pinned state.
    UnknownPeer,
}

impl std::fmt::Display for PinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PinError::Mismatch => write!(f, "certificate does not match pinned keys"),
            PinError::GraceExpired => write!(f, "certificate matches only an expired pin"),
            PinError::RotationSignature(e) => write!(f, "pin rotation signature invalid: {}", e),
            PinError::UnknownPeer => write!(f, "pin rotation for unpinned peer"),
        }
    }
}

impl std::error::Error for PinError {}

/// Signed statement authorizing a pin rotation.
///
/// SECURITY: Only the peer's own identity key can authorize replacing its
/// pins; an attacker who compromises a transport certificate but not the
/// identity key cannot rotate themselves into trust.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PinRotation {
    pub peer: PeerId,
    pub new_pins: Vec<PinFingerprint>,
    pub issued_at_ms: u64,
    pub signature: Vec<u8>,
}

impl PinRotation {
    pub fn create(keypair: &Keypair, new_pins: Vec<PinFingerprint>) -> Self {
        let peer = keypair.peer_id();
        let issued_at_ms = crate::identity::now_ms();
        let payload = Self::canonical_payload(&peer, &new_pins, issued_at_ms);
        let signature = sign_with_domain(keypair, PIN_ROTATION_DOMAIN, &payload);
        Self {
            peer,
            new_pins,
            issued_at_ms,
            signature,
        }
    }

    fn canonical_payload(peer: &PeerId, pins: &[PinFingerprint], issued_at_ms: u64) -> Vec<u8> {
        let mut c = Canonical::new();
        c.fixed(peer.as_bytes()).u64(issued_at_ms);
        c.u64(pins.len() as u64);
        for pin in pins {
            c.fixed(pin);
        }
        c.finish()
    }

    pub fn verify(&self) -> Result<(), SignatureError> {
        let payload = Self::canonical_payload(&self.peer, &self.new_pins, self.issued_at_ms);
        verify_with_domain(&self.peer, PIN_ROTATION_DOMAIN, &payload, &self.signature)
    }
}

#[derive(Debug, Clone)]
struct PinSet {
    current: HashSet<PinFingerprint>,
    /// Pins displaced by the most recent rotation, kept until grace elapses.
    previous: Option<(HashSet<PinFingerprint>, Instant)>,
}

/// Diagnostic snapshot of one peer's pin state.
#[derive(Debug, Clone)]
pub struct PinDiagnostics {
    pub peer: PeerId,
    pub current_pins: usize,
    pub previous_pins: usize,
    pub previous_age: Option<Duration>,
}

pub struct PinManager {
    pins: RwLock<HashMap<PeerId, PinSet>>,
    grace: Duration,
}

impl PinManager {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_ROTATION_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            pins: RwLock::new(HashMap::new()),
            grace,
        }
    }

    /// Validate a presented certificate fingerprint for a peer.
    ///
    /// First contact pins the fingerprint (TOFU) and succeeds. Afterwards the
    /// fingerprint must match a current pin, or a previous pin still inside
    /// the rotation grace window; anything else fails closed.
    pub fn validate(&self, peer: &PeerId, presented: &PinFingerprint) -> Result<PinVerdict, PinError> {
        let mut pins = self
            .pins
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        match pins.get(peer) {
            None => {
                let mut current = HashSet::new();
                current.insert(*presented);
                pins.insert(
                    *peer,
                    PinSet {
                        current,
                        previous: None,
                    },
                );
                info!(peer = %peer, pin = %hex::encode(&presented[..8]), "pinned first-seen certificate (TOFU)");
                Ok(PinVerdict::PinnedFirstUse)
            }
            Some(set) => {
                if set.current.contains(presented) {
                    return Ok(PinVerdict::MatchesCurrent);
                }
                if let Some((previous, rotated_at)) = &set.previous {
                    if previous.contains(presented) {
                        if rotated_at.elapsed() <= self.grace {
                            return Ok(PinVerdict::MatchesPreviousInGrace);
                        }
                        warn!(
                            peer = %peer,
                            pin = %hex::encode(&presented[..8]),
                            "certificate matches only an out-of-grace previous pin"
                        );
                        return Err(PinError::GraceExpired);
                    }
                }
                warn!(
                    peer = %peer,
                    pin = %hex::encode(&presented[..8]),
                    "certificate pin mismatch, failing closed"
                );
                Err(PinError::Mismatch)
            }
        }
    }

    /// Apply a signed rotation: current pins move to the timestamped previous
    /// slot, the rotation's pins become current.
    pub fn apply_rotation(&self, rotation: &PinRotation) -> Result<(), PinError> {
        rotation.verify().map_err(PinError::RotationSignature)?;

        let mut pins = self
            .pins
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let set = pins.get_mut(&rotation.peer).ok_or(PinError::UnknownPeer)?;

        let displaced = std::mem::take(&mut set.current);
        set.previous = Some((displaced, Instant::now()));
        set.current = rotation.new_pins.iter().copied().collect();

        info!(
            peer = %rotation.peer,
            new_pins = set.current.len(),
            "applied signed pin rotation"
        );
        Ok(())
    }

    /// Whether any pin state exists for a peer.
    pub fn is_pinned(&self, peer: &PeerId) -> bool {
        self.pins
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(peer)
    }

    /// Diagnostic view of a peer's pin state.
    pub fn diagnostics(&self, peer: &PeerId) -> Option<PinDiagnostics> {
        let pins = self
            .pins
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        pins.get(peer).map(|set| PinDiagnostics {
            peer: *peer,
            current_pins: set.current.len(),
            previous_pins: set.previous.as_ref().map(|(p, _)| p.len()).unwrap_or(0),
            previous_age: set.previous.as_ref().map(|(_, at)| at.elapsed()),
        })
    }

    /// Purge previous pin sets whose grace window has elapsed.
    /// Returns the number of peers whose previous set was dropped.
    pub fn sweep_expired_once(&self) -> usize {
        let mut pins = self
            .pins
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut purged = 0;
        for (peer, set) in pins.iter_mut() {
            if let Some((_, rotated_at)) = &set.previous {
                if rotated_at.elapsed() > self.grace {
                    set.previous = None;
                    purged += 1;
                    debug!(peer = %peer, "purged out-of-grace previous pin set");
                }
            }
        }
        purged
    }

    /// Spawn the periodic sweep. The task exits when the returned handle is
    /// aborted; sweeping is idempotent so stop/restart is safe.
    pub fn spawn_sweep(self: &std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let purged = manager.sweep_expired_once();
                if purged > 0 {
                    debug!(purged, "pin sweep purged expired previous sets");
                }
            }
        })
    }
}

impl Default for PinManager {
    fn default() -> Self {
        Self::new()
    }
}
