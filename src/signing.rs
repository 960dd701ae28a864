//! # Canonical Signing
//!
//! Deterministic encoding and domain-separated Ed25519 signing for every
//! trust-boundary structure in the mesh: peer descriptors, service
//! descriptors, pin rotations, and control envelopes.
//!
//! ## Canonical Form
//!
//! Equal structures must always produce identical signing input, regardless
//! of how they were built. [`Canonical`] enforces this with:
//!
//! - Fixed field order (the caller writes fields in declaration order)
//! - Explicit little-endian length prefixes for variable-size data
//! - Map entries sorted by key bytes before encoding
//!
//! ## Domain Separation
//!
//! SECURITY: Each signed data type uses a unique domain prefix so a signature
//! produced in one context can never be replayed in another.
//!
//! ## Envelopes
//!
//! [`SignedEnvelope`] additionally binds a timestamp and a BLAKE3 hash of the
//! payload, so replay or payload substitution is detectable without
//! re-hashing the full payload on every inspection.

use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::identity::{now_ms, Keypair, PeerId};

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures.
/// Used across all mesh signature verification (descriptors, envelopes, rotations).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Error type for envelope verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The signature over the envelope header did not verify.
    Signature(SignatureError),
    /// The payload hash does not match the payload (substitution).
    PayloadHashMismatch,
    /// The timestamp is too far in the past (replay window exceeded).
    Stale { age_ms: u64 },
    /// The timestamp is too far in the future (clock skew).
    FutureDated { drift_ms: u64 },
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::Signature(e) => write!(f, "envelope signature invalid: {}", e),
            EnvelopeError::PayloadHashMismatch => write!(f, "envelope payload hash mismatch"),
            EnvelopeError::Stale { age_ms } => write!(f, "envelope stale ({} ms old)", age_ms),
            EnvelopeError::FutureDated { drift_ms } => {
                write!(f, "envelope future-dated ({} ms ahead)", drift_ms)
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================
//
// SECURITY: Domain separation prevents cross-protocol signature replay.
// Each signed data type uses a unique prefix.

/// Domain separation prefix for peer descriptor signatures.
pub const DESCRIPTOR_SIGNATURE_DOMAIN: &[u8] = b"soulmesh-descriptor-v1:";

/// Domain separation prefix for service descriptor signatures.
pub const SERVICE_SIGNATURE_DOMAIN: &[u8] = b"soulmesh-service-v1:";

/// Domain separation prefix for control envelope signatures.
pub const ENVELOPE_SIGNATURE_DOMAIN: &[u8] = b"soulmesh-envelope-v1:";

/// Domain separation prefix for certificate pin rotation statements.
pub const PIN_ROTATION_DOMAIN: &[u8] = b"soulmesh-pin-rotation-v1:";

// ============================================================================
// Canonical Encoder
// ============================================================================

/// Deterministic byte encoder for signing input.
///
/// All variable-length data carries an explicit u32 little-endian length so
/// adjacent fields can never be confused by concatenation, and map entries
/// are sorted by key bytes so insertion order never changes the encoding.
#[derive(Default)]
pub struct Canonical {
    buf: Vec<u8>,
}

impl Canonical {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// Fixed-size field, no length prefix.
    pub fn fixed(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Variable-size field with explicit length prefix.
    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(v);
        self
    }

    pub fn str(&mut self, v: &str) -> &mut Self {
        self.bytes(v.as_bytes())
    }

    /// Encode a string map with entries sorted by key bytes.
    pub fn sorted_map<'a, I>(&mut self, entries: I) -> &mut Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut sorted: Vec<(&String, &String)> = entries.into_iter().collect();
        sorted.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        self.buf
            .extend_from_slice(&(sorted.len() as u32).to_le_bytes());
        for (k, v) in sorted {
            self.str(k);
            self.str(v);
        }
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign data with domain separation.
///
/// Prepends the domain prefix to the data before signing, preventing
/// cross-protocol signature replay.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature with domain separation.
///
/// Reconstructs the prefixed data and verifies the Ed25519 signature
/// against the claimed signer's public key.
pub fn verify_with_domain(
    signer: &PeerId,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key = VerifyingKey::try_from(signer.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Signed Control Envelope
// ============================================================================

/// Maximum age for an envelope before it is rejected as a replay (5 minutes).
const ENVELOPE_MAX_AGE_MS: u64 = 5 * 60 * 1000;

/// Tolerance for future-dated envelope timestamps.
/// SECURITY: Kept tight (5s) to bound pre-dating attacks while
/// accommodating minor NTP drift.
const ENVELOPE_FUTURE_TOLERANCE_MS: u64 = 5_000;

/// Control envelope wrapping every mesh RPC payload.
///
/// The signature covers the canonical header plus the payload hash, binding
/// the envelope type, message id, and timestamp to the payload content.
/// Verifying the hash match detects payload substitution without having the
/// signature cover the (potentially large) payload bytes directly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedEnvelope {
    /// Envelope type tag (e.g. "dht.find_node", "svc.call").
    pub msg_type: String,
    /// Random message id for correlation and dedup.
    pub message_id: [u8; 16],
    /// Milliseconds since Unix epoch at seal time.
    pub timestamp_ms: u64,
    /// BLAKE3 hash of `payload`.
    pub payload_hash: [u8; 32],
    /// Opaque payload bytes (bincode-encoded request/response).
    pub payload: Vec<u8>,
    /// The sealing peer.
    pub signer: PeerId,
    /// Ed25519 signature over the canonical header.
    pub signature: Vec<u8>,
}

impl SignedEnvelope {
    /// Seal a payload into a signed envelope.
    pub fn seal(keypair: &Keypair, msg_type: &str, payload: Vec<u8>) -> Self {
        let mut message_id = [0u8; 16];
        // Zero id on CSPRNG failure is detectable and non-exploitable:
        // the signature still binds the payload.
        let _ = getrandom::getrandom(&mut message_id);

        let timestamp_ms = now_ms();
        let payload_hash = *blake3::hash(&payload).as_bytes();
        let signer = keypair.peer_id();

        let header = Self::canonical_header(msg_type, &message_id, timestamp_ms, &payload_hash);
        let signature = sign_with_domain(keypair, ENVELOPE_SIGNATURE_DOMAIN, &header);

        Self {
            msg_type: msg_type.to_string(),
            message_id,
            timestamp_ms,
            payload_hash,
            payload,
            signer,
            signature,
        }
    }

    fn canonical_header(
        msg_type: &str,
        message_id: &[u8; 16],
        timestamp_ms: u64,
        payload_hash: &[u8; 32],
    ) -> Vec<u8> {
        let mut c = Canonical::new();
        c.str(msg_type)
            .fixed(message_id)
            .u64(timestamp_ms)
            .fixed(payload_hash);
        c.finish()
    }

    /// Verify signature, payload hash binding, and timestamp freshness.
    ///
    /// SECURITY: All three checks must pass. A valid signature over a stale
    /// timestamp is a replay; a valid signature with a mismatched payload
    /// hash is a substitution.
    pub fn verify(&self) -> Result<(), EnvelopeError> {
        let header = Self::canonical_header(
            &self.msg_type,
            &self.message_id,
            self.timestamp_ms,
            &self.payload_hash,
        );
        verify_with_domain(
            &self.signer,
            ENVELOPE_SIGNATURE_DOMAIN,
            &header,
            &self.signature,
        )
        .map_err(EnvelopeError::Signature)?;

        if *blake3::hash(&self.payload).as_bytes() != self.payload_hash {
            return Err(EnvelopeError::PayloadHashMismatch);
        }

        let now = now_ms();
        if self.timestamp_ms > now.saturating_add(ENVELOPE_FUTURE_TOLERANCE_MS) {
            return Err(EnvelopeError::FutureDated {
                drift_ms: self.timestamp_ms - now,
            });
        }
        let age_ms = now.saturating_sub(self.timestamp_ms);
        if age_ms > ENVELOPE_MAX_AGE_MS {
            return Err(EnvelopeError::Stale { age_ms });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_map_is_order_independent() {
        let mut a = std::collections::BTreeMap::new();
        a.insert("zeta".to_string(), "1".to_string());
        a.insert("alpha".to_string(), "2".to_string());

        let mut forward = Canonical::new();
        forward.sorted_map(a.iter());

        // Insert in the opposite order via a plain vec of pairs
        let pairs: Vec<(String, String)> = vec![
            ("alpha".to_string(), "2".to_string()),
            ("zeta".to_string(), "1".to_string()),
        ];
        let mut reverse = Canonical::new();
        reverse.sorted_map(pairs.iter().map(|(k, v)| (k, v)));

        assert_eq!(forward.finish(), reverse.finish());
    }

    #[test]
    fn canonical_lengths_prevent_concatenation_ambiguity() {
        let mut a = Canonical::new();
        a.str("192.168.1.1").str(":8080");
        let mut b = Canonical::new();
        b.str("192.168.1.1:8080");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn domain_separation_prevents_cross_protocol_replay() {
        let kp = Keypair::generate();
        let data = b"shared payload";

        let sig = sign_with_domain(&kp, DESCRIPTOR_SIGNATURE_DOMAIN, data);

        assert!(verify_with_domain(&kp.peer_id(), DESCRIPTOR_SIGNATURE_DOMAIN, data, &sig).is_ok());
        assert!(matches!(
            verify_with_domain(&kp.peer_id(), SERVICE_SIGNATURE_DOMAIN, data, &sig),
            Err(SignatureError::VerificationFailed)
        ));
    }

    #[test]
    fn verify_rejects_bad_signature_shapes() {
        let kp = Keypair::generate();
        let id = kp.peer_id();

        assert_eq!(
            verify_with_domain(&id, ENVELOPE_SIGNATURE_DOMAIN, b"x", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&id, ENVELOPE_SIGNATURE_DOMAIN, b"x", &[0u8; 32]),
            Err(SignatureError::InvalidLength)
        );
    }

    #[test]
    fn envelope_roundtrip_verifies() {
        let kp = Keypair::generate();
        let env = SignedEnvelope::seal(&kp, "dht.ping", b"payload".to_vec());

        assert!(env.verify().is_ok());
        assert_eq!(env.signer, kp.peer_id());
    }

    #[test]
    fn envelope_detects_single_byte_payload_mutation() {
        let kp = Keypair::generate();
        let mut env = SignedEnvelope::seal(&kp, "svc.call", b"important bytes".to_vec());

        env.payload[3] ^= 0x01;
        assert_eq!(env.verify(), Err(EnvelopeError::PayloadHashMismatch));
    }

    #[test]
    fn envelope_detects_header_tampering() {
        let kp = Keypair::generate();
        let mut env = SignedEnvelope::seal(&kp, "svc.call", b"data".to_vec());

        env.msg_type = "svc.other".to_string();
        assert!(matches!(
            env.verify(),
            Err(EnvelopeError::Signature(SignatureError::VerificationFailed))
        ));
    }

    #[test]
    fn envelope_detects_payload_substitution_with_rehash() {
        // Attacker swaps payload AND recomputes the hash - signature over the
        // header must still fail because the hash is signed.
        let kp = Keypair::generate();
        let mut env = SignedEnvelope::seal(&kp, "svc.call", b"original".to_vec());

        env.payload = b"swapped".to_vec();
        env.payload_hash = *blake3::hash(&env.payload).as_bytes();
        assert!(matches!(
            env.verify(),
            Err(EnvelopeError::Signature(SignatureError::VerificationFailed))
        ));
    }

    #[test]
    fn envelope_rejects_stale_timestamp() {
        let kp = Keypair::generate();
        let env = SignedEnvelope::seal(&kp, "dht.ping", vec![]);

        // Re-seal a stale envelope by signing an old header directly
        let old_ts = env.timestamp_ms - ENVELOPE_MAX_AGE_MS - 60_000;
        let header =
            SignedEnvelope::canonical_header(&env.msg_type, &env.message_id, old_ts, &env.payload_hash);
        let stale = SignedEnvelope {
            timestamp_ms: old_ts,
            signature: sign_with_domain(&kp, ENVELOPE_SIGNATURE_DOMAIN, &header),
            ..env
        };

        assert!(matches!(stale.verify(), Err(EnvelopeError::Stale { .. })));
    }

    #[test]
    fn envelope_rejects_future_timestamp() {
        let kp = Keypair::generate();
        let env = SignedEnvelope::seal(&kp, "dht.ping", vec![]);

        let future_ts = env.timestamp_ms + ENVELOPE_FUTURE_TOLERANCE_MS + 60_000;
        let header = SignedEnvelope::canonical_header(
            &env.msg_type,
            &env.message_id,
            future_ts,
            &env.payload_hash,
        );
        let future = SignedEnvelope {
            timestamp_ms: future_ts,
            signature: sign_with_domain(&kp, ENVELOPE_SIGNATURE_DOMAIN, &header),
            ..env
        };

        assert!(matches!(
            future.verify(),
            Err(EnvelopeError::FutureDated { .. })
        ));
    }

    #[test]
    fn envelope_rejects_wrong_signer() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let mut env = SignedEnvelope::seal(&kp, "dht.ping", b"x".to_vec());

        env.signer = other.peer_id();
        assert!(matches!(env.verify(), Err(EnvelopeError::Signature(_))));
    }
}
