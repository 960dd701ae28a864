//! # Mesh Service Descriptors
//!
//! Signed, DHT-discoverable advertisements binding a (service name, owner)
//! pair to an endpoint and a small metadata map. The service id is derived
//! deterministically from the binding, so discovery needs no central
//! registry: resolvers hash the same name and owner and look the id up in
//! the DHT.
//!
//! ## Validation Invariants
//!
//! Every descriptor arriving from the network is untrusted until it passes:
//!
//! - `created_at < expires_at`
//! - `created_at` not future-dated beyond skew tolerance
//! - signature length matches the algorithm (Ed25519, 64 bytes)
//! - metadata bounded in entry count and key/value size
//! - metadata free of disallowed identifying keys (this mesh exists to
//!   avoid linking overlay services to Soulseek account identities)

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::{now_ms, Keypair, PeerId};
use crate::signing::{
    sign_with_domain, verify_with_domain, Canonical, SignatureError, SERVICE_SIGNATURE_DOMAIN,
};

/// Maximum metadata entries per descriptor.
pub const MAX_METADATA_ENTRIES: usize = 10;

/// Maximum metadata key length in bytes.
const MAX_METADATA_KEY_LEN: usize = 64;

/// Maximum metadata value length in bytes.
const MAX_METADATA_VALUE_LEN: usize = 256;

/// Maximum service name length.
const MAX_SERVICE_NAME_LEN: usize = 128;

/// Maximum endpoint string length.
const MAX_ENDPOINT_LEN: usize = 256;

/// Tolerance for future-dated `created_at` (clock skew).
const CREATED_AT_FUTURE_TOLERANCE_MS: u64 = 5_000;

/// Metadata keys that would link a mesh service to an identifying account
/// or network location. Rejected outright.
const DISALLOWED_METADATA_KEYS: &[&str] =
    &["username", "user", "ip", "address", "hostname", "location", "email"];

/// Reasons a service descriptor is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceDescriptorError {
    EmptyName,
    NameTooLong,
    EndpointTooLong,
    /// `created_at >= expires_at`.
    InvertedLifetime,
    /// `created_at` beyond skew tolerance in the future.
    FutureDated { drift_ms: u64 },
    Expired,
    TooManyMetadataEntries { count: usize },
    MetadataKeyTooLong,
    MetadataValueTooLong,
    DisallowedMetadataKey { key: String },
    Signature(SignatureError),
}

impl std::fmt::Display for ServiceDescriptorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyName => write!(f, "service name is empty"),
            Self::NameTooLong => write!(f, "service name too long"),
            Self::EndpointTooLong => write!(f, "endpoint too long"),
            Self::InvertedLifetime => write!(f, "created_at is not before expires_at"),
            Self::FutureDated { drift_ms } => {
                write!(f, "created_at is {} ms in the future", drift_ms)
            }
            Self::Expired => write!(f, "descriptor is expired"),
            Self::TooManyMetadataEntries { count } => {
                write!(f, "{} metadata entries exceeds max {}", count, MAX_METADATA_ENTRIES)
            }
            Self::MetadataKeyTooLong => write!(f, "metadata key too long"),
            Self::MetadataValueTooLong => write!(f, "metadata value too long"),
            Self::DisallowedMetadataKey { key } => {
                write!(f, "metadata key '{}' is disallowed", key)
            }
            Self::Signature(e) => write!(f, "descriptor signature invalid: {}", e),
        }
    }
}

impl std::error::Error for ServiceDescriptorError {}

/// Deterministic service id: BLAKE3 over the (name, owner) binding.
/// Anyone holding the name and owner derives the same id.
pub fn derive_service_id(service_name: &str, owner: &PeerId) -> crate::dht::Key {
    let mut c = Canonical::new();
    c.str(service_name).fixed(owner.as_bytes());
    crate::dht::NodeId::from_material(&c.finish())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub service_name: String,
    pub owner: PeerId,
    /// Where the service is reachable, in the owner's endpoint notation.
    pub endpoint: String,
    /// Small, bounded, non-identifying metadata.
    pub metadata: BTreeMap<String, String>,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub signature: Vec<u8>,
}

impl ServiceDescriptor {
    pub fn create(
        keypair: &Keypair,
        service_name: impl Into<String>,
        endpoint: impl Into<String>,
        metadata: BTreeMap<String, String>,
        ttl_ms: u64,
    ) -> Self {
        let created_at_ms = now_ms();
        let mut descriptor = Self {
            service_name: service_name.into(),
            owner: keypair.peer_id(),
            endpoint: endpoint.into(),
            metadata,
            created_at_ms,
            expires_at_ms: created_at_ms.saturating_add(ttl_ms.max(1)),
            signature: Vec::new(),
        };
        let payload = descriptor.canonical_payload();
        descriptor.signature = sign_with_domain(keypair, SERVICE_SIGNATURE_DOMAIN, &payload);
        descriptor
    }

    pub fn service_id(&self) -> crate::dht::Key {
        derive_service_id(&self.service_name, &self.owner)
    }

    fn canonical_payload(&self) -> Vec<u8> {
        let mut c = Canonical::new();
        c.str(&self.service_name)
            .fixed(self.owner.as_bytes())
            .str(&self.endpoint)
            .sorted_map(self.metadata.iter())
            .u64(self.created_at_ms)
            .u64(self.expires_at_ms);
        c.finish()
    }

    /// Full validation: structural invariants, then the signature.
    pub fn validate(&self) -> Result<(), ServiceDescriptorError> {
        if self.service_name.is_empty() {
            return Err(ServiceDescriptorError::EmptyName);
        }
        if self.service_name.len() > MAX_SERVICE_NAME_LEN {
            return Err(ServiceDescriptorError::NameTooLong);
        }
        if self.endpoint.len() > MAX_ENDPOINT_LEN {
            return Err(ServiceDescriptorError::EndpointTooLong);
        }
        if self.created_at_ms >= self.expires_at_ms {
            return Err(ServiceDescriptorError::InvertedLifetime);
        }

        let now = now_ms();
        if self.created_at_ms > now.saturating_add(CREATED_AT_FUTURE_TOLERANCE_MS) {
            return Err(ServiceDescriptorError::FutureDated {
                drift_ms: self.created_at_ms - now,
            });
        }
        if now > self.expires_at_ms {
            return Err(ServiceDescriptorError::Expired);
        }

        if self.metadata.len() > MAX_METADATA_ENTRIES {
            return Err(ServiceDescriptorError::TooManyMetadataEntries {
                count: self.metadata.len(),
            });
        }
        for (key, value) in &self.metadata {
            if key.len() > MAX_METADATA_KEY_LEN {
                return Err(ServiceDescriptorError::MetadataKeyTooLong);
            }
            if value.len() > MAX_METADATA_VALUE_LEN {
                return Err(ServiceDescriptorError::MetadataValueTooLong);
            }
            let lowered = key.to_ascii_lowercase();
            if DISALLOWED_METADATA_KEYS.contains(&lowered.as_str()) {
                return Err(ServiceDescriptorError::DisallowedMetadataKey { key: key.clone() });
            }
        }

        let payload = self.canonical_payload();
        verify_with_domain(&self.owner, SERVICE_SIGNATURE_DOMAIN, &payload, &self.signature)
            .map_err(ServiceDescriptorError::Signature)?;

        Ok(())
    }

    /// Remaining lifetime in seconds, for DHT storage TTL.
    pub fn remaining_ttl_secs(&self) -> u64 {
        self.expires_at_ms.saturating_sub(now_ms()) / 1000
    }
}

/// Publish a service descriptor into the DHT under its derived id.
pub async fn publish<N: crate::protocols::DhtRpc + 'static>(
    dht: &crate::dht::DhtNode<N>,
    descriptor: &ServiceDescriptor,
) -> anyhow::Result<usize> {
    descriptor
        .validate()
        .map_err(|e| anyhow::anyhow!("refusing to publish invalid descriptor: {}", e))?;
    let key = descriptor.service_id();
    let value = crate::messages::serialize(descriptor)?;
    dht.put(key, value, descriptor.remaining_ttl_secs().max(1)).await
}

/// Resolve a service by (name, owner) via the DHT. Validation is applied to
/// whatever comes back; a forged or expired descriptor resolves to `None`.
pub async fn resolve<N: crate::protocols::DhtRpc + 'static>(
    dht: &crate::dht::DhtNode<N>,
    service_name: &str,
    owner: &PeerId,
) -> anyhow::Result<Option<ServiceDescriptor>> {
    let key = derive_service_id(service_name, owner);
    let Some(bytes) = dht.get(key).await? else {
        return Ok(None);
    };
    let descriptor: ServiceDescriptor = match crate::messages::deserialize_bounded(&bytes) {
        Ok(d) => d,
        Err(_) => return Ok(None),
    };
    if descriptor.service_name != service_name || descriptor.owner != *owner {
        return Ok(None);
    }
    match descriptor.validate() {
        Ok(()) => Ok(Some(descriptor)),
        Err(e) => {
            tracing::debug!(service = service_name, error = %e, "resolved descriptor failed validation");
            Ok(None)
        }
    }
}
