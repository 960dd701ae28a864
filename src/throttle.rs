//! # Connection Throttler
//!
//! Layers admission control over the token-bucket primitive before any dial
//! or inbound processing touches real resources. Four bucket families apply:
//!
//! | Family | Key | Guards against |
//! |--------|-----|----------------|
//! | Global | (none) | total concurrent dial pressure |
//! | Endpoint | `host:port` | hammering one destination |
//! | Transport | [`TransportKind`] | exhausting one proxy/helper |
//! | Peer | [`PeerId`] | descriptor-fetch and envelope floods |
//!
//! Admission requires *all* applicable buckets to have capacity. A separate
//! per-endpoint auth-failure tracker drives exponential backoff on repeated
//! failed authentication without maintaining an explicit ban list: the
//! backoff window doubles per consecutive failure and a single success
//! clears it.
//!
//! ## Cancellation
//!
//! [`DialPermit`] holds the global token. If the dial is cancelled or fails
//! before [`DialPermit::commit`], dropping the permit returns the token, so
//! an aborted dial never leaks budget.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{debug, warn};

use crate::descriptor::TransportKind;
use crate::identity::PeerId;
use crate::ratelimit::{KeyedBuckets, TokenBucket};

/// Maximum endpoints tracked by the auth-failure and endpoint limiters.
/// SECURITY: Bounds attacker-controlled keyspace growth.
const MAX_TRACKED_ENDPOINTS: usize = 10_000;

/// Maximum peers tracked by the per-peer budget limiters.
const MAX_TRACKED_PEERS: usize = 10_000;

/// Throttler tuning knobs. Defaults suit a desktop client node.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub global_capacity: u32,
    pub global_refill_per_sec: f64,
    pub per_endpoint_capacity: u32,
    pub per_endpoint_refill_per_sec: f64,
    pub per_transport_capacity: u32,
    pub per_transport_refill_per_sec: f64,
    /// Descriptor fetches a single peer may cause per window.
    pub descriptor_fetch_capacity: u32,
    pub descriptor_fetch_refill_per_sec: f64,
    /// Envelopes a single peer may have processed per window.
    pub envelope_capacity: u32,
    pub envelope_refill_per_sec: f64,
    pub auth_backoff_base: Duration,
    pub auth_backoff_max: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_capacity: 64,
            global_refill_per_sec: 8.0,
            per_endpoint_capacity: 6,
            per_endpoint_refill_per_sec: 0.5,
            per_transport_capacity: 24,
            per_transport_refill_per_sec: 4.0,
            descriptor_fetch_capacity: 10,
            descriptor_fetch_refill_per_sec: 0.2,
            envelope_capacity: 120,
            envelope_refill_per_sec: 2.0,
            auth_backoff_base: Duration::from_secs(1),
            auth_backoff_max: Duration::from_secs(10 * 60),
        }
    }
}

/// Typed admission rejection. Expected, peer-visible, never retried internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDenied {
    GlobalBudget,
    EndpointBudget,
    TransportBudget,
    DescriptorBudget,
    EnvelopeBudget,
    /// Endpoint is in auth-failure backoff; retry no sooner than this.
    AuthBackoff { retry_after: Duration },
}

impl std::fmt::Display for ThrottleDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThrottleDenied::GlobalBudget => write!(f, "global connection budget exhausted"),
            ThrottleDenied::EndpointBudget => write!(f, "per-endpoint budget exhausted"),
            ThrottleDenied::TransportBudget => write!(f, "per-transport budget exhausted"),
            ThrottleDenied::DescriptorBudget => write!(f, "descriptor-fetch budget exhausted"),
            ThrottleDenied::EnvelopeBudget => write!(f, "envelope-processing budget exhausted"),
            ThrottleDenied::AuthBackoff { retry_after } => {
                write!(f, "endpoint in auth backoff for {:?}", retry_after)
            }
        }
    }
}

impl std::error::Error for ThrottleDenied {}

#[derive(Debug, Clone, Copy)]
struct AuthFailureState {
    consecutive_failures: u32,
    last_failure: Instant,
}

/// Guard for an admitted dial holding the global token.
///
/// Dropping without [`commit`](Self::commit) returns the token (cancellation
/// and failure paths); committing consumes it for the connection lifetime.
pub struct DialPermit {
    throttler: Arc<ConnectionThrottler>,
    committed: bool,
}

impl DialPermit {
    /// Keep the global token consumed: the dial succeeded.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for DialPermit {
    fn drop(&mut self) {
        if !self.committed {
            self.throttler.release_global();
        }
    }
}

pub struct ConnectionThrottler {
    global: Mutex<TokenBucket>,
    per_endpoint: KeyedBuckets<String>,
    per_transport: KeyedBuckets<TransportKind>,
    descriptor_budget: KeyedBuckets<PeerId>,
    envelope_budget: KeyedBuckets<PeerId>,
    auth_failures: Mutex<LruCache<String, AuthFailureState>>,
    config: ThrottleConfig,
}

impl ConnectionThrottler {
    pub fn new(config: ThrottleConfig) -> Arc<Self> {
        Arc::new(Self {
            global: Mutex::new(TokenBucket::new(
                config.global_capacity,
                config.global_refill_per_sec,
            )),
            per_endpoint: KeyedBuckets::new(
                MAX_TRACKED_ENDPOINTS,
                config.per_endpoint_capacity,
                config.per_endpoint_refill_per_sec,
            ),
            per_transport: KeyedBuckets::new(
                8,
                config.per_transport_capacity,
                config.per_transport_refill_per_sec,
            ),
            descriptor_budget: KeyedBuckets::new(
                MAX_TRACKED_PEERS,
                config.descriptor_fetch_capacity,
                config.descriptor_fetch_refill_per_sec,
            ),
            envelope_budget: KeyedBuckets::new(
                MAX_TRACKED_PEERS,
                config.envelope_capacity,
                config.envelope_refill_per_sec,
            ),
            auth_failures: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_TRACKED_ENDPOINTS).expect("non-zero"),
            )),
            config,
        })
    }

    /// Admit an outbound dial to `endpoint` over `transport`.
    ///
    /// Checks, in order: auth-failure backoff, global budget, per-endpoint
    /// budget, per-transport budget. All must pass; partial consumption is
    /// rolled back so a rejection leaves every bucket untouched except the
    /// ones that still had room (returned immediately).
    pub fn admit_dial(
        self: &Arc<Self>,
        endpoint: &str,
        transport: TransportKind,
    ) -> Result<DialPermit, ThrottleDenied> {
        if let Some(retry_after) = self.auth_backoff_remaining(endpoint) {
            return Err(ThrottleDenied::AuthBackoff { retry_after });
        }

        {
            let mut global = self
                .global
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !global.try_consume() {
                return Err(ThrottleDenied::GlobalBudget);
            }
        }

        if !self.per_endpoint.try_consume(endpoint.to_string()) {
            self.release_global();
            return Err(ThrottleDenied::EndpointBudget);
        }

        if !self.per_transport.try_consume(transport) {
            self.release_global();
            self.per_endpoint.release(&endpoint.to_string());
            return Err(ThrottleDenied::TransportBudget);
        }

        debug!(endpoint, transport = %transport, "dial admitted");
        Ok(DialPermit {
            throttler: self.clone(),
            committed: false,
        })
    }

    /// Admit a descriptor fetch attributed to `peer`.
    pub fn admit_descriptor_fetch(&self, peer: &PeerId) -> Result<(), ThrottleDenied> {
        if self.descriptor_budget.try_consume(*peer) {
            Ok(())
        } else {
            Err(ThrottleDenied::DescriptorBudget)
        }
    }

    /// Admit processing of one inbound envelope from `peer`.
    pub fn admit_envelope(&self, peer: &PeerId) -> Result<(), ThrottleDenied> {
        if self.envelope_budget.try_consume(*peer) {
            Ok(())
        } else {
            Err(ThrottleDenied::EnvelopeBudget)
        }
    }

    fn release_global(&self) {
        self.global
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .release();
    }

    /// Record a failed authentication against an endpoint.
    /// Each consecutive failure doubles the backoff window (capped).
    pub fn record_auth_failure(&self, endpoint: &str) {
        let mut failures = self
            .auth_failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let state = failures.get_or_insert_mut(endpoint.to_string(), || AuthFailureState {
            consecutive_failures: 0,
            last_failure: Instant::now(),
        });
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure = Instant::now();
        warn!(
            endpoint,
            failures = state.consecutive_failures,
            "authentication failure recorded, backoff doubled"
        );
    }

    /// Clear auth-failure state after a successful authentication.
    pub fn record_auth_success(&self, endpoint: &str) {
        let mut failures = self
            .auth_failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        failures.pop(&endpoint.to_string());
    }

    /// Remaining backoff for an endpoint, if it is currently backed off.
    pub fn auth_backoff_remaining(&self, endpoint: &str) -> Option<Duration> {
        let mut failures = self
            .auth_failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let state = failures.get(&endpoint.to_string())?;
        if state.consecutive_failures == 0 {
            return None;
        }
        let exponent = state.consecutive_failures.saturating_sub(1).min(20);
        let backoff = self
            .config
            .auth_backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.config.auth_backoff_max);
        let elapsed = state.last_failure.elapsed();
        if elapsed < backoff {
            Some(backoff - elapsed)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttler(config: ThrottleConfig) -> Arc<ConnectionThrottler> {
        ConnectionThrottler::new(config)
    }

    fn tight_config() -> ThrottleConfig {
        ThrottleConfig {
            global_capacity: 2,
            global_refill_per_sec: 0.0,
            per_endpoint_capacity: 2,
            per_endpoint_refill_per_sec: 0.0,
            per_transport_capacity: 2,
            per_transport_refill_per_sec: 0.0,
            descriptor_fetch_capacity: 1,
            descriptor_fetch_refill_per_sec: 0.0,
            envelope_capacity: 2,
            envelope_refill_per_sec: 0.0,
            auth_backoff_base: Duration::from_millis(50),
            auth_backoff_max: Duration::from_secs(1),
        }
    }

    #[test]
    fn global_budget_caps_total_dials() {
        let t = throttler(tight_config());

        let p1 = t.admit_dial("a:1", TransportKind::Quic).unwrap();
        let p2 = t.admit_dial("b:1", TransportKind::Tor).unwrap();
        assert_eq!(
            t.admit_dial("c:1", TransportKind::I2p).err(),
            Some(ThrottleDenied::GlobalBudget)
        );
        p1.commit();
        p2.commit();
    }

    #[test]
    fn dropped_permit_releases_global_token() {
        let t = throttler(tight_config());

        {
            let _p1 = t.admit_dial("a:1", TransportKind::Quic).unwrap();
            let _p2 = t.admit_dial("b:1", TransportKind::Quic).unwrap();
            // Budget exhausted while permits are live
            assert!(t.admit_dial("c:1", TransportKind::Quic).is_err());
        }
        // Both permits dropped uncommitted - tokens returned
        let p = t.admit_dial("c:1", TransportKind::Quic);
        assert!(p.is_ok());
    }

    #[test]
    fn committed_permit_keeps_token_consumed() {
        let mut config = tight_config();
        config.global_capacity = 1;
        let t = throttler(config);

        t.admit_dial("a:1", TransportKind::Quic).unwrap().commit();
        assert_eq!(
            t.admit_dial("b:1", TransportKind::Quic).err(),
            Some(ThrottleDenied::GlobalBudget)
        );
    }

    #[test]
    fn per_endpoint_budget_is_isolated() {
        let mut config = tight_config();
        config.global_capacity = 100;
        config.per_transport_capacity = 100;
        let t = throttler(config);

        t.admit_dial("x:1", TransportKind::Quic).unwrap().commit();
        t.admit_dial("x:1", TransportKind::Quic).unwrap().commit();
        assert_eq!(
            t.admit_dial("x:1", TransportKind::Quic).err(),
            Some(ThrottleDenied::EndpointBudget)
        );
        // Other endpoints unaffected
        assert!(t.admit_dial("y:1", TransportKind::Quic).is_ok());
    }

    #[test]
    fn per_transport_budget_spans_endpoints() {
        let mut config = tight_config();
        config.global_capacity = 100;
        config.per_endpoint_capacity = 100;
        let t = throttler(config);

        t.admit_dial("a:1", TransportKind::Tor).unwrap().commit();
        t.admit_dial("b:1", TransportKind::Tor).unwrap().commit();
        assert_eq!(
            t.admit_dial("c:1", TransportKind::Tor).err(),
            Some(ThrottleDenied::TransportBudget)
        );
        // A different transport still admits
        assert!(t.admit_dial("c:1", TransportKind::Quic).is_ok());
    }

    #[test]
    fn endpoint_rejection_rolls_back_global_token() {
        let mut config = tight_config();
        config.global_capacity = 2;
        config.per_endpoint_capacity = 1;
        config.per_transport_capacity = 100;
        let t = throttler(config);

        t.admit_dial("x:1", TransportKind::Quic).unwrap().commit();
        // Endpoint bucket for x:1 is exhausted; the rejection must return
        // the global token it briefly held.
        assert_eq!(
            t.admit_dial("x:1", TransportKind::Quic).err(),
            Some(ThrottleDenied::EndpointBudget)
        );
        // One global token was committed, one remains after the rollback.
        assert!(t.admit_dial("y:1", TransportKind::Quic).is_ok());
    }

    #[test]
    fn descriptor_and_envelope_budgets_are_per_peer() {
        let t = throttler(tight_config());
        let peer_a = crate::identity::Keypair::generate().peer_id();
        let peer_b = crate::identity::Keypair::generate().peer_id();

        assert!(t.admit_descriptor_fetch(&peer_a).is_ok());
        assert_eq!(
            t.admit_descriptor_fetch(&peer_a).err(),
            Some(ThrottleDenied::DescriptorBudget)
        );
        assert!(t.admit_descriptor_fetch(&peer_b).is_ok());

        assert!(t.admit_envelope(&peer_a).is_ok());
        assert!(t.admit_envelope(&peer_a).is_ok());
        assert_eq!(
            t.admit_envelope(&peer_a).err(),
            Some(ThrottleDenied::EnvelopeBudget)
        );
    }

    #[test]
    fn auth_backoff_grows_and_blocks_dials() {
        let t = throttler(tight_config());

        t.record_auth_failure("evil:443");
        let first = t.auth_backoff_remaining("evil:443").unwrap();

        t.record_auth_failure("evil:443");
        let second = t.auth_backoff_remaining("evil:443").unwrap();
        assert!(second > first, "backoff must grow with failures");

        assert!(matches!(
            t.admit_dial("evil:443", TransportKind::Quic),
            Err(ThrottleDenied::AuthBackoff { .. })
        ));
        // Unrelated endpoint unaffected
        assert!(t.admit_dial("good:443", TransportKind::Quic).is_ok());
    }

    #[test]
    fn auth_backoff_caps_at_max() {
        let t = throttler(tight_config());
        for _ in 0..30 {
            t.record_auth_failure("evil:443");
        }
        let remaining = t.auth_backoff_remaining("evil:443").unwrap();
        assert!(remaining <= Duration::from_secs(1));
    }

    #[test]
    fn auth_success_clears_backoff() {
        let t = throttler(tight_config());

        t.record_auth_failure("flaky:443");
        assert!(t.auth_backoff_remaining("flaky:443").is_some());

        t.record_auth_success("flaky:443");
        assert!(t.auth_backoff_remaining("flaky:443").is_none());
        assert!(t.admit_dial("flaky:443", TransportKind::Quic).is_ok());
    }

    #[test]
    fn auth_backoff_expires_with_time() {
        let t = throttler(tight_config());

        t.record_auth_failure("slow:443");
        std::thread::sleep(Duration::from_millis(80));
        assert!(t.auth_backoff_remaining("slow:443").is_none());
    }
}
