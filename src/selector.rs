//! # Transport Policy & Selection
//!
//! Chooses a transport per (peer, scope), honoring local policy, dialer
//! availability, admission control, and anti-downgrade protection.
//!
//! ## Policy Resolution
//!
//! Policies are local-only and never transmitted. Specificity order:
//! peer+pod override > peer-only override > global default.
//!
//! ## Downgrade Protection
//!
//! An active attacker who can block one transport must not be able to
//! silently push a peer onto a weaker one. The [`DowngradeProtector`]
//! records, per peer, the strongest transport class previously used
//! successfully and refuses an unannounced fallback to a strictly weaker
//! class. The strength ranking is policy data, not a hard-coded order.
//!
//! ## Selection
//!
//! For each candidate endpoint, in policy-preference order: the dialer must
//! exist and be available, the downgrade protector must not object, the
//! connection throttler must admit the dial, and the dial itself must
//! succeed with the presented certificate validating against the pin
//! manager. Transient failures move on to the next candidate; trust
//! failures record an auth failure against the endpoint first.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::descriptor::{DescriptorTable, EndpointScope, TransportEndpoint, TransportKind};
use crate::identity::PeerId;
use crate::pinning::{PinError, PinManager};
use crate::throttle::{ConnectionThrottler, ThrottleDenied};
use crate::transport::{Dialer, MeshConnection};

/// Default per-dial timeout.
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

// ============================================================================
// Transport Policy
// ============================================================================

/// Local transport policy. Never transmitted.
#[derive(Debug, Clone)]
pub struct TransportPolicy {
    /// Transport ordering; earlier kinds are tried first.
    pub preference_order: Vec<TransportKind>,
    /// Refuse transports that touch the clearnet directly.
    pub disable_clearnet: bool,
    /// Bump anonymity-network transports ahead of everything else.
    pub prefer_private: bool,
    /// Explicit allow-set; `None` allows every kind.
    pub allowed: Option<HashSet<TransportKind>>,
    /// Permit announced fallback below the strongest recorded class.
    pub allow_downgrade: bool,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            preference_order: vec![
                TransportKind::Quic,
                TransportKind::Tor,
                TransportKind::I2p,
                TransportKind::WsTunnel,
                TransportKind::FrontedHttp,
                TransportKind::Obfs,
            ],
            disable_clearnet: false,
            prefer_private: false,
            allowed: None,
            allow_downgrade: false,
        }
    }
}

/// Anonymity-network transports never touch the clearnet directly.
fn is_private_transport(kind: TransportKind) -> bool {
    matches!(kind, TransportKind::Tor | TransportKind::I2p)
}

impl TransportPolicy {
    fn permits(&self, kind: TransportKind) -> bool {
        if self.disable_clearnet && !is_private_transport(kind) {
            return false;
        }
        match &self.allowed {
            Some(set) => set.contains(&kind),
            None => true,
        }
    }

    /// Rank within the preference order; unlisted kinds sort last.
    fn rank(&self, kind: TransportKind) -> usize {
        self.preference_order
            .iter()
            .position(|k| *k == kind)
            .unwrap_or(self.preference_order.len())
    }
}

/// Per-peer and per-pod policy overrides with most-specific-wins resolution.
#[derive(Default)]
pub struct PolicyManager {
    global: RwLock<TransportPolicy>,
    per_peer: RwLock<HashMap<PeerId, TransportPolicy>>,
    per_peer_pod: RwLock<HashMap<(PeerId, String), TransportPolicy>>,
}

impl PolicyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_global(&self, policy: TransportPolicy) {
        *self
            .global
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = policy;
    }

    pub fn set_peer(&self, peer: PeerId, policy: TransportPolicy) {
        self.per_peer
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(peer, policy);
    }

    pub fn set_peer_pod(&self, peer: PeerId, pod: impl Into<String>, policy: TransportPolicy) {
        self.per_peer_pod
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert((peer, pod.into()), policy);
    }

    /// Most-specific policy for (peer, pod): peer+pod > peer > global.
    pub fn resolve(&self, peer: &PeerId, pod: Option<&str>) -> TransportPolicy {
        if let Some(pod) = pod {
            let map = self
                .per_peer_pod
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(policy) = map.get(&(*peer, pod.to_string())) {
                return policy.clone();
            }
        }
        {
            let map = self
                .per_peer
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(policy) = map.get(peer) {
                return policy.clone();
            }
        }
        self.global
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

// ============================================================================
// Downgrade Protection
// ============================================================================

/// Transport strength classes, strongest first. Kinds in one class are
/// interchangeable; moving to a later class is a downgrade.
///
/// This ranking is deliberately configuration data rather than a hard-coded
/// order: deployments disagree about whether, say, obfuscated bridges
/// outrank domain fronting.
#[derive(Debug, Clone)]
pub struct StrengthRanking {
    classes: Vec<Vec<TransportKind>>,
}

impl Default for StrengthRanking {
    fn default() -> Self {
        Self {
            classes: vec![
                vec![TransportKind::Tor, TransportKind::I2p],
                vec![TransportKind::Obfs, TransportKind::FrontedHttp],
                vec![TransportKind::Quic, TransportKind::WsTunnel],
            ],
        }
    }
}

impl StrengthRanking {
    pub fn new(classes: Vec<Vec<TransportKind>>) -> Self {
        Self { classes }
    }

    /// Class index for a kind; unranked kinds fall in a weakest-of-all class.
    fn class_of(&self, kind: TransportKind) -> usize {
        self.classes
            .iter()
            .position(|class| class.contains(&kind))
            .unwrap_or(self.classes.len())
    }
}

/// Typed refusal from the downgrade protector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DowngradeBlocked {
    pub attempted: TransportKind,
    pub strongest_class: usize,
    pub attempted_class: usize,
}

impl std::fmt::Display for DowngradeBlocked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "refusing unannounced downgrade to {} (class {} vs established {})",
            self.attempted, self.attempted_class, self.strongest_class
        )
    }
}

impl std::error::Error for DowngradeBlocked {}

/// Records the strongest class used per peer and refuses silent fallback
/// to a strictly weaker class.
pub struct DowngradeProtector {
    ranking: StrengthRanking,
    strongest: RwLock<HashMap<PeerId, usize>>,
}

impl DowngradeProtector {
    pub fn new(ranking: StrengthRanking) -> Self {
        Self {
            ranking,
            strongest: RwLock::new(HashMap::new()),
        }
    }

    /// Check whether dialing `kind` to `peer` is permitted.
    pub fn check(
        &self,
        peer: &PeerId,
        kind: TransportKind,
        allow_downgrade: bool,
    ) -> Result<(), DowngradeBlocked> {
        let attempted_class = self.ranking.class_of(kind);
        let strongest = self
            .strongest
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match strongest.get(peer) {
            Some(&strongest_class) if attempted_class > strongest_class && !allow_downgrade => {
                Err(DowngradeBlocked {
                    attempted: kind,
                    strongest_class,
                    attempted_class,
                })
            }
            _ => Ok(()),
        }
    }

    /// Record a successful connection over `kind`.
    pub fn record_success(&self, peer: &PeerId, kind: TransportKind) {
        let class = self.ranking.class_of(kind);
        let mut strongest = self
            .strongest
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        strongest
            .entry(*peer)
            .and_modify(|c| *c = (*c).min(class))
            .or_insert(class);
    }
}

// ============================================================================
// Transport Selector
// ============================================================================

/// Typed selection failure.
#[derive(Debug)]
pub enum SelectError {
    /// No live descriptor is known for the peer.
    NoDescriptor,
    /// The descriptor has no endpoint passing scope/validity/policy filters.
    NoCandidates,
    /// Admission control refused the dial outright.
    Throttled(ThrottleDenied),
    /// Every candidate was tried and failed.
    Exhausted { attempts: usize },
}

impl std::fmt::Display for SelectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectError::NoDescriptor => write!(f, "no live descriptor for peer"),
            SelectError::NoCandidates => write!(f, "no endpoint passes scope and policy filters"),
            SelectError::Throttled(d) => write!(f, "dial throttled: {}", d),
            SelectError::Exhausted { attempts } => {
                write!(f, "all {} candidate endpoints failed", attempts)
            }
        }
    }
}

impl std::error::Error for SelectError {}

/// A successfully selected and dialed connection.
pub struct Established {
    pub peer: PeerId,
    pub endpoint: TransportEndpoint,
    pub connection: MeshConnection,
}

pub struct TransportSelector {
    dialers: Vec<Arc<dyn Dialer>>,
    policies: Arc<PolicyManager>,
    protector: DowngradeProtector,
    throttler: Arc<ConnectionThrottler>,
    pins: Arc<PinManager>,
    descriptors: Arc<DescriptorTable>,
    dial_timeout: Duration,
}

impl TransportSelector {
    pub fn new(
        dialers: Vec<Arc<dyn Dialer>>,
        policies: Arc<PolicyManager>,
        ranking: StrengthRanking,
        throttler: Arc<ConnectionThrottler>,
        pins: Arc<PinManager>,
        descriptors: Arc<DescriptorTable>,
    ) -> Self {
        Self {
            dialers,
            policies,
            protector: DowngradeProtector::new(ranking),
            throttler,
            pins,
            descriptors,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn set_dial_timeout(&mut self, timeout: Duration) {
        self.dial_timeout = timeout;
    }

    fn dialer_for(&self, kind: TransportKind) -> Option<&Arc<dyn Dialer>> {
        self.dialers.iter().find(|d| d.kind() == kind)
    }

    /// Filter and order candidate endpoints for (descriptor, scope, policy).
    fn candidates(
        descriptor: &crate::descriptor::PeerDescriptor,
        scope: EndpointScope,
        policy: &TransportPolicy,
    ) -> Vec<TransportEndpoint> {
        let mut candidates: Vec<TransportEndpoint> = descriptor
            .live_endpoints(scope)
            .into_iter()
            .filter(|ep| policy.permits(ep.transport))
            .cloned()
            .collect();

        candidates.sort_by_key(|ep| {
            let private_bump = if policy.prefer_private && is_private_transport(ep.transport) {
                0usize
            } else {
                1
            };
            (
                private_bump,
                policy.rank(ep.transport),
                ep.preference,
                ep.cost,
            )
        });
        candidates
    }

    /// Select a transport and connect to `peer` for `scope`.
    ///
    /// Transient dial failures fall through to the next candidate; trust
    /// failures (pin mismatch) record an auth failure for the endpoint and
    /// also fall through, since a different path may be unmolested.
    pub async fn connect(
        &self,
        peer: &PeerId,
        scope: EndpointScope,
        pod: Option<&str>,
    ) -> Result<Established, SelectError> {
        let descriptor = self.descriptors.get(peer).ok_or(SelectError::NoDescriptor)?;
        let policy = self.policies.resolve(peer, pod);
        let candidates = Self::candidates(&descriptor, scope, &policy);
        if candidates.is_empty() {
            return Err(SelectError::NoCandidates);
        }

        let mut attempts = 0usize;
        for endpoint in candidates {
            let Some(dialer) = self.dialer_for(endpoint.transport) else {
                continue;
            };
            if !dialer.can_handle(&endpoint) {
                continue;
            }
            if let Err(blocked) = self
                .protector
                .check(peer, endpoint.transport, policy.allow_downgrade)
            {
                warn!(peer = %peer, %blocked, "skipping endpoint");
                continue;
            }
            if !dialer.is_available().await {
                debug!(transport = %endpoint.transport, "dialer unavailable, trying next");
                continue;
            }

            let permit = match self.throttler.admit_dial(&endpoint.addr(), endpoint.transport) {
                Ok(permit) => permit,
                Err(ThrottleDenied::GlobalBudget) => {
                    return Err(SelectError::Throttled(ThrottleDenied::GlobalBudget));
                }
                Err(denied) => {
                    debug!(endpoint = %endpoint.addr(), %denied, "endpoint throttled, trying next");
                    continue;
                }
            };

            attempts += 1;
            match dialer
                .dial_with_pins(&endpoint, peer, &descriptor.cert_pins, self.dial_timeout)
                .await
            {
                Ok(connection) => {
                    if let Some(presented) = connection.cert_fingerprint {
                        match self.pins.validate(peer, &presented) {
                            Ok(verdict) => {
                                debug!(peer = %peer, ?verdict, "certificate pin validated");
                            }
                            Err(e @ (PinError::Mismatch | PinError::GraceExpired)) => {
                                warn!(peer = %peer, endpoint = %endpoint.addr(), error = %e, "pin validation failed, closing");
                                self.throttler.record_auth_failure(&endpoint.addr());
                                continue;
                            }
                            Err(e) => {
                                warn!(peer = %peer, error = %e, "pin validation error");
                                continue;
                            }
                        }
                    }
                    self.throttler.record_auth_success(&endpoint.addr());
                    self.protector.record_success(peer, endpoint.transport);
                    permit.commit();
                    info!(peer = %peer, transport = %endpoint.transport, endpoint = %endpoint.addr(), "connected");
                    return Ok(Established {
                        peer: *peer,
                        endpoint,
                        connection,
                    });
                }
                Err(e) => {
                    debug!(peer = %peer, endpoint = %endpoint.addr(), error = %e, "dial failed, trying next candidate");
                    // permit dropped here, releasing the global token
                }
            }
        }

        Err(SelectError::Exhausted { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{NatClass, PeerDescriptor};
    use crate::identity::Keypair;
    use crate::pinning::PinFingerprint;
    use crate::throttle::ThrottleConfig;
    use crate::transport::{DialerStats, MeshStream};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    fn endpoint(kind: TransportKind, pref: u8) -> TransportEndpoint {
        TransportEndpoint {
            transport: kind,
            host: format!("{}.test", kind),
            port: 1000 + pref as u16,
            not_before_ms: 0,
            not_after_ms: 0,
            scope: EndpointScope::Control,
            preference: pref,
            cost: 0,
        }
    }

    struct FakeDialer {
        kind: TransportKind,
        available: AtomicBool,
        succeed: AtomicBool,
        dials: AtomicU64,
        fingerprint: Option<PinFingerprint>,
    }

    impl FakeDialer {
        fn new(kind: TransportKind, available: bool, succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                available: AtomicBool::new(available),
                succeed: AtomicBool::new(succeed),
                dials: AtomicU64::new(0),
                fingerprint: None,
            })
        }

        fn with_fingerprint(kind: TransportKind, fp: PinFingerprint) -> Arc<Self> {
            Arc::new(Self {
                kind,
                available: AtomicBool::new(true),
                succeed: AtomicBool::new(true),
                dials: AtomicU64::new(0),
                fingerprint: Some(fp),
            })
        }
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn is_available(&self) -> bool {
            self.available.load(Ordering::Relaxed)
        }

        async fn dial(
            &self,
            _endpoint: &TransportEndpoint,
            _timeout: Duration,
        ) -> anyhow::Result<MeshConnection> {
            self.dials.fetch_add(1, Ordering::Relaxed);
            if self.succeed.load(Ordering::Relaxed) {
                let (local, _remote) = tokio::io::duplex(1024);
                Ok(MeshConnection {
                    stream: Box::new(local) as MeshStream,
                    kind: self.kind,
                    cert_fingerprint: self.fingerprint,
                })
            } else {
                anyhow::bail!("dial refused")
            }
        }

        fn statistics(&self) -> DialerStats {
            DialerStats {
                attempts: self.dials.load(Ordering::Relaxed),
                successes: 0,
                failures: 0,
            }
        }
    }

    struct Fixture {
        descriptors: Arc<DescriptorTable>,
        policies: Arc<PolicyManager>,
        pins: Arc<PinManager>,
        keypair: Keypair,
    }

    impl Fixture {
        fn new(endpoints: Vec<TransportEndpoint>) -> Self {
            let keypair = Keypair::generate();
            let descriptors = Arc::new(DescriptorTable::new());
            let descriptor = PeerDescriptor::create(
                &keypair,
                1,
                3_600_000,
                endpoints,
                vec![],
                NatClass::Open,
                false,
            );
            descriptors.apply(descriptor).unwrap();
            Self {
                descriptors,
                policies: Arc::new(PolicyManager::new()),
                pins: Arc::new(PinManager::new()),
                keypair,
            }
        }

        fn selector(&self, dialers: Vec<Arc<dyn Dialer>>) -> TransportSelector {
            TransportSelector::new(
                dialers,
                self.policies.clone(),
                StrengthRanking::default(),
                ConnectionThrottler::new(ThrottleConfig::default()),
                self.pins.clone(),
                self.descriptors.clone(),
            )
        }
    }

    #[test]
    fn policy_specificity_resolution() {
        let manager = PolicyManager::new();
        let peer = Keypair::generate().peer_id();

        let mut peer_policy = TransportPolicy::default();
        peer_policy.disable_clearnet = true;
        manager.set_peer(peer, peer_policy);

        let mut pod_policy = TransportPolicy::default();
        pod_policy.prefer_private = true;
        manager.set_peer_pod(peer, "pod-a", pod_policy);

        // peer+pod beats peer-only
        let resolved = manager.resolve(&peer, Some("pod-a"));
        assert!(resolved.prefer_private);
        assert!(!resolved.disable_clearnet);

        // peer-only beats global
        let resolved = manager.resolve(&peer, Some("other-pod"));
        assert!(resolved.disable_clearnet);

        // unknown peer falls back to global
        let other = Keypair::generate().peer_id();
        let resolved = manager.resolve(&other, None);
        assert!(!resolved.disable_clearnet);
        assert!(!resolved.prefer_private);
    }

    #[test]
    fn clearnet_disablement_filters_candidates() {
        let kp = Keypair::generate();
        let descriptor = PeerDescriptor::create(
            &kp,
            1,
            3_600_000,
            vec![
                endpoint(TransportKind::Quic, 0),
                endpoint(TransportKind::Tor, 1),
            ],
            vec![],
            NatClass::Open,
            false,
        );
        let mut policy = TransportPolicy::default();
        policy.disable_clearnet = true;

        let candidates =
            TransportSelector::candidates(&descriptor, EndpointScope::Control, &policy);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].transport, TransportKind::Tor);
    }

    #[test]
    fn allowed_set_filters_candidates() {
        let kp = Keypair::generate();
        let descriptor = PeerDescriptor::create(
            &kp,
            1,
            3_600_000,
            vec![
                endpoint(TransportKind::Quic, 0),
                endpoint(TransportKind::WsTunnel, 1),
                endpoint(TransportKind::Tor, 2),
            ],
            vec![],
            NatClass::Open,
            false,
        );
        let mut policy = TransportPolicy::default();
        policy.allowed = Some([TransportKind::WsTunnel].into_iter().collect());

        let candidates =
            TransportSelector::candidates(&descriptor, EndpointScope::Control, &policy);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].transport, TransportKind::WsTunnel);
    }

    #[test]
    fn candidates_ordered_by_policy_then_preference() {
        let kp = Keypair::generate();
        let descriptor = PeerDescriptor::create(
            &kp,
            1,
            3_600_000,
            vec![
                endpoint(TransportKind::Tor, 0),
                endpoint(TransportKind::Quic, 5),
                endpoint(TransportKind::Quic, 2),
            ],
            vec![],
            NatClass::Open,
            false,
        );
        let policy = TransportPolicy::default(); // Quic ranks before Tor

        let candidates =
            TransportSelector::candidates(&descriptor, EndpointScope::Control, &policy);
        assert_eq!(candidates[0].transport, TransportKind::Quic);
        assert_eq!(candidates[0].preference, 2);
        assert_eq!(candidates[1].transport, TransportKind::Quic);
        assert_eq!(candidates[1].preference, 5);
        assert_eq!(candidates[2].transport, TransportKind::Tor);
    }

    #[test]
    fn prefer_private_bumps_anonymity_transports() {
        let kp = Keypair::generate();
        let descriptor = PeerDescriptor::create(
            &kp,
            1,
            3_600_000,
            vec![
                endpoint(TransportKind::Quic, 0),
                endpoint(TransportKind::Tor, 9),
            ],
            vec![],
            NatClass::Open,
            false,
        );
        let mut policy = TransportPolicy::default();
        policy.prefer_private = true;

        let candidates =
            TransportSelector::candidates(&descriptor, EndpointScope::Control, &policy);
        assert_eq!(candidates[0].transport, TransportKind::Tor);
    }

    #[test]
    fn downgrade_protector_refuses_weaker_class() {
        let protector = DowngradeProtector::new(StrengthRanking::default());
        let peer = Keypair::generate().peer_id();

        // Nothing recorded yet: anything goes
        assert!(protector.check(&peer, TransportKind::Quic, false).is_ok());

        protector.record_success(&peer, TransportKind::Tor);

        // Tor (class 0) established; Quic (class 2) is a downgrade
        let blocked = protector
            .check(&peer, TransportKind::Quic, false)
            .unwrap_err();
        assert_eq!(blocked.attempted, TransportKind::Quic);

        // Same or stronger class stays fine
        assert!(protector.check(&peer, TransportKind::I2p, false).is_ok());
        // Announced downgrade is allowed
        assert!(protector.check(&peer, TransportKind::Quic, true).is_ok());
    }

    #[test]
    fn downgrade_protector_keeps_strongest_class() {
        let protector = DowngradeProtector::new(StrengthRanking::default());
        let peer = Keypair::generate().peer_id();

        protector.record_success(&peer, TransportKind::Quic);
        protector.record_success(&peer, TransportKind::Tor);
        // A later success over a weaker transport must not erase the record
        protector.record_success(&peer, TransportKind::Quic);

        assert!(protector.check(&peer, TransportKind::Quic, false).is_err());
    }

    #[tokio::test]
    async fn connect_falls_back_to_next_candidate() {
        let fixture = Fixture::new(vec![
            endpoint(TransportKind::Quic, 0),
            endpoint(TransportKind::WsTunnel, 1),
        ]);
        let failing = FakeDialer::new(TransportKind::Quic, true, false);
        let working = FakeDialer::new(TransportKind::WsTunnel, true, true);
        let selector =
            fixture.selector(vec![failing.clone() as Arc<dyn Dialer>, working.clone()]);

        let established = selector
            .connect(&fixture.keypair.peer_id(), EndpointScope::Control, None)
            .await
            .unwrap();
        assert_eq!(established.endpoint.transport, TransportKind::WsTunnel);
        assert_eq!(failing.dials.load(Ordering::Relaxed), 1);
        assert_eq!(working.dials.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn connect_skips_unavailable_dialers_without_dialing() {
        let fixture = Fixture::new(vec![
            endpoint(TransportKind::Quic, 0),
            endpoint(TransportKind::Tor, 1),
        ]);
        let unavailable = FakeDialer::new(TransportKind::Quic, false, true);
        let working = FakeDialer::new(TransportKind::Tor, true, true);
        let selector =
            fixture.selector(vec![unavailable.clone() as Arc<dyn Dialer>, working]);

        let established = selector
            .connect(&fixture.keypair.peer_id(), EndpointScope::Control, None)
            .await
            .unwrap();
        assert_eq!(established.endpoint.transport, TransportKind::Tor);
        assert_eq!(unavailable.dials.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn connect_refuses_unannounced_downgrade() {
        let fixture = Fixture::new(vec![endpoint(TransportKind::Quic, 0)]);
        let quic = FakeDialer::new(TransportKind::Quic, true, true);
        let selector = fixture.selector(vec![quic.clone() as Arc<dyn Dialer>]);
        let peer = fixture.keypair.peer_id();

        // Establish a strong-class record first
        selector.protector.record_success(&peer, TransportKind::Tor);

        let result = selector.connect(&peer, EndpointScope::Control, None).await;
        assert!(matches!(result, Err(SelectError::Exhausted { attempts: 0 })));
        assert_eq!(quic.dials.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn connect_reports_missing_descriptor() {
        let fixture = Fixture::new(vec![endpoint(TransportKind::Quic, 0)]);
        let selector = fixture.selector(vec![FakeDialer::new(TransportKind::Quic, true, true) as Arc<dyn Dialer>]);
        let unknown = Keypair::generate().peer_id();

        assert!(matches!(
            selector.connect(&unknown, EndpointScope::Control, None).await,
            Err(SelectError::NoDescriptor)
        ));
    }

    #[tokio::test]
    async fn connect_validates_pins_and_fails_closed_on_mismatch() {
        let fixture = Fixture::new(vec![endpoint(TransportKind::Quic, 0)]);
        let peer = fixture.keypair.peer_id();

        // Pre-pin a different certificate for the peer
        let pinned = crate::pinning::fingerprint(b"the-real-cert");
        fixture.pins.validate(&peer, &pinned).unwrap();

        let presented = crate::pinning::fingerprint(b"a-mitm-cert");
        let dialer = FakeDialer::with_fingerprint(TransportKind::Quic, presented);
        let selector = fixture.selector(vec![dialer as Arc<dyn Dialer>]);

        let result = selector.connect(&peer, EndpointScope::Control, None).await;
        assert!(matches!(result, Err(SelectError::Exhausted { attempts: 1 })));
    }

    #[tokio::test]
    async fn connect_tofu_pins_first_certificate() {
        let fixture = Fixture::new(vec![endpoint(TransportKind::Quic, 0)]);
        let peer = fixture.keypair.peer_id();

        let presented = crate::pinning::fingerprint(b"first-contact-cert");
        let dialer = FakeDialer::with_fingerprint(TransportKind::Quic, presented);
        let selector = fixture.selector(vec![dialer as Arc<dyn Dialer>]);

        selector
            .connect(&peer, EndpointScope::Control, None)
            .await
            .unwrap();
        assert!(fixture.pins.is_pinned(&peer));
    }

    #[tokio::test]
    async fn scope_filtering_yields_no_candidates() {
        let fixture = Fixture::new(vec![endpoint(TransportKind::Quic, 0)]); // Control scope only
        let selector = fixture.selector(vec![FakeDialer::new(TransportKind::Quic, true, true) as Arc<dyn Dialer>]);

        let result = selector
            .connect(&fixture.keypair.peer_id(), EndpointScope::Data, None)
            .await;
        assert!(matches!(result, Err(SelectError::NoCandidates)));
    }
}
