//! # Service Router
//!
//! Dispatches inbound service calls to registered handlers under defensive
//! admission checks, so one abusive peer or one failing service cannot
//! destabilize the fabric.
//!
//! ## Dispatch Pipeline
//!
//! 1. Reject before any handler runs: empty call/service name
//!    (`InvalidPayload`), oversized payload (`PayloadTooLarge`), unknown
//!    service (`ServiceNotFound`).
//! 2. Per-service circuit breaker: opens after N consecutive handler
//!    failures, refuses calls until the cooldown elapses.
//! 3. Per-peer work budget: each call costs work units; a per-call cap and
//!    a per-minute bucket bound what a single peer can cause.
//! 4. The handler runs in a spawned task; an `Err` or a panic is recorded
//!    against the breaker and mapped to a generic `UnknownError` reply so
//!    handler internals never leak to the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::identity::PeerId;
use crate::messages::{CallStatus, ServiceCall, ServiceReply, MAX_PAYLOAD_SIZE};
use crate::ratelimit::KeyedBuckets;

/// Consecutive handler failures before a service's breaker opens.
const BREAKER_FAILURE_THRESHOLD: u32 = 5;

/// Maximum peers tracked by the work-budget limiter.
const MAX_TRACKED_CALLERS: usize = 10_000;

/// A handler registered under a service name.
#[async_trait]
pub trait MeshService: Send + Sync {
    /// Work units a call to `method` costs. Defaults to one unit.
    fn call_cost(&self, method: &str) -> u32 {
        let _ = method;
        1
    }

    async fn handle(&self, caller: PeerId, method: &str, payload: &[u8])
        -> anyhow::Result<Vec<u8>>;
}

/// Router tuning knobs.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_payload_size: usize,
    pub breaker_cooldown: Duration,
    /// Hard cap on units a single call may cost.
    pub work_units_per_call: u32,
    /// Units a single peer may spend per minute across all services.
    pub work_units_per_minute: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
            breaker_cooldown: Duration::from_secs(30),
            work_units_per_call: 100,
            work_units_per_minute: 600,
        }
    }
}

#[derive(Debug, Default)]
struct CircuitBreaker {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    /// Whether the breaker currently refuses calls. An elapsed cooldown
    /// closes the breaker and resets the failure count.
    fn is_open(&mut self) -> bool {
        match self.open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                self.open_until = None;
                self.consecutive_failures = 0;
                false
            }
            None => false,
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.open_until = None;
    }

    fn record_failure(&mut self, cooldown: Duration) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= BREAKER_FAILURE_THRESHOLD {
            self.open_until = Some(Instant::now() + cooldown);
            return true;
        }
        false
    }
}

pub struct ServiceRouter {
    services: RwLock<HashMap<String, Arc<dyn MeshService>>>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    work_budget: KeyedBuckets<PeerId>,
    config: RouterConfig,
}

impl ServiceRouter {
    pub fn new(config: RouterConfig) -> Arc<Self> {
        let per_minute = config.work_units_per_minute;
        Arc::new(Self {
            services: RwLock::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            work_budget: KeyedBuckets::new(
                MAX_TRACKED_CALLERS,
                per_minute,
                per_minute as f64 / 60.0,
            ),
            config,
        })
    }

    /// Register a handler under a service name, replacing any existing one.
    pub fn register(&self, name: impl Into<String>, service: Arc<dyn MeshService>) {
        let name = name.into();
        debug!(service = %name, "service registered");
        self.services
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name, service);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.services
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.services
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(name)
    }

    fn breaker_is_open(&self, name: &str) -> bool {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        breakers.entry(name.to_string()).or_default().is_open()
    }

    fn breaker_record(&self, name: &str, success: bool) {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let breaker = breakers.entry(name.to_string()).or_default();
        if success {
            breaker.record_success();
        } else if breaker.record_failure(self.config.breaker_cooldown) {
            warn!(service = %name, "circuit breaker opened after repeated failures");
        }
    }

    /// Route one inbound call. Always yields a reply; nothing here is fatal.
    pub async fn dispatch(&self, caller: PeerId, call: ServiceCall) -> ServiceReply {
        let correlation_id = call.correlation_id;

        if call.service.is_empty() || call.method.is_empty() {
            return ServiceReply::error(CallStatus::InvalidPayload, correlation_id);
        }
        if call.payload.len() > self.config.max_payload_size {
            debug!(
                service = %call.service,
                len = call.payload.len(),
                "rejecting oversized payload"
            );
            return ServiceReply::error(CallStatus::PayloadTooLarge, correlation_id);
        }

        let service = {
            let services = self
                .services
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match services.get(&call.service) {
                Some(s) => s.clone(),
                None => {
                    return ServiceReply::error(CallStatus::ServiceNotFound, correlation_id);
                }
            }
        };

        if self.breaker_is_open(&call.service) {
            debug!(service = %call.service, "circuit breaker open, refusing call");
            return ServiceReply::error(CallStatus::UnknownError, correlation_id);
        }

        let cost = service.call_cost(&call.method);
        if cost > self.config.work_units_per_call {
            warn!(
                service = %call.service,
                method = %call.method,
                cost,
                "call exceeds per-call work cap"
            );
            return ServiceReply::error(CallStatus::UnknownError, correlation_id);
        }
        if !self.work_budget.try_consume_n(caller, cost as f64) {
            debug!(caller = %caller, cost, "per-peer work budget exhausted");
            return ServiceReply::error(CallStatus::UnknownError, correlation_id);
        }

        // Run the handler in its own task so a panic surfaces as a JoinError
        // instead of unwinding through the router.
        let service_name = call.service.clone();
        let method = call.method;
        let payload = call.payload;
        let handle =
            tokio::spawn(async move { service.handle(caller, &method, &payload).await });

        match handle.await {
            Ok(Ok(reply_payload)) => {
                self.breaker_record(&service_name, true);
                ServiceReply {
                    status: CallStatus::Ok,
                    correlation_id,
                    payload: reply_payload,
                }
            }
            Ok(Err(e)) => {
                debug!(service = %service_name, error = %e, "handler returned error");
                self.breaker_record(&service_name, false);
                ServiceReply::error(CallStatus::UnknownError, correlation_id)
            }
            Err(join_error) => {
                warn!(service = %service_name, error = %join_error, "handler panicked");
                self.breaker_record(&service_name, false);
                ServiceReply::error(CallStatus::UnknownError, correlation_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    struct EchoService;

    #[async_trait]
    impl MeshService for EchoService {
        async fn handle(
            &self,
            _caller: PeerId,
            _method: &str,
            payload: &[u8],
        ) -> anyhow::Result<Vec<u8>> {
            Ok(payload.to_vec())
        }
    }

    struct FailingService;

    #[async_trait]
    impl MeshService for FailingService {
        async fn handle(
            &self,
            _caller: PeerId,
            _method: &str,
            _payload: &[u8],
        ) -> anyhow::Result<Vec<u8>> {
            anyhow::bail!("database on fire")
        }
    }

    struct PanickingService;

    #[async_trait]
    impl MeshService for PanickingService {
        async fn handle(
            &self,
            _caller: PeerId,
            _method: &str,
            _payload: &[u8],
        ) -> anyhow::Result<Vec<u8>> {
            panic!("handler bug")
        }
    }

    struct ExpensiveService;

    #[async_trait]
    impl MeshService for ExpensiveService {
        fn call_cost(&self, _method: &str) -> u32 {
            50
        }

        async fn handle(
            &self,
            _caller: PeerId,
            _method: &str,
            _payload: &[u8],
        ) -> anyhow::Result<Vec<u8>> {
            Ok(vec![])
        }
    }

    fn call(service: &str, payload: Vec<u8>) -> ServiceCall {
        ServiceCall {
            service: service.to_string(),
            method: "run".to_string(),
            correlation_id: [7u8; 16],
            payload,
        }
    }

    fn caller() -> PeerId {
        Keypair::generate().peer_id()
    }

    #[tokio::test]
    async fn dispatches_to_registered_service() {
        let router = ServiceRouter::new(RouterConfig::default());
        router.register("echo", Arc::new(EchoService));

        let reply = router.dispatch(caller(), call("echo", b"ping".to_vec())).await;
        assert_eq!(reply.status, CallStatus::Ok);
        assert_eq!(reply.payload, b"ping");
        assert_eq!(reply.correlation_id, [7u8; 16]);
    }

    #[tokio::test]
    async fn empty_service_name_rejected_before_dispatch() {
        let router = ServiceRouter::new(RouterConfig::default());
        let reply = router.dispatch(caller(), call("", vec![])).await;
        assert_eq!(reply.status, CallStatus::InvalidPayload);
    }

    #[tokio::test]
    async fn empty_method_rejected_before_dispatch() {
        let router = ServiceRouter::new(RouterConfig::default());
        router.register("echo", Arc::new(EchoService));
        let mut c = call("echo", vec![]);
        c.method = String::new();
        let reply = router.dispatch(caller(), c).await;
        assert_eq!(reply.status, CallStatus::InvalidPayload);
    }

    #[tokio::test]
    async fn oversized_payload_rejected() {
        let mut config = RouterConfig::default();
        config.max_payload_size = 16;
        let router = ServiceRouter::new(config);
        router.register("echo", Arc::new(EchoService));

        let reply = router.dispatch(caller(), call("echo", vec![0u8; 17])).await;
        assert_eq!(reply.status, CallStatus::PayloadTooLarge);
    }

    #[tokio::test]
    async fn unknown_service_rejected() {
        let router = ServiceRouter::new(RouterConfig::default());
        let reply = router.dispatch(caller(), call("ghost", vec![])).await;
        assert_eq!(reply.status, CallStatus::ServiceNotFound);
    }

    #[tokio::test]
    async fn handler_error_maps_to_generic_internal_error() {
        let router = ServiceRouter::new(RouterConfig::default());
        router.register("broken", Arc::new(FailingService));

        let reply = router.dispatch(caller(), call("broken", vec![])).await;
        assert_eq!(reply.status, CallStatus::UnknownError);
        // No handler internals leak
        assert!(reply.payload.is_empty());
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let router = ServiceRouter::new(RouterConfig::default());
        router.register("panics", Arc::new(PanickingService));
        router.register("echo", Arc::new(EchoService));

        let reply = router.dispatch(caller(), call("panics", vec![])).await;
        assert_eq!(reply.status, CallStatus::UnknownError);

        // The router keeps serving other services afterwards
        let reply = router.dispatch(caller(), call("echo", b"alive".to_vec())).await;
        assert_eq!(reply.status, CallStatus::Ok);
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_failures() {
        let mut config = RouterConfig::default();
        config.breaker_cooldown = Duration::from_secs(60);
        let router = ServiceRouter::new(config);
        router.register("flaky", Arc::new(FailingService));

        let peer = caller();
        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            let reply = router.dispatch(peer, call("flaky", vec![])).await;
            assert_eq!(reply.status, CallStatus::UnknownError);
        }

        // Breaker is now open: replace the handler with a healthy one and
        // observe calls still refused without invoking it.
        router.register("flaky", Arc::new(EchoService));
        let reply = router.dispatch(peer, call("flaky", b"x".to_vec())).await;
        assert_eq!(reply.status, CallStatus::UnknownError);
    }

    #[tokio::test]
    async fn breaker_closes_after_cooldown() {
        let mut config = RouterConfig::default();
        config.breaker_cooldown = Duration::from_millis(20);
        let router = ServiceRouter::new(config);
        router.register("flaky", Arc::new(FailingService));

        let peer = caller();
        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            router.dispatch(peer, call("flaky", vec![])).await;
        }

        router.register("flaky", Arc::new(EchoService));
        tokio::time::sleep(Duration::from_millis(40)).await;

        let reply = router.dispatch(peer, call("flaky", b"back".to_vec())).await;
        assert_eq!(reply.status, CallStatus::Ok);
    }

    #[tokio::test]
    async fn success_resets_breaker_counter() {
        let router = ServiceRouter::new(RouterConfig::default());
        router.register("echo", Arc::new(EchoService));

        let peer = caller();
        // Interleave failures below threshold with a success; breaker must
        // never open.
        router.register("mixed", Arc::new(FailingService));
        for _ in 0..(BREAKER_FAILURE_THRESHOLD - 1) {
            router.dispatch(peer, call("mixed", vec![])).await;
        }
        router.register("mixed", Arc::new(EchoService));
        let reply = router.dispatch(peer, call("mixed", vec![])).await;
        assert_eq!(reply.status, CallStatus::Ok);

        router.register("mixed", Arc::new(FailingService));
        let reply = router.dispatch(peer, call("mixed", vec![])).await;
        // One failure after a success: breaker still closed, handler ran
        assert_eq!(reply.status, CallStatus::UnknownError);
        router.register("mixed", Arc::new(EchoService));
        let reply = router.dispatch(peer, call("mixed", vec![])).await;
        assert_eq!(reply.status, CallStatus::Ok);
    }

    #[tokio::test]
    async fn per_call_work_cap_enforced() {
        let mut config = RouterConfig::default();
        config.work_units_per_call = 10;
        let router = ServiceRouter::new(config);
        router.register("expensive", Arc::new(ExpensiveService));

        let reply = router.dispatch(caller(), call("expensive", vec![])).await;
        assert_eq!(reply.status, CallStatus::UnknownError);
    }

    #[tokio::test]
    async fn per_minute_work_budget_caps_one_peer() {
        let mut config = RouterConfig::default();
        config.work_units_per_minute = 100;
        let router = ServiceRouter::new(config);
        router.register("expensive", Arc::new(ExpensiveService));

        let greedy = caller();
        // 50 units each: two calls drain the minute budget
        assert_eq!(
            router.dispatch(greedy, call("expensive", vec![])).await.status,
            CallStatus::Ok
        );
        assert_eq!(
            router.dispatch(greedy, call("expensive", vec![])).await.status,
            CallStatus::Ok
        );
        assert_eq!(
            router.dispatch(greedy, call("expensive", vec![])).await.status,
            CallStatus::UnknownError
        );

        // An unrelated peer is unaffected
        assert_eq!(
            router.dispatch(caller(), call("expensive", vec![])).await.status,
            CallStatus::Ok
        );
    }
}
