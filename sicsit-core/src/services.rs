//! External service capabilities.
//!
//! Consensus, entropy scoring and causal timestamps are provided by outside
//! collaborators. Every call is bounded by a timeout, retried with doubling
//! backoff, and falls back to a conservative local answer when retries run
//! out. Fallback results are flagged as degraded.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{SitError, SitResult};
use crate::packet::Packet;

/// Aggregates multi-party agreement on a packet.
#[async_trait]
pub trait ConsensusService: Send + Sync {
    /// Agreement ratio in `[0, 1]`.
    async fn vote(&self, packet: &Packet) -> SitResult<f64>;
}

/// Scores the novelty of a payload.
#[async_trait]
pub trait EntropyScorer: Send + Sync {
    async fn score(&self, payload: &Map<String, Value>) -> SitResult<f64>;
}

/// Issues causal (lamport) timestamps.
#[async_trait]
pub trait CausalClock: Send + Sync {
    async fn tick(&self) -> SitResult<u64>;
}

/// In-process lamport clock used when no causal service answers.
#[derive(Debug, Default)]
pub struct LocalLamportClock {
    counter: AtomicU64,
}

impl LocalLamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Advance for a local event.
    pub fn tick(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst).saturating_add(1)
    }

    /// Merge a remote timestamp: `max(local, remote) + 1`.
    pub fn observe(&self, remote: u64) -> u64 {
        let merge = |current: u64| current.max(remote).saturating_add(1);
        match self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(merge(c)))
        {
            Ok(previous) | Err(previous) => merge(previous),
        }
    }

    /// Never fall behind a timestamp issued elsewhere.
    fn witness(&self, value: u64) {
        self.counter.fetch_max(value, Ordering::SeqCst);
    }
}

#[async_trait]
impl CausalClock for LocalLamportClock {
    async fn tick(&self) -> SitResult<u64> {
        Ok(LocalLamportClock::tick(self))
    }
}

/// Bounds applied to every service call.
#[derive(Debug, Clone, Copy)]
pub struct ServicePolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each retry.
    pub backoff: Duration,
}

impl Default for ServicePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(250),
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// A service result that may come from a local fallback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Degradable<T> {
    pub value: T,
    pub degraded: bool,
}

impl<T> Degradable<T> {
    pub fn live(value: T) -> Self {
        Self {
            value,
            degraded: false,
        }
    }

    pub fn fallback(value: T) -> Self {
        Self {
            value,
            degraded: true,
        }
    }
}

/// Run `call` under the policy's timeout, retrying with backoff.
pub async fn call_bounded<T, F, Fut>(
    service: &'static str,
    policy: &ServicePolicy,
    mut call: F,
) -> SitResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SitResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut backoff = policy.backoff;
    let mut reason = String::new();

    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => reason = e.to_string(),
            Err(_) => reason = format!("timed out after {}ms", policy.timeout.as_millis()),
        }
        tracing::warn!(service, attempt, max_attempts = attempts, %reason, "Service call failed");

        if attempt < attempts {
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
        }
    }

    Err(SitError::ServiceUnavailable { service, reason })
}

/// The node's handles on external services.
#[derive(Clone)]
pub struct Services {
    consensus: Option<Arc<dyn ConsensusService>>,
    entropy: Option<Arc<dyn EntropyScorer>>,
    clock: Option<Arc<dyn CausalClock>>,
    local_clock: Arc<LocalLamportClock>,
    policy: ServicePolicy,
}

impl Default for Services {
    fn default() -> Self {
        Self::local_only()
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("consensus", &self.consensus.is_some())
            .field("entropy", &self.entropy.is_some())
            .field("clock", &self.clock.is_some())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Services {
    /// No external collaborators; every answer is a local fallback.
    pub fn local_only() -> Self {
        Self {
            consensus: None,
            entropy: None,
            clock: None,
            local_clock: Arc::new(LocalLamportClock::new()),
            policy: ServicePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ServicePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_consensus(mut self, service: Arc<dyn ConsensusService>) -> Self {
        self.consensus = Some(service);
        self
    }

    pub fn with_entropy(mut self, service: Arc<dyn EntropyScorer>) -> Self {
        self.entropy = Some(service);
        self
    }

    pub fn with_clock(mut self, service: Arc<dyn CausalClock>) -> Self {
        self.clock = Some(service);
        self
    }

    pub fn policy(&self) -> &ServicePolicy {
        &self.policy
    }

    pub fn local_clock(&self) -> &LocalLamportClock {
        &self.local_clock
    }

    /// Agreement ratio for a disputed packet. Falls back to 0.0, which no
    /// quorum accepts.
    pub async fn agreement(&self, packet: &Packet) -> Degradable<f64> {
        let Some(service) = &self.consensus else {
            return Degradable::fallback(0.0);
        };
        match call_bounded("consensus", &self.policy, || service.vote(packet)).await {
            Ok(ratio) if (0.0..=1.0).contains(&ratio) => Degradable::live(ratio),
            Ok(ratio) => {
                tracing::warn!(ratio, "Consensus returned an out-of-range ratio");
                Degradable::fallback(0.0)
            }
            Err(_) => Degradable::fallback(0.0),
        }
    }

    /// Novelty of a payload; `None` when no scorer answers.
    pub async fn novelty(&self, payload: &Map<String, Value>) -> Degradable<Option<f64>> {
        let Some(service) = &self.entropy else {
            return Degradable::fallback(None);
        };
        match call_bounded("entropy", &self.policy, || service.score(payload)).await {
            Ok(score) if score.is_finite() => Degradable::live(Some(score)),
            _ => Degradable::fallback(None),
        }
    }

    /// Next causal timestamp. Without a reachable clock service this is the
    /// local lamport clock, flagged as degraded. The local clock never runs
    /// behind a timestamp the service has issued.
    pub async fn tick(&self) -> Degradable<u64> {
        if let Some(service) = &self.clock {
            if let Ok(ts) = call_bounded("causal_clock", &self.policy, || service.tick()).await {
                self.local_clock.witness(ts);
                return Degradable::live(ts);
            }
        }
        Degradable::fallback(self.local_clock.tick())
    }

    /// Merge a peer's timestamp into the local clock.
    pub fn observe(&self, remote: u64) -> u64 {
        self.local_clock.observe(remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketCodec;
    use std::sync::atomic::AtomicU32;

    struct FixedConsensus(f64);

    #[async_trait]
    impl ConsensusService for FixedConsensus {
        async fn vote(&self, _packet: &Packet) -> SitResult<f64> {
            Ok(self.0)
        }
    }

    struct HangingConsensus;

    #[async_trait]
    impl ConsensusService for HangingConsensus {
        async fn vote(&self, _packet: &Packet) -> SitResult<f64> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(1.0)
        }
    }

    /// Fails a fixed number of times, then answers.
    struct FlakyClock {
        failures: AtomicU32,
        value: u64,
    }

    #[async_trait]
    impl CausalClock for FlakyClock {
        async fn tick(&self) -> SitResult<u64> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(SitError::ServiceUnavailable {
                    service: "causal_clock",
                    reason: "warming up".to_string(),
                });
            }
            Ok(self.value)
        }
    }

    struct DownScorer;

    #[async_trait]
    impl EntropyScorer for DownScorer {
        async fn score(&self, _payload: &Map<String, Value>) -> SitResult<f64> {
            Err(SitError::ServiceUnavailable {
                service: "entropy",
                reason: "offline".to_string(),
            })
        }
    }

    fn packet() -> Packet {
        PacketCodec::default()
            .create_packet(serde_json::json!({"intent": "vote"}), "alice", "bob")
            .unwrap()
    }

    #[test]
    fn local_clock_ticks_and_observes() {
        let clock = LocalLamportClock::new();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.observe(10), 11);
        assert_eq!(clock.observe(3), 12);
        assert_eq!(clock.current(), 12);
    }

    #[tokio::test]
    async fn live_consensus_is_reported() {
        let services = Services::local_only().with_consensus(Arc::new(FixedConsensus(0.9)));
        let agreement = services.agreement(&packet()).await;
        assert_eq!(agreement, Degradable::live(0.9));
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_consensus_denies() {
        let services = Services::local_only().with_consensus(Arc::new(HangingConsensus));
        let agreement = services.agreement(&packet()).await;
        assert_eq!(agreement, Degradable::fallback(0.0));

        let unconfigured = Services::local_only().agreement(&packet()).await;
        assert!(unconfigured.degraded);
        assert_eq!(unconfigured.value, 0.0);
    }

    #[tokio::test]
    async fn out_of_range_consensus_is_distrusted() {
        let services = Services::local_only().with_consensus(Arc::new(FixedConsensus(1.5)));
        assert_eq!(services.agreement(&packet()).await, Degradable::fallback(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_recover_within_attempts() {
        let clock = FlakyClock {
            failures: AtomicU32::new(2),
            value: 40,
        };
        let services = Services::local_only().with_clock(Arc::new(clock));
        let ts = services.tick().await;
        assert_eq!(ts, Degradable::live(40));
        // Local clock keeps up with the service.
        assert_eq!(services.local_clock().current(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn clock_falls_back_to_local_lamport() {
        let clock = FlakyClock {
            failures: AtomicU32::new(10),
            value: 40,
        };
        let services = Services::local_only().with_clock(Arc::new(clock));
        let first = services.tick().await;
        let second = services.tick().await;
        assert!(first.degraded && second.degraded);
        assert_eq!(first.value, 1);
        assert_eq!(second.value, 2);

        let local = Services::local_only();
        assert_eq!(local.tick().await, Degradable::fallback(1));
    }

    #[tokio::test(start_paused = true)]
    async fn entropy_outage_yields_no_novelty() {
        let services = Services::local_only().with_entropy(Arc::new(DownScorer));
        let novelty = services.novelty(&Map::new()).await;
        assert_eq!(novelty, Degradable::fallback(None));
    }

    #[tokio::test(start_paused = true)]
    async fn call_bounded_reports_exhaustion() {
        let calls = AtomicU32::new(0);
        let policy = ServicePolicy {
            timeout: Duration::from_millis(10),
            max_attempts: 4,
            backoff: Duration::from_millis(5),
        };
        let started = tokio::time::Instant::now();
        let result: SitResult<()> = call_bounded("health_check", &policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(SitError::ServiceUnavailable {
                    service: "health_check",
                    reason: "down".to_string(),
                })
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(SitError::ServiceUnavailable { service: "health_check", .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 5 + 10 + 20 ms of backoff between the four attempts.
        assert!(started.elapsed() >= Duration::from_millis(35));
    }
}
