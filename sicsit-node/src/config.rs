//! Node configuration for SIC-SIT.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sicsit_core::{HandshakeConfig, PacketCodec, ServicePolicy, SitError, SitResult};

/// Node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Local entity id; packets addressed elsewhere are refused.
    pub entity_id: String,
    /// Packet freshness window in milliseconds.
    pub packet_freshness_ms: i64,
    /// Tolerated handshake timestamp skew in milliseconds.
    pub max_clock_skew_ms: i64,
    /// Deadline for each pending handshake step.
    pub pending_timeout_ms: u64,
    /// Nonce ledger retention in milliseconds.
    pub nonce_window_ms: u64,
    /// Maximum live nonces.
    pub nonce_capacity: usize,
    /// Drift scores above this are reported as drift.
    pub drift_threshold: f64,
    /// Minimum agreement ratio when drift is routed to consensus.
    pub consensus_quorum: f64,
    pub service_timeout_ms: u64,
    pub service_attempts: u32,
    pub service_backoff_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            entity_id: "sit-node".to_string(),
            packet_freshness_ms: 30_000,
            max_clock_skew_ms: 30_000,
            pending_timeout_ms: 30_000,
            nonce_window_ms: 90_000,
            nonce_capacity: 65_536,
            drift_threshold: 0.0,
            consensus_quorum: 0.667,
            service_timeout_ms: 250,
            service_attempts: 3,
            service_backoff_ms: 50,
        }
    }
}

impl NodeConfig {
    /// Create a config for a named entity.
    pub fn with_entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            ..Default::default()
        }
    }

    /// Set the pending handshake deadline.
    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the drift threshold.
    pub fn with_drift_threshold(mut self, threshold: f64) -> Self {
        self.drift_threshold = threshold;
        self
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(document: &str) -> SitResult<Self> {
        let config: Self = serde_json::from_str(document)
            .map_err(|e| SitError::Config(format!("unparseable config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> SitResult<Self> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path)
            .map_err(|e| SitError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_json_str(&document)
    }

    pub fn validate(&self) -> SitResult<()> {
        if self.entity_id.trim().is_empty() {
            return Err(SitError::Config("entity_id must be non-empty".to_string()));
        }
        if self.packet_freshness_ms <= 0 || self.max_clock_skew_ms <= 0 {
            return Err(SitError::Config(
                "freshness and clock skew must be positive".to_string(),
            ));
        }
        // Nonces must outlive every message the handshake would still accept.
        if self.nonce_window_ms <= 2 * self.max_clock_skew_ms as u64 {
            return Err(SitError::Config(format!(
                "nonce_window_ms ({}) must exceed twice max_clock_skew_ms ({})",
                self.nonce_window_ms, self.max_clock_skew_ms
            )));
        }
        if self.nonce_capacity == 0 {
            return Err(SitError::Config("nonce_capacity must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.drift_threshold) {
            return Err(SitError::Config("drift_threshold must lie in [0, 1]".to_string()));
        }
        if !(0.0..=1.0).contains(&self.consensus_quorum) {
            return Err(SitError::Config("consensus_quorum must lie in [0, 1]".to_string()));
        }
        if self.service_attempts == 0 {
            return Err(SitError::Config("service_attempts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn handshake_config(&self) -> HandshakeConfig {
        HandshakeConfig {
            pending_timeout: Duration::from_millis(self.pending_timeout_ms),
            max_clock_skew_ms: self.max_clock_skew_ms,
        }
    }

    pub fn service_policy(&self) -> ServicePolicy {
        ServicePolicy {
            timeout: Duration::from_millis(self.service_timeout_ms),
            max_attempts: self.service_attempts,
            backoff: Duration::from_millis(self.service_backoff_ms),
        }
    }

    pub fn codec(&self) -> PacketCodec {
        PacketCodec::new(self.packet_freshness_ms)
    }

    pub fn nonce_window(&self) -> Duration {
        Duration::from_millis(self.nonce_window_ms)
    }
}
