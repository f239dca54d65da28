//! Health reporter: periodic capacity publish to the registry.
//!
//! One loop per element. Every cycle measures the backend, derives the
//! capacity status, and publishes the registry record with a TTL of three
//! intervals, so a crashed element ages out of discovery on its own. The
//! publish path sits behind a circuit breaker: when Redis is away the
//! element keeps serving and the loop keeps measuring, it just skips the
//! publish until the breaker closes again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::config::SeConfig;
use crate::core::error::EngineResult;
use crate::registry::breaker::CircuitBreaker;
use crate::registry::client::{HealthStatus, RegistryClient, RegistryRecord};
use crate::storage::backend::StorageBackend;
use crate::storage::capacity::CapacitySnapshot;

/// Consecutive publish failures before the breaker opens.
const BREAKER_THRESHOLD: u32 = 3;

/// Health reporter for one Storage Element.
pub struct HealthReporter {
    config: SeConfig,
    backend: Arc<dyn StorageBackend>,
    registry: RegistryClient,
    breaker: CircuitBreaker,
}

impl HealthReporter {
    pub fn new(config: SeConfig, backend: Arc<dyn StorageBackend>, registry: RegistryClient) -> Self {
        let cooldown = config.report_interval;
        Self {
            config,
            backend,
            registry,
            breaker: CircuitBreaker::new(BREAKER_THRESHOLD, cooldown),
        }
    }

    /// Measure and build the record for one cycle.
    pub async fn snapshot(&self) -> EngineResult<(CapacitySnapshot, RegistryRecord)> {
        let (total, used) = self.backend.capacity().await?;
        let snapshot = CapacitySnapshot::new(self.config.mode, total, used);
        let record = RegistryRecord::from_snapshot(
            &self.config.element_id,
            self.config.mode,
            &self.config.endpoint,
            self.config.priority,
            HealthStatus::Healthy,
            &snapshot,
            Utc::now(),
        );
        Ok((snapshot, record))
    }

    /// One publish cycle. Failures feed the breaker and are otherwise
    /// swallowed; the element never crashes over a registry hiccup.
    pub async fn publish_once(&self) {
        if !self.breaker.allow() {
            debug!("registry breaker open; skipping publish");
            return;
        }
        let cycle = async {
            let (_, record) = self.snapshot().await?;
            self.registry
                .publish(&record, self.config.report_ttl.as_secs())
                .await
        };
        match tokio::time::timeout(self.config.report_interval, cycle).await {
            Ok(Ok(())) => self.breaker.record_success(),
            Ok(Err(e)) => {
                warn!(error = %e, "registry publish failed");
                self.breaker.record_failure();
            }
            Err(_) => {
                warn!("registry publish timed out");
                self.breaker.record_failure();
            }
        }
    }

    /// Run until the shutdown signal flips. Deregisters on the way out so
    /// a graceful stop disappears from discovery immediately.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.report_interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            interval_secs = self.config.report_interval.as_secs(),
            element_id = %self.config.element_id,
            "health reporter started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => self.publish_once().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = self
            .registry
            .deregister(&self.config.element_id, self.config.mode)
            .await
        {
            warn!(error = %e, "registry deregister on shutdown failed");
        } else {
            info!(element_id = %self.config.element_id, "deregistered from registry");
        }
    }
}
