//! Redis registry: discovery hashes and priority sorted sets.
//!
//! Each element owns `storage:elements:{id}` plus its entries in the
//! per-mode priority sets. Records carry a TTL so a crashed element drops
//! out of discovery on its own (fail-open); a graceful shutdown deletes
//! them eagerly. All hash fields are strings per the registry schema:
//! integers in decimal, percentages and thresholds with two decimals.

use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};

use crate::core::error::{EngineError, EngineResult};
use crate::storage::capacity::{CapacitySnapshot, CapacityStatus};
use crate::storage::mode::SeMode;

/// Health as published to the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Offline,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Offline => "offline",
        }
    }
}

/// One element's registry record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub id: String,
    pub mode: SeMode,
    pub capacity_total: u64,
    pub capacity_used: u64,
    pub capacity_free: u64,
    pub capacity_percent: f64,
    pub endpoint: String,
    pub priority: i64,
    pub last_updated: String,
    pub health_status: HealthStatus,
    pub capacity_status: CapacityStatus,
    pub threshold_warning: u64,
    pub threshold_critical: u64,
    pub threshold_full: u64,
}

impl RegistryRecord {
    pub fn from_snapshot(
        id: &str,
        mode: SeMode,
        endpoint: &str,
        priority: i64,
        health: HealthStatus,
        snapshot: &CapacitySnapshot,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            id: id.to_string(),
            mode,
            capacity_total: snapshot.total,
            capacity_used: snapshot.used,
            capacity_free: snapshot.free,
            capacity_percent: snapshot.percent,
            endpoint: endpoint.to_string(),
            priority,
            last_updated: now.to_rfc3339(),
            health_status: health,
            capacity_status: snapshot.status,
            threshold_warning: snapshot.thresholds.warning_free,
            threshold_critical: snapshot.thresholds.critical_free,
            threshold_full: snapshot.thresholds.full_free,
        }
    }

    /// Hash fields in the registry's string encoding.
    fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("id", self.id.clone()),
            ("mode", self.mode.as_str().to_string()),
            ("capacity_total", self.capacity_total.to_string()),
            ("capacity_used", self.capacity_used.to_string()),
            ("capacity_free", self.capacity_free.to_string()),
            ("capacity_percent", format!("{:.2}", self.capacity_percent)),
            ("endpoint", self.endpoint.clone()),
            ("priority", self.priority.to_string()),
            ("last_updated", self.last_updated.clone()),
            ("health_status", self.health_status.as_str().to_string()),
            ("capacity_status", self.capacity_status.as_str().to_string()),
            ("threshold_warning", format!("{:.2}", self.threshold_warning as f64)),
            ("threshold_critical", format!("{:.2}", self.threshold_critical as f64)),
            ("threshold_full", format!("{:.2}", self.threshold_full as f64)),
        ]
    }

    fn from_fields(fields: &std::collections::HashMap<String, String>) -> EngineResult<Self> {
        let get = |k: &str| -> EngineResult<String> {
            fields
                .get(k)
                .cloned()
                .ok_or_else(|| EngineError::Internal(format!("registry record missing {k}")))
        };
        let parse_u64 = |s: String| s.parse::<f64>().map(|v| v as u64).unwrap_or(0);
        Ok(Self {
            id: get("id")?,
            mode: get("mode")?.parse().map_err(EngineError::Internal)?,
            capacity_total: parse_u64(get("capacity_total")?),
            capacity_used: parse_u64(get("capacity_used")?),
            capacity_free: parse_u64(get("capacity_free")?),
            capacity_percent: get("capacity_percent")?.parse().unwrap_or(0.0),
            endpoint: get("endpoint")?,
            priority: get("priority")?.parse().unwrap_or(0),
            last_updated: get("last_updated")?,
            health_status: match get("health_status")?.as_str() {
                "healthy" => HealthStatus::Healthy,
                "degraded" => HealthStatus::Degraded,
                _ => HealthStatus::Offline,
            },
            capacity_status: match get("capacity_status")?.as_str() {
                "warning" => CapacityStatus::Warning,
                "critical" => CapacityStatus::Critical,
                "full" => CapacityStatus::Full,
                _ => CapacityStatus::Ok,
            },
            threshold_warning: parse_u64(get("threshold_warning")?),
            threshold_critical: parse_u64(get("threshold_critical")?),
            threshold_full: parse_u64(get("threshold_full")?),
        })
    }
}

fn element_key(id: &str) -> String {
    format!("storage:elements:{id}")
}

fn priority_set_key(mode: SeMode) -> String {
    format!("storage:{}:by_priority", mode.as_str())
}

/// Registry client shared by the health reporter and the Admin readers.
#[derive(Clone)]
pub struct RegistryClient {
    redis: ConnectionManager,
}

impl RegistryClient {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    pub async fn connect(redis_url: &str) -> EngineResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self::new(manager))
    }

    /// Publish a record with TTL and maintain the priority set membership.
    ///
    /// A full element is removed from its mode's sorted set so it stops
    /// receiving placements while continuing to serve reads.
    pub async fn publish(&self, record: &RegistryRecord, ttl_secs: u64) -> EngineResult<()> {
        let key = element_key(&record.id);
        let mut cmd = redis::cmd("HSET");
        cmd.arg(&key);
        for (field, value) in record.to_fields() {
            cmd.arg(field).arg(value);
        }
        cmd.query_async::<_, ()>(&mut self.redis.clone()).await?;

        redis::cmd("EXPIRE")
            .arg(&key)
            .arg(ttl_secs.max(1))
            .query_async::<_, ()>(&mut self.redis.clone())
            .await?;

        if record.mode.capacity_managed() {
            let set = priority_set_key(record.mode);
            if record.capacity_status == CapacityStatus::Full {
                redis::cmd("ZREM")
                    .arg(&set)
                    .arg(&record.id)
                    .query_async::<_, ()>(&mut self.redis.clone())
                    .await?;
            } else {
                redis::cmd("ZADD")
                    .arg(&set)
                    .arg(record.priority)
                    .arg(&record.id)
                    .query_async::<_, ()>(&mut self.redis.clone())
                    .await?;
            }
        }
        Ok(())
    }

    /// Remove every trace of an element. Called on graceful shutdown.
    pub async fn deregister(&self, id: &str, mode: SeMode) -> EngineResult<()> {
        redis::cmd("DEL")
            .arg(element_key(id))
            .query_async::<_, ()>(&mut self.redis.clone())
            .await?;
        if mode.capacity_managed() {
            redis::cmd("ZREM")
                .arg(priority_set_key(mode))
                .arg(id)
                .query_async::<_, ()>(&mut self.redis.clone())
                .await?;
        }
        Ok(())
    }

    /// Fetch one element's record; `None` when expired or never published.
    pub async fn get_record(&self, id: &str) -> EngineResult<Option<RegistryRecord>> {
        let fields: std::collections::HashMap<String, String> = redis::cmd("HGETALL")
            .arg(element_key(id))
            .query_async(&mut self.redis.clone())
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        RegistryRecord::from_fields(&fields).map(Some)
    }

    /// Element ids for a mode ordered by ascending priority score.
    pub async fn elements_by_priority(&self, mode: SeMode) -> EngineResult<Vec<String>> {
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(priority_set_key(mode))
            .arg(0)
            .arg(-1)
            .query_async(&mut self.redis.clone())
            .await?;
        Ok(ids)
    }

    /// Best-priority element with at least `min_free_bytes` available.
    pub async fn select_element(
        &self,
        mode: SeMode,
        min_free_bytes: u64,
    ) -> EngineResult<Option<RegistryRecord>> {
        for id in self.elements_by_priority(mode).await? {
            if let Some(record) = self.get_record(&id).await? {
                if record.capacity_free >= min_free_bytes
                    && record.health_status != HealthStatus::Offline
                {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> RegistryRecord {
        let snapshot = CapacitySnapshot::new(SeMode::Rw, 1 << 40, 999 * (1 << 30));
        RegistryRecord::from_snapshot(
            "se-1",
            SeMode::Rw,
            "http://se-1:8081",
            10,
            HealthStatus::Healthy,
            &snapshot,
            chrono::Utc.with_ymd_and_hms(2025, 11, 8, 10, 30, 45).unwrap(),
        )
    }

    #[test]
    fn test_keys() {
        assert_eq!(element_key("se-1"), "storage:elements:se-1");
        assert_eq!(priority_set_key(SeMode::Rw), "storage:rw:by_priority");
        assert_eq!(priority_set_key(SeMode::Edit), "storage:edit:by_priority");
    }

    #[test]
    fn test_field_encoding() {
        let fields = record().to_fields();
        let lookup: std::collections::HashMap<_, _> = fields.into_iter().collect();
        assert_eq!(lookup["mode"], "rw");
        assert_eq!(lookup["capacity_total"], (1u64 << 40).to_string());
        // Two-decimal fixed point.
        assert!(lookup["capacity_percent"].contains('.'));
        assert_eq!(
            lookup["capacity_percent"]
                .split('.')
                .nth(1)
                .unwrap()
                .len(),
            2
        );
        assert!(lookup["threshold_warning"].ends_with(".00"));
        assert_eq!(lookup["health_status"], "healthy");
        assert_eq!(lookup["capacity_status"], "critical");
    }

    #[test]
    fn test_fields_round_trip() {
        let original = record();
        let fields: std::collections::HashMap<String, String> = original
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let parsed = RegistryRecord::from_fields(&fields).unwrap();
        assert_eq!(parsed.id, original.id);
        assert_eq!(parsed.mode, original.mode);
        assert_eq!(parsed.capacity_free, original.capacity_free);
        assert_eq!(parsed.capacity_status, original.capacity_status);
        assert_eq!(parsed.priority, original.priority);
    }
}
