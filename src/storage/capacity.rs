//! Capacity thresholds and status ladder.
//!
//! Thresholds are absolute free-byte floors derived from the element's
//! total capacity and its mode. The percentage component keeps big
//! elements from reserving terabytes; the absolute floor keeps small ones
//! from filling up entirely.

use serde::{Deserialize, Serialize};

use crate::storage::mode::SeMode;

const GIB: u64 = 1024 * 1024 * 1024;

/// Health of an element's remaining capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityStatus {
    Ok,
    Warning,
    Critical,
    Full,
}

impl CapacityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityStatus::Ok => "ok",
            CapacityStatus::Warning => "warning",
            CapacityStatus::Critical => "critical",
            CapacityStatus::Full => "full",
        }
    }
}

/// Free-byte floors below which the element escalates its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warning_free: u64,
    pub critical_free: u64,
    pub full_free: u64,
}

impl Thresholds {
    /// Derive thresholds for a mode and total capacity.
    ///
    /// Read-only and archive elements are reported but never escalate.
    pub fn for_mode(mode: SeMode, capacity_total: u64) -> Self {
        let pct = |p: u64| capacity_total / 100 * p;
        match mode {
            SeMode::Rw => Thresholds {
                warning_free: pct(15).max(150 * GIB),
                critical_free: pct(8).max(80 * GIB),
                full_free: pct(2).max(20 * GIB),
            },
            SeMode::Edit => Thresholds {
                warning_free: pct(10).max(100 * GIB),
                critical_free: pct(5).max(50 * GIB),
                full_free: pct(1).max(10 * GIB),
            },
            SeMode::Ro | SeMode::Ar => Thresholds {
                warning_free: 0,
                critical_free: 0,
                full_free: 0,
            },
        }
    }

    /// Classify a free-byte measurement against these thresholds.
    pub fn status_for_free(&self, free: u64) -> CapacityStatus {
        if self.full_free > 0 && free <= self.full_free {
            CapacityStatus::Full
        } else if self.critical_free > 0 && free <= self.critical_free {
            CapacityStatus::Critical
        } else if self.warning_free > 0 && free <= self.warning_free {
            CapacityStatus::Warning
        } else {
            CapacityStatus::Ok
        }
    }
}

/// A point-in-time capacity measurement with derived fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    /// Used fraction as a percentage with two decimals.
    pub percent: f64,
    pub status: CapacityStatus,
    pub thresholds: Thresholds,
}

impl CapacitySnapshot {
    pub fn new(mode: SeMode, total: u64, used: u64) -> Self {
        let free = total.saturating_sub(used);
        let thresholds = Thresholds::for_mode(mode, total);
        let percent = if total == 0 {
            0.0
        } else {
            (used as f64 / total as f64 * 10_000.0).round() / 100.0
        };
        CapacitySnapshot {
            total,
            used,
            free,
            percent,
            status: thresholds.status_for_free(free),
            thresholds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIB: u64 = 1024 * GIB;

    #[test]
    fn test_rw_thresholds_use_percentage_for_large_elements() {
        // 10 TiB: 15% = 1.5 TiB dominates the 150 GiB floor.
        let t = Thresholds::for_mode(SeMode::Rw, 10 * TIB);
        assert_eq!(t.warning_free, 10 * TIB / 100 * 15);
        assert_eq!(t.critical_free, 10 * TIB / 100 * 8);
        assert_eq!(t.full_free, 10 * TIB / 100 * 2);
    }

    #[test]
    fn test_rw_thresholds_use_floor_for_small_elements() {
        // 500 GiB: percentages fall below the absolute floors.
        let t = Thresholds::for_mode(SeMode::Rw, 500 * GIB);
        assert_eq!(t.warning_free, 150 * GIB);
        assert_eq!(t.critical_free, 80 * GIB);
        assert_eq!(t.full_free, 20 * GIB);
    }

    #[test]
    fn test_ro_never_escalates() {
        let t = Thresholds::for_mode(SeMode::Ro, 10 * TIB);
        assert_eq!(t.status_for_free(0), CapacityStatus::Ok);
    }

    #[test]
    fn test_status_ladder_1tib_rw() {
        // 1 TiB rw element at 999 GiB used.
        let snap = CapacitySnapshot::new(SeMode::Rw, TIB, 999 * GIB);
        assert_eq!(snap.free, 25 * GIB);
        // 25 GiB free is below critical_free (max(8% of 1 TiB, 80 GiB) = 80 GiB)
        // but above full_free (20 GiB).
        assert_eq!(snap.status, CapacityStatus::Critical);

        let snap = CapacitySnapshot::new(SeMode::Rw, TIB, 1017 * GIB);
        assert_eq!(snap.free, 7 * GIB);
        assert_eq!(snap.status, CapacityStatus::Full);
    }

    #[test]
    fn test_percent_two_decimals() {
        let snap = CapacitySnapshot::new(SeMode::Rw, 3 * GIB, GIB);
        assert_eq!(snap.percent, 33.33);
    }

    #[test]
    fn test_boundary_exactly_on_threshold_escalates() {
        let t = Thresholds::for_mode(SeMode::Rw, TIB);
        assert_eq!(t.status_for_free(t.full_free), CapacityStatus::Full);
        assert_eq!(t.status_for_free(t.full_free + 1), CapacityStatus::Critical);
        assert_eq!(t.status_for_free(t.critical_free + 1), CapacityStatus::Warning);
        assert_eq!(t.status_for_free(t.warning_free + 1), CapacityStatus::Ok);
    }
}
