//! Operating modes and the startup-only transition rules.
//!
//! A Storage Element runs in exactly one mode for its whole process
//! lifetime. Transitions only happen across restarts, and only forward
//! along the lifecycle: edit -> rw -> ro -> ar. Anything else is a
//! configuration error surfaced before the HTTP surface binds.

use serde::{Deserialize, Serialize};

use crate::core::error::{EngineError, EngineResult};

/// Operating posture of a Storage Element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeMode {
    /// Full lifecycle: create, read, update, delete.
    Edit,
    /// Create/read/update; delete reserved for admin service accounts.
    Rw,
    /// Read only.
    Ro,
    /// Archive: metadata reads only, downloads queue a restore.
    Ar,
}

impl SeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeMode::Edit => "edit",
            SeMode::Rw => "rw",
            SeMode::Ro => "ro",
            SeMode::Ar => "ar",
        }
    }

    /// Lifecycle rank; transitions must be strictly forward.
    fn rank(&self) -> u8 {
        match self {
            SeMode::Edit => 0,
            SeMode::Rw => 1,
            SeMode::Ro => 2,
            SeMode::Ar => 3,
        }
    }

    /// Whether `self -> to` is a legal across-restart transition.
    /// Staying in the same mode is always allowed.
    pub fn can_transition_to(&self, to: SeMode) -> bool {
        to.rank() == self.rank() || to.rank() == self.rank() + 1
    }

    /// Validate a persisted-previous-mode -> configured-mode step,
    /// producing the startup error on violation.
    pub fn validate_transition(previous: SeMode, configured: SeMode) -> EngineResult<()> {
        if previous.can_transition_to(configured) {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                from: previous.as_str().to_string(),
                to: configured.as_str().to_string(),
            })
        }
    }

    pub fn allows_create(&self) -> bool {
        matches!(self, SeMode::Edit | SeMode::Rw)
    }

    pub fn allows_update(&self) -> bool {
        matches!(self, SeMode::Edit | SeMode::Rw)
    }

    /// Byte reads. In `ar` only metadata is readable; the download path
    /// answers with a restore ticket instead.
    pub fn allows_read_bytes(&self) -> bool {
        !matches!(self, SeMode::Ar)
    }

    /// Deletes are an `edit` operation; `rw` admits them only for admin
    /// service accounts, which the caller resolves before asking.
    pub fn allows_delete(&self, principal_is_admin: bool) -> bool {
        match self {
            SeMode::Edit => true,
            SeMode::Rw => principal_is_admin,
            SeMode::Ro | SeMode::Ar => false,
        }
    }

    /// Whether capacity thresholds apply (write-capable modes only).
    pub fn capacity_managed(&self) -> bool {
        matches!(self, SeMode::Edit | SeMode::Rw)
    }
}

impl std::str::FromStr for SeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "edit" => Ok(SeMode::Edit),
            "rw" => Ok(SeMode::Rw),
            "ro" => Ok(SeMode::Ro),
            "ar" => Ok(SeMode::Ar),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

impl std::fmt::Display for SeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_allowed() {
        assert!(SeMode::Edit.can_transition_to(SeMode::Rw));
        assert!(SeMode::Rw.can_transition_to(SeMode::Ro));
        assert!(SeMode::Ro.can_transition_to(SeMode::Ar));
        assert!(SeMode::Rw.can_transition_to(SeMode::Rw));
    }

    #[test]
    fn test_backward_and_skipping_transitions_rejected() {
        assert!(!SeMode::Rw.can_transition_to(SeMode::Edit));
        assert!(!SeMode::Ar.can_transition_to(SeMode::Ro));
        assert!(!SeMode::Edit.can_transition_to(SeMode::Ro));
        assert!(!SeMode::Edit.can_transition_to(SeMode::Ar));

        let err = SeMode::validate_transition(SeMode::Ro, SeMode::Rw).unwrap_err();
        assert!(matches!(
            err,
            crate::core::error::EngineError::InvalidTransition { .. }
        ));
    }

    #[test]
    fn test_operation_matrix() {
        assert!(SeMode::Edit.allows_create());
        assert!(SeMode::Rw.allows_create());
        assert!(!SeMode::Ro.allows_create());
        assert!(!SeMode::Ar.allows_create());

        assert!(SeMode::Edit.allows_delete(false));
        assert!(!SeMode::Rw.allows_delete(false));
        assert!(SeMode::Rw.allows_delete(true));
        assert!(!SeMode::Ro.allows_delete(true));

        assert!(SeMode::Ro.allows_read_bytes());
        assert!(!SeMode::Ar.allows_read_bytes());
    }

    #[test]
    fn test_parse_round_trip() {
        for mode in [SeMode::Edit, SeMode::Rw, SeMode::Ro, SeMode::Ar] {
            assert_eq!(mode.as_str().parse::<SeMode>().unwrap(), mode);
        }
        assert!("archive".parse::<SeMode>().is_err());
    }
}
