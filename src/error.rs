//! Error types for kernel validation, planning and verification.

use crate::model::Position;
use crate::target::{CoreGroup, ExecutionUnit, Lane};
use std::fmt;
use thiserror::Error;

/// Kind of defect the verifier found in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    /// A set that no wait ever consumes.
    MissingWait,
    /// A set reusing an identity whose previous signal was not consumed yet.
    PrematureReuse,
    /// No lane can make progress.
    SelfDeadlock,
    /// A wait whose producing lane has already finished.
    StarvedWait,
    /// A write racing a previous reader or writer of the same slot.
    OrphanWrite,
    /// A read racing the slot's last writer.
    UnorderedAccess,
}

impl ViolationKind {
    pub fn name(self) -> &'static str {
        match self {
            ViolationKind::MissingWait => "MissingWait",
            ViolationKind::PrematureReuse => "PrematureReuse",
            ViolationKind::SelfDeadlock => "SelfDeadlock",
            ViolationKind::StarvedWait => "StarvedWait",
            ViolationKind::OrphanWrite => "OrphanWrite",
            ViolationKind::UnorderedAccess => "UnorderedAccess",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One verifier finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub kind: ViolationKind,
    /// Where in the linearized plan it was detected.
    pub position: Position,
    /// Lane the offending step runs on.
    pub lane: Lane,
    pub detail: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {} on {}: {}",
            self.kind, self.position, self.lane, self.detail
        )
    }
}

/// Errors produced while building or checking a synchronization plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("no legal synchronization path from {producer} to {consumer} at {position}")]
    NoLegalPath {
        producer: Lane,
        consumer: Lane,
        position: Position,
    },

    #[error("resource '{resource}' read at {position} before any write")]
    UseBeforeProduce { resource: String, position: Position },

    #[error(
        "event pool exhausted for {group} {producer}->{consumer} at {position}: \
         requested {requested}, {available} left"
    )]
    EventPoolExhausted {
        group: CoreGroup,
        producer: ExecutionUnit,
        consumer: ExecutionUnit,
        requested: u32,
        available: u32,
        position: Position,
    },

    #[error("resource '{resource}' is not visible to unit {unit} at {position}")]
    InvisibleResource {
        resource: String,
        unit: ExecutionUnit,
        position: Position,
    },

    #[error("invalid rotation width {0} (expected 1..=5)")]
    InvalidRotationWidth(u8),

    #[error("unknown resource '{name}' at {position}")]
    UnknownResource { name: String, position: Position },

    #[error("unknown loop '{name}' at {position}")]
    UnknownLoop { name: String, position: Position },

    #[error("malformed loop nest at {position}: {reason}")]
    MalformedLoopNest { reason: String, position: Position },

    #[error("unknown branch '{name}' at {position}")]
    UnknownBranch { name: String, position: Position },

    #[error("invalid sync region at {position}: {reason}")]
    InvalidRegion { reason: String, position: Position },

    #[error("duplicate {what} '{name}'")]
    DuplicateName { what: &'static str, name: String },

    #[error("plan verification failed: {0}")]
    Verification(Violation),
}

impl SyncError {
    /// Position the error refers to, if it has one.
    pub fn position(&self) -> Option<&Position> {
        match self {
            SyncError::NoLegalPath { position, .. }
            | SyncError::UseBeforeProduce { position, .. }
            | SyncError::EventPoolExhausted { position, .. }
            | SyncError::InvisibleResource { position, .. }
            | SyncError::UnknownResource { position, .. }
            | SyncError::UnknownLoop { position, .. }
            | SyncError::MalformedLoopNest { position, .. }
            | SyncError::UnknownBranch { position, .. }
            | SyncError::InvalidRegion { position, .. } => Some(position),
            SyncError::Verification(v) => Some(&v.position),
            SyncError::InvalidRotationWidth(_) | SyncError::DuplicateName { .. } => None,
        }
    }

    /// Short variant name, used by manifests to name expected failures.
    pub fn name(&self) -> &'static str {
        match self {
            SyncError::NoLegalPath { .. } => "NoLegalPath",
            SyncError::UseBeforeProduce { .. } => "UseBeforeProduce",
            SyncError::EventPoolExhausted { .. } => "EventPoolExhausted",
            SyncError::InvisibleResource { .. } => "InvisibleResource",
            SyncError::InvalidRotationWidth(_) => "InvalidRotationWidth",
            SyncError::UnknownResource { .. } => "UnknownResource",
            SyncError::UnknownLoop { .. } => "UnknownLoop",
            SyncError::MalformedLoopNest { .. } => "MalformedLoopNest",
            SyncError::UnknownBranch { .. } => "UnknownBranch",
            SyncError::InvalidRegion { .. } => "InvalidRegion",
            SyncError::DuplicateName { .. } => "DuplicateName",
            SyncError::Verification(v) => v.kind.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::UseBeforeProduce {
            resource: "a".into(),
            position: Position::op(0),
        };
        assert_eq!(err.to_string(), "resource 'a' read at op #0 before any write");
        assert_eq!(err.name(), "UseBeforeProduce");
        assert_eq!(err.position(), Some(&Position::op(0)));
    }

    #[test]
    fn test_verification_name() {
        let err = SyncError::Verification(Violation {
            kind: ViolationKind::StarvedWait,
            position: Position::op(2),
            lane: Lane::home(ExecutionUnit::Compute),
            detail: "e0".into(),
        });
        assert_eq!(err.name(), "StarvedWait");
        assert!(err.to_string().contains("StarvedWait at op #2 on cube.M"));
    }
}
