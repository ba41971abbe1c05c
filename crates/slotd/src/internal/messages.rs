use crate::internal::attrs::AttrRecord;
use crate::internal::slot::claim::ClaimType;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Negotiation request for a slot, referencing the advertised claim id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub claim_id: String,
    pub claim_type: ClaimType,
    pub job: AttrRecord,
    /// Schedule-side request overrides; take precedence over the job's
    /// own `Request*` attributes when a partitionable slot is carved.
    pub overrides: AttrRecord,
    pub scheduler_address: String,
    pub lease_interval: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefusalReason {
    UnknownClaimId,
    ShuttingDown,
    RequirementsNotMet,
    InsufficientRank,
    /// The replacement queue (preempting + pre-preempting) is full.
    ReplacementQueueFull,
    InsufficientAssets,
    InsufficientSpecification,
    CannotPartition,
    InvalidState,
    DuplicateRequest,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum ClaimResponse {
    /// The id of the granted claim; a preemption grant hands back the
    /// waiting replacement claim's fresh id.
    Accepted { claim_id: String },
    /// A partitionable-slot negotiation that also hands back the
    /// parent's remaining capacity as a second, immediately usable
    /// claim.
    AcceptedWithLeftover {
        leftover: AttrRecord,
        claim_id: String,
    },
    Refused(RefusalReason),
    TryAgainLater,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateRequest {
    pub claim_id: String,
    pub starter_selector: String,
    pub job: AttrRecord,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivateResponse {
    Ok,
    RequirementsNotMet,
    NoExecutorAvailable,
    InvalidState,
}

/// Outcome of the simple administrative claim operations
/// (deactivate/release/suspend/continue/match-notify).
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpResponse {
    Ok,
    /// Refused without any state change.
    InvalidState,
    /// A competing transition is in flight; retry later.
    TryAgainLater,
}

// Administrative draining surface.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainSpeed {
    /// Reversible release honoring retirement and vacate budgets.
    Graceful,
    /// Irreversible release honoring the vacate budget only.
    Quick,
    /// Immediate termination.
    Fast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainCompletion {
    /// Stay drained until canceled.
    Nothing,
    /// Cancel the drain once every slot is drained and idle.
    Resume,
    /// Resume and re-run reconfiguration.
    Reconfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainCommand {
    pub speed: DrainSpeed,
    pub reason: String,
    pub on_completion: DrainCompletion,
    /// Must evaluate to boolean true on every slot or nothing drains.
    pub check_expr: Option<String>,
    /// Replaces the slots' start expression for the drain's duration.
    pub start_expr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DrainError {
    #[error("Draining already in progress")]
    AlreadyDraining,
    #[error("Draining check expression failed: {0}")]
    CheckFailed(String),
    #[error("No matching draining request id {0}")]
    NoMatchingRequest(String),
}
