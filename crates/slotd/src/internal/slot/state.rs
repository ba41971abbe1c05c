use serde::{Deserialize, Serialize};

/// Primary state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    /// The machine owner's policy forbids running work.
    Owner,
    /// Advertised and claimable.
    Unclaimed,
    /// A negotiator match arrived; waiting for the claim request.
    Matched,
    /// A negotiated claim holds the slot.
    Claimed,
    /// The current claim is being evicted.
    Preempting,
    /// Draining finished for this slot; no new work accepted.
    Drained,
    /// Queued for destruction (reconfiguration shrink or dynamic-slot
    /// teardown); terminal.
    Delete,
}

/// Activity within `Claimed`/`Preempting` (and `Idle` elsewhere).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activity {
    Idle,
    Busy,
    Suspended,
    /// Job still running inside its retirement window.
    Retiring,
    /// Job asked to exit cleanly within the vacate budget.
    Vacating,
    /// Job being terminated immediately.
    Killing,
}

impl SlotState {
    /// Ordering weight used when reconfiguration shrinks a slot type:
    /// the least valuable slots (lowest weight) are destroyed first.
    pub fn destruction_weight(&self) -> u32 {
        match self {
            SlotState::Delete => 0,
            SlotState::Drained => 1,
            SlotState::Owner => 2,
            SlotState::Unclaimed => 3,
            SlotState::Matched => 4,
            SlotState::Preempting => 5,
            SlotState::Claimed => 6,
        }
    }

    pub fn is_claimed(&self) -> bool {
        matches!(self, SlotState::Claimed | SlotState::Preempting)
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            SlotState::Owner => "Owner",
            SlotState::Unclaimed => "Unclaimed",
            SlotState::Matched => "Matched",
            SlotState::Claimed => "Claimed",
            SlotState::Preempting => "Preempting",
            SlotState::Drained => "Drained",
            SlotState::Delete => "Delete",
        };
        f.write_str(s)
    }
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Activity::Idle => "Idle",
            Activity::Busy => "Busy",
            Activity::Suspended => "Suspended",
            Activity::Retiring => "Retiring",
            Activity::Vacating => "Vacating",
            Activity::Killing => "Killing",
        };
        f.write_str(s)
    }
}
