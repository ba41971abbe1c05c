pub mod claim;
pub mod reqexp;
pub mod state;

use crate::internal::attrs::{AttrRecord, names};
use crate::internal::capacity::pool::AssetPool;
use crate::internal::common::ids::{ChildIndex, IdDispenser, SlotId, SlotTypeId};
use crate::internal::manager::config::PolicyConfig;
use crate::internal::manager::drain::DrainEpoch;
use crate::internal::slot::claim::{Claim, ClaimLadder, ClaimState};
use crate::internal::slot::state::{Activity, SlotState};
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotFeature {
    Static,
    Partitionable,
    /// Carved at runtime out of a partitionable parent's capacity.
    Dynamic,
}

/// One unit of advertised, claimable machine capacity.
pub struct Slot {
    pub id: SlotId,
    pub type_id: SlotTypeId,
    /// Index within the parent for dynamic slots, reused from the
    /// parent's dispenser.
    pub child_index: Option<ChildIndex>,
    pub name: String,
    pub feature: SlotFeature,
    pub state: SlotState,
    pub activity: Activity,

    /// Original allocation of this slot; never changes while the slot
    /// lives.
    pub total: AssetPool,
    /// Currently available quantities: `total` minus capacity lent to
    /// children and minus granted custom-resource consumption.
    pub free: AssetPool,
    /// Largest observed per-asset usage.
    pub peak: AssetPool,

    pub parent: Option<SlotId>,
    pub children: Vec<SlotId>,
    pub child_dispenser: IdDispenser,

    pub ladder: ClaimLadder,

    /// Terminal state to apply once the running executor exits; while
    /// set, new match/negotiation notifications are ignored.
    pub destination: Option<(SlotState, Activity)>,
    /// Pending slot destruction once the current claim ends.
    pub delete_on_exit: bool,

    pub match_deadline: Option<Instant>,
    pub vacate_deadline: Option<Instant>,
}

impl Slot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SlotId,
        type_id: SlotTypeId,
        name: String,
        feature: SlotFeature,
        capacity: AssetPool,
        parent: Option<SlotId>,
        child_index: Option<ChildIndex>,
        rng: &mut SmallRng,
        now: Instant,
    ) -> Self {
        Slot {
            id,
            type_id,
            child_index,
            name,
            feature,
            state: SlotState::Owner,
            activity: Activity::Idle,
            free: capacity.clone(),
            peak: AssetPool::new(),
            total: capacity,
            parent,
            children: Vec::new(),
            child_dispenser: IdDispenser::new(1),
            ladder: ClaimLadder::new(rng, now),
            destination: None,
            delete_on_exit: false,
            match_deadline: None,
            vacate_deadline: None,
        }
    }

    pub fn change_state(&mut self, state: SlotState, activity: Activity) {
        if self.state == state && self.activity == activity {
            return;
        }
        log::debug!(
            "Slot {}: {}/{} -> {}/{}",
            self.name,
            self.state,
            self.activity,
            state,
            activity
        );
        if state != SlotState::Matched {
            self.match_deadline = None;
        }
        if !matches!(activity, Activity::Vacating | Activity::Killing) {
            self.vacate_deadline = None;
        }
        self.state = state;
        self.activity = activity;
    }

    pub fn current_claim(&self) -> &Claim {
        self.ladder.current()
    }

    pub fn current_claim_mut(&mut self) -> &mut Claim {
        self.ladder.current_mut()
    }

    /// The claim id the slot currently advertises; presenting it is the
    /// capability to negotiate for this slot.
    pub fn advertised_claim_id(&self) -> &str {
        self.ladder.current().id().as_str()
    }

    pub fn has_running_job(&self) -> bool {
        self.ladder.current().executor.is_some()
    }

    /// True once the current claim exists and survives into eviction
    /// only through its retirement/vacate budgets.
    pub fn is_evicting(&self) -> bool {
        matches!(
            self.activity,
            Activity::Retiring | Activity::Vacating | Activity::Killing
        )
    }

    /// Replaces the current claim with a fresh empty one and returns the
    /// previous claim. The caller decides what the slot transitions to.
    pub fn reset_current_claim(&mut self, rng: &mut SmallRng, now: Instant) -> Claim {
        self.ladder.replace_current(Claim::new(rng, now))
    }

    /// Capacity currently in use (lent to children or consumed).
    pub fn used(&self) -> AssetPool {
        let mut used = self.total.clone();
        used.subtract(&self.free);
        used
    }

    pub fn track_peak_usage(&mut self) {
        let used = self.used();
        self.peak.track_peak(&used);
    }

    /// Builds the attribute record this slot advertises. Drain-epoch
    /// attributes are added by the manager on top of this record.
    pub fn build_record(&self, policy: &PolicyConfig, drain: Option<&DrainEpoch>) -> AttrRecord {
        let mut record = AttrRecord::new();
        record.set(names::NAME, self.name.as_str());
        record.set(names::SLOT_ID, self.id.as_num() as i64);
        record.set(names::SLOT_TYPE, self.type_id.as_num() as i64);
        record.set(names::STATE, self.state.to_string());
        record.set(names::ACTIVITY, self.activity.to_string());
        record.set(names::CLAIM_ID, self.advertised_claim_id());
        match self.feature {
            SlotFeature::Partitionable => record.set(names::PARTITIONABLE, true),
            SlotFeature::Dynamic => record.set(names::DYNAMIC, true),
            SlotFeature::Static => {}
        }
        self.free.publish(&mut record);
        record.set_expr(
            names::REQUIREMENTS,
            &reqexp::requirements_expr(policy, drain, self.state),
        );
        record.set_expr(names::RANK, &policy.rank_expr);
        self.ladder.current().publish(&mut record);
        record
    }

    /// A slot is done draining once it neither runs anything nor may
    /// accept new work.
    pub fn drain_settled(&self) -> bool {
        match self.state {
            SlotState::Drained => true,
            SlotState::Owner | SlotState::Unclaimed | SlotState::Matched => true,
            SlotState::Claimed | SlotState::Preempting => {
                !self.has_running_job() && self.ladder.current().state != ClaimState::Suspended
            }
            SlotState::Delete => true,
        }
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("feature", &self.feature)
            .field("state", &self.state)
            .field("activity", &self.activity)
            .finish()
    }
}
