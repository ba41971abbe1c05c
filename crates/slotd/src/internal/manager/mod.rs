pub mod config;
pub mod drain;
pub mod negotiation;

use crate::internal::attrs::AttrRecord;
use crate::internal::capacity::partition::{PartitionError, carve_quantities};
use crate::internal::capacity::pool::AssetPool;
use crate::internal::comm::{AdvertSink, ExitStatus, JobExecutor};
use crate::internal::common::Map;
use crate::internal::common::ids::{ChildIndex, ExecutorHandle, IdDispenser, SlotId, SlotTypeId};
use crate::internal::eval::{Evaluator, eval_advisory_bool, eval_required_bool};
use crate::internal::manager::drain::DrainBook;
use crate::internal::messages::{
    DrainCommand, DrainCompletion, DrainError, DrainSpeed, RefusalReason,
};
use crate::internal::slot::claim::{ClaimState, SuspendedBy};
use crate::internal::slot::state::{Activity, SlotState};
use crate::internal::slot::{Slot, SlotFeature, reqexp};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::time::{Duration, Instant};

/// A slot instance owed to the configuration; allocated once every
/// destruction scheduled by the same reconfiguration has finished.
#[derive(Debug)]
struct PendingSlot {
    type_id: SlotTypeId,
    feature: SlotFeature,
    capacity: AssetPool,
}

fn partition_refusal(e: PartitionError) -> RefusalReason {
    match e {
        PartitionError::InsufficientSpecification(_) => RefusalReason::InsufficientSpecification,
        PartitionError::CannotPartition(_) => RefusalReason::CannotPartition,
    }
}

/// Field-level slot lookup so callers can borrow the slot table and the
/// manager's other fields at the same time.
fn slot_entry(slots: &mut Map<SlotId, Slot>, id: SlotId) -> &mut Slot {
    slots.get_mut(&id).unwrap_or_else(|| {
        log::error!("Unknown slot id {id} in internal operation");
        panic!("unknown slot id {id}")
    })
}

/// Owns the machine's slot collection and drives every lifecycle
/// decision: the periodic evaluate/advertise cycle, negotiation,
/// partitioning, reconfiguration and machine-wide draining.
///
/// All mutation happens on one logical thread; external events (protocol
/// requests, timer ticks, executor-exit callbacks) enter through the
/// public methods and run synchronously to a terminal outcome.
pub struct SlotManager {
    slots: Map<SlotId, Slot>,
    /// Stable iteration/advertisement order of the live slots.
    order: Vec<SlotId>,
    dispenser: IdDispenser,
    config: SlotConfig,
    pub(crate) drain: DrainBook,
    evaluator: Box<dyn Evaluator>,
    adverts: Box<dyn AdvertSink>,
    executor: Box<dyn JobExecutor>,
    executors: Map<ExecutorHandle, SlotId>,
    pending_allocations: Vec<PendingSlot>,
    rng: SmallRng,
    shutting_down: bool,
}

impl SlotManager {
    pub fn new(
        config: SlotConfig,
        evaluator: Box<dyn Evaluator>,
        adverts: Box<dyn AdvertSink>,
        executor: Box<dyn JobExecutor>,
    ) -> crate::Result<Self> {
        let mut mgr = SlotManager {
            slots: Map::new(),
            order: Vec::new(),
            dispenser: IdDispenser::new(1),
            config,
            drain: DrainBook::default(),
            evaluator,
            adverts,
            executor,
            executors: Map::new(),
            pending_allocations: Vec::new(),
            rng: SmallRng::from_os_rng(),
            shutting_down: false,
        };
        mgr.init_slots(Instant::now())?;
        Ok(mgr)
    }

    /// Partitions the machine capacity across the configured slot types
    /// and instantiates one slot per unit.
    fn init_slots(&mut self, now: Instant) -> crate::Result<()> {
        let capacities = self.config.instance_capacities()?;
        for (type_idx, instances) in capacities.into_iter().enumerate() {
            let type_id = SlotTypeId::new(type_idx as u32);
            let partitionable = self.config.slot_types[type_idx].partitionable;
            for capacity in instances {
                self.create_top_slot(type_id, partitionable, capacity, now);
            }
        }
        log::info!(
            "Initialized {} slots on {}",
            self.order.len(),
            self.config.machine_name
        );
        Ok(())
    }

    fn create_top_slot(
        &mut self,
        type_id: SlotTypeId,
        partitionable: bool,
        capacity: AssetPool,
        now: Instant,
    ) -> SlotId {
        let id = SlotId::new(self.dispenser.allocate());
        let name = format!("{}_slot{}", self.config.machine_name, id);
        let feature = if partitionable {
            SlotFeature::Partitionable
        } else {
            SlotFeature::Static
        };
        let slot = Slot::new(id, type_id, name, feature, capacity, None, None, &mut self.rng, now);
        log::debug!("Created slot {} ({:?})", slot.name, slot.feature);
        self.slots.insert(id, slot);
        self.order.push(id);
        id
    }

    // ---- lookups ------------------------------------------------------

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(&id)
    }

    pub fn slot_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        self.slots.get_mut(&id)
    }

    /// Resolving an id the manager itself handed out must succeed;
    /// anything else means the model diverged from its invariants.
    fn expect_slot_mut(&mut self, id: SlotId) -> &mut Slot {
        slot_entry(&mut self.slots, id)
    }

    pub fn slot_ids(&self) -> Vec<SlotId> {
        self.order.clone()
    }

    pub fn num_slots(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn evaluator(&self) -> &dyn Evaluator {
        self.evaluator.as_ref()
    }

    pub(crate) fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    pub fn policy(&self) -> &config::PolicyConfig {
        &self.config.policy
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Builds the full advertised record for a slot, including the
    /// drain-epoch attributes.
    pub fn slot_record(&self, id: SlotId, now: Instant) -> AttrRecord {
        let slot = &self.slots[&id];
        let mut record = slot.build_record(&self.config.policy, self.drain.active());
        self.drain.publish(&mut record, now);
        record
    }

    // ---- walk ---------------------------------------------------------

    /// Applies `op` to a point-in-time snapshot of the slot list; slots
    /// destroyed mid-walk are skipped rather than corrupting iteration.
    pub fn walk<F: FnMut(&mut SlotManager, SlotId)>(&mut self, mut op: F) {
        let snapshot = self.order.clone();
        for id in snapshot {
            if self.slots.contains_key(&id) {
                op(&mut *self, id);
            }
        }
    }

    // ---- reconfiguration ---------------------------------------------

    /// Applies a new slot topology. Shrinking a type destroys its least
    /// valuable instances first (by state, then by the rank of the
    /// current claim); destruction and allocation are two strictly
    /// ordered phases, with allocation deferred until every scheduled
    /// destruction has finished.
    pub fn reconfigure(&mut self, config: SlotConfig, now: Instant) -> crate::Result<()> {
        let capacities = config.instance_capacities()?;
        self.config = config;
        let mut victims: Vec<SlotId> = Vec::new();

        for (type_idx, instances) in capacities.into_iter().enumerate() {
            let type_id = SlotTypeId::new(type_idx as u32);
            let partitionable = self.config.slot_types[type_idx].partitionable;
            let feature = if partitionable {
                SlotFeature::Partitionable
            } else {
                SlotFeature::Static
            };

            let mut existing: Vec<SlotId> = self
                .order
                .iter()
                .copied()
                .filter(|id| {
                    let slot = &self.slots[id];
                    slot.type_id == type_id && slot.parent.is_none() && !slot.delete_on_exit
                })
                .collect();
            let desired = instances.len();

            if existing.len() > desired {
                existing.sort_by(|a, b| {
                    let sa = &self.slots[a];
                    let sb = &self.slots[b];
                    sa.state
                        .destruction_weight()
                        .cmp(&sb.state.destruction_weight())
                        .then(
                            sa.current_claim()
                                .rank
                                .partial_cmp(&sb.current_claim().rank)
                                .unwrap_or(std::cmp::Ordering::Equal),
                        )
                });
                victims.extend(existing.drain(..existing.len() - desired));
            } else {
                for capacity in instances.into_iter().skip(existing.len()) {
                    self.pending_allocations.push(PendingSlot {
                        type_id,
                        feature,
                        capacity,
                    });
                }
            }
        }

        // Types removed entirely from the configuration.
        victims.extend(self.order.iter().copied().filter(|id| {
            let slot = &self.slots[id];
            slot.parent.is_none()
                && slot.type_id.as_num() as usize >= self.config.slot_types.len()
        }));

        // Flag every victim before the first destruction runs: a
        // synchronous destroy re-attempts allocation, which must stay
        // deferred while any later victim still holds its capacity.
        for id in &victims {
            self.expect_slot_mut(*id).delete_on_exit = true;
        }
        for id in victims {
            if self.slots.contains_key(&id) {
                self.begin_destroy(id, now);
            }
        }

        self.try_pending_allocations(now);
        Ok(())
    }

    fn begin_destroy(&mut self, id: SlotId, now: Instant) {
        // Children go first; their capacity returns to the parent before
        // the parent itself is torn down.
        let children = self.expect_slot_mut(id).children.clone();
        for child in children {
            if self.slots.contains_key(&child) {
                self.begin_destroy(child, now);
            }
        }
        let slot = self.expect_slot_mut(id);
        if slot.has_running_job() {
            log::debug!("Slot {} queued for destruction after job exit", slot.name);
            slot.delete_on_exit = true;
            self.begin_eviction(id, false, now);
        } else {
            self.finalize_destroy(id, now);
        }
    }

    /// Completes an asynchronous destruction and re-attempts any
    /// allocation the destruction was blocking.
    fn finalize_destroy(&mut self, id: SlotId, now: Instant) {
        let slot = match self.slots.remove(&id) {
            Some(slot) => slot,
            None => {
                log::error!("Removal of unknown slot {id}");
                panic!("removal of unknown slot {id}");
            }
        };
        self.order.retain(|other| *other != id);
        if let Err(e) = self.adverts.invalidate(&slot.name) {
            log::warn!("Failed to invalidate advertisement of {}: {e}", slot.name);
        }
        match slot.parent {
            Some(parent_id) => {
                // A dynamic slot's capacity returns to its parent.
                if let Some(parent) = self.slots.get_mut(&parent_id) {
                    parent.free.add(&slot.total);
                    parent.children.retain(|c| *c != id);
                    if let Some(index) = slot.child_index {
                        parent.child_dispenser.release(index.as_num());
                    }
                }
            }
            None => self.dispenser.release(id.as_num()),
        }
        log::debug!("Destroyed slot {}", slot.name);
        self.try_pending_allocations(now);
    }

    fn destruction_in_progress(&self) -> bool {
        self.order.iter().any(|id| self.slots[id].delete_on_exit)
    }

    fn try_pending_allocations(&mut self, now: Instant) {
        if self.pending_allocations.is_empty() || self.destruction_in_progress() {
            return;
        }
        for pending in std::mem::take(&mut self.pending_allocations) {
            self.create_top_slot(
                pending.type_id,
                pending.feature == SlotFeature::Partitionable,
                pending.capacity,
                now,
            );
        }
    }

    // ---- partitioning -------------------------------------------------

    /// Carves a dynamic child out of a partitionable parent and moves
    /// the parent's negotiated claim onto it.
    pub(crate) fn carve_child(
        &mut self,
        parent_id: SlotId,
        job: &AttrRecord,
        overrides: &AttrRecord,
        now: Instant,
    ) -> Result<SlotId, RefusalReason> {
        let parent_record = self.slot_record(parent_id, now);
        let parent = &self.slots[&parent_id];
        if parent.feature != SlotFeature::Partitionable {
            return Err(RefusalReason::InvalidState);
        }
        let requirements =
            reqexp::requirements_expr(&self.config.policy, self.drain.active(), parent.state);
        let sized = carve_quantities(
            self.evaluator.as_ref(),
            &parent_record,
            &parent.free,
            job,
            overrides,
            &self.config.policy.modify_request_exprs,
            &requirements,
        )
        .map_err(partition_refusal)?;

        let child_id = SlotId::new(self.dispenser.allocate());
        let parent = slot_entry(&mut self.slots, parent_id);
        let child_index = ChildIndex::new(parent.child_dispenser.allocate());
        let child_name = format!("{}_{}", parent.name, child_index);
        parent.free.subtract(&sized);
        parent.track_peak_usage();
        parent.children.push(child_id);
        let parent_claim = parent.reset_current_claim(&mut self.rng, now);
        parent.change_state(SlotState::Unclaimed, Activity::Idle);
        let type_id = parent.type_id;

        let mut child = Slot::new(
            child_id,
            type_id,
            child_name,
            SlotFeature::Dynamic,
            sized,
            Some(parent_id),
            Some(child_index),
            &mut self.rng,
            now,
        );
        child.ladder.replace_current(parent_claim);
        child.change_state(SlotState::Claimed, Activity::Idle);
        log::debug!("Carved {} out of parent {}", child.name, parent_id);
        self.slots.insert(child_id, child);
        self.order.push(child_id);
        self.assert_capacity_conserved(parent_id);
        Ok(child_id)
    }

    /// Returns all of the children's capacity to the shared parent and
    /// carves one merged child sized by `request`. Fails atomically: no
    /// state is touched unless every precondition holds.
    pub fn coalesce_children(
        &mut self,
        children: &[SlotId],
        job: &AttrRecord,
        overrides: &AttrRecord,
        now: Instant,
    ) -> Result<SlotId, RefusalReason> {
        let mut parent = None;
        if children.is_empty() {
            return Err(RefusalReason::InvalidState);
        }
        for id in children {
            let slot = match self.slots.get(id) {
                Some(slot) => slot,
                None => return Err(RefusalReason::InvalidState),
            };
            let valid = slot.feature == SlotFeature::Dynamic
                && slot.state == SlotState::Claimed
                && slot.activity == Activity::Idle
                && slot.destination.is_none()
                && !slot.delete_on_exit;
            if !valid {
                return Err(RefusalReason::InvalidState);
            }
            match (parent, slot.parent) {
                (None, p) => parent = p,
                (Some(a), Some(b)) if a == b => {}
                _ => return Err(RefusalReason::InvalidState),
            }
        }
        let parent_id = parent.ok_or(RefusalReason::InvalidState)?;

        // Size the merged request against the pooled capacity before
        // touching anything: a refusal must leave every child intact.
        let mut pooled = self.slots[&parent_id].free.clone();
        for id in children {
            pooled.add(&self.slots[id].total);
        }
        let parent_record = self.slot_record(parent_id, now);
        let requirements = reqexp::requirements_expr(
            &self.config.policy,
            self.drain.active(),
            self.slots[&parent_id].state,
        );
        carve_quantities(
            self.evaluator.as_ref(),
            &parent_record,
            &pooled,
            job,
            overrides,
            &self.config.policy.modify_request_exprs,
            &requirements,
        )
        .map_err(partition_refusal)?;

        // The first child's negotiated claim survives onto the merged
        // slot; the rest end with their slots.
        let survivor =
            slot_entry(&mut self.slots, children[0]).reset_current_claim(&mut self.rng, now);
        for id in children {
            self.finalize_destroy(*id, now);
        }
        let child = self.carve_child(parent_id, job, overrides, now)?;
        let slot = self.expect_slot_mut(child);
        slot.ladder.replace_current(survivor);
        slot.current_claim_mut().state = ClaimState::Idle;
        self.assert_capacity_conserved(parent_id);
        Ok(child)
    }

    /// Capacity conservation: `parent.free + Σ children.total` must
    /// equal the parent's original allocation at all times.
    fn assert_capacity_conserved(&self, parent_id: SlotId) {
        let parent = &self.slots[&parent_id];
        let mut sum = parent.free.clone();
        for child in &parent.children {
            sum.add(&self.slots[child].total);
        }
        if sum != parent.total {
            log::error!(
                "Capacity conservation violated on {}: {sum:?} != {:?}",
                parent.name,
                parent.total
            );
            panic!("capacity conservation violated on {}", parent.name);
        }
    }

    // ---- eviction machinery ------------------------------------------

    /// Moves the current claim into eviction. Graceful eviction honors
    /// the retirement window first; non-graceful goes straight to the
    /// vacate phase.
    pub(crate) fn begin_eviction(&mut self, id: SlotId, reversible: bool, now: Instant) {
        let machine_retirement = self.effective_retirement(id, now);
        let machine_vacate = self.config.policy.max_vacate;
        let slot = self.expect_slot_mut(id);
        let claim = slot.ladder.current();
        if !claim.is_populated() {
            return;
        }
        if !slot.has_running_job() {
            // Nothing to wait for; the claim ends immediately.
            self.end_current_claim(id, now);
            return;
        }
        if !reversible {
            slot.current_claim_mut().release_requested = true;
        }
        let remaining = machine_retirement;
        let vacate = slot.ladder.current().vacate_budget(machine_vacate);
        if remaining <= vacate {
            self.begin_vacate(id, now);
        } else {
            slot.change_state(SlotState::Preempting, Activity::Retiring);
        }
    }

    fn begin_vacate(&mut self, id: SlotId, now: Instant) {
        let machine_vacate = self.config.policy.max_vacate;
        let slot = self.expect_slot_mut(id);
        let claim = slot.ladder.current_mut();
        claim.state = ClaimState::Vacating;
        let budget = claim.vacate_budget(machine_vacate);
        let handle = claim.executor;
        slot.change_state(SlotState::Preempting, Activity::Vacating);
        slot.vacate_deadline = Some(now + budget);
        if let Some(handle) = handle {
            self.executor.stop(handle, true);
        }
    }

    fn begin_kill(&mut self, id: SlotId) {
        let slot = self.expect_slot_mut(id);
        let claim = slot.ladder.current_mut();
        claim.state = ClaimState::Killing;
        claim.release_requested = true;
        let handle = claim.executor;
        slot.change_state(SlotState::Preempting, Activity::Killing);
        if let Some(handle) = handle {
            self.executor.stop(handle, false);
        }
    }

    /// Hard-stops a job whose vacate budget ran out. The slot keeps its
    /// state (eviction stays `Preempting`, a requester-side deactivate
    /// stays `Claimed`); only the activity escalates.
    pub(crate) fn escalate_to_kill(&mut self, id: SlotId) {
        let slot = self.expect_slot_mut(id);
        let claim = slot.ladder.current_mut();
        claim.state = ClaimState::Killing;
        let handle = claim.executor;
        let state = slot.state;
        slot.change_state(state, Activity::Killing);
        if let Some(handle) = handle {
            self.executor.stop(handle, false);
        }
    }

    /// Retirement budget that applies to a slot's current claim right
    /// now. While a graceful drain is active the machine-wide
    /// synchronized remaining time substitutes for the per-claim value,
    /// so co-draining slots finish together; in the drain's final phase
    /// it is forced to zero.
    fn effective_retirement(&self, id: SlotId, now: Instant) -> Duration {
        match self.drain.active() {
            Some(epoch) if epoch.final_phase => Duration::ZERO,
            Some(epoch) if epoch.is_graceful() => {
                let slot = &self.slots[&id];
                if slot.current_claim().accepted_while_draining {
                    Duration::ZERO
                } else {
                    self.graceful_drain_remaining(now)
                }
            }
            Some(_) => Duration::ZERO,
            None => {
                let slot = &self.slots[&id];
                slot.current_claim()
                    .retirement_remaining(self.config.policy.max_retirement, now)
            }
        }
    }

    /// Ends the current claim on a slot: challengers get their chance,
    /// dynamic slots evaporate, everything else falls back to the
    /// owner-policy state.
    pub(crate) fn end_current_claim(&mut self, id: SlotId, now: Instant) {
        let (delete_on_exit, feature) = {
            let slot = slot_entry(&mut self.slots, id);
            let old = slot.reset_current_claim(&mut self.rng, now);
            if let Some(consumed) = &old.consumed {
                // The grant's consumption goes back into the pool.
                slot.free.add(consumed);
            }
            log::debug!(
                "Claim of {} ended (user: {:?})",
                slot.name,
                old.client.as_ref().map(|c| c.user.as_str())
            );
            (slot.delete_on_exit, slot.feature)
        };

        if delete_on_exit {
            self.finalize_destroy(id, now);
            return;
        }

        if let Some(promoted) = self.try_promote_challenger(id, now) {
            log::debug!("Promoted preempting claim on slot {id} (rank {promoted})");
            return;
        }

        if feature == SlotFeature::Dynamic {
            // Last claim on a dynamic slot ended and nobody asked to
            // keep it: return the capacity to the parent.
            self.finalize_destroy(id, now);
            return;
        }
        if self.drain_settling() {
            self.expect_slot_mut(id)
                .change_state(SlotState::Drained, Activity::Idle);
        } else {
            self.expect_slot_mut(id)
                .change_state(SlotState::Owner, Activity::Idle);
            self.apply_owner_policy(id, now);
        }
    }

    /// Promotes the waiting replacement claim if one exists and is still
    /// eligible: its negotiation has not been superseded and the slot's
    /// requirement policy still permits its job. Returns its rank.
    fn try_promote_challenger(&mut self, id: SlotId, now: Instant) -> Option<f64> {
        let slot = self.slots.get(&id)?;
        if !slot.ladder.has_challenger() {
            return None;
        }
        let record = self.slot_record(id, now);
        let requirements =
            reqexp::requirements_expr(&self.config.policy, self.drain.active(), slot.state);
        let slot = self.expect_slot_mut(id);
        let challenger = slot.ladder.take_best_challenger()?;
        let eligible = match &challenger.job {
            Some(job) => eval_required_bool(
                self.evaluator.as_ref(),
                &requirements,
                &record,
                Some(job),
            ),
            None => true,
        };
        if !eligible {
            log::debug!("Replacement claim on slot {id} no longer eligible; discarded");
            return None;
        }
        let rank = challenger.rank;
        let slot = self.expect_slot_mut(id);
        slot.ladder.replace_current(challenger);
        slot.current_claim_mut().state = ClaimState::Idle;
        slot.change_state(SlotState::Claimed, Activity::Idle);
        Some(rank)
    }

    fn apply_owner_policy(&mut self, id: SlotId, now: Instant) {
        let Some(owner_expr) = self.config.policy.owner_expr.clone() else {
            let slot = self.expect_slot_mut(id);
            if slot.state == SlotState::Owner {
                slot.change_state(SlotState::Unclaimed, Activity::Idle);
            }
            return;
        };
        let record = self.slot_record(id, now);
        let owner = eval_advisory_bool(self.evaluator.as_ref(), &owner_expr, &record, None, false);
        let slot = self.expect_slot_mut(id);
        match (slot.state, owner) {
            (SlotState::Owner, false) => slot.change_state(SlotState::Unclaimed, Activity::Idle),
            (SlotState::Unclaimed, true) => slot.change_state(SlotState::Owner, Activity::Idle),
            _ => {}
        }
    }

    // ---- executor callbacks ------------------------------------------

    /// Executor-exit notification; maps the handle back to the owning
    /// claim and resolves the slot's pending transition.
    pub fn executor_exited(&mut self, handle: ExecutorHandle, status: ExitStatus, now: Instant) {
        let Some(id) = self.executors.remove(&handle) else {
            log::warn!("Exit of unknown executor {handle}");
            return;
        };
        log::debug!("Executor {handle} exited ({status:?}) on slot {id}");
        let (destination, state, delete_on_exit) = {
            let slot = slot_entry(&mut self.slots, id);
            let claim = slot.ladder.current_mut();
            claim.executor = None;
            claim.job_start = None;
            (slot.destination.take(), slot.state, slot.delete_on_exit)
        };

        if let Some((state, activity)) = destination {
            let slot = self.expect_slot_mut(id);
            slot.current_claim_mut().state = ClaimState::Idle;
            slot.change_state(state, activity);
            if delete_on_exit {
                self.finalize_destroy(id, now);
            }
        } else if state == SlotState::Preempting {
            self.end_current_claim(id, now);
        } else {
            // Normal completion: the claim stays negotiated and idle.
            let slot = self.expect_slot_mut(id);
            slot.current_claim_mut().state = ClaimState::Idle;
            if slot.state == SlotState::Claimed {
                slot.change_state(SlotState::Claimed, Activity::Idle);
            }
            if delete_on_exit {
                self.finalize_destroy(id, now);
            }
        }
        self.check_for_drain_completion(now);
    }

    pub(crate) fn register_executor(&mut self, handle: ExecutorHandle, id: SlotId) {
        self.executors.insert(handle, id);
    }

    pub(crate) fn spawn_job(
        &mut self,
        job: &AttrRecord,
        record: &AttrRecord,
    ) -> crate::Result<ExecutorHandle> {
        self.executor.spawn(job, record)
    }

    pub(crate) fn executor_op(&mut self, f: impl FnOnce(&mut dyn JobExecutor)) {
        f(self.executor.as_mut())
    }

    // ---- periodic cycle ----------------------------------------------

    /// Two-phase refresh: phase 1 evaluates every slot's policy and
    /// applies resulting transitions (which may destroy slots); phase 2
    /// rebuilds and publishes the advertisements of the survivors. The
    /// phases are never merged.
    pub fn evaluate_and_advertise(&mut self, now: Instant) {
        self.walk(|mgr, id| mgr.evaluate_slot(id, now));
        self.check_for_drain_completion(now);
        self.consider_resuming_after_draining(now);

        self.walk(|mgr, id| {
            let record = mgr.slot_record(id, now);
            if let Err(e) = mgr.adverts.publish(&record) {
                log::warn!("Failed to publish advertisement of slot {id}: {e}");
            }
        });
    }

    fn evaluate_slot(&mut self, id: SlotId, now: Instant) {
        let slot = &self.slots[&id];
        if slot.state == SlotState::Delete {
            return;
        }

        // Draining: settle slots with nothing left to do.
        if self.drain_settling() && !slot.state.is_claimed() && slot.state != SlotState::Drained {
            let slot = self.expect_slot_mut(id);
            slot.change_state(SlotState::Drained, Activity::Idle);
            return;
        }

        match (slot.state, slot.activity) {
            (SlotState::Owner | SlotState::Unclaimed, _) => self.apply_owner_policy(id, now),
            (SlotState::Claimed, Activity::Busy) => {
                if self.preempt_wanted(id, now) {
                    log::info!("Preempt policy fired on slot {id}");
                    self.begin_eviction(id, true, now);
                } else if self.suspend_wanted(id, now) {
                    log::info!("Suspend policy fired on slot {id}");
                    self.policy_suspend(id);
                }
            }
            (SlotState::Claimed, Activity::Suspended) => {
                let slot = &self.slots[&id];
                if slot.current_claim().suspended_by == Some(SuspendedBy::Policy)
                    && !self.suspend_wanted(id, now)
                {
                    log::info!("Suspend policy cleared on slot {id}; resuming");
                    self.policy_resume(id);
                }
            }
            (SlotState::Preempting, Activity::Retiring) => {
                self.update_retirement(id, now, true);
            }
            _ => {}
        }

        // A dynamic slot whose claim is gone has no reason to live.
        if let Some(slot) = self.slots.get(&id)
            && slot.feature == SlotFeature::Dynamic
            && !slot.current_claim().is_populated()
            && !slot.ladder.has_challenger()
        {
            self.finalize_destroy(id, now);
        }
    }

    /// While retiring: start the vacate phase early enough that the full
    /// vacate budget still fits into the retirement window, or (during a
    /// policy evaluation) fall back to `Claimed/Busy` when the
    /// preemption reason disappeared.
    fn update_retirement(&mut self, id: SlotId, now: Instant, allow_unretire: bool) {
        let slot = &self.slots[&id];
        let claim = slot.current_claim();
        let may_unretire = allow_unretire
            && !claim.release_requested
            && !slot.ladder.has_challenger()
            && self.drain.active().is_none()
            && !self.preempt_wanted(id, now);
        if may_unretire {
            let slot = self.expect_slot_mut(id);
            log::debug!("Slot {id} un-retires; preemption reason disappeared");
            slot.current_claim_mut().state = ClaimState::Running;
            slot.change_state(SlotState::Claimed, Activity::Busy);
            return;
        }
        let vacate = self.slots[&id]
            .current_claim()
            .vacate_budget(self.config.policy.max_vacate);
        let remaining = self.effective_retirement(id, now);
        if remaining <= vacate {
            self.begin_vacate(id, now);
        }
    }

    fn preempt_wanted(&self, id: SlotId, now: Instant) -> bool {
        let Some(preempt_expr) = &self.config.policy.preempt_expr else {
            return false;
        };
        let record = self.slot_record(id, now);
        let job = self.slots[&id].current_claim().job.as_ref();
        eval_advisory_bool(self.evaluator.as_ref(), preempt_expr, &record, job, false)
    }

    fn suspend_wanted(&self, id: SlotId, now: Instant) -> bool {
        let Some(suspend_expr) = &self.config.policy.suspend_expr else {
            return false;
        };
        let record = self.slot_record(id, now);
        let job = self.slots[&id].current_claim().job.as_ref();
        eval_advisory_bool(self.evaluator.as_ref(), suspend_expr, &record, job, false)
    }

    /// Suspends the running job on policy's behalf; only policy (not the
    /// requester) may continue it.
    fn policy_suspend(&mut self, id: SlotId) {
        let slot = self.expect_slot_mut(id);
        let claim = slot.current_claim_mut();
        claim.state = ClaimState::Suspended;
        claim.suspended_by = Some(SuspendedBy::Policy);
        let handle = claim.executor;
        slot.change_state(SlotState::Claimed, Activity::Suspended);
        if let Some(handle) = handle {
            self.executor.suspend(handle);
        }
    }

    fn policy_resume(&mut self, id: SlotId) {
        let slot = self.expect_slot_mut(id);
        let claim = slot.current_claim_mut();
        claim.state = ClaimState::Running;
        claim.suspended_by = None;
        let handle = claim.executor;
        slot.change_state(SlotState::Claimed, Activity::Busy);
        if let Some(handle) = handle {
            self.executor.resume(handle);
        }
    }

    /// Timer tick: match-timer expiry, lease enforcement and
    /// vacate-deadline escalation. Deadlines are plain fields re-read on
    /// every relevant state change, so a stale timer can never act.
    pub fn tick(&mut self, now: Instant) {
        self.walk(|mgr, id| {
            let slot = &mgr.slots[&id];

            if slot.state == SlotState::Matched
                && let Some(deadline) = slot.match_deadline
                && now >= deadline
            {
                log::debug!("Match timer expired on slot {id}");
                let slot = mgr.expect_slot_mut(id);
                slot.change_state(SlotState::Owner, Activity::Idle);
                mgr.apply_owner_policy(id, now);
                return;
            }

            if slot.activity == Activity::Vacating
                && let Some(deadline) = slot.vacate_deadline
                && now >= deadline
            {
                log::debug!("Vacate budget exhausted on slot {id}; killing");
                mgr.escalate_to_kill(id);
                return;
            }

            if slot.activity == Activity::Retiring {
                mgr.update_retirement(id, now, false);
                return;
            }

            if slot.current_claim().lease_expired(now) {
                log::info!("Claim lease expired on slot {id}; releasing");
                if mgr.slots[&id].has_running_job() {
                    mgr.begin_eviction(id, false, now);
                } else {
                    mgr.end_current_claim(id, now);
                }
            }
        });
    }

    /// Earliest instant at which `tick` has something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |deadline: Option<Instant>| {
            if let Some(d) = deadline {
                next = Some(next.map_or(d, |n| n.min(d)));
            }
        };
        for id in &self.order {
            let slot = &self.slots[id];
            consider(slot.match_deadline);
            consider(slot.vacate_deadline);
            let claim = slot.current_claim();
            if slot.activity == Activity::Retiring {
                consider(claim.retirement_deadline(
                    self.config.policy.max_retirement,
                    self.config.policy.max_vacate,
                ));
            }
            if claim.is_populated()
                && let Some(interval) = claim.lease_interval
            {
                consider(Some(claim.last_alive + interval));
            }
        }
        next
    }

    // ---- draining -----------------------------------------------------

    /// Starts a machine-wide drain epoch. All-or-nothing: if the check
    /// expression is false, non-boolean or unevaluable on any single
    /// slot, nothing is mutated.
    pub fn start_draining(&mut self, cmd: DrainCommand, now: Instant) -> Result<String, DrainError> {
        if self.drain.active().is_some() {
            return Err(DrainError::AlreadyDraining);
        }

        if let Some(check_expr) = &cmd.check_expr {
            for id in &self.order {
                let record = self.slot_record(*id, now);
                let slot = &self.slots[id];
                match self.evaluator.evaluate(check_expr, &record, None) {
                    Ok(value) => match value.as_bool() {
                        Some(true) => {}
                        Some(false) => {
                            return Err(DrainError::CheckFailed(format!(
                                "check expression is false on {}",
                                slot.name
                            )));
                        }
                        None => {
                            return Err(DrainError::CheckFailed(format!(
                                "check expression is not boolean on {}",
                                slot.name
                            )));
                        }
                    },
                    Err(e) => {
                        return Err(DrainError::CheckFailed(format!(
                            "check expression failed on {}: {e}",
                            slot.name
                        )));
                    }
                }
            }
        }

        let epoch = self.drain.begin(
            cmd.speed,
            cmd.reason.clone(),
            cmd.on_completion,
            cmd.start_expr.clone(),
            now,
        );
        let request_id = epoch.request_id();
        log::info!(
            "Draining started (request {request_id}, {:?}): {}",
            cmd.speed,
            cmd.reason
        );

        self.walk(|mgr, id| {
            let slot = &mgr.slots[&id];
            if slot.current_claim().is_populated() {
                match cmd.speed {
                    DrainSpeed::Graceful => mgr.begin_eviction(id, true, now),
                    DrainSpeed::Quick => mgr.begin_eviction(id, false, now),
                    DrainSpeed::Fast => {
                        if mgr.slots[&id].has_running_job() {
                            mgr.begin_kill(id);
                        } else {
                            mgr.end_current_claim(id, now);
                        }
                    }
                }
            } else if mgr.drain_settling()
                && let Some(slot) = mgr.slots.get_mut(&id)
                && slot.state != SlotState::Drained
            {
                slot.change_state(SlotState::Drained, Activity::Idle);
            }
        });
        Ok(request_id)
    }

    /// Clears drain state and restores every slot's normal advertised
    /// requirement expression. An empty request id cancels whatever is
    /// active (a no-op when nothing is).
    pub fn cancel_draining(&mut self, request_id: &str, now: Instant) -> Result<(), DrainError> {
        if !self.drain.matches(request_id) {
            return Err(DrainError::NoMatchingRequest(request_id.to_string()));
        }
        if self.drain.end(now).is_none() {
            return Ok(());
        }
        log::info!("Draining canceled");
        self.walk(|mgr, id| {
            let slot = mgr.expect_slot_mut(id);
            match (slot.state, slot.activity) {
                (SlotState::Drained, _) => {
                    slot.change_state(SlotState::Owner, Activity::Idle);
                    mgr.apply_owner_policy(id, now);
                }
                (SlotState::Preempting, Activity::Retiring) => mgr.update_retirement(id, now, true),
                _ => {}
            }
        });
        Ok(())
    }

    /// Once every pre-drain claim has ended, invalidates all outstanding
    /// claim ids (stale negotiated claims must not activate), forces the
    /// retirement budget to zero and re-applies the reversible release
    /// so the remaining slots finish without further negotiation.
    pub fn check_for_drain_completion(&mut self, now: Instant) {
        let Some(epoch) = self.drain.active() else {
            return;
        };
        if epoch.final_phase || self.order.is_empty() {
            return;
        }
        let all_pre_drain_done = self.order.iter().all(|id| {
            let slot = &self.slots[id];
            let claim = slot.current_claim();
            !claim.is_populated()
                || claim.accepted_while_draining
                || slot.feature == SlotFeature::Partitionable
        });
        if !all_pre_drain_done {
            return;
        }
        log::info!("Initiating final draining (all pre-drain claims ended)");
        if let Some(epoch) = self.drain.active_mut() {
            epoch.final_phase = true;
        }
        self.walk(|mgr, id| {
            {
                let slot = slot_entry(&mut mgr.slots, id);
                slot.ladder.discard_challengers();
                slot.ladder.current_mut().invalidate_id(&mut mgr.rng);
            }
            if mgr.slots[&id].current_claim().is_populated() {
                mgr.begin_eviction(id, true, now);
            }
        });
    }

    /// Longest remaining retirement time over the claims that predate
    /// the drain; the machine-wide eviction deadline all slots
    /// synchronize on.
    pub fn graceful_drain_remaining(&self, now: Instant) -> Duration {
        let Some(epoch) = self.drain.active() else {
            return Duration::ZERO;
        };
        if !epoch.is_graceful() || epoch.final_phase {
            return Duration::ZERO;
        }
        self.order
            .iter()
            .filter_map(|id| {
                let claim = self.slots[id].current_claim();
                if claim.accepted_while_draining {
                    None
                } else {
                    Some(claim.retirement_remaining(self.config.policy.max_retirement, now))
                }
            })
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn consider_resuming_after_draining(&mut self, now: Instant) {
        let Some(epoch) = self.drain.active() else {
            return;
        };
        if epoch.on_completion == DrainCompletion::Nothing {
            return;
        }
        let drained = self
            .order
            .iter()
            .all(|id| self.slots[id].state == SlotState::Drained);
        if !drained {
            return;
        }
        let on_completion = epoch.on_completion;
        log::info!("Draining complete; resuming normal operation");
        if self.cancel_draining("", now).is_err() {
            log::error!("Failed to cancel completed drain");
            panic!("failed to cancel completed drain");
        }
        if on_completion == DrainCompletion::Reconfig {
            let config = self.config.clone();
            if let Err(e) = self.reconfigure(config, now) {
                log::warn!("Post-drain reconfiguration failed: {e}");
            }
        }
    }

    // ---- shutdown -----------------------------------------------------

    /// Best-effort teardown: refuse new negotiation, kill all executors.
    pub fn shutdown(&mut self) {
        self.shutting_down = true;
        self.executor.kill_all();
    }
}

impl SlotManager {
    /// Point-in-time view used by negotiation to re-check a request.
    pub(crate) fn requirements_for(&self, id: SlotId) -> String {
        let slot = &self.slots[&id];
        reqexp::requirements_expr(&self.config.policy, self.drain.active(), slot.state)
    }

    pub(crate) fn draining(&self) -> bool {
        self.drain.active().is_some()
    }

    /// True while idle slots must settle into `Drained` instead of
    /// waiting for new work: the drain request either permits no new
    /// starts at all, or it has entered its final phase.
    fn drain_settling(&self) -> bool {
        match self.drain.active() {
            Some(epoch) => epoch.final_phase || epoch.start_expr.is_none(),
            None => false,
        }
    }
}

pub use config::{PolicyConfig, SlotConfig};
