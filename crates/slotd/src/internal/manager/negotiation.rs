//! Claim-side protocol operations: negotiation, activation and the
//! administrative claim verbs. Every operation re-validates against the
//! slot's live state; information from an earlier match never grants
//! anything by itself.

use crate::internal::attrs::{AttrRecord, AttrValue, names};
use crate::internal::capacity::consumption::{
    compute_consumption, deduct_assets, sufficient_assets,
};
use crate::internal::comm::JobExecutor;
use crate::internal::common::ids::SlotId;
use crate::internal::eval::{eval_advisory_bool, eval_advisory_f64};
use crate::internal::manager::SlotManager;
use crate::internal::messages::{
    ActivateRequest, ActivateResponse, ClaimRequest, ClaimResponse, OpResponse, RefusalReason,
};
use crate::internal::slot::SlotFeature;
use crate::internal::slot::claim::{Claim, ClaimState, ClientIdentity, LADDER_DEPTH, SuspendedBy};
use crate::internal::slot::state::{Activity, SlotState};
use std::time::Instant;

impl SlotManager {
    /// Handles a negotiation request for a slot. The presented claim id
    /// is the capability: it must match the slot's advertised id, and
    /// both the requirement policy and the machine rank are re-evaluated
    /// against the live slot record before anything is granted.
    pub fn request_claim(
        &mut self,
        id: SlotId,
        req: &ClaimRequest,
        now: Instant,
    ) -> ClaimResponse {
        if self.is_shutting_down() {
            return ClaimResponse::Refused(RefusalReason::ShuttingDown);
        }
        let Some(slot) = self.slot(id) else {
            return ClaimResponse::Refused(RefusalReason::UnknownClaimId);
        };
        if slot.destination.is_some() || slot.delete_on_exit {
            return ClaimResponse::TryAgainLater;
        }
        match slot.ladder.find(&req.claim_id) {
            Some(0) => {}
            // The id already belongs to a waiting replacement claim:
            // the same negotiation arrived twice.
            Some(_) => return ClaimResponse::Refused(RefusalReason::DuplicateRequest),
            None => return ClaimResponse::Refused(RefusalReason::UnknownClaimId),
        }

        let record = self.slot_record(id, now);
        let requirements = self.requirements_for(id);
        if !eval_advisory_bool(self.evaluator(), &requirements, &record, Some(&req.job), false) {
            return ClaimResponse::Refused(RefusalReason::RequirementsNotMet);
        }
        let rank = eval_advisory_f64(
            self.evaluator(),
            &self.policy().rank_expr,
            &record,
            Some(&req.job),
            0.0,
        );

        let slot = &self.slots[&id];
        match slot.state {
            SlotState::Owner | SlotState::Unclaimed | SlotState::Matched => {
                if slot.feature == SlotFeature::Partitionable {
                    self.grant_carved(id, req, rank, now)
                } else {
                    self.grant_in_place(id, req, rank, &record, now)
                }
            }
            SlotState::Claimed | SlotState::Preempting => {
                self.admit_preempting(id, req, rank, now)
            }
            SlotState::Drained | SlotState::Delete => {
                ClaimResponse::Refused(RefusalReason::InvalidState)
            }
        }
    }

    /// Grants a claim on a static (or dynamic) slot in place.
    fn grant_in_place(
        &mut self,
        id: SlotId,
        req: &ClaimRequest,
        rank: f64,
        record: &AttrRecord,
        now: Instant,
    ) -> ClaimResponse {
        let mut granted = None;
        if !self.policy().consumption_exprs.is_empty() {
            let slot = &self.slots[&id];
            let consumption = compute_consumption(
                self.evaluator(),
                &req.job,
                record,
                &slot.free,
                &self.policy().consumption_exprs,
            );
            if !sufficient_assets(&slot.free, &consumption) {
                return ClaimResponse::Refused(RefusalReason::InsufficientAssets);
            }
            let weight_expr = self.policy().weight_expr.clone();
            let slot = self.slot_mut(id).unwrap();
            let mut free = std::mem::take(&mut slot.free);
            let cost = deduct_assets(
                self.evaluator(),
                &mut free,
                record,
                weight_expr.as_deref(),
                &consumption,
                false,
            );
            let slot = self.slot_mut(id).unwrap();
            slot.free = free;
            slot.track_peak_usage();
            granted = Some(consumption.as_pool());
            log::debug!("Granted consumption on slot {id} at cost {cost}");
        }

        let mut claim = self.populate_claim(req, rank, now);
        claim.consumed = granted;
        let claim_id = claim.id().as_str().to_string();
        let slot = self.slot_mut(id).unwrap();
        slot.ladder.replace_current(claim);
        slot.change_state(SlotState::Claimed, Activity::Idle);
        log::info!("Slot {id} claimed by {}", req.scheduler_address);
        ClaimResponse::Accepted { claim_id }
    }

    /// Grants a claim on a partitionable slot by carving a dynamic child
    /// sized for the request; the parent re-advertises its leftover
    /// under a fresh claim id.
    fn grant_carved(&mut self, id: SlotId, req: &ClaimRequest, rank: f64, now: Instant) -> ClaimResponse {
        let child_id = match self.carve_child(id, &req.job, &req.overrides, now) {
            Ok(child_id) => child_id,
            Err(reason) => return ClaimResponse::Refused(reason),
        };
        let claim = self.populate_claim(req, rank, now);
        let claim_id = claim.id().as_str().to_string();
        let child = self.slot_mut(child_id).unwrap();
        child.ladder.replace_current(claim);
        child.change_state(SlotState::Claimed, Activity::Idle);
        log::info!(
            "Carved slot {child_id} out of {id} for {}",
            req.scheduler_address
        );
        ClaimResponse::AcceptedWithLeftover {
            leftover: self.slot_record(id, now),
            claim_id,
        }
    }

    /// Admits a preempting request against an already claimed slot. The
    /// request must outrank the current claim, and the replacement queue
    /// holds at most two waiting claims.
    fn admit_preempting(
        &mut self,
        id: SlotId,
        req: &ClaimRequest,
        rank: f64,
        now: Instant,
    ) -> ClaimResponse {
        let slot = &self.slots[&id];
        if rank < slot.current_claim().rank {
            return ClaimResponse::Refused(RefusalReason::InsufficientRank);
        }
        if slot.ladder.depth() == LADDER_DEPTH {
            return ClaimResponse::Refused(RefusalReason::ReplacementQueueFull);
        }
        let challenger = self.populate_claim(req, rank, now);
        let claim_id = challenger.id().as_str().to_string();
        let slot = self.slot_mut(id).unwrap();
        match slot.ladder.admit_challenger(challenger) {
            Ok(rung) => {
                log::info!("Preempting claim admitted on slot {id} (rung {rung}, rank {rank})");
                if !self.slots[&id].is_evicting() {
                    self.begin_eviction(id, true, now);
                }
                ClaimResponse::Accepted { claim_id }
            }
            Err(_) => ClaimResponse::Refused(RefusalReason::InsufficientRank),
        }
    }

    fn populate_claim(&mut self, req: &ClaimRequest, rank: f64, now: Instant) -> Claim {
        let accepted_while_draining = self.draining();
        let mut claim = Claim::new(self.rng(), now);
        claim.claim_type = req.claim_type;
        claim.state = ClaimState::Idle;
        claim.client = Some(ClientIdentity {
            user: req
                .job
                .get_str(names::USER)
                .unwrap_or("unknown")
                .to_string(),
            host: req.scheduler_address.clone(),
        });
        claim.job = Some(req.job.clone());
        claim.scheduler_address = Some(req.scheduler_address.clone());
        claim.rank = rank;
        claim.lease_interval = req.lease_interval;
        claim.last_alive = now;
        claim.retire_peacefully = matches!(
            req.job.get(names::RETIRE_PEACEFULLY),
            Some(AttrValue::Bool(true))
        );
        claim.accepted_while_draining = accepted_while_draining;
        claim
    }

    /// Starts the job carried by `req` under the slot's current claim.
    pub fn activate_claim(
        &mut self,
        id: SlotId,
        req: &ActivateRequest,
        now: Instant,
    ) -> ActivateResponse {
        let Some(slot) = self.slot(id) else {
            return ActivateResponse::InvalidState;
        };
        let claim = slot.current_claim();
        if !claim.id().matches(&req.claim_id) || !claim.is_populated() {
            return ActivateResponse::InvalidState;
        }
        if slot.state != SlotState::Claimed || claim.state != ClaimState::Idle {
            return ActivateResponse::InvalidState;
        }

        let record = self.slot_record(id, now);
        let requirements = self.requirements_for(id);
        if !eval_advisory_bool(self.evaluator(), &requirements, &record, Some(&req.job), false) {
            return ActivateResponse::RequirementsNotMet;
        }
        if !req.starter_selector.is_empty()
            && !eval_advisory_bool(
                self.evaluator(),
                &req.starter_selector,
                &record,
                Some(&req.job),
                false,
            )
        {
            return ActivateResponse::NoExecutorAvailable;
        }

        let handle = match self.spawn_job(&req.job, &record) {
            Ok(handle) => handle,
            Err(e) => {
                log::warn!("Failed to spawn executor on slot {id}: {e}");
                return ActivateResponse::NoExecutorAvailable;
            }
        };
        self.register_executor(handle, id);
        let slot = self.slot_mut(id).unwrap();
        let claim = slot.current_claim_mut();
        claim.job = Some(req.job.clone());
        claim.job_start = Some(now);
        claim.executor = Some(handle);
        claim.state = ClaimState::Running;
        claim.last_alive = now;
        claim.retire_peacefully = matches!(
            req.job.get(names::RETIRE_PEACEFULLY),
            Some(AttrValue::Bool(true))
        );
        slot.change_state(SlotState::Claimed, Activity::Busy);
        log::info!("Activated claim on slot {id}");
        ActivateResponse::Ok
    }

    /// Stops the running job but keeps the claim negotiated; the slot
    /// transitions back to `Claimed/Idle` once the executor exits.
    pub fn deactivate_claim(
        &mut self,
        id: SlotId,
        claim_id: &str,
        graceful: bool,
        now: Instant,
    ) -> OpResponse {
        let Some(slot) = self.slot(id) else {
            return OpResponse::InvalidState;
        };
        if !slot.current_claim().id().matches(claim_id) || !slot.current_claim().is_populated() {
            return OpResponse::InvalidState;
        }
        if slot.destination.is_some() {
            return OpResponse::TryAgainLater;
        }
        if !slot.has_running_job() {
            return OpResponse::Ok;
        }

        let vacate = slot
            .current_claim()
            .vacate_budget(self.policy().max_vacate);
        let slot = self.slot_mut(id).unwrap();
        slot.destination = Some((SlotState::Claimed, Activity::Idle));
        let claim = slot.current_claim_mut();
        let handle = claim.executor;
        if graceful {
            claim.state = ClaimState::Vacating;
            slot.change_state(SlotState::Claimed, Activity::Vacating);
            slot.vacate_deadline = Some(now + vacate);
            if let Some(handle) = handle {
                self.executor_op(|ex: &mut dyn JobExecutor| ex.stop(handle, true));
            }
        } else {
            claim.state = ClaimState::Killing;
            slot.change_state(SlotState::Claimed, Activity::Killing);
            if let Some(handle) = handle {
                self.executor_op(|ex: &mut dyn JobExecutor| ex.stop(handle, false));
            }
        }
        OpResponse::Ok
    }

    /// Gives the claim up entirely. A running job is first evicted
    /// (irreversibly, honoring its budgets); an idle claim ends at once.
    pub fn release_claim(&mut self, id: SlotId, claim_id: &str, now: Instant) -> OpResponse {
        let Some(slot) = self.slot(id) else {
            return OpResponse::InvalidState;
        };
        if !slot.current_claim().id().matches(claim_id) || !slot.current_claim().is_populated() {
            return OpResponse::InvalidState;
        }
        log::info!("Claim on slot {id} released by requester");
        if slot.has_running_job() {
            self.slot_mut(id).unwrap().destination = None;
            self.begin_eviction(id, false, now);
        } else {
            self.end_current_claim(id, now);
        }
        OpResponse::Ok
    }

    pub fn suspend_claim(&mut self, id: SlotId, claim_id: &str) -> OpResponse {
        let Some(slot) = self.slot(id) else {
            return OpResponse::InvalidState;
        };
        if !slot.current_claim().id().matches(claim_id)
            || slot.current_claim().state != ClaimState::Running
        {
            return OpResponse::InvalidState;
        }
        let slot = self.slot_mut(id).unwrap();
        let claim = slot.current_claim_mut();
        claim.state = ClaimState::Suspended;
        claim.suspended_by = Some(SuspendedBy::Requester);
        let handle = claim.executor;
        slot.change_state(SlotState::Claimed, Activity::Suspended);
        if let Some(handle) = handle {
            self.executor_op(|ex: &mut dyn JobExecutor| ex.suspend(handle));
        }
        OpResponse::Ok
    }

    /// Resumes a suspended job. Only the requester that suspended it may
    /// continue it; a policy-driven suspension is not theirs to undo.
    pub fn continue_claim(&mut self, id: SlotId, claim_id: &str) -> OpResponse {
        let Some(slot) = self.slot(id) else {
            return OpResponse::InvalidState;
        };
        let claim = slot.current_claim();
        if !claim.id().matches(claim_id)
            || claim.state != ClaimState::Suspended
            || claim.suspended_by != Some(SuspendedBy::Requester)
        {
            return OpResponse::InvalidState;
        }
        let slot = self.slot_mut(id).unwrap();
        let claim = slot.current_claim_mut();
        claim.state = ClaimState::Running;
        claim.suspended_by = None;
        let handle = claim.executor;
        slot.change_state(SlotState::Claimed, Activity::Busy);
        if let Some(handle) = handle {
            self.executor_op(|ex: &mut dyn JobExecutor| ex.resume(handle));
        }
        OpResponse::Ok
    }

    /// A matchmaker's advance notice that a negotiation is on its way;
    /// reserves the slot for `match_timeout`.
    pub fn match_notify(&mut self, id: SlotId, claim_id: &str, now: Instant) -> OpResponse {
        let Some(slot) = self.slot(id) else {
            return OpResponse::InvalidState;
        };
        if slot.destination.is_some() {
            // A pending transition wins; the notification is dropped.
            return OpResponse::Ok;
        }
        if !slot.current_claim().id().matches(claim_id) {
            return OpResponse::InvalidState;
        }
        match slot.state {
            SlotState::Owner | SlotState::Unclaimed | SlotState::Matched => {
                let timeout = self.policy().match_timeout;
                let slot = self.slot_mut(id).unwrap();
                slot.change_state(SlotState::Matched, Activity::Idle);
                slot.match_deadline = Some(now + timeout);
                OpResponse::Ok
            }
            _ => OpResponse::InvalidState,
        }
    }

    /// Keep-alive for a negotiated claim; refreshes the lease of
    /// whichever rung the token belongs to.
    pub fn alive(&mut self, id: SlotId, claim_id: &str, now: Instant) -> OpResponse {
        let Some(slot) = self.slot_mut(id) else {
            return OpResponse::InvalidState;
        };
        let Some(rung) = slot.ladder.find(claim_id) else {
            return OpResponse::InvalidState;
        };
        if rung == 0 {
            slot.current_claim_mut().last_alive = now;
        } else if let Some(claim) = slot
            .ladder
            .challengers_mut()
            .iter_mut()
            .find(|c| c.id().matches(claim_id))
        {
            claim.last_alive = now;
        }
        OpResponse::Ok
    }
}
