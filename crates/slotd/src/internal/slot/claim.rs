use crate::internal::attrs::{AttrRecord, names};
use crate::internal::capacity::pool::AssetPool;
use crate::internal::common::ids::ExecutorHandle;
use rand::Rng;
use rand::distr::Alphanumeric;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::time::{Duration, Instant};

/// Opaque, unguessable token identifying a claim. Presenting the token is
/// the capability to operate on the claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimId(String);

impl ClaimId {
    pub fn generate(rng: &mut SmallRng) -> Self {
        ClaimId((0..32).map(|_| rng.sample(Alphanumeric) as char).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, token: &str) -> bool {
        self.0 == token
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimType {
    Opportunistic,
    OnDemand,
    Fetch,
}

/// Negotiation/execution state of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimState {
    /// No negotiated user; the empty claim a slot always carries.
    Unclaimed,
    Idle,
    Running,
    Vacating,
    Killing,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendedBy {
    Requester,
    Policy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub user: String,
    pub host: String,
}

/// The negotiated right of one requester to run work on a slot.
///
/// A slot always owns at least one claim object; an unpopulated claim
/// (no client) represents "no negotiated user" and still carries the
/// advertised claim id.
#[derive(Debug)]
pub struct Claim {
    id: ClaimId,
    pub claim_type: ClaimType,
    pub state: ClaimState,
    pub client: Option<ClientIdentity>,
    pub job: Option<AttrRecord>,
    pub scheduler_address: Option<String>,
    /// Machine-side preference for this request, evaluated at admission.
    pub rank: f64,
    pub lease_interval: Option<Duration>,
    pub last_alive: Instant,
    pub job_start: Option<Instant>,
    pub executor: Option<ExecutorHandle>,
    /// Assets deducted from the slot's pool when the claim was granted;
    /// returned to the pool when the claim ends.
    pub consumed: Option<AssetPool>,
    pub suspended_by: Option<SuspendedBy>,
    /// Lifts the retirement window to "run to completion".
    pub retire_peacefully: bool,
    pub accepted_while_draining: bool,
    /// Set once eviction (vacate) has irreversibly begun.
    pub release_requested: bool,
}

impl Claim {
    pub fn new(rng: &mut SmallRng, now: Instant) -> Self {
        Claim {
            id: ClaimId::generate(rng),
            claim_type: ClaimType::Opportunistic,
            state: ClaimState::Unclaimed,
            client: None,
            job: None,
            scheduler_address: None,
            rank: 0.0,
            lease_interval: None,
            last_alive: now,
            job_start: None,
            executor: None,
            consumed: None,
            suspended_by: None,
            retire_peacefully: false,
            accepted_while_draining: false,
            release_requested: false,
        }
    }

    pub fn id(&self) -> &ClaimId {
        &self.id
    }

    /// Regenerates the claim token, so a previously negotiated id can no
    /// longer be presented.
    pub fn invalidate_id(&mut self, rng: &mut SmallRng) {
        self.id = ClaimId::generate(rng);
    }

    pub fn is_populated(&self) -> bool {
        self.client.is_some()
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ClaimState::Running | ClaimState::Vacating | ClaimState::Killing | ClaimState::Suspended
        )
    }

    pub fn lease_expired(&self, now: Instant) -> bool {
        match self.lease_interval {
            Some(interval) => self.is_populated() && now >= self.last_alive + interval,
            None => false,
        }
    }

    fn job_duration_attr(&self, name: &str) -> Option<Duration> {
        self.job
            .as_ref()
            .and_then(|job| job.get_i64(name))
            .map(|secs| Duration::from_secs(secs.max(0) as u64))
    }

    fn retirement_budget(&self, machine_max: Duration) -> Duration {
        let mut budget = machine_max;
        if let Some(job_max) = self.job_duration_attr(names::MAX_JOB_RETIREMENT_TIME) {
            budget = budget.min(job_max);
        }
        budget
    }

    /// Remaining retirement window of the running job:
    /// `min(machine budget, job budget) − elapsed runtime`, clamped at
    /// zero. A claim without a running job has nothing to retire.
    pub fn retirement_remaining(&self, machine_max: Duration, now: Instant) -> Duration {
        let start = match self.job_start {
            Some(start) if self.is_active() => start,
            _ => return Duration::ZERO,
        };
        let budget = self.retirement_budget(machine_max);
        if self.retire_peacefully && !budget.is_zero() {
            // Peaceful retirement means the job runs to completion,
            // unless policy already decided on immediate preemption.
            return Duration::MAX;
        }
        budget.saturating_sub(now - start)
    }

    /// Instant at which a retiring job must start vacating so the full
    /// vacate budget still fits inside its retirement window. None while
    /// the job runs to completion under peaceful retirement.
    pub fn retirement_deadline(
        &self,
        machine_max: Duration,
        machine_vacate: Duration,
    ) -> Option<Instant> {
        let start = match self.job_start {
            Some(start) if self.is_active() => start,
            _ => return None,
        };
        let budget = self.retirement_budget(machine_max);
        if self.retire_peacefully && !budget.is_zero() {
            return None;
        }
        Some(start + budget.saturating_sub(self.vacate_budget(machine_vacate)))
    }

    /// Grace period the job gets to exit cleanly once eviction begins.
    pub fn vacate_budget(&self, machine_max: Duration) -> Duration {
        match self.job_duration_attr(names::MAX_VACATE_TIME) {
            Some(job_max) => machine_max.min(job_max),
            None => machine_max,
        }
    }

    /// Publishes the claim-side attributes into a slot record.
    pub fn publish(&self, record: &mut AttrRecord) {
        if let Some(client) = &self.client {
            record.set(names::REMOTE_USER, client.user.as_str());
            record.set(names::CLIENT_MACHINE, client.host.as_str());
        }
    }
}

/// The ordered claim slots of one resource: rung 0 is the current claim
/// (always present), rung 1 a preempting claim negotiating a
/// replacement, rung 2 a pre-preempting claim queued behind it.
#[derive(Debug)]
pub struct ClaimLadder {
    rungs: SmallVec<[Claim; 3]>,
}

pub const LADDER_DEPTH: usize = 3;

impl ClaimLadder {
    pub fn new(rng: &mut SmallRng, now: Instant) -> Self {
        let mut rungs = SmallVec::new();
        rungs.push(Claim::new(rng, now));
        ClaimLadder { rungs }
    }

    pub fn current(&self) -> &Claim {
        &self.rungs[0]
    }

    pub fn current_mut(&mut self) -> &mut Claim {
        &mut self.rungs[0]
    }

    pub fn challengers(&self) -> &[Claim] {
        &self.rungs[1..]
    }

    pub fn challengers_mut(&mut self) -> &mut [Claim] {
        &mut self.rungs[1..]
    }

    pub fn has_challenger(&self) -> bool {
        self.rungs.len() > 1
    }

    pub fn depth(&self) -> usize {
        self.rungs.len()
    }

    /// Finds the rung holding the given claim token.
    pub fn find(&self, token: &str) -> Option<usize> {
        self.rungs.iter().position(|c| c.id().matches(token))
    }

    /// Admits a challenger: it must outrank (>=) every occupied
    /// challenger rung, and the ladder never grows past its fixed depth.
    /// Returns the rung it was admitted at.
    pub fn admit_challenger(&mut self, claim: Claim) -> Result<usize, Claim> {
        if self.rungs.len() >= LADDER_DEPTH {
            return Err(claim);
        }
        if let Some(top) = self.rungs.last()
            && self.rungs.len() > 1
            && claim.rank < top.rank
        {
            return Err(claim);
        }
        self.rungs.push(claim);
        Ok(self.rungs.len() - 1)
    }

    /// Takes the challenger that should replace the current claim: the
    /// highest rung wins (it outranked everything below it), the rest
    /// are discarded.
    pub fn take_best_challenger(&mut self) -> Option<Claim> {
        if self.rungs.len() <= 1 {
            return None;
        }
        let best = self.rungs.pop();
        self.rungs.truncate(1);
        best
    }

    pub fn discard_challengers(&mut self) {
        self.rungs.truncate(1);
    }

    /// Replaces the current claim, returning the old one.
    pub fn replace_current(&mut self, claim: Claim) -> Claim {
        std::mem::replace(&mut self.rungs[0], claim)
    }
}
