use crate::internal::attrs::{AttrRecord, AttrValue, names};
use crate::internal::capacity::amount::ResourceAmount;
use crate::internal::capacity::pool::AssetPool;
use crate::internal::comm::{AdvertSink, ExitStatus, JobExecutor};
use crate::internal::common::Map;
use crate::internal::common::ids::{ExecutorHandle, SlotId};
use crate::internal::eval::{Evaluator, Value};
use crate::internal::manager::config::{PolicyConfig, Share, SlotConfig, SlotTypeSpec};
use crate::internal::manager::SlotManager;
use crate::internal::messages::{ActivateRequest, ActivateResponse, ClaimRequest, ClaimResponse};
use crate::internal::slot::claim::ClaimType;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Evaluator stub resolving a fixed expression table, falling back to
/// literal parsing and plain attribute lookup. Cloning shares the table,
/// so a test can keep a handle and flip policy answers mid-scenario.
#[derive(Clone, Default)]
pub struct StubEvaluator {
    values: Rc<RefCell<Map<String, Value>>>,
}

impl StubEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, expr: &str, value: Value) {
        self.values.borrow_mut().insert(expr.to_string(), value);
    }
}

impl Evaluator for StubEvaluator {
    fn evaluate(
        &self,
        expr: &str,
        primary: &AttrRecord,
        target: Option<&AttrRecord>,
    ) -> crate::Result<Value> {
        let expr = expr.trim();
        if let Some(value) = self.values.borrow().get(expr) {
            return Ok(value.clone());
        }
        match expr {
            "true" | "(true)" => return Ok(Value::Boolean(true)),
            "false" | "(false)" => return Ok(Value::Boolean(false)),
            _ => {}
        }
        if let Ok(v) = expr.parse::<i64>() {
            return Ok(Value::Integer(v));
        }
        if let Ok(v) = expr.parse::<f64>() {
            return Ok(Value::Real(v));
        }
        let lookup = primary.get(expr).or_else(|| target.and_then(|t| t.get(expr)));
        Ok(match lookup {
            Some(AttrValue::Bool(b)) => Value::Boolean(*b),
            Some(AttrValue::Int(v)) => Value::Integer(*v),
            Some(AttrValue::Real(v)) => Value::Real(*v),
            Some(AttrValue::Str(s)) => Value::Str(s.clone()),
            Some(AttrValue::Expr(_)) | None => Value::Undefined,
        })
    }
}

#[derive(Default)]
pub struct SinkLog {
    pub published: Vec<AttrRecord>,
    pub invalidated: Vec<String>,
}

struct SharedSink(Rc<RefCell<SinkLog>>);

impl AdvertSink for SharedSink {
    fn publish(&mut self, record: &AttrRecord) -> crate::Result<()> {
        self.0.borrow_mut().published.push(record.clone());
        Ok(())
    }

    fn invalidate(&mut self, name: &str) -> crate::Result<()> {
        self.0.borrow_mut().invalidated.push(name.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct ExecLog {
    next: u64,
    pub fail_spawn: bool,
    pub spawned: Vec<ExecutorHandle>,
    pub stopped: Vec<(ExecutorHandle, bool)>,
    pub suspended: Vec<ExecutorHandle>,
    pub resumed: Vec<ExecutorHandle>,
    pub killed_all: bool,
}

struct SharedExecutor(Rc<RefCell<ExecLog>>);

impl JobExecutor for SharedExecutor {
    fn spawn(&mut self, _job: &AttrRecord, _slot_record: &AttrRecord) -> crate::Result<ExecutorHandle> {
        let mut log = self.0.borrow_mut();
        if log.fail_spawn {
            return Err("spawn refused".into());
        }
        log.next += 1;
        let handle = ExecutorHandle::new(log.next);
        log.spawned.push(handle);
        Ok(handle)
    }

    fn stop(&mut self, handle: ExecutorHandle, graceful: bool) {
        self.0.borrow_mut().stopped.push((handle, graceful));
    }

    fn suspend(&mut self, handle: ExecutorHandle) {
        self.0.borrow_mut().suspended.push(handle);
    }

    fn resume(&mut self, handle: ExecutorHandle) {
        self.0.borrow_mut().resumed.push(handle);
    }

    fn kill_all(&mut self) {
        self.0.borrow_mut().killed_all = true;
    }
}

/// Whole-manager test fixture: the manager wired to shared stubs plus a
/// controllable clock.
pub struct TestEnv {
    pub mgr: SlotManager,
    pub eval: StubEvaluator,
    pub sink: Rc<RefCell<SinkLog>>,
    pub exec: Rc<RefCell<ExecLog>>,
    pub now: Instant,
}

impl TestEnv {
    pub fn new(config: SlotConfig) -> TestEnv {
        Self::with_eval(config, StubEvaluator::new())
    }

    pub fn with_eval(config: SlotConfig, eval: StubEvaluator) -> TestEnv {
        let sink = Rc::new(RefCell::new(SinkLog::default()));
        let exec = Rc::new(RefCell::new(ExecLog::default()));
        let mgr = SlotManager::new(
            config,
            Box::new(eval.clone()),
            Box::new(SharedSink(sink.clone())),
            Box::new(SharedExecutor(exec.clone())),
        )
        .unwrap();
        TestEnv {
            mgr,
            eval,
            sink,
            exec,
            now: Instant::now(),
        }
    }

    /// Advances the clock and runs the timer sweep.
    pub fn tick(&mut self, elapsed: Duration) {
        self.now += elapsed;
        self.mgr.tick(self.now);
    }

    pub fn evaluate(&mut self) {
        self.mgr.evaluate_and_advertise(self.now);
    }

    pub fn first_slot(&self) -> SlotId {
        self.mgr.slot_ids()[0]
    }

    pub fn advertised_id(&self, id: SlotId) -> String {
        self.mgr.slot(id).unwrap().advertised_claim_id().to_string()
    }

    /// Negotiates a claim against the slot's advertised id and returns
    /// the granted claim id.
    pub fn claim(&mut self, id: SlotId, job: AttrRecord) -> String {
        let req = claim_request(&self.advertised_id(id), job);
        match self.mgr.request_claim(id, &req, self.now) {
            ClaimResponse::Accepted { claim_id } => claim_id,
            ClaimResponse::AcceptedWithLeftover { .. } => panic!("expected an in-place grant"),
            other => panic!("claim refused: {other:?}"),
        }
    }

    /// Claims and activates in one go, returning the claim id and the
    /// spawned executor handle.
    pub fn run_job(&mut self, id: SlotId, job: AttrRecord) -> (String, ExecutorHandle) {
        let claim_id = self.claim(id, job.clone());
        let resp = self
            .mgr
            .activate_claim(id, &activate_request(&claim_id, job), self.now);
        assert_eq!(resp, ActivateResponse::Ok);
        let handle = *self.exec.borrow().spawned.last().unwrap();
        (claim_id, handle)
    }

    pub fn finish_job(&mut self, handle: ExecutorHandle) {
        self.mgr
            .executor_exited(handle, ExitStatus::Exited(0), self.now);
    }

    pub fn last_stop(&self) -> Option<(ExecutorHandle, bool)> {
        self.exec.borrow().stopped.last().copied()
    }
}

/// One slot type, `count` identical instances splitting the machine
/// evenly.
pub fn static_config(count: u32, cpus: u32, memory: u32, disk: u32) -> SlotConfig {
    SlotConfig {
        machine_name: "m1".to_string(),
        total: AssetPool::with_standard(
            ResourceAmount::units(cpus),
            ResourceAmount::units(memory),
            ResourceAmount::units(disk),
        ),
        slot_types: vec![SlotTypeSpec {
            count,
            partitionable: false,
            shares: Map::new(),
        }],
        policy: PolicyConfig::default(),
    }
}

/// A single partitionable slot covering the whole machine.
pub fn partitionable_config(cpus: u32, memory: u32, disk: u32) -> SlotConfig {
    let mut config = static_config(1, cpus, memory, disk);
    config.slot_types[0].partitionable = true;
    config
}

pub fn slot_type(count: u32, cpus: u32) -> SlotTypeSpec {
    let mut shares = Map::new();
    shares.insert(names::CPUS.to_string(), Share::Units(cpus));
    SlotTypeSpec {
        count,
        partitionable: false,
        shares,
    }
}

pub fn job(cpus: i64, memory: i64, disk: i64) -> AttrRecord {
    let mut job = AttrRecord::new();
    job.set(names::USER, "alice");
    job.set("RequestCpus", cpus);
    job.set("RequestMemory", memory);
    job.set("RequestDisk", disk);
    job
}

pub fn claim_request(claim_id: &str, job: AttrRecord) -> ClaimRequest {
    ClaimRequest {
        claim_id: claim_id.to_string(),
        claim_type: ClaimType::Opportunistic,
        job,
        overrides: AttrRecord::new(),
        scheduler_address: "sched@machine-a:9618".to_string(),
        lease_interval: None,
    }
}

pub fn activate_request(claim_id: &str, job: AttrRecord) -> ActivateRequest {
    ActivateRequest {
        claim_id: claim_id.to_string(),
        starter_selector: String::new(),
        job,
    }
}
