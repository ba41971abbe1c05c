use crate::internal::common::Map;
use serde::{Deserialize, Serialize};

/// Well-known attribute names used in slot, claim and job records.
pub mod names {
    pub const NAME: &str = "Name";
    pub const SLOT_ID: &str = "SlotId";
    pub const SLOT_TYPE: &str = "SlotType";
    pub const STATE: &str = "State";
    pub const ACTIVITY: &str = "Activity";
    pub const RANK: &str = "Rank";
    pub const REQUIREMENTS: &str = "Requirements";
    pub const CLAIM_ID: &str = "ClaimId";
    pub const PARTITIONABLE: &str = "PartitionableSlot";
    pub const DYNAMIC: &str = "DynamicSlot";
    pub const PARENT_NAME: &str = "ParentSlotName";

    pub const CPUS: &str = "Cpus";
    pub const MEMORY: &str = "Memory";
    pub const DISK: &str = "Disk";

    pub const USER: &str = "User";
    pub const REMOTE_USER: &str = "RemoteUser";
    pub const CLIENT_MACHINE: &str = "ClientMachine";
    pub const RETIRE_PEACEFULLY: &str = "RetirePeacefully";

    pub const REQUEST_PREFIX: &str = "Request";
    pub const MAX_JOB_RETIREMENT_TIME: &str = "MaxJobRetirementTime";
    pub const MAX_VACATE_TIME: &str = "MaxVacateTime";

    pub const DRAINING: &str = "Draining";
    pub const DRAIN_REASON: &str = "DrainReason";
    pub const DRAINING_REQUEST_ID: &str = "DrainingRequestId";
    pub const LAST_DRAIN_START: &str = "LastDrainStartTime";
    pub const LAST_DRAIN_STOP: &str = "LastDrainStopTime";
}

/// A single attribute value: either a literal or an unevaluated expression
/// to be interpreted by the external evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(String),
    Expr(String),
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Real(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

/// A flat, named mapping of values/expressions describing a slot, claim or
/// job. Built by the core and evaluated against a scope by the external
/// expression evaluator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrRecord(Map<String, AttrValue>);

impl AttrRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<AttrValue>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn set_expr(&mut self, name: &str, expr: &str) {
        self.0
            .insert(name.to_string(), AttrValue::Expr(expr.to_string()));
    }

    pub fn remove(&mut self, name: &str) -> Option<AttrValue> {
        self.0.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.0.get(name)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.0.get(name) {
            Some(AttrValue::Int(n)) => Some(*n),
            Some(AttrValue::Real(r)) => Some(*r as i64),
            _ => None,
        }
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.0.get(name) {
            Some(AttrValue::Int(n)) => Some(*n as f64),
            Some(AttrValue::Real(r)) => Some(*r),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(AttrValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
