use crate::internal::attrs::AttrRecord;

/// Typed result of evaluating an attribute expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Error,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Str(String),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            Value::Real(r) => Some(*r as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Real(r) => Some(*r),
            _ => None,
        }
    }
}

/// External expression evaluation engine.
///
/// The core never interprets expression syntax. It hands the evaluator an
/// expression together with a primary scope (and optionally a target scope
/// for two-record evaluation, e.g. slot vs. job) and consumes the typed
/// result.
pub trait Evaluator {
    fn evaluate(
        &self,
        expr: &str,
        primary: &AttrRecord,
        target: Option<&AttrRecord>,
    ) -> crate::Result<Value>;
}

/// Evaluate a policy expression that the configuration guarantees to be
/// evaluable. A failure here means the in-memory model has diverged from
/// its invariants; the process must not continue.
pub fn eval_required_bool(
    ev: &dyn Evaluator,
    expr: &str,
    primary: &AttrRecord,
    target: Option<&AttrRecord>,
) -> bool {
    match ev.evaluate(expr, primary, target) {
        Ok(Value::Boolean(b)) => b,
        Ok(v) => {
            log::warn!("Policy expression '{expr}' evaluated to non-boolean {v:?}");
            false
        }
        Err(e) => {
            log::error!("Required policy expression '{expr}' failed to evaluate: {e}");
            panic!("required policy expression '{expr}' failed to evaluate");
        }
    }
}

/// Evaluate an advisory expression, falling back to `default` when the
/// evaluation fails or produces a non-boolean.
pub fn eval_advisory_bool(
    ev: &dyn Evaluator,
    expr: &str,
    primary: &AttrRecord,
    target: Option<&AttrRecord>,
    default: bool,
) -> bool {
    match ev.evaluate(expr, primary, target) {
        Ok(Value::Boolean(b)) => b,
        Ok(v) => {
            log::warn!("Advisory expression '{expr}' evaluated to {v:?}; using {default}");
            default
        }
        Err(e) => {
            log::warn!("Advisory expression '{expr}' failed to evaluate ({e}); using {default}");
            default
        }
    }
}

/// Evaluate an advisory numeric expression with a fallback value.
pub fn eval_advisory_f64(
    ev: &dyn Evaluator,
    expr: &str,
    primary: &AttrRecord,
    target: Option<&AttrRecord>,
    default: f64,
) -> f64 {
    match ev.evaluate(expr, primary, target) {
        Ok(v) => v.as_f64().unwrap_or_else(|| {
            log::warn!("Expression '{expr}' evaluated to non-numeric {v:?}; using {default}");
            default
        }),
        Err(e) => {
            log::warn!("Expression '{expr}' failed to evaluate ({e}); using {default}");
            default
        }
    }
}
