use crate::internal::attrs::{AttrRecord, names};
use crate::internal::capacity::amount::ResourceAmount;
use crate::internal::capacity::pool::AssetPool;
use crate::internal::common::Map;
use crate::internal::eval::{Evaluator, eval_required_bool};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PartitionError {
    #[error("No requested quantity for '{0}' in job or schedule overrides")]
    InsufficientSpecification(String),
    #[error("Cannot partition parent slot: {0}")]
    CannotPartition(String),
}

const REQUIRED_DIMENSIONS: [&str; 3] = [names::CPUS, names::MEMORY, names::DISK];

fn request_key(asset: &str) -> String {
    format!("{}{}", names::REQUEST_PREFIX, asset)
}

/// Collects the requested quantity per asset into a request record.
/// Schedule-side overrides take precedence over the job's own request.
fn build_request_record(
    job: &AttrRecord,
    overrides: &AttrRecord,
    assets: &AssetPool,
) -> Result<AttrRecord, PartitionError> {
    let mut request = AttrRecord::new();
    for asset in assets.asset_names() {
        let key = request_key(asset);
        let value = overrides.get_f64(&key).or_else(|| job.get_f64(&key));
        match value {
            Some(v) => request.set(&key, v),
            None if REQUIRED_DIMENSIONS.contains(&asset.as_str()) => {
                return Err(PartitionError::InsufficientSpecification(asset.clone()));
            }
            None => {}
        }
    }
    Ok(request)
}

fn pool_from_request(request: &AttrRecord, assets: &AssetPool) -> AssetPool {
    let mut sized = AssetPool::new();
    for asset in assets.asset_names() {
        let amount = request
            .get_f64(&request_key(asset))
            .filter(|v| *v > 0.0)
            .map(ResourceAmount::from_f64)
            .unwrap_or(ResourceAmount::ZERO);
        sized.set(asset, amount);
    }
    sized
}

/// Sizes a new dynamic child out of `parent_free`.
///
/// The request may first be rewritten by the configured per-dimension
/// modify expressions (evaluated with the parent's record as primary
/// scope and the request as target). If the rewritten request no longer
/// satisfies the parent's whole-slot requirement expression, the rewrite
/// is undone once and the verification retried before giving up.
pub fn carve_quantities(
    ev: &dyn Evaluator,
    parent_record: &AttrRecord,
    parent_free: &AssetPool,
    job: &AttrRecord,
    overrides: &AttrRecord,
    modify_exprs: &Map<String, String>,
    requirements_expr: &str,
) -> Result<AssetPool, PartitionError> {
    let backup = build_request_record(job, overrides, parent_free)?;
    let mut request = backup.clone();

    for (asset, expr) in modify_exprs.iter() {
        match ev.evaluate(expr, parent_record, Some(&request)) {
            Ok(value) => match value.as_f64() {
                Some(v) if v >= 0.0 => request.set(&request_key(asset), v),
                _ => log::warn!("Request rewrite for '{asset}' produced {value:?}; kept original"),
            },
            Err(e) => log::warn!("Request rewrite for '{asset}' failed ({e}); kept original"),
        }
    }

    let verify = |request: &AttrRecord| -> Option<AssetPool> {
        let sized = pool_from_request(request, parent_free);
        if !parent_free.contains(&sized) {
            return None;
        }
        if !eval_required_bool(ev, requirements_expr, parent_record, Some(request)) {
            return None;
        }
        Some(sized)
    };

    if let Some(sized) = verify(&request) {
        return Ok(sized);
    }
    if request != backup {
        log::debug!("Rewritten request not satisfiable; retrying with unmodified request");
        if let Some(sized) = verify(&backup) {
            return Ok(sized);
        }
    }
    Err(PartitionError::CannotPartition(
        "request does not fit the parent's remaining capacity".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::eval::Value;
    use crate::internal::tests::utils::StubEvaluator;

    fn parent_free() -> AssetPool {
        AssetPool::with_standard(
            ResourceAmount::units(8),
            ResourceAmount::units(8192),
            ResourceAmount::units(10000),
        )
    }

    fn job(cpus: i64, memory: i64, disk: i64) -> AttrRecord {
        let mut job = AttrRecord::new();
        job.set("RequestCpus", cpus);
        job.set("RequestMemory", memory);
        job.set("RequestDisk", disk);
        job
    }

    fn always_true() -> StubEvaluator {
        let mut ev = StubEvaluator::new();
        ev.set("true", Value::Boolean(true));
        ev
    }

    #[test]
    fn test_carve_exact_quantities() {
        let ev = always_true();
        let sized = carve_quantities(
            &ev,
            &AttrRecord::new(),
            &parent_free(),
            &job(2, 2048, 1000),
            &AttrRecord::new(),
            &Map::new(),
            "true",
        )
        .unwrap();
        assert_eq!(sized.get(names::CPUS), ResourceAmount::units(2));
        assert_eq!(sized.get(names::MEMORY), ResourceAmount::units(2048));
        assert_eq!(sized.get(names::DISK), ResourceAmount::units(1000));
    }

    #[test]
    fn test_overrides_win_over_job_request() {
        let ev = always_true();
        let mut overrides = AttrRecord::new();
        overrides.set("RequestCpus", 4i64);
        let sized = carve_quantities(
            &ev,
            &AttrRecord::new(),
            &parent_free(),
            &job(2, 2048, 1000),
            &overrides,
            &Map::new(),
            "true",
        )
        .unwrap();
        assert_eq!(sized.get(names::CPUS), ResourceAmount::units(4));
    }

    #[test]
    fn test_missing_dimension_fails() {
        let ev = always_true();
        let mut job = AttrRecord::new();
        job.set("RequestCpus", 2i64);
        let err = carve_quantities(
            &ev,
            &AttrRecord::new(),
            &parent_free(),
            &job,
            &AttrRecord::new(),
            &Map::new(),
            "true",
        )
        .unwrap_err();
        assert!(matches!(err, PartitionError::InsufficientSpecification(_)));
    }

    #[test]
    fn test_oversized_request_cannot_partition() {
        let ev = always_true();
        let err = carve_quantities(
            &ev,
            &AttrRecord::new(),
            &parent_free(),
            &job(16, 1, 1),
            &AttrRecord::new(),
            &Map::new(),
            "true",
        )
        .unwrap_err();
        assert!(matches!(err, PartitionError::CannotPartition(_)));
    }

    #[test]
    fn test_rewrite_undone_when_it_does_not_fit() {
        let mut ev = always_true();
        // Rewrites the cpu request to more than the parent holds; the
        // original request must then be retried and succeed.
        ev.set("pad_cpus", Value::Integer(100));
        let mut modify = Map::new();
        modify.insert(names::CPUS.to_string(), "pad_cpus".to_string());
        let sized = carve_quantities(
            &ev,
            &AttrRecord::new(),
            &parent_free(),
            &job(2, 2048, 1000),
            &AttrRecord::new(),
            &modify,
            "true",
        )
        .unwrap();
        assert_eq!(sized.get(names::CPUS), ResourceAmount::units(2));
    }
}
