use crate::internal::attrs::{AttrRecord, names};
use crate::internal::capacity::amount::ResourceAmount;
use crate::internal::capacity::pool::AssetPool;
use crate::internal::common::Map;
use crate::internal::eval::{Evaluator, eval_advisory_f64};

/// Computed per-asset consumption of one request, as produced by
/// [`compute_consumption`]. `insufficient` is set when any asset's
/// consumption expression failed or evaluated negative; such a result
/// must never be granted.
#[derive(Debug, Clone, Default)]
pub struct Consumption {
    per_asset: Map<String, ResourceAmount>,
    pub insufficient: bool,
}

impl Consumption {
    pub fn get(&self, asset: &str) -> ResourceAmount {
        self.per_asset
            .get(asset)
            .copied()
            .unwrap_or(ResourceAmount::ZERO)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ResourceAmount)> {
        self.per_asset.iter()
    }

    pub fn as_pool(&self) -> AssetPool {
        let mut pool = AssetPool::new();
        for (name, amount) in self.per_asset.iter() {
            pool.set(name, *amount);
        }
        pool
    }
}

fn requested_amount(job: &AttrRecord, asset: &str) -> Option<ResourceAmount> {
    let key = format!("{}{}", names::REQUEST_PREFIX, asset);
    job.get_f64(&key).map(|v| {
        if v <= 0.0 {
            ResourceAmount::ZERO
        } else {
            ResourceAmount::from_f64(v)
        }
    })
}

/// Evaluates the consumption of `job` against `slot_record` for every
/// asset the slot advertises.
///
/// An asset with a configured consumption expression uses it (the
/// expression is a pure function of the job's requested quantity,
/// typically a rounding or quantization rule); otherwise the job's
/// declared `Request<Asset>` quantity is taken verbatim. A negative or
/// failed evaluation becomes zero-with-warning and marks the whole
/// result as insufficient.
pub fn compute_consumption(
    ev: &dyn Evaluator,
    job: &AttrRecord,
    slot_record: &AttrRecord,
    free: &AssetPool,
    consumption_exprs: &Map<String, String>,
) -> Consumption {
    let mut result = Consumption::default();
    for asset in free.asset_names() {
        let amount = match consumption_exprs.get(asset) {
            Some(expr) => match ev.evaluate(expr, slot_record, Some(job)) {
                Ok(value) => match value.as_f64() {
                    Some(v) if v >= 0.0 => ResourceAmount::from_f64(v),
                    Some(v) => {
                        log::warn!("Consumption of '{asset}' evaluated negative ({v}); using 0");
                        result.insufficient = true;
                        ResourceAmount::ZERO
                    }
                    None => {
                        log::warn!(
                            "Consumption of '{asset}' evaluated to non-numeric {value:?}; using 0"
                        );
                        result.insufficient = true;
                        ResourceAmount::ZERO
                    }
                },
                Err(e) => {
                    log::warn!("Consumption of '{asset}' failed to evaluate ({e}); using 0");
                    result.insufficient = true;
                    ResourceAmount::ZERO
                }
            },
            None => requested_amount(job, asset).unwrap_or(ResourceAmount::ZERO),
        };
        result.per_asset.insert(asset.clone(), amount);
    }
    result
}

/// True iff the slot can grant `consumption` as a unit: every asset's
/// available quantity covers its consumption, nothing evaluated negative,
/// and at least one asset is actually consumed (an all-zero consumption
/// is degenerate and refused).
pub fn sufficient_assets(free: &AssetPool, consumption: &Consumption) -> bool {
    if consumption.insufficient {
        return false;
    }
    let mut any_positive = false;
    for (asset, amount) in consumption.iter() {
        if free.get(asset) < *amount {
            return false;
        }
        if !amount.is_zero() {
            any_positive = true;
        }
    }
    any_positive
}

/// Subtracts `consumption` from `free`, restoring it afterwards when
/// `test_only`, and returns the drop in the slot's configured weight as
/// the comparative cost of granting the request.
///
/// The weight expression is advisory: when it is absent or fails to
/// evaluate, the cost falls back to the number of cpus consumed.
pub fn deduct_assets(
    ev: &dyn Evaluator,
    free: &mut AssetPool,
    slot_record: &AttrRecord,
    weight_expr: Option<&str>,
    consumption: &Consumption,
    test_only: bool,
) -> f64 {
    let weight_of = |pool: &AssetPool| -> f64 {
        match weight_expr {
            Some(expr) => {
                let mut record = slot_record.clone();
                pool.publish(&mut record);
                eval_advisory_f64(ev, expr, &record, None, pool.get(names::CPUS).as_f64())
            }
            None => pool.get(names::CPUS).as_f64(),
        }
    };

    let before = weight_of(free);
    let taken = consumption.as_pool();
    free.subtract(&taken);
    let after = weight_of(free);
    if test_only {
        free.add(&taken);
    }
    before - after
}
