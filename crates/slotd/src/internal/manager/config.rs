use crate::internal::capacity::amount::ResourceAmount;
use crate::internal::capacity::pool::AssetPool;
use crate::internal::common::Map;
use crate::internal::common::error::SlotError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-asset share of the machine capacity one slot instance receives.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Share {
    /// Even split of the machine total across all auto instances.
    Auto,
    Units(u32),
    Fraction(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotTypeSpec {
    pub count: u32,
    #[serde(default)]
    pub partitionable: bool,
    /// Missing assets default to `Share::Auto`.
    #[serde(default)]
    pub shares: Map<String, Share>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Availability policy; required and assumed always evaluable.
    pub start_expr: String,
    /// Advisory; true moves an idle slot to `Owner`.
    #[serde(default)]
    pub owner_expr: Option<String>,
    /// Advisory; true begins graceful preemption of the current claim.
    #[serde(default)]
    pub preempt_expr: Option<String>,
    /// Advisory; true suspends a running job until it turns false again.
    #[serde(default)]
    pub suspend_expr: Option<String>,
    /// Machine-side preference for an incoming request.
    #[serde(default = "default_rank_expr")]
    pub rank_expr: String,
    /// Machine-wide limit anded into every slot's requirements.
    #[serde(default)]
    pub slot_limit_expr: Option<String>,
    /// Advisory slot weight used as the cost of granting assets.
    #[serde(default)]
    pub weight_expr: Option<String>,
    /// Per-asset consumption (quantization) rules.
    #[serde(default)]
    pub consumption_exprs: Map<String, String>,
    /// Per-dimension request rewriting applied before carving.
    #[serde(default)]
    pub modify_request_exprs: Map<String, String>,
    #[serde(default = "default_max_retirement")]
    pub max_retirement: Duration,
    #[serde(default = "default_max_vacate")]
    pub max_vacate: Duration,
    #[serde(default = "default_match_timeout")]
    pub match_timeout: Duration,
}

fn default_rank_expr() -> String {
    "0".to_string()
}

fn default_max_retirement() -> Duration {
    Duration::ZERO
}

fn default_max_vacate() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_match_timeout() -> Duration {
    Duration::from_secs(120)
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            start_expr: "true".to_string(),
            owner_expr: None,
            preempt_expr: None,
            suspend_expr: None,
            rank_expr: default_rank_expr(),
            slot_limit_expr: None,
            weight_expr: None,
            consumption_exprs: Map::new(),
            modify_request_exprs: Map::new(),
            max_retirement: default_max_retirement(),
            max_vacate: default_max_vacate(),
            match_timeout: default_match_timeout(),
        }
    }
}

/// Static-at-reconfigure-time description of the machine's slot
/// topology; consumed only by `init_slots`/`reconfigure`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    pub machine_name: String,
    /// Total machine capacity, including custom resources.
    pub total: AssetPool,
    pub slot_types: Vec<SlotTypeSpec>,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl SlotConfig {
    pub fn from_json(text: &str) -> crate::Result<SlotConfig> {
        let config: SlotConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.slot_types.is_empty() {
            return Err(SlotError::ConfigError("no slot types configured".into()));
        }
        for (name, amount) in self.total.iter() {
            if !amount.is_whole() {
                return Err(SlotError::ConfigError(format!(
                    "machine capacity of '{name}' must be whole units"
                )));
            }
        }
        Ok(())
    }

    /// Partitions the machine capacity across the configured slot types,
    /// yielding one capacity pool per slot instance (in type order).
    ///
    /// `Units`/`Fraction` shares are absolute per instance; `Auto`
    /// splits the machine total evenly across all instances of the
    /// machine, floored to whole units. Oversubscription is a
    /// configuration error.
    pub fn instance_capacities(&self) -> crate::Result<Vec<Vec<AssetPool>>> {
        let total_instances: u32 = self.slot_types.iter().map(|t| t.count).sum();
        if total_instances == 0 {
            return Err(SlotError::ConfigError("zero slot instances".into()));
        }
        let mut remaining = self.total.clone();
        let mut result = Vec::new();
        for spec in &self.slot_types {
            let mut instances = Vec::new();
            for _ in 0..spec.count {
                let mut pool = AssetPool::new();
                for (asset, machine_amount) in self.total.iter() {
                    let share = spec.shares.get(asset).copied().unwrap_or(Share::Auto);
                    let amount = match share {
                        Share::Units(u) => ResourceAmount::units(u),
                        Share::Fraction(f) => {
                            if !(0.0..=1.0).contains(&f) {
                                return Err(SlotError::ConfigError(format!(
                                    "share fraction {f} for '{asset}' out of range"
                                )));
                            }
                            ResourceAmount::units(
                                (machine_amount.as_f64() * f).floor() as u32
                            )
                        }
                        Share::Auto => ResourceAmount::units(
                            machine_amount.whole_units() / total_instances,
                        ),
                    };
                    pool.set(asset, amount);
                }
                if !remaining.contains(&pool) {
                    return Err(SlotError::ConfigError(
                        "slot type shares oversubscribe the machine capacity".into(),
                    ));
                }
                remaining.subtract(&pool);
                instances.push(pool);
            }
            result.push(instances);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::attrs::names;

    fn machine_total() -> AssetPool {
        let mut total = AssetPool::with_standard(
            ResourceAmount::units(8),
            ResourceAmount::units(8192),
            ResourceAmount::units(10000),
        );
        total.set("Gpus", ResourceAmount::units(4));
        total
    }

    #[test]
    fn test_auto_split() {
        let config = SlotConfig {
            machine_name: "m".into(),
            total: machine_total(),
            slot_types: vec![SlotTypeSpec {
                count: 4,
                partitionable: false,
                shares: Map::new(),
            }],
            policy: PolicyConfig::default(),
        };
        let caps = config.instance_capacities().unwrap();
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].len(), 4);
        for pool in &caps[0] {
            assert_eq!(pool.get(names::CPUS), ResourceAmount::units(2));
            assert_eq!(pool.get(names::MEMORY), ResourceAmount::units(2048));
            assert_eq!(pool.get("Gpus"), ResourceAmount::units(1));
        }
    }

    #[test]
    fn test_explicit_shares() {
        let mut shares = Map::new();
        shares.insert(names::CPUS.to_string(), Share::Units(6));
        shares.insert(names::MEMORY.to_string(), Share::Fraction(0.5));
        let config = SlotConfig {
            machine_name: "m".into(),
            total: machine_total(),
            slot_types: vec![SlotTypeSpec {
                count: 1,
                partitionable: true,
                shares,
            }],
            policy: PolicyConfig::default(),
        };
        let caps = config.instance_capacities().unwrap();
        assert_eq!(caps[0][0].get(names::CPUS), ResourceAmount::units(6));
        assert_eq!(caps[0][0].get(names::MEMORY), ResourceAmount::units(4096));
    }

    #[test]
    fn test_oversubscription_rejected() {
        let mut shares = Map::new();
        shares.insert(names::CPUS.to_string(), Share::Units(6));
        let config = SlotConfig {
            machine_name: "m".into(),
            total: machine_total(),
            slot_types: vec![SlotTypeSpec {
                count: 2,
                partitionable: false,
                shares,
            }],
            policy: PolicyConfig::default(),
        };
        assert!(config.instance_capacities().is_err());
    }
}
