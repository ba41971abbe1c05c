use crate::internal::attrs::{AttrRecord, names};
use crate::internal::capacity::amount::ResourceAmount;
use crate::internal::common::Map;
use serde::{Deserialize, Serialize};

/// The quantities of every named asset held by a slot: cpus, memory and
/// disk plus the open-ended set of configured custom resources.
///
/// Asset names are case-sensitive and fixed at configuration time; every
/// pool derived from the same machine carries the same key set so that
/// carve/coalesce arithmetic is total.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetPool {
    assets: Map<String, ResourceAmount>,
}

impl AssetPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_standard(
        cpus: ResourceAmount,
        memory: ResourceAmount,
        disk: ResourceAmount,
    ) -> Self {
        let mut pool = AssetPool::new();
        pool.set(names::CPUS, cpus);
        pool.set(names::MEMORY, memory);
        pool.set(names::DISK, disk);
        pool
    }

    pub fn set(&mut self, name: &str, amount: ResourceAmount) {
        self.assets.insert(name.to_string(), amount);
    }

    pub fn get(&self, name: &str) -> ResourceAmount {
        self.assets.get(name).copied().unwrap_or(ResourceAmount::ZERO)
    }

    pub fn asset_names(&self) -> impl Iterator<Item = &String> {
        self.assets.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ResourceAmount)> {
        self.assets.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.values().all(|a| a.is_zero())
    }

    /// True iff every asset of `other` fits into this pool.
    pub fn contains(&self, other: &AssetPool) -> bool {
        other.iter().all(|(name, amount)| self.get(name) >= *amount)
    }

    /// Moves `other` out of this pool. Panics if any asset would go
    /// negative; callers must check with [`AssetPool::contains`] first
    /// (a negative quantity is an invariant violation).
    pub fn subtract(&mut self, other: &AssetPool) {
        for (name, amount) in other.iter() {
            let have = self.get(name);
            let left = have.checked_sub(*amount).unwrap_or_else(|| {
                panic!("asset '{name}' would go negative ({have} - {amount})")
            });
            self.assets.insert(name.clone(), left);
        }
    }

    /// Returns `other` into this pool (inverse of [`AssetPool::subtract`]).
    pub fn add(&mut self, other: &AssetPool) {
        for (name, amount) in other.iter() {
            let have = self.get(name);
            self.assets.insert(name.clone(), have + *amount);
        }
    }

    /// Tracks per-asset maxima; used for the slot's peak-usage record.
    pub fn track_peak(&mut self, observed: &AssetPool) {
        for (name, amount) in observed.iter() {
            let have = self.get(name);
            if *amount > have {
                self.assets.insert(name.clone(), *amount);
            }
        }
    }

    /// Writes every asset quantity into an attribute record. Whole-unit
    /// quantities publish as integers, quantized ones as reals.
    pub fn publish(&self, record: &mut AttrRecord) {
        for (name, amount) in self.iter() {
            if amount.is_whole() {
                record.set(name, amount.whole_units() as i64);
            } else {
                record.set(name, amount.as_f64());
            }
        }
    }
}
