use derive_more::{Add, AddAssign, Sub, SubAssign, Sum};
use serde::{Deserialize, Serialize};

pub type ResourceUnits = u32;
pub type ResourceFractions = u32;

pub const FRACTIONS_PER_UNIT: ResourceFractions = 10_000;

/// Fixed-point quantity of a slot asset.
///
/// Quantities are whole units unless a consumption policy explicitly
/// quantizes a request into fractions; keeping them fixed-point makes the
/// deduct/restore round trip exact.
#[derive(
    Debug,
    Serialize,
    Clone,
    Copy,
    Hash,
    Eq,
    Deserialize,
    PartialEq,
    Ord,
    PartialOrd,
    AddAssign,
    SubAssign,
    Sub,
    Add,
    Sum,
)]
pub struct ResourceAmount(u64);

impl ResourceAmount {
    pub const ZERO: ResourceAmount = ResourceAmount(0);

    pub fn new(units: ResourceUnits, fractions: ResourceFractions) -> Self {
        assert!(fractions < FRACTIONS_PER_UNIT);
        ResourceAmount(units as u64 * FRACTIONS_PER_UNIT as u64 + fractions as u64)
    }

    pub fn units(units: ResourceUnits) -> Self {
        ResourceAmount(units as u64 * FRACTIONS_PER_UNIT as u64)
    }

    pub fn from_f64(value: f64) -> Self {
        assert!(value >= 0.0);
        ResourceAmount((value * FRACTIONS_PER_UNIT as f64).round() as u64)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn whole_units(&self) -> ResourceUnits {
        (self.0 / (FRACTIONS_PER_UNIT as u64)) as ResourceUnits
    }

    pub fn fractions(&self) -> ResourceFractions {
        (self.0 % (FRACTIONS_PER_UNIT as u64)) as ResourceFractions
    }

    pub fn is_whole(&self) -> bool {
        self.fractions() == 0
    }

    pub fn checked_sub(&self, other: ResourceAmount) -> Option<ResourceAmount> {
        self.0.checked_sub(other.0).map(ResourceAmount)
    }

    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / FRACTIONS_PER_UNIT as f64
    }
}

impl std::fmt::Display for ResourceAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let fractions = self.fractions();
        write!(f, "{}", self.whole_units())?;
        if fractions != 0 {
            let num = format!("{fractions:04}");
            write!(f, ".{}", num.trim_end_matches('0'))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_arithmetic() {
        let a = ResourceAmount::units(4);
        let b = ResourceAmount::new(1, 2500);
        assert_eq!(a + b, ResourceAmount::new(5, 2500));
        assert_eq!(a.checked_sub(b), Some(ResourceAmount::new(2, 7500)));
        assert_eq!(b.checked_sub(a), None);
        assert_eq!(a.checked_sub(a), Some(ResourceAmount::ZERO));
    }

    #[test]
    fn test_amount_from_f64_round_trip() {
        let a = ResourceAmount::from_f64(0.25);
        assert_eq!(a, ResourceAmount::new(0, 2500));
        assert_eq!(a.as_f64(), 0.25);
        assert!(!a.is_whole());
        assert!(ResourceAmount::units(3).is_whole());
    }

    #[test]
    fn test_amount_display() {
        assert_eq!(ResourceAmount::units(0).to_string(), "0");
        assert_eq!(ResourceAmount::new(500, 123).to_string(), "500.0123");
        assert_eq!(ResourceAmount::new(1, 1000).to_string(), "1.1");
    }
}
