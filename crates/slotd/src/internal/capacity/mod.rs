pub mod amount;
pub mod consumption;
pub mod partition;
pub mod pool;

pub use amount::{FRACTIONS_PER_UNIT, ResourceAmount, ResourceFractions, ResourceUnits};
pub use consumption::{Consumption, compute_consumption, deduct_assets, sufficient_assets};
pub use partition::{PartitionError, carve_quantities};
pub use pool::AssetPool;
