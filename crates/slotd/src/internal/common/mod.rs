pub(crate) mod data_structures;
pub(crate) mod error;
pub(crate) mod ids;
#[macro_use]
pub mod index;

pub use data_structures::Map;
