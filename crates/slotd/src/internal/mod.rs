pub mod attrs;
pub mod capacity;
pub mod comm;
pub mod common;
pub mod eval;
pub mod manager;
pub mod messages;
pub mod slot;

#[cfg(test)]
pub mod tests;
