pub mod utils;

mod lifecycle;
