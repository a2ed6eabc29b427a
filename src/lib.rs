pub mod common;
pub mod expr;
pub mod ir;
pub mod lowering;
pub mod pprint;
pub mod scheduling;
pub mod strategies;
pub mod target;
pub mod tuning;
pub mod utils;
