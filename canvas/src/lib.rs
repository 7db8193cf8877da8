pub mod common;
pub mod count;
pub mod expr;
pub mod factory;
pub mod graph;
pub mod netspecs;
pub mod pprint;
pub mod primitive;
pub mod sample;
pub mod shape;
pub mod utils;
