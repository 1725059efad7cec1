mod buffers;
pub mod engine;
mod kernels;
mod matrices;
mod model;
mod patterns;
mod scaling;

pub use engine::{LikelihoodEngine, NodeKind, Operation};
