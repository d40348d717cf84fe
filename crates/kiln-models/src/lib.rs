//! Model implementations for Kiln.
//!
//! This crate provides concrete implementations of the `TrainableModel` trait.
//!
//! # Supported Models
//!
//! - **Linear**: dense `y = W x + b` with analytic gradients and emulated
//!   reduced-precision arithmetic

pub mod factory;
pub mod linear;

pub use factory::{build_model, ModelKind, ModelSpec};
pub use linear::LinearModel;
