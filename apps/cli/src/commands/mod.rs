//! Command implementations for the Kiln CLI.

pub mod checkpoints;
pub mod compare;
pub mod metrics;
pub mod train;
