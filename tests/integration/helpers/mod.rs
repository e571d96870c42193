//! Helper utilities for integration tests.

pub mod assertions;
pub mod runner;

pub use assertions::*;
pub use runner::*;
