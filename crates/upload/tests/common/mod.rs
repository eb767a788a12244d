//! Shared test infrastructure for upload tests.

pub mod harness;
pub mod mocks;
