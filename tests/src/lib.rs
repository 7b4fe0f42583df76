//! Shared setup for the jobs engine integration tests.

pub mod fixtures;
pub mod mocks;
pub mod setup;
