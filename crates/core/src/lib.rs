//! Core types, errors, and validation for the jobs engine.

pub mod error;
pub mod limits;
pub mod record;
pub mod retry;
pub mod schedule;
pub mod task;

pub use error::{Error, Result};
pub use record::*;
pub use retry::*;
pub use schedule::*;
pub use task::*;
