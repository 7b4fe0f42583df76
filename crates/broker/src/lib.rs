//! Broker channel, dead-letter queue, and lease store for the jobs engine.

pub mod broker;
pub mod config;
pub mod health;
pub mod lease;
pub mod memory;

pub use broker::*;
pub use config::*;
pub use lease::*;
pub use memory::*;
