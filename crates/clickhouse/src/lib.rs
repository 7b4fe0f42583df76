//! ClickHouse client and columnar store for the jobs engine.

pub mod client;
pub mod config;
pub mod health;
pub mod insert;
pub mod schema;
pub mod store;

pub use client::*;
pub use config::*;
pub use store::*;
