//! # Cap Engine Common Library
//!
//! Shared code for the cap-level engine crates:
//! - Database schema, migrations and row models
//! - Cap level (tier) enum and ordering
//! - Engine event types and the EventBus
//! - Root folder / configuration file resolution
//! - SSE helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod sse;
pub mod tier;
pub mod time;

pub use error::{Error, Result};
pub use tier::CapLevel;
