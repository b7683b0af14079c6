//! Availability and conflict scheduling engine for appointment-based businesses.
//!
//! The [`engine::Engine`] validates booking requests, resolves staff availability
//! (working hours, one-off and recurring exceptions) and reserves time atomically
//! against a [`store::Store`], so that no two active bookings of the same staff
//! member or resource ever overlap.

pub mod compactor;
pub mod config;
pub mod directory;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod store;
pub mod wal;

pub use config::EngineConfig;
pub use engine::{Engine, EngineError};
pub use model::*;
