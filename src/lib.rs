//! Offline-first synchronization of calendar events and tasks.
//!
//! Reads go network-first and fall back to a local SQLite store; writes made
//! while offline are queued durably and replayed in order once connectivity
//! returns.

pub mod agenda;
pub mod api;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod logging;
pub mod store;
pub mod sync;
pub mod transport;

#[cfg(test)]
mod testing;

pub use agenda::{Agenda, WriteOutcome};
pub use error::ApiError;
