//! Request-interception cache.
//!
//! Every outgoing request is classified and served with one of three
//! strategies:
//! - static assets: cache-first, never touched by write traffic
//! - calendar/task reads: network-first, last good response or a synthesized
//!   empty `offline` result when the network is gone
//! - everything else: network-first, cache as best effort
//!
//! Buckets carry the engine version in their name; starting a new version
//! drops the old buckets wholesale.

mod layer;
mod policy;
mod storage;
mod traits;
mod worker;

pub use layer::{CacheEngine, OFFLINE_BODY};
pub use policy::{Buckets, Classifier, RequestClass};
pub use storage::{request_key, CachedResponse, ResponseStore, SqliteResponseStore};
pub use traits::{CacheResult, CacheSource};
pub use worker::EngineHandle;
