//! SQLite credential store.
//!
//! Persists identities (stable `sub_id`, rotating secret, status, cumulative
//! traffic) and the per-secret traffic cursor. Every mutation is a single
//! statement or a short transaction, so the store is the synchronization
//! point between the HTTP handlers and the background loops.

mod db;
mod models;
mod queries;
mod queries_traffic;


pub use db::{Database, DatabaseError};
pub use models::*;
pub use queries_traffic::counter_delta;
