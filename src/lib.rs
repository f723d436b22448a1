//! Client-side synchronization and caching layer for a desktop PR review app.
//!
//! The UI shell is an external collaborator: it constructs one [`SyncSession`]
//! at login, calls its fetch and mutation entry points, and renders whatever
//! the cache stores expose. This crate owns the cache semantics: freshness
//! windows, in-flight fetch deduplication, optimistic mutations with
//! reconciliation, tracker issue cross-referencing, the derived activity
//! feed, and the persisted settings store.

pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod session;

pub use error::SyncError;
pub use session::SyncSession;
