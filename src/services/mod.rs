//! Core synchronization services.
//!
//! - `cache`: generic keyed fetch coordinator
//! - `pr_store`: pull request cache with merge semantics
//! - `mutations`: optimistic mutation layer
//! - `linker`: external tracker cross-referencing
//! - `activity`: derived event feed
//! - `repo_meta`: org member / label / branch stores
//! - `github_client`, `tracker_client`: typed remote API wrappers

pub mod activity;
pub mod cache;
pub mod github_client;
pub mod linker;
pub mod mutations;
pub mod pr_store;
pub mod repo_meta;
pub mod tracker_client;
