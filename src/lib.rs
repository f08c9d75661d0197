//! Keeps a local SQLite mirror of a read-mostly remote API fresh.
//!
//! Remote data is split into sections. Each section of each owner has a
//! status recording when it was last refreshed; a section is fetched again
//! only once its freshness window has passed, at most one fetch per section
//! runs at a time, and unchanged data is never rewritten.

pub mod app;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod event;
pub mod refresh;
pub mod remote;
pub mod status;
