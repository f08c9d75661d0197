//! Remote side: HTTP transport and HTTP-backed sections.

mod client;
mod section;

pub use client::{CachedHttpClient, RemoteResponse, PAGES_HEADER};
pub use section::HttpSection;
