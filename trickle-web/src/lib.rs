//! Trickle Web - HTTP streaming server

#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
//!
//! Serves torrent files as ranged, memory-bounded HTTP responses and exposes
//! a small JSON API for listing and removing watched torrents.

pub mod error;
pub mod handlers;
pub mod media;
pub mod server;

// Re-export main types
pub use error::WebError;
pub use server::{AppState, router, run_server};
