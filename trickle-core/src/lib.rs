//! Trickle Core - Piece caching and stream lifecycle for torrent streaming
//!
//! This crate keeps a bounded window of downloaded pieces in memory per
//! torrent, sizes that window from the number of active viewers, plans the
//! byte range each HTTP response may serve, and reclaims torrents once
//! nobody is watching them. The BitTorrent engine itself sits behind the
//! narrow capability traits in [`engine`].

pub mod cache;
pub mod config;
pub mod engine;
pub mod streaming;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use cache::{PieceCache, RecencyCache};
pub use config::TrickleConfig;
pub use engine::{EngineError, InfoHash, PieceIndex, TorrentEngine, TorrentHandle};
pub use streaming::{StreamRegistry, StreamingError, StreamingService};

/// Core errors that can bubble up from any Trickle subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TrickleError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrickleError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            TrickleError::Engine(e) => match e {
                EngineError::AddTimeout { .. } => "Failed to add torrent.".to_string(),
                EngineError::InvalidUri { uri } => format!("Invalid torrent URI: {uri}"),
                _ => "Torrent engine error occurred".to_string(),
            },
            TrickleError::Streaming(e) => match e {
                StreamingError::NotRegistered { .. } => "Torrent not found.".to_string(),
                StreamingError::FileNotFound { .. } => "File not found in torrent.".to_string(),
                StreamingError::OutOfRange { file_length } => {
                    format!("Requested range not satisfiable (file length {file_length})")
                }
                _ => "Streaming error occurred".to_string(),
            },
            TrickleError::Configuration { reason } => format!("Invalid configuration: {reason}"),
            TrickleError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            TrickleError::Configuration { .. }
                | TrickleError::Engine(EngineError::InvalidUri { .. })
                | TrickleError::Streaming(StreamingError::OutOfRange { .. })
                | TrickleError::Streaming(StreamingError::FileNotFound { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, TrickleError>;
