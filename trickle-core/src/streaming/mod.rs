//! Stream lifecycle and response planning.
//!
//! The registry tracks which torrents are being watched and by how many
//! streams, sizing each torrent's piece cache accordingly and reclaiming
//! torrents nobody watches. The window planner decides how much of a file
//! one response may carry, and the body adapter turns an engine range read
//! into a pull-driven byte stream that keeps its stream alive.

pub mod body;
pub mod info;
pub mod registry;
pub mod service;
pub mod speed;
pub mod window;

pub use body::StreamBody;
pub use info::{TorrentFileInfo, TorrentInfo};
pub use registry::{Stream, StreamRegistry};
pub use service::{OpenStream, StreamingService};
pub use speed::{SpeedHistory, SpeedSample};
pub use window::{RangeRequest, WindowPlan, plan_window};

use crate::engine::{EngineError, InfoHash};

/// Errors surfaced to the HTTP layer by streaming operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    #[error("Torrent {info_hash} is not registered")]
    NotRegistered { info_hash: InfoHash },

    #[error("Requested range starts past end of file ({file_length} bytes)")]
    OutOfRange { file_length: u64 },

    #[error("File {index} not found in torrent")]
    FileNotFound { index: usize },

    #[error("Read failed mid-stream: {reason}")]
    ReadFailure { reason: String },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

pub type StreamingResult<T> = Result<T, StreamingError>;
