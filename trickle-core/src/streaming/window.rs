//! Byte window planning for ranged file requests
//!
//! A client asking for `bytes=0-` would otherwise have the whole file
//! buffered for it. The planner caps each response at what one stream's
//! share of the piece cache can hold, ending on a piece boundary, and lets
//! the client come back with a follow-up range for the next window.

use super::StreamingError;
use crate::engine::TorrentFile;

/// Byte range requested by a client, before it is fitted to a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeRequest {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl RangeRequest {
    /// Requests the whole file.
    pub fn full() -> Self {
        Self::default()
    }

    /// Parses a `Range` header value such as `bytes=100-199`.
    ///
    /// Only the first range of a list is honored. A missing or malformed
    /// start means "from the beginning" and a missing or malformed end
    /// means "to the end of the file".
    ///
    /// # Examples
    /// ```
    /// use trickle_core::streaming::RangeRequest;
    ///
    /// let request = RangeRequest::parse(Some("bytes=500-"));
    /// assert_eq!(request.start, Some(500));
    /// assert_eq!(request.end, None);
    /// ```
    pub fn parse(header: Option<&str>) -> Self {
        let Some(header) = header else {
            return Self::full();
        };

        let ranges = header.trim();
        let ranges = ranges.strip_prefix("bytes=").unwrap_or(ranges);
        let first = ranges.split(',').next().unwrap_or_default().trim();

        let (start, end) = match first.split_once('-') {
            Some((start, end)) => (start, Some(end)),
            None => (first, None),
        };

        Self {
            start: start.trim().parse().ok(),
            end: end.and_then(|end| end.trim().parse().ok()),
        }
    }
}

/// Byte range actually served for one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlan {
    /// First byte served, inclusive
    pub start: u64,
    /// Last byte served, inclusive
    pub end: u64,
    /// Full length of the file
    pub file_length: u64,
}

impl WindowPlan {
    /// Number of bytes in the window.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Windows always hold at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value for the `Content-Range` response header.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.file_length)
    }
}

/// Fits `request` to `file` and caps it to one stream's memory share.
///
/// The window runs to the end of the piece holding `start`, plus
/// `memory_limit / piece_length / 2 - 1` further pieces, matching the piece
/// cache's halved per-stream capacity with one slot held back.
///
/// # Errors
///
/// - `StreamingError::OutOfRange` - If the start offset is at or past the end of the file
pub fn plan_window(
    file: &TorrentFile,
    piece_length: u64,
    memory_limit: u64,
    request: &RangeRequest,
) -> Result<WindowPlan, StreamingError> {
    let file_length = file.length;
    let start = request.start.unwrap_or(0);

    if start >= file_length {
        return Err(StreamingError::OutOfRange { file_length });
    }

    let last_byte = file_length - 1;
    let mut end = request.end.map_or(last_byte, |end| end.min(last_byte));
    // An inverted range is served from its start to the end of the file.
    if end < start {
        end = last_byte;
    }

    let piece_length = piece_length.max(1);
    let start_byte = file.offset + start;
    let start_piece = start_byte / piece_length;
    let bytes_until_next_piece = (start_piece + 1) * piece_length - start_byte;
    let buffer_pieces = (memory_limit / piece_length / 2).saturating_sub(1);
    let max_window = bytes_until_next_piece + buffer_pieces * piece_length;

    if end - start + 1 > max_window {
        end = (start + max_window - 1).min(last_byte);
    }

    Ok(WindowPlan {
        start,
        end,
        file_length,
    })
}
