//! Ranged file streaming endpoint

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use serde::Deserialize;
use trickle_core::streaming::{OpenStream, RangeRequest};

use crate::error::WebError;
use crate::media::streaming_mime_type;
use crate::server::AppState;

/// Query string of a file request.
#[derive(Debug, Deserialize)]
pub struct FileQuery {
    /// Client-chosen stream id, stable across the windows of one playback
    pub s: Option<String>,
    /// Index of the file within the torrent
    pub f: Option<String>,
}

impl FileQuery {
    fn stream_id(&self) -> Result<&str, WebError> {
        self.s
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(WebError::MissingStreamId)
    }

    fn file_index(&self) -> Result<usize, WebError> {
        self.f
            .as_deref()
            .and_then(|index| index.trim().parse().ok())
            .ok_or(WebError::InvalidFileIndex)
    }
}

/// Streams one window of a torrent file.
///
/// `uri` is the percent-encoded torrent URI. The response always is a 206
/// covering at most one stream's memory share; clients follow up with a
/// range starting after the last byte they received.
///
/// # Errors
///
/// Answers 400 for a bad query, 404 for an unknown file, 416 for a range past
/// the end and 500 when the torrent cannot be added.
pub async fn stream_file(
    State(state): State<AppState>,
    Path(uri): Path<String>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> Result<Response, WebError> {
    let stream_id = query.stream_id()?;
    let file_index = query.file_index()?;
    let request = RangeRequest::parse(
        headers
            .get(header::RANGE)
            .and_then(|value| value.to_str().ok()),
    );

    let OpenStream { file, plan, body } = state
        .service
        .open_stream(&uri, stream_id, file_index, &request)
        .await?;

    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_RANGE, plan.content_range())
        .header(header::CONTENT_LENGTH, plan.len().to_string())
        .header(header::CONTENT_TYPE, streaming_mime_type(&file.name))
        .header(
            header::CONTENT_DISPOSITION,
            format!("inline; filename*=UTF-8''{}", urlencoding::encode(&file.name)),
        )
        .body(Body::from_stream(body))
        .map_err(|e| WebError::Response {
            reason: e.to_string(),
        })
}
