//! JSON API over registered torrents

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde_json::{Value, json};
use trickle_core::InfoHash;
use trickle_core::streaming::TorrentInfo;

use crate::error::WebError;
use crate::media::{is_subtitle_file, is_video_file};
use crate::server::AppState;

/// Lists registered torrents, most recently added first.
///
/// # Errors
///
/// Answers 500 if a snapshot cannot be serialized.
pub async fn list_torrents(State(state): State<AppState>) -> Result<Json<Value>, WebError> {
    let torrents = state
        .service
        .list_torrents()
        .iter()
        .map(torrent_json)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(Value::Array(torrents)))
}

/// Returns one registered torrent.
///
/// # Errors
///
/// Answers 400 for a malformed info hash and 404 if it is not registered.
pub async fn torrent_details(
    State(state): State<AppState>,
    Path(info_hash): Path<String>,
) -> Result<Json<Value>, WebError> {
    let info_hash = parse_info_hash(&info_hash)?;
    let info = state.service.torrent_info(info_hash)?;
    Ok(Json(torrent_json(&info)?))
}

/// Destroys a torrent and stops tracking it.
///
/// # Errors
///
/// Answers 400 for a malformed info hash, 404 if it is not registered and
/// 500 if the engine fails to destroy it.
pub async fn remove_torrent(
    State(state): State<AppState>,
    Path(info_hash): Path<String>,
) -> Result<StatusCode, WebError> {
    let info_hash = parse_info_hash(&info_hash)?;
    state.service.remove_torrent(info_hash).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_info_hash(value: &str) -> Result<InfoHash, WebError> {
    InfoHash::from_hex(value).map_err(|_| WebError::InvalidInfoHash {
        value: value.to_string(),
    })
}

/// Snapshot JSON with media flags added to every file.
fn torrent_json(info: &TorrentInfo) -> Result<Value, WebError> {
    let mut value = serde_json::to_value(info).map_err(|e| WebError::Response {
        reason: e.to_string(),
    })?;

    if let Some(files) = value.get_mut("files").and_then(Value::as_array_mut) {
        for (file, entry) in info.files.iter().zip(files.iter_mut()) {
            if let Some(entry) = entry.as_object_mut() {
                entry.insert("is_video".to_string(), json!(is_video_file(&file.name)));
                entry.insert("is_subtitle".to_string(), json!(is_subtitle_file(&file.name)));
            }
        }
    }

    Ok(value)
}
