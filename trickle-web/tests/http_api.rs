//! Router tests for the streaming endpoint and the torrent API.
//!
//! Requests go through the full axum router via `oneshot`, backed by the
//! in-memory engine.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use serde_json::Value;
use tower::ServiceExt;
use trickle_core::config::TrickleConfig;
use trickle_core::engine::memory::{MemoryEngine, MemoryTorrent};
use trickle_core::engine::TorrentHandle;
use trickle_core::StreamingService;
use trickle_web::{AppState, router};

const PIECE: u64 = 16 * 1024;
const URI: &str = "magnet:?xt=urn:btih:show";

struct ApiFixture {
    app: Router,
    service: StreamingService,
    torrent: Arc<MemoryTorrent>,
}

impl ApiFixture {
    /// One torrent with a 32-piece video and a subtitle, eight pieces per window.
    fn new() -> Self {
        let torrent = MemoryTorrent::new(
            "Show",
            PIECE,
            vec![
                ("Show/Episode 1.mkv".to_string(), Bytes::from(vec![9u8; (32 * PIECE) as usize])),
                ("Show/Episode 1.srt".to_string(), Bytes::from_static(b"1\n00:00:01,000 --> 00:00:02,000\nHi\n")),
                ("Show/notes.txt".to_string(), Bytes::from_static(b"release notes")),
            ],
        );
        let engine = Arc::new(MemoryEngine::new());
        engine.insert(URI, Arc::clone(&torrent));

        let mut config = TrickleConfig::for_testing();
        config.streaming.memory_limit = 16 * PIECE;
        let service = StreamingService::new(config, engine);

        Self {
            app: router(AppState {
                service: service.clone(),
            }),
            service,
            torrent,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn get_file(&self, query: &str, range: Option<&str>) -> Response {
        let mut request = Request::get(format!("/api/file/{}?{query}", urlencoding::encode(URI)));
        if let Some(range) = range {
            request = request.header(header::RANGE, range);
        }
        self.send(request.body(Body::empty()).unwrap()).await
    }

    fn hash(&self) -> String {
        self.torrent.info_hash().to_string()
    }
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_missing_stream_id_is_bad_request() {
    let fixture = ApiFixture::new();

    let response = fixture.get_file("f=0", None).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "Missing stream ID.");
}

#[tokio::test]
async fn test_invalid_file_index_is_bad_request() {
    let fixture = ApiFixture::new();

    let response = fixture.get_file("s=viewer&f=first", None).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "Missing file index.");
}

#[tokio::test]
async fn test_unknown_file_is_not_found() {
    let fixture = ApiFixture::new();

    let response = fixture.get_file("s=viewer&f=7", None).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"], "File not found in torrent.");
}

#[tokio::test]
async fn test_range_past_end_is_not_satisfiable() {
    let fixture = ApiFixture::new();
    let length = 32 * PIECE;

    let response = fixture
        .get_file("s=viewer&f=0", Some(&format!("bytes={length}-")))
        .await;

    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE],
        format!("bytes */{length}")
    );
}

#[tokio::test]
async fn test_full_request_serves_first_window() {
    let fixture = ApiFixture::new();

    let response = fixture.get_file("s=viewer&f=0", None).await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let headers = response.headers().clone();
    let window = 8 * PIECE;
    assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
    assert_eq!(
        headers[header::CONTENT_RANGE],
        format!("bytes 0-{}/{}", window - 1, 32 * PIECE)
    );
    assert_eq!(headers[header::CONTENT_LENGTH], window.to_string());
    assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        "inline; filename*=UTF-8''Episode%201.mkv"
    );

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.len() as u64, window);
}

#[tokio::test]
async fn test_explicit_range_is_honored() {
    let fixture = ApiFixture::new();

    let response = fixture.get_file("s=viewer&f=2", Some("bytes=8-")).await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 8-12/13");
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"notes");
}

#[tokio::test(start_paused = true)]
async fn test_unknown_torrent_fails_to_add() {
    let fixture = ApiFixture::new();

    let response = fixture
        .get("/api/file/magnet%3A%3Fxt%3Durn%3Abtih%3Amissing?s=viewer&f=0")
        .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(response).await["error"], "Failed to add torrent.");
}

#[tokio::test]
async fn test_torrent_listing_flags_media_files() {
    let fixture = ApiFixture::new();
    fixture.get_file("s=viewer&f=0", Some("bytes=0-99")).await;

    let response = fixture.get("/api/torrents").await;

    assert_eq!(response.status(), StatusCode::OK);
    let torrents = json_body(response).await;
    let torrent = &torrents[0];
    assert_eq!(torrent["name"], "Show");
    assert_eq!(torrent["info_hash"], fixture.hash());
    assert_eq!(torrent["streams"], 1);

    let files = torrent["files"].as_array().unwrap();
    assert_eq!(files.len(), 3);
    assert_eq!(files[0]["is_video"], true);
    assert_eq!(files[0]["streams"], 1);
    assert_eq!(files[1]["is_subtitle"], true);
    assert_eq!(files[1]["is_video"], false);
    assert_eq!(files[2]["streams"], 0);
}

#[tokio::test]
async fn test_torrent_details_and_removal() {
    let fixture = ApiFixture::new();
    let path = format!("/api/torrents/{}", fixture.hash());

    assert_eq!(fixture.get(&path).await.status(), StatusCode::NOT_FOUND);

    fixture.service.open_torrent(URI).await.unwrap();
    let details = json_body(fixture.get(&path).await).await;
    assert_eq!(details["size"], 32 * PIECE + 35 + 13);

    let response = fixture
        .send(Request::delete(&path).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(fixture.torrent.is_destroyed());
    assert_eq!(fixture.get(&path).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_info_hash_is_bad_request() {
    let fixture = ApiFixture::new();

    let response = fixture.get("/api/torrents/xyz").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
