//! File type detection for served media

/// Subtitle formats players load next to a video.
const SUBTITLE_EXTENSIONS: [&str; 6] = [".srt", ".sub", ".vtt", ".smi", ".ssa", ".ass"];

/// Whether `name` looks like a video file.
pub fn is_video_file(name: &str) -> bool {
    mime_guess::from_path(name)
        .first()
        .is_some_and(|mime| mime.essence_str().starts_with("video/"))
}

/// Whether `name` looks like a subtitle file.
pub fn is_subtitle_file(name: &str) -> bool {
    let name = name.to_lowercase();
    SUBTITLE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Content type to stream `name` with.
///
/// Every video container is announced as `video/mp4`; other files keep
/// their guessed type.
pub fn streaming_mime_type(name: &str) -> String {
    match mime_guess::from_path(name).first() {
        Some(mime) if mime.essence_str().starts_with("video/") => "video/mp4".to_string(),
        Some(mime) => mime.essence_str().to_string(),
        None => "application/octet-stream".to_string(),
    }
}
