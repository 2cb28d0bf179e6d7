//! HTTP request handlers organized by functionality

pub mod file;
pub mod torrents;

// Re-export handler functions
pub use file::{FileQuery, stream_file};
pub use torrents::{list_torrents, remove_torrent, torrent_details};
