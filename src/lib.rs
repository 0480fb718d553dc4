pub mod api;
pub mod config;
pub mod downloader;
pub mod errors;
pub mod player;
pub mod playlist;
pub mod utils;

pub use api::{SourceRef, TrackInfo};
pub use config::AppConfig;
pub use errors::{AppError, Result};
pub use playlist::{Playlist, PlaylistCommand, PlaylistManager, PlaylistSnapshot};
