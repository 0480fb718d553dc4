pub mod decoder;
pub mod engine;
pub mod output;
pub mod resample;

pub use decoder::SymphoniaBackend;
pub use engine::{spawn_player, PlayerHandle, PlayerSettings};

use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackStatus {
    Idle,
    Loading,
    Playing,
    Paused,
    Seeking,
    Stopped,
}

impl PlaybackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackStatus::Idle => "idle",
            PlaybackStatus::Loading => "loading",
            PlaybackStatus::Playing => "playing",
            PlaybackStatus::Paused => "paused",
            PlaybackStatus::Seeking => "seeking",
            PlaybackStatus::Stopped => "stopped",
        }
    }
}

/// The one "now playing" record. Only the engine task writes it; everyone else gets snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackState {
    pub status: PlaybackStatus,
    pub current_track_id: Option<String>,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub volume: f32,
}

impl PlaybackState {
    pub fn new(volume: f32) -> Self {
        Self {
            status: PlaybackStatus::Idle,
            current_track_id: None,
            position_ms: 0,
            duration_ms: 0,
            volume: volume.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlayerEvent {
    StateChanged {
        status: PlaybackStatus,
        track_id: Option<String>,
    },
    /// Reached the end of the track. The engine does not advance on its own.
    TrackEnded { track_id: String },
    TrackFailed { track_id: String, error: String },
}

/// Opens decodable audio. Implementations may block; the engine calls them off the async
/// executor.
pub trait AudioBackend: Send + Sync {
    fn open(&self, path: &Path, volume: f32) -> Result<Box<dyn Playback>>;
}

/// One opened track. Dropping it releases the stream and any device resources.
pub trait Playback: Send {
    fn duration_ms(&self) -> Option<u64>;

    /// True decoded position, not an estimate from elapsed ticks.
    fn position_ms(&self) -> u64;

    fn is_finished(&self) -> bool;

    /// Error that stopped decoding mid-track, if any.
    fn error(&self) -> Option<String>;

    fn play(&mut self);

    fn pause(&mut self);

    /// Repositions the stream and returns the position actually reached.
    fn seek(&mut self, position_ms: u64) -> Result<u64>;

    fn set_volume(&mut self, volume: f32);
}
