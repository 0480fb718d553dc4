//! The playback engine task.
//!
//! One task owns [`PlaybackState`] and the open [`Playback`]. Commands arrive over a single mpsc
//! channel and are applied one at a time, so nothing inside the engine needs a lock. The loop
//! waits on whichever comes first: a command, the pending load, or the next tick.

use super::{AudioBackend, Playback, PlaybackState, PlaybackStatus, PlayerEvent};
use crate::config::AppConfig;
use crate::downloader::cache::ContentCache;
use crate::errors::{AppError, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub struct PlayerSettings {
    pub tick_interval: Duration,
    pub volume_step: f32,
    pub seek_step_ms: u64,
    pub load_timeout: Duration,
    pub initial_volume: f32,
}

impl From<&AppConfig> for PlayerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            volume_step: config.volume_step,
            seek_step_ms: config.seek_step_ms,
            load_timeout: config.load_timeout(),
            initial_volume: config.initial_volume,
        }
    }
}

#[derive(Debug)]
enum Command {
    Load(String),
    Play,
    Pause,
    TogglePause,
    Seek(u64),
    SeekBy(i64),
    Stop,
    SetVolume(f32),
    VolumeStep(f32),
    Shutdown,
}

type Reply = oneshot::Sender<Result<()>>;
type LoadFuture = Pin<Box<dyn Future<Output = Result<Box<dyn Playback>>> + Send>>;

/// Cloneable control surface for the engine task.
#[derive(Clone)]
pub struct PlayerHandle {
    commands: mpsc::Sender<(Command, Reply)>,
    state: watch::Receiver<PlaybackState>,
    events: broadcast::Sender<PlayerEvent>,
    volume_step: f32,
    seek_step_ms: u64,
}

/// Starts the engine task.
pub fn spawn_player(
    settings: PlayerSettings,
    cache: Arc<ContentCache>,
    backend: Arc<dyn AudioBackend>,
) -> (PlayerHandle, JoinHandle<()>) {
    let (commands, rx) = mpsc::channel(64);
    let initial = PlaybackState::new(settings.initial_volume);
    let (snapshot, state) = watch::channel(initial.clone());
    let (events, _) = broadcast::channel(64);

    let handle = PlayerHandle {
        commands,
        state,
        events: events.clone(),
        volume_step: settings.volume_step,
        seek_step_ms: settings.seek_step_ms,
    };
    let engine = Engine {
        settings,
        cache,
        backend,
        state: initial,
        playback: None,
        pending_play: false,
        snapshot,
        events,
    };
    let task = tokio::spawn(engine.run(rx));
    (handle, task)
}

impl PlayerHandle {
    async fn send(&self, command: Command) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send((command, reply))
            .await
            .map_err(|_| AppError::PlayerGone)?;
        response.await.map_err(|_| AppError::PlayerGone)?
    }

    /// Starts loading a track. Returns once the engine has accepted the request; readiness or
    /// failure arrives later as a state change or [`PlayerEvent::TrackFailed`].
    pub async fn load(&self, track_id: &str) -> Result<()> {
        self.send(Command::Load(track_id.to_string())).await
    }

    /// Resumes from `Paused`, or asks a track still `Loading` to start as soon as it is ready.
    pub async fn play(&self) -> Result<()> {
        self.send(Command::Play).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.send(Command::Pause).await
    }

    pub async fn toggle_pause(&self) -> Result<()> {
        self.send(Command::TogglePause).await
    }

    /// Out-of-range positions are clamped into `[0, duration]`.
    pub async fn seek(&self, position_ms: u64) -> Result<()> {
        self.send(Command::Seek(position_ms)).await
    }

    pub async fn seek_by(&self, delta_ms: i64) -> Result<()> {
        self.send(Command::SeekBy(delta_ms)).await
    }

    pub async fn seek_forward(&self) -> Result<()> {
        self.seek_by(self.seek_step_ms as i64).await
    }

    pub async fn seek_backward(&self) -> Result<()> {
        self.seek_by(-(self.seek_step_ms as i64)).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(Command::Stop).await
    }

    pub async fn set_volume(&self, volume: f32) -> Result<()> {
        self.send(Command::SetVolume(volume)).await
    }

    pub async fn volume_up(&self) -> Result<()> {
        self.send(Command::VolumeStep(self.volume_step)).await
    }

    pub async fn volume_down(&self) -> Result<()> {
        self.send(Command::VolumeStep(-self.volume_step)).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }

    pub fn snapshot(&self) -> PlaybackState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PlaybackState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    /// Waits until the published state satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F, timeout: Duration) -> Result<PlaybackState>
    where
        F: FnMut(&PlaybackState) -> bool,
    {
        let mut rx = self.state.clone();
        let result = match tokio::time::timeout(timeout, rx.wait_for(predicate)).await {
            Ok(Ok(state)) => Ok(state.clone()),
            Ok(Err(_)) => Err(AppError::PlayerGone),
            Err(_) => Err(AppError::LoadTimeout("player state".to_string())),
        };
        result
    }
}

struct Engine {
    settings: PlayerSettings,
    cache: Arc<ContentCache>,
    backend: Arc<dyn AudioBackend>,
    state: PlaybackState,
    playback: Option<Box<dyn Playback>>,
    pending_play: bool,
    snapshot: watch::Sender<PlaybackState>,
    events: broadcast::Sender<PlayerEvent>,
}

async fn next_load(pending: &mut Option<LoadFuture>) -> Result<Box<dyn Playback>> {
    match pending.as_mut() {
        Some(load) => load.await,
        None => std::future::pending().await,
    }
}

impl Engine {
    async fn run(mut self, mut commands: mpsc::Receiver<(Command, Reply)>) {
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pending: Option<LoadFuture> = None;
        log::info!("🎧 [PLAYER] Engine started (tick {:?})", self.settings.tick_interval);

        loop {
            let playing = self.state.status == PlaybackStatus::Playing;
            tokio::select! {
                command = commands.recv() => match command {
                    Some((Command::Shutdown, reply)) => {
                        pending = None;
                        self.release().await;
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some((command, reply)) => {
                        log::debug!("🎧 [PLAYER] {:?} while {}", command, self.state.status.as_str());
                        let result = self.handle(command, &mut pending).await;
                        if let Err(e) = &result {
                            log::debug!("🎧 [PLAYER] Rejected: {}", e);
                        }
                        let _ = reply.send(result);
                    }
                    None => {
                        pending = None;
                        self.release().await;
                        break;
                    }
                },
                loaded = next_load(&mut pending) => {
                    pending = None;
                    self.finish_load(loaded).await;
                }
                _ = ticker.tick(), if playing => self.tick().await,
            }
        }
        drop(pending);
        log::info!("🎧 [PLAYER] Engine stopped");
    }

    fn invalid(&self, command: &'static str) -> AppError {
        AppError::InvalidTransition {
            command,
            state: self.state.status.as_str().to_string(),
        }
    }

    async fn handle(&mut self, command: Command, pending: &mut Option<LoadFuture>) -> Result<()> {
        use PlaybackStatus::*;
        match command {
            Command::Load(track_id) => {
                if !matches!(self.state.status, Idle | Stopped) {
                    return Err(self.invalid("load"));
                }
                *pending = Some(self.start_load(track_id.clone()));
                self.pending_play = false;
                self.state.current_track_id = Some(track_id.clone());
                self.state.position_ms = 0;
                self.state.duration_ms = 0;
                log::info!("⏳ [PLAYER] Loading {}", track_id);
                self.set_status(Loading);
                Ok(())
            }
            Command::Play => self.play(),
            Command::Pause => self.pause(),
            Command::TogglePause => match self.state.status {
                Playing => self.pause(),
                Paused => self.play(),
                Loading => {
                    self.pending_play = !self.pending_play;
                    Ok(())
                }
                _ => Err(self.invalid("toggle pause")),
            },
            Command::Seek(position_ms) => self.seek(position_ms),
            Command::SeekBy(delta_ms) => {
                let target = (self.state.position_ms as i64).saturating_add(delta_ms).max(0) as u64;
                self.seek(target)
            }
            Command::Stop => {
                if self.state.status == Idle {
                    return Err(self.invalid("stop"));
                }
                *pending = None;
                self.release().await;
                self.state.position_ms = 0;
                log::info!("⏹️ [PLAYER] Stopped");
                self.set_status(Stopped);
                Ok(())
            }
            Command::SetVolume(volume) => {
                self.apply_volume(volume);
                Ok(())
            }
            Command::VolumeStep(step) => {
                self.apply_volume(self.state.volume + step);
                Ok(())
            }
            // Handled by the run loop.
            Command::Shutdown => Ok(()),
        }
    }

    fn play(&mut self) -> Result<()> {
        match self.state.status {
            PlaybackStatus::Paused => {
                if let Some(playback) = self.playback.as_mut() {
                    playback.play();
                }
                self.set_status(PlaybackStatus::Playing);
                Ok(())
            }
            PlaybackStatus::Loading => {
                self.pending_play = true;
                Ok(())
            }
            PlaybackStatus::Playing | PlaybackStatus::Seeking => Ok(()),
            PlaybackStatus::Idle | PlaybackStatus::Stopped => Err(self.invalid("play")),
        }
    }

    fn pause(&mut self) -> Result<()> {
        if self.state.status != PlaybackStatus::Playing {
            return Err(self.invalid("pause"));
        }
        if let Some(playback) = self.playback.as_mut() {
            playback.pause();
        }
        self.refresh_position();
        self.set_status(PlaybackStatus::Paused);
        Ok(())
    }

    fn start_load(&self, track_id: String) -> LoadFuture {
        let cache = Arc::clone(&self.cache);
        let backend = Arc::clone(&self.backend);
        let timeout = self.settings.load_timeout;
        let volume = self.state.volume;
        Box::pin(async move {
            // Pin first so the entry cannot be evicted between lookup and open.
            cache.pin(&track_id).await;
            let playable = cache.wait_playable(&track_id, timeout).await?;
            tokio::task::spawn_blocking(move || backend.open(&playable.path, volume))
                .await
                .map_err(|e| AppError::Decode(format!("decoder task failed: {}", e)))?
        })
    }

    async fn finish_load(&mut self, loaded: Result<Box<dyn Playback>>) {
        let mut playback = match loaded {
            Ok(playback) => playback,
            Err(e) => {
                self.fail_track(e).await;
                return;
            }
        };

        self.state.duration_ms = playback.duration_ms().unwrap_or(0);
        self.state.position_ms = 0;
        let status = if self.pending_play {
            playback.play();
            PlaybackStatus::Playing
        } else {
            PlaybackStatus::Paused
        };
        self.pending_play = false;
        self.playback = Some(playback);
        log::info!(
            "▶️ [PLAYER] Loaded {} ({} ms)",
            self.state.current_track_id.as_deref().unwrap_or("?"),
            self.state.duration_ms
        );
        self.set_status(status);
    }

    fn seek(&mut self, position_ms: u64) -> Result<()> {
        let prior = self.state.status;
        if !matches!(prior, PlaybackStatus::Playing | PlaybackStatus::Paused) {
            return Err(self.invalid("seek"));
        }
        let target = self.clamp(position_ms);
        self.set_status(PlaybackStatus::Seeking);

        let reached = match self.playback.as_mut() {
            Some(playback) => playback.seek(target),
            None => Ok(target),
        };
        let result = match reached {
            Ok(reached) => {
                self.state.position_ms = self.clamp(reached);
                Ok(())
            }
            Err(e) => {
                log::warn!("⚠️ [PLAYER] Seek failed: {}", e);
                Err(e)
            }
        };
        self.set_status(prior);
        result
    }

    fn clamp(&self, position_ms: u64) -> u64 {
        if self.state.duration_ms > 0 {
            position_ms.min(self.state.duration_ms)
        } else {
            position_ms
        }
    }

    fn apply_volume(&mut self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.state.volume = volume;
        if let Some(playback) = self.playback.as_mut() {
            playback.set_volume(volume);
        }
        self.publish();
    }

    fn refresh_position(&mut self) {
        if let Some(playback) = &self.playback {
            let decoded = self.clamp(playback.position_ms());
            self.state.position_ms = decoded.max(self.state.position_ms);
        }
    }

    async fn tick(&mut self) {
        let (failure, finished) = match &self.playback {
            Some(playback) => (playback.error(), playback.is_finished()),
            None => return,
        };
        if let Some(error) = failure {
            self.fail_track(AppError::Decode(error)).await;
            return;
        }

        // Never behind the last published value while playing.
        self.refresh_position();
        let duration = self.state.duration_ms;
        let reached_end = duration > 0 && self.state.position_ms >= duration;
        if !(finished || reached_end) {
            self.publish();
            return;
        }

        self.state.position_ms = self.state.position_ms.max(duration);
        let track_id = self.state.current_track_id.clone().unwrap_or_default();
        self.release().await;
        log::info!("🏁 [PLAYER] Track ended: {}", track_id);
        self.set_status(PlaybackStatus::Stopped);
        let _ = self.events.send(PlayerEvent::TrackEnded { track_id });
    }

    async fn fail_track(&mut self, error: AppError) {
        let track_id = self.state.current_track_id.clone().unwrap_or_default();
        log::error!("❌ [PLAYER] Track {} failed: {}", track_id, error);
        self.release().await;
        self.pending_play = false;
        self.state.position_ms = 0;
        self.set_status(PlaybackStatus::Stopped);
        let _ = self.events.send(PlayerEvent::TrackFailed {
            track_id,
            error: error.to_string(),
        });
    }

    /// Closes the stream (joining its decode thread) and lets the cache evict the entry again.
    async fn release(&mut self) {
        if let Some(playback) = self.playback.take() {
            let _ = tokio::task::spawn_blocking(move || drop(playback)).await;
        }
        if let Some(track_id) = &self.state.current_track_id {
            self.cache.unpin(track_id).await;
        }
    }

    fn set_status(&mut self, status: PlaybackStatus) {
        let changed = self.state.status != status;
        self.state.status = status;
        self.publish();
        if changed {
            let _ = self.events.send(PlayerEvent::StateChanged {
                status,
                track_id: self.state.current_track_id.clone(),
            });
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.state.clone());
    }
}
