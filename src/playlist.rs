//! Playlist state and the manager that turns playlist moves into downloads and player commands.

use crate::api::TrackInfo;
use crate::config::AppConfig;
use crate::downloader::manager::DownloadManager;
use crate::downloader::Priority;
use crate::errors::{AppError, Result};
use crate::player::{PlaybackStatus, PlayerEvent, PlayerHandle};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// What happened to playback when an entry was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    pub was_current: bool,
    pub new_current: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct Playlist {
    tracks: Vec<TrackInfo>,
    current_index: Option<usize>,
    shuffle_enabled: bool,
    /// Every index except the one current when the order was drawn.
    shuffle_order: Vec<usize>,
    /// How much of `shuffle_order` has been played.
    shuffle_pos: usize,
    shuffle_origin: Option<usize>,
    repeat: bool,
}

impl Playlist {
    pub fn new(tracks: Vec<TrackInfo>) -> Self {
        Self {
            tracks,
            ..Self::default()
        }
    }

    pub fn tracks(&self) -> &[TrackInfo] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    pub fn current_track(&self) -> Option<&TrackInfo> {
        self.current_index.and_then(|i| self.tracks.get(i))
    }

    pub fn shuffle_enabled(&self) -> bool {
        self.shuffle_enabled
    }

    pub fn shuffle_order(&self) -> &[usize] {
        &self.shuffle_order
    }

    pub fn repeat(&self) -> bool {
        self.repeat
    }

    pub fn set_repeat(&mut self, repeat: bool) {
        self.repeat = repeat;
    }

    fn reshuffle(&mut self) {
        let mut order: Vec<usize> = (0..self.tracks.len())
            .filter(|i| Some(*i) != self.current_index)
            .collect();
        order.shuffle(&mut rand::thread_rng());
        self.shuffle_order = order;
        self.shuffle_pos = 0;
        self.shuffle_origin = self.current_index;
    }

    pub fn toggle_shuffle(&mut self) -> bool {
        self.shuffle_enabled = !self.shuffle_enabled;
        if self.shuffle_enabled {
            self.reshuffle();
        } else {
            self.shuffle_order.clear();
            self.shuffle_pos = 0;
            self.shuffle_origin = None;
        }
        self.shuffle_enabled
    }

    /// Advances and returns the new current index, or `None` at the end of a non-repeating list.
    pub fn next(&mut self) -> Option<usize> {
        if self.tracks.is_empty() {
            return None;
        }
        if self.shuffle_enabled {
            if self.shuffle_pos >= self.shuffle_order.len() {
                self.reshuffle();
            }
            let index = *self.shuffle_order.get(self.shuffle_pos)?;
            self.shuffle_pos += 1;
            self.current_index = Some(index);
            return self.current_index;
        }

        let next = match self.current_index {
            None => 0,
            Some(i) if i + 1 < self.tracks.len() => i + 1,
            Some(_) if self.repeat => 0,
            Some(_) => return None,
        };
        self.current_index = Some(next);
        self.current_index
    }

    /// Steps back. Under shuffle this retraces the part of the order already played.
    pub fn previous(&mut self) -> Option<usize> {
        if self.tracks.is_empty() {
            return None;
        }
        if self.shuffle_enabled {
            if self.shuffle_pos == 0 {
                return None;
            }
            let back = if self.shuffle_pos >= 2 {
                Some(self.shuffle_order[self.shuffle_pos - 2])
            } else {
                self.shuffle_origin
            };
            let index = back?;
            self.shuffle_pos -= 1;
            self.current_index = Some(index);
            return self.current_index;
        }

        let previous = match self.current_index {
            None => return None,
            Some(i) if i > 0 => i - 1,
            Some(_) if self.repeat => self.tracks.len() - 1,
            Some(_) => return None,
        };
        self.current_index = Some(previous);
        self.current_index
    }

    /// Jumps to `index`. Under shuffle a fresh order is drawn around it.
    pub fn play_index(&mut self, index: usize) -> Result<usize> {
        if index >= self.tracks.len() {
            return Err(AppError::InvalidInput(format!(
                "index {} out of range (playlist has {} tracks)",
                index,
                self.tracks.len()
            )));
        }
        self.current_index = Some(index);
        if self.shuffle_enabled {
            self.reshuffle();
        }
        Ok(index)
    }

    pub fn add(&mut self, track: TrackInfo) -> usize {
        self.tracks.push(track);
        let index = self.tracks.len() - 1;
        if self.shuffle_enabled {
            // Somewhere among the tracks not yet played.
            let remaining = self.shuffle_order.len() - self.shuffle_pos;
            let offset = if remaining == 0 {
                0
            } else {
                rand::random::<usize>() % (remaining + 1)
            };
            self.shuffle_order.insert(self.shuffle_pos + offset, index);
        }
        index
    }

    /// Removes an entry. Removing the current track moves playback to the track that takes its
    /// place (or the next shuffled one); removing the last track wraps only with `repeat`.
    pub fn remove(&mut self, index: usize) -> Result<(TrackInfo, Removal)> {
        if index >= self.tracks.len() {
            return Err(AppError::InvalidInput(format!(
                "index {} out of range (playlist has {} tracks)",
                index,
                self.tracks.len()
            )));
        }
        let track = self.tracks.remove(index);
        let was_current = self.current_index == Some(index);

        if let Some(pos) = self.shuffle_order.iter().position(|i| *i == index) {
            self.shuffle_order.remove(pos);
            if pos < self.shuffle_pos {
                self.shuffle_pos -= 1;
            }
        }
        for i in self.shuffle_order.iter_mut() {
            if *i > index {
                *i -= 1;
            }
        }
        self.shuffle_origin = match self.shuffle_origin {
            Some(o) if o == index => None,
            Some(o) if o > index => Some(o - 1),
            other => other,
        };

        if !was_current {
            if let Some(current) = self.current_index {
                if current > index {
                    self.current_index = Some(current - 1);
                }
            }
            return Ok((
                track,
                Removal {
                    was_current,
                    new_current: self.current_index,
                },
            ));
        }

        let new_current = if self.tracks.is_empty() {
            None
        } else if self.shuffle_enabled {
            self.current_index = None;
            self.next()
        } else if index < self.tracks.len() {
            Some(index)
        } else if self.repeat {
            Some(0)
        } else {
            None
        };
        self.current_index = new_current;
        Ok((
            track,
            Removal {
                was_current,
                new_current,
            },
        ))
    }

    /// Indices `next()` would visit, without moving. Under shuffle only the already-drawn order
    /// is known.
    pub fn upcoming(&self, count: usize) -> Vec<usize> {
        if self.shuffle_enabled {
            return self
                .shuffle_order
                .iter()
                .skip(self.shuffle_pos)
                .take(count)
                .copied()
                .collect();
        }
        let len = self.tracks.len();
        let mut upcoming = Vec::new();
        let mut cursor = self.current_index;
        while upcoming.len() < count.min(len) {
            let next = match cursor {
                None => 0,
                Some(i) if i + 1 < len => i + 1,
                Some(_) if self.repeat => 0,
                Some(_) => break,
            };
            if Some(next) == self.current_index {
                break;
            }
            upcoming.push(next);
            cursor = Some(next);
        }
        upcoming
    }

    pub fn snapshot(&self, upcoming: usize) -> PlaylistSnapshot {
        PlaylistSnapshot {
            tracks: self.tracks.clone(),
            current_index: self.current_index,
            shuffle_enabled: self.shuffle_enabled,
            repeat: self.repeat,
            upcoming: self.upcoming(upcoming),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistSnapshot {
    pub tracks: Vec<TrackInfo>,
    pub current_index: Option<usize>,
    pub shuffle_enabled: bool,
    pub repeat: bool,
    pub upcoming: Vec<usize>,
}

#[derive(Debug)]
pub enum PlaylistCommand {
    Next,
    Previous,
    Add(TrackInfo),
    Remove(usize),
    ToggleShuffle,
    PlayIndex(usize),
    Snapshot(oneshot::Sender<PlaylistSnapshot>),
    Shutdown,
}

/// Owns the playlist and is its only writer. Moving to a track hands it to the player and
/// schedules it plus the next few with the download pool; nothing else here creates jobs.
pub struct PlaylistManager {
    playlist: Playlist,
    player: PlayerHandle,
    player_events: broadcast::Receiver<PlayerEvent>,
    downloads: Arc<DownloadManager>,
    prefetch_count: usize,
    skip_on_failure: bool,
}

impl PlaylistManager {
    pub fn new(
        config: &AppConfig,
        tracks: Vec<TrackInfo>,
        player: PlayerHandle,
        downloads: Arc<DownloadManager>,
    ) -> Self {
        let mut playlist = Playlist::new(tracks);
        playlist.set_repeat(config.repeat);
        Self {
            playlist,
            player_events: player.subscribe(),
            player,
            downloads,
            prefetch_count: config.prefetch_count,
            skip_on_failure: config.skip_on_failure,
        }
    }

    pub fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    pub fn snapshot(&self) -> PlaylistSnapshot {
        self.playlist.snapshot(self.prefetch_count)
    }

    pub async fn next(&mut self) -> Result<Option<usize>> {
        match self.playlist.next() {
            Some(index) => self.start(index).await.map(Some),
            None => {
                log::info!("🏁 [PLAYLIST] End of playlist");
                self.stop_player().await?;
                Ok(None)
            }
        }
    }

    pub async fn previous(&mut self) -> Result<Option<usize>> {
        match self.playlist.previous() {
            Some(index) => self.start(index).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn play_index(&mut self, index: usize) -> Result<usize> {
        let index = self.playlist.play_index(index)?;
        self.start(index).await
    }

    pub async fn add(&mut self, track: TrackInfo) -> Result<usize> {
        log::info!("➕ [PLAYLIST] Added {}", track.display_name());
        Ok(self.playlist.add(track))
    }

    pub async fn remove(&mut self, index: usize) -> Result<TrackInfo> {
        let (track, removal) = self.playlist.remove(index)?;
        log::info!("➖ [PLAYLIST] Removed {}", track.display_name());
        if removal.was_current {
            self.stop_player().await?;
            if let Some(next) = removal.new_current {
                self.start(next).await?;
            }
        }
        Ok(track)
    }

    pub async fn toggle_shuffle(&mut self) -> bool {
        let enabled = self.playlist.toggle_shuffle();
        log::info!("🔀 [PLAYLIST] Shuffle {}", if enabled { "on" } else { "off" });
        enabled
    }

    async fn stop_player(&self) -> Result<()> {
        match self.player.stop().await {
            Ok(()) | Err(AppError::InvalidTransition { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Hands track `index` to the player and schedules it (now-playing) plus the upcoming ones.
    async fn start(&mut self, index: usize) -> Result<usize> {
        let track = self
            .playlist
            .tracks()
            .get(index)
            .cloned()
            .ok_or_else(|| AppError::InvalidInput(format!("no track at {}", index)))?;
        log::info!("▶️ [PLAYLIST] Now playing #{}: {}", index, track.display_name());

        if !matches!(self.player.snapshot().status, PlaybackStatus::Idle | PlaybackStatus::Stopped) {
            self.stop_player().await?;
        }
        self.downloads.schedule(&track, Priority::NowPlaying).await?;
        self.player.load(&track.id).await?;
        self.player.play().await?;
        self.prefetch().await;
        Ok(index)
    }

    async fn prefetch(&self) {
        for index in self.playlist.upcoming(self.prefetch_count) {
            let track = match self.playlist.tracks().get(index) {
                Some(track) => track,
                None => continue,
            };
            if let Err(e) = self.downloads.try_schedule(track, Priority::Prefetch).await {
                log::warn!("⚠️ [PLAYLIST] Prefetch of {} skipped: {}", track.id, e);
            }
        }
    }

    /// Reacts to the player finishing or failing the current track.
    pub async fn handle_player_event(&mut self, event: PlayerEvent) -> Result<()> {
        let current_id = self.playlist.current_track().map(|t| t.id.clone());
        match event {
            PlayerEvent::TrackEnded { track_id } if Some(&track_id) == current_id.as_ref() => {
                self.next().await?;
            }
            PlayerEvent::TrackFailed { track_id, error } if Some(&track_id) == current_id.as_ref() => {
                log::warn!("⚠️ [PLAYLIST] {} failed: {}", track_id, error);
                if self.skip_on_failure {
                    self.next().await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn apply(&mut self, command: PlaylistCommand) -> Result<bool> {
        match command {
            PlaylistCommand::Next => {
                self.next().await?;
            }
            PlaylistCommand::Previous => {
                self.previous().await?;
            }
            PlaylistCommand::Add(track) => {
                self.add(track).await?;
            }
            PlaylistCommand::Remove(index) => {
                self.remove(index).await?;
            }
            PlaylistCommand::ToggleShuffle => {
                self.toggle_shuffle().await;
            }
            PlaylistCommand::PlayIndex(index) => {
                self.play_index(index).await?;
            }
            PlaylistCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            PlaylistCommand::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    /// Serialises UI commands with player events until shutdown or the command channel closes.
    pub async fn run(mut self, mut commands: mpsc::Receiver<PlaylistCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let command = match command {
                        Some(command) => command,
                        None => break,
                    };
                    match self.apply(command).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => log::warn!("⚠️ [PLAYLIST] {}", e),
                    }
                }
                event = self.player_events.recv() => match event {
                    Ok(event) => {
                        if let Err(e) = self.handle_player_event(event).await {
                            log::warn!("⚠️ [PLAYLIST] {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("⚠️ [PLAYLIST] Missed {} player events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        log::info!("[PLAYLIST] Stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SourceRef;
    use crate::downloader::cache::ContentCache;
    use crate::downloader::manager::WorkerSettings;
    use crate::downloader::strategies::FileResolver;
    use crate::player::engine::tests::{settings as player_settings, FakeBackend};
    use crate::player::spawn_player;
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::TempDir;

    fn tracks(names: &[&str]) -> Vec<TrackInfo> {
        names
            .iter()
            .map(|n| TrackInfo::from_source(SourceRef::YtDlp(n.to_string())))
            .collect()
    }

    #[test]
    fn linear_next_and_previous() {
        let mut playlist = Playlist::new(tracks(&["a", "b", "c"]));
        assert_eq!(playlist.next(), Some(0));
        assert_eq!(playlist.next(), Some(1));
        assert_eq!(playlist.next(), Some(2));
        assert_eq!(playlist.next(), None);
        assert_eq!(playlist.current_index(), Some(2));
        assert_eq!(playlist.previous(), Some(1));
    }

    #[test]
    fn repeat_wraps_both_ways() {
        let mut playlist = Playlist::new(tracks(&["a", "b"]));
        playlist.set_repeat(true);
        playlist.play_index(1).unwrap();
        assert_eq!(playlist.next(), Some(0));
        assert_eq!(playlist.previous(), Some(1));
    }

    #[test]
    fn removing_current_moves_to_the_track_that_slides_in() {
        let mut playlist = Playlist::new(tracks(&["a", "b", "c"]));
        playlist.play_index(1).unwrap();
        let (removed, removal) = playlist.remove(1).unwrap();
        assert_eq!(removed.title, "b");
        assert_eq!(removal, Removal { was_current: true, new_current: Some(1) });
        assert_eq!(playlist.current_track().unwrap().title, "c");
    }

    #[test]
    fn removing_last_current_stops_unless_repeat() {
        let mut playlist = Playlist::new(tracks(&["a", "b"]));
        playlist.play_index(1).unwrap();
        let (_, removal) = playlist.remove(1).unwrap();
        assert_eq!(removal.new_current, None);
        assert_eq!(playlist.current_index(), None);

        let mut playlist = Playlist::new(tracks(&["a", "b"]));
        playlist.set_repeat(true);
        playlist.play_index(1).unwrap();
        assert_eq!(playlist.remove(1).unwrap().1.new_current, Some(0));
    }

    #[test]
    fn removing_before_current_shifts_it() {
        let mut playlist = Playlist::new(tracks(&["a", "b", "c"]));
        playlist.play_index(2).unwrap();
        let (_, removal) = playlist.remove(0).unwrap();
        assert!(!removal.was_current);
        assert_eq!(playlist.current_index(), Some(1));
        assert_eq!(playlist.current_track().unwrap().title, "c");
        assert!(playlist.remove(5).is_err());
    }

    #[test]
    fn shuffle_order_excludes_current_and_covers_the_rest() {
        let mut playlist = Playlist::new(tracks(&["a", "b", "c", "d", "e"]));
        playlist.play_index(2).unwrap();
        assert!(playlist.toggle_shuffle());

        let order: HashSet<usize> = playlist.shuffle_order().iter().copied().collect();
        assert_eq!(order, [0, 1, 3, 4].into_iter().collect());

        let mut visited = Vec::new();
        for _ in 0..4 {
            visited.push(playlist.next().unwrap());
        }
        assert_eq!(visited, playlist.shuffle_order().to_vec());
        assert!(!visited.contains(&2));
    }

    #[test]
    fn shuffle_regenerates_when_exhausted() {
        let mut playlist = Playlist::new(tracks(&["a", "b", "c"]));
        playlist.play_index(0).unwrap();
        playlist.toggle_shuffle();
        playlist.next();
        playlist.next();
        let last = playlist.current_index();
        let after = playlist.next();
        assert!(after.is_some());
        assert_ne!(after, last);
    }

    #[test]
    fn shuffle_previous_walks_back() {
        let mut playlist = Playlist::new(tracks(&["a", "b", "c", "d"]));
        playlist.play_index(0).unwrap();
        playlist.toggle_shuffle();
        let first = playlist.next().unwrap();
        let _second = playlist.next().unwrap();
        assert_eq!(playlist.previous(), Some(first));
        assert_eq!(playlist.previous(), Some(0));
        assert_eq!(playlist.previous(), None);
    }

    #[test]
    fn upcoming_follows_next() {
        let mut playlist = Playlist::new(tracks(&["a", "b", "c", "d"]));
        playlist.play_index(1).unwrap();
        assert_eq!(playlist.upcoming(2), vec![2, 3]);
        assert_eq!(playlist.upcoming(5), vec![2, 3]);
        playlist.set_repeat(true);
        assert_eq!(playlist.upcoming(5), vec![2, 3, 0]);

        playlist.toggle_shuffle();
        let upcoming = playlist.upcoming(2);
        assert_eq!(upcoming, playlist.shuffle_order()[..2].to_vec());
    }

    #[test]
    fn added_track_joins_unplayed_shuffle_order() {
        let mut playlist = Playlist::new(tracks(&["a", "b"]));
        playlist.play_index(0).unwrap();
        playlist.toggle_shuffle();
        let index = playlist.add(tracks(&["c"]).remove(0));
        assert!(playlist.shuffle_order().contains(&index));
    }

    struct Rig {
        _dir: TempDir,
        manager: PlaylistManager,
        downloads: Arc<DownloadManager>,
        backend: Arc<FakeBackend>,
        player: PlayerHandle,
        tracks: Vec<TrackInfo>,
    }

    async fn rig(names: &[&str], prefetch: usize) -> Rig {
        let dir = TempDir::new().unwrap();
        let library = dir.path().join("library");
        std::fs::create_dir_all(&library).unwrap();
        let tracks: Vec<TrackInfo> = names
            .iter()
            .map(|name| {
                let path = library.join(format!("{}.wav", name));
                std::fs::write(&path, name.as_bytes()).unwrap();
                TrackInfo::from_source(SourceRef::File(path))
            })
            .collect();

        let cache = ContentCache::open(dir.path().join("cache"), 1 << 20).await.unwrap();
        let downloads = DownloadManager::with_settings(
            WorkerSettings {
                worker_count: 2,
                max_concurrent: 2,
                max_retries: 0,
                retry_delay: Duration::from_millis(5),
                attempt_timeout: Duration::from_secs(5),
            },
            16,
            cache.clone(),
            Arc::new(FileResolver::new()),
        );
        let backend = FakeBackend::new(10_000);
        let (player, _task) = spawn_player(player_settings(), cache, backend.clone());

        let mut config = AppConfig::default();
        config.prefetch_count = prefetch;
        let manager = PlaylistManager::new(&config, tracks.clone(), player.clone(), downloads.clone());
        Rig {
            _dir: dir,
            manager,
            downloads,
            backend,
            player,
            tracks,
        }
    }

    async fn playing(rig: &Rig, track: &TrackInfo) {
        let id = track.id.clone();
        rig.player
            .wait_for(
                |s| s.status == PlaybackStatus::Playing && s.current_track_id.as_deref() == Some(id.as_str()),
                Duration::from_secs(3),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn next_plays_and_prefetches() {
        let mut rig = rig(&["a", "b", "c", "d"], 2).await;
        assert_eq!(rig.manager.next().await.unwrap(), Some(0));
        playing(&rig, &rig.tracks[0]).await;

        let cache = rig.downloads.cache();
        for track in &rig.tracks[1..3] {
            cache.wait_for(&track.id, Duration::from_secs(3)).await.unwrap();
        }
        assert!(rig.downloads.job(&rig.tracks[3].id).await.is_none());
        assert!(!cache.contains(&rig.tracks[3].id).await);
    }

    #[tokio::test]
    async fn removing_playing_track_advances_and_prefetches_neighbour() {
        let mut rig = rig(&["a", "b", "c", "d"], 1).await;
        rig.manager.play_index(1).await.unwrap();
        playing(&rig, &rig.tracks[1]).await;

        let removed = rig.manager.remove(1).await.unwrap();
        assert_eq!(removed.id, rig.tracks[1].id);
        playing(&rig, &rig.tracks[2]).await;
        assert_eq!(rig.manager.playlist().current_index(), Some(1));

        rig.downloads
            .cache()
            .wait_for(&rig.tracks[3].id, Duration::from_secs(3))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn track_end_advances() {
        let mut rig = rig(&["a", "b"], 0).await;
        rig.manager.next().await.unwrap();
        playing(&rig, &rig.tracks[0]).await;

        rig.backend.track().finished.store(true, Ordering::SeqCst);
        let event = loop {
            let event = rig.manager.player_events.recv().await.unwrap();
            if matches!(event, PlayerEvent::TrackEnded { .. }) {
                break event;
            }
        };
        rig.manager.handle_player_event(event).await.unwrap();
        playing(&rig, &rig.tracks[1]).await;
    }

    #[tokio::test]
    async fn failed_track_is_skipped() {
        let mut rig = rig(&["a", "b"], 0).await;
        rig.manager.next().await.unwrap();
        playing(&rig, &rig.tracks[0]).await;

        rig.manager
            .handle_player_event(PlayerEvent::TrackFailed {
                track_id: rig.tracks[0].id.clone(),
                error: "Decode error".into(),
            })
            .await
            .unwrap();
        playing(&rig, &rig.tracks[1]).await;
    }

    #[tokio::test]
    async fn run_loop_serves_commands() {
        let rig = rig(&["a", "b", "c"], 1).await;
        let (tx, rx) = mpsc::channel(8);
        let player = rig.player.clone();
        let second = rig.tracks[1].clone();
        let task = tokio::spawn(rig.manager.run(rx));

        tx.send(PlaylistCommand::PlayIndex(1)).await.unwrap();
        let id = second.id.clone();
        player
            .wait_for(|s| s.current_track_id.as_deref() == Some(id.as_str()), Duration::from_secs(3))
            .await
            .unwrap();

        let (reply, snapshot) = oneshot::channel();
        tx.send(PlaylistCommand::Snapshot(reply)).await.unwrap();
        let snapshot = snapshot.await.unwrap();
        assert_eq!(snapshot.current_index, Some(1));
        assert_eq!(snapshot.upcoming, vec![2]);

        tx.send(PlaylistCommand::Shutdown).await.unwrap();
        task.await.unwrap();
    }
}
