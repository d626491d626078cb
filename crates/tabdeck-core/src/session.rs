use crate::backend::{Backend, BackendEvent};
use crate::engine::{PlaybackEngine, SeekOutcome};
use crate::error::PlayerError;
use crate::notifier::Notifier;
use crate::playlist::Playlist;
use crate::serializer::RestoredSession;
use std::path::PathBuf;
use tabdeck_proto::protocol::{Notification, PlaybackMode, PlaybackState, SessionSnapshot};
use tabdeck_proto::track::Track;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Owns the tabs and the engine, and routes every player command.
///
/// Tab slots are the real playlists followed by one reserved "add" slot at
/// index `playlists().len()`.  Selecting that slot creates a playlist.
pub struct SessionManager<B: Backend> {
    playlists: Vec<Playlist>,
    active: usize,
    /// Id of the playlist the engine was last started from.
    playing: Option<u32>,
    next_id: u32,
    engine: PlaybackEngine<B>,
    notifier: Notifier,
}

impl<B: Backend> SessionManager<B> {
    /// A session with a single empty playlist.
    pub fn new(engine: PlaybackEngine<B>, notifier: Notifier) -> Self {
        Self::from_restored(engine, notifier, RestoredSession::default())
    }

    /// Build the session from restored playlists.  The last restored playlist
    /// becomes active.  Unresolved tracks are reported once, after the build.
    pub fn from_restored(
        engine: PlaybackEngine<B>,
        notifier: Notifier,
        restored: RestoredSession,
    ) -> Self {
        let RestoredSession {
            playlists,
            unresolved,
        } = restored;
        let next_id = playlists.iter().map(Playlist::id).max().unwrap_or(0) + 1;
        let mut session = Self {
            active: playlists.len().saturating_sub(1),
            playlists,
            playing: None,
            next_id,
            engine,
            notifier,
        };
        if session.playlists.is_empty() {
            let id = session.allocate_id();
            session.playlists.push(Playlist::new(id, default_name(0)));
        }

        if !unresolved.is_empty() {
            warn!("{} track(s) could not be restored", unresolved.len());
            session
                .notifier
                .emit(PlayerError::TracksNotFound(unresolved).into_notification());
        }
        session
    }

    // ── queries ───────────────────────────────────────────────────────────────

    pub fn playlists(&self) -> &[Playlist] {
        &self.playlists
    }

    pub fn playlist(&self, index: usize) -> Option<&Playlist> {
        self.playlists.get(index)
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn active_playlist(&self) -> &Playlist {
        &self.playlists[self.active]
    }

    /// Real playlists plus the add slot.
    pub fn tab_count(&self) -> usize {
        self.playlists.len() + 1
    }

    pub fn is_add_slot(&self, index: usize) -> bool {
        index == self.playlists.len()
    }

    pub fn engine(&self) -> &PlaybackEngine<B> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut PlaybackEngine<B> {
        &mut self.engine
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            rev: 0,
            playlists: self.playlists.iter().map(Playlist::summary).collect(),
            active: self.active,
            state: self.engine.state(),
            current_track: self
                .engine
                .current_track()
                .map(|t| t.locator().to_string()),
            position_ms: self.engine.position(),
            duration_ms: self.engine.duration(),
            volume: self.engine.volume(),
            muted: self.engine.is_muted(),
        }
    }

    // ── tabs ──────────────────────────────────────────────────────────────────

    /// Append a playlist before the add slot and make it active.
    pub fn add_playlist(&mut self, name: Option<String>) -> usize {
        let index = self.playlists.len();
        let id = self.allocate_id();
        let name = name.unwrap_or_else(|| default_name(index));
        debug!("Adding playlist '{}' at {}", name, index);
        self.playlists.push(Playlist::new(id, name));
        self.notifier.emit(Notification::PlaylistCreated { index });
        self.active = index;
        self.notifier
            .emit(Notification::ActivePlaylistChanged { index });
        index
    }

    /// Close the tab at `index`.  The only remaining playlist is cleared
    /// instead of removed.
    pub fn close_playlist(&mut self, index: usize) {
        if index >= self.playlists.len() {
            return;
        }
        if self.playlists.len() == 1 {
            self.playlists[0].clear();
            self.notifier.emit(Notification::PlaylistChanged { index: 0 });
            return;
        }

        let removed = self.playlists.remove(index);
        if self.playing == Some(removed.id()) {
            self.playing = None;
        }
        self.notifier
            .emit(Notification::PlaylistDestroyed { index });

        let old_active = self.active;
        if index < old_active {
            self.active -= 1;
        } else if index == old_active && index >= self.playlists.len() {
            self.active = index - 1;
        }
        if index <= old_active {
            self.notifier.emit(Notification::ActivePlaylistChanged {
                index: self.active,
            });
        }
    }

    /// Switch tabs.  Never starts or stops playback.
    pub fn set_active(&mut self, index: usize) {
        if self.is_add_slot(index) {
            self.add_playlist(None);
            return;
        }
        if index >= self.playlists.len() || index == self.active {
            return;
        }
        self.active = index;
        self.notifier
            .emit(Notification::ActivePlaylistChanged { index });
    }

    pub fn rename_playlist(&mut self, index: usize, name: String) {
        if let Some(p) = self.playlists.get_mut(index) {
            p.rename(name);
            self.notifier.emit(Notification::PlaylistChanged { index });
        }
    }

    pub fn set_column_layout(&mut self, index: usize, layout: Option<String>) {
        if let Some(p) = self.playlists.get_mut(index) {
            p.set_column_layout(layout);
        }
    }

    // ── editing (active playlist) ─────────────────────────────────────────────

    pub fn insert_tracks(&mut self, index: usize, tracks: Vec<Track>) {
        if tracks.is_empty() {
            return;
        }
        self.playlists[self.active].insert(index, tracks);
        self.active_changed();
    }

    /// Recursively add the files under `folders` to the active playlist, in
    /// file-name order.  Returns how many tracks were added.
    pub fn append_external_folders(&mut self, folders: &[PathBuf]) -> usize {
        let mut tracks = Vec::new();
        for folder in folders {
            for entry in WalkDir::new(folder).sort_by_file_name() {
                match entry {
                    Ok(entry) if entry.file_type().is_file() => {
                        tracks.push(Track::local(entry.path()));
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Skipping unreadable entry under {}: {}", folder.display(), e),
                }
            }
        }
        let count = tracks.len();
        info!("Appending {} track(s) from {} folder(s)", count, folders.len());
        if count > 0 {
            self.playlists[self.active].append(tracks);
            self.active_changed();
        }
        count
    }

    pub fn remove_tracks(&mut self, indices: &[usize]) {
        if self.playlists[self.active].remove(indices) > 0 {
            self.active_changed();
        }
    }

    pub fn move_tracks_up(&mut self, indices: &[usize]) -> Vec<usize> {
        let moved = self.playlists[self.active].move_up(indices);
        self.active_changed();
        moved
    }

    pub fn move_tracks_down(&mut self, indices: &[usize]) -> Vec<usize> {
        let moved = self.playlists[self.active].move_down(indices);
        self.active_changed();
        moved
    }

    pub fn clear_active(&mut self) {
        self.playlists[self.active].clear();
        self.active_changed();
    }

    pub fn set_mode(&mut self, mode: PlaybackMode) {
        self.playlists[self.active].set_mode(mode);
        self.active_changed();
    }

    pub fn cycle_mode(&mut self) -> PlaybackMode {
        let mode = self.playlists[self.active].mode().cycle();
        self.set_mode(mode);
        mode
    }

    // ── playback ──────────────────────────────────────────────────────────────

    /// Play (or resume) the active playlist, starting at its first track when
    /// it has no cursor yet.
    pub fn play(&mut self) {
        let active = self.active;
        let playlist = &mut self.playlists[active];
        if playlist.is_empty() {
            return;
        }
        if playlist.current_index().is_none() {
            playlist.set_current(0);
            self.notifier
                .emit(Notification::PlaylistChanged { index: active });
        }
        self.playing = Some(self.playlists[active].id());
        self.engine.play(&self.playlists[active]);
    }

    pub fn play_index(&mut self, index: usize) {
        let active = self.active;
        if !self.playlists[active].set_current(index) {
            return;
        }
        self.notifier
            .emit(Notification::PlaylistChanged { index: active });
        self.start(active);
    }

    pub fn pause(&mut self) {
        self.engine.pause();
    }

    pub fn toggle_pause(&mut self) {
        if self.engine.is_playing() {
            self.engine.pause();
        } else {
            self.play();
        }
    }

    pub fn stop(&mut self) {
        self.engine.stop();
    }

    pub fn skip_forward(&mut self) {
        self.advance(self.active);
    }

    pub fn skip_backward(&mut self) {
        let active = self.active;
        if self.playlists[active].previous().is_none() {
            return;
        }
        self.notifier
            .emit(Notification::PlaylistChanged { index: active });
        self.start(active);
    }

    pub fn seek_forward(&mut self) {
        if self.engine.seek_forward() == SeekOutcome::SkipToNext {
            let index = self.playing_index().unwrap_or(self.active);
            self.advance(index);
        }
    }

    pub fn seek_backward(&mut self) {
        self.engine.seek_backward();
    }

    pub fn set_position(&mut self, fraction: f32) {
        self.engine.set_position(fraction);
    }

    pub fn set_volume(&mut self, volume: u8) {
        self.engine.set_volume(volume);
    }

    pub fn volume(&self) -> u8 {
        self.engine.volume()
    }

    pub fn set_mute(&mut self, muted: bool) {
        self.engine.set_mute(muted);
    }

    pub fn toggle_mute(&mut self) {
        self.engine.toggle_mute();
    }

    pub fn is_muted(&self) -> bool {
        self.engine.is_muted()
    }

    /// Forward a backend event to the engine and advance the playing playlist
    /// when the current track ends.
    pub fn handle_backend_event(&mut self, event: BackendEvent) -> Option<PlaybackState> {
        let changed = self.engine.handle_backend_event(event);
        if changed == Some(PlaybackState::Ended) {
            match self.playing_index() {
                Some(index) => {
                    if !self.advance(index) {
                        debug!("End of playlist {}", index);
                    }
                }
                None => debug!("Track ended with no playing playlist"),
            }
        }
        changed
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    /// Step `index` forward by its mode and start the new current track.
    fn advance(&mut self, index: usize) -> bool {
        if self.playlists[index].next().is_none() {
            return false;
        }
        self.notifier.emit(Notification::PlaylistChanged { index });
        self.start(index);
        true
    }

    fn start(&mut self, index: usize) {
        self.playing = Some(self.playlists[index].id());
        self.engine.start(&self.playlists[index]);
    }

    fn playing_index(&self) -> Option<usize> {
        let id = self.playing?;
        self.playlists.iter().position(|p| p.id() == id)
    }

    fn active_changed(&self) {
        self.notifier.emit(Notification::PlaylistChanged {
            index: self.active,
        });
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

fn default_name(index: usize) -> String {
    format!("Playlist {}", index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendEventKind, MemoryBackend};
    use crate::notifier::drain;
    use tabdeck_proto::config::PlaybackConfig;

    fn session() -> SessionManager<MemoryBackend> {
        let notifier = Notifier::new(64);
        let engine = PlaybackEngine::new(MemoryBackend::new(), notifier.clone(), &PlaybackConfig::default());
        SessionManager::new(engine, notifier)
    }

    fn tracks(names: &[&str]) -> Vec<Track> {
        names.iter().map(|n| Track::local(format!("/m/{n}"))).collect()
    }

    #[test]
    fn test_new_session_has_one_playlist() {
        let s = session();
        assert_eq!(s.playlists().len(), 1);
        assert_eq!(s.tab_count(), 2);
        assert_eq!(s.active_playlist().name(), "Playlist 1");
        assert!(s.is_add_slot(1));
    }

    #[test]
    fn test_add_slot_creates_playlist() {
        let mut s = session();
        let mut rx = s.notifier().subscribe();
        s.set_active(1);
        assert_eq!(s.playlists().len(), 2);
        assert_eq!(s.active_index(), 1);
        assert_eq!(s.active_playlist().name(), "Playlist 2");
        assert_eq!(
            drain(&mut rx),
            vec![
                Notification::PlaylistCreated { index: 1 },
                Notification::ActivePlaylistChanged { index: 1 },
            ]
        );
    }

    #[test]
    fn test_play_without_cursor_starts_at_first_track() {
        let mut s = session();
        s.insert_tracks(0, tracks(&["a", "b"]));
        s.play();
        assert_eq!(s.active_playlist().current_index(), Some(0));
        assert_eq!(s.engine().backend().opened(), vec!["/m/a"]);
    }

    #[test]
    fn test_play_on_empty_playlist_is_noop() {
        let mut s = session();
        s.play();
        assert!(s.engine().backend().opened().is_empty());
        assert_eq!(s.engine().state(), PlaybackState::Stopped);
    }

    #[test]
    fn test_end_of_track_advances() {
        let mut s = session();
        s.insert_tracks(0, tracks(&["a", "b"]));
        s.play_index(0);
        let ev = s.engine().backend().event(BackendEventKind::Playing);
        s.handle_backend_event(ev);
        let ev = s.engine().backend().event(BackendEventKind::End);
        s.handle_backend_event(ev);

        assert_eq!(s.active_playlist().current_index(), Some(1));
        assert_eq!(s.engine().backend().opened(), vec!["/m/a", "/m/b"]);
    }

    #[test]
    fn test_end_of_last_track_stops_in_sequential() {
        let mut s = session();
        s.insert_tracks(0, tracks(&["a"]));
        s.play_index(0);
        let ev = s.engine().backend().event(BackendEventKind::End);
        s.handle_backend_event(ev);
        assert_eq!(s.engine().state(), PlaybackState::Ended);
        assert_eq!(s.engine().backend().opened().len(), 1);
    }

    #[test]
    fn test_repeat_one_replays_on_end() {
        let mut s = session();
        s.insert_tracks(0, tracks(&["a", "b"]));
        s.set_mode(PlaybackMode::RepeatOne);
        s.play_index(1);
        let ev = s.engine().backend().event(BackendEventKind::End);
        s.handle_backend_event(ev);
        assert_eq!(s.engine().backend().opened(), vec!["/m/b", "/m/b"]);
    }

    #[test]
    fn test_toggle_pause() {
        let mut s = session();
        s.insert_tracks(0, tracks(&["a"]));
        s.toggle_pause();
        let ev = s.engine().backend().event(BackendEventKind::Playing);
        s.handle_backend_event(ev);
        s.toggle_pause();
        assert_eq!(
            s.engine().backend().calls.last(),
            Some(&crate::backend::BackendCall::Pause)
        );
    }
}
