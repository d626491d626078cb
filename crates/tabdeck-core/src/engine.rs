use crate::backend::{Backend, BackendEvent, BackendEventKind, MediaId, DEFAULT_TRACK, MUTED_TRACK};
use crate::error::PlayerError;
use crate::notifier::Notifier;
use crate::playlist::Playlist;
use tabdeck_proto::config::PlaybackConfig;
use tabdeck_proto::protocol::{MediaStatus, Notification, PlaybackState};
use tabdeck_proto::track::Track;
use tracing::{debug, info, trace, warn};

/// Positions are kept strictly below the end of the media.
const POSITION_EPSILON: f32 = 0.001;

/// Result of a relative seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOutcome {
    /// Seeked to this position (ms).
    Seeked(i64),
    /// Nothing playing, or the length is unknown.
    Ignored,
    /// The target lies past the end; the caller should advance the playlist.
    SkipToNext,
}

/// Normalizes an asynchronous `Backend` into a deterministic player state
/// machine.
///
/// Commands are forwarded without waiting.  State only changes in response to
/// backend events delivered through `handle_backend_event`, with two
/// exceptions: `open` moves to `Loading` immediately, and a fatal error moves to
/// `Stopped`.
pub struct PlaybackEngine<B: Backend> {
    backend: B,
    notifier: Notifier,
    seek_delta_ms: i64,
    state: PlaybackState,
    status: MediaStatus,
    current: Option<Track>,
    media: Option<MediaId>,
}

impl<B: Backend> PlaybackEngine<B> {
    pub fn new(mut backend: B, notifier: Notifier, config: &PlaybackConfig) -> Self {
        backend.set_volume(config.default_volume.min(100));
        Self {
            backend,
            notifier,
            seek_delta_ms: config.seek_delta_ms.max(0),
            state: PlaybackState::Stopped,
            status: MediaStatus::NoMedia,
            current: None,
            media: None,
        }
    }

    // ── accessors ─────────────────────────────────────────────────────────────

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn media_status(&self) -> MediaStatus {
        self.status
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn is_playing(&self) -> bool {
        matches!(self.state, PlaybackState::Playing | PlaybackState::Buffering)
    }

    // ── transport ─────────────────────────────────────────────────────────────

    /// Bind `track`, superseding whatever was open.
    ///
    /// Returns `false` when the track is not local: it is handed off through
    /// `PlayRemoteTrack` and the engine state is left alone.
    pub fn open(&mut self, track: &Track) -> bool {
        if !track.is_local() {
            info!("Handing off remote track {}", track.locator());
            self.notifier.emit(Notification::PlayRemoteTrack {
                locator: track.locator().to_string(),
            });
            return false;
        }

        debug!("Opening {}", track.locator());
        let media = self.backend.open(track.locator());
        self.media = Some(media);
        self.current = Some(track.clone());
        self.set_status(MediaStatus::Loading);
        self.set_state(PlaybackState::Loading);
        self.notifier.emit(Notification::CurrentTrackChanged {
            locator: track.locator().to_string(),
        });
        true
    }

    /// Resume if paused on the playlist's current track, otherwise (re)open it
    /// and start playing.
    pub fn play(&mut self, playlist: &Playlist) {
        let same_track = match (playlist.current_track(), &self.current) {
            (Some(wanted), Some(bound)) => wanted == bound,
            _ => false,
        };
        if self.state == PlaybackState::Paused && same_track && self.media.is_some() {
            self.backend.resume();
            return;
        }
        self.start(playlist);
    }

    /// Open the playlist's current track from the beginning and play it.
    pub fn start(&mut self, playlist: &Playlist) {
        let Some(track) = playlist.current_track() else {
            return;
        };
        if self.open(track) {
            self.backend.play();
        }
    }

    pub fn pause(&mut self) {
        if self.media.is_some() {
            self.backend.pause();
        }
    }

    pub fn stop(&mut self) {
        if self.media.is_some() {
            self.backend.stop();
        }
    }

    /// Jump to `fraction` of the media length.  Clamped into `[0, 1)`.
    pub fn set_position(&mut self, fraction: f32) {
        if self.media.is_none() {
            return;
        }
        let fraction = if fraction.is_nan() || fraction < 0.0 {
            0.0
        } else if fraction >= 1.0 {
            1.0 - POSITION_EPSILON
        } else {
            fraction
        };
        self.backend.set_position(fraction);
    }

    pub fn seek_forward(&mut self) -> SeekOutcome {
        let Some(length) = self.seekable_length() else {
            return SeekOutcome::Ignored;
        };
        let target = self.position() + self.seek_delta_ms;
        if target > length {
            return SeekOutcome::SkipToNext;
        }
        self.set_position(target as f32 / length as f32);
        SeekOutcome::Seeked(target)
    }

    pub fn seek_backward(&mut self) -> SeekOutcome {
        let Some(length) = self.seekable_length() else {
            return SeekOutcome::Ignored;
        };
        let target = (self.position() - self.seek_delta_ms).max(0);
        self.set_position(target as f32 / length as f32);
        SeekOutcome::Seeked(target)
    }

    fn seekable_length(&self) -> Option<i64> {
        if !matches!(self.state, PlaybackState::Playing | PlaybackState::Paused) {
            return None;
        }
        let length = self.duration();
        (length > 0).then_some(length)
    }

    // ── volume ────────────────────────────────────────────────────────────────

    pub fn volume(&self) -> u8 {
        self.backend.volume()
    }

    pub fn set_volume(&mut self, volume: u8) {
        self.backend.set_volume(volume.min(100));
    }

    pub fn is_muted(&self) -> bool {
        self.backend.audio_track() == MUTED_TRACK
    }

    pub fn set_mute(&mut self, muted: bool) {
        let track = if muted { MUTED_TRACK } else { DEFAULT_TRACK };
        self.backend.set_audio_track(track);
    }

    pub fn toggle_mute(&mut self) {
        let audible = self.backend.audio_track() == DEFAULT_TRACK;
        self.set_mute(audible);
    }

    // ── position ──────────────────────────────────────────────────────────────

    /// Media length in ms, 0 when nothing is bound or the length is unknown.
    pub fn duration(&self) -> i64 {
        if self.media.is_none() {
            return 0;
        }
        self.backend.length_ms().max(0)
    }

    /// Playback position in ms.
    pub fn position(&self) -> i64 {
        (self.position_fraction() as f64 * self.duration() as f64) as i64
    }

    pub fn position_fraction(&self) -> f32 {
        if self.media.is_none() {
            return 0.0;
        }
        self.backend.position().clamp(0.0, 1.0)
    }

    // ── backend events ────────────────────────────────────────────────────────

    /// Apply one backend event.  Returns the new state when it changed.
    pub fn handle_backend_event(&mut self, event: BackendEvent) -> Option<PlaybackState> {
        let fatal = matches!(event.kind, BackendEventKind::Error { fatal: true, .. });
        if !fatal && Some(event.media) != self.media {
            trace!("Dropping stale backend event {:?}", event);
            return None;
        }

        match event.kind {
            BackendEventKind::Opening => {
                self.set_status(MediaStatus::Loading);
                self.set_state(PlaybackState::Loading)
            }
            BackendEventKind::Playing => {
                if self.state == PlaybackState::Playing {
                    return None;
                }
                self.set_status(MediaStatus::Loaded);
                self.set_state(PlaybackState::Playing)
            }
            BackendEventKind::Paused => self.set_state(PlaybackState::Paused),
            BackendEventKind::Stopped => {
                self.set_status(MediaStatus::NoMedia);
                self.set_state(PlaybackState::Stopped)
            }
            BackendEventKind::Buffering => {
                self.set_status(MediaStatus::Buffering);
                self.set_state(PlaybackState::Buffering)
            }
            BackendEventKind::End => {
                self.set_status(MediaStatus::EndOfMedia);
                self.set_state(PlaybackState::Ended)
            }
            BackendEventKind::Error {
                message,
                fatal: false,
            } => {
                let locator = self
                    .current
                    .as_ref()
                    .map(|t| t.locator().to_string())
                    .unwrap_or_default();
                warn!("Media error on {}: {}", locator, message);
                self.set_status(MediaStatus::Invalid);
                let changed = self.set_state(PlaybackState::Invalid);
                self.notifier.emit(
                    PlayerError::MediaOpen {
                        locator,
                        reason: message,
                    }
                    .into_notification(),
                );
                changed
            }
            BackendEventKind::Error { message, fatal: true } => {
                warn!("Backend failure: {}", message);
                self.media = None;
                self.set_status(MediaStatus::NoMedia);
                let changed = self.set_state(PlaybackState::Stopped);
                self.notifier
                    .emit(PlayerError::BackendFatal(message).into_notification());
                changed
            }
            BackendEventKind::PositionChanged(fraction) => {
                if matches!(
                    self.state,
                    PlaybackState::Playing | PlaybackState::Paused | PlaybackState::Buffering
                ) {
                    let ms = (fraction.clamp(0.0, 1.0) as f64 * self.duration() as f64) as i64;
                    self.notifier.emit(Notification::PositionChanged { ms });
                }
                None
            }
            BackendEventKind::TrackChanged => {
                if let Some(track) = &self.current {
                    self.notifier.emit(Notification::CurrentTrackChanged {
                        locator: track.locator().to_string(),
                    });
                }
                None
            }
        }
    }

    fn set_state(&mut self, state: PlaybackState) -> Option<PlaybackState> {
        if self.state == state {
            return None;
        }
        debug!("State {:?} -> {:?}", self.state, state);
        self.state = state;
        self.notifier.emit(Notification::StateChanged { state });
        Some(state)
    }

    fn set_status(&mut self, status: MediaStatus) {
        if self.status == status {
            return;
        }
        self.status = status;
        self.notifier
            .emit(Notification::MediaStatusChanged { status });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, MemoryBackend};
    use crate::notifier::drain;
    use tabdeck_proto::protocol::ErrorKind;
    use tokio::sync::broadcast;

    fn engine() -> (
        PlaybackEngine<MemoryBackend>,
        broadcast::Receiver<Notification>,
    ) {
        let notifier = Notifier::new(64);
        let rx = notifier.subscribe();
        let engine = PlaybackEngine::new(MemoryBackend::new(), notifier, &PlaybackConfig::default());
        (engine, rx)
    }

    fn playing(engine: &mut PlaybackEngine<MemoryBackend>, length_ms: i64) {
        engine.open(&Track::local("/music/a.flac"));
        engine.backend_mut().length_ms = length_ms;
        let ev = engine.backend().event(BackendEventKind::Playing);
        engine.handle_backend_event(ev);
    }

    fn state_changes(notes: &[Notification]) -> Vec<PlaybackState> {
        notes
            .iter()
            .filter_map(|n| match n {
                Notification::StateChanged { state } => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_default_volume_applied() {
        let (engine, _rx) = engine();
        assert_eq!(engine.volume(), 80);
    }

    #[test]
    fn test_open_local_moves_to_loading() {
        let (mut engine, mut rx) = engine();
        assert!(engine.open(&Track::local("/music/a.flac")));
        assert_eq!(engine.state(), PlaybackState::Loading);
        assert_eq!(engine.backend().opened(), vec!["/music/a.flac"]);
        assert_eq!(
            drain(&mut rx),
            vec![
                Notification::MediaStatusChanged {
                    status: MediaStatus::Loading
                },
                Notification::StateChanged {
                    state: PlaybackState::Loading
                },
                Notification::CurrentTrackChanged {
                    locator: "/music/a.flac".into()
                },
            ]
        );
    }

    #[test]
    fn test_remote_track_is_handed_off() {
        let (mut engine, mut rx) = engine();
        assert!(!engine.open(&Track::parse("http://radio.example/stream")));
        assert_eq!(engine.state(), PlaybackState::Stopped);
        assert!(engine.backend().opened().is_empty());
        assert_eq!(
            drain(&mut rx),
            vec![Notification::PlayRemoteTrack {
                locator: "http://radio.example/stream".into()
            }]
        );
    }

    #[test]
    fn test_duplicate_playing_emits_once() {
        let (mut engine, mut rx) = engine();
        engine.open(&Track::local("/music/a.flac"));
        let ev = engine.backend().event(BackendEventKind::Playing);
        assert_eq!(engine.handle_backend_event(ev.clone()), Some(PlaybackState::Playing));
        assert_eq!(engine.handle_backend_event(ev), None);

        let notes = drain(&mut rx);
        assert_eq!(
            state_changes(&notes),
            vec![PlaybackState::Loading, PlaybackState::Playing]
        );
    }

    #[test]
    fn test_state_change_precedes_position() {
        let (mut engine, mut rx) = engine();
        engine.open(&Track::local("/music/a.flac"));
        engine.backend_mut().length_ms = 10_000;
        drain(&mut rx);

        // Position before Playing is outside the playing window.
        let early = engine.backend().event(BackendEventKind::PositionChanged(0.1));
        engine.handle_backend_event(early);
        let ev = engine.backend().event(BackendEventKind::Playing);
        engine.handle_backend_event(ev);
        let pos = engine.backend().event(BackendEventKind::PositionChanged(0.5));
        engine.handle_backend_event(pos);

        assert_eq!(
            drain(&mut rx),
            vec![
                Notification::MediaStatusChanged {
                    status: MediaStatus::Loaded
                },
                Notification::StateChanged {
                    state: PlaybackState::Playing
                },
                Notification::PositionChanged { ms: 5000 },
            ]
        );
    }

    #[test]
    fn test_stale_events_are_dropped() {
        let (mut engine, _rx) = engine();
        engine.open(&Track::local("/music/a.flac"));
        let stale = engine.backend().event(BackendEventKind::End);
        engine.open(&Track::local("/music/b.flac"));

        assert_eq!(engine.handle_backend_event(stale), None);
        assert_eq!(engine.state(), PlaybackState::Loading);
        assert_eq!(engine.current_track().unwrap().locator(), "/music/b.flac");
    }

    #[test]
    fn test_set_position_clamps_end() {
        let (mut engine, _rx) = engine();
        playing(&mut engine, 1000);
        engine.set_position(1.0);
        assert!(engine.backend().position < 1.0);
        assert!((engine.backend().position - (1.0 - POSITION_EPSILON)).abs() < f32::EPSILON);

        engine.set_position(-3.0);
        assert_eq!(engine.backend().position, 0.0);
    }

    #[test]
    fn test_set_position_without_media_is_noop() {
        let (mut engine, _rx) = engine();
        engine.set_position(0.5);
        assert!(engine.backend().calls.iter().all(|c| !matches!(c, BackendCall::SetPosition(_))));
    }

    #[test]
    fn test_seek_forward_past_end_skips() {
        let (mut engine, _rx) = engine();
        playing(&mut engine, 200_000);
        engine.backend_mut().position = 198_000.0 / 200_000.0;
        engine.backend_mut().calls.clear();

        assert_eq!(engine.seek_forward(), SeekOutcome::SkipToNext);
        assert!(engine.backend().calls.is_empty());
    }

    #[test]
    fn test_seek_forward_onto_end_seeks_instead_of_skipping() {
        let (mut engine, _rx) = engine();
        playing(&mut engine, 10_000);
        engine.backend_mut().position = 0.5;

        assert_eq!(engine.seek_forward(), SeekOutcome::Seeked(10_000));
        assert_eq!(
            engine.backend().calls.last(),
            Some(&BackendCall::SetPosition(1.0 - POSITION_EPSILON))
        );
    }

    #[test]
    fn test_seek_forward_and_backward() {
        let (mut engine, _rx) = engine();
        playing(&mut engine, 100_000);
        engine.backend_mut().position = 0.5;
        assert_eq!(engine.seek_forward(), SeekOutcome::Seeked(55_000));

        engine.backend_mut().position = 0.02;
        assert_eq!(engine.seek_backward(), SeekOutcome::Seeked(0));
        assert_eq!(engine.backend().position, 0.0);
    }

    #[test]
    fn test_seek_ignored_when_not_playing() {
        let (mut engine, _rx) = engine();
        engine.open(&Track::local("/music/a.flac"));
        engine.backend_mut().length_ms = 100_000;
        assert_eq!(engine.seek_forward(), SeekOutcome::Ignored);
    }

    #[test]
    fn test_resume_from_pause_does_not_reopen() {
        let (mut engine, mut rx) = engine();
        let mut playlist = Playlist::new(1, "p");
        playlist.append(vec![Track::local("/music/a.flac")]);
        playlist.set_current(0);

        engine.play(&playlist);
        let ev = engine.backend().event(BackendEventKind::Playing);
        engine.handle_backend_event(ev);
        engine.pause();
        let ev = engine.backend().event(BackendEventKind::Paused);
        engine.handle_backend_event(ev);
        drain(&mut rx);

        engine.play(&playlist);
        assert_eq!(engine.backend().opened().len(), 1);
        assert_eq!(engine.backend().calls.last(), Some(&BackendCall::Resume));

        let ev = engine.backend().event(BackendEventKind::Playing);
        engine.handle_backend_event(ev);
        assert_eq!(state_changes(&drain(&mut rx)), vec![PlaybackState::Playing]);
    }

    #[test]
    fn test_non_fatal_error_marks_invalid() {
        let (mut engine, mut rx) = engine();
        engine.open(&Track::local("/music/broken.flac"));
        drain(&mut rx);
        let ev = engine.backend().event(BackendEventKind::Error {
            message: "unsupported format".into(),
            fatal: false,
        });
        assert_eq!(engine.handle_backend_event(ev), Some(PlaybackState::Invalid));
        assert_eq!(engine.media_status(), MediaStatus::Invalid);

        let notes = drain(&mut rx);
        assert!(notes.contains(&Notification::Error {
            kind: ErrorKind::MediaOpen,
            message: "cannot open '/music/broken.flac': unsupported format".into(),
            fatal: false,
        }));
    }

    #[test]
    fn test_fatal_error_stops() {
        let (mut engine, mut rx) = engine();
        playing(&mut engine, 1000);
        drain(&mut rx);

        assert_eq!(
            engine.handle_backend_event(BackendEvent::fatal("mpv exited")),
            Some(PlaybackState::Stopped)
        );
        let notes = drain(&mut rx);
        assert_eq!(
            notes.last(),
            Some(&Notification::Error {
                kind: ErrorKind::BackendFatal,
                message: "backend failure: mpv exited".into(),
                fatal: true,
            })
        );
        assert_eq!(engine.duration(), 0);
    }

    #[test]
    fn test_mute_toggles_audio_track() {
        let (mut engine, _rx) = engine();
        engine.set_volume(55);
        assert!(!engine.is_muted());
        engine.toggle_mute();
        assert!(engine.is_muted());
        assert_eq!(engine.backend().audio_track, MUTED_TRACK);
        engine.toggle_mute();
        assert_eq!(engine.backend().audio_track, DEFAULT_TRACK);
        engine.set_mute(true);
        engine.set_mute(false);
        assert!(!engine.is_muted());
        assert_eq!(engine.volume(), 55);
    }

    #[test]
    fn test_volume_is_clamped() {
        let (mut engine, _rx) = engine();
        engine.set_volume(250);
        assert_eq!(engine.volume(), 100);
    }
}
