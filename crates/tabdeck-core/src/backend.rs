//! Contract between the `PlaybackEngine` and a native decode/output engine.
//!
//! Commands are fire-and-forget: they return immediately and their effect is
//! reported later through `BackendEvent`s, which the owner of the engine must
//! deliver on the control task (see `PlaybackEngine::handle_backend_event`).

/// Identifies one `open` request.  Every event carries the id of the media it
/// belongs to, so events from a superseded open can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MediaId(pub u64);

/// Audio track id that disables output (mute).
pub const MUTED_TRACK: i32 = -1;
/// Audio track id of the default (audible) track.
pub const DEFAULT_TRACK: i32 = 0;

#[derive(Debug, Clone, PartialEq)]
pub enum BackendEventKind {
    Opening,
    Playing,
    Paused,
    Stopped,
    Buffering,
    End,
    Error { message: String, fatal: bool },
    /// Playback position as a fraction of the media length.
    PositionChanged(f32),
    TrackChanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendEvent {
    pub media: MediaId,
    pub kind: BackendEventKind,
}

impl BackendEvent {
    pub fn new(media: MediaId, kind: BackendEventKind) -> Self {
        Self { media, kind }
    }

    /// A backend-wide failure not tied to any particular media.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            media: MediaId::default(),
            kind: BackendEventKind::Error {
                message: message.into(),
                fatal: true,
            },
        }
    }
}

pub trait Backend {
    /// Load `locator`, replacing whatever was open.  Does not start playback.
    fn open(&mut self, locator: &str) -> MediaId;
    fn play(&mut self);
    fn pause(&mut self);
    fn resume(&mut self);
    fn stop(&mut self);
    /// Current position in `[0, 1)`.
    fn position(&self) -> f32;
    fn set_position(&mut self, fraction: f32);
    /// Media length in milliseconds; `<= 0` when unknown.
    fn length_ms(&self) -> i64;
    /// Volume in `0..=100`.
    fn volume(&self) -> u8;
    fn set_volume(&mut self, volume: u8);
    fn audio_track(&self) -> i32;
    fn set_audio_track(&mut self, id: i32);
}

// ── in-memory backend ─────────────────────────────────────────────────────────

/// Commands recorded by `MemoryBackend`.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Open(String),
    Play,
    Pause,
    Resume,
    Stop,
    SetPosition(f32),
    SetVolume(u8),
    SetAudioTrack(i32),
}

/// Backend that produces no sound: it records every command and answers
/// queries from plain fields.  Drives the engine in tests and dry runs; events
/// are injected by the caller with `event`.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    pub calls: Vec<BackendCall>,
    pub position: f32,
    pub length_ms: i64,
    pub volume: u8,
    pub audio_track: i32,
    media: MediaId,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            position: 0.0,
            length_ms: 0,
            volume: 100,
            audio_track: DEFAULT_TRACK,
            media: MediaId::default(),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an event for the currently open media.
    pub fn event(&self, kind: BackendEventKind) -> BackendEvent {
        BackendEvent::new(self.media, kind)
    }

    pub fn opened(&self) -> Vec<&str> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                BackendCall::Open(l) => Some(l.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl Backend for MemoryBackend {
    fn open(&mut self, locator: &str) -> MediaId {
        self.media = MediaId(self.media.0 + 1);
        self.position = 0.0;
        self.calls.push(BackendCall::Open(locator.to_string()));
        self.media
    }

    fn play(&mut self) {
        self.calls.push(BackendCall::Play);
    }

    fn pause(&mut self) {
        self.calls.push(BackendCall::Pause);
    }

    fn resume(&mut self) {
        self.calls.push(BackendCall::Resume);
    }

    fn stop(&mut self) {
        self.calls.push(BackendCall::Stop);
    }

    fn position(&self) -> f32 {
        self.position
    }

    fn set_position(&mut self, fraction: f32) {
        self.position = fraction;
        self.calls.push(BackendCall::SetPosition(fraction));
    }

    fn length_ms(&self) -> i64 {
        self.length_ms
    }

    fn volume(&self) -> u8 {
        self.volume
    }

    fn set_volume(&mut self, volume: u8) {
        self.volume = volume;
        self.calls.push(BackendCall::SetVolume(volume));
    }

    fn audio_track(&self) -> i32 {
        self.audio_track
    }

    fn set_audio_track(&mut self, id: i32) {
        self.audio_track = id;
        self.calls.push(BackendCall::SetAudioTrack(id));
    }
}
