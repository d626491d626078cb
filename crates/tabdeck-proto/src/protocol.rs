use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("insufficient data for frame")]
    Incomplete,
    #[error("frame length {0} exceeds limit")]
    TooLarge(usize),
    #[error("malformed frame: {source}")]
    Malformed {
        consumed: usize,
        #[source]
        source: serde_json::Error,
    },
}

// ── player enums ──────────────────────────────────────────────────────────────

/// Normalized player state.  Exactly one lives inside each `PlaybackEngine`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Loading,
    Playing,
    Paused,
    Buffering,
    Ended,
    Invalid,
}

/// Media-level status, reported alongside (not instead of) `PlaybackState`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum MediaStatus {
    #[default]
    NoMedia,
    Loading,
    Loaded,
    Buffering,
    EndOfMedia,
    Invalid,
}

/// Policy governing `next()` / `previous()` on a playlist.
///
/// Persisted as an integer (see `code`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackMode {
    #[default]
    Sequential,
    RepeatAll,
    RepeatOne,
    Shuffle,
}

impl PlaybackMode {
    pub const ALL: [PlaybackMode; 4] = [
        PlaybackMode::Sequential,
        PlaybackMode::RepeatAll,
        PlaybackMode::RepeatOne,
        PlaybackMode::Shuffle,
    ];

    /// Integer code used in the session file.
    pub fn code(self) -> i64 {
        match self {
            PlaybackMode::RepeatOne => 1,
            PlaybackMode::Sequential => 2,
            PlaybackMode::RepeatAll => 3,
            PlaybackMode::Shuffle => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.code() == code)
    }

    /// Next mode in the UI cycling order.
    pub fn cycle(self) -> Self {
        match self {
            PlaybackMode::Sequential => PlaybackMode::RepeatAll,
            PlaybackMode::RepeatAll => PlaybackMode::RepeatOne,
            PlaybackMode::RepeatOne => PlaybackMode::Shuffle,
            PlaybackMode::Shuffle => PlaybackMode::Sequential,
        }
    }
}

/// Failure classes surfaced through `Notification::Error`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    /// Backend could not open a local track (corrupt, unsupported, missing).
    MediaOpen,
    /// Backend reported an unrecoverable failure.
    BackendFatal,
}

// ── notifications ─────────────────────────────────────────────────────────────

/// Typed outward events.  Emitted synchronously by the engine and the session
/// manager in the order the underlying transitions happen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum Notification {
    StateChanged { state: PlaybackState },
    MediaStatusChanged { status: MediaStatus },
    /// Position in milliseconds.
    PositionChanged { ms: i64 },
    CurrentTrackChanged { locator: String },
    /// Hand-off: the track is not local and must be played elsewhere.
    PlayRemoteTrack { locator: String },
    PlaylistCreated { index: usize },
    PlaylistDestroyed { index: usize },
    ActivePlaylistChanged { index: usize },
    /// Contents, mode, name or cursor of the playlist at `index` changed.
    PlaylistChanged { index: usize },
    /// Aggregate report of locators that could not be restored.
    TracksNotFound { locators: Vec<String> },
    Error {
        kind: ErrorKind,
        message: String,
        fatal: bool,
    },
}

// ── commands ──────────────────────────────────────────────────────────────────

/// Messages sent from clients to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd")]
pub enum Command {
    Play,
    PlayIndex { index: usize },
    Pause,
    TogglePause,
    Stop,
    SkipForward,
    SkipBackward,
    SeekForward,
    SeekBackward,
    SetPosition { fraction: f32 },
    SetVolume { value: u8 },
    SetMute { muted: bool },
    ToggleMute,
    AddPlaylist { name: Option<String> },
    ClosePlaylist { index: usize },
    SetActive { index: usize },
    RenamePlaylist { index: usize, name: String },
    InsertTracks { index: usize, locators: Vec<String> },
    AppendFolders { folders: Vec<String> },
    RemoveTracks { indices: Vec<usize> },
    MoveTracksUp { indices: Vec<usize> },
    MoveTracksDown { indices: Vec<usize> },
    ClearPlaylist,
    SetMode { mode: PlaybackMode },
    /// Advance the active playlist to the next mode in `PlaybackMode::cycle` order.
    CycleMode,
    SetColumnLayout { index: usize, layout: String },
    GetState,
}

// ── snapshots ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PlaylistSummary {
    pub id: u32,
    pub name: String,
    pub mode: PlaybackMode,
    pub current: Option<usize>,
    pub tracks: Vec<String>,
}

/// Full player view.  `rev` is a monotonically increasing counter incremented
/// every time the snapshot is replaced.  Clients can use it to detect missed
/// updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub rev: u64,
    pub playlists: Vec<PlaylistSummary>,
    pub active: usize,
    pub state: PlaybackState,
    pub current_track: Option<String>,
    pub position_ms: i64,
    pub duration_ms: i64,
    pub volume: u8,
    pub muted: bool,
}

/// Messages sent from the daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        snapshot: SessionSnapshot,
    },
    Snapshot {
        data: SessionSnapshot,
    },
    Event {
        notification: Notification,
    },
    Log {
        message: String,
    },
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        Ok(Self::decode_frame(data)?)
    }

    /// Decode the frame at the start of `data`.  On `FrameError::Malformed`
    /// the caller can skip `consumed` bytes and carry on with the next frame.
    pub fn decode_frame(data: &[u8]) -> Result<(Self, usize), FrameError> {
        if data.len() < 4 {
            return Err(FrameError::Incomplete);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }
        if data.len() < 4 + len {
            return Err(FrameError::Incomplete);
        }
        serde_json::from_slice(&data[4..4 + len])
            .map(|msg| (msg, 4 + len))
            .map_err(|source| FrameError::Malformed {
                consumed: 4 + len,
                source,
            })
    }
}
