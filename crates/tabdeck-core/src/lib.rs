//! Playback and playlist core.
//!
//! ```text
//!   SessionManager ── owns ──> Vec<Playlist> (tabs) + reserved "add" slot
//!         │
//!         └── owns ──> PlaybackEngine<B: Backend> ── drives ──> Backend adapter
//!                              ▲
//!   backend events ────────────┘  (marshaled onto the control task by the caller)
//! ```
//!
//! Everything here is synchronous and single-owner.  Outward notifications go
//! through a [`notifier::Notifier`].
pub mod backend;
pub mod engine;
pub mod error;
pub mod notifier;
pub mod playlist;
pub mod serializer;
pub mod session;
pub mod settings;

pub use backend::{Backend, BackendEvent, BackendEventKind, MediaId};
pub use engine::{PlaybackEngine, SeekOutcome};
pub use error::PlayerError;
pub use notifier::Notifier;
pub use playlist::Playlist;
pub use serializer::{RestoredSession, SessionSerializer};
pub use session::SessionManager;
pub use settings::SettingsStore;
