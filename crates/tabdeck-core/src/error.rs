use tabdeck_proto::protocol::{ErrorKind, Notification};
use thiserror::Error;

/// Failures the player recovers from locally and reports as notifications.
///
/// A non-local track is not an error: it is handed off through
/// `Notification::PlayRemoteTrack`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlayerError {
    #[error("cannot open '{locator}': {reason}")]
    MediaOpen { locator: String, reason: String },

    #[error("backend failure: {0}")]
    BackendFatal(String),

    #[error("{} track(s) could not be restored", .0.len())]
    TracksNotFound(Vec<String>),
}

impl PlayerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PlayerError::BackendFatal(_))
    }

    pub fn into_notification(self) -> Notification {
        let kind = match &self {
            PlayerError::TracksNotFound(locators) => {
                return Notification::TracksNotFound {
                    locators: locators.clone(),
                }
            }
            PlayerError::MediaOpen { .. } => ErrorKind::MediaOpen,
            PlayerError::BackendFatal(_) => ErrorKind::BackendFatal,
        };
        Notification::Error {
            kind,
            message: self.to_string(),
            fatal: self.is_fatal(),
        }
    }
}
