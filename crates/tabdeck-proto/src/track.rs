use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const FILE_SCHEME: &str = "file://";

/// A single playable item.  Identity is the locator: two tracks with the same
/// locator are the same track.
///
/// Local tracks store the plain filesystem path as their locator; remote
/// tracks keep the full URI (`https://…`, `smb://…`, …).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Track {
    locator: String,
    is_local: bool,
}

impl Track {
    /// Parse a locator string as received from the UI or the session file.
    ///
    /// `file://` URIs become local paths, anything else carrying a scheme is
    /// remote, and bare strings are treated as local paths.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(path) = raw.strip_prefix(FILE_SCHEME) {
            return Self::local(path);
        }
        if has_scheme(raw) {
            return Self {
                locator: raw.to_string(),
                is_local: false,
            };
        }
        Self::local(raw)
    }

    pub fn local(path: impl AsRef<Path>) -> Self {
        Self {
            locator: path.as_ref().to_string_lossy().into_owned(),
            is_local: true,
        }
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    /// Filesystem path for local tracks.
    pub fn path(&self) -> Option<PathBuf> {
        self.is_local.then(|| PathBuf::from(&self.locator))
    }

    /// Persisted form: `file://<path>` for local tracks, the URI otherwise.
    pub fn uri(&self) -> String {
        if self.is_local {
            format!("{}{}", FILE_SCHEME, self.locator)
        } else {
            self.locator.clone()
        }
    }
}

/// `scheme://rest` where scheme is RFC 3986-ish and at least two characters,
/// so Windows drive letters (`C:\…`) stay local.
fn has_scheme(raw: &str) -> bool {
    match raw.find("://") {
        Some(idx) if idx >= 2 => raw[..idx]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')),
        _ => false,
    }
}
