use crate::backend::Backend;
use crate::playlist::Playlist;
use crate::session::SessionManager;
use crate::settings::SettingsStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tabdeck_proto::config::PlaybackConfig;
use tabdeck_proto::protocol::PlaybackMode;
use tabdeck_proto::track::Track;
use tracing::{debug, info, warn};

pub const PLAYLISTS_KEY: &str = "playlists";
pub const COLUMN_STATE_KEY: &str = "columnStateForPlaylist";
pub const SESSION_IDS_KEY: &str = "currentSessionPlaylists";

/// One persisted playlist.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaylistGroup {
    pub tracks: Vec<String>,
    pub name: String,
    pub mode: i64,
}

/// Output of `SessionSerializer::restore`, consumed by
/// `SessionManager::from_restored`.
#[derive(Debug, Default)]
pub struct RestoredSession {
    pub playlists: Vec<Playlist>,
    /// Locators that could not be resolved, in encounter order.
    pub unresolved: Vec<String>,
}

/// Moves the session in and out of a `SettingsStore`.
#[derive(Debug, Clone)]
pub struct SessionSerializer {
    keep_playlists: bool,
    verify_tracks: bool,
}

impl SessionSerializer {
    pub fn new(config: &PlaybackConfig) -> Self {
        Self {
            keep_playlists: config.keep_playlists,
            verify_tracks: config.verify_tracks_on_restore,
        }
    }

    /// Write every non-empty playlist, in tab order.
    pub fn serialize<B: Backend>(&self, session: &SessionManager<B>, store: &mut SettingsStore) {
        if !self.keep_playlists {
            debug!("keep_playlists is off, not saving the session");
            return;
        }

        let mut groups = Vec::new();
        let mut layouts = Map::new();
        let mut ids = Vec::new();
        for playlist in session.playlists().iter().filter(|p| !p.is_empty()) {
            if let Some(layout) = playlist.column_layout() {
                layouts.insert(groups.len().to_string(), Value::String(layout.to_string()));
            }
            ids.push(playlist.id());
            groups.push(PlaylistGroup {
                tracks: playlist.tracks().iter().map(Track::uri).collect(),
                name: playlist.name().to_string(),
                mode: playlist.mode().code(),
            });
        }

        info!("Saving {} playlist(s)", groups.len());
        store.set(PLAYLISTS_KEY, serde_json::json!(groups));
        store.set(SESSION_IDS_KEY, serde_json::json!(ids));
        if layouts.is_empty() {
            store.remove(COLUMN_STATE_KEY);
        } else {
            store.set(COLUMN_STATE_KEY, Value::Object(layouts));
        }
    }

    /// Rebuild playlists from the store.  Unresolvable locators are collected
    /// rather than reported, so the caller can report them once.
    pub fn restore(&self, store: &SettingsStore) -> RestoredSession {
        let mut restored = RestoredSession::default();
        if !self.keep_playlists {
            return restored;
        }
        let Some(Value::Array(raw_groups)) = store.get(PLAYLISTS_KEY) else {
            return restored;
        };

        let stored_ids: Vec<Option<u32>> = match store.get(SESSION_IDS_KEY) {
            Some(Value::Array(ids)) => ids
                .iter()
                .map(|v| v.as_u64().and_then(|id| u32::try_from(id).ok()))
                .collect(),
            _ => Vec::new(),
        };
        let layouts = match store.get(COLUMN_STATE_KEY) {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };

        let mut used_ids = HashSet::new();
        for (position, raw) in raw_groups.iter().enumerate() {
            let group: PlaylistGroup = match serde_json::from_value(raw.clone()) {
                Ok(group) => group,
                Err(e) => {
                    warn!("Skipping malformed playlist #{}: {}", position, e);
                    continue;
                }
            };

            let id = stored_ids
                .get(position)
                .copied()
                .flatten()
                .filter(|id| !used_ids.contains(id))
                .unwrap_or_else(|| next_free_id(&used_ids));
            used_ids.insert(id);

            let mut playlist = Playlist::new(id, group.name);
            playlist.set_mode(PlaybackMode::from_code(group.mode).unwrap_or_else(|| {
                warn!("Unknown playback mode {} in playlist #{}", group.mode, position);
                PlaybackMode::Sequential
            }));
            if let Some(Value::String(layout)) = layouts.get(&position.to_string()) {
                playlist.set_column_layout(Some(layout.clone()));
            }

            let mut tracks = Vec::with_capacity(group.tracks.len());
            for raw_track in &group.tracks {
                let track = Track::parse(raw_track);
                if self.resolves(&track) {
                    tracks.push(track);
                } else {
                    restored.unresolved.push(track.locator().to_string());
                }
            }
            playlist.append(tracks);
            restored.playlists.push(playlist);
        }

        info!(
            "Restored {} playlist(s), {} track(s) not found",
            restored.playlists.len(),
            restored.unresolved.len()
        );
        restored
    }

    fn resolves(&self, track: &Track) -> bool {
        if !track.is_local() {
            return false;
        }
        if !self.verify_tracks {
            return true;
        }
        track.path().map(|p| p.exists()).unwrap_or(false)
    }
}

fn next_free_id(used: &HashSet<u32>) -> u32 {
    (1..).find(|id| !used.contains(id)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(keep: bool, verify: bool) -> PlaybackConfig {
        PlaybackConfig {
            keep_playlists: keep,
            verify_tracks_on_restore: verify,
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_restores_nothing() {
        let mut store = SettingsStore::in_memory();
        store.set(
            PLAYLISTS_KEY,
            json!([{ "tracks": ["file:///a.mp3"], "name": "A", "mode": 2 }]),
        );
        let restored = SessionSerializer::new(&config(false, false)).restore(&store);
        assert!(restored.playlists.is_empty());
    }

    #[test]
    fn test_remote_tracks_are_unresolved() {
        let mut store = SettingsStore::in_memory();
        store.set(
            PLAYLISTS_KEY,
            json!([
                { "tracks": ["file:///a.mp3", "http://x/y.mp3"], "name": "A", "mode": 3 },
                { "tracks": ["file:///b.mp3"], "name": "B", "mode": 2 },
            ]),
        );
        let restored = SessionSerializer::new(&config(true, false)).restore(&store);

        assert_eq!(restored.playlists.len(), 2);
        assert_eq!(restored.playlists[0].len(), 1);
        assert_eq!(restored.playlists[0].mode(), PlaybackMode::RepeatAll);
        assert_eq!(restored.playlists[1].name(), "B");
        assert_eq!(restored.unresolved, vec!["http://x/y.mp3".to_string()]);
    }

    #[test]
    fn test_malformed_group_and_unknown_mode() {
        let mut store = SettingsStore::in_memory();
        store.set(
            PLAYLISTS_KEY,
            json!([
                { "tracks": "oops", "name": "bad", "mode": 2 },
                { "tracks": ["/c.mp3"], "name": "C", "mode": 42 },
            ]),
        );
        let restored = SessionSerializer::new(&config(true, false)).restore(&store);
        assert_eq!(restored.playlists.len(), 1);
        assert_eq!(restored.playlists[0].name(), "C");
        assert_eq!(restored.playlists[0].mode(), PlaybackMode::Sequential);
    }

    #[test]
    fn test_missing_files_unresolved_when_verifying() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("here.flac");
        std::fs::write(&present, b"").unwrap();
        let missing = dir.path().join("gone.flac");

        let mut store = SettingsStore::in_memory();
        store.set(
            PLAYLISTS_KEY,
            json!([{
                "tracks": [Track::local(&present).uri(), Track::local(&missing).uri()],
                "name": "P",
                "mode": 2,
            }]),
        );
        let restored = SessionSerializer::new(&config(true, true)).restore(&store);
        assert_eq!(restored.playlists[0].len(), 1);
        assert_eq!(
            restored.unresolved,
            vec![missing.to_string_lossy().into_owned()]
        );
    }

    #[test]
    fn test_stored_ids_and_layouts() {
        let mut store = SettingsStore::in_memory();
        store.set(
            PLAYLISTS_KEY,
            json!([
                { "tracks": ["/a"], "name": "A", "mode": 2 },
                { "tracks": ["/b"], "name": "B", "mode": 2 },
            ]),
        );
        store.set(SESSION_IDS_KEY, json!([7, 7]));
        store.set(COLUMN_STATE_KEY, json!({ "1": "layout-b" }));

        let restored = SessionSerializer::new(&config(true, false)).restore(&store);
        assert_eq!(restored.playlists[0].id(), 7);
        assert_ne!(restored.playlists[1].id(), 7);
        assert_eq!(restored.playlists[0].column_layout(), None);
        assert_eq!(restored.playlists[1].column_layout(), Some("layout-b"));
    }
}
