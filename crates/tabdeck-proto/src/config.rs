use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    /// Key/value store holding the persisted session.
    #[serde(default = "default_session_file")]
    pub session_file: PathBuf,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_tcp_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

/// Player behaviour.  Passed explicitly to the engine and the session manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Step used by seek forward / backward, in milliseconds.
    #[serde(default = "default_seek_delta_ms")]
    pub seek_delta_ms: i64,
    /// Save all playlists on exit and restore them at startup.
    #[serde(default)]
    pub keep_playlists: bool,
    /// Treat restored local tracks whose file is gone as not found.
    #[serde(default = "default_verify_tracks")]
    pub verify_tracks_on_restore: bool,
    /// Volume (0..=100) applied to the backend at startup.
    #[serde(default = "default_volume")]
    pub default_volume: u8,
    /// Buffer size of the notification channel per subscriber.
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MpvConfig {
    /// Explicit mpv binary; searched beside the executable and on PATH if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
    /// Extra command-line arguments passed to mpv.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            session_file: default_session_file(),
            bind_address: default_bind_address(),
            port: default_tcp_port(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            port: default_http_port(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            seek_delta_ms: default_seek_delta_ms(),
            keep_playlists: false,
            verify_tracks_on_restore: default_verify_tracks(),
            default_volume: default_volume(),
            notification_capacity: default_notification_capacity(),
        }
    }
}

fn default_pid_file() -> PathBuf {
    platform::data_dir().join("daemon.pid")
}

fn default_session_file() -> PathBuf {
    platform::data_dir().join("session.json")
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_tcp_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_http_enabled() -> bool {
    false
}

fn default_http_port() -> u16 {
    platform::DAEMON_HTTP_PORT
}

fn default_seek_delta_ms() -> i64 {
    5000
}

fn default_verify_tracks() -> bool {
    true
}

fn default_volume() -> u8 {
    80
}

fn default_notification_capacity() -> usize {
    256
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
