use std::path::PathBuf;

pub const DAEMON_TCP_PORT: u16 = 9877;
pub const DAEMON_HTTP_PORT: u16 = 8990;

/// One mpv IPC endpoint per daemon process.
#[cfg(unix)]
pub fn mpv_socket_name() -> String {
    std::env::temp_dir()
        .join(format!("tabdeck-mpv-{}.sock", std::process::id()))
        .display()
        .to_string()
}

#[cfg(windows)]
pub fn mpv_socket_name() -> String {
    format!("tabdeck-mpv-{}", std::process::id())
}

#[cfg(unix)]
pub fn mpv_socket_arg() -> String {
    format!("--input-ipc-server={}", mpv_socket_name())
}

#[cfg(windows)]
pub fn mpv_socket_arg() -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", mpv_socket_name())
}

pub fn data_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("tabdeck")
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tabdeck")
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("tabdeck")
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tabdeck")
    }
}

#[cfg(unix)]
pub fn mpv_binary_name() -> &'static str {
    "mpv"
}

#[cfg(windows)]
pub fn mpv_binary_name() -> &'static str {
    "mpv.exe"
}

fn find_beside_exe(name: &str) -> Option<PathBuf> {
    let current_exe = std::env::current_exe().ok()?;
    let dir = current_exe.parent()?;
    let candidate = dir.join(name);
    candidate.exists().then_some(candidate)
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|p| p.exists())
}

/// Resolve the mpv executable.  A configured path is used as-is and must
/// exist; otherwise the directory of the daemon binary, then `PATH`.
pub fn find_mpv_binary(configured: Option<&PathBuf>) -> Option<PathBuf> {
    if let Some(p) = configured {
        return p.exists().then(|| p.clone());
    }
    find_beside_exe(mpv_binary_name()).or_else(|| find_on_path(mpv_binary_name()))
}
