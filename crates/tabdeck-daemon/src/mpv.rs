//! mpv IPC driver with separated reader/writer tasks, and the `Backend`
//! adapter built on top of it.
//!
//! ```text
//!   MpvDriver::launch()            (control task, never waits on mpv)
//!   connect()                      (spawned task)
//!         │
//!         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
//!         └── reader_task   ← reads JSON lines from socket
//!                                ├── response (has request_id) → matched oneshot::Sender
//!                                └── event / property-change   → event_tx channel
//!
//!   MpvBackend (owned by the PlaybackEngine)
//!         ├── commands → MpvHandle::post (queued, never awaited)
//!         └── translate(MpvEvent) → Vec<BackendEvent>  (called on the control task)
//! ```
//!
//! Unix uses a domain socket, Windows a named pipe `\\.\pipe\<name>`.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tabdeck_core::backend::{Backend, BackendEvent, BackendEventKind, MediaId, DEFAULT_TRACK};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── observation property IDs ──────────────────────────────────────────────────

/// Fixed observe_property IDs.  We match on these in property-change events.
pub const OBS_PAUSE: u64 = 2;
pub const OBS_TIME_POS: u64 = 4;
pub const OBS_DURATION: u64 = 5;
pub const OBS_PAUSED_FOR_CACHE: u64 = 8;
pub const OBS_VOLUME: u64 = 9;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

// ── internal channel types ────────────────────────────────────────────────────

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.
#[derive(Debug, Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    fn request(command: &Value) -> anyhow::Result<(PendingRequest, oneshot::Receiver<anyhow::Result<Value>>)> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        Ok((
            PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            },
            reply_rx,
        ))
    }

    /// Send a command and await mpv's response.
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let (req, reply_rx) = Self::request(&command)?;
        let req_id = req.req_id;
        self.tx
            .send(req)
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    /// Queue a command without waiting.  Commands keep their order; a failed
    /// reply is only logged.
    pub fn post(&self, command: Value) {
        let (req, reply_rx) = match Self::request(&command) {
            Ok(r) => r,
            Err(e) => {
                warn!("mpv: cannot encode {}: {}", command, e);
                return;
            }
        };
        if let Err(e) = self.tx.try_send(req) {
            warn!("mpv: dropping command {}: {}", command, e);
            return;
        }
        tokio::spawn(async move {
            match tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx).await {
                Ok(Ok(Ok(_))) => {}
                Ok(Ok(Err(e))) => debug!("mpv: {} failed: {}", command, e),
                Ok(Err(_)) => debug!("mpv: reply channel dropped for {}", command),
                Err(_) => warn!("mpv: IPC timeout for {}", command),
            }
        });
    }

    /// Register observe_property for all properties the backend tracks.
    /// Must be called after every fresh connection.
    pub async fn observe_all_properties(&self) {
        let props = [
            (OBS_PAUSE, "pause"),
            (OBS_TIME_POS, "time-pos"),
            (OBS_DURATION, "duration"),
            (OBS_PAUSED_FOR_CACHE, "paused-for-cache"),
            (OBS_VOLUME, "volume"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process and manages (re)connection.
pub struct MpvDriver {
    socket_name: String,
    binary: Option<PathBuf>,
    extra_args: Vec<String>,
    process: Option<tokio::process::Child>,
    /// Volume passed to a freshly spawned process (0..=100).
    pub last_volume: u8,
}

impl MpvDriver {
    pub fn new(binary: Option<PathBuf>, extra_args: Vec<String>, volume: u8) -> Self {
        Self {
            socket_name: tabdeck_proto::platform::mpv_socket_name(),
            binary,
            extra_args,
            process: None,
            last_volume: volume,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    /// Kill the process if running and drop its IPC socket.
    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
        #[cfg(unix)]
        let _ = tokio::fs::remove_file(&self.socket_name).await;
    }

    /// Replace any running process with a fresh mpv.  Returns the IPC
    /// endpoint to hand to [`connect`]; nothing here waits on mpv.
    pub fn launch(&mut self) -> anyhow::Result<String> {
        if let Some(mut p) = self.process.take() {
            let _ = p.start_kill();
        }
        #[cfg(unix)]
        let _ = std::fs::remove_file(&self.socket_name);

        self.spawn_process()?;
        Ok(self.socket_name.clone())
    }

    fn spawn_process(&mut self) -> anyhow::Result<()> {
        let mpv_binary = tabdeck_proto::platform::find_mpv_binary(self.binary.as_ref())
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        info!("mpv: spawning {}", mpv_binary.display());

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--keep-open=no")
            .arg(tabdeck_proto::platform::mpv_socket_arg())
            .arg("--quiet")
            .arg(format!("--volume={}", self.last_volume.min(100)))
            .args(&self.extra_args)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }
}

// ── connect ───────────────────────────────────────────────────────────────────

/// Wait for a launched mpv to open its IPC endpoint, start the IO tasks and
/// register the property observations.  Runs off the control task.
pub async fn connect(socket_name: String, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvHandle> {
    let handle = open_ipc(&socket_name, event_tx).await?;
    handle.observe_all_properties().await;
    Ok(handle)
}

#[cfg(unix)]
async fn open_ipc(socket_name: &str, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvHandle> {
    let socket_path = PathBuf::from(socket_name);
    for _ in 0..50 {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        if socket_path.exists() {
            break;
        }
    }
    if !socket_path.exists() {
        anyhow::bail!("mpv IPC socket did not appear");
    }
    tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

    let stream = UnixStream::connect(&socket_path).await?;
    info!("mpv: connected to IPC socket");
    let (read_half, write_half) = stream.into_split();
    Ok(spawn_io(BufReader::new(read_half), write_half, event_tx))
}

#[cfg(windows)]
async fn open_ipc(socket_name: &str, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvHandle> {
    let pipe_path = format!(r"\\.\pipe\{}", socket_name);
    for _ in 0..50 {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        if let Ok(client) = ClientOptions::new().open(&pipe_path) {
            info!("mpv: connected to named pipe");
            let (read_half, write_half) = tokio::io::split(client);
            return Ok(spawn_io(BufReader::new(read_half), write_half, event_tx));
        }
    }
    anyhow::bail!("mpv named pipe did not appear")
}

fn spawn_io<R, W>(reader: BufReader<R>, writer: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(256);

    tokio::spawn(writer_task(writer, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC connection closed")));
                }
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error").to_string();
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC read error: {}", e)));
                }
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        {
            let mut map = pending.lock().await;
            map.insert(req.req_id, req.reply);
        }
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            let mut map = pending.lock().await;
            if let Some(tx) = map.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── Backend adapter ───────────────────────────────────────────────────────────

/// `Backend` implementation driving mpv.
///
/// Queries are answered from properties mpv pushes through `observe_property`,
/// so none of them touch the socket.
pub struct MpvBackend {
    handle: Option<MpvHandle>,
    media: MediaId,
    /// Set by `open` until mpv reports `start-file` for the new load; the
    /// `end-file` of the replaced media arrives in that window and is ignored.
    awaiting_start: bool,
    loaded: bool,
    paused: bool,
    buffering: bool,
    time_pos: Option<f64>,
    duration: Option<f64>,
    volume: u8,
    audio_track: i32,
}

impl Default for MpvBackend {
    fn default() -> Self {
        Self {
            handle: None,
            media: MediaId::default(),
            awaiting_start: false,
            loaded: false,
            paused: true,
            buffering: false,
            time_pos: None,
            duration: None,
            volume: 100,
            audio_track: DEFAULT_TRACK,
        }
    }
}

impl MpvBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a fresh connection and push the cached settings to it.
    pub fn attach(&mut self, handle: MpvHandle) {
        handle.post(json!(["set_property", "volume", self.volume]));
        handle.post(json!(["set_property", "aid", aid_value(self.audio_track)]));
        self.handle = Some(handle);
    }

    /// Drop the connection after mpv died.  Cached media state is reset.
    pub fn detach(&mut self) {
        self.handle = None;
        self.awaiting_start = false;
        self.loaded = false;
        self.paused = true;
        self.buffering = false;
        self.time_pos = None;
        self.duration = None;
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    fn post(&self, command: Value) {
        match &self.handle {
            Some(h) => h.post(command),
            None => debug!("mpv: not connected, dropping {}", command),
        }
    }

    fn event(&self, kind: BackendEventKind) -> BackendEvent {
        BackendEvent::new(self.media, kind)
    }

    fn run_state(&self) -> BackendEventKind {
        if self.paused {
            BackendEventKind::Paused
        } else if self.buffering {
            BackendEventKind::Buffering
        } else {
            BackendEventKind::Playing
        }
    }

    /// Turn one raw mpv event into normalized backend events for the current
    /// media, updating the cached properties on the way.
    pub fn translate(&mut self, evt: &MpvEvent) -> Vec<BackendEvent> {
        if let Some((obs_id, data)) = evt.as_property_change() {
            return self.translate_property(obs_id, data);
        }

        match evt.event_name() {
            Some("start-file") => {
                self.awaiting_start = false;
                self.loaded = false;
                self.time_pos = None;
                self.duration = None;
                vec![self.event(BackendEventKind::Opening)]
            }
            Some("file-loaded") => {
                self.loaded = true;
                vec![
                    self.event(BackendEventKind::TrackChanged),
                    self.event(self.run_state()),
                ]
            }
            Some("end-file") => {
                if self.awaiting_start {
                    debug!("mpv: end-file of replaced media");
                    return Vec::new();
                }
                self.loaded = false;
                let reason = evt.raw.get("reason").and_then(|v| v.as_str()).unwrap_or("unknown");
                info!("mpv: end-file reason={}", reason);
                let kind = match reason {
                    "eof" => BackendEventKind::End,
                    "error" => BackendEventKind::Error {
                        message: evt
                            .raw
                            .get("file_error")
                            .and_then(|v| v.as_str())
                            .unwrap_or("playback error")
                            .to_string(),
                        fatal: false,
                    },
                    _ => BackendEventKind::Stopped,
                };
                vec![self.event(kind)]
            }
            _ => Vec::new(),
        }
    }

    fn translate_property(&mut self, obs_id: u64, data: &Value) -> Vec<BackendEvent> {
        match obs_id {
            OBS_PAUSE => {
                let paused = data.as_bool().unwrap_or(false);
                if paused == self.paused {
                    return Vec::new();
                }
                self.paused = paused;
                if self.loaded {
                    vec![self.event(self.run_state())]
                } else {
                    Vec::new()
                }
            }
            OBS_PAUSED_FOR_CACHE => {
                let buffering = data.as_bool().unwrap_or(false);
                if buffering == self.buffering {
                    return Vec::new();
                }
                self.buffering = buffering;
                if self.loaded {
                    vec![self.event(self.run_state())]
                } else {
                    Vec::new()
                }
            }
            OBS_TIME_POS => {
                self.time_pos = data.as_f64();
                if self.loaded && self.length_ms() > 0 {
                    vec![self.event(BackendEventKind::PositionChanged(self.position()))]
                } else {
                    Vec::new()
                }
            }
            OBS_DURATION => {
                self.duration = data.as_f64();
                Vec::new()
            }
            OBS_VOLUME => {
                if let Some(v) = data.as_f64() {
                    self.volume = v.round().clamp(0.0, 100.0) as u8;
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

fn aid_value(track: i32) -> Value {
    if track < 0 {
        json!("no")
    } else {
        json!("auto")
    }
}

impl Backend for MpvBackend {
    fn open(&mut self, locator: &str) -> MediaId {
        self.media = MediaId(self.media.0 + 1);
        self.awaiting_start = true;
        self.loaded = false;
        self.time_pos = None;
        self.duration = None;
        self.paused = true;
        self.post(json!(["set_property", "pause", true]));
        self.post(json!(["loadfile", locator, "replace"]));
        self.media
    }

    fn play(&mut self) {
        self.post(json!(["set_property", "pause", false]));
    }

    fn pause(&mut self) {
        self.post(json!(["set_property", "pause", true]));
    }

    fn resume(&mut self) {
        self.post(json!(["set_property", "pause", false]));
    }

    fn stop(&mut self) {
        self.post(json!(["stop"]));
    }

    fn position(&self) -> f32 {
        match (self.time_pos, self.duration) {
            (Some(pos), Some(len)) if len > 0.0 => (pos / len).clamp(0.0, 1.0) as f32,
            _ => 0.0,
        }
    }

    fn set_position(&mut self, fraction: f32) {
        if let Some(len) = self.duration {
            self.time_pos = Some(len * fraction as f64);
        }
        self.post(json!(["set_property", "percent-pos", fraction as f64 * 100.0]));
    }

    fn length_ms(&self) -> i64 {
        self.duration.map(|d| (d * 1000.0) as i64).unwrap_or(0)
    }

    fn volume(&self) -> u8 {
        self.volume
    }

    fn set_volume(&mut self, volume: u8) {
        self.volume = volume.min(100);
        self.post(json!(["set_property", "volume", self.volume]));
    }

    fn audio_track(&self) -> i32 {
        self.audio_track
    }

    fn set_audio_track(&mut self, id: i32) {
        self.audio_track = id;
        self.post(json!(["set_property", "aid", aid_value(id)]));
    }
}
