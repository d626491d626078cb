//! DaemonCore: single-owner event loop for the player.
//!
//! All tasks that need to touch the session send `DaemonEvent` messages to
//! this loop.  DaemonCore owns the `SessionManager` (and through it the
//! engine and `MpvBackend`) and the `MpvDriver` exclusively; no other task
//! touches them.
//!
//! Raw mpv events are translated into `BackendEvent`s here, on the control
//! task, so the engine sees backend callbacks in arrival order and never
//! concurrently with a client command.
//!
//! After each event the snapshot in `StateManager` is replaced.  Session
//! notifications are forwarded to clients as `Broadcast::Event` in emission
//! order.

use std::path::PathBuf;

use tabdeck_core::backend::BackendEvent;
use tabdeck_core::{Notifier, PlaybackEngine, SessionManager, SessionSerializer, SettingsStore};
use tabdeck_proto::config::Config;
use tabdeck_proto::protocol::{Broadcast, Command};
use tabdeck_proto::state::StateManager;
use tabdeck_proto::track::Track;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::mpv::{self, MpvBackend, MpvDriver, MpvEvent, MpvHandle};

const HEARTBEAT_SECS: u64 = 10;

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// All inputs into the DaemonCore loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from a socket client or the HTTP API.
    ClientCommand(Command),
    /// Heartbeat tick for process liveness checks.
    HeartbeatTick,
    /// Raw mpv unsolicited event (forwarded from reader task).
    MpvEvent(MpvEvent),
    /// A connect attempt finished and mpv is observed.
    BackendReady { attempt: u64, handle: MpvHandle },
    /// A connect attempt gave up.
    BackendFailed { attempt: u64, reason: String },
    /// Shutdown requested.
    Shutdown,
}

// ── DaemonCore ────────────────────────────────────────────────────────────────

pub struct DaemonCore {
    config: Config,
    session: SessionManager<MpvBackend>,
    serializer: SessionSerializer,
    store: SettingsStore,
    state_manager: StateManager,
    mpv_driver: MpvDriver,
    /// Id of the connect attempt in flight, if any.
    connecting: Option<u64>,
    attempts: u64,
    /// Commands received while a connect attempt is in flight, in arrival order.
    queued: Vec<Command>,
    /// Channel to forward mpv events back into our own event loop.
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<Broadcast>,
}

impl DaemonCore {
    /// Restore the persisted session and wire the notification forwarder.
    pub fn new(
        config: Config,
        broadcast_tx: broadcast::Sender<Broadcast>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        let notifier = Notifier::new(config.playback.notification_capacity);
        spawn_notification_forwarder(&notifier, broadcast_tx.clone());

        let store = SettingsStore::load(config.daemon.session_file.clone());
        let serializer = SessionSerializer::new(&config.playback);
        let restored = serializer.restore(&store);

        let engine = PlaybackEngine::new(MpvBackend::new(), notifier.clone(), &config.playback);
        let session = SessionManager::from_restored(engine, notifier, restored);
        info!(
            "Session ready: {} playlist(s), active {}",
            session.playlists().len(),
            session.active_index()
        );

        let mpv_driver = MpvDriver::new(
            config.mpv.binary.clone(),
            config.mpv.extra_args.clone(),
            config.playback.default_volume,
        );

        Self {
            config,
            session,
            serializer,
            store,
            state_manager: StateManager::new(),
            mpv_driver,
            connecting: None,
            attempts: 0,
            queued: Vec::new(),
            event_tx,
            broadcast_tx,
        }
    }

    /// Shared snapshot handle (for the socket and HTTP servers).
    pub fn state_manager(&self) -> StateManager {
        self.state_manager.clone()
    }

    /// Run the core event loop.  Returns when a `Shutdown` event is received
    /// or the event channel is closed.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");
        self.publish(true).await;

        let heartbeat_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(HEARTBEAT_SECS)).await;
                if heartbeat_tx.send(DaemonEvent::HeartbeatTick).await.is_err() {
                    break;
                }
            }
        });

        loop {
            match event_rx.recv().await {
                None => {
                    info!("DaemonCore: event channel closed, shutting down");
                    break;
                }
                Some(DaemonEvent::Shutdown) => {
                    info!("DaemonCore: shutdown requested");
                    break;
                }
                Some(event) => self.handle_event(event).await,
            }
        }

        self.cleanup().await;
        Ok(())
    }

    async fn handle_event(&mut self, event: DaemonEvent) {
        match event {
            DaemonEvent::ClientCommand(cmd) => {
                info!("DaemonCore: command {:?}", cmd);
                self.dispatch(cmd);
                self.publish(true).await;
            }

            DaemonEvent::MpvEvent(evt) => {
                let events = self.session.engine_mut().backend_mut().translate(&evt);
                let mut changed = false;
                for event in events {
                    changed |= self.session.handle_backend_event(event).is_some();
                }
                self.publish(changed).await;
            }

            DaemonEvent::HeartbeatTick => {
                self.check_backend();
                self.publish(false).await;
            }

            DaemonEvent::BackendReady { attempt, handle } => {
                if self.connecting != Some(attempt) {
                    debug!("DaemonCore: ignoring stale connect attempt {}", attempt);
                    return;
                }
                self.connecting = None;
                self.session.engine_mut().backend_mut().attach(handle);
                info!("DaemonCore: mpv ready, replaying {} command(s)", self.queued.len());
                for cmd in std::mem::take(&mut self.queued) {
                    self.dispatch(cmd);
                }
                self.publish(true).await;
            }

            DaemonEvent::BackendFailed { attempt, reason } => {
                if self.connecting != Some(attempt) {
                    debug!("DaemonCore: ignoring stale connect failure {}", attempt);
                    return;
                }
                self.connecting = None;
                error!("DaemonCore: failed to start mpv: {}", reason);
                self.mpv_driver.kill().await;
                self.session
                    .handle_backend_event(BackendEvent::fatal(format!("cannot start mpv: {}", reason)));
                for cmd in std::mem::take(&mut self.queued) {
                    if needs_backend(&cmd) {
                        warn!("DaemonCore: no backend, dropping {:?}", cmd);
                    } else {
                        self.apply_command(cmd);
                    }
                }
                self.publish(true).await;
            }

            DaemonEvent::Shutdown => {}
        }
    }

    // ── command handlers ──────────────────────────────────────────────────────

    /// Run `cmd` now, or queue it behind a connect attempt.  A playback
    /// command never runs without a connected backend.
    fn dispatch(&mut self, cmd: Command) {
        if self.connecting.is_some() {
            debug!("DaemonCore: queued {:?} until mpv is up", cmd);
            self.queued.push(cmd);
            return;
        }
        if needs_backend(&cmd) {
            self.check_backend();
            if !self.session.engine().backend().is_connected() {
                if self.start_backend() {
                    self.queued.push(cmd);
                } else {
                    warn!("DaemonCore: no backend, dropping {:?}", cmd);
                }
                return;
            }
        }
        self.apply_command(cmd);
    }

    fn apply_command(&mut self, cmd: Command) {
        let session = &mut self.session;
        match cmd {
            Command::Play => session.play(),
            Command::PlayIndex { index } => session.play_index(index),
            Command::Pause => session.pause(),
            Command::TogglePause => session.toggle_pause(),
            Command::Stop => session.stop(),
            Command::SkipForward => session.skip_forward(),
            Command::SkipBackward => session.skip_backward(),
            Command::SeekForward => session.seek_forward(),
            Command::SeekBackward => session.seek_backward(),
            Command::SetPosition { fraction } => session.set_position(fraction),
            Command::SetVolume { value } => {
                session.set_volume(value);
                self.mpv_driver.last_volume = session.volume();
            }
            Command::SetMute { muted } => session.set_mute(muted),
            Command::ToggleMute => session.toggle_mute(),
            Command::AddPlaylist { name } => {
                session.add_playlist(name);
            }
            Command::ClosePlaylist { index } => session.close_playlist(index),
            Command::SetActive { index } => session.set_active(index),
            Command::RenamePlaylist { index, name } => session.rename_playlist(index, name),
            Command::InsertTracks { index, locators } => {
                let tracks = locators.iter().map(|l| Track::parse(l)).collect();
                session.insert_tracks(index, tracks);
            }
            Command::AppendFolders { folders } => {
                let folders: Vec<PathBuf> = folders.into_iter().map(PathBuf::from).collect();
                session.append_external_folders(&folders);
            }
            Command::RemoveTracks { indices } => session.remove_tracks(&indices),
            Command::MoveTracksUp { indices } => {
                session.move_tracks_up(&indices);
            }
            Command::MoveTracksDown { indices } => {
                session.move_tracks_down(&indices);
            }
            Command::ClearPlaylist => session.clear_active(),
            Command::SetMode { mode } => session.set_mode(mode),
            Command::CycleMode => {
                let mode = session.cycle_mode();
                debug!("DaemonCore: mode now {:?}", mode);
            }
            Command::SetColumnLayout { index, layout } => {
                session.set_column_layout(index, Some(layout))
            }
            Command::GetState => {
                // Snapshot is published after every command
            }
        }
    }

    // ── mpv management ────────────────────────────────────────────────────────

    /// Launch mpv and connect to it on a spawned task; the outcome comes back
    /// as `BackendReady` or `BackendFailed`.  Returns `false` when mpv could
    /// not even be launched, which is reported as a fatal backend error.
    fn start_backend(&mut self) -> bool {
        let socket_name = match self.mpv_driver.launch() {
            Ok(name) => name,
            Err(e) => {
                error!("DaemonCore: failed to launch mpv: {}", e);
                self.session
                    .handle_backend_event(BackendEvent::fatal(format!("cannot start mpv: {}", e)));
                return false;
            }
        };

        self.attempts += 1;
        let attempt = self.attempts;
        self.connecting = Some(attempt);

        // Single channel + single forwarder task per connection.
        let (mpv_tx, mut mpv_rx) = mpsc::channel::<MpvEvent>(64);
        let core_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(evt) = mpv_rx.recv().await {
                if core_tx.send(DaemonEvent::MpvEvent(evt)).await.is_err() {
                    break;
                }
            }
        });

        let core_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let event = match mpv::connect(socket_name, mpv_tx).await {
                Ok(handle) => DaemonEvent::BackendReady { attempt, handle },
                Err(e) => DaemonEvent::BackendFailed {
                    attempt,
                    reason: e.to_string(),
                },
            };
            let _ = core_tx.send(event).await;
        });
        true
    }

    /// Detect a dead mpv process and report it.
    fn check_backend(&mut self) {
        if !self.session.engine().backend().is_connected() || self.mpv_driver.process_alive() {
            return;
        }
        warn!("DaemonCore: mpv process died, dropping handle");
        self.session.engine_mut().backend_mut().detach();
        self.session
            .handle_backend_event(BackendEvent::fatal("mpv process exited"));
    }

    // ── publishing ────────────────────────────────────────────────────────────

    /// Replace the shared snapshot; with `announce`, also push it to clients.
    async fn publish(&self, announce: bool) {
        let rev = self.state_manager.publish(self.session.snapshot()).await;
        if announce {
            debug!("DaemonCore: snapshot rev {}", rev);
            let data = self.state_manager.get_state().await;
            let _ = self.broadcast_tx.send(Broadcast::Snapshot { data });
        }
    }

    async fn cleanup(&mut self) {
        info!("DaemonCore: cleanup, saving session and killing mpv");
        self.serializer.serialize(&self.session, &mut self.store);
        match self.store.save() {
            Ok(()) => debug!("DaemonCore: session saved to {:?}", self.store.path()),
            Err(e) => error!("DaemonCore: failed to save session: {}", e),
        }
        self.session.stop();
        self.mpv_driver.kill().await;
        if let Err(e) = std::fs::remove_file(&self.config.daemon.pid_file) {
            debug!("DaemonCore: pid file not removed: {}", e);
        }
    }
}

/// Commands that may need a running mpv.
fn needs_backend(cmd: &Command) -> bool {
    matches!(
        cmd,
        Command::Play
            | Command::PlayIndex { .. }
            | Command::TogglePause
            | Command::SkipForward
            | Command::SkipBackward
    )
}

fn spawn_notification_forwarder(notifier: &Notifier, broadcast_tx: broadcast::Sender<Broadcast>) {
    let mut rx = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    let _ = broadcast_tx.send(Broadcast::Event { notification });
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("DaemonCore: notification forwarder missed {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabdeck_proto::protocol::{Notification, PlaybackState};

    #[test]
    fn test_playback_commands_need_backend() {
        assert!(needs_backend(&Command::Play));
        assert!(needs_backend(&Command::PlayIndex { index: 3 }));
        assert!(!needs_backend(&Command::Pause));
        assert!(!needs_backend(&Command::AddPlaylist { name: None }));
    }

    #[tokio::test]
    async fn test_notifications_are_forwarded_in_order() {
        let notifier = Notifier::new(16);
        let (tx, mut rx) = broadcast::channel(16);
        spawn_notification_forwarder(&notifier, tx);

        notifier.emit(Notification::PlaylistCreated { index: 1 });
        notifier.emit(Notification::ActivePlaylistChanged { index: 1 });

        for expected in [
            Notification::PlaylistCreated { index: 1 },
            Notification::ActivePlaylistChanged { index: 1 },
        ] {
            match rx.recv().await.unwrap() {
                Broadcast::Event { notification } => assert_eq!(notification, expected),
                other => panic!("unexpected broadcast {:?}", other),
            }
        }
    }

    fn test_core(dir: &tempfile::TempDir) -> (DaemonCore, broadcast::Receiver<Broadcast>) {
        let mut config = Config::default();
        config.daemon.session_file = dir.path().join("session.json");
        config.daemon.pid_file = dir.path().join("daemon.pid");
        config.mpv.binary = Some(dir.path().join("no-such-mpv"));
        let (broadcast_tx, broadcast_rx) = broadcast::channel(256);
        let (event_tx, _event_rx) = mpsc::channel(16);
        (DaemonCore::new(config, broadcast_tx, event_tx), broadcast_rx)
    }

    fn insert_track() -> DaemonEvent {
        DaemonEvent::ClientCommand(Command::InsertTracks {
            index: 0,
            locators: vec!["/music/a.flac".into()],
        })
    }

    fn fatal_errors(rx: &mut broadcast::Receiver<Broadcast>) -> usize {
        let mut count = 0;
        while let Ok(b) = rx.try_recv() {
            if let Broadcast::Event {
                notification: Notification::Error { fatal: true, .. },
            } = b
            {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_play_without_launchable_mpv_stays_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (mut core, mut rx) = test_core(&dir);

        core.handle_event(insert_track()).await;
        core.handle_event(DaemonEvent::ClientCommand(Command::Play)).await;

        assert_eq!(core.session.engine().state(), PlaybackState::Stopped);
        assert!(core.connecting.is_none());
        assert!(core.queued.is_empty());
        assert_eq!(core.state_manager.get_state().await.state, PlaybackState::Stopped);

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fatal_errors(&mut rx), 1);
    }

    #[tokio::test]
    async fn test_commands_wait_for_pending_connect() {
        let dir = tempfile::tempdir().unwrap();
        let (mut core, _rx) = test_core(&dir);
        core.connecting = Some(7);

        core.handle_event(insert_track()).await;
        core.handle_event(DaemonEvent::ClientCommand(Command::Play)).await;
        assert!(core.session.active_playlist().is_empty());
        assert_eq!(core.queued.len(), 2);

        core.handle_event(DaemonEvent::BackendFailed {
            attempt: 6,
            reason: "old attempt".into(),
        })
        .await;
        assert_eq!(core.connecting, Some(7));

        core.handle_event(DaemonEvent::BackendFailed {
            attempt: 7,
            reason: "socket did not appear".into(),
        })
        .await;
        assert!(core.connecting.is_none());
        assert!(core.queued.is_empty());
        assert_eq!(core.session.active_playlist().len(), 1);
        assert_eq!(core.session.engine().state(), PlaybackState::Stopped);
        assert!(core.session.engine().current_track().is_none());
    }
}
