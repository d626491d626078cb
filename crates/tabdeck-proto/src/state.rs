use crate::protocol::SessionSnapshot;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared, read-mostly copy of the latest `SessionSnapshot`.
///
/// Only the control loop writes it (via `publish`); socket and HTTP handlers
/// read it to answer clients without touching the session itself.
#[derive(Clone, Default)]
pub struct StateManager {
    state: Arc<RwLock<SessionSnapshot>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_state(&self) -> SessionSnapshot {
        self.state.read().await.clone()
    }

    /// Replace the snapshot, bumping `rev` past the previous one.
    /// Returns the new revision.
    pub async fn publish(&self, mut snapshot: SessionSnapshot) -> u64 {
        let mut state = self.state.write().await;
        snapshot.rev = state.rev + 1;
        *state = snapshot;
        state.rev
    }
}
