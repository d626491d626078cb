use tabdeck_proto::protocol::Notification;
use tokio::sync::broadcast;
use tracing::debug;

/// Typed fan-out of player notifications.
///
/// Delivery contract: `emit` enqueues synchronously, before the emitting
/// operation returns, so every subscriber observes notifications in exactly
/// the order the transitions happened.  A subscriber that falls more than
/// `capacity` notifications behind sees `RecvError::Lagged` and should resync
/// from a snapshot.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn emit(&self, notification: Notification) {
        debug!("notify: {:?}", notification);
        // No subscribers is fine.
        let _ = self.tx.send(notification);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Drain everything currently queued for `rx` without waiting.
pub fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(n) => out.push(n),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabdeck_proto::protocol::PlaybackState;

    #[test]
    fn test_subscribers_see_emission_order() {
        let notifier = Notifier::new(8);
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();

        notifier.emit(Notification::PlaylistCreated { index: 0 });
        notifier.emit(Notification::StateChanged {
            state: PlaybackState::Loading,
        });

        let expected = vec![
            Notification::PlaylistCreated { index: 0 },
            Notification::StateChanged {
                state: PlaybackState::Loading,
            },
        ];
        assert_eq!(drain(&mut a), expected);
        assert_eq!(drain(&mut b), expected);
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let notifier = Notifier::new(1);
        notifier.emit(Notification::PlaylistDestroyed { index: 3 });
        let mut late = notifier.subscribe();
        assert!(drain(&mut late).is_empty());
    }
}
