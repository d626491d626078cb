use crate::core::DaemonEvent;
use tabdeck_proto::protocol::{Broadcast, FrameError, Message, PROTOCOL_VERSION};
use tabdeck_proto::state::StateManager;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: StateManager,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<Broadcast>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);

        let mut client_id = 0usize;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    info!("Client {} connected from {}", id, peer);

                    let sm = state_manager.clone();
                    let evt_tx = event_tx.clone();
                    // Subscribe before the Hello snapshot so nothing falls in between.
                    let bcast_rx = broadcast_tx.subscribe();

                    tokio::spawn(async move {
                        handle_client(stream, sm, id, evt_tx, bcast_rx).await;
                        info!("Client {} disconnected", id);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

async fn handle_client(
    stream: TcpStream,
    state_manager: StateManager,
    client_id: usize,
    event_tx: mpsc::Sender<DaemonEvent>,
    mut broadcast_rx: broadcast::Receiver<Broadcast>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    // Send Hello with current snapshot on connect
    if let Ok(encoded) = encode_hello(&state_manager).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);
                        if !forward_commands(&mut read_buf, client_id, &event_tx).await {
                            return;
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                match msg {
                    Ok(broadcast) => {
                        if write_broadcast(&mut write_half, broadcast).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        let data = state_manager.get_state().await;
                        if write_broadcast(&mut write_half, Broadcast::Snapshot { data }).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

/// Decode every complete frame in `read_buf` and hand commands to the core.
/// A frame that fails to decode is skipped.  Returns `false` when the client
/// must be dropped: the core is gone or the peer announced an oversized frame.
async fn forward_commands(
    read_buf: &mut Vec<u8>,
    client_id: usize,
    event_tx: &mpsc::Sender<DaemonEvent>,
) -> bool {
    loop {
        match Message::decode_frame(read_buf) {
            Ok((Message::Command(cmd), consumed)) => {
                read_buf.drain(..consumed);
                debug!("Client {} sent command: {:?}", client_id, cmd);
                if event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
                    warn!("DaemonEvent channel closed");
                    return false;
                }
            }
            Ok((_, consumed)) => {
                read_buf.drain(..consumed);
            }
            Err(FrameError::Incomplete) => return true,
            Err(FrameError::Malformed { consumed, source }) => {
                warn!("Client {} sent a malformed frame: {}", client_id, source);
                read_buf.drain(..consumed);
            }
            Err(e @ FrameError::TooLarge(_)) => {
                warn!("Client {}: {}, closing", client_id, e);
                return false;
            }
        }
    }
}

async fn write_broadcast<W>(writer: &mut W, broadcast: Broadcast) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = Message::Broadcast(broadcast).encode()?;
    writer.write_all(&encoded).await?;
    Ok(())
}

async fn encode_hello(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let snapshot = state_manager.get_state().await;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        daemon_rev: snapshot.rev,
        snapshot,
    })
    .encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabdeck_proto::protocol::Command;

    #[tokio::test]
    async fn test_forward_commands_handles_partial_frames() {
        let (tx, mut rx) = mpsc::channel(8);
        let first = Message::Command(Command::Play).encode().unwrap();
        let second = Message::Command(Command::SetVolume { value: 40 }).encode().unwrap();

        let mut buf = first.clone();
        buf.extend_from_slice(&second[..3]);
        assert!(forward_commands(&mut buf, 1, &tx).await);
        assert_eq!(buf.len(), 3);

        buf.extend_from_slice(&second[3..]);
        assert!(forward_commands(&mut buf, 1, &tx).await);
        assert!(buf.is_empty());

        match rx.recv().await {
            Some(DaemonEvent::ClientCommand(Command::Play)) => {}
            other => panic!("unexpected {:?}", other),
        }
        match rx.recv().await {
            Some(DaemonEvent::ClientCommand(Command::SetVolume { value: 40 })) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut buf = 9u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"{not json");
        buf.extend_from_slice(&Message::Command(Command::Play).encode().unwrap());

        assert!(forward_commands(&mut buf, 1, &tx).await);
        assert!(buf.is_empty());
        match rx.try_recv() {
            Ok(DaemonEvent::ClientCommand(Command::Play)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_drops_client() {
        let (tx, _rx) = mpsc::channel(8);
        let mut buf = u32::MAX.to_be_bytes().to_vec();
        buf.extend_from_slice(b"{");
        assert!(!forward_commands(&mut buf, 1, &tx).await);
    }

    #[tokio::test]
    async fn test_client_receives_hello_then_broadcasts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (event_tx, _event_rx) = mpsc::channel(8);
        let (bcast_tx, _) = broadcast::channel(8);
        let bcast_rx = bcast_tx.subscribe();
        let sm = StateManager::new();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_client(stream, sm, 1, event_tx, bcast_rx).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let hello = read_message(&mut client).await;
        assert!(matches!(
            hello,
            Message::Broadcast(Broadcast::Hello {
                protocol_version: PROTOCOL_VERSION,
                ..
            })
        ));

        bcast_tx
            .send(Broadcast::Log {
                message: "hi".into(),
            })
            .unwrap();
        match read_message(&mut client).await {
            Message::Broadcast(Broadcast::Log { message }) => assert_eq!(message, "hi"),
            other => panic!("unexpected {:?}", other),
        }

        drop(client);
        server.await.unwrap();
    }

    async fn read_message(stream: &mut TcpStream) -> Message {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut body).await.unwrap();
        let mut frame = len.to_vec();
        frame.extend_from_slice(&body);
        Message::decode(&frame).unwrap().0
    }
}
