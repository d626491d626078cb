use crate::core::DaemonEvent;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tabdeck_proto::protocol::{Command, SessionSnapshot};
use tabdeck_proto::state::StateManager;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    state_manager: StateManager,
    event_tx: mpsc::Sender<DaemonEvent>,
}

#[derive(Serialize)]
struct VolumeStatus {
    volume: u8,
    muted: bool,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: StateManager,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(HttpState {
            state_manager,
            event_tx,
        });

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/command", post(command))
        .route("/api/play", get(play).post(play))
        .route("/api/pause", get(toggle_pause).post(toggle_pause))
        .route("/api/stop", get(stop).post(stop))
        .route("/api/next", get(next).post(next))
        .route("/api/prev", get(prev).post(prev))
        .route("/api/volume/:volume", get(set_volume).post(set_volume))
        .route("/api/volume", get(get_volume))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn dispatch(state: &HttpState, cmd: Command) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    if state
        .event_tx
        .send(DaemonEvent::ClientCommand(cmd))
        .await
        .is_err()
    {
        error!("HTTP API: daemon core is gone");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn get_state(State(state): State<HttpState>) -> Json<SessionSnapshot> {
    Json(state.state_manager.get_state().await)
}

async fn command(State(state): State<HttpState>, Json(cmd): Json<Command>) -> StatusCode {
    dispatch(&state, cmd).await
}

async fn play(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::Play).await
}

async fn toggle_pause(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::TogglePause).await
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::Stop).await
}

async fn next(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::SkipForward).await
}

async fn prev(State(state): State<HttpState>) -> StatusCode {
    dispatch(&state, Command::SkipBackward).await
}

async fn set_volume(State(state): State<HttpState>, Path(volume): Path<i32>) -> StatusCode {
    let value = volume.clamp(0, 100) as u8;
    dispatch(&state, Command::SetVolume { value }).await
}

async fn get_volume(State(state): State<HttpState>) -> Json<VolumeStatus> {
    let snapshot = state.state_manager.get_state().await;
    Json(VolumeStatus {
        volume: snapshot.volume,
        muted: snapshot.muted,
    })
}
