use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::auth::ticket;
use crate::chat::handler as chat_handler;
use crate::game::handler as game_handler;
use crate::state::AppState;
use crate::voice::handler as video_handler;
use crate::ws::handler as ws_handler;

/// Build the full axum Router with all routes.
pub fn build_router(state: AppState) -> Router {
    // Ticket issuance (bearer JWT required, AuthUser extractor validates it)
    let ticket_routes = Router::new().route("/api/ws/ticket", post(ticket::issue_ticket_handler));

    // WebSocket endpoints (auth via ?ticket= or Authorization header)
    let ws_routes = Router::new()
        .route("/api/ws", get(ws_handler::notifications_ws))
        .route("/api/ws/chat", get(chat_handler::chat_ws))
        .route("/api/ws/game", get(game_handler::game_ws))
        .route("/api/ws/videochat", get(video_handler::videochat_ws));

    // Game room lifecycle over plain HTTP
    let game_routes = Router::new()
        .route(
            "/api/games/rooms",
            get(game_handler::list_rooms).post(game_handler::create_room),
        )
        .route("/api/games/rooms/{id}", get(game_handler::get_room))
        .route("/api/games/rooms/{id}/leave", post(game_handler::leave_room));

    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(ticket_routes)
        .merge(ws_routes)
        .merge(game_routes)
        .merge(health)
        .with_state(state)
}

/// Liveness plus a snapshot of local load.
async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "node_id": state.presence.node_id(),
        "connections": {
            "notifications": state.hub.connection_count(),
            "chat": state.chat_hub.connection_count(),
            "game": state.game_hub.connection_count(),
            "videochat": state.video_hub.connection_count(),
        },
        "online_users": state.presence.online_user_ids().len(),
    }))
}
