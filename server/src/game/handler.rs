use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use super::{ActionError, GameCommand, GameHub};
use crate::auth::middleware::AuthUser;
use crate::repo::{GameRoom, GameType, RoomId, User};
use crate::state::AppState;
use crate::ws::client::{self, Client, MessageHandler};
use crate::ws::handler::{admit, refuse, reject_socket, WsAuthQuery};

impl IntoResponse for ActionError {
    fn into_response(self) -> Response {
        let status = match &self {
            ActionError::RoomNotFound => StatusCode::NOT_FOUND,
            ActionError::NotParticipant => StatusCode::FORBIDDEN,
            ActionError::CorruptState | ActionError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct RoomQuery {
    pub room_id: RoomId,
}

struct GameSession {
    user: User,
    room_id: RoomId,
    hub: Arc<GameHub>,
}

#[async_trait]
impl MessageHandler for GameSession {
    async fn on_message(&self, _client: &Arc<Client>, raw: &[u8]) {
        match serde_json::from_slice::<GameCommand>(raw) {
            Ok(command) => self.hub.handle_action(&self.user, self.room_id, command).await,
            Err(e) => {
                tracing::warn!(user_id = self.user.id, room_id = self.room_id, error = %e, "Invalid game frame");
                self.hub
                    .send_error(self.user.id, self.room_id, "Invalid action format");
            }
        }
    }
}

/// GET /api/ws/game?room_id=
pub async fn game_ws(
    State(state): State<AppState>,
    Query(auth): Query<WsAuthQuery>,
    Query(room): Query<RoomQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let admission = match admit(&state, &auth, &headers).await {
        Ok(admission) => admission,
        Err(e) => return refuse("game", e),
    };
    let room_id = room.room_id;
    if let Err(e) = state.game_hub.get_room(room_id).await {
        return e.into_response();
    }

    ws.on_upgrade(move |socket| async move {
        let user = admission.user.clone();
        let hub = state.game_hub.clone();
        let (client, outbound) = match hub.register(room_id, user.id) {
            Ok(registered) => registered,
            Err(e) => return reject_socket(socket, e).await,
        };
        admission.release(&state.tickets);

        let session = Arc::new(GameSession {
            user: user.clone(),
            room_id,
            hub: hub.clone(),
        });
        client::serve(socket, client, outbound, session, hub.clone()).await;
        hub.abandon(user.id, room_id).await;
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    #[serde(rename = "type")]
    pub game_type: GameType,
}

/// POST /api/games/rooms
/// Returns 201 for a new room, 200 when the caller's open room is reused.
pub async fn create_room(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<GameRoom>), ActionError> {
    let (room, created) = state
        .game_hub
        .create_game_room(user.user_id, body.game_type)
        .await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(room.redacted())))
}

#[derive(Debug, Default, Deserialize)]
pub struct ActiveRoomsQuery {
    #[serde(rename = "type")]
    pub game_type: Option<GameType>,
}

/// GET /api/games/rooms
pub async fn list_rooms(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<ActiveRoomsQuery>,
) -> Result<Json<Vec<GameRoom>>, ActionError> {
    let rooms = state.game_hub.active_rooms(query.game_type).await?;
    Ok(Json(rooms.into_iter().map(GameRoom::redacted).collect()))
}

/// GET /api/games/rooms/{id}
pub async fn get_room(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(room_id): Path<RoomId>,
) -> Result<Json<GameRoom>, ActionError> {
    Ok(Json(state.game_hub.get_room(room_id).await?.redacted()))
}

/// POST /api/games/rooms/{id}/leave
pub async fn leave_room(
    State(state): State<AppState>,
    user: AuthUser,
    Path(room_id): Path<RoomId>,
) -> Result<Json<GameRoom>, ActionError> {
    Ok(Json(state.game_hub.leave_room(user.user_id, room_id).await?.redacted()))
}
