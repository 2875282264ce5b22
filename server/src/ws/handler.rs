use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::auth::middleware::bearer_token;
use crate::auth::ticket::TicketAuthority;
use crate::auth::{jwt, AdmissionError};
use crate::repo::User;
use crate::state::AppState;
use crate::ws::client::{self, IgnoreInbound};
use crate::ws::hub::HubError;
use crate::ws::protocol::{Envelope, EventKind};

/// Credentials accepted on WebSocket routes. `token` is only declared so
/// that a bearer token smuggled into the URL can be refused explicitly.
#[derive(Debug, Default, Deserialize)]
pub struct WsAuthQuery {
    pub ticket: Option<String>,
    pub token: Option<String>,
}

/// An authenticated socket request.
#[derive(Debug, Clone)]
pub struct Admission {
    pub user: User,
    ticket: Option<String>,
}

impl Admission {
    /// Shrink the ticket's replay window once the socket is registered.
    pub fn release(&self, tickets: &TicketAuthority) {
        if let Some(ticket) = &self.ticket {
            tickets.release(ticket);
        }
    }
}

/// Authenticate a socket request from `?ticket=` or `Authorization: Bearer`.
pub async fn admit(
    state: &AppState,
    query: &WsAuthQuery,
    headers: &HeaderMap,
) -> Result<Admission, AdmissionError> {
    if query.token.is_some() {
        return Err(AdmissionError::TokenInQuery);
    }

    let (user_id, ticket) = match query.ticket.as_deref().filter(|t| !t.is_empty()) {
        Some(ticket) => (state.tickets.consume(ticket).await?, Some(ticket.to_string())),
        None => {
            let token = bearer_token(headers).ok_or(AdmissionError::MissingCredentials)?;
            let user_id =
                jwt::authenticate_bearer(&state.jwt_secret, state.store.as_ref(), token).await?;
            (user_id, None)
        }
    };

    let user = state.users.get_by_id(user_id).await.map_err(|e| {
        tracing::warn!(user_id, error = %e, "Admitted user could not be loaded");
        AdmissionError::UnknownUser
    })?;
    Ok(Admission { user, ticket })
}

/// Refusal response for a failed admission; the upgrade never happens.
pub fn refuse(route: &'static str, err: AdmissionError) -> Response {
    tracing::warn!(route, error = %err, "WebSocket admission refused");
    err.into_response()
}

/// Tell an upgraded socket it cannot be registered, then close it.
pub async fn reject_socket(mut socket: WebSocket, err: HubError) {
    tracing::warn!(error = %err, "WebSocket registration refused");
    if let Some(frame) = Envelope::error(err.to_string()).to_frame() {
        let _ = socket.send(Message::Text(frame)).await;
    }
    let close = CloseFrame {
        code: close_code::AGAIN,
        reason: err.to_string().into(),
    };
    let _ = socket.send(Message::Close(Some(close))).await;
}

/// GET /api/ws
/// Notification socket: receives per-user and broadcast notifications only.
pub async fn notifications_ws(
    State(state): State<AppState>,
    Query(query): Query<WsAuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let admission = match admit(&state, &query, &headers).await {
        Ok(admission) => admission,
        Err(e) => return refuse("notifications", e),
    };

    ws.on_upgrade(move |socket| async move {
        let user_id = admission.user.id;
        let (client, outbound) = match state.hub.register(user_id) {
            Ok(registered) => registered,
            Err(e) => return reject_socket(socket, e).await,
        };
        admission.release(&state.tickets);

        let welcome = Envelope::new(
            EventKind::Connected,
            json!({ "user_id": user_id, "username": admission.user.username }),
        );
        if let Some(frame) = welcome.to_frame() {
            client.try_send(frame);
        }

        client::serve(socket, client, outbound, Arc::new(IgnoreInbound), state.hub.clone()).await;
    })
}
