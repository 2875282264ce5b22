//! Single-use WebSocket admission tickets.
//!
//! A ticket is issued over authenticated HTTP and consumed atomically when
//! the socket opens. Some clients perform the upgrade handshake in more than
//! one pass, so a consumed ticket stays valid on this node for a short grace
//! window unless [`TicketAuthority::release`] is called once the socket is up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::Json;
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::middleware::AuthUser;
use super::AdmissionError;
use crate::repo::UserId;
use crate::state::AppState;
use crate::store::{KeyValueStore, StoreError};

pub const TICKET_PREFIX: &str = "ws_ticket:";
pub const DEFAULT_TICKET_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_CONSUMED_GRACE: Duration = Duration::from_secs(10);
const CONSUMED_RETENTION: Duration = Duration::from_secs(15);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct ConsumedTicket {
    user_id: UserId,
    consumed_at: Instant,
}

pub struct TicketAuthority {
    store: Arc<dyn KeyValueStore>,
    consumed: DashMap<String, ConsumedTicket>,
    ticket_ttl: Duration,
    grace: Duration,
}

fn ticket_key(ticket: &str) -> String {
    format!("{TICKET_PREFIX}{ticket}")
}

impl TicketAuthority {
    pub fn new(store: Arc<dyn KeyValueStore>, ticket_ttl: Duration, grace: Duration) -> Self {
        Self {
            store,
            consumed: DashMap::new(),
            ticket_ttl,
            grace,
        }
    }

    /// Mint a 256-bit random ticket bound to `user_id`.
    pub async fn issue_ticket(&self, user_id: UserId) -> Result<String, StoreError> {
        let bytes: [u8; 32] = rand::rng().random();
        let ticket = hex::encode(bytes);
        self.store
            .set_ex(&ticket_key(&ticket), &user_id.to_string(), self.ticket_ttl)
            .await?;
        tracing::debug!(user_id, "WebSocket ticket issued");
        Ok(ticket)
    }

    /// Validate a ticket. The shared store is consulted first with an atomic
    /// get-and-delete; on a miss (or store failure) a recent local
    /// consumption is accepted.
    pub async fn consume(&self, ticket: &str) -> Result<UserId, AdmissionError> {
        if ticket.is_empty() {
            return Err(AdmissionError::MissingCredentials);
        }

        match self.store.get_del(&ticket_key(ticket)).await {
            Ok(Some(raw)) => {
                let user_id: UserId = raw.parse().map_err(|_| {
                    tracing::warn!("Ticket maps to a malformed user ID");
                    AdmissionError::InvalidTicket
                })?;
                self.consumed.insert(
                    ticket.to_string(),
                    ConsumedTicket {
                        user_id,
                        consumed_at: Instant::now(),
                    },
                );
                tracing::info!(user_id, "WebSocket ticket consumed");
                return Ok(user_id);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Ticket store unavailable, checking local cache");
            }
        }

        match self.cached(ticket) {
            Some(user_id) => {
                tracing::debug!(user_id, "Ticket accepted from consumed cache");
                Ok(user_id)
            }
            None => Err(AdmissionError::InvalidTicket),
        }
    }

    fn cached(&self, ticket: &str) -> Option<UserId> {
        self.consumed
            .get(ticket)
            .filter(|entry| entry.consumed_at.elapsed() < self.grace)
            .map(|entry| entry.user_id)
    }

    /// Forget a consumed ticket once its socket is established.
    pub fn release(&self, ticket: &str) {
        self.consumed.remove(ticket);
    }

    /// Drop cache entries past retention. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let before = self.consumed.len();
        self.consumed
            .retain(|_, entry| entry.consumed_at.elapsed() <= CONSUMED_RETENTION);
        before.saturating_sub(self.consumed.len())
    }

    pub fn cached_count(&self) -> usize {
        self.consumed.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let authority = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = authority.sweep_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "Swept consumed tickets");
                        }
                    }
                }
            }
        })
    }
}

#[derive(Debug, Serialize)]
pub struct TicketResponse {
    pub ticket: String,
    pub expires_in: u64,
}

/// POST /api/ws/ticket
pub async fn issue_ticket_handler(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<TicketResponse>, AdmissionError> {
    let ticket = state.tickets.issue_ticket(user.user_id).await?;
    Ok(Json(TicketResponse {
        ticket,
        expires_in: state.config.limits.ticket_ttl_secs,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn authority(grace: Duration) -> TicketAuthority {
        TicketAuthority::new(Arc::new(MemoryStore::new()), DEFAULT_TICKET_TTL, grace)
    }

    #[tokio::test]
    async fn ticket_is_hex_and_bound_to_user() {
        let authority = authority(DEFAULT_CONSUMED_GRACE);
        let ticket = authority.issue_ticket(11).await.unwrap();
        assert_eq!(ticket.len(), 64);
        assert!(ticket.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(authority.consume(&ticket).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn consumed_ticket_revalidates_within_grace_only() {
        let authority = authority(Duration::from_millis(50));
        let ticket = authority.issue_ticket(11).await.unwrap();

        assert_eq!(authority.consume(&ticket).await.unwrap(), 11);
        assert_eq!(authority.consume(&ticket).await.unwrap(), 11);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(matches!(
            authority.consume(&ticket).await,
            Err(AdmissionError::InvalidTicket)
        ));
    }

    #[tokio::test]
    async fn released_ticket_cannot_be_reused() {
        let authority = authority(DEFAULT_CONSUMED_GRACE);
        let ticket = authority.issue_ticket(3).await.unwrap();
        authority.consume(&ticket).await.unwrap();
        authority.release(&ticket);

        assert!(authority.consume(&ticket).await.is_err());
    }

    #[tokio::test]
    async fn unknown_and_empty_tickets_fail() {
        let authority = authority(DEFAULT_CONSUMED_GRACE);
        assert!(matches!(
            authority.consume("deadbeef").await,
            Err(AdmissionError::InvalidTicket)
        ));
        assert!(matches!(
            authority.consume("").await,
            Err(AdmissionError::MissingCredentials)
        ));
    }

    #[tokio::test]
    async fn sweep_keeps_fresh_entries() {
        let authority = authority(DEFAULT_CONSUMED_GRACE);
        let ticket = authority.issue_ticket(3).await.unwrap();
        authority.consume(&ticket).await.unwrap();

        assert_eq!(authority.sweep_expired(), 0);
        assert_eq!(authority.cached_count(), 1);
    }
}
