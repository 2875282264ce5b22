//! Per-process registry of notification sockets, keyed by user.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::client::{Client, ClientRegistry, Outbound, DEFAULT_QUEUE_CAPACITY};
use super::presence::ConnectionManager;
use super::protocol::Frame;
use super::{shutdown_clients, ShutdownError};
use crate::notify::{channels, Notifier};
use crate::repo::UserId;
use crate::store::StoreError;

pub const DEFAULT_MAX_CONNS_PER_USER: usize = 12;
pub const DEFAULT_MAX_TOTAL_CONNS: usize = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct HubLimits {
    pub max_conns_per_user: usize,
    pub max_total_conns: usize,
    pub queue_capacity: usize,
}

impl Default for HubLimits {
    fn default() -> Self {
        Self {
            max_conns_per_user: DEFAULT_MAX_CONNS_PER_USER,
            max_total_conns: DEFAULT_MAX_TOTAL_CONNS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Registration refused because a capacity limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("server connection limit reached")]
    ServerFull,
    #[error("too many connections for this user")]
    UserLimit,
    #[error("too many active rooms")]
    TooManyRooms,
    #[error("room is full")]
    RoomFull,
}

pub struct Hub {
    name: &'static str,
    clients: DashMap<UserId, Vec<Arc<Client>>>,
    total: AtomicUsize,
    limits: HubLimits,
    presence: Arc<ConnectionManager>,
}

impl Hub {
    pub fn new(name: &'static str, presence: Arc<ConnectionManager>, limits: HubLimits) -> Self {
        Self {
            name,
            clients: DashMap::new(),
            total: AtomicUsize::new(0),
            limits,
            presence,
        }
    }

    pub fn presence(&self) -> &Arc<ConnectionManager> {
        &self.presence
    }

    pub fn register(&self, user_id: UserId) -> Result<(Arc<Client>, Outbound), HubError> {
        let max_total = self.limits.max_total_conns;
        if self
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max_total).then_some(n + 1))
            .is_err()
        {
            tracing::warn!(hub = self.name, user_id, "Rejecting connection, server full");
            return Err(HubError::ServerFull);
        }

        let registered = {
            let mut entry = self.clients.entry(user_id).or_default();
            if entry.len() >= self.limits.max_conns_per_user {
                None
            } else {
                let (client, outbound) = Client::new(user_id, self.name, self.limits.queue_capacity);
                entry.push(client.clone());
                Some((client, outbound))
            }
        };

        let Some((client, outbound)) = registered else {
            self.total.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(hub = self.name, user_id, "Rejecting connection, per-user limit reached");
            return Err(HubError::UserLimit);
        };

        self.presence.register_connection(user_id);
        tracing::debug!(hub = self.name, user_id, client_id = client.id(), "Client registered");
        Ok((client, outbound))
    }

    /// Remove one client. Returns false if it was not registered.
    pub fn remove(&self, client: &Client) -> bool {
        let user_id = client.user_id();
        let removed = match self.clients.get_mut(&user_id) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|c| c.id() != client.id());
                entry.len() < before
            }
            None => false,
        };
        self.clients.remove_if(&user_id, |_, clients| clients.is_empty());

        if removed {
            self.total.fetch_sub(1, Ordering::SeqCst);
            self.presence.deregister_connection(user_id);
            tracing::debug!(hub = self.name, user_id, client_id = client.id(), "Client unregistered");
        }
        removed
    }

    /// Enqueue on every client of `user_id`. Returns how many accepted it.
    pub fn broadcast(&self, user_id: UserId, frame: &Frame) -> usize {
        let Some(clients) = self.clients.get(&user_id) else {
            return 0;
        };
        clients.iter().filter(|c| c.try_send(frame.clone())).count()
    }

    pub fn broadcast_all(&self, frame: &Frame) -> usize {
        self.clients
            .iter()
            .map(|entry| entry.iter().filter(|c| c.try_send(frame.clone())).count())
            .sum()
    }

    /// Enqueue on every client except those of `skip`.
    pub fn broadcast_except(&self, skip: UserId, frame: &Frame) -> usize {
        self.clients
            .iter()
            .filter(|entry| *entry.key() != skip)
            .map(|entry| entry.iter().filter(|c| c.try_send(frame.clone())).count())
            .sum()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.presence.is_online(user_id)
    }

    /// Whether this hub holds a client for the user, regardless of other hubs.
    pub fn has_clients(&self, user_id: UserId) -> bool {
        self.clients.get(&user_id).is_some_and(|c| !c.is_empty())
    }

    pub fn connection_count(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn user_connection_count(&self, user_id: UserId) -> usize {
        self.clients.get(&user_id).map_or(0, |c| c.len())
    }

    pub fn all_clients(&self) -> Vec<Arc<Client>> {
        self.clients
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect()
    }

    /// Route `notifications:user:*` and `notifications:broadcast` into local
    /// clients.
    pub async fn start_wiring(
        self: &Arc<Self>,
        notifier: &Notifier,
        cancel: CancellationToken,
    ) -> Result<(), StoreError> {
        let hub = Arc::downgrade(self);
        notifier
            .subscribe(&[channels::USER_PATTERN, channels::BROADCAST], cancel, move |msg| {
                let Some(hub) = hub.upgrade() else {
                    return;
                };
                let frame = Frame::from(msg.payload);
                if msg.channel == channels::BROADCAST {
                    hub.broadcast_all(&frame);
                } else if let Some(user_id) = channels::parse_id(&msg.channel, channels::USER_PREFIX) {
                    hub.broadcast(user_id, &frame);
                } else {
                    tracing::warn!(channel = %msg.channel, "Unroutable notification channel");
                }
            })
            .await?;
        tracing::info!(hub = self.name, "Hub wired to notifier");
        Ok(())
    }

    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ShutdownError> {
        shutdown_clients(self.name, self.all_clients(), None, timeout).await
    }
}

impl ClientRegistry for Hub {
    fn name(&self) -> &'static str {
        self.name
    }

    fn unregister_client(&self, client: &Arc<Client>) {
        self.remove(client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub(limits: HubLimits) -> Hub {
        Hub::new("test", Arc::new(ConnectionManager::new("node")), limits)
    }

    #[test]
    fn per_user_cap_is_enforced() {
        let hub = hub(HubLimits {
            max_conns_per_user: 2,
            ..HubLimits::default()
        });
        let _a = hub.register(1).unwrap();
        let _b = hub.register(1).unwrap();
        assert!(matches!(hub.register(1), Err(HubError::UserLimit)));
        assert_eq!(hub.connection_count(), 2);
        assert!(hub.register(2).is_ok());
    }

    #[test]
    fn total_cap_is_enforced() {
        let hub = hub(HubLimits {
            max_total_conns: 1,
            ..HubLimits::default()
        });
        let _a = hub.register(1).unwrap();
        assert!(matches!(hub.register(2), Err(HubError::ServerFull)));
    }

    #[test]
    fn online_tracks_registered_clients() {
        let hub = hub(HubLimits::default());
        let (first, _o1) = hub.register(4).unwrap();
        let (second, _o2) = hub.register(4).unwrap();
        assert!(hub.is_online(4));

        hub.unregister_client(&first);
        assert!(hub.is_online(4));
        hub.unregister_client(&first);
        assert_eq!(hub.user_connection_count(4), 1);

        hub.unregister_client(&second);
        assert!(!hub.is_online(4));
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn broadcast_reaches_every_tab_and_skips_offline_users() {
        let hub = hub(HubLimits::default());
        let (_a, mut tab1) = hub.register(1).unwrap();
        let (_b, mut tab2) = hub.register(1).unwrap();
        let frame = Frame::from("hi".to_string());

        assert_eq!(hub.broadcast(1, &frame), 2);
        assert_eq!(hub.broadcast(2, &frame), 0);
        assert_eq!(tab1.try_recv().unwrap().as_str(), "hi");
        assert_eq!(tab2.try_recv().unwrap().as_str(), "hi");
    }
}
