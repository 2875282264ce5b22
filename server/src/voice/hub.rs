use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{Signal, SignalKind};
use crate::notify::{channels, Notifier};
use crate::repo::UserId;
use crate::store::StoreError;
use crate::ws::client::{Client, ClientRegistry, Outbound, DEFAULT_QUEUE_CAPACITY};
use crate::ws::hub::HubError;
use crate::ws::protocol::Frame;
use crate::ws::{shutdown_clients, ShutdownError};

pub const MAX_PEERS_PER_ROOM: usize = 10;
pub const MAX_TOTAL_ROOMS: usize = 1000;

/// room -> user -> that user's signaling socket.
pub struct VideoChatHub {
    rooms: DashMap<String, HashMap<UserId, Arc<Client>>>,
    open_rooms: AtomicUsize,
    notifier: Arc<Notifier>,
    max_peers: usize,
    max_rooms: usize,
    queue_capacity: usize,
}

impl VideoChatHub {
    pub fn new(notifier: Arc<Notifier>) -> Self {
        Self {
            rooms: DashMap::new(),
            open_rooms: AtomicUsize::new(0),
            notifier,
            max_peers: MAX_PEERS_PER_ROOM,
            max_rooms: MAX_TOTAL_ROOMS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_limits(mut self, max_peers: usize, max_rooms: usize) -> Self {
        self.max_peers = max_peers;
        self.max_rooms = max_rooms;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn register(&self, room: &str, user_id: UserId) -> Result<(Arc<Client>, Outbound), HubError> {
        let mut peers = match self.rooms.entry(room.to_string()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                let max = self.max_rooms;
                if self
                    .open_rooms
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
                    .is_err()
                {
                    return Err(HubError::TooManyRooms);
                }
                entry.insert(HashMap::new())
            }
        };
        if !peers.contains_key(&user_id) && peers.len() >= self.max_peers {
            return Err(HubError::RoomFull);
        }
        let (client, outbound) = Client::new(user_id, "videochat", self.queue_capacity);
        let previous = peers.insert(user_id, client.clone());
        drop(peers);

        if let Some(previous) = previous {
            previous.close();
        }
        tracing::info!(room, user_id, "Peer joined video room");
        Ok((client, outbound))
    }

    pub fn peers(&self, room: &str) -> Vec<UserId> {
        self.rooms
            .get(room)
            .map(|peers| peers.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.open_rooms.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.rooms.iter().map(|peers| peers.len()).sum()
    }

    fn drop_if_empty(&self, room: &str) {
        if self.rooms.remove_if(room, |_, peers| peers.is_empty()).is_some() {
            self.open_rooms.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Give the joiner the current peer list and tell everyone else.
    pub async fn broadcast_join(&self, room: &str, user_id: UserId, username: &str) {
        let joiner = self.rooms.get(room).and_then(|peers| peers.get(&user_id).cloned());
        if let Some(joiner) = joiner {
            let users: Vec<_> = self
                .peers(room)
                .into_iter()
                .filter(|&id| id != user_id)
                .map(|id| json!({ "userId": id }))
                .collect();
            let roster = Signal::new(SignalKind::RoomUsers, room).with_payload(json!({ "users": users }));
            if let Some(frame) = roster.to_json().map(Frame::from) {
                joiner.try_send(frame);
            }
        }

        let mut joined = Signal::new(SignalKind::UserJoined, room).from_user(user_id);
        joined.username = Some(username.to_string());
        self.announce(room, &joined).await;
    }

    /// Forward a negotiation message to one peer. Peers on other nodes are
    /// reached through the notifier.
    pub async fn relay(&self, room: &str, from: UserId, to: UserId, mut signal: Signal) {
        signal.room_id = room.to_string();
        signal.user_id = Some(from);
        signal.target_id = Some(to);
        if self.relay_local(room, to, &signal) {
            return;
        }
        if let Some(json) = signal.to_json() {
            self.notifier.publish_video_signal(room, &json).await;
        }
    }

    fn relay_local(&self, room: &str, to: UserId, signal: &Signal) -> bool {
        let target = self.rooms.get(room).and_then(|peers| peers.get(&to).cloned());
        let Some(target) = target else {
            tracing::debug!(room, target_id = to, "Relay target not connected here");
            return false;
        };
        match signal.to_json() {
            Some(json) => target.try_send(Frame::from(json)),
            None => false,
        }
    }

    fn broadcast_local(&self, room: &str, except: Option<UserId>, signal: &Signal) -> usize {
        let targets: Vec<Arc<Client>> = match self.rooms.get(room) {
            Some(peers) => peers
                .iter()
                .filter(|(id, _)| Some(**id) != except)
                .map(|(_, c)| c.clone())
                .collect(),
            None => return 0,
        };
        let Some(frame) = signal.to_json().map(Frame::from) else {
            return 0;
        };
        targets.iter().filter(|c| c.try_send(frame.clone())).count()
    }

    async fn announce(&self, room: &str, signal: &Signal) {
        if let Some(json) = signal.to_json() {
            self.notifier.publish_video_signal(room, &json).await;
        }
    }

    /// Remove `user_id` from `room` and tell the remaining peers.
    pub async fn leave(&self, room: &str, user_id: UserId) {
        let removed = self
            .rooms
            .get_mut(room)
            .and_then(|mut peers| peers.remove(&user_id))
            .is_some();
        self.drop_if_empty(room);
        if !removed {
            return;
        }
        tracing::info!(room, user_id, "Peer left video room");
        self.announce(room, &Signal::new(SignalKind::UserLeft, room).from_user(user_id))
            .await;
    }

    /// Drop this exact client; a newer socket for the same user stays seated.
    fn remove_client(&self, client: &Client) -> Option<String> {
        let user_id = client.user_id();
        let room = self
            .rooms
            .iter()
            .find(|entry| entry.get(&user_id).is_some_and(|c| c.id() == client.id()))
            .map(|entry| entry.key().clone())?;

        if let Some(mut peers) = self.rooms.get_mut(&room) {
            peers.remove(&user_id);
        }
        self.drop_if_empty(&room);
        Some(room)
    }

    /// Route `videochat:room:*` to local peers. Targeted signals go to one
    /// peer; the rest fan out to everyone but the sender.
    pub async fn start_wiring(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), StoreError> {
        let hub = Arc::downgrade(self);
        self.notifier
            .subscribe(&[channels::VIDEOCHAT_PATTERN], cancel, move |msg| {
                let Some(hub) = hub.upgrade() else {
                    return;
                };
                let Some(room) = msg.channel.strip_prefix(channels::VIDEOCHAT_PREFIX) else {
                    return;
                };
                let mut signal: Signal = match serde_json::from_str(&msg.payload) {
                    Ok(signal) => signal,
                    Err(e) => {
                        tracing::warn!(room, error = %e, "Malformed video signal");
                        return;
                    }
                };
                signal.room_id = room.to_string();
                match signal.target_id {
                    Some(target) => {
                        hub.relay_local(room, target, &signal);
                    }
                    None => {
                        hub.broadcast_local(room, signal.user_id, &signal);
                    }
                }
            })
            .await?;
        tracing::info!("Video chat hub wired to notifier");
        Ok(())
    }

    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let clients: Vec<Arc<Client>> = self
            .rooms
            .iter()
            .flat_map(|peers| peers.values().cloned().collect::<Vec<_>>())
            .collect();
        let parting = Signal::new(SignalKind::ServerShutdown, "")
            .to_json()
            .map(Frame::from);
        shutdown_clients("videochat", clients, parting, timeout).await
    }
}

impl ClientRegistry for VideoChatHub {
    fn name(&self) -> &'static str {
        "videochat"
    }

    fn unregister_client(&self, client: &Arc<Client>) {
        let Some(room) = self.remove_client(client) else {
            return;
        };
        tracing::info!(room = %room, user_id = client.user_id(), "Peer disconnected from video room");

        let notifier = self.notifier.clone();
        let left = Signal::new(SignalKind::UserLeft, room.as_str()).from_user(client.user_id());
        tokio::spawn(async move {
            if let Some(json) = left.to_json() {
                notifier.publish_video_signal(&room, &json).await;
            }
        });
    }
}
