use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use super::rooms::initial_state;
use super::{ActionError, GameCommand};
use crate::notify::{channels, Notifier};
use crate::repo::{GameRepository, GameRoom, GameStatus, GameType, NewGameRoom, RoomId, User, UserId};
use crate::store::StoreError;
use crate::ws::client::{Client, ClientRegistry, Outbound, DEFAULT_QUEUE_CAPACITY};
use crate::ws::hub::{HubError, HubLimits, DEFAULT_MAX_CONNS_PER_USER};
use crate::ws::protocol::{Envelope, EventKind, Frame};
use crate::ws::{shutdown_clients, ShutdownError};

pub const DEFAULT_PENDING_ROOM_MAX_IDLE: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_MAX_GAME_CONNS: usize = 10_000;

pub struct GameHub {
    rooms: DashMap<RoomId, HashMap<UserId, Arc<Client>>>,
    user_rooms: DashMap<UserId, HashSet<RoomId>>,
    /// Serializes read-modify-write transitions per room.
    room_locks: DashMap<RoomId, Arc<Mutex<()>>>,
    connections: AtomicUsize,
    repo: Arc<dyn GameRepository>,
    notifier: Arc<Notifier>,
    pending_max_idle: chrono::Duration,
    queue_capacity: usize,
    max_conns: usize,
    max_conns_per_user: usize,
}

impl GameHub {
    pub fn new(repo: Arc<dyn GameRepository>, notifier: Arc<Notifier>) -> Self {
        Self {
            rooms: DashMap::new(),
            user_rooms: DashMap::new(),
            room_locks: DashMap::new(),
            connections: AtomicUsize::new(0),
            repo,
            notifier,
            pending_max_idle: chrono::Duration::from_std(DEFAULT_PENDING_ROOM_MAX_IDLE)
                .unwrap_or(chrono::Duration::minutes(10)),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_conns: DEFAULT_MAX_GAME_CONNS,
            max_conns_per_user: DEFAULT_MAX_CONNS_PER_USER,
        }
    }

    pub fn with_pending_max_idle(mut self, idle: Duration) -> Self {
        if let Ok(idle) = chrono::Duration::from_std(idle) {
            self.pending_max_idle = idle;
        }
        self
    }

    pub fn with_capacity(mut self, limits: HubLimits) -> Self {
        self.queue_capacity = limits.queue_capacity;
        self.max_conns = limits.max_total_conns;
        self.max_conns_per_user = limits.max_conns_per_user;
        self
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn reserve_slot(&self) -> Result<(), HubError> {
        let max = self.max_conns;
        self.connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| HubError::ServerFull)
    }

    /// Seat a connection in a room. A user holds one socket per room; a new
    /// one replaces (and closes) the previous.
    pub fn register(&self, room_id: RoomId, user_id: UserId) -> Result<(Arc<Client>, Outbound), HubError> {
        let (client, outbound) = Client::new(user_id, "game", self.queue_capacity);
        // Both entry guards are held so the caps and the seat change together.
        let seated = {
            let mut joined = self.user_rooms.entry(user_id).or_default();
            let mut seats = self.rooms.entry(room_id).or_default();
            let admitted = if seats.contains_key(&user_id) {
                Ok(())
            } else if joined.len() >= self.max_conns_per_user {
                Err(HubError::UserLimit)
            } else {
                self.reserve_slot()
            };
            admitted.map(|()| {
                joined.insert(room_id);
                seats.insert(user_id, client.clone())
            })
        };

        let previous = match seated {
            Ok(previous) => previous,
            Err(e) => {
                self.rooms.remove_if(&room_id, |_, seats| seats.is_empty());
                self.user_rooms.remove_if(&user_id, |_, rooms| rooms.is_empty());
                tracing::warn!(room_id, user_id, error = %e, "Rejecting game connection");
                return Err(e);
            }
        };

        if let Some(previous) = previous {
            tracing::debug!(room_id, user_id, "Replacing existing game connection");
            previous.close();
        }
        tracing::info!(room_id, user_id, "Player connected to game room");
        Ok((client, outbound))
    }

    /// Drop `client` from every room it is seated in.
    pub fn remove(&self, client: &Client) {
        let user_id = client.user_id();
        let Some(room_ids) = self.user_rooms.get(&user_id).map(|r| r.clone()) else {
            return;
        };

        let mut emptied = Vec::new();
        for room_id in room_ids {
            let removed = self
                .rooms
                .get_mut(&room_id)
                .is_some_and(|mut seats| {
                    if seats.get(&user_id).is_some_and(|c| c.id() == client.id()) {
                        seats.remove(&user_id);
                        self.connections.fetch_sub(1, Ordering::SeqCst);
                        true
                    } else {
                        false
                    }
                });
            if removed {
                self.rooms.remove_if(&room_id, |_, seats| seats.is_empty());
                emptied.push(room_id);
            }
        }

        if let Some(mut rooms) = self.user_rooms.get_mut(&user_id) {
            for room_id in &emptied {
                rooms.remove(room_id);
            }
        }
        self.user_rooms.remove_if(&user_id, |_, rooms| rooms.is_empty());
    }

    pub fn is_connected(&self, room_id: RoomId, user_id: UserId) -> bool {
        self.rooms
            .get(&room_id)
            .is_some_and(|seats| seats.contains_key(&user_id))
    }

    pub fn broadcast_to_room(&self, room_id: RoomId, envelope: &Envelope) -> usize {
        let Some(frame) = envelope.to_frame() else {
            return 0;
        };
        self.broadcast_frame(room_id, &frame)
    }

    fn broadcast_frame(&self, room_id: RoomId, frame: &Frame) -> usize {
        let Some(seats) = self.rooms.get(&room_id) else {
            return 0;
        };
        seats.values().filter(|c| c.try_send(frame.clone())).count()
    }

    /// Reply to one player only.
    pub fn send_error(&self, user_id: UserId, room_id: RoomId, message: &str) {
        let client = self
            .rooms
            .get(&room_id)
            .and_then(|seats| seats.get(&user_id).cloned());
        let Some(client) = client else {
            return;
        };
        if let Some(frame) = Envelope::error(message).room(room_id).to_frame() {
            client.try_send(frame);
        }
    }

    async fn lock_room(&self, room_id: RoomId) -> OwnedMutexGuard<()> {
        let lock = self.room_locks.entry(room_id).or_default().clone();
        lock.lock_owned().await
    }

    /// Closed rooms accept no further transitions, so their lock can go.
    fn release_if_closed(&self, room: &GameRoom) {
        if !room.status.is_open() {
            self.room_locks.remove(&room.id);
        }
    }

    async fn reap_if_stale(&self, mut room: GameRoom) -> Result<GameRoom, ActionError> {
        if !room.is_stale(Utc::now(), self.pending_max_idle) {
            return Ok(room);
        }
        room.cancel();
        let room = self.repo.update_room(&room).await?;
        tracing::info!(room_id = room.id, creator_id = room.creator_id, "Cancelled stale pending room");
        Ok(room)
    }

    /// Read a room and reap it if stale. The caller holds the room lock.
    async fn load_room(&self, room_id: RoomId) -> Result<GameRoom, ActionError> {
        let room = self.repo.get_room(room_id).await?;
        self.reap_if_stale(room).await
    }

    /// Re-read a room from a listing under its lock when it looks stale.
    async fn refresh_if_stale(&self, room: GameRoom) -> Result<GameRoom, ActionError> {
        if !room.is_stale(Utc::now(), self.pending_max_idle) {
            return Ok(room);
        }
        let _guard = self.lock_room(room.id).await;
        let room = self.load_room(room.id).await?;
        self.release_if_closed(&room);
        Ok(room)
    }

    pub async fn get_room(&self, room_id: RoomId) -> Result<GameRoom, ActionError> {
        let _guard = self.lock_room(room_id).await;
        match self.load_room(room_id).await {
            Ok(room) => {
                self.release_if_closed(&room);
                Ok(room)
            }
            Err(e) => {
                self.room_locks.remove(&room_id);
                Err(e)
            }
        }
    }

    /// Open rooms, with stale Pending ones cancelled and left out.
    pub async fn active_rooms(&self, game_type: Option<GameType>) -> Result<Vec<GameRoom>, ActionError> {
        let rooms = self.repo.get_active_rooms(game_type).await?;
        let mut open = Vec::with_capacity(rooms.len());
        for room in rooms {
            let room = self.refresh_if_stale(room).await?;
            if room.status.is_open() {
                open.push(room);
            }
        }
        Ok(open)
    }

    /// Returns the creator's existing fresh Pending room of this type, or a
    /// new one. The flag is true when a room was created.
    pub async fn create_game_room(
        &self,
        creator_id: UserId,
        game_type: GameType,
    ) -> Result<(GameRoom, bool), ActionError> {
        let existing = self.repo.get_active_rooms(Some(game_type)).await?;
        for room in existing
            .into_iter()
            .filter(|r| r.creator_id == creator_id && r.status == GameStatus::Pending)
        {
            let room = self.refresh_if_stale(room).await?;
            if room.status == GameStatus::Pending {
                return Ok((room, false));
            }
        }

        let room = self
            .repo
            .create_room(NewGameRoom {
                game_type,
                creator_id,
                current_state: initial_state(game_type),
            })
            .await?;
        tracing::info!(room_id = room.id, creator_id, ?game_type, "Game room created");
        Ok((room, true))
    }

    /// Cancel a room the caller takes part in. Finished or Cancelled rooms
    /// are returned unchanged.
    pub async fn leave_room(&self, user_id: UserId, room_id: RoomId) -> Result<GameRoom, ActionError> {
        let _guard = self.lock_room(room_id).await;
        let room = self.load_room(room_id).await?;
        if !room.is_participant(user_id) {
            return Err(ActionError::NotParticipant);
        }
        if !room.status.is_open() {
            return Ok(room);
        }

        let participants = [Some(room.creator_id), room.opponent_id];
        let mut room = room;
        room.cancel();
        let room = self.repo.update_room(&room).await?;
        self.release_if_closed(&room);
        tracing::info!(room_id, user_id, "Player left, room cancelled");

        let update = Envelope::new(EventKind::GameRoomUpdated, json!(room.clone().redacted())).room(room_id);
        for participant in participants.into_iter().flatten() {
            self.notifier.publish_user(participant, &update).await;
        }
        Ok(room)
    }

    pub async fn handle_action(&self, user: &User, room_id: RoomId, command: GameCommand) {
        let result = match command {
            GameCommand::JoinRoom => self.handle_join(user.id, room_id).await,
            GameCommand::MakeMove { payload } => self.handle_move(user.id, room_id, &payload).await,
            GameCommand::PlaceShips { payload } => self.handle_place_ships(user.id, room_id, &payload).await,
            GameCommand::LeaveRoom => self.leave_room(user.id, room_id).await.map(|_| ()),
            GameCommand::Chat { payload } => {
                let chat = Envelope::new(EventKind::Chat, payload)
                    .room(room_id)
                    .user(user.id)
                    .username(user.username.clone());
                self.notifier.publish_game_action(room_id, &chat).await;
                Ok(())
            }
            GameCommand::Unknown => {
                tracing::warn!(user_id = user.id, room_id, "Unknown game action");
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::debug!(user_id = user.id, room_id, error = %e, "Game action rejected");
            self.send_error(user.id, room_id, &e.to_string());
        }
    }

    async fn handle_join(&self, user_id: UserId, room_id: RoomId) -> Result<(), ActionError> {
        let _guard = self.lock_room(room_id).await;
        let mut room = self.load_room(room_id).await?;
        room.start(user_id)?;
        let room = self.repo.update_room(&room).await?;
        tracing::info!(room_id, creator_id = room.creator_id, opponent_id = user_id, "Game started");

        let started = Envelope::new(
            EventKind::GameStarted,
            json!({
                "status": room.status,
                "next_turn": room.next_turn_id,
                "opponent_id": user_id,
                "creator_id": room.creator_id,
                "room_id": room.id,
                "updated_at": room.updated_at,
                "current_state": room.public_state(),
            }),
        )
        .room(room_id);
        self.notifier.publish_game_action(room_id, &started).await;
        Ok(())
    }

    async fn handle_move(&self, user_id: UserId, room_id: RoomId, payload: &Value) -> Result<(), ActionError> {
        self.play(user_id, room_id, |room| room.apply_move(user_id, payload)).await
    }

    async fn handle_place_ships(&self, user_id: UserId, room_id: RoomId, payload: &Value) -> Result<(), ActionError> {
        self.play(user_id, room_id, |room| room.place_ships(user_id, payload)).await
    }

    /// Apply `action` under the room lock, persist, and broadcast the new state.
    async fn play<F>(&self, user_id: UserId, room_id: RoomId, action: F) -> Result<(), ActionError>
    where
        F: FnOnce(&mut GameRoom) -> Result<(), ActionError>,
    {
        let _guard = self.lock_room(room_id).await;
        let mut room = self.load_room(room_id).await?;
        action(&mut room)?;
        let room = self.repo.update_room(&room).await?;
        self.release_if_closed(&room);
        if room.status == GameStatus::Finished {
            tracing::info!(room_id, winner_id = ?room.winner_id, is_draw = room.is_draw, "Game finished");
        }

        let state = Envelope::new(EventKind::GameState, room.state_payload())
            .room(room_id)
            .user(user_id);
        self.notifier.publish_game_action(room_id, &state).await;
        Ok(())
    }

    /// Called when a player's socket closes. A creator walking away from a
    /// room nobody has joined cancels it.
    pub async fn abandon(&self, user_id: UserId, room_id: RoomId) {
        if self.is_connected(room_id, user_id) {
            return;
        }
        let _guard = self.lock_room(room_id).await;
        let room = match self.repo.get_room(room_id).await {
            Ok(room) => room,
            Err(e) => {
                self.room_locks.remove(&room_id);
                tracing::debug!(room_id, error = %e, "Room lookup failed on disconnect");
                return;
            }
        };
        if room.status != GameStatus::Pending || room.creator_id != user_id {
            return;
        }
        let mut room = room;
        room.cancel();
        match self.repo.update_room(&room).await {
            Ok(room) => {
                self.release_if_closed(&room);
                tracing::info!(room_id, user_id, "Creator disconnected, pending room cancelled");
            }
            Err(e) => tracing::warn!(room_id, error = %e, "Failed to cancel abandoned room"),
        }
    }

    /// Route `game:room:*` into local room members.
    pub async fn start_wiring(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), StoreError> {
        let hub = Arc::downgrade(self);
        self.notifier
            .subscribe(&[channels::GAME_PATTERN], cancel, move |msg| {
                let Some(hub) = hub.upgrade() else {
                    return;
                };
                let Some(room_id) = channels::parse_id(&msg.channel, channels::GAME_PREFIX) else {
                    return;
                };
                match serde_json::from_str::<Envelope>(&msg.payload) {
                    Ok(mut envelope) => {
                        envelope.room_id = Some(room_id);
                        hub.broadcast_to_room(room_id, &envelope);
                    }
                    Err(e) => tracing::warn!(room_id, error = %e, "Malformed game event"),
                }
            })
            .await?;
        tracing::info!("Game hub wired to notifier");
        Ok(())
    }

    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let clients: Vec<Arc<Client>> = self
            .rooms
            .iter()
            .flat_map(|seats| seats.values().cloned().collect::<Vec<_>>())
            .collect();
        let parting = Envelope::new(
            EventKind::ServerShutdown,
            json!({ "message": "Server is shutting down" }),
        )
        .to_frame();
        shutdown_clients("game", clients, parting, timeout).await
    }
}

impl ClientRegistry for GameHub {
    fn name(&self) -> &'static str {
        "game"
    }

    fn unregister_client(&self, client: &Arc<Client>) {
        self.remove(client);
    }
}
