//! Process-wide online tracking.
//!
//! A user is online while they hold at least one local connection or a
//! sibling node has reported them online within the presence TTL. Listeners
//! fire once per combined transition, never per connection.
//!
//! Transitions are stamped with a sequence number while the state lock is
//! held. A transition that reaches the listeners after a newer one for the
//! same user is dropped, and announcements leave through one ordered queue,
//! so a quick reconnect can never end with the user shown offline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::notify::{channels, Notifier};
use crate::repo::UserId;
use crate::store::StoreError;

pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(25);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);

pub type PresenceListener = Arc<dyn Fn(UserId) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum PresenceEvent {
    Online { node_id: String, user_id: UserId },
    Offline { node_id: String, user_id: UserId },
    Announce { node_id: String, user_ids: Vec<UserId> },
}

#[derive(Default)]
struct UserPresence {
    local: usize,
    remote: HashMap<String, Instant>,
}

impl UserPresence {
    fn is_online(&self) -> bool {
        self.local > 0 || !self.remote.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Transition {
    Online,
    Offline,
}

pub struct ConnectionManager {
    node_id: String,
    users: Mutex<HashMap<UserId, UserPresence>>,
    listeners: RwLock<Vec<(PresenceListener, PresenceListener)>>,
    /// Last transition sequence handed to the listeners, per user.
    fired: Mutex<HashMap<UserId, u64>>,
    seq: AtomicU64,
    announcer: RwLock<Option<mpsc::UnboundedSender<PresenceEvent>>>,
    presence_ttl: Duration,
    heartbeat: Duration,
}

impl ConnectionManager {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            users: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            fired: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            announcer: RwLock::new(None),
            presence_ttl: DEFAULT_PRESENCE_TTL,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    pub fn with_timing(mut self, presence_ttl: Duration, heartbeat: Duration) -> Self {
        self.presence_ttl = presence_ttl;
        self.heartbeat = heartbeat;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Register callbacks for online and offline transitions. They run on
    /// the caller's task and must not block.
    pub fn add_listener(&self, on_online: PresenceListener, on_offline: PresenceListener) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((on_online, on_offline));
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns true when this is the user's first local connection.
    pub fn register_connection(&self, user_id: UserId) -> bool {
        let (was_first, transition) = {
            let mut users = self.lock_users();
            let state = users.entry(user_id).or_default();
            let was_online = state.is_online();
            state.local += 1;
            let was_first = state.local == 1;
            if was_first {
                self.announce(PresenceEvent::Online {
                    node_id: self.node_id.clone(),
                    user_id,
                });
            }
            (was_first, (!was_online).then(|| (Transition::Online, self.next_seq())))
        };
        if let Some((transition, seq)) = transition {
            self.fire(user_id, transition, seq);
        }
        was_first
    }

    /// Returns true when this was the user's last local connection.
    pub fn deregister_connection(&self, user_id: UserId) -> bool {
        let (was_last, transition) = {
            let mut users = self.lock_users();
            let Some(state) = users.get_mut(&user_id) else {
                return false;
            };
            if state.local == 0 {
                return false;
            }
            state.local -= 1;
            let was_last = state.local == 0;
            let now_online = state.is_online();
            if !now_online {
                users.remove(&user_id);
            }
            if was_last {
                self.announce(PresenceEvent::Offline {
                    node_id: self.node_id.clone(),
                    user_id,
                });
            }
            (was_last, (!now_online).then(|| (Transition::Offline, self.next_seq())))
        };
        if let Some((transition, seq)) = transition {
            self.fire(user_id, transition, seq);
        }
        was_last
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.lock_users().get(&user_id).is_some_and(|s| s.is_online())
    }

    pub fn local_connections(&self, user_id: UserId) -> usize {
        self.lock_users().get(&user_id).map_or(0, |s| s.local)
    }

    pub fn online_user_ids(&self) -> Vec<UserId> {
        self.lock_users()
            .iter()
            .filter(|(_, s)| s.is_online())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Mirror transitions over `presence:events` and apply sibling reports.
    pub async fn start_wiring(
        self: &Arc<Self>,
        notifier: Arc<Notifier>,
        cancel: CancellationToken,
    ) -> Result<(), StoreError> {
        let (tx, mut outgoing) = mpsc::unbounded_channel::<PresenceEvent>();
        *self.announcer.write().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        let publisher = notifier.clone();
        let stop = cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = stop.cancelled() => break,
                    Some(event) = outgoing.recv() => event,
                    else => break,
                };
                match serde_json::to_string(&event) {
                    Ok(payload) => publisher.publish(channels::PRESENCE_EVENTS, &payload).await,
                    Err(e) => tracing::error!(error = %e, "Failed to encode presence event"),
                }
            }
        });

        let manager = Arc::downgrade(self);
        notifier
            .subscribe(&[channels::PRESENCE_EVENTS], cancel.clone(), move |msg| {
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                match serde_json::from_str::<PresenceEvent>(&msg.payload) {
                    Ok(event) => manager.apply_remote(event),
                    Err(e) => tracing::warn!(error = %e, "Malformed presence event"),
                }
            })
            .await?;

        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.heartbeat);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.expire_remote();
                        manager.forget_settled();
                        manager.announce_local_users();
                    }
                }
            }
            tracing::debug!(node_id = %manager.node_id, "Presence heartbeat stopped");
        });

        tracing::info!(node_id = %self.node_id, "Presence mirroring wired");
        Ok(())
    }

    /// Forget sibling reports older than the presence TTL.
    pub fn expire_remote(&self) {
        let now = Instant::now();
        let mut gone = Vec::new();
        {
            let mut users = self.lock_users();
            users.retain(|user_id, state| {
                let was_online = state.is_online();
                state
                    .remote
                    .retain(|_, seen| now.duration_since(*seen) < self.presence_ttl);
                if was_online && !state.is_online() {
                    gone.push((*user_id, self.next_seq()));
                }
                state.is_online()
            });
        }
        for (user_id, seq) in gone {
            tracing::debug!(user_id, "Remote presence expired");
            self.fire(user_id, Transition::Offline, seq);
        }
    }

    /// Re-announce every locally connected user. The state lock is held
    /// so the report cannot overtake a later offline event.
    fn announce_local_users(&self) {
        let users = self.lock_users();
        let user_ids: Vec<UserId> = users
            .iter()
            .filter(|(_, s)| s.local > 0)
            .map(|(id, _)| *id)
            .collect();
        if !user_ids.is_empty() {
            self.announce(PresenceEvent::Announce {
                node_id: self.node_id.clone(),
                user_ids,
            });
        }
    }

    /// Drop sequence bookkeeping for users who are offline everywhere.
    fn forget_settled(&self) {
        let known: Vec<UserId> = self.lock_users().keys().copied().collect();
        self.fired
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|user_id, _| known.contains(user_id));
    }

    fn apply_remote(&self, event: PresenceEvent) {
        let now = Instant::now();
        let mut transitions = Vec::new();
        {
            let mut users = self.lock_users();
            match event {
                PresenceEvent::Online { node_id, user_id } => {
                    if node_id == self.node_id {
                        return;
                    }
                    let state = users.entry(user_id).or_default();
                    if !state.is_online() {
                        transitions.push((user_id, Transition::Online, self.next_seq()));
                    }
                    state.remote.insert(node_id, now);
                }
                PresenceEvent::Announce { node_id, user_ids } => {
                    if node_id == self.node_id {
                        return;
                    }
                    for user_id in user_ids {
                        let state = users.entry(user_id).or_default();
                        if !state.is_online() {
                            transitions.push((user_id, Transition::Online, self.next_seq()));
                        }
                        state.remote.insert(node_id.clone(), now);
                    }
                }
                PresenceEvent::Offline { node_id, user_id } => {
                    if node_id == self.node_id {
                        return;
                    }
                    if let Some(state) = users.get_mut(&user_id) {
                        state.remote.remove(&node_id);
                        if !state.is_online() {
                            users.remove(&user_id);
                            transitions.push((user_id, Transition::Offline, self.next_seq()));
                        }
                    }
                }
            }
        }
        for (user_id, transition, seq) in transitions {
            self.fire(user_id, transition, seq);
        }
    }

    /// Run the listeners for a transition unless a newer one for the same
    /// user already ran. Listener calls are serialized.
    fn fire(&self, user_id: UserId, transition: Transition, seq: u64) {
        let mut fired = self.fired.lock().unwrap_or_else(|e| e.into_inner());
        let last = fired.entry(user_id).or_default();
        if *last > seq {
            tracing::debug!(user_id, seq, "Dropping superseded presence transition");
            return;
        }
        *last = seq;

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for (on_online, on_offline) in &listeners {
            match transition {
                Transition::Online => on_online(user_id),
                Transition::Offline => on_offline(user_id),
            }
        }
    }

    /// Queue an event for the publisher task; a no-op before wiring.
    fn announce(&self, event: PresenceEvent) {
        if let Some(tx) = self.announcer.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            let _ = tx.send(event);
        }
    }

    fn lock_users(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, UserPresence>> {
        self.users.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(manager: &ConnectionManager) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let online = Arc::new(AtomicUsize::new(0));
        let offline = Arc::new(AtomicUsize::new(0));
        let (on, off) = (online.clone(), offline.clone());
        manager.add_listener(
            Arc::new(move |_| {
                on.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(move |_| {
                off.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (online, offline)
    }

    #[test]
    fn listeners_fire_once_per_transition_with_many_tabs() {
        let manager = ConnectionManager::new("node-a");
        let (online, offline) = counting(&manager);

        assert!(manager.register_connection(1));
        assert!(!manager.register_connection(1));
        assert!(!manager.register_connection(1));
        assert_eq!(online.load(Ordering::SeqCst), 1);

        assert!(!manager.deregister_connection(1));
        assert!(!manager.deregister_connection(1));
        assert!(manager.is_online(1));
        assert_eq!(offline.load(Ordering::SeqCst), 0);

        assert!(manager.deregister_connection(1));
        assert!(!manager.is_online(1));
        assert_eq!(offline.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deregister_unknown_user_is_noop() {
        let manager = ConnectionManager::new("node-a");
        let (_, offline) = counting(&manager);
        assert!(!manager.deregister_connection(99));
        assert_eq!(offline.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remote_report_keeps_user_online_after_local_close() {
        let manager = ConnectionManager::new("node-a");
        let (online, offline) = counting(&manager);

        manager.register_connection(5);
        manager.apply_remote(PresenceEvent::Online {
            node_id: "node-b".into(),
            user_id: 5,
        });
        manager.deregister_connection(5);
        assert!(manager.is_online(5));
        assert_eq!(offline.load(Ordering::SeqCst), 0);

        manager.apply_remote(PresenceEvent::Offline {
            node_id: "node-b".into(),
            user_id: 5,
        });
        assert!(!manager.is_online(5));
        assert_eq!(online.load(Ordering::SeqCst), 1);
        assert_eq!(offline.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn own_events_are_ignored() {
        let manager = ConnectionManager::new("node-a");
        manager.apply_remote(PresenceEvent::Online {
            node_id: "node-a".into(),
            user_id: 3,
        });
        assert!(!manager.is_online(3));
    }

    #[test]
    fn remote_reports_expire() {
        let manager = ConnectionManager::new("node-a")
            .with_timing(Duration::from_millis(10), DEFAULT_HEARTBEAT);
        let (_, offline) = counting(&manager);

        manager.apply_remote(PresenceEvent::Announce {
            node_id: "node-b".into(),
            user_ids: vec![8, 9],
        });
        assert_eq!(manager.online_user_ids().len(), 2);

        std::thread::sleep(Duration::from_millis(20));
        manager.expire_remote();
        assert!(manager.online_user_ids().is_empty());
        assert_eq!(offline.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn superseded_transition_is_dropped() {
        let manager = ConnectionManager::new("node-a");
        let (online, offline) = counting(&manager);

        manager.register_connection(1);
        manager.deregister_connection(1);
        manager.register_connection(1);
        assert_eq!(online.load(Ordering::SeqCst), 2);
        assert_eq!(offline.load(Ordering::SeqCst), 1);

        // The first session's offline transition arriving late changes nothing.
        manager.fire(1, Transition::Offline, 2);
        assert_eq!(offline.load(Ordering::SeqCst), 1);
        assert!(manager.is_online(1));
    }

    #[test]
    fn listeners_settle_on_the_final_state() {
        let manager = Arc::new(ConnectionManager::new("node-a"));
        let shown = Arc::new(Mutex::new(None::<bool>));
        let (up, down) = (shown.clone(), shown.clone());
        manager.add_listener(
            Arc::new(move |_| *up.lock().unwrap() = Some(true)),
            Arc::new(move |_| *down.lock().unwrap() = Some(false)),
        );

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        manager.register_connection(7);
                        manager.deregister_connection(7);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(!manager.is_online(7));
        assert_eq!(*shown.lock().unwrap(), Some(false));
    }

    #[tokio::test]
    async fn announcements_keep_transition_order() {
        let manager = Arc::new(ConnectionManager::new("node-a"));
        let notifier = Arc::new(Notifier::local_only());
        let (tx, mut events) = mpsc::unbounded_channel();
        notifier
            .subscribe(&[channels::PRESENCE_EVENTS], CancellationToken::new(), move |msg| {
                let _ = tx.send(msg.payload);
            })
            .await
            .unwrap();
        manager
            .start_wiring(notifier, CancellationToken::new())
            .await
            .unwrap();

        manager.register_connection(4);
        manager.deregister_connection(4);
        manager.register_connection(4);

        let mut kinds = Vec::new();
        while kinds.len() < 3 {
            let payload = tokio::time::timeout(Duration::from_secs(1), events.recv())
                .await
                .expect("timed out")
                .unwrap();
            match serde_json::from_str::<PresenceEvent>(&payload).unwrap() {
                PresenceEvent::Online { .. } => kinds.push("online"),
                PresenceEvent::Offline { .. } => kinds.push("offline"),
                PresenceEvent::Announce { .. } => {}
            }
        }
        assert_eq!(kinds, vec!["online", "offline", "online"]);
    }
}
