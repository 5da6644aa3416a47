//! Participant presence with debounced change notifications.
//!
//! Heartbeats keep a participant online for `PRESENCE_TIMEOUT`. Any change
//! (join, leave, rename, timeout) marks the room dirty; the debouncer then
//! releases at most one presence update per room per window.

use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::event::{ChatEvent, ParticipantView};
use crate::hub::ChatHub;
use crate::store;

pub const PRESENCE_TIMEOUT: Duration = Duration::from_secs(30);
pub const PRESENCE_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct PresenceEntry {
    display_name: String,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct PresenceTracker {
    timeout: Duration,
    rooms: HashMap<Uuid, HashMap<Uuid, PresenceEntry>>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(PRESENCE_TIMEOUT)
    }
}

impl PresenceTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            rooms: HashMap::new(),
        }
    }

    /// Record a heartbeat. Returns true when the visible presence changed
    /// (participant came online or renamed).
    pub fn heartbeat(&mut self, room: Uuid, participant: Uuid, display_name: &str, now: Instant) -> bool {
        let members = self.rooms.entry(room).or_default();
        match members.get_mut(&participant) {
            Some(entry) => {
                entry.last_seen = now;
                if entry.display_name != display_name {
                    entry.display_name = display_name.to_string();
                    true
                } else {
                    false
                }
            }
            None => {
                members.insert(
                    participant,
                    PresenceEntry {
                        display_name: display_name.to_string(),
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    pub fn leave(&mut self, room: Uuid, participant: Uuid) -> bool {
        let Some(members) = self.rooms.get_mut(&room) else {
            return false;
        };
        let removed = members.remove(&participant).is_some();
        if members.is_empty() {
            self.rooms.remove(&room);
        }
        removed
    }

    /// Drop participants whose last heartbeat is older than the timeout.
    /// Returns the rooms whose presence changed.
    pub fn sweep(&mut self, now: Instant) -> Vec<Uuid> {
        let timeout = self.timeout;
        let mut changed = Vec::new();
        self.rooms.retain(|room, members| {
            let before = members.len();
            members.retain(|_, entry| now.saturating_duration_since(entry.last_seen) < timeout);
            if members.len() != before {
                changed.push(*room);
            }
            !members.is_empty()
        });
        changed
    }

    pub fn is_online(&self, room: Uuid, participant: Uuid) -> bool {
        self.rooms
            .get(&room)
            .is_some_and(|members| members.contains_key(&participant))
    }

    /// Online participants sorted by name then id
    pub fn online(&self, room: Uuid) -> Vec<ParticipantView> {
        let mut online: Vec<ParticipantView> = self
            .rooms
            .get(&room)
            .map(|members| {
                members
                    .iter()
                    .map(|(id, entry)| ParticipantView {
                        id: *id,
                        display_name: entry.display_name.clone(),
                        online: true,
                    })
                    .collect()
            })
            .unwrap_or_default();
        online.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.id.cmp(&b.id)));
        online
    }

    pub fn drop_room(&mut self, room: Uuid) {
        self.rooms.remove(&room);
    }
}

/// Collapses bursts of changes per room into one release per window
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<Uuid, Instant>,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(PRESENCE_DEBOUNCE)
    }
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Mark a room dirty. The first mark in a burst sets the deadline.
    pub fn mark(&mut self, room: Uuid, now: Instant) {
        self.pending.entry(room).or_insert(now);
    }

    /// Rooms whose window has elapsed, removed from the pending set
    pub fn take_due(&mut self, now: Instant) -> Vec<Uuid> {
        let window = self.window;
        let mut due = Vec::new();
        self.pending.retain(|room, marked| {
            if now.saturating_duration_since(*marked) >= window {
                due.push(*room);
                false
            } else {
                true
            }
        });
        due
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().map(|marked| *marked + self.window)
    }

    pub fn cancel(&mut self, room: Uuid) {
        self.pending.remove(&room);
    }
}

const FLUSH_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Default)]
struct PresenceState {
    tracker: PresenceTracker,
    debouncer: Debouncer,
}

/// Tracks heartbeats seen by this instance and publishes debounced
/// presence updates. The published list comes from Postgres so it covers
/// participants connected to other instances too.
pub struct PresenceService {
    state: Mutex<PresenceState>,
    hub: Arc<ChatHub>,
    pool: PgPool,
    timeout: Duration,
}

impl PresenceService {
    pub fn new(pool: PgPool, hub: Arc<ChatHub>) -> Self {
        Self {
            state: Mutex::new(PresenceState::default()),
            hub,
            pool,
            timeout: PRESENCE_TIMEOUT,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn heartbeat(&self, room: Uuid, participant: Uuid, display_name: &str) {
        let now = Instant::now();
        let mut state = self.lock();
        if state.tracker.heartbeat(room, participant, display_name, now) {
            state.debouncer.mark(room, now);
        }
    }

    pub fn leave(&self, room: Uuid, participant: Uuid) {
        let mut state = self.lock();
        // the participant may have heartbeated through another instance
        state.tracker.leave(room, participant);
        state.debouncer.mark(room, Instant::now());
    }

    /// Participants this instance has seen heartbeat recently
    pub fn online_here(&self, room: Uuid) -> Vec<ParticipantView> {
        self.lock().tracker.online(room)
    }

    pub fn forget_room(&self, room: Uuid) {
        let mut state = self.lock();
        state.tracker.drop_room(room);
        state.debouncer.cancel(room);
    }

    /// Sweep timeouts and publish updates for rooms whose debounce window
    /// elapsed. Returns the number of rooms published.
    pub async fn flush(&self, now: Instant) -> usize {
        let due = {
            let mut state = self.lock();
            for room in state.tracker.sweep(now) {
                state.debouncer.mark(room, now);
            }
            state.debouncer.take_due(now)
        };

        let mut published = 0;
        for room in due {
            match store::list_participants(&self.pool, room, self.timeout).await {
                Ok(participants) => {
                    let online = participants.into_iter().filter(|p| p.online).collect();
                    self.hub.publish(ChatEvent::Presence { file_id: room, online }).await;
                    published += 1;
                }
                Err(e) => {
                    tracing::warn!(file_id = %room, error = %e, "Failed to load presence");
                }
            }
        }
        published
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.flush(Instant::now()).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PresenceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
