use chrono::{Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::monitoring::MemoryTracker;
use crate::protocol::Envelope;

use super::rate_limit::REAPER_INTERVAL_SECS;
use super::{ChatError, ChatMessage, ChatUser, RateLimiter, Result, Room};

/// Outbound queue capacity per session. Overflow drops frames for that
/// recipient so one slow consumer cannot stall the broadcast.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Retention applied to every room during an emergency eviction pass.
const EMERGENCY_RETENTION_MINUTES: i64 = 10;

/// How often the monitor worker recomputes memory usage, in seconds.
const MONITOR_INTERVAL_SECS: u64 = 30;

/// Sending half of a session's outbound frame queue.
pub type OutboundSender = mpsc::Sender<Envelope>;

/// Registry entry for one connected session.
#[derive(Clone)]
pub struct SessionHandle {
    pub stream_id: String,
    pub username: String,
    pub sender: OutboundSender,
}

/// Directory of rooms plus the process-global connection registry.
///
/// Owns the cleanup and monitor workers and the policy reacting to memory
/// pressure; the rooms and the tracker themselves stay policy-free.
pub struct ChatManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    limiter: Arc<RateLimiter>,
    tracker: Arc<MemoryTracker>,
    config: ChatConfig,
    stop_tx: watch::Sender<bool>,
}

impl ChatManager {
    pub fn new(config: ChatConfig) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            limiter: Arc::new(RateLimiter::new(&config)),
            tracker: Arc::new(MemoryTracker::new(config.max_bytes())),
            config,
            stop_tx,
        })
    }

    /// Spawn the cleanup, monitor and limiter-reaper workers. Each loops on
    /// its timer until [`ChatManager::stop`] fires.
    pub fn start_workers(self: Arc<Self>) {
        let cleanup_secs = (self.config.cleanup_interval_minutes * 60).max(1);
        spawn_worker(cleanup_secs, self.stop_tx.subscribe(), {
            let manager = self.clone();
            move || manager.cleanup_pass()
        });
        spawn_worker(MONITOR_INTERVAL_SECS, self.stop_tx.subscribe(), {
            let manager = self.clone();
            move || manager.monitor_pass()
        });
        spawn_worker(REAPER_INTERVAL_SECS, self.stop_tx.subscribe(), {
            let limiter = self.limiter.clone();
            move || {
                limiter.reap_inactive();
            }
        });
        info!(
            "chat workers started (cleanup every {}s, monitor every {}s)",
            cleanup_secs, MONITOR_INTERVAL_SECS
        );
    }

    /// Signal all workers to exit at their next tick. The chat API keeps
    /// working against existing state; background maintenance ceases.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn tracker(&self) -> &Arc<MemoryTracker> {
        &self.tracker
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    // ========================================================================
    // Room directory
    // ========================================================================

    pub fn get_or_create_room(&self, stream_id: &str) -> Arc<Room> {
        if let Some(room) = self.rooms.read().get(stream_id) {
            return room.clone();
        }
        let mut rooms = self.rooms.write();
        rooms
            .entry(stream_id.to_string())
            .or_insert_with(|| {
                debug!("creating room for stream {}", stream_id);
                Arc::new(Room::new(stream_id, self.config.max_messages_per_stream))
            })
            .clone()
    }

    pub fn get_room(&self, stream_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().get(stream_id).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// Build and store a message with a fresh ID and server timestamp.
    pub fn add_message(
        &self,
        stream_id: &str,
        user_id: &str,
        username: &str,
        text: &str,
    ) -> ChatMessage {
        let room = self.get_or_create_room(stream_id);
        let msg = ChatMessage::new(stream_id, user_id, username, text);
        room.add_message(msg.clone());
        room.note_user_message(user_id, text.chars().count());
        msg
    }

    /// Store a message and fan it out to the room, sender included. The
    /// enqueues happen inside the append's critical section, so every
    /// recipient queue observes messages in buffer order.
    pub fn post_message(
        &self,
        stream_id: &str,
        user_id: &str,
        username: &str,
        text: &str,
    ) -> ChatMessage {
        let room = self.get_or_create_room(stream_id);
        let msg = ChatMessage::new(stream_id, user_id, username, text);
        room.add_message_with(msg.clone(), |stored| {
            let frame = Envelope::event("message", serde_json::json!(stored));
            self.broadcast_to_room(stream_id, &frame, None);
        });
        room.note_user_message(user_id, text.chars().count());
        msg
    }

    /// Admit a user into a room, enforcing the roster cap.
    pub fn add_user(&self, stream_id: &str, user_id: &str, username: &str) -> Result<ChatUser> {
        let room = self.get_or_create_room(stream_id);
        if room.user_count() >= self.config.max_users_per_stream {
            return Err(ChatError::RoomFull(stream_id.to_string()));
        }
        let user = ChatUser::new(user_id, username);
        room.add_user(user.clone());
        Ok(user)
    }

    /// Best-effort removal; absent rooms and users are not an error.
    pub fn remove_user(&self, stream_id: &str, user_id: &str) {
        if let Some(room) = self.get_room(stream_id) {
            room.remove_user(user_id);
        }
    }

    pub fn get_messages(&self, stream_id: &str, limit: usize) -> Vec<ChatMessage> {
        self.get_room(stream_id)
            .map(|room| room.messages(limit))
            .unwrap_or_default()
    }

    pub fn get_users(&self, stream_id: &str) -> Vec<ChatUser> {
        self.get_room(stream_id)
            .map(|room| room.list_users())
            .unwrap_or_default()
    }

    pub fn get_user_count(&self, stream_id: &str) -> usize {
        self.get_room(stream_id)
            .map(|room| room.user_count())
            .unwrap_or(0)
    }

    /// Mirror a rate-limit penalty onto the user's roster record.
    pub fn note_user_penalty(
        &self,
        stream_id: &str,
        user_id: &str,
        timeout_until: Option<chrono::DateTime<Utc>>,
        violations: u32,
    ) {
        if let Some(room) = self.get_room(stream_id) {
            room.note_user_penalty(user_id, timeout_until, violations);
        }
    }

    /// Directory totals computed in one sweep, for the stats endpoint.
    /// Returns (rooms, users, buffered messages).
    pub fn directory_totals(&self) -> (usize, usize, usize) {
        let rooms = self.rooms.read();
        let users = rooms.values().map(|room| room.user_count()).sum();
        let messages = rooms.values().map(|room| room.message_count()).sum();
        (rooms.len(), users, messages)
    }

    // ========================================================================
    // Connection registry and fan-out
    // ========================================================================

    /// Register a session for fan-out, replacing any previous session bound
    /// to the same user id.
    pub fn register_session(
        &self,
        user_id: &str,
        stream_id: &str,
        username: &str,
        sender: OutboundSender,
    ) {
        let replaced = self
            .sessions
            .write()
            .insert(
                user_id.to_string(),
                SessionHandle {
                    stream_id: stream_id.to_string(),
                    username: username.to_string(),
                    sender,
                },
            )
            .is_some();
        if replaced {
            debug!("session for user {} replaced by a new connection", user_id);
        }
    }

    /// Remove a session from the registry, but only when the registry still
    /// holds this session's queue. A session replaced by a re-join must not
    /// evict its successor on the way out.
    pub fn unregister_session(&self, user_id: &str, sender: &OutboundSender) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(user_id) {
            Some(handle) if handle.sender.same_channel(sender) => {
                sessions.remove(user_id);
                true
            }
            _ => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Deliver a frame to every session in the room, minus `exclude`.
    ///
    /// The recipient list is snapshotted under the shared lock, then the
    /// enqueues happen lock-free. A full queue drops the frame for that
    /// recipient only. Returns the number of successful enqueues.
    pub fn broadcast_to_room(
        &self,
        stream_id: &str,
        envelope: &Envelope,
        exclude: Option<&str>,
    ) -> usize {
        let targets: Vec<(String, OutboundSender)> = {
            let sessions = self.sessions.read();
            sessions
                .iter()
                .filter(|(user_id, handle)| {
                    handle.stream_id == stream_id
                        && exclude.is_none_or(|skip| skip != user_id.as_str())
                })
                .map(|(user_id, handle)| (user_id.clone(), handle.sender.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (user_id, sender) in targets {
            match sender.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!("outbound queue full, dropping frame for user {}", user_id);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    // ========================================================================
    // Background passes
    // ========================================================================

    /// Evict expired messages everywhere and reap dead rooms: empty roster
    /// and no activity past the inactive-stream timeout.
    pub fn cleanup_pass(&self) {
        let retention = Duration::minutes(self.config.message_retention_minutes as i64);
        let now_secs = Utc::now().timestamp() as u64;

        let mut rooms = self.rooms.write();
        let mut expired = 0;
        let mut dead: Vec<String> = Vec::new();
        for (stream_id, room) in rooms.iter() {
            expired += room.evict_old(retention);
            let idle = now_secs.saturating_sub(room.last_activity());
            if room.user_count() == 0 && idle > self.config.inactive_stream_timeout_secs {
                dead.push(stream_id.clone());
            }
        }
        for stream_id in &dead {
            rooms.remove(stream_id);
        }
        if expired > 0 || !dead.is_empty() {
            info!(
                "cleanup pass: {} messages expired, {} rooms reaped",
                expired,
                dead.len()
            );
        }
    }

    /// Recompute aggregate memory usage and react to the thresholds.
    pub fn monitor_pass(&self) {
        self.refresh_tracker();

        if self.tracker.critical() {
            warn!(
                "memory usage critical ({:.1}%), starting emergency eviction",
                self.tracker.usage_percent()
            );
            self.emergency_evict();
            self.refresh_tracker();
        } else if self.tracker.near_limit() {
            warn!(
                "memory usage approaching limit ({:.1}%)",
                self.tracker.usage_percent()
            );
        }
    }

    fn refresh_tracker(&self) {
        let (bytes, messages, streams) = {
            let rooms = self.rooms.read();
            let bytes: u64 = rooms.values().map(|room| room.bytes_used()).sum();
            let messages: u64 = rooms.values().map(|room| room.lifetime_messages()).sum();
            (bytes, messages, rooms.len() as u64)
        };
        self.tracker.update(bytes, messages, streams);
    }

    /// Shrink every room to the emergency retention window for one pass.
    fn emergency_evict(&self) {
        let rooms = self.rooms.write();
        let mut freed = 0;
        for room in rooms.values() {
            freed += room.evict_old(Duration::minutes(EMERGENCY_RETENTION_MINUTES));
        }
        warn!("emergency eviction removed {} messages", freed);
    }
}

/// Timer-driven worker loop with a stop signal, shared by all three workers.
fn spawn_worker(
    interval_secs: u64,
    mut stop: watch::Receiver<bool>,
    mut pass: impl FnMut() + Send + 'static,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        // the first tick completes immediately
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => pass(),
                _ = stop.changed() => break,
            }
        }
    });
}
