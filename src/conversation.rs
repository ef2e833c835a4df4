//! Conversation Log: append-only per-conversation event store with
//! subscriber fan-out.
//!
//! Generalizes the payload layer's single-callback [`EventHandler`](crate::events::EventHandler)
//! into a multi-subscriber log: events are retained in memory per
//! conversation and fanned out to any number of live subscribers over
//! bounded `tokio::sync::mpsc` channels, so a slow subscriber is disconnected
//! rather than stalling the appender.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// The kind of a conversation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    UserIntent,
    StageStarted,
    StageProgress,
    StageCompleted,
    ProviderCall,
    Warning,
    FinalArtifact,
    Error,
    Canceled,
}

/// Who produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A single event in a conversation's append-only log.
#[derive(Debug, Clone)]
pub struct ConversationEvent {
    pub sequence: u64,
    pub kind: EventKind,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

/// Error raised to a subscriber whose buffer overflowed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("subscriber lagged behind conversation log, last delivered sequence {last_delivered_seq}")]
pub struct ErrLagged {
    pub last_delivered_seq: u64,
}

struct ConversationState {
    events: Vec<ConversationEvent>,
    subscribers: Vec<mpsc::Sender<Result<ConversationEvent, ErrLagged>>>,
    last_activity: DateTime<Utc>,
}

impl ConversationState {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            subscribers: Vec::new(),
            last_activity: Utc::now(),
        }
    }
}

/// The conversation log. One instance is shared process-wide; each
/// conversation's append path is serialized by the per-conversation entry
/// lock (the "single-writer queue" the append contract requires).
pub struct ConversationLog {
    conversations: RwLock<HashMap<Uuid, Arc<RwLock<ConversationState>>>>,
    subscriber_buffer: usize,
}

impl ConversationLog {
    /// Create a log with the given per-subscriber buffer capacity.
    pub fn new(subscriber_buffer: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            subscriber_buffer,
        }
    }

    async fn entry(&self, conversation_id: Uuid) -> Arc<RwLock<ConversationState>> {
        if let Some(existing) = self.conversations.read().await.get(&conversation_id) {
            return existing.clone();
        }
        let mut write = self.conversations.write().await;
        write
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(RwLock::new(ConversationState::new())))
            .clone()
    }

    /// Append an event, returning its assigned sequence number. Sequence
    /// numbers are strictly increasing and gap-free per conversation.
    ///
    /// Fan-out to subscribers never blocks on a slow reader: a full
    /// subscriber buffer receives `Err(ErrLagged)` carrying the last
    /// sequence number it was delivered, then is disconnected.
    pub async fn append(
        &self,
        conversation_id: Uuid,
        kind: EventKind,
        role: Role,
        payload: Value,
    ) -> u64 {
        let state = self.entry(conversation_id).await;
        let mut state = state.write().await;
        let sequence = state.events.len() as u64;
        let event = ConversationEvent {
            sequence,
            kind,
            role,
            timestamp: Utc::now(),
            payload,
        };
        state.events.push(event.clone());
        state.last_activity = event.timestamp;
        state.subscribers.retain(|tx| {
            if tx.try_send(Ok(event.clone())).is_ok() {
                true
            } else {
                // Buffer's full: hand the lag signal to a task so the error
                // is still delivered once the subscriber drains room for it,
                // without blocking this append.
                let tx = tx.clone();
                let last_delivered_seq = sequence.saturating_sub(1);
                tokio::spawn(async move {
                    let _ = tx.send(Err(ErrLagged { last_delivered_seq })).await;
                });
                false
            }
        });
        sequence
    }

    /// Subscribe to a conversation from an optional starting sequence
    /// number (inclusive). Returns a receiver delivering events in order;
    /// a gap caused by a full buffer delivers `Err(ErrLagged)` before the
    /// channel closes, and the caller should re-subscribe with
    /// [`Self::snapshot`]'s last sequence number.
    pub async fn subscribe(
        &self,
        conversation_id: Uuid,
        from_seq: Option<u64>,
    ) -> mpsc::Receiver<Result<ConversationEvent, ErrLagged>> {
        let state = self.entry(conversation_id).await;
        let mut state = state.write().await;
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);

        let start = from_seq.unwrap_or(0) as usize;
        for event in state.events.iter().skip(start) {
            if tx.try_send(Ok(event.clone())).is_err() {
                break;
            }
        }
        state.subscribers.push(tx);
        rx
    }

    /// Full retained history up to the call time.
    pub async fn snapshot(&self, conversation_id: Uuid) -> Vec<ConversationEvent> {
        let state = self.entry(conversation_id).await;
        let events = state.read().await.events.clone();
        events
    }

    /// Remove conversations idle longer than `retention`, relative to `now`.
    pub async fn expire(&self, retention: std::time::Duration, now: DateTime<Utc>) {
        let mut conversations = self.conversations.write().await;
        let mut dead = Vec::new();
        for (id, state) in conversations.iter() {
            let last_activity = state.read().await.last_activity;
            if now.signed_duration_since(last_activity).to_std().unwrap_or_default() > retention {
                dead.push(*id);
            }
        }
        for id in dead {
            conversations.remove(&id);
        }
    }
}

impl Default for ConversationLog {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_assigns_monotonic_sequence() {
        let log = ConversationLog::new(8);
        let conv = Uuid::new_v4();
        let s0 = log.append(conv, EventKind::UserIntent, Role::User, json!("hi")).await;
        let s1 = log.append(conv, EventKind::StageStarted, Role::System, json!({})).await;
        assert_eq!(s0, 0);
        assert_eq!(s1, 1);
    }

    #[tokio::test]
    async fn test_snapshot_returns_full_history() {
        let log = ConversationLog::new(8);
        let conv = Uuid::new_v4();
        log.append(conv, EventKind::UserIntent, Role::User, json!("a")).await;
        log.append(conv, EventKind::StageCompleted, Role::System, json!("b")).await;
        let snap = log.snapshot(conv).await;
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[1].sequence, 1);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_after_subscribe() {
        let log = ConversationLog::new(8);
        let conv = Uuid::new_v4();
        let mut rx = log.subscribe(conv, None).await;
        log.append(conv, EventKind::UserIntent, Role::User, json!("hi")).await;
        let event = rx.recv().await.unwrap().unwrap();
        assert_eq!(event.sequence, 0);
    }

    #[tokio::test]
    async fn test_subscriber_replays_from_seq() {
        let log = ConversationLog::new(8);
        let conv = Uuid::new_v4();
        log.append(conv, EventKind::UserIntent, Role::User, json!("a")).await;
        log.append(conv, EventKind::StageStarted, Role::System, json!("b")).await;
        let mut rx = log.subscribe(conv, Some(1)).await;
        let event = rx.recv().await.unwrap().unwrap();
        assert_eq!(event.sequence, 1);
    }

    #[tokio::test]
    async fn test_full_subscriber_buffer_is_dropped_not_blocking() {
        let log = ConversationLog::new(1);
        let conv = Uuid::new_v4();
        let _rx = log.subscribe(conv, None).await;
        // Fill the subscriber's buffer, then overflow it; append must not hang.
        log.append(conv, EventKind::UserIntent, Role::User, json!(1)).await;
        log.append(conv, EventKind::UserIntent, Role::User, json!(2)).await;
        let state = log.entry(conv).await;
        assert!(state.read().await.subscribers.is_empty());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_receives_err_lagged_then_disconnects() {
        let log = ConversationLog::new(1);
        let conv = Uuid::new_v4();
        let mut rx = log.subscribe(conv, None).await;
        log.append(conv, EventKind::UserIntent, Role::User, json!(1)).await;
        log.append(conv, EventKind::UserIntent, Role::User, json!(2)).await;

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.sequence, 0);

        let lagged = rx.recv().await.unwrap();
        match lagged {
            Err(ErrLagged { last_delivered_seq }) => assert_eq!(last_delivered_seq, 0),
            Ok(_) => panic!("expected ErrLagged, got an event"),
        }

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_expire_removes_idle_conversations() {
        let log = ConversationLog::new(8);
        let conv = Uuid::new_v4();
        log.append(conv, EventKind::UserIntent, Role::User, json!("a")).await;
        let future = Utc::now() + chrono::Duration::hours(25);
        log.expire(std::time::Duration::from_secs(24 * 60 * 60), future).await;
        assert!(log.snapshot(conv).await.is_empty());
    }
}
