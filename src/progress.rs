//! Progress broadcaster (C8): per-session progress events for a client
//! polling or subscribing to upload status.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::upload::SessionId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    PartReceived {
        session_id: String,
        part_number: u32,
        bytes_so_far: u64,
        timestamp: DateTime<Utc>,
    },
    Completed {
        session_id: String,
        total_bytes: u64,
        timestamp: DateTime<Utc>,
    },
    Aborted {
        session_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcasts progress events per upload session. Each session gets its own
/// channel so a slow subscriber on one upload can't back-pressure another.
pub struct ProgressBroadcaster {
    channels: RwLock<HashMap<SessionId, broadcast::Sender<ProgressEvent>>>,
    capacity: usize,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        })
    }

    fn sender_for(&self, session_id: &SessionId) -> broadcast::Sender<ProgressEvent> {
        if let Some(tx) = self.channels.read().get(session_id) {
            return tx.clone();
        }
        let mut channels = self.channels.write();
        channels
            .entry(session_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn subscribe(&self, session_id: &SessionId) -> broadcast::Receiver<ProgressEvent> {
        self.sender_for(session_id).subscribe()
    }

    /// Publish an event. No subscribers is the common case (most clients
    /// poll `/status` instead) and is not an error.
    pub fn publish(&self, session_id: &SessionId, event: ProgressEvent) {
        let _ = self.sender_for(session_id).send(event);
    }

    /// Drop the channel for a session once it reaches a terminal state, so
    /// the broadcaster doesn't accumulate one entry per upload forever.
    pub fn retire(&self, session_id: &SessionId) {
        self.channels.write().remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let broadcaster = ProgressBroadcaster::new(16);
        let id = SessionId("s1".to_string());
        let mut rx = broadcaster.subscribe(&id);

        broadcaster.publish(
            &id,
            ProgressEvent::PartReceived {
                session_id: id.0.clone(),
                part_number: 1,
                bytes_so_far: 1024,
                timestamp: Utc::now(),
            },
        );

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ProgressEvent::PartReceived { part_number: 1, .. }));
    }

    #[test]
    fn retire_removes_the_channel() {
        let broadcaster = ProgressBroadcaster::new(16);
        let id = SessionId("s1".to_string());
        let _rx = broadcaster.subscribe(&id);
        assert_eq!(broadcaster.channels.read().len(), 1);
        broadcaster.retire(&id);
        assert_eq!(broadcaster.channels.read().len(), 0);
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let broadcaster = ProgressBroadcaster::new(16);
        let id = SessionId("lonely".to_string());
        broadcaster.publish(
            &id,
            ProgressEvent::Aborted {
                session_id: id.0.clone(),
                reason: "timeout".to_string(),
                timestamp: Utc::now(),
            },
        );
    }
}
