//! Per-session event fan-out to connected viewers.
//!
//! One broadcast channel per session. Publishing never blocks and never
//! fails; a viewer whose socket stalls lags the channel and loses its
//! oldest events first, while other viewers keep receiving in FIFO
//! order.

use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::debug;
use triage_common::SessionEvent;

/// Per-viewer queue depth before the oldest events are dropped.
pub const VIEWER_QUEUE: usize = 256;

#[derive(Default)]
pub struct Broadcaster {
    channels: HashMap<String, broadcast::Sender<SessionEvent>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a viewer to a session's event stream, creating the
    /// channel on first use.
    pub fn subscribe(&mut self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        self.channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(VIEWER_QUEUE).0)
            .subscribe()
    }

    /// Publish events in order. No subscribers is fine.
    pub fn publish(&mut self, session_id: &str, events: &[SessionEvent]) {
        if events.is_empty() {
            return;
        }
        let sender = self
            .channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(VIEWER_QUEUE).0);
        for event in events {
            let _ = sender.send(event.clone());
        }
        debug!(
            "Published {} events to session {} ({} viewers)",
            events.len(),
            session_id,
            sender.receiver_count()
        );
    }

    /// Drop a finished session's channel.
    pub fn remove(&mut self, session_id: &str) {
        self.channels.remove(session_id);
    }
}
