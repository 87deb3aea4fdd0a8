//! Lifecycle events for self-healing runs.
//!
//! Live subscribers get events through a `tokio::sync::broadcast` channel.
//! The bus also keeps a short history so a caller can look back at what a
//! finished run did without having subscribed beforehand.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ids::RunId;
use crate::keying::KeyingParams;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_HISTORY: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    AttemptStarted {
        run_id: RunId,
        attempt: u32,
        params: KeyingParams,
    },
    /// Primary parameters produced black output; retrying with the
    /// last-known-good set.
    Reverted {
        run_id: RunId,
        attempt: u32,
        params: KeyingParams,
    },
    SafeModeEntered {
        run_id: RunId,
        attempt: u32,
        params: KeyingParams,
    },
    ForensicsFailed {
        run_id: RunId,
        attempt: u32,
        error: String,
    },
    GateFailed {
        run_id: RunId,
        attempt: u32,
        similarity: Option<f64>,
        error: Option<String>,
    },
    BaselineEstablished {
        path: PathBuf,
        frames: usize,
    },
    /// The stall monitor terminated a tracked process.
    ProcessStalled {
        pid: u32,
        command: String,
        cpu_percent: f64,
        runtime_secs: u64,
    },
    RunSucceeded {
        run_id: RunId,
        attempts: u32,
        reverted: bool,
    },
    RunFailed {
        run_id: RunId,
        attempts: u32,
        error: String,
    },
}

impl EventPayload {
    /// The run this event belongs to, if it is scoped to one.
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            Self::AttemptStarted { run_id, .. }
            | Self::Reverted { run_id, .. }
            | Self::SafeModeEntered { run_id, .. }
            | Self::ForensicsFailed { run_id, .. }
            | Self::GateFailed { run_id, .. }
            | Self::RunSucceeded { run_id, .. }
            | Self::RunFailed { run_id, .. } => Some(*run_id),
            Self::BaselineEstablished { .. } | Self::ProcessStalled { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Fan-out of [`Event`]s plus a bounded history, newest first.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    history: RwLock<VecDeque<Event>>,
    history_len: usize,
}

impl EventBus {
    /// `capacity` bounds the broadcast channel; lagging receivers lose the
    /// oldest events. `history` bounds [`recent_events`](Self::recent_events).
    pub fn new(capacity: usize, history: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            history: RwLock::new(VecDeque::with_capacity(history)),
            history_len: history,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Record and publish. Never fails, with or without subscribers.
    pub fn broadcast(&self, payload: EventPayload) {
        let event = Event::new(payload);
        if self.history_len > 0 {
            let mut history = self.history.write();
            history.truncate(self.history_len - 1);
            history.push_front(event.clone());
        }
        let _ = self.tx.send(event);
    }

    /// Up to `n` retained events, newest first.
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        self.history.read().iter().take(n).cloned().collect()
    }

    /// Retained events belonging to `run_id`, oldest first.
    pub fn run_history(&self, run_id: RunId) -> Vec<Event> {
        self.history
            .read()
            .iter()
            .rev()
            .filter(|e| e.payload.run_id() == Some(run_id))
            .cloned()
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY, DEFAULT_HISTORY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("retained", &self.history.read().len())
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keying::KeyColor;

    fn stalled(pid: u32) -> EventPayload {
        EventPayload::ProcessStalled {
            pid,
            command: "ffmpeg".into(),
            cpu_percent: 0.0,
            runtime_secs: 301,
        }
    }

    #[test]
    fn subscribers_see_broadcasts() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let run_id = RunId::new();
        bus.broadcast(EventPayload::AttemptStarted {
            run_id,
            attempt: 1,
            params: KeyingParams::new(KeyColor::GREEN, 0.35, true),
        });

        let event = rx.try_recv().unwrap();
        assert_eq!(event.payload.run_id(), Some(run_id));
        assert!(matches!(
            event.payload,
            EventPayload::AttemptStarted { attempt: 1, .. }
        ));
    }

    #[test]
    fn history_is_bounded_and_newest_first() {
        let bus = EventBus::new(4, 5);
        for pid in 0..12 {
            bus.broadcast(stalled(pid));
        }
        let pids: Vec<u32> = bus
            .recent_events(usize::MAX)
            .iter()
            .map(|e| match e.payload {
                EventPayload::ProcessStalled { pid, .. } => pid,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(pids, vec![11, 10, 9, 8, 7]);
    }

    #[test]
    fn zero_history_still_broadcasts() {
        let bus = EventBus::new(4, 0);
        let mut rx = bus.subscribe();
        bus.broadcast(stalled(7));
        assert!(bus.recent_events(10).is_empty());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn run_history_filters_by_run() {
        let bus = EventBus::default();
        let (a, b) = (RunId::new(), RunId::new());
        bus.broadcast(EventPayload::RunFailed {
            run_id: b,
            attempts: 3,
            error: "black output".into(),
        });
        bus.broadcast(stalled(1));
        bus.broadcast(EventPayload::RunSucceeded {
            run_id: a,
            attempts: 1,
            reverted: false,
        });

        let history = bus.run_history(a);
        assert_eq!(history.len(), 1);
        assert!(matches!(
            history[0].payload,
            EventPayload::RunSucceeded { attempts: 1, .. }
        ));
    }

    #[test]
    fn payload_carries_a_type_tag() {
        let event = Event::new(EventPayload::RunSucceeded {
            run_id: RunId::new(),
            attempts: 1,
            reverted: false,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"run_succeeded\""), "got: {json}");
    }
}
