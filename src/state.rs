//! Tunnel statistics shared by every supervisor and session.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde_json::{json, Value};

/// Lifecycle milestones of relay connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelEventType {
    Connected,
    HandshakeComplete,
    Disconnected,
    ReconnectAttempt,
    SummonStarted,
    RunForExpired,
}

impl TunnelEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::HandshakeComplete => "handshake_complete",
            Self::Disconnected => "disconnected",
            Self::ReconnectAttempt => "reconnect_attempt",
            Self::SummonStarted => "summon_started",
            Self::RunForExpired => "run_for_expired",
        }
    }
}

#[derive(Clone, Debug)]
pub struct TunnelEvent {
    pub at: Instant,
    pub kind: TunnelEventType,
    /// Relay URL or session id the event refers to.
    pub detail: String,
}

/// Events kept for the shutdown summary.
const EVENT_LOG_CAPACITY: usize = 50;

/// Bounded log of recent events; the oldest entry is dropped when full.
#[derive(Debug)]
pub struct EventLog {
    entries: Mutex<VecDeque<TunnelEvent>>,
}

impl EventLog {
    fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(EVENT_LOG_CAPACITY)),
        }
    }

    pub fn record(&self, kind: TunnelEventType, detail: impl Into<String>) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if entries.len() == EVENT_LOG_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(TunnelEvent {
            at: Instant::now(),
            kind,
            detail: detail.into(),
        });
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<TunnelEvent> {
        self.entries
            .lock()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<TunnelEventType> {
        self.recent().into_iter().map(|event| event.kind).collect()
    }
}

/// Counters are updated on the hot path without locking; only the event log
/// takes a mutex.
pub struct TunnelStats {
    pub connected: AtomicBool,
    pub reconnects: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub streams_opened: AtomicU64,
    pub streams_failed: AtomicU64,
    pub events: EventLog,
    started: Instant,
}

impl TunnelStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            streams_opened: AtomicU64::new(0),
            streams_failed: AtomicU64::new(0),
            events: EventLog::new(),
            started: Instant::now(),
        }
    }

    pub fn record(&self, kind: TunnelEventType, detail: impl Into<String>) {
        self.events.record(kind, detail);
    }

    pub fn count(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time JSON view, logged on shutdown.
    pub fn snapshot(&self) -> Value {
        let events: Vec<Value> = self
            .events
            .recent()
            .iter()
            .map(|event| {
                json!({
                    "at_ms": event.at.duration_since(self.started).as_millis() as u64,
                    "type": event.kind.as_str(),
                    "detail": event.detail,
                })
            })
            .collect();
        json!({
            "connected": self.connected.load(Ordering::Relaxed),
            "reconnects": self.reconnects.load(Ordering::Relaxed),
            "messages_sent": self.messages_sent.load(Ordering::Relaxed),
            "messages_received": self.messages_received.load(Ordering::Relaxed),
            "streams_opened": self.streams_opened.load(Ordering::Relaxed),
            "streams_failed": self.streams_failed.load(Ordering::Relaxed),
            "uptime_secs": self.started.elapsed().as_secs(),
            "events": events,
        })
    }
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_log_is_bounded() {
        let stats = TunnelStats::new();
        for i in 0..(EVENT_LOG_CAPACITY + 5) {
            stats.record(TunnelEventType::ReconnectAttempt, format!("attempt {i}"));
        }
        let recent = stats.events.recent();
        assert_eq!(recent.len(), EVENT_LOG_CAPACITY);
        assert_eq!(recent[0].detail, "attempt 5");
    }

    #[test]
    fn test_snapshot_counts() {
        let stats = TunnelStats::new();
        TunnelStats::count(&stats.messages_sent);
        TunnelStats::count(&stats.messages_sent);
        TunnelStats::count(&stats.streams_opened);
        stats.record(TunnelEventType::Connected, "wss://relay.example/ws");
        let snap = stats.snapshot();
        assert_eq!(snap["messages_sent"], 2);
        assert_eq!(snap["streams_opened"], 1);
        assert_eq!(snap["events"][0]["type"], "connected");
    }
}
