//! Pieces shared by both logical stream variants.
//!
//! A logical stream runs as one task that owns its whole lifecycle. The
//! session keeps a [`StreamHandle`] for dispatch; the task keeps a
//! [`StreamLink`] for sending back through the session without owning it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::codec::{Envelope, MessagePriority, WebStreamMsg};
use super::resolver::{HyperFetcher, LocalFetcher, Resolver};
use super::session::Session;
use crate::config::LocalConfig;
use crate::error::TunnelError;

/// How long a normal-priority stream yields to an active high-priority one.
const PRIORITY_DELAY: Duration = Duration::from_millis(100);

/// A high-priority stream older than this no longer delays others.
const PRIORITY_STALE_AFTER: Duration = Duration::from_secs(5);

/// Local-side collaborators every stream needs.
pub struct StreamContext {
    pub resolver: Resolver,
    pub fetcher: Arc<dyn LocalFetcher>,
    /// TLS for local `wss://` proxies, which are usually self-signed.
    pub ws_tls: native_tls::TlsConnector,
    pub ws_open_timeout: Duration,
}

impl StreamContext {
    pub fn new(config: &LocalConfig) -> Result<Self, TunnelError> {
        let fetcher = HyperFetcher::new(Duration::from_secs(config.request_timeout_secs))?;
        Self::with_fetcher(config, Arc::new(fetcher))
    }

    pub fn with_fetcher(
        config: &LocalConfig,
        fetcher: Arc<dyn LocalFetcher>,
    ) -> Result<Self, TunnelError> {
        let ws_tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?;
        Ok(Self {
            resolver: Resolver::new(config),
            fetcher,
            ws_tls,
            ws_open_timeout: Duration::from_secs(config.ws_open_timeout_secs),
        })
    }
}

/// State shared between a stream's handle and its task.
#[derive(Debug)]
pub struct StreamControl {
    id: u32,
    opened_at: Instant,
    closed: AtomicBool,
}

impl StreamControl {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            opened_at: Instant::now(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed. Returns true for the single caller that made the transition.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Which variant a stream is, for shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Http,
    WebSocket,
}

/// The session's side of a running stream.
pub struct StreamHandle {
    pub kind: StreamKind,
    pub control: Arc<StreamControl>,
    inbox: mpsc::UnboundedSender<WebStreamMsg>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn new(
        kind: StreamKind,
        control: Arc<StreamControl>,
        inbox: mpsc::UnboundedSender<WebStreamMsg>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            kind,
            control,
            inbox,
            task,
        }
    }

    /// Queue a relay message for the stream task, in arrival order.
    pub fn deliver(&self, msg: WebStreamMsg) {
        if self.inbox.send(msg).is_err() {
            debug!(stream_id = self.control.id(), "Stream: task already gone, dropping message");
        }
    }

    /// Close without echoing a close envelope to the relay.
    ///
    /// HTTP work is aborted outright. A WebSocket task sees its inbox end and
    /// closes the local socket itself.
    pub fn shutdown(self) {
        self.control.mark_closed();
        match self.kind {
            StreamKind::Http => self.task.abort(),
            StreamKind::WebSocket => drop(self.inbox),
        }
    }
}

/// The task's non-owning path back to its session.
#[derive(Clone)]
pub struct StreamLink {
    session: Weak<Session>,
    control: Arc<StreamControl>,
}

impl StreamLink {
    pub fn new(session: Weak<Session>, control: Arc<StreamControl>) -> Self {
        Self { session, control }
    }

    pub fn id(&self) -> u32 {
        self.control.id()
    }

    pub fn opened_at(&self) -> Instant {
        self.control.opened_at()
    }

    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }

    /// Send one envelope for this stream.
    ///
    /// A message flagged `is_close_message` is sent at most once per stream
    /// and removes the stream from the session.
    pub async fn send(&self, msg: WebStreamMsg) -> Result<(), TunnelError> {
        let is_close = msg.is_close_message;
        if is_close {
            if !self.control.mark_closed() {
                return Ok(());
            }
        } else if self.control.is_closed() {
            return Err(TunnelError::stream(self.id(), "stream already closed"));
        }

        let session = self.session.upgrade().ok_or(TunnelError::SessionClosed)?;
        // The relay may reuse the id as soon as it sees the close.
        if is_close {
            session.remove_stream(&self.control);
        }
        session.send(Envelope::WebStream(msg)).await
    }

    /// Count a failed stream and close it.
    pub async fn fail(&self, due_to_connection_failure: bool) {
        if let Some(session) = self.session.upgrade() {
            session.record_stream_failure();
        }
        self.close(due_to_connection_failure).await;
    }

    /// Send this stream's close envelope, unless one was already sent or received.
    pub async fn close(&self, due_to_connection_failure: bool) {
        let mut msg = WebStreamMsg::close(self.id());
        msg.close_due_to_connection_failure = due_to_connection_failure;
        if let Err(e) = self.send(msg).await {
            debug!(stream_id = self.id(), "Stream: close not delivered: {e}");
        }
    }
}

#[derive(Debug, Default)]
struct PriorityState {
    active: usize,
    last_started: Option<Instant>,
}

/// Lets interactive requests jump ahead of background asset fetches.
#[derive(Debug, Default)]
pub struct PriorityTracker {
    state: Mutex<PriorityState>,
}

impl PriorityTracker {
    /// Register a high-priority stream for as long as the guard lives.
    pub fn begin(self: &Arc<Self>) -> HighPriorityGuard {
        if let Ok(mut state) = self.state.lock() {
            state.active += 1;
            state.last_started = Some(Instant::now());
        }
        HighPriorityGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn is_busy(&self) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        state.active > 0
            && state
                .last_started
                .is_some_and(|started| started.elapsed() <= PRIORITY_STALE_AFTER)
    }

    /// Delay a normal-or-lower priority stream while a fresh high-priority
    /// stream is in flight.
    pub async fn yield_if_busy(&self, priority: MessagePriority) {
        if priority.is_high() || !self.is_busy() {
            return;
        }
        tokio::time::sleep(PRIORITY_DELAY).await;
    }
}

pub struct HighPriorityGuard {
    tracker: Arc<PriorityTracker>,
}

impl Drop for HighPriorityGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.tracker.state.lock() {
            state.active = state.active.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_closed_once() {
        let control = StreamControl::new(9);
        assert!(!control.is_closed());
        assert!(control.mark_closed());
        assert!(!control.mark_closed());
        assert!(control.is_closed());
    }

    #[tokio::test]
    async fn test_priority_tracker_guard() {
        let tracker = Arc::new(PriorityTracker::default());
        assert!(!tracker.is_busy());
        let guard = tracker.begin();
        assert!(tracker.is_busy());

        let started = Instant::now();
        tracker.yield_if_busy(MessagePriority::High).await;
        assert!(started.elapsed() < PRIORITY_DELAY);

        drop(guard);
        assert!(!tracker.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_tracker_delays_low_priority() {
        let tracker = Arc::new(PriorityTracker::default());
        let _guard = tracker.begin();
        let started = Instant::now();
        tracker.yield_if_busy(MessagePriority::Low).await;
        assert!(started.elapsed() >= PRIORITY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_tracker_goes_stale() {
        let tracker = Arc::new(PriorityTracker::default());
        let _guard = tracker.begin();
        tokio::time::advance(PRIORITY_STALE_AFTER + Duration::from_millis(1)).await;
        assert!(!tracker.is_busy());
    }
}
