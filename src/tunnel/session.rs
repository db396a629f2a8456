//! One relay session: the handshake plus every logical stream carried on a
//! single physical connection.
//!
//! Dispatch never blocks on I/O. Each stream runs as its own task and the
//! session only forwards messages into that task's inbox, so envelopes for a
//! given stream are handled in arrival order while different streams proceed
//! independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::codec::{self, Envelope, HandshakeAck, HandshakeSyn, WebStreamMsg};
use super::stream::{
    PriorityTracker, StreamContext, StreamControl, StreamHandle, StreamKind, StreamLink,
};
use super::{http_stream, ws_stream};
use crate::error::TunnelError;
use crate::state::{TunnelEventType, TunnelStats};

/// Backoff added when the relay says this agent is too old to serve.
pub const REQUIRES_UPDATE_BACKOFF_SECS: u64 = 12 * 60 * 60;

/// Callbacks from a session to whoever owns its connection.
///
/// Every call carries the session id so the owner can ignore sessions it has
/// already replaced.
pub trait SessionEvents: Send + Sync {
    fn on_handshake_complete(&self, session_id: u64);
    fn on_session_error(&self, session_id: u64, backoff_modifier_secs: u64);
    fn on_summon_request(&self, session_id: u64, url: String);
    fn on_activity(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Pending,
    Complete,
    Failed,
}

pub struct Session {
    id: u64,
    syn: HandshakeSyn,
    outbound: mpsc::Sender<Message>,
    streams: Mutex<HashMap<u32, StreamHandle>>,
    accepting: AtomicBool,
    handshake: Mutex<HandshakeState>,
    events: Arc<dyn SessionEvents>,
    ctx: Arc<StreamContext>,
    priority: Arc<PriorityTracker>,
    stats: Arc<TunnelStats>,
    self_ref: Weak<Session>,
}

impl Session {
    /// `outbound` feeds the connection's single socket writer.
    pub fn new(
        id: u64,
        syn: HandshakeSyn,
        outbound: mpsc::Sender<Message>,
        events: Arc<dyn SessionEvents>,
        ctx: Arc<StreamContext>,
        stats: Arc<TunnelStats>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id,
            syn,
            outbound,
            streams: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            handshake: Mutex::new(HandshakeState::Pending),
            events,
            ctx,
            priority: Arc::new(PriorityTracker::default()),
            stats,
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake
            .lock()
            .map(|state| *state)
            .unwrap_or(HandshakeState::Failed)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().map(|streams| streams.len()).unwrap_or(0)
    }

    pub async fn start_handshake(&self) -> Result<(), TunnelError> {
        info!(
            session_id = self.id,
            "Session: sending handshake as {} v{}", self.syn.identity, self.syn.version
        );
        self.send(Envelope::HandshakeSyn(self.syn.clone())).await
    }

    /// Decode and dispatch one binary frame from the relay.
    ///
    /// An `Err` that [`is_protocol_fault`](TunnelError::is_protocol_fault)
    /// means the connection must be torn down.
    pub fn handle_frame(&self, frame: Bytes) -> Result<(), TunnelError> {
        TunnelStats::count(&self.stats.messages_received);
        self.events.on_activity();
        let envelope = codec::decode(frame)?;
        self.dispatch(envelope)
    }

    pub fn dispatch(&self, envelope: Envelope) -> Result<(), TunnelError> {
        if !self.is_open() {
            return Ok(());
        }
        match envelope {
            Envelope::HandshakeAck(ack) => self.handle_ack(ack),
            Envelope::HandshakeSyn(_) => Err(TunnelError::Protocol(
                "relay sent a handshake syn".to_string(),
            )),
            Envelope::Summon(summon) => {
                if summon.server_connect_url.is_empty() {
                    warn!(session_id = self.id, "Session: summon without a url, ignoring");
                } else {
                    self.events
                        .on_summon_request(self.id, summon.server_connect_url);
                }
                Ok(())
            }
            Envelope::WebStream(msg) => {
                if self.handshake_state() != HandshakeState::Complete {
                    return Err(TunnelError::Protocol(format!(
                        "stream {} message before handshake completed",
                        msg.stream_id
                    )));
                }
                self.dispatch_stream(msg)
            }
        }
    }

    fn handle_ack(&self, ack: HandshakeAck) -> Result<(), TunnelError> {
        {
            let mut state = self
                .handshake
                .lock()
                .map_err(|_| TunnelError::Protocol("handshake state poisoned".to_string()))?;
            if *state != HandshakeState::Pending {
                return Err(TunnelError::Protocol("duplicate handshake ack".to_string()));
            }
            *state = if ack.accepted {
                HandshakeState::Complete
            } else {
                HandshakeState::Failed
            };
        }

        if ack.accepted {
            info!(session_id = self.id, "Session: handshake complete");
            self.stats
                .record(TunnelEventType::HandshakeComplete, format!("session {}", self.id));
            self.events.on_handshake_complete(self.id);
            return Ok(());
        }

        let reason = ack.error_reason.as_deref().unwrap_or("no reason given");
        let modifier = if ack.requires_update {
            error!("Session: relay rejected this agent version, an update is required ({reason})");
            REQUIRES_UPDATE_BACKOFF_SECS
        } else {
            warn!(session_id = self.id, "Session: handshake rejected: {reason}");
            u64::from(ack.backoff_seconds_hint.unwrap_or(0))
        };
        self.events.on_session_error(self.id, modifier);
        Ok(())
    }

    /// Route one stream message: open, close, or forward to the stream task.
    pub fn dispatch_stream(&self, msg: WebStreamMsg) -> Result<(), TunnelError> {
        if !self.is_open() {
            return Ok(());
        }
        let id = msg.stream_id;
        if id == 0 {
            return Err(TunnelError::Protocol("stream id 0 is reserved".to_string()));
        }

        let mut streams = self
            .streams
            .lock()
            .map_err(|_| TunnelError::Protocol("stream map poisoned".to_string()))?;

        if streams.contains_key(&id) {
            if msg.open.is_some() {
                return Err(TunnelError::Protocol(format!(
                    "open message for already-open stream {id}"
                )));
            }
            if msg.is_close_message {
                let handle = streams.remove(&id);
                drop(streams);
                if let Some(handle) = handle {
                    debug!(stream_id = id, "Session: relay closed stream");
                    handle.shutdown();
                }
                return Ok(());
            }
            if let Some(handle) = streams.get(&id) {
                handle.deliver(msg);
            }
            return Ok(());
        }

        let Some(open) = msg.open.as_ref() else {
            if msg.is_close_message {
                debug!(stream_id = id, "Session: close for a stream that is already gone");
            } else {
                warn!(stream_id = id, "Session: message for unknown stream, ignoring");
            }
            return Ok(());
        };
        let kind = if open.is_websocket {
            StreamKind::WebSocket
        } else {
            StreamKind::Http
        };
        debug!(stream_id = id, "Session: opening {kind:?} stream {} {}", open.method, open.path);
        let handle = self.spawn_stream(id, kind, msg);
        streams.insert(id, handle);
        TunnelStats::count(&self.stats.streams_opened);
        Ok(())
    }

    fn spawn_stream(&self, id: u32, kind: StreamKind, open: WebStreamMsg) -> StreamHandle {
        let control = Arc::new(StreamControl::new(id));
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        // Cannot fail: the receiver is alive until the task below drops it.
        let _ = inbox_tx.send(open);

        let link = StreamLink::new(self.self_ref.clone(), Arc::clone(&control));
        let ctx = Arc::clone(&self.ctx);
        let task = match kind {
            StreamKind::Http => {
                let priority = Arc::clone(&self.priority);
                tokio::spawn(http_stream::run(link, ctx, priority, inbox_rx))
            }
            StreamKind::WebSocket => tokio::spawn(ws_stream::run(link, ctx, inbox_rx)),
        };
        StreamHandle::new(kind, control, inbox_tx, task)
    }

    /// Remove a finished stream, unless its id was already reused.
    pub fn remove_stream(&self, control: &Arc<StreamControl>) {
        let Ok(mut streams) = self.streams.lock() else {
            return;
        };
        let same = streams
            .get(&control.id())
            .is_some_and(|handle| Arc::ptr_eq(&handle.control, control));
        if same {
            streams.remove(&control.id());
        }
    }

    pub fn record_stream_failure(&self) {
        TunnelStats::count(&self.stats.streams_failed);
    }

    /// Serialize and queue one envelope for the socket writer.
    pub async fn send(&self, envelope: Envelope) -> Result<(), TunnelError> {
        let frame = codec::encode(&envelope)?;
        self.outbound
            .send(Message::Binary(frame))
            .await
            .map_err(|_| TunnelError::SessionClosed)?;
        TunnelStats::count(&self.stats.messages_sent);
        self.events.on_activity();
        Ok(())
    }

    /// Stop accepting work and close every stream without notifying the relay.
    pub fn close_all(&self) {
        self.accepting.store(false, Ordering::Release);
        let handles: Vec<StreamHandle> = match self.streams.lock() {
            Ok(mut streams) => streams.drain().map(|(_, handle)| handle).collect(),
            Err(_) => Vec::new(),
        };
        if !handles.is_empty() {
            info!(session_id = self.id, "Session: closing {} open streams", handles.len());
        }
        for handle in handles {
            handle.shutdown();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::LocalConfig;
    use crate::tunnel::codec::{decode, OpenDetails, Summon};
    use crate::tunnel::resolver::tests::FakeFetcher;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Recorded {
        Handshake(u64),
        Error(u64, u64),
        Summon(u64, String),
    }

    #[derive(Clone, Default)]
    pub(crate) struct RecordingEvents {
        pub recorded: Arc<Mutex<Vec<Recorded>>>,
    }

    impl RecordingEvents {
        pub(crate) fn take(&self) -> Vec<Recorded> {
            std::mem::take(&mut *self.recorded.lock().unwrap())
        }
    }

    impl SessionEvents for RecordingEvents {
        fn on_handshake_complete(&self, session_id: u64) {
            self.recorded.lock().unwrap().push(Recorded::Handshake(session_id));
        }

        fn on_session_error(&self, session_id: u64, backoff_modifier_secs: u64) {
            self.recorded
                .lock()
                .unwrap()
                .push(Recorded::Error(session_id, backoff_modifier_secs));
        }

        fn on_summon_request(&self, session_id: u64, url: String) {
            self.recorded.lock().unwrap().push(Recorded::Summon(session_id, url));
        }

        fn on_activity(&self) {}
    }

    fn syn() -> HandshakeSyn {
        HandshakeSyn {
            identity: "printer-1".into(),
            version: "0.1.0".into(),
            is_primary: true,
            local_proxy_port: None,
            lan_ip: None,
        }
    }

    fn fresh_session(
        ctx: Arc<StreamContext>,
        events: RecordingEvents,
    ) -> (Arc<Session>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(64);
        let session = Session::new(
            1,
            syn(),
            tx,
            Arc::new(events),
            ctx,
            Arc::new(TunnelStats::new()),
        );
        (session, rx)
    }

    /// A session whose handshake already completed.
    pub(crate) fn test_session(
        ctx: Arc<StreamContext>,
        events: RecordingEvents,
    ) -> (Arc<Session>, mpsc::Receiver<Message>) {
        let (session, rx) = fresh_session(ctx, events);
        *session.handshake.lock().unwrap() = HandshakeState::Complete;
        (session, rx)
    }

    fn test_context() -> Arc<StreamContext> {
        let config = LocalConfig {
            lan_ip: Some("192.0.2.1".into()),
            ..LocalConfig::default()
        };
        Arc::new(StreamContext::with_fetcher(&config, Arc::new(FakeFetcher::default())).unwrap())
    }

    /// Open message for an upload that has not finished, so the stream stays open.
    fn open_post(stream_id: u32) -> WebStreamMsg {
        let mut msg = WebStreamMsg::new(stream_id);
        msg.open = Some(OpenDetails {
            method: "POST".into(),
            path: "/api/files".into(),
            ..OpenDetails::default()
        });
        msg.full_stream_data_size = Some(1024);
        msg
    }

    fn ack(accepted: bool) -> HandshakeAck {
        HandshakeAck {
            accepted,
            error_reason: None,
            backoff_seconds_hint: None,
            requires_update: false,
        }
    }

    #[tokio::test]
    async fn test_duplicate_open_is_protocol_fault() {
        let (session, _wire) = test_session(test_context(), RecordingEvents::default());
        session.dispatch_stream(open_post(9)).unwrap();
        let err = session.dispatch_stream(open_post(9)).unwrap_err();
        assert!(err.is_protocol_fault());
        assert_eq!(session.stream_count(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_after_close_is_noop() {
        let (session, mut wire) = test_session(test_context(), RecordingEvents::default());
        session.dispatch_stream(open_post(9)).unwrap();
        session.dispatch_stream(WebStreamMsg::close(9)).unwrap();
        assert_eq!(session.stream_count(), 0);

        let mut late = WebStreamMsg::new(9);
        late.data = Bytes::from_static(b"late");
        session.dispatch_stream(late).unwrap();
        session.dispatch_stream(WebStreamMsg::close(9)).unwrap();
        assert_eq!(session.stream_count(), 0);

        // A relay-initiated close is never echoed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(wire.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stream_unregistered_before_close_is_queued() {
        // Writer queue already full, so the close envelope has to wait.
        let (tx, mut wire) = mpsc::channel(1);
        tx.try_send(Message::Ping(Bytes::new())).unwrap();
        let session = Session::new(
            1,
            syn(),
            tx,
            Arc::new(RecordingEvents::default()),
            test_context(),
            Arc::new(TunnelStats::new()),
        );
        *session.handshake.lock().unwrap() = HandshakeState::Complete;

        let mut open = WebStreamMsg::new(4);
        open.open = Some(OpenDetails {
            method: "GET".into(),
            path: "/api/printer".into(),
            ..OpenDetails::default()
        });
        open.is_data_transmission_done = true;
        session.dispatch_stream(open).unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while session.stream_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        session.dispatch_stream(open_post(4)).unwrap();

        assert!(matches!(wire.recv().await, Some(Message::Ping(_))));
        match wire.recv().await {
            Some(Message::Binary(frame)) => match decode(frame).unwrap() {
                Envelope::WebStream(msg) => {
                    assert_eq!(msg.stream_id, 4);
                    assert!(msg.is_close_message);
                }
                other => panic!("unexpected envelope {other:?}"),
            },
            other => panic!("unexpected frame {other:?}"),
        }
        assert_eq!(session.stream_count(), 1);
    }

    #[tokio::test]
    async fn test_reserved_stream_id() {
        let (session, _wire) = test_session(test_context(), RecordingEvents::default());
        assert!(session
            .dispatch_stream(open_post(0))
            .unwrap_err()
            .is_protocol_fault());
    }

    #[tokio::test]
    async fn test_close_all_stops_dispatch() {
        let (session, _wire) = test_session(test_context(), RecordingEvents::default());
        session.dispatch_stream(open_post(1)).unwrap();
        session.dispatch_stream(open_post(2)).unwrap();
        assert_eq!(session.stream_count(), 2);

        session.close_all();
        assert_eq!(session.stream_count(), 0);
        assert!(!session.is_open());

        session.dispatch_stream(open_post(3)).unwrap();
        assert_eq!(session.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_handshake_flow() {
        let events = RecordingEvents::default();
        let (session, mut wire) = fresh_session(test_context(), events.clone());

        session.start_handshake().await.unwrap();
        let Some(Message::Binary(frame)) = wire.recv().await else {
            panic!("expected a binary frame");
        };
        assert!(matches!(decode(frame).unwrap(), Envelope::HandshakeSyn(s) if s.identity == "printer-1"));

        assert!(session
            .dispatch(Envelope::WebStream(open_post(4)))
            .unwrap_err()
            .is_protocol_fault());

        session.dispatch(Envelope::HandshakeAck(ack(true))).unwrap();
        assert_eq!(session.handshake_state(), HandshakeState::Complete);
        assert_eq!(events.take(), vec![Recorded::Handshake(1)]);
        assert!(session.dispatch(Envelope::HandshakeAck(ack(true))).is_err());
    }

    #[tokio::test]
    async fn test_rejected_handshake_reports_backoff() {
        let events = RecordingEvents::default();
        let (session, _wire) = fresh_session(test_context(), events.clone());
        let mut rejected = ack(false);
        rejected.backoff_seconds_hint = Some(30);
        session.dispatch(Envelope::HandshakeAck(rejected)).unwrap();
        assert_eq!(session.handshake_state(), HandshakeState::Failed);
        assert_eq!(events.take(), vec![Recorded::Error(1, 30)]);

        let (session, _wire) = fresh_session(test_context(), events.clone());
        let mut outdated = ack(false);
        outdated.requires_update = true;
        session.dispatch(Envelope::HandshakeAck(outdated)).unwrap();
        assert_eq!(
            events.take(),
            vec![Recorded::Error(1, REQUIRES_UPDATE_BACKOFF_SECS)]
        );
    }

    #[tokio::test]
    async fn test_summon_routing() {
        let events = RecordingEvents::default();
        let (session, _wire) = test_session(test_context(), events.clone());
        session
            .dispatch(Envelope::Summon(Summon {
                server_connect_url: "wss://relay-7.example/ws".into(),
            }))
            .unwrap();
        session
            .dispatch(Envelope::Summon(Summon {
                server_connect_url: String::new(),
            }))
            .unwrap();
        assert_eq!(
            events.take(),
            vec![Recorded::Summon(1, "wss://relay-7.example/ws".into())]
        );
    }

    #[tokio::test]
    async fn test_garbage_frame_is_protocol_fault() {
        let (session, _wire) = test_session(test_context(), RecordingEvents::default());
        let err = session
            .handle_frame(Bytes::from_static(&[1, 0, 0, 0, 3]))
            .unwrap_err();
        assert!(err.is_protocol_fault());
    }
}
