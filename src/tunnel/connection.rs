//! Connection supervisor: keeps one relay connection alive.
//!
//! Each connection attempt gets a fresh session id. Callbacks from sessions
//! carry that id and are dropped when it no longer matches.
//!
//! Connections are recycled by the RunFor policy. A connection older than its
//! budget is closed once it has been quiet for a while, and unconditionally
//! once it overruns the budget by a hard ceiling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::codec::HandshakeSyn;
use super::session::{Session, SessionEvents};
use super::socket::PhysicalSocket;
use super::stream::StreamContext;
use crate::config::Config;
use crate::error::TunnelError;
use crate::state::{TunnelEventType, TunnelStats};

/// Exponential reconnect delay in whole seconds.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: u64,
    cap: u64,
    current: u64,
}

impl Backoff {
    pub fn new(floor: u64, cap: u64) -> Self {
        Self {
            floor,
            cap: cap.max(floor),
            current: floor,
        }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    /// Delay for this failure; doubles the delay for the next one.
    pub fn next_delay(&mut self) -> u64 {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).clamp(self.floor, self.cap);
        delay
    }

    /// Relay-requested slowdown on top of the current delay.
    pub fn add(&mut self, secs: u64) {
        self.current = self.current.saturating_add(secs);
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

/// Connection recycling thresholds.
#[derive(Debug, Clone, Copy)]
pub struct RunForPolicy {
    pub run_for: Duration,
    pub min_quiet: Duration,
    pub max_overrun: Duration,
}

impl RunForPolicy {
    /// `age` is time since the supervisor started, `idle` time since the last
    /// inbound or outbound message.
    pub fn is_expired(&self, age: Duration, idle: Duration) -> bool {
        if age <= self.run_for {
            return false;
        }
        if age > self.run_for + self.max_overrun {
            return true;
        }
        idle > self.min_quiet
    }
}

/// Supervisor state that sessions call back into.
struct SupervisorShared {
    label: String,
    active_session_id: AtomicU64,
    backoff: Mutex<Backoff>,
    last_activity: Mutex<Instant>,
    disconnect: watch::Sender<u64>,
    summons: Option<mpsc::UnboundedSender<String>>,
}

impl SupervisorShared {
    fn is_stale(&self, session_id: u64) -> bool {
        session_id != self.active_session_id.load(Ordering::Acquire)
    }

    fn last_activity(&self) -> Instant {
        self.last_activity
            .lock()
            .map(|at| *at)
            .unwrap_or_else(|_| Instant::now())
    }
}

impl SessionEvents for SupervisorShared {
    fn on_handshake_complete(&self, session_id: u64) {
        if self.is_stale(session_id) {
            return;
        }
        if let Ok(mut backoff) = self.backoff.lock() {
            backoff.reset();
        }
        info!("Tunnel: {} connection established", self.label);
    }

    fn on_session_error(&self, session_id: u64, backoff_modifier_secs: u64) {
        if self.is_stale(session_id) {
            return;
        }
        if let Ok(mut backoff) = self.backoff.lock() {
            backoff.add(backoff_modifier_secs);
        }
        self.disconnect.send_replace(session_id);
    }

    fn on_summon_request(&self, session_id: u64, url: String) {
        if self.is_stale(session_id) {
            return;
        }
        match &self.summons {
            Some(summons) => {
                if summons.send(url).is_err() {
                    warn!("Tunnel: summon received but the agent is shutting down");
                }
            }
            None => warn!("Tunnel: {} cannot honor summon to {url}", self.label),
        }
    }

    fn on_activity(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Instant::now();
        }
    }
}

/// Why a connection ended.
#[derive(Debug, PartialEq, Eq)]
enum Disconnect {
    RelayClosed,
    Requested,
    RunForExpired,
}

pub struct ConnectionSupervisor {
    url: String,
    syn: HandshakeSyn,
    heartbeat: Duration,
    run_for_check: Duration,
    jitter: (u64, u64),
    policy: RunForPolicy,
    created: Instant,
    ctx: Arc<StreamContext>,
    stats: Arc<TunnelStats>,
    shared: Arc<SupervisorShared>,
}

impl ConnectionSupervisor {
    /// `summons` receives relay summon URLs; `None` for supervisors that
    /// should not start secondaries.
    pub fn new(
        url: String,
        is_primary: bool,
        config: &Config,
        ctx: Arc<StreamContext>,
        stats: Arc<TunnelStats>,
        summons: Option<mpsc::UnboundedSender<String>>,
    ) -> Self {
        let relay = &config.relay;
        let run_for_secs = if is_primary {
            relay.primary_run_for_secs
        } else {
            relay.secondary_run_for_secs
        };
        let syn = HandshakeSyn {
            identity: config.agent.identity.clone(),
            version: config.agent.version.clone(),
            is_primary,
            local_proxy_port: ctx.resolver.proxy_port(),
            lan_ip: ctx.resolver.lan_ip().map(str::to_string),
        };
        let (disconnect, _) = watch::channel(0);
        let label = if is_primary { "primary" } else { "secondary" };
        Self {
            syn,
            heartbeat: Duration::from_secs(relay.heartbeat_interval_secs.max(1)),
            run_for_check: Duration::from_secs(relay.run_for_check_interval_secs.max(1)),
            jitter: (relay.jitter_min_secs, relay.jitter_max_secs),
            policy: RunForPolicy {
                run_for: Duration::from_secs(run_for_secs),
                min_quiet: Duration::from_secs(relay.min_quiet_secs),
                max_overrun: Duration::from_secs(relay.max_overrun_secs),
            },
            created: Instant::now(),
            ctx,
            stats,
            shared: Arc::new(SupervisorShared {
                label: format!("{label} relay {url}"),
                active_session_id: AtomicU64::new(0),
                backoff: Mutex::new(Backoff::new(
                    relay.backoff_floor_secs,
                    relay.backoff_cap_secs,
                )),
                last_activity: Mutex::new(Instant::now()),
                disconnect,
                summons,
            }),
            url,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_run_for_expired(&self) -> bool {
        let now = Instant::now();
        self.policy.is_expired(
            now.duration_since(self.created),
            now.duration_since(self.shared.last_activity()),
        )
    }

    /// Connect, serve, and reconnect until the RunFor policy retires this
    /// supervisor.
    pub async fn run_blocking(&self) {
        loop {
            let session_id = self.shared.active_session_id.fetch_add(1, Ordering::AcqRel) + 1;
            if session_id > 1 {
                TunnelStats::count(&self.stats.reconnects);
                self.stats
                    .record(TunnelEventType::ReconnectAttempt, self.url.clone());
            }
            info!(session_id, "Tunnel: connecting to relay at {}", self.url);

            match self.connect_and_run(session_id).await {
                Ok(reason) => info!(session_id, "Tunnel: disconnected ({reason:?})"),
                Err(e) if e.is_protocol_fault() => {
                    error!(session_id, "Tunnel: {e}, dropping connection");
                }
                Err(e) => warn!(session_id, "Tunnel: connection error: {e}"),
            }

            if self.is_run_for_expired() {
                info!("Tunnel: {} reached its run-for budget", self.shared.label);
                self.stats
                    .record(TunnelEventType::RunForExpired, self.url.clone());
                return;
            }

            let delay = self
                .shared
                .backoff
                .lock()
                .map(|mut backoff| backoff.next_delay())
                .unwrap_or(0);
            let jitter = jitter_secs(self.jitter.0, self.jitter.1);
            info!("Tunnel: reconnecting in {}s", delay + jitter);
            tokio::time::sleep(Duration::from_secs(delay + jitter)).await;
        }
    }

    async fn connect_and_run(&self, session_id: u64) -> Result<Disconnect, TunnelError> {
        let mut socket = PhysicalSocket::connect(&self.url, self.heartbeat).await?;
        self.stats.connected.store(true, Ordering::Relaxed);
        self.stats
            .record(TunnelEventType::Connected, self.url.clone());
        self.shared.on_activity();

        let session = Session::new(
            session_id,
            self.syn.clone(),
            socket.sender(),
            Arc::clone(&self.shared) as Arc<dyn SessionEvents>,
            Arc::clone(&self.ctx),
            Arc::clone(&self.stats),
        );
        let result = self.pump(&session, &mut socket).await;

        session.close_all();
        socket.close().await;
        self.stats.connected.store(false, Ordering::Relaxed);
        self.stats
            .record(TunnelEventType::Disconnected, format!("session {session_id}"));
        result
    }

    /// Receive loop for one session.
    async fn pump(
        &self,
        session: &Session,
        socket: &mut PhysicalSocket,
    ) -> Result<Disconnect, TunnelError> {
        let session_id = session.id();
        let mut disconnect = self.shared.disconnect.subscribe();
        let mut run_for_tick = tokio::time::interval(self.run_for_check);
        run_for_tick.tick().await;

        session.start_handshake().await?;
        loop {
            tokio::select! {
                frame = socket.recv() => {
                    match frame {
                        Some(Ok(frame)) => session.handle_frame(frame)?,
                        Some(Err(e)) => return Err(e),
                        None => return Ok(Disconnect::RelayClosed),
                    }
                }
                changed = disconnect.changed() => {
                    if changed.is_err() || *disconnect.borrow() == session_id {
                        return Ok(Disconnect::Requested);
                    }
                }
                _ = run_for_tick.tick() => {
                    if self.is_run_for_expired() {
                        return Ok(Disconnect::RunForExpired);
                    }
                }
            }
        }
    }
}

fn jitter_secs(min: u64, max: u64) -> u64 {
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    use crate::config::LocalConfig;
    use crate::tunnel::codec::{decode, encode, Envelope, HandshakeAck};
    use crate::tunnel::resolver::tests::FakeFetcher;

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::new(1, 180);
        let delays: Vec<u64> = (0..11).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 128, 180, 180, 180]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));

        backoff.reset();
        assert_eq!(backoff.next_delay(), 1);
        backoff.add(30);
        assert_eq!(backoff.next_delay(), 32);
    }

    #[test]
    fn test_jitter_range() {
        for _ in 0..100 {
            let j = jitter_secs(2, 10);
            assert!((2..=10).contains(&j));
        }
        assert_eq!(jitter_secs(5, 5), 5);
    }

    #[test]
    fn test_run_for_policy() {
        let policy = RunForPolicy {
            run_for: Duration::from_secs(100),
            min_quiet: Duration::from_secs(10),
            max_overrun: Duration::from_secs(50),
        };
        let s = Duration::from_secs;
        // Young connections live regardless of activity.
        assert!(!policy.is_expired(s(50), s(1000)));
        // Past the budget but busy.
        assert!(!policy.is_expired(s(120), s(5)));
        // Past the budget and quiet.
        assert!(policy.is_expired(s(120), s(11)));
        // Past the hard ceiling even while busy.
        assert!(policy.is_expired(s(151), s(0)));
    }

    fn shared() -> SupervisorShared {
        SupervisorShared {
            label: "primary test".into(),
            active_session_id: AtomicU64::new(3),
            backoff: Mutex::new(Backoff::new(1, 180)),
            last_activity: Mutex::new(Instant::now()),
            disconnect: watch::channel(0).0,
            summons: None,
        }
    }

    #[test]
    fn test_stale_session_callbacks_ignored() {
        let shared = shared();
        let mut rx = shared.disconnect.subscribe();
        shared.on_session_error(2, 60);
        assert_eq!(shared.backoff.lock().unwrap().current(), 1);
        assert!(!rx.has_changed().unwrap());

        shared.on_session_error(3, 60);
        assert_eq!(shared.backoff.lock().unwrap().current(), 61);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 3);

        shared.on_handshake_complete(2);
        assert_eq!(shared.backoff.lock().unwrap().current(), 61);
        shared.on_handshake_complete(3);
        assert_eq!(shared.backoff.lock().unwrap().current(), 1);
    }

    #[test]
    fn test_summon_forwarded_for_active_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = SupervisorShared {
            summons: Some(tx),
            ..shared()
        };
        shared.on_summon_request(1, "wss://stale.example".into());
        shared.on_summon_request(3, "wss://relay-2.example".into());
        assert_eq!(rx.try_recv().unwrap(), "wss://relay-2.example");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_supervisor_handshakes_and_retires() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let syn = loop {
                if let Some(Ok(Message::Binary(frame))) = ws.next().await {
                    break decode(frame).unwrap();
                }
            };
            let ack = Envelope::HandshakeAck(HandshakeAck {
                accepted: true,
                error_reason: None,
                backoff_seconds_hint: None,
                requires_update: false,
            });
            ws.send(Message::Binary(encode(&ack).unwrap())).await.unwrap();
            // Let the agent process the ack before hanging up.
            tokio::time::sleep(Duration::from_millis(100)).await;
            ws.close(None).await.unwrap();
            syn
        });

        let mut config = Config::default();
        config.agent.identity = "printer-9".into();
        config.relay.primary_run_for_secs = 0;
        config.relay.min_quiet_secs = 0;
        let local = LocalConfig {
            lan_ip: Some("192.0.2.1".into()),
            ..LocalConfig::default()
        };
        let ctx = StreamContext::with_fetcher(&local, Arc::new(FakeFetcher::default())).unwrap();
        let stats = Arc::new(TunnelStats::new());
        let supervisor = ConnectionSupervisor::new(
            format!("ws://{addr}"),
            true,
            &config,
            Arc::new(ctx),
            Arc::clone(&stats),
            None,
        );

        tokio::time::timeout(Duration::from_secs(10), supervisor.run_blocking())
            .await
            .unwrap();

        let Envelope::HandshakeSyn(syn) = relay.await.unwrap() else {
            panic!("expected a handshake syn");
        };
        assert_eq!(syn.identity, "printer-9");
        assert!(syn.is_primary);
        assert_eq!(syn.lan_ip.as_deref(), Some("192.0.2.1"));

        assert_eq!(
            stats.events.kinds(),
            vec![
                TunnelEventType::Connected,
                TunnelEventType::HandshakeComplete,
                TunnelEventType::Disconnected,
                TunnelEventType::RunForExpired,
            ]
        );
        assert!(!stats.connected.load(Ordering::Relaxed));
    }
}
