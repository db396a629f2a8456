//! Top-level owner of every relay connection.
//!
//! The agent runs one primary supervisor for its whole life, recreating it
//! whenever the RunFor policy retires it, and starts short-lived secondary
//! supervisors when a relay summons the agent to another relay instance.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::info;

use super::connection::ConnectionSupervisor;
use super::stream::StreamContext;
use crate::config::Config;
use crate::error::TunnelError;
use crate::state::{TunnelEventType, TunnelStats};

pub struct Agent {
    config: Arc<Config>,
    ctx: Arc<StreamContext>,
    stats: Arc<TunnelStats>,
    /// URLs with a live secondary supervisor.
    secondaries: Arc<Mutex<HashSet<String>>>,
    summon_tx: mpsc::UnboundedSender<String>,
    summon_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl Agent {
    pub fn new(config: Config) -> Result<Self, TunnelError> {
        let ctx = StreamContext::new(&config.local)?;
        Ok(Self::with_context(config, Arc::new(ctx)))
    }

    pub fn with_context(config: Config, ctx: Arc<StreamContext>) -> Self {
        let (summon_tx, summon_rx) = mpsc::unbounded_channel();
        Self {
            config: Arc::new(config),
            ctx,
            stats: Arc::new(TunnelStats::new()),
            secondaries: Arc::new(Mutex::new(HashSet::new())),
            summon_tx,
            summon_rx: tokio::sync::Mutex::new(summon_rx),
        }
    }

    pub fn stats(&self) -> Arc<TunnelStats> {
        Arc::clone(&self.stats)
    }

    /// Run until the surrounding task is cancelled.
    pub async fn run(&self) {
        tokio::join!(self.run_primary(), self.serve_summons());
    }

    async fn run_primary(&self) {
        loop {
            let supervisor = ConnectionSupervisor::new(
                self.config.relay.url.clone(),
                true,
                &self.config,
                Arc::clone(&self.ctx),
                Arc::clone(&self.stats),
                Some(self.summon_tx.clone()),
            );
            supervisor.run_blocking().await;
            info!("Tunnel: recreating primary connection");
        }
    }

    async fn serve_summons(&self) {
        let mut summons = self.summon_rx.lock().await;
        while let Some(url) = summons.recv().await {
            self.start_secondary(url);
        }
    }

    /// Start a secondary supervisor for `url` unless one is already running.
    pub fn start_secondary(&self, url: String) -> bool {
        {
            let Ok(mut secondaries) = self.secondaries.lock() else {
                return false;
            };
            if !secondaries.insert(url.clone()) {
                info!("Tunnel: already connected to summoned relay {url}");
                return false;
            }
        }

        info!("Tunnel: summoned to {url}, starting secondary connection");
        self.stats
            .record(TunnelEventType::SummonStarted, url.clone());
        let supervisor = ConnectionSupervisor::new(
            url,
            false,
            &self.config,
            Arc::clone(&self.ctx),
            Arc::clone(&self.stats),
            Some(self.summon_tx.clone()),
        );
        let secondaries = Arc::clone(&self.secondaries);
        tokio::spawn(async move {
            supervisor.run_blocking().await;
            info!("Tunnel: secondary connection to {} retired", supervisor.url());
            if let Ok(mut secondaries) = secondaries.lock() {
                secondaries.remove(supervisor.url());
            }
        });
        true
    }

    pub fn secondary_count(&self) -> usize {
        self.secondaries.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::LocalConfig;
    use crate::tunnel::resolver::tests::FakeFetcher;

    fn agent() -> Agent {
        let mut config = Config::default();
        config.relay.secondary_run_for_secs = 0;
        config.relay.min_quiet_secs = 0;
        let local = LocalConfig {
            lan_ip: Some("192.0.2.1".into()),
            ..LocalConfig::default()
        };
        let ctx = StreamContext::with_fetcher(&local, Arc::new(FakeFetcher::default())).unwrap();
        Agent::with_context(config, Arc::new(ctx))
    }

    #[tokio::test]
    async fn test_summon_dedup_and_retire() {
        let agent = agent();
        // Nothing listens on port 1; the secondary fails and retires.
        let url = "ws://127.0.0.1:1/agent".to_string();
        assert!(agent.start_secondary(url.clone()));
        assert!(!agent.start_secondary(url.clone()));
        assert_eq!(agent.secondary_count(), 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while agent.secondary_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(agent.start_secondary(url));
        assert!(agent
            .stats
            .events
            .kinds()
            .contains(&TunnelEventType::RunForExpired));
    }
}
