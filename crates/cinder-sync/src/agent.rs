//! # Sync Agent
//!
//! Background driver for an [`Engine`]: runs a cycle every interval or on
//! demand, and retries retryable failures with exponential backoff.
//!
//! ## Agent Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncAgent Loop                                 │
//! │                                                                         │
//! │   interval tick ──┐                                                    │
//! │   trigger() ──────┼──► engine.sync() ──► Ok ──► Idle, backoff reset    │
//! │                   │          │                                          │
//! │   shutdown() ─────┘ (exit)   ├── retryable ──► Backoff ──► sleep ──┐    │
//! │                              │    (ConnectionFailed, 5xx, ...)     │    │
//! │                              │                                     │    │
//! │                              │    ◄──────────── retry ─────────────┘    │
//! │                              │    until max_retries (0 = forever)       │
//! │                              │                                          │
//! │                              └── other ──► Idle, last_error set        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::engine::Engine;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Sync Status
// =============================================================================

/// What the agent is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Sync is turned off in the config.
    Disabled,
    Idle,
    Syncing,
    /// Waiting before retrying a failed cycle.
    Backoff,
    Stopped,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Disabled => write!(f, "disabled"),
            AgentState::Idle => write!(f, "idle"),
            AgentState::Syncing => write!(f, "syncing"),
            AgentState::Backoff => write!(f, "backoff"),
            AgentState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Current sync status for external queries.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub state: AgentState,

    /// Last successful cycle.
    pub last_sync: Option<DateTime<Utc>>,

    /// Last error message (if any).
    pub last_error: Option<String>,

    /// The last error needs the user (key store corruption).
    pub last_error_fatal: bool,

    /// Items with unsent local changes after the last cycle.
    pub dirty_count: usize,

    /// Failed cycles since the last success.
    pub consecutive_failures: u32,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            state: AgentState::Stopped,
            last_sync: None,
            last_error: None,
            last_error_fatal: false,
            dirty_count: 0,
            consecutive_failures: 0,
        }
    }
}

// =============================================================================
// Sync Agent
// =============================================================================

pub struct SyncAgent {
    engine: Arc<Engine>,
    status: Arc<RwLock<SyncStatus>>,
    trigger_tx: Option<mpsc::Sender<()>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SyncAgent {
    pub fn new(engine: Arc<Engine>) -> Self {
        SyncAgent {
            engine,
            status: Arc::new(RwLock::new(SyncStatus::default())),
            trigger_tx: None,
            shutdown_tx: None,
            task: None,
        }
    }

    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    /// Spawns the background loop. Does nothing when sync is disabled.
    pub async fn start(&mut self) -> SyncResult<()> {
        if self.task.is_some() {
            debug!("Sync agent already running");
            return Ok(());
        }

        let config = self.engine.config().clone();
        if !config.sync.enabled {
            info!("Sync is disabled, agent not started");
            self.status.write().await.state = AgentState::Disabled;
            return Ok(());
        }
        config.validate()?;

        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        self.trigger_tx = Some(trigger_tx);
        self.shutdown_tx = Some(shutdown_tx);
        self.status.write().await.state = AgentState::Idle;

        info!(
            user_uuid = %config.user_uuid(),
            interval_secs = config.sync.interval_secs,
            "Starting sync agent"
        );

        let worker = Worker {
            engine: self.engine.clone(),
            status: self.status.clone(),
            config,
            trigger_rx,
            shutdown_rx,
        };
        self.task = Some(tokio::spawn(worker.run()));
        Ok(())
    }

    /// Asks for a cycle now. Coalesces with a trigger already waiting.
    pub fn trigger(&self) {
        if let Some(tx) = &self.trigger_tx {
            if tx.try_send(()).is_err() {
                debug!("Sync already requested");
            }
        }
    }

    /// Stops the loop and the engine. A cycle in flight is aborted before
    /// it commits, so this returns without waiting for the server.
    pub async fn shutdown(&mut self) -> SyncResult<()> {
        info!("Shutting down sync agent");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        self.trigger_tx = None;

        // cancels the cycle the worker may be blocked on
        let stopped = self.engine.shutdown().await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Sync agent task ended abnormally");
            }
        }

        stopped?;
        self.status.write().await.state = AgentState::Stopped;
        info!("Sync agent stopped");
        Ok(())
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    engine: Arc<Engine>,
    status: Arc<RwLock<SyncStatus>>,
    config: SyncConfig,
    trigger_rx: mpsc::Receiver<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Worker {
    async fn run(mut self) {
        let period = Duration::from_secs(self.config.sync.interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut backoff = self.create_backoff();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                Some(()) = self.trigger_rx.recv() => {
                    debug!("Sync triggered");
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Sync agent received shutdown");
                    break;
                }
            }

            if !self.sync_with_retry(&mut backoff).await {
                break;
            }
        }

        self.status.write().await.state = AgentState::Stopped;
    }

    /// Returns false when shutdown arrived while backing off.
    async fn sync_with_retry(&mut self, backoff: &mut ExponentialBackoff) -> bool {
        let mut attempts = 0u32;

        loop {
            self.status.write().await.state = AgentState::Syncing;
            let result = self.engine.sync().await;
            let dirty_count = self.engine.dirty_count().await;

            match result {
                Ok(outcome) => {
                    backoff.reset();
                    let mut status = self.status.write().await;
                    status.state = AgentState::Idle;
                    status.last_sync = outcome.completed_at.or_else(|| Some(Utc::now()));
                    status.dirty_count = dirty_count;
                    status.consecutive_failures = 0;
                    match outcome.fatal_warning() {
                        Some(fatal) => {
                            error!(error = %fatal, "Sync completed with a key store failure");
                            status.last_error = Some(fatal.to_string());
                            status.last_error_fatal = true;
                        }
                        None => {
                            status.last_error = None;
                            status.last_error_fatal = false;
                        }
                    }
                    return true;
                }
                Err(SyncError::Cancelled | SyncError::ShuttingDown) => {
                    info!("Sync cycle abandoned for shutdown");
                    return false;
                }
                Err(e) => {
                    attempts += 1;
                    {
                        let mut status = self.status.write().await;
                        status.last_error = Some(e.to_string());
                        status.last_error_fatal = e.is_fatal();
                        status.dirty_count = dirty_count;
                        status.consecutive_failures += 1;
                        status.state = AgentState::Idle;
                    }

                    if !e.is_retryable() {
                        warn!(error = %e, "Sync failed, waiting for the next interval");
                        return true;
                    }
                    if self.config.sync.max_retries > 0 && attempts >= self.config.sync.max_retries {
                        error!(max_retries = self.config.sync.max_retries, "Max sync retries reached");
                        backoff.reset();
                        return true;
                    }

                    let Some(delay) = backoff.next_backoff() else {
                        error!("Backoff exhausted");
                        return true;
                    };
                    debug!(?delay, attempt = attempts, "Waiting before retrying sync");
                    self.status.write().await.state = AgentState::Backoff;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown_rx.recv() => {
                            info!("Shutdown during backoff");
                            return false;
                        }
                    }
                }
            }
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.sync.initial_backoff_ms),
            max_interval: Duration::from_secs(self.config.sync.max_backoff_secs),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use cinder_core::{IdentityKeyPair, SymmetricKey, INITIAL_KEY_VERSION};
    use cinder_store::MemoryStateStore;
    use uuid::Uuid;

    use crate::engine::EngineBuilder;
    use crate::error::{SyncError, SyncResult};
    use crate::protocol::{OutboundBatch, SyncRequest, SyncResponse};
    use crate::transport::SyncEndpoint;

    /// Fails the first `failures` sync calls with a connection error.
    /// Every call first waits `delay`.
    struct CountingEndpoint {
        calls: AtomicU32,
        failures: u32,
        delay: Duration,
    }

    impl CountingEndpoint {
        fn failing(failures: u32) -> Arc<Self> {
            Arc::new(CountingEndpoint {
                calls: AtomicU32::new(0),
                failures,
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl SyncEndpoint for CountingEndpoint {
        async fn sync(&self, _request: SyncRequest) -> SyncResult<SyncResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if call < self.failures {
                return Err(SyncError::ConnectionFailed("refused".into()));
            }
            Ok(SyncResponse::default())
        }

        async fn post_outbound(&self, _batch: OutboundBatch) -> SyncResult<()> {
            Ok(())
        }
    }

    async fn engine(endpoint: Arc<CountingEndpoint>, config: SyncConfig) -> Arc<Engine> {
        Arc::new(
            EngineBuilder::new(
                config,
                IdentityKeyPair::generate(),
                SymmetricKey::generate(INITIAL_KEY_VERSION),
            )
            .with_endpoint(endpoint)
            .with_state_store(Arc::new(MemoryStateStore::new()))
            .build()
            .await
            .unwrap(),
        )
    }

    fn config() -> SyncConfig {
        let mut config = SyncConfig::for_user(Uuid::new_v4().to_string());
        config.sync.interval_secs = 3600;
        config.sync.initial_backoff_ms = 1;
        config.sync.max_backoff_secs = 1;
        config
    }

    async fn wait_for(agent: &SyncAgent, done: impl Fn(&SyncStatus) -> bool) -> SyncStatus {
        for _ in 0..200 {
            let status = agent.status().await;
            if done(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        agent.status().await
    }

    #[test]
    fn test_sync_status_default() {
        let status = SyncStatus::default();
        assert_eq!(status.state, AgentState::Stopped);
        assert!(status.last_sync.is_none());
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_disabled_agent_does_not_start() {
        let mut config = config();
        config.sync.enabled = false;
        let endpoint = CountingEndpoint::failing(0);
        let mut agent = SyncAgent::new(engine(endpoint.clone(), config).await);

        agent.start().await.unwrap();
        assert_eq!(agent.status().await.state, AgentState::Disabled);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_tick_syncs() {
        let endpoint = CountingEndpoint::failing(0);
        let mut agent = SyncAgent::new(engine(endpoint.clone(), config()).await);
        agent.start().await.unwrap();

        let status = wait_for(&agent, |s| s.last_sync.is_some()).await;
        assert!(status.last_sync.is_some());
        assert!(status.last_error.is_none());

        agent.shutdown().await.unwrap();
        assert_eq!(agent.status().await.state, AgentState::Stopped);
    }

    #[tokio::test]
    async fn test_retryable_failure_backs_off_then_recovers() {
        let endpoint = CountingEndpoint::failing(2);
        let mut agent = SyncAgent::new(engine(endpoint.clone(), config()).await);
        agent.start().await.unwrap();

        let status = wait_for(&agent, |s| s.last_sync.is_some()).await;
        assert!(status.last_sync.is_some());
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 3);

        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_max_retries_stops_retrying() {
        let mut config = config();
        config.sync.max_retries = 2;
        let endpoint = CountingEndpoint::failing(u32::MAX);
        let mut agent = SyncAgent::new(engine(endpoint.clone(), config).await);
        agent.start().await.unwrap();

        let status = wait_for(&agent, |s| s.consecutive_failures >= 2 && s.state == AgentState::Idle).await;
        assert_eq!(status.consecutive_failures, 2);
        assert!(status.last_error.is_some());
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 2);

        agent.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_aborts_cycle_in_flight() {
        let endpoint = Arc::new(CountingEndpoint {
            calls: AtomicU32::new(0),
            failures: 0,
            delay: Duration::from_secs(30),
        });
        let engine = engine(endpoint.clone(), config()).await;
        let mut agent = SyncAgent::new(engine.clone());
        agent.start().await.unwrap();

        let status = wait_for(&agent, |_| endpoint.calls.load(Ordering::SeqCst) == 1).await;
        assert_eq!(status.state, AgentState::Syncing);

        tokio::time::timeout(Duration::from_secs(5), agent.shutdown())
            .await
            .expect("shutdown waited for the server")
            .unwrap();

        let status = agent.status().await;
        assert_eq!(status.state, AgentState::Stopped);
        assert!(status.last_sync.is_none());
        assert!(!engine.is_syncing());
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }
}
