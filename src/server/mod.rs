//! The Courier server.
//!
//! Owns every piece of shared state (configuration, store, transport,
//! registry, dispatcher, stats, session table) and passes it down
//! explicitly; init happens at startup, teardown at shutdown.

mod builtins;
mod dispatch;
mod lifecycle;
mod stats;

#[cfg(test)]
pub(crate) mod testutil;

pub use dispatch::Dispatcher;
pub use lifecycle::{SessionLifecycle, SessionTable, RECONNECT_CAP, RECONNECT_STEP};
pub use stats::{ServerEvent, StatsReporter};

use courier_core::config::Config;
use courier_core::error::CourierError;
use courier_core::traits::Transport;
use courier_plugins::Registry;
use courier_store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Durable snapshot and TTL purge cadence.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

/// Shared handles passed to every component.
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<Config>,
    pub store: Store,
    pub transport: Arc<dyn Transport>,
    pub registry: Arc<Registry>,
    pub stats: Arc<StatsReporter>,
    pub sessions: Arc<SessionTable>,
    pub dispatcher: Arc<Dispatcher>,
}

impl ServerContext {
    fn new(
        config: Arc<Config>,
        store: Store,
        transport: Arc<dyn Transport>,
        registry: Arc<Registry>,
    ) -> Self {
        let stats = Arc::new(StatsReporter::new(store.clone()));
        let dispatcher = Arc::new(Dispatcher::new(config.clone(), store.clone(), registry.clone()));
        Self {
            config,
            store,
            transport,
            registry,
            stats,
            sessions: Arc::new(SessionTable::default()),
            dispatcher,
        }
    }

    #[cfg(test)]
    pub(crate) async fn for_tests(transport: Arc<dyn Transport>) -> Self {
        use courier_core::config::StoreConfig;
        let store = Store::new(&StoreConfig {
            db_path: ":memory:".to_string(),
        })
        .await
        .unwrap();
        Self::new(
            Arc::new(Config::default()),
            store,
            transport,
            Arc::new(Registry::new(courier_plugins::builtin_set())),
        )
    }
}

/// Result of a pairing request.
pub struct PairOutcome {
    /// No session row existed for the number before this request.
    pub new_user: bool,
    /// An already-live connection was reused instead of creating one.
    pub reused: bool,
    /// Code the user enters on their device; absent when the session
    /// resumed from stored credentials.
    pub pairing_code: Option<String>,
}

pub struct Server {
    ctx: ServerContext,
    /// Serializes pairing so two requests for one number cannot race
    /// past the live-handle check.
    pairing: Mutex<()>,
}

impl Server {
    pub fn new(
        config: Config,
        store: Store,
        transport: Arc<dyn Transport>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            ctx: ServerContext::new(Arc::new(config), store, transport, registry),
            pairing: Mutex::new(()),
        }
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    /// Pair `number`, or reuse its live session.
    ///
    /// A number with a live in-memory handle never gets a second
    /// connection; the stored pairing code (if still valid) is
    /// returned as-is.
    pub async fn pair(&self, number: &str) -> Result<PairOutcome, CourierError> {
        let _guard = self.pairing.lock().await;

        if self.ctx.sessions.contains(number) {
            let pairing_code = match self.ctx.store.pairing_code(number).await {
                Ok(code) => code,
                Err(e) => {
                    warn!("pairing code lookup failed for {number}: {e}");
                    None
                }
            };
            return Ok(PairOutcome {
                new_user: false,
                reused: true,
                pairing_code,
            });
        }

        let new_user = !self.ctx.store.session_exists(number).await?;
        let pairing_code = SessionLifecycle::launch(self.ctx.clone(), number).await?;

        Ok(PairOutcome {
            new_user,
            reused: false,
            pairing_code,
        })
    }

    /// Re-establish every session marked active in the store. Each
    /// number connects independently; HTTP readiness is not gated on
    /// this.
    async fn recover_sessions(self: &Arc<Self>) {
        let numbers = match self.ctx.store.active_session_numbers().await {
            Ok(numbers) => numbers,
            Err(e) => {
                warn!("restart recovery query failed: {e}");
                return;
            }
        };
        if numbers.is_empty() {
            return;
        }
        info!("restart recovery: {} active sessions", numbers.len());

        for number in numbers {
            let server = self.clone();
            tokio::spawn(async move {
                let _guard = server.pairing.lock().await;
                if server.ctx.sessions.contains(&number) {
                    return;
                }
                match server.ctx.store.load_credentials(&number).await {
                    Ok(Some(_)) => {
                        if let Err(e) =
                            SessionLifecycle::launch(server.ctx.clone(), &number).await
                        {
                            warn!("restart recovery failed for {number}: {e}");
                        }
                    }
                    Ok(None) => {
                        // Flagged active but never saved credentials;
                        // nothing to resume.
                        if let Err(e) = server.ctx.store.set_session_active(&number, false).await
                        {
                            warn!("session deactivation failed for {number}: {e}");
                        }
                    }
                    Err(e) => warn!("credential load failed for {number}: {e}"),
                }
            });
        }
    }

    /// Run until ctrl-c: recovery, the snapshot/purge tick, SIGHUP
    /// registry reload, and the HTTP API.
    pub async fn run(self: Arc<Self>) -> Result<(), CourierError> {
        info!(
            "courier server starting | store: {} | api: {}:{}",
            self.ctx.config.store.db_path, self.ctx.config.api.host, self.ctx.config.api.port
        );

        {
            let server = self.clone();
            tokio::spawn(async move { server.recover_sessions().await });
        }

        {
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(SNAPSHOT_INTERVAL);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    ctx.stats.snapshot().await;
                    match ctx.store.purge_expired().await {
                        Ok(0) => {}
                        Ok(n) => debug!("purged {n} expired rows"),
                        Err(e) => warn!("ttl purge failed: {e}"),
                    }
                }
            });
        }

        #[cfg(unix)]
        {
            let registry = self.ctx.registry.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                let Ok(mut hangup) = signal(SignalKind::hangup()) else {
                    warn!("SIGHUP handler unavailable, registry reload disabled");
                    return;
                };
                while hangup.recv().await.is_some() {
                    info!("SIGHUP received, reloading command registry");
                    registry.reload(courier_plugins::builtin_set());
                }
            });
        }

        {
            let state = crate::api::ApiState::new(self.clone());
            let api_config = self.ctx.config.api.clone();
            tokio::spawn(async move { crate::api::serve(api_config, state).await });
        }

        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        for (number, link) in self.ctx.sessions.drain() {
            info!("closing session {number}");
            link.close().await;
        }
        self.ctx.stats.snapshot().await;
    }
}
