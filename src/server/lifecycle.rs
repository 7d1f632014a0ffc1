//! Per-session connection lifecycle.
//!
//! One `SessionLifecycle` task owns every transition for its phone
//! number: pairing, open side effects, reconnect with linear backoff,
//! and terminal cleanup. Events are consumed in transport order; a
//! credential update is persisted before the next event is processed.

use courier_core::error::CourierError;
use courier_core::traits::{DisconnectReason, LinkEvent, TransportLink};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::ServerContext;

/// Consecutive reconnect attempts before a session is terminated.
pub const RECONNECT_CAP: u32 = 3;

/// Backoff step; the delay before attempt `k` is `k` times this.
pub const RECONNECT_STEP: Duration = Duration::from_secs(5);

/// Settling period before a pairing code is requested on a fresh link.
const PAIRING_SETTLE: Duration = Duration::from_secs(3);

/// Settling period before the one-time welcome notice is sent.
const WELCOME_SETTLE: Duration = Duration::from_secs(5);

/// Process-local handle of a live connection.
pub struct SessionHandle {
    pub link: Arc<dyn TransportLink>,
    pub generation: u64,
}

/// Connection-handle table, keyed by phone number. Generations let a
/// lifecycle task detect that its entry was replaced or removed while
/// it slept.
#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<HashMap<String, SessionHandle>>,
    next_generation: AtomicU64,
}

impl SessionTable {
    /// Register a new handle, returning its generation.
    pub fn insert(&self, number: &str, link: Arc<dyn TransportLink>) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        self.inner
            .lock()
            .unwrap()
            .insert(number.to_string(), SessionHandle { link, generation });
        generation
    }

    /// Swap in a fresh link for an existing entry. No-op when the
    /// entry was removed or replaced by a newer generation.
    pub fn replace_link(&self, number: &str, generation: u64, link: Arc<dyn TransportLink>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(handle) = inner.get_mut(number) {
            if handle.generation == generation {
                handle.link = link;
            }
        }
    }

    /// Whether the entry for `number` still belongs to `generation`.
    pub fn is_live(&self, number: &str, generation: u64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .get(number)
            .is_some_and(|h| h.generation == generation)
    }

    /// Remove the entry if it still belongs to `generation`.
    pub fn remove_if(&self, number: &str, generation: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(number) {
            Some(handle) if handle.generation == generation => {
                inner.remove(number);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, number: &str) -> bool {
        self.inner.lock().unwrap().contains_key(number)
    }

    pub fn get(&self, number: &str) -> Option<Arc<dyn TransportLink>> {
        self.inner.lock().unwrap().get(number).map(|h| h.link.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Take every handle, leaving the table empty. Used at shutdown.
    pub fn drain(&self) -> Vec<(String, Arc<dyn TransportLink>)> {
        self.inner
            .lock()
            .unwrap()
            .drain()
            .map(|(number, handle)| (number, handle.link))
            .collect()
    }
}

enum TerminalCause {
    Logout,
    CapExhausted,
}

/// The state machine task for one session.
pub struct SessionLifecycle {
    ctx: ServerContext,
    number: String,
    generation: u64,
    self_jid: Option<String>,
    /// Open side effects fire once per logical session, surviving
    /// reconnects.
    announced: bool,
    attempts: u32,
}

impl SessionLifecycle {
    /// Connect `number`, register its handle, and spawn the event
    /// loop. Returns the issued pairing code when the number had no
    /// stored credentials.
    ///
    /// A partially created link is closed before an error propagates
    /// to the caller.
    pub async fn launch(ctx: ServerContext, number: &str) -> Result<Option<String>, CourierError> {
        let stored = ctx.store.load_credentials(number).await?;
        let needs_pairing = stored.is_none();
        let (link, events) = ctx.transport.connect(number, stored).await?;

        let code = if needs_pairing {
            // The transport needs a settling period before it accepts
            // a pairing-code request.
            tokio::time::sleep(PAIRING_SETTLE).await;
            match link.request_pairing_code(number).await {
                Ok(code) => {
                    if let Err(e) = ctx.store.put_pairing_code(number, &code).await {
                        warn!("pairing code persist failed for {number}: {e}");
                    }
                    Some(code)
                }
                Err(e) => {
                    link.close().await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        // The row must exist before the event loop can flip it active.
        ctx.store.ensure_session(number).await?;

        let generation = ctx.sessions.insert(number, link.clone());
        let lifecycle = Self {
            ctx,
            number: number.to_string(),
            generation,
            self_jid: None,
            announced: false,
            attempts: 0,
        };
        tokio::spawn(lifecycle.run(link, events));

        Ok(code)
    }

    async fn run(
        mut self,
        mut link: Arc<dyn TransportLink>,
        mut events: mpsc::Receiver<LinkEvent>,
    ) {
        'session: loop {
            let reason = self
                .consume(&link, &mut events)
                .await
                .unwrap_or(DisconnectReason::ConnectionClosed);

            if !reason.should_reconnect() {
                self.terminate(TerminalCause::Logout).await;
                return;
            }

            // Reconnect ladder. A failed connect consumes an attempt
            // like a failed link does.
            loop {
                if self.attempts >= RECONNECT_CAP {
                    self.terminate(TerminalCause::CapExhausted).await;
                    return;
                }
                self.attempts += 1;
                let delay = RECONNECT_STEP * self.attempts;
                info!(
                    "session {} closed ({reason:?}), reconnect attempt {} in {:?}",
                    self.number, self.attempts, delay
                );
                tokio::time::sleep(delay).await;

                // The session may have been removed while we slept.
                if !self.ctx.sessions.is_live(&self.number, self.generation) {
                    debug!("session {} removed, dropping reconnect", self.number);
                    return;
                }

                let stored = match self.ctx.store.load_credentials(&self.number).await {
                    Ok(stored) => stored,
                    Err(e) => {
                        warn!("credential load failed for {}: {e}", self.number);
                        None
                    }
                };
                match self.ctx.transport.connect(&self.number, stored).await {
                    Ok((new_link, new_events)) => {
                        self.ctx
                            .sessions
                            .replace_link(&self.number, self.generation, new_link.clone());
                        link = new_link;
                        events = new_events;
                        continue 'session;
                    }
                    Err(e) => {
                        warn!("reconnect failed for {}: {e}", self.number);
                    }
                }
            }
        }
    }

    /// Process link events until the link closes. Returns the
    /// disconnect reason, or `None` when the event stream ended
    /// without one.
    async fn consume(
        &mut self,
        link: &Arc<dyn TransportLink>,
        events: &mut mpsc::Receiver<LinkEvent>,
    ) -> Option<DisconnectReason> {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::CredentialsUpdate(credentials) => {
                    // Losing an update forces re-pairing; persist
                    // before touching the next event.
                    if let Err(e) = self
                        .ctx
                        .store
                        .save_credentials(&self.number, &credentials)
                        .await
                    {
                        warn!("credential save failed for {}: {e}", self.number);
                    }
                }
                LinkEvent::Open { self_jid } => self.on_open(link, self_jid).await,
                LinkEvent::Message(raw) => {
                    let self_jid = self.self_jid.clone().unwrap_or_default();
                    self.ctx
                        .dispatcher
                        .dispatch(link.clone(), &self.number, &self_jid, *raw)
                        .await;
                }
                LinkEvent::Closed { reason } => return Some(reason),
            }
        }
        None
    }

    async fn on_open(&mut self, link: &Arc<dyn TransportLink>, self_jid: String) {
        info!("session {} open as {self_jid}", self.number);
        self.attempts = 0;
        self.self_jid = Some(self_jid);

        if let Err(e) = self.ctx.store.set_session_active(&self.number, true).await {
            warn!("session activation failed for {}: {e}", self.number);
        }

        if self.announced {
            return;
        }
        self.announced = true;

        self.ctx.stats.session_linked(&self.number).await;

        // Channel subscriptions are independent; one failure never
        // aborts the rest.
        let settings = self
            .ctx
            .store
            .settings_or_default(&self.number, &self.ctx.dispatcher.defaults)
            .await;
        for channel in &settings.channels {
            if let Err(e) = link.subscribe_channel(channel).await {
                warn!("channel subscription failed for {channel}: {e}");
            }
        }

        let link = link.clone();
        let number = self.number.clone();
        let bot_name = self.ctx.config.bot.name.clone();
        let prefix = settings.prefix.clone();
        tokio::spawn(async move {
            tokio::time::sleep(WELCOME_SETTLE).await;
            let jid = format!("{number}@s.whatsapp.net");
            let text =
                format!("{bot_name} is connected. Send {prefix}menu to see available commands.");
            if let Err(e) = link.send_text(&jid, &text, None).await {
                debug!("welcome notice failed for {number}: {e}");
            }
        });
    }

    async fn terminate(&mut self, cause: TerminalCause) {
        match cause {
            TerminalCause::Logout => {
                info!("session {} logged out, removing stored account", self.number);
                if let Err(e) = self.ctx.store.remove_account(&self.number).await {
                    warn!("account removal failed for {}: {e}", self.number);
                }
            }
            TerminalCause::CapExhausted => {
                info!(
                    "session {} terminated after {} reconnect attempts",
                    self.number, self.attempts
                );
                if let Err(e) = self.ctx.store.set_session_active(&self.number, false).await {
                    warn!("session deactivation failed for {}: {e}", self.number);
                }
            }
        }

        let removed = self.ctx.sessions.remove_if(&self.number, self.generation);
        if removed && self.announced {
            self.ctx.stats.session_unlinked(&self.number).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::stats::ServerEvent;
    use crate::server::testutil::MockTransport;
    use courier_core::message::{MessageKey, RawMessage};
    use courier_core::traits::SessionCredentials;
    use serde_json::json;

    const NUMBER: &str = "15551234567";

    async fn context(transport: Arc<MockTransport>) -> ServerContext {
        ServerContext::for_tests(transport).await
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition not met in time");
    }

    fn stored_credentials() -> SessionCredentials {
        SessionCredentials {
            creds: json!({"registered": true}),
            keys: json!({"preKeys": []}),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_number_gets_a_persisted_pairing_code() {
        let transport = Arc::new(MockTransport::default());
        let ctx = context(transport.clone()).await;

        let code = SessionLifecycle::launch(ctx.clone(), NUMBER).await.unwrap();

        assert_eq!(code.as_deref(), Some("TEST-CODE"));
        assert_eq!(
            ctx.store.pairing_code(NUMBER).await.unwrap().as_deref(),
            Some("TEST-CODE")
        );
        assert!(ctx.sessions.contains(NUMBER));
    }

    #[tokio::test(start_paused = true)]
    async fn stored_credentials_skip_pairing() {
        let transport = Arc::new(MockTransport::default());
        let ctx = context(transport.clone()).await;
        ctx.store
            .save_credentials(NUMBER, &stored_credentials())
            .await
            .unwrap();

        let code = SessionLifecycle::launch(ctx.clone(), NUMBER).await.unwrap();

        assert!(code.is_none());
        assert!(ctx.store.pairing_code(NUMBER).await.unwrap().is_none());
        let connections = transport.connections.lock().unwrap();
        assert!(connections[0].had_credentials);
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_failure_closes_the_partial_handle() {
        let transport = Arc::new(MockTransport::default());
        transport.fail_pairing.store(true, Ordering::SeqCst);
        let ctx = context(transport.clone()).await;

        let result = SessionLifecycle::launch(ctx.clone(), NUMBER).await;

        assert!(result.is_err());
        assert!(!ctx.sessions.contains(NUMBER));
        let (link, _) = transport.connection(0);
        assert!(link.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn open_marks_active_and_announces_once() {
        let transport = Arc::new(MockTransport::default());
        let ctx = context(transport.clone()).await;
        let mut events = ctx.stats.subscribe();

        SessionLifecycle::launch(ctx.clone(), NUMBER).await.unwrap();
        let (_, tx) = transport.connection(0);
        tx.send(LinkEvent::Open {
            self_jid: format!("{NUMBER}@s.whatsapp.net"),
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(ctx.store.session_is_active(NUMBER).await.unwrap());
        assert_eq!(ctx.stats.active_connections(), 1);
        match events.recv().await.unwrap() {
            ServerEvent::Linked { session_id } => assert_eq!(session_id, NUMBER),
            other => panic!("expected linked, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn credential_updates_are_persisted_immediately() {
        let transport = Arc::new(MockTransport::default());
        let ctx = context(transport.clone()).await;

        SessionLifecycle::launch(ctx.clone(), NUMBER).await.unwrap();
        let (_, tx) = transport.connection(0);
        tx.send(LinkEvent::CredentialsUpdate(stored_credentials()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let loaded = ctx.store.load_credentials(NUMBER).await.unwrap();
        assert!(loaded.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn messages_are_dispatched_on_the_session_link() {
        let transport = Arc::new(MockTransport::default());
        let ctx = context(transport.clone()).await;

        SessionLifecycle::launch(ctx.clone(), NUMBER).await.unwrap();
        let (link, tx) = transport.connection(0);
        tx.send(LinkEvent::Open {
            self_jid: format!("{NUMBER}@s.whatsapp.net"),
        })
        .await
        .unwrap();

        let raw = RawMessage {
            key: MessageKey {
                remote_jid: "19998887777@s.whatsapp.net".to_string(),
                from_me: false,
                id: "M1".to_string(),
                participant: None,
            },
            push_name: None,
            timestamp: 0,
            content: Some(json!({"conversation": ".echo hi"})),
        };
        tx.send(LinkEvent::Message(Box::new(raw))).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let sent = link.sent.lock().unwrap();
        assert!(sent
            .iter()
            .any(|(jid, text)| jid == "19998887777@s.whatsapp.net" && text == "hi"));
    }

    #[tokio::test(start_paused = true)]
    async fn welcome_notice_arrives_after_settling_delay() {
        let transport = Arc::new(MockTransport::default());
        let ctx = context(transport.clone()).await;

        SessionLifecycle::launch(ctx.clone(), NUMBER).await.unwrap();
        let (link, tx) = transport.connection(0);
        tx.send(LinkEvent::Open {
            self_jid: format!("{NUMBER}@s.whatsapp.net"),
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        let sent = link.sent.lock().unwrap();
        assert!(sent
            .iter()
            .any(|(jid, text)| jid == &format!("{NUMBER}@s.whatsapp.net")
                && text.contains("connected")));
    }

    #[tokio::test(start_paused = true)]
    async fn channel_subscriptions_are_independent() {
        let transport = Arc::new(MockTransport::default());
        *transport.subscribe_failures.lock().unwrap() = vec!["bad@newsletter".to_string()];
        let ctx = context(transport.clone()).await;

        let mut settings = ctx.dispatcher.defaults.clone();
        settings.channels = vec![
            "bad@newsletter".to_string(),
            "good@newsletter".to_string(),
        ];
        ctx.store.save_settings(NUMBER, &settings).await.unwrap();

        SessionLifecycle::launch(ctx.clone(), NUMBER).await.unwrap();
        let (link, tx) = transport.connection(0);
        tx.send(LinkEvent::Open {
            self_jid: format!("{NUMBER}@s.whatsapp.net"),
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        // The failing channel never aborts the remaining attempts.
        let subscriptions = link.subscriptions.lock().unwrap();
        assert_eq!(subscriptions.as_slice(), ["good@newsletter"]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_back_off_linearly_then_terminate() {
        let transport = Arc::new(MockTransport::default());
        let ctx = context(transport.clone()).await;
        ctx.store
            .save_credentials(NUMBER, &stored_credentials())
            .await
            .unwrap();

        SessionLifecycle::launch(ctx.clone(), NUMBER).await.unwrap();

        for attempt in 0..4 {
            let (_, tx) = transport.connection(attempt);
            tx.send(LinkEvent::Closed {
                reason: DisconnectReason::ConnectionLost,
            })
            .await
            .unwrap();
            if attempt < 3 {
                let want = attempt + 2;
                let transport = transport.clone();
                wait_until(move || transport.connect_count() >= want).await;
            }
        }

        let sessions = ctx.sessions.clone();
        wait_until(move || !sessions.contains(NUMBER)).await;

        // Three reconnects with 5s, 10s, 15s delays, then terminal.
        let instants = transport.connect_instants();
        assert_eq!(instants.len(), 4);
        assert_eq!(instants[1] - instants[0], Duration::from_secs(5));
        assert_eq!(instants[2] - instants[1], Duration::from_secs(10));
        assert_eq!(instants[3] - instants[2], Duration::from_secs(15));

        // Non-logout terminal: the row survives with credentials.
        assert!(ctx.store.session_exists(NUMBER).await.unwrap());
        assert!(!ctx.store.session_is_active(NUMBER).await.unwrap());
        assert!(ctx.store.load_credentials(NUMBER).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn logout_deletes_every_stored_trace() {
        let transport = Arc::new(MockTransport::default());
        let ctx = context(transport.clone()).await;

        SessionLifecycle::launch(ctx.clone(), NUMBER).await.unwrap();
        let (_, tx) = transport.connection(0);
        tx.send(LinkEvent::Open {
            self_jid: format!("{NUMBER}@s.whatsapp.net"),
        })
        .await
        .unwrap();
        tx.send(LinkEvent::Closed {
            reason: DisconnectReason::LoggedOut,
        })
        .await
        .unwrap();

        let sessions = ctx.sessions.clone();
        wait_until(move || !sessions.contains(NUMBER)).await;

        assert!(!ctx.store.session_exists(NUMBER).await.unwrap());
        assert!(ctx.store.pairing_code(NUMBER).await.unwrap().is_none());
        assert!(ctx.store.get_settings(NUMBER).await.unwrap().is_none());
        assert_eq!(ctx.stats.active_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_side_effects_fire_once_across_reconnects() {
        let transport = Arc::new(MockTransport::default());
        let ctx = context(transport.clone()).await;
        let mut events = ctx.stats.subscribe();

        SessionLifecycle::launch(ctx.clone(), NUMBER).await.unwrap();
        let (_, tx) = transport.connection(0);
        tx.send(LinkEvent::Open {
            self_jid: format!("{NUMBER}@s.whatsapp.net"),
        })
        .await
        .unwrap();
        tx.send(LinkEvent::Closed {
            reason: DisconnectReason::ConnectionLost,
        })
        .await
        .unwrap();

        {
            let transport = transport.clone();
            wait_until(move || transport.connect_count() >= 2).await;
        }
        let (_, tx) = transport.connection(1);
        tx.send(LinkEvent::Open {
            self_jid: format!("{NUMBER}@s.whatsapp.net"),
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ctx.stats.active_connections(), 1);

        let mut linked = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ServerEvent::Linked { .. }) {
                linked += 1;
            }
        }
        assert_eq!(linked, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_reconnect_aborts_when_session_was_removed() {
        let transport = Arc::new(MockTransport::default());
        let ctx = context(transport.clone()).await;

        SessionLifecycle::launch(ctx.clone(), NUMBER).await.unwrap();
        let (_, tx) = transport.connection(0);
        tx.send(LinkEvent::Closed {
            reason: DisconnectReason::ConnectionLost,
        })
        .await
        .unwrap();

        // Remove the session while the reconnect timer is pending.
        for (_, link) in ctx.sessions.drain() {
            link.close().await;
        }

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.connect_count(), 1);
    }
}
