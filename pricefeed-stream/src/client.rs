//! Stream client: connection manager and subscription reconciler
//!
//! One actor task owns the transport, the reconnect policy and the
//! subscription sets. Every mutation happens inside that task while it
//! handles one event (a command, an open result, a transport event or a
//! retry timer) to completion. [`StreamClient`] is the cheap, cloneable
//! handle callers use to send commands and read the published state.
//!
//! Attempts and retry timers carry a token. Disconnecting clears the
//! current tokens, so late events of a superseded attempt are dropped.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pricefeed_core::{
    decode_frame, ClientMessage, ConnectionState, FeedError, FeedResult, ServerFrame,
};

use crate::config::StreamConfig;
use crate::handlers::{HandlerId, HandlerRegistry, PriceHandler};
use crate::reconciler::{ReconcileOutcome, SubscriptionSet};
use crate::transport::{
    Connector, OutboundFrame, TransportChannels, TransportEvent, ABNORMAL_CLOSURE,
    NORMAL_CLOSURE,
};

/// Capacity of the lifecycle broadcast channel
const LIFECYCLE_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Public types
// ============================================================================

/// Connection lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    StateChanged(ConnectionState),
    /// Reconnect `attempt` (1-based) will start after `delay`
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Terminal; only a new `connect` resumes streaming
    RetriesExhausted { attempts: u32 },
}

/// Handle to the stream connection actor
#[derive(Clone)]
pub struct StreamClient {
    commands: mpsc::UnboundedSender<Command>,
    handlers: HandlerRegistry,
    state_rx: watch::Receiver<ConnectionState>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    subscriptions: Arc<RwLock<SubscriptionSet>>,
}

impl StreamClient {
    /// Spawn the connection actor on the current tokio runtime
    pub fn spawn(config: StreamConfig, connector: Arc<dyn Connector>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        let handlers = HandlerRegistry::new();
        let subscriptions = Arc::new(RwLock::new(SubscriptionSet::default()));

        let actor = ConnectionActor {
            config,
            connector,
            handlers: handlers.clone(),
            internal_tx,
            state_tx,
            lifecycle_tx: lifecycle_tx.clone(),
            published: Arc::clone(&subscriptions),
            state: ConnectionState::Disconnected,
            identity: None,
            attempts: 0,
            next_token: 0,
            in_flight: None,
            waiters: Vec::new(),
            live: None,
            retry: None,
            subs: SubscriptionSet::default(),
        };
        tokio::spawn(actor.run(command_rx, internal_rx));

        Self {
            commands: command_tx,
            handlers,
            state_rx,
            lifecycle_tx,
            subscriptions,
        }
    }

    /// Open the stream for `identity`.
    ///
    /// Joins an attempt already in flight and resolves at once when
    /// connected. The command is queued when this is called, not when the
    /// future is first polled.
    pub fn connect(
        &self,
        identity: impl Into<String>,
    ) -> impl Future<Output = FeedResult<()>> + Send + 'static {
        let (reply, reply_rx) = oneshot::channel();
        let sent = self
            .commands
            .send(Command::Connect {
                identity: identity.into(),
                reply,
            })
            .is_ok();

        async move {
            if !sent {
                return Err(actor_stopped());
            }
            reply_rx.await.unwrap_or(Err(FeedError::Cancelled))
        }
    }

    /// Tear the connection down; idempotent from any state
    pub fn disconnect(&self) -> impl Future<Output = ()> + Send + 'static {
        let (reply, reply_rx) = oneshot::channel();
        let sent = self.commands.send(Command::Disconnect { reply }).is_ok();

        async move {
            if sent {
                let _ = reply_rx.await;
            }
        }
    }

    /// Bring the server-side subscriptions in line with `desired`
    pub fn reconcile<I, S>(
        &self,
        desired: I,
    ) -> impl Future<Output = FeedResult<ReconcileOutcome>> + Send + 'static
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (reply, reply_rx) = oneshot::channel();
        let desired: BTreeSet<String> = desired.into_iter().map(Into::into).collect();
        let sent = self
            .commands
            .send(Command::Reconcile { desired, reply })
            .is_ok();

        async move {
            if !sent {
                return Err(actor_stopped());
            }
            reply_rx.await.map_err(|_| actor_stopped())
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle_tx.subscribe()
    }

    /// Tickers confirmed sent to the server
    pub fn subscribed_tickers(&self) -> BTreeSet<String> {
        self.subscriptions.read().active.clone()
    }

    /// Tickers waiting for the connection to open
    pub fn pending_tickers(&self) -> BTreeSet<String> {
        self.subscriptions.read().pending.clone()
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn add_global_handler(&self, handler: Arc<dyn PriceHandler>) -> HandlerId {
        self.handlers.add_global(handler)
    }

    pub fn remove_global_handler(&self, id: HandlerId) {
        self.handlers.remove_global(id);
    }

    pub fn clear_global_handlers(&self) {
        self.handlers.clear_global();
    }

    pub fn add_ticker_handler(
        &self,
        ticker: impl Into<String>,
        handler: Arc<dyn PriceHandler>,
    ) -> HandlerId {
        self.handlers.add_ticker(ticker, handler)
    }

    pub fn remove_ticker_handler(&self, ticker: &str, id: HandlerId) {
        self.handlers.remove_ticker(ticker, id);
    }

    pub fn clear_ticker_handlers(&self, ticker: &str) {
        self.handlers.clear_ticker(ticker);
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("state", &self.state())
            .field("subscriptions", &*self.subscriptions.read())
            .finish()
    }
}

fn actor_stopped() -> FeedError {
    FeedError::connection("stream actor stopped")
}

// ============================================================================
// Connection actor
// ============================================================================

/// Commands sent by [`StreamClient`]
enum Command {
    Connect {
        identity: String,
        reply: oneshot::Sender<FeedResult<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Reconcile {
        desired: BTreeSet<String>,
        reply: oneshot::Sender<ReconcileOutcome>,
    },
}

/// Events produced by tasks the actor spawned
enum Internal {
    Opened {
        token: u64,
        result: FeedResult<TransportChannels>,
    },
    Transport {
        token: u64,
        event: TransportEvent,
    },
    /// Inbound channel closed without a `Closed` event
    TransportEnded { token: u64 },
    RetryDue { token: u64 },
}

/// The open transport
struct Live {
    token: u64,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    forwarder: JoinHandle<()>,
}

struct ScheduledRetry {
    token: u64,
    timer: JoinHandle<()>,
}

struct ConnectionActor {
    config: StreamConfig,
    connector: Arc<dyn Connector>,
    handlers: HandlerRegistry,
    internal_tx: mpsc::UnboundedSender<Internal>,
    state_tx: watch::Sender<ConnectionState>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    /// Read model of `subs` for handles
    published: Arc<RwLock<SubscriptionSet>>,

    state: ConnectionState,
    identity: Option<String>,
    /// Failed reconnects since the last successful open
    attempts: u32,
    next_token: u64,
    /// Token of the open in flight
    in_flight: Option<u64>,
    waiters: Vec<oneshot::Sender<FeedResult<()>>>,
    live: Option<Live>,
    retry: Option<ScheduledRetry>,
    subs: SubscriptionSet,
}

impl ConnectionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            debug!("[Stream] All handles dropped, shutting down");
                            self.disconnect();
                            return;
                        }
                    }
                }
                Some(event) = internal.recv() => self.handle_internal(event),
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { identity, reply } => self.connect(identity, reply),
            Command::Disconnect { reply } => {
                self.disconnect();
                let _ = reply.send(());
            }
            Command::Reconcile { desired, reply } => {
                let outcome = self.reconcile(desired);
                let _ = reply.send(outcome);
            }
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Opened { token, result } => self.on_opened(token, result),
            Internal::Transport { token, event } => {
                if !self.is_live(token) {
                    debug!("[Stream] Ignoring event from superseded transport");
                    return;
                }
                match event {
                    TransportEvent::Frame(text) => self.dispatch(&text),
                    TransportEvent::Error(e) => warn!("[Stream] Transport error: {}", e),
                    TransportEvent::Closed { code } => {
                        self.drop_live();
                        self.on_connection_lost(code, None);
                    }
                }
            }
            Internal::TransportEnded { token } => {
                if self.is_live(token) {
                    self.drop_live();
                    self.on_connection_lost(ABNORMAL_CLOSURE, None);
                }
            }
            Internal::RetryDue { token } => {
                if self.retry.as_ref().map(|r| r.token) != Some(token) {
                    debug!("[Stream] Ignoring cancelled retry timer");
                    return;
                }
                self.retry = None;
                info!(
                    "[Stream] Attempting to reconnect ({}/{})",
                    self.attempts, self.config.max_reconnect_attempts
                );
                self.start_attempt();
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    fn connect(&mut self, identity: String, reply: oneshot::Sender<FeedResult<()>>) {
        match self.state {
            ConnectionState::Connected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Connecting => {
                if self.identity.as_deref() != Some(identity.as_str()) {
                    warn!("[Stream] Connect for a different identity joined the attempt in flight");
                }
                self.waiters.push(reply);
            }
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                // An explicit connect does not wait out the backoff
                self.cancel_retry();
                self.identity = Some(identity);
                self.waiters.push(reply);
                self.start_attempt();
            }
        }
    }

    fn start_attempt(&mut self) {
        let Some(identity) = self.identity.as_deref() else {
            warn!("[Stream] No identity to connect with");
            self.set_state(ConnectionState::Disconnected);
            return;
        };

        let url = match self.config.url_for(identity) {
            Ok(url) => url,
            Err(e) => {
                error!("[Stream] {}", e);
                self.resolve_waiters(Err(e));
                self.set_state(ConnectionState::Disconnected);
                return;
            }
        };

        let token = self.next_token();
        self.in_flight = Some(token);
        self.set_state(ConnectionState::Connecting);

        let connector = Arc::clone(&self.connector);
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = connector.open(&url).await;
            let _ = internal_tx.send(Internal::Opened { token, result });
        });
    }

    fn on_opened(&mut self, token: u64, result: FeedResult<TransportChannels>) {
        if self.in_flight != Some(token) {
            debug!("[Stream] Ignoring open result of superseded attempt");
            if let Ok(channels) = result {
                let _ = channels.outbound.send(OutboundFrame::Close {
                    code: NORMAL_CLOSURE,
                    reason: "Superseded".to_string(),
                });
            }
            return;
        }
        self.in_flight = None;

        match result {
            Ok(channels) => {
                info!("[Stream] Connection established");
                self.attempts = 0;

                let forwarder = tokio::spawn(forward(
                    token,
                    channels.inbound,
                    self.internal_tx.clone(),
                ));
                self.live = Some(Live {
                    token,
                    outbound: channels.outbound,
                    forwarder,
                });
                self.set_state(ConnectionState::Connected);
                self.flush_pending();
                self.resolve_waiters(Ok(()));
            }
            Err(e) => {
                warn!("[Stream] Connection failed: {}", e);
                self.on_connection_lost(ABNORMAL_CLOSURE, Some(e));
            }
        }
    }

    /// Waiting `connect` callers get `cause`, or `RetriesExhausted` when
    /// this loss ends the retry budget
    fn on_connection_lost(&mut self, code: u16, cause: Option<FeedError>) {
        // Subscriptions do not survive the transport
        self.subs.clear();
        self.publish();

        let exhausted =
            code != NORMAL_CLOSURE && self.attempts >= self.config.max_reconnect_attempts;
        let error = if exhausted {
            FeedError::RetriesExhausted {
                attempts: self.attempts,
            }
        } else {
            cause.unwrap_or_else(|| {
                FeedError::connection(format!("connection closed with code {}", code))
            })
        };
        self.resolve_waiters(Err(error));

        if code == NORMAL_CLOSURE {
            info!("[Stream] Connection closed normally");
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        if !exhausted {
            let delay = self.config.backoff(self.attempts);
            self.attempts += 1;
            info!(
                "[Stream] Reconnecting in {:?} (attempt {})",
                delay, self.attempts
            );
            self.schedule_retry(delay);
            self.set_state(ConnectionState::Reconnecting);
            let _ = self.lifecycle_tx.send(LifecycleEvent::ReconnectScheduled {
                attempt: self.attempts,
                delay,
            });
        } else {
            let attempts = self.attempts;
            error!("[Stream] Max reconnect attempts reached ({})", attempts);
            self.attempts = 0;
            self.identity = None;
            self.set_state(ConnectionState::Disconnected);
            let _ = self
                .lifecycle_tx
                .send(LifecycleEvent::RetriesExhausted { attempts });
        }
    }

    fn disconnect(&mut self) {
        self.cancel_retry();
        self.in_flight = None;
        self.resolve_waiters(Err(FeedError::Cancelled));

        if let Some(live) = self.live.take() {
            info!("[Stream] Disconnecting");
            let _ = live.outbound.send(OutboundFrame::Close {
                code: NORMAL_CLOSURE,
                reason: "Disconnecting".to_string(),
            });
            live.forwarder.abort();
        }

        self.subs.clear();
        self.publish();
        self.attempts = 0;
        self.identity = None;
        self.set_state(ConnectionState::Disconnected);
    }

    fn schedule_retry(&mut self, delay: Duration) {
        self.cancel_retry();
        let token = self.next_token();
        let internal_tx = self.internal_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal_tx.send(Internal::RetryDue { token });
        });
        self.retry = Some(ScheduledRetry { token, timer });
    }

    fn cancel_retry(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.timer.abort();
        }
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    fn reconcile(&mut self, desired: BTreeSet<String>) -> ReconcileOutcome {
        let delta = self.subs.plan(&desired);
        let mut outcome = ReconcileOutcome::default();

        if self.live.is_none() {
            // Stale queued tickers are pruned by the reconcile after the flush
            outcome.queued = self.subs.queue(delta.to_add);
            if !outcome.queued.is_empty() {
                debug!(
                    "[Stream] Not connected, queued subscriptions: {:?}",
                    outcome.queued
                );
            }
            self.publish();
            return outcome;
        }

        if !delta.to_add.is_empty() {
            match self.send(&ClientMessage::subscribe(delta.to_add.iter().cloned())) {
                Ok(()) => {
                    info!("[Stream] Subscribed to {:?}", delta.to_add);
                    self.subs.mark_subscribed(&delta.to_add);
                    outcome.subscribed = delta.to_add;
                }
                Err(e) => {
                    warn!("[Stream] {}; queueing {:?}", e, delta.to_add);
                    outcome.queued = delta.to_add.clone();
                    self.subs.requeue(delta.to_add);
                }
            }
        }

        if !delta.to_remove.is_empty() {
            match self.send(&ClientMessage::unsubscribe(delta.to_remove.iter().cloned())) {
                Ok(()) => {
                    info!("[Stream] Unsubscribed from {:?}", delta.to_remove);
                    self.subs.mark_unsubscribed(&delta.to_remove);
                    outcome.unsubscribed = delta.to_remove;
                }
                Err(e) => warn!("[Stream] {}; keeping {:?}", e, delta.to_remove),
            }
        }

        self.publish();
        outcome
    }

    /// Send the whole pending queue as one subscribe frame
    fn flush_pending(&mut self) {
        let tickers = self.subs.take_pending();
        if tickers.is_empty() {
            self.publish();
            return;
        }

        match self.send(&ClientMessage::subscribe(tickers.iter().cloned())) {
            Ok(()) => {
                info!("[Stream] Flushed pending subscriptions {:?}", tickers);
                self.subs.mark_subscribed(&tickers);
            }
            Err(e) => {
                warn!("[Stream] Failed to flush pending subscriptions: {}", e);
                self.subs.requeue(tickers);
            }
        }
        self.publish();
    }

    fn send(&self, message: &ClientMessage) -> FeedResult<()> {
        let live = self
            .live
            .as_ref()
            .ok_or_else(|| FeedError::subscription("not connected"))?;
        let json = message.to_json()?;
        live.outbound
            .send(OutboundFrame::Text(json))
            .map_err(|_| FeedError::connection("transport closed"))
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    fn dispatch(&self, text: &str) {
        match decode_frame(text) {
            Ok(ServerFrame::Price(update)) => {
                let failures = self.handlers.dispatch(&update);
                if failures > 0 {
                    debug!(
                        "[Stream] {} handler(s) failed for {}",
                        failures, update.ticker
                    );
                }
            }
            Ok(ServerFrame::Control { kind, message }) => {
                if kind == "error" {
                    warn!("[Stream] Server error: {:?}", message);
                } else {
                    debug!("[Stream] Control frame {} {:?}", kind, message);
                }
            }
            Err(e) => warn!("[Stream] Dropping frame: {} ({})", e, text),
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn is_live(&self, token: u64) -> bool {
        self.live.as_ref().map(|l| l.token) == Some(token)
    }

    fn drop_live(&mut self) {
        if let Some(live) = self.live.take() {
            live.forwarder.abort();
        }
    }

    fn resolve_waiters(&mut self, result: FeedResult<()>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!("[Stream] {:?} -> {:?}", self.state, state);
        self.state = state;
        self.state_tx.send_replace(state);
        let _ = self.lifecycle_tx.send(LifecycleEvent::StateChanged(state));
    }

    fn publish(&self) {
        *self.published.write() = self.subs.clone();
    }
}

/// Tag transport events with their attempt token and feed them to the actor
async fn forward(
    token: u64,
    mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
) {
    while let Some(event) = inbound.recv().await {
        let closed = matches!(event, TransportEvent::Closed { .. });
        if internal_tx.send(Internal::Transport { token, event }).is_err() || closed {
            return;
        }
    }
    let _ = internal_tx.send(Internal::TransportEnded { token });
}
