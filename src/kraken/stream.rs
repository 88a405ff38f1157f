// =============================================================================
// Kraken Stream Connection — WebSocket v2 actor with bounded reconnect
// =============================================================================
//
// One tokio task owns the socket, the subscription table and every callback.
// `StreamConnection` is a cheap cloneable handle that talks to it through an
// mpsc command channel and observes `ConnectionState` through a watch channel.
// Nothing else touches actor state, so frames are handled strictly in order
// and each handler runs to completion before the next frame is read.
//
// Reconnect policy:
//   - failed connect n (< max)  → sleep min(2^n, 30) s, try again
//   - failed connect n == max   → GaveUp (terminal), reported to error callbacks
//   - established session drops → counter resets, reconnect after a short pause
//
// Subscriptions are NOT replayed after a reconnect. Every entry is marked
// Closed when its session ends; callers re-subscribe if they need to.
//
// Every subscribe/unsubscribe carries a `req_id`. Acks are matched back to
// the request through it; an ack without a known `req_id` must at least name
// its symbol, otherwise it is reported but touches no entry.
// =============================================================================

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{FeedError, FeedResult};
use crate::kraken::messages::{classify, AckMessage, ControlMethod, Inbound, SubscriptionRequest};
use crate::runtime_config::StreamConfig;
use crate::types::{Channel, ConnectionState, SubscriptionStatus};

/// Receives `(channel, message)` for every data frame.
pub type DataCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;
/// Receives stream-level failures (gave up, dropped session, rejected subscription).
pub type ErrorCallback = Arc<dyn Fn(&FeedError) + Send + Sync>;

// -----------------------------------------------------------------------------
// Transport seam
// -----------------------------------------------------------------------------

/// One inbound frame, reduced to what the actor cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Pong,
    Close,
    /// Pings, binary and raw frames: proof of life, nothing more.
    Other,
}

/// An open, bidirectional stream session. `recv` must be cancel-safe.
#[async_trait]
pub trait StreamTransport: Send {
    async fn send_text(&mut self, text: String) -> FeedResult<()>;
    async fn ping(&mut self) -> FeedResult<()>;
    /// `None` once the peer has gone away.
    async fn recv(&mut self) -> Option<FeedResult<Frame>>;
    async fn close(&mut self) -> FeedResult<()>;
}

/// Opens stream sessions.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, url: &str) -> FeedResult<Box<dyn StreamTransport>>;
}

/// Production connector over `tokio_tungstenite::connect_async`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self, url: &str) -> FeedResult<Box<dyn StreamTransport>> {
        let (ws, response) = connect_async(url).await?;
        debug!(url, status = %response.status(), "websocket handshake complete");
        Ok(Box::new(WsTransport { ws }))
    }
}

pub struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn send_text(&mut self, text: String) -> FeedResult<()> {
        self.ws.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn ping(&mut self) -> FeedResult<()> {
        self.ws.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<FeedResult<Frame>> {
        let frame = match self.ws.next().await? {
            Ok(Message::Text(text)) => Ok(Frame::Text(text)),
            Ok(Message::Pong(_)) => Ok(Frame::Pong),
            Ok(Message::Close(_)) => Ok(Frame::Close),
            Ok(_) => Ok(Frame::Other),
            Err(e) => Err(e.into()),
        };
        Some(frame)
    }

    async fn close(&mut self) -> FeedResult<()> {
        match self.ws.close(None).await {
            Ok(())
            | Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// -----------------------------------------------------------------------------
// Subscription table entry
// -----------------------------------------------------------------------------

/// One (channel, symbol) subscription and where it is in its lifecycle.
///
/// A status only moves forward. Re-subscribing after Errored or Closed
/// creates a new entry with a new `req_id` in place of the old one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub channel: Channel,
    pub symbol: String,
    pub status: SubscriptionStatus,
    /// The subscribe request that created this entry.
    pub req_id: u64,
}

impl Subscription {
    fn pending(channel: Channel, symbol: String, req_id: u64) -> Self {
        Self {
            channel,
            symbol,
            status: SubscriptionStatus::Pending,
            req_id,
        }
    }
}

/// A control request still waiting for acks, one per symbol.
#[derive(Debug)]
struct InFlight {
    channel: Channel,
    symbols: Vec<String>,
}

// -----------------------------------------------------------------------------
// Commands
// -----------------------------------------------------------------------------

enum Command {
    Start(oneshot::Sender<FeedResult<()>>),
    Stop(oneshot::Sender<()>),
    Subscribe {
        request: SubscriptionRequest,
        reply: oneshot::Sender<FeedResult<()>>,
    },
    Unsubscribe {
        request: SubscriptionRequest,
        reply: oneshot::Sender<FeedResult<()>>,
    },
    UnsubscribeAll(oneshot::Sender<FeedResult<usize>>),
    OnData(DataCallback),
    OnError(ErrorCallback),
    OnChannel {
        channel: String,
        handler: DataCallback,
    },
    Subscriptions(oneshot::Sender<Vec<Subscription>>),
}

// =============================================================================
// StreamConnection (handle)
// =============================================================================

/// Handle to the stream actor. Clones share the same connection.
#[derive(Clone)]
pub struct StreamConnection {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl StreamConnection {
    /// Spawn the actor. It stays idle until [`start`](Self::start).
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: StreamConfig, connector: Arc<dyn StreamConnector>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = StreamActor {
            config,
            connector,
            cmd_rx,
            state_tx,
            data_callbacks: Vec::new(),
            error_callbacks: Vec::new(),
            channel_handlers: HashMap::new(),
            subscriptions: Vec::new(),
            in_flight: HashMap::new(),
            next_req_id: 0,
            gave_up_after: None,
        };
        tokio::spawn(actor.run());

        Self { cmd_tx, state_rx }
    }

    /// Actor over the real Kraken WebSocket.
    pub fn kraken(config: StreamConfig) -> Self {
        Self::new(config, Arc::new(WsConnector))
    }

    /// Begin connecting in the background. Idempotent while running; fails
    /// with `GaveUp` once the reconnect budget has been exhausted.
    pub async fn start(&self) -> FeedResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Start(tx))?;
        rx.await.map_err(|_| FeedError::NotConnected)?
    }

    /// Close the socket, stop reconnecting and clear the subscription table.
    /// Idempotent.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Send a subscribe request. Resolves once the request is on the wire;
    /// the exchange's acknowledgement updates the subscription status later.
    pub async fn subscribe(&self, request: SubscriptionRequest) -> FeedResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe { request, reply })?;
        rx.await.map_err(|_| FeedError::NotConnected)?
    }

    pub async fn unsubscribe(&self, request: SubscriptionRequest) -> FeedResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unsubscribe { request, reply })?;
        rx.await.map_err(|_| FeedError::NotConnected)?
    }

    /// Unsubscribe every live (Pending or Active) entry, one request per
    /// channel. Returns how many entries were asked to close.
    pub async fn unsubscribe_all(&self) -> FeedResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::UnsubscribeAll(reply))?;
        rx.await.map_err(|_| FeedError::NotConnected)?
    }

    pub fn on_data(&self, callback: impl Fn(&str, &Value) + Send + Sync + 'static) {
        let _ = self.send(Command::OnData(Arc::new(callback)));
    }

    pub fn on_error(&self, callback: impl Fn(&FeedError) + Send + Sync + 'static) {
        let _ = self.send(Command::OnError(Arc::new(callback)));
    }

    /// Register a handler for one data channel (`"ohlc"`, `"ticker"`, ...).
    pub fn on_channel(
        &self,
        channel: impl Into<String>,
        handler: impl Fn(&str, &Value) + Send + Sync + 'static,
    ) {
        let _ = self.send(Command::OnChannel {
            channel: channel.into(),
            handler: Arc::new(handler),
        });
    }

    /// Snapshot of the subscription table.
    pub async fn subscriptions(&self) -> Vec<Subscription> {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Subscriptions(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Wait until the stream is connected. Returns `false` on timeout or once
    /// the stream has given up.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::GaveUp)),
        )
        .await;
        matches!(settled, Ok(Ok(ref state)) if **state == ConnectionState::Connected)
    }

    /// Watch channel for state changes.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn send(&self, cmd: Command) -> FeedResult<()> {
        self.cmd_tx.send(cmd).map_err(|_| FeedError::NotConnected)
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Actor
// =============================================================================

/// How a connect/pause/session phase ended.
enum Phase {
    /// Connect succeeded.
    Open(Box<dyn StreamTransport>),
    /// Connect failed or the session dropped.
    Failed(FeedError),
    /// Timer elapsed.
    Elapsed,
    /// `stop()` was handled.
    Stopped,
    /// Every handle is gone.
    Shutdown,
}

struct StreamActor {
    config: StreamConfig,
    connector: Arc<dyn StreamConnector>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    data_callbacks: Vec<DataCallback>,
    error_callbacks: Vec<ErrorCallback>,
    channel_handlers: HashMap<String, Vec<DataCallback>>,
    subscriptions: Vec<Subscription>,
    in_flight: HashMap<u64, InFlight>,
    next_req_id: u64,
    gave_up_after: Option<u32>,
}

impl StreamActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            let Some(cmd) = self.handle_registration(cmd) else {
                continue;
            };
            match cmd {
                Command::Start(reply) => {
                    if let Some(attempts) = self.gave_up_after {
                        let _ = reply.send(Err(FeedError::GaveUp { attempts }));
                        continue;
                    }
                    let _ = reply.send(Ok(()));
                    if matches!(self.drive().await, Phase::Shutdown) {
                        break;
                    }
                }
                Command::Stop(ack) => self.finish_stop(ack),
                Command::Subscribe { reply, .. } | Command::Unsubscribe { reply, .. } => {
                    let _ = reply.send(Err(FeedError::NotConnected));
                }
                Command::UnsubscribeAll(reply) => {
                    let _ = reply.send(Err(FeedError::NotConnected));
                }
                _ => {}
            }
        }
        debug!("stream actor exiting");
    }

    // -------------------------------------------------------------------------
    // Connect / reconnect loop
    // -------------------------------------------------------------------------

    /// Run until stopped, given up or orphaned.
    async fn drive(&mut self) -> Phase {
        let max_attempts = self.config.max_reconnect_attempts.max(1);
        let mut failures: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting {
                attempt: failures + 1,
            });
            info!(url = %self.config.url, attempt = failures + 1, "connecting to Kraken stream");

            let err = match self.connect().await {
                Phase::Open(transport) => {
                    failures = 0;
                    self.set_state(ConnectionState::Connected);
                    info!("Kraken stream connected");

                    match self.session(transport).await {
                        Phase::Failed(e) => {
                            warn!(error = %e, "stream session dropped");
                            self.close_subscriptions();
                            self.set_state(ConnectionState::Disconnected);
                            self.report(&e);
                            match self.pause(self.config.reconnect_pause()).await {
                                Phase::Elapsed => continue,
                                other => return other,
                            }
                        }
                        other => return other,
                    }
                }
                Phase::Failed(e) => e,
                other => return other,
            };

            failures += 1;
            if failures >= max_attempts {
                error!(attempts = failures, error = %err, "stream reconnect budget exhausted — giving up");
                self.gave_up_after = Some(failures);
                self.set_state(ConnectionState::GaveUp);
                self.report(&FeedError::GaveUp { attempts: failures });
                return Phase::Stopped;
            }

            let delay = self.config.backoff_for(failures);
            warn!(
                attempt = failures,
                max_attempts,
                retry_in_secs = delay.as_secs(),
                error = %err,
                "stream connect failed"
            );
            match self.pause(delay).await {
                Phase::Elapsed => {}
                other => return other,
            }
        }
    }

    /// One connect attempt, bounded by the connect timeout. Commands keep being
    /// served while it is in flight.
    async fn connect(&mut self) -> Phase {
        let connector = Arc::clone(&self.connector);
        let url = self.config.url.clone();
        let limit = self.config.connect_timeout();
        let attempt = async move {
            match tokio::time::timeout(limit, connector.connect(&url)).await {
                Ok(result) => result,
                Err(_) => Err(FeedError::Transport(format!(
                    "connect timed out after {}s",
                    limit.as_secs()
                ))),
            }
        };
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return match result {
                        Ok(transport) => Phase::Open(transport),
                        Err(e) => Phase::Failed(e),
                    };
                }
                cmd = self.cmd_rx.recv() => {
                    if let Some(end) = self.handle_offline(cmd) {
                        return end;
                    }
                }
            }
        }
    }

    /// Sleep for `delay` while still serving commands.
    async fn pause(&mut self, delay: Duration) -> Phase {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Phase::Elapsed,
                cmd = self.cmd_rx.recv() => {
                    if let Some(end) = self.handle_offline(cmd) {
                        return end;
                    }
                }
            }
        }
    }

    /// Command handling while not connected. Returns `Some` when the phase
    /// must end.
    fn handle_offline(&mut self, cmd: Option<Command>) -> Option<Phase> {
        let Some(cmd) = cmd else {
            return Some(Phase::Shutdown);
        };
        match self.handle_registration(cmd)? {
            Command::Start(reply) => {
                let _ = reply.send(Ok(()));
                None
            }
            Command::Stop(ack) => {
                self.finish_stop(ack);
                Some(Phase::Stopped)
            }
            Command::Subscribe { reply, .. } | Command::Unsubscribe { reply, .. } => {
                let _ = reply.send(Err(FeedError::NotConnected));
                None
            }
            Command::UnsubscribeAll(reply) => {
                let _ = reply.send(Err(FeedError::NotConnected));
                None
            }
            _ => None,
        }
    }

    // -------------------------------------------------------------------------
    // Connected session
    // -------------------------------------------------------------------------

    async fn session(&mut self, mut transport: Box<dyn StreamTransport>) -> Phase {
        let ping_every = self.config.ping_interval();
        let idle_limit = self.config.idle_timeout();
        let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            // Commands first: a callback registered before a frame arrives
            // must see that frame.
            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        let _ = transport.close().await;
                        return Phase::Shutdown;
                    };
                    match self.handle_registration(cmd) {
                        None => {}
                        Some(Command::Start(reply)) => {
                            let _ = reply.send(Ok(()));
                        }
                        Some(Command::Stop(ack)) => {
                            if let Err(e) = transport.close().await {
                                debug!(error = %e, "error while closing stream");
                            }
                            self.finish_stop(ack);
                            return Phase::Stopped;
                        }
                        Some(Command::Subscribe { request, reply }) => {
                            let result = self.subscribe(transport.as_mut(), request).await;
                            let _ = reply.send(result);
                        }
                        Some(Command::Unsubscribe { request, reply }) => {
                            let result = self.unsubscribe(transport.as_mut(), request).await;
                            let _ = reply.send(result);
                        }
                        Some(Command::UnsubscribeAll(reply)) => {
                            let result = self.unsubscribe_all(transport.as_mut()).await;
                            let _ = reply.send(result);
                        }
                        Some(_) => {}
                    }
                }
                frame = transport.recv() => {
                    last_seen = Instant::now();
                    match frame {
                        Some(Ok(Frame::Text(text))) => self.dispatch(&text),
                        Some(Ok(Frame::Pong)) | Some(Ok(Frame::Other)) => {}
                        Some(Ok(Frame::Close)) | None => {
                            return Phase::Failed(FeedError::Transport("stream closed by peer".into()));
                        }
                        Some(Err(e)) => return Phase::Failed(e),
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = transport.ping().await {
                        return Phase::Failed(e);
                    }
                }
                _ = tokio::time::sleep_until(last_seen + idle_limit) => {
                    return Phase::Failed(FeedError::Transport(format!(
                        "no data received for {}s",
                        idle_limit.as_secs()
                    )));
                }
            }
        }
    }

    async fn subscribe(
        &mut self,
        transport: &mut dyn StreamTransport,
        request: SubscriptionRequest,
    ) -> FeedResult<()> {
        let req_id = self.next_req_id();
        let text = request
            .to_message(ControlMethod::Subscribe)
            .with_req_id(req_id)
            .to_json()?;

        for symbol in &request.symbols {
            let slot = self
                .subscriptions
                .iter()
                .position(|s| s.channel == request.channel && &s.symbol == symbol);
            match slot {
                Some(i) if !self.subscriptions[i].status.is_terminal() => {}
                Some(i) => {
                    self.subscriptions[i] = Subscription::pending(request.channel, symbol.clone(), req_id)
                }
                None => self
                    .subscriptions
                    .push(Subscription::pending(request.channel, symbol.clone(), req_id)),
            }
        }

        if let Err(e) = transport.send_text(text).await {
            for sub in self.matching_mut(&request) {
                if sub.status.can_advance_to(SubscriptionStatus::Errored) {
                    sub.status = SubscriptionStatus::Errored;
                }
            }
            return Err(e);
        }

        self.in_flight.insert(
            req_id,
            InFlight {
                channel: request.channel,
                symbols: request.symbols.clone(),
            },
        );
        info!(channel = %request.channel, symbols = ?request.symbols, req_id, "subscribe sent");
        Ok(())
    }

    async fn unsubscribe(
        &mut self,
        transport: &mut dyn StreamTransport,
        request: SubscriptionRequest,
    ) -> FeedResult<()> {
        let req_id = self.next_req_id();
        let text = request
            .to_message(ControlMethod::Unsubscribe)
            .with_req_id(req_id)
            .to_json()?;
        transport.send_text(text).await?;
        self.in_flight.insert(
            req_id,
            InFlight {
                channel: request.channel,
                symbols: request.symbols.clone(),
            },
        );
        info!(channel = %request.channel, symbols = ?request.symbols, req_id, "unsubscribe sent");
        Ok(())
    }

    async fn unsubscribe_all(&mut self, transport: &mut dyn StreamTransport) -> FeedResult<usize> {
        let mut groups: Vec<(Channel, Vec<String>)> = Vec::new();
        for sub in self.subscriptions.iter().filter(|s| !s.status.is_terminal()) {
            match groups.iter_mut().find(|(channel, _)| *channel == sub.channel) {
                Some((_, symbols)) => symbols.push(sub.symbol.clone()),
                None => groups.push((sub.channel, vec![sub.symbol.clone()])),
            }
        }

        let mut requested = 0;
        for (channel, symbols) in groups {
            requested += symbols.len();
            self.unsubscribe(transport, SubscriptionRequest::new(channel, symbols))
                .await?;
        }
        info!(requested, "unsubscribed from all channels");
        Ok(requested)
    }

    fn next_req_id(&mut self) -> u64 {
        self.next_req_id += 1;
        self.next_req_id
    }

    fn matching_mut<'a>(
        &'a mut self,
        request: &'a SubscriptionRequest,
    ) -> impl Iterator<Item = &'a mut Subscription> + 'a {
        self.subscriptions
            .iter_mut()
            .filter(move |s| s.channel == request.channel && request.symbols.contains(&s.symbol))
    }

    // -------------------------------------------------------------------------
    // Inbound dispatch
    // -------------------------------------------------------------------------

    fn dispatch(&mut self, text: &str) {
        let inbound = match classify(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, "ignoring undecodable stream frame");
                return;
            }
        };

        match inbound {
            Inbound::Heartbeat => debug!("heartbeat"),
            Inbound::Status(message) => {
                let system = message
                    .pointer("/data/0/system")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                info!(system, "Kraken system status");
            }
            Inbound::Data { channel, message } => {
                for cb in &self.data_callbacks {
                    invoke_data(cb, &channel, &message);
                }
                if let Some(handlers) = self.channel_handlers.get(&channel) {
                    for handler in handlers {
                        invoke_data(handler, &channel, &message);
                    }
                }
            }
            Inbound::Ack(ack) => self.apply_ack(ack),
            Inbound::Pong => debug!("pong"),
            Inbound::Unhandled(message) => debug!(%message, "unhandled stream message"),
        }
    }

    fn apply_ack(&mut self, ack: AckMessage) {
        let targets = self.ack_targets(&ack);
        let symbol = ack.symbol().map(str::to_string);
        let channel = ack.channel().map(str::to_string);

        let next = match (ack.method, ack.success) {
            (ControlMethod::Subscribe, true) => SubscriptionStatus::Active,
            (ControlMethod::Unsubscribe, true) => SubscriptionStatus::Closed,
            (_, false) => SubscriptionStatus::Errored,
        };

        if targets.is_empty() {
            warn!(method = %ack.method, req_id = ?ack.req_id, "ack matches no subscription");
        }
        for &i in &targets {
            let sub = &mut self.subscriptions[i];
            if sub.status.can_advance_to(next) {
                sub.status = next;
            }
        }
        // A confirmed unsubscribe destroys its entries.
        if ack.method == ControlMethod::Unsubscribe && ack.success {
            for &i in targets.iter().rev() {
                self.subscriptions.remove(i);
            }
        }

        if ack.success {
            info!(
                method = %ack.method,
                channel = channel.as_deref().unwrap_or("?"),
                symbol = symbol.as_deref().unwrap_or("?"),
                "subscription acknowledged"
            );
        } else {
            let err = FeedError::SubscriptionFailed {
                method: ack.method.to_string(),
                symbol: symbol.unwrap_or_else(|| "?".to_string()),
                reason: ack.error.unwrap_or_else(|| "unknown error".to_string()),
            };
            error!(error = %err, "subscription rejected");
            self.report(&err);
        }
    }

    /// Table positions an ack applies to, in ascending order.
    fn ack_targets(&mut self, ack: &AckMessage) -> Vec<usize> {
        let symbol = ack.symbol();

        if let Some(req_id) = ack.req_id {
            if let Some(request) = self.in_flight.get_mut(&req_id) {
                let acked: Vec<String> = match symbol {
                    Some(s) => request.symbols.iter().filter(|p| p.as_str() == s).cloned().collect(),
                    None => request.symbols.clone(),
                };
                request.symbols.retain(|s| !acked.contains(s));
                let channel = request.channel;
                if request.symbols.is_empty() {
                    self.in_flight.remove(&req_id);
                }
                // Subscribe acks only speak for the entries their request created.
                let own_entries = ack.method == ControlMethod::Subscribe;
                return self.positions(|s| {
                    s.channel == channel
                        && acked.contains(&s.symbol)
                        && (!own_entries || s.req_id == req_id)
                });
            }
        }

        let Some(symbol) = symbol else {
            return Vec::new();
        };
        let channel = ack.channel();
        self.positions(|s| s.symbol == symbol && channel.map_or(true, |c| c == s.channel.name()))
    }

    fn positions(&self, predicate: impl Fn(&Subscription) -> bool) -> Vec<usize> {
        self.subscriptions
            .iter()
            .enumerate()
            .filter(|(_, s)| predicate(s))
            .map(|(i, _)| i)
            .collect()
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Serve callback registration and queries; hand everything else back.
    fn handle_registration(&mut self, cmd: Command) -> Option<Command> {
        match cmd {
            Command::OnData(cb) => self.data_callbacks.push(cb),
            Command::OnError(cb) => self.error_callbacks.push(cb),
            Command::OnChannel { channel, handler } => {
                self.channel_handlers.entry(channel).or_default().push(handler)
            }
            Command::Subscriptions(reply) => {
                let _ = reply.send(self.subscriptions.clone());
            }
            other => return Some(other),
        }
        None
    }

    fn finish_stop(&mut self, ack: oneshot::Sender<()>) {
        self.close_subscriptions();
        self.subscriptions.clear();
        if self.gave_up_after.is_none() {
            self.set_state(ConnectionState::Disconnected);
        }
        info!("Kraken stream stopped");
        let _ = ack.send(());
    }

    fn close_subscriptions(&mut self) {
        self.in_flight.clear();
        let mut closed = 0usize;
        for sub in self.subscriptions.iter_mut() {
            if sub.status.can_advance_to(SubscriptionStatus::Closed) {
                sub.status = SubscriptionStatus::Closed;
                closed += 1;
            }
        }
        if closed > 0 {
            info!(closed, "subscriptions closed with their session — not replayed on reconnect");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn report(&self, err: &FeedError) {
        for cb in &self.error_callbacks {
            if catch_unwind(AssertUnwindSafe(|| cb(err))).is_err() {
                error!("stream error callback panicked");
            }
        }
    }
}

fn invoke_data(cb: &DataCallback, channel: &str, message: &Value) {
    if catch_unwind(AssertUnwindSafe(|| cb(channel, message))).is_err() {
        error!(channel, "stream data callback panicked");
    }
}
