use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::codec::{decode_tick, encode_subscription, is_control_frame, RealTimeTick};
use crate::errors::FeedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Consistent snapshot of the connector's state and ticker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedStatus {
    pub state: ConnectionState,
    pub ticker: Option<String>,
    /// Why the last link ended abnormally. Cleared once a link opens.
    pub last_error: Option<FeedError>,
}

/// Receives every tick decoded from the upstream feed.
pub trait TickSink: Send + Sync {
    fn on_tick(&self, tick: RealTimeTick);
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub approval_key: String,
    pub reconnect_delay: Duration,
    /// Bound on the upstream handshake and on each send.
    pub connect_timeout: Duration,
}

enum FeedCommand {
    Connect(String),
    Disconnect,
}

#[derive(Debug)]
enum LinkEvent {
    Opened(u64),
    Closed { generation: u64, error: Option<FeedError> },
    ReconnectDue(u64),
}

/// Handle to the single upstream connection. Cloning shares the same
/// connection; the worker stops when the last handle is dropped.
#[derive(Clone)]
pub struct FeedConnector {
    commands: mpsc::UnboundedSender<FeedCommand>,
    status: watch::Receiver<FeedStatus>,
    // Generation of the link whose transport is currently open, 0 when none.
    open_link: Arc<AtomicU64>,
    has_credential: bool,
}

impl FeedConnector {
    pub fn spawn(config: FeedConfig, sink: Arc<dyn TickSink>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(FeedStatus::default());
        let open_link = Arc::new(AtomicU64::new(0));
        let has_credential = !config.approval_key.trim().is_empty();

        let worker = FeedWorker::new(config, sink, status_tx, open_link.clone());
        tokio::spawn(worker.run(command_rx));

        Self {
            commands,
            status,
            open_link,
            has_credential,
        }
    }

    /// Connect to the feed for `ticker`. A no-op while already connected or
    /// connecting for the same ticker; a different ticker replaces the
    /// current connection.
    pub fn connect(&self, ticker: &str) -> Result<(), FeedError> {
        if !self.has_credential {
            error!("Approval key is not configured. Set KIS_APPROVAL_KEY to connect the feed.");
            return Err(FeedError::MissingCredential);
        }

        self.commands
            .send(FeedCommand::Connect(ticker.trim().to_string()))
            .map_err(|_| FeedError::WorkerStopped)
    }

    /// Close the connection, forget the ticker and cancel any pending
    /// reconnect. Idempotent.
    pub fn disconnect(&self) -> Result<(), FeedError> {
        self.commands
            .send(FeedCommand::Disconnect)
            .map_err(|_| FeedError::WorkerStopped)
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().state == ConnectionState::Connected
            && self.open_link.load(Ordering::SeqCst) != 0
    }

    pub fn status(&self) -> FeedStatus {
        self.status.borrow().clone()
    }

    #[cfg(test)]
    pub fn watch_status(&self) -> watch::Receiver<FeedStatus> {
        self.status.clone()
    }
}

/// Owns the connection state machine. Only this task mutates it.
struct FeedWorker {
    config: FeedConfig,
    sink: Arc<dyn TickSink>,
    status: watch::Sender<FeedStatus>,
    open_link: Arc<AtomicU64>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    state: ConnectionState,
    current_ticker: Option<String>,
    last_error: Option<FeedError>,
    // Bumped on every connect/disconnect so events from superseded links
    // and timers are ignored.
    generation: u64,
    link: Option<CancellationToken>,
    reconnect: Option<CancellationToken>,
}

impl FeedWorker {
    fn new(
        config: FeedConfig,
        sink: Arc<dyn TickSink>,
        status: watch::Sender<FeedStatus>,
        open_link: Arc<AtomicU64>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            sink,
            status,
            open_link,
            events_tx,
            events_rx: Some(events_rx),
            state: ConnectionState::Disconnected,
            current_ticker: None,
            last_error: None,
            generation: 0,
            link: None,
            reconnect: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<FeedCommand>) {
        let Some(mut events) = self.events_rx.take() else {
            return;
        };

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(FeedCommand::Connect(ticker)) => self.connect(ticker),
                    Some(FeedCommand::Disconnect) => self.disconnect(),
                    None => {
                        self.disconnect();
                        debug!("All feed handles dropped, worker exiting");
                        break;
                    }
                },
                Some(event) = events.recv() => self.on_event(event),
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("Feed state: {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.status.send_replace(FeedStatus {
            state,
            ticker: self.current_ticker.clone(),
            last_error: self.last_error.clone(),
        });
    }

    fn connect(&mut self, ticker: String) {
        let same_ticker = self.current_ticker.as_deref() == Some(ticker.as_str());
        if same_ticker && matches!(self.state, ConnectionState::Connecting | ConnectionState::Connected) {
            debug!("Already {:?} for ticker {}, ignoring connect", self.state, ticker);
            return;
        }

        self.cancel_reconnect();
        self.close_link();

        self.generation += 1;
        self.current_ticker = Some(ticker.clone());
        self.set_state(ConnectionState::Connecting);

        let cancel = CancellationToken::new();
        self.link = Some(cancel.clone());

        let link = UpstreamLink {
            generation: self.generation,
            url: self.config.url.clone(),
            approval_key: self.config.approval_key.clone(),
            ticker,
            io_timeout: self.config.connect_timeout,
            sink: self.sink.clone(),
            events: self.events_tx.clone(),
            open_link: self.open_link.clone(),
            cancel,
        };
        tokio::spawn(link.run());
    }

    fn disconnect(&mut self) {
        self.cancel_reconnect();
        self.close_link();
        self.generation += 1;
        self.last_error = None;

        if let Some(ticker) = self.current_ticker.take() {
            info!("Disconnected upstream feed for ticker: {}", ticker);
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn on_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened(generation) if generation == self.generation => {
                self.last_error = None;
                self.set_state(ConnectionState::Connected);
            }
            LinkEvent::Closed { generation, error } if generation == self.generation => {
                self.link = None;
                match error {
                    Some(e) if self.current_ticker.is_some() => {
                        warn!("Upstream connection lost: {}", e);
                        self.last_error = Some(e);
                        self.set_state(ConnectionState::Reconnecting);
                        self.schedule_reconnect();
                    }
                    _ => {
                        info!("Upstream connection closed");
                        self.cancel_reconnect();
                        self.set_state(ConnectionState::Disconnected);
                    }
                }
            }
            LinkEvent::ReconnectDue(generation)
                if generation == self.generation
                    && self.state == ConnectionState::Reconnecting
                    && self.reconnect.is_some() =>
            {
                self.reconnect = None;
                if let Some(ticker) = self.current_ticker.clone() {
                    info!("Attempting to reconnect for ticker: {}", ticker);
                    self.connect(ticker);
                }
            }
            stale => debug!("Ignoring stale link event: {:?}", stale),
        }
    }

    fn schedule_reconnect(&mut self) {
        self.cancel_reconnect();

        let token = CancellationToken::new();
        let timer = token.clone();
        let events = self.events_tx.clone();
        let generation = self.generation;
        let delay = self.config.reconnect_delay;

        info!("Scheduling reconnection in {:?}", delay);
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !timer.is_cancelled() {
                        let _ = events.send(LinkEvent::ReconnectDue(generation));
                    }
                }
            }
        });

        self.reconnect = Some(token);
    }

    fn cancel_reconnect(&mut self) {
        if let Some(token) = self.reconnect.take() {
            token.cancel();
        }
    }

    fn close_link(&mut self) {
        if let Some(token) = self.link.take() {
            token.cancel();
        }
    }
}

/// One upstream connection attempt and its read loop.
struct UpstreamLink {
    generation: u64,
    url: String,
    approval_key: String,
    ticker: String,
    io_timeout: Duration,
    sink: Arc<dyn TickSink>,
    events: mpsc::UnboundedSender<LinkEvent>,
    open_link: Arc<AtomicU64>,
    cancel: CancellationToken,
}

/// How a link ended when the close did not come from our own cancel.
/// `Err` is an abnormal close and triggers a reconnect.
type LinkClose = Result<(), FeedError>;

impl UpstreamLink {
    async fn run(self) {
        let outcome = self.drive().await;

        let _ = self
            .open_link
            .compare_exchange(self.generation, 0, Ordering::SeqCst, Ordering::SeqCst);

        if let Some(close) = outcome {
            let _ = self.events.send(LinkEvent::Closed {
                generation: self.generation,
                error: close.err(),
            });
        }
    }

    /// Returns `None` when the link was cancelled locally.
    async fn drive(&self) -> Option<LinkClose> {
        info!("Connecting to upstream feed {} for ticker {}", self.url, self.ticker);

        let connecting = timeout(self.io_timeout, connect_async(self.url.as_str()));
        let ws_stream = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            result = connecting => match result {
                Ok(Ok((ws_stream, _))) => ws_stream,
                Ok(Err(e)) => {
                    error!("Failed to connect to upstream feed: {}", e);
                    return Some(Err(FeedError::ConnectionFailure(e.to_string())));
                }
                Err(_) => {
                    error!("Upstream connect timed out after {:?}", self.io_timeout);
                    return Some(Err(FeedError::Timeout("connect")));
                }
            }
        };

        let (mut write, mut read) = ws_stream.split();
        self.open_link.store(self.generation, Ordering::SeqCst);
        let _ = self.events.send(LinkEvent::Opened(self.generation));
        info!("Upstream connection opened for ticker: {}", self.ticker);

        let request = encode_subscription(&self.approval_key, &self.ticker);
        info!("Sending subscription request for ticker: {}", self.ticker);
        match timeout(self.io_timeout, write.send(Message::Text(request))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Failed to send subscription request: {}", e);
                let reason = format!("subscription send failed: {}", e);
                return Some(Err(FeedError::ConnectionFailure(reason)));
            }
            Err(_) => {
                error!("Subscription request timed out after {:?}", self.io_timeout);
                return Some(Err(FeedError::Timeout("subscription send")));
            }
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client disconnect".into(),
                    };
                    if let Ok(Err(e)) = timeout(self.io_timeout, write.send(Message::Close(Some(frame)))).await {
                        debug!("Error sending close frame upstream: {}", e);
                    }
                    return None;
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                    Some(Ok(Message::Binary(data))) => {
                        debug!("Ignoring {} byte binary frame from upstream", data.len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let normal = frame
                            .as_ref()
                            .map(|f| f.code == CloseCode::Normal)
                            .unwrap_or(false);
                        warn!("Upstream connection closed. Reason: {:?}", frame);
                        if normal {
                            return Some(Ok(()));
                        }
                        let reason = format!("close frame {:?}", frame);
                        return Some(Err(FeedError::ConnectionFailure(reason)));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Upstream read error: {}", e);
                        return Some(Err(FeedError::ConnectionFailure(e.to_string())));
                    }
                    None => {
                        return Some(Err(FeedError::ConnectionFailure(
                            "stream ended without close frame".to_string(),
                        )));
                    }
                }
            }
        }
    }

    fn handle_frame(&self, raw: &str) {
        if is_control_frame(raw) {
            debug!("Upstream control message: {}", raw);
            return;
        }

        match decode_tick(raw) {
            Ok(tick) => self.sink.on_tick(tick),
            Err(e) => warn!("Dropping upstream frame ({}): {}", e, raw),
        }
    }
}
