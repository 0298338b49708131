//! Real-time chat connection.
//!
//! A single actor task owns the STOMP link, the live subscriptions and the
//! stored topic handlers. [`ChatConnection`] is a cheap handle to it; every
//! clone talks to the same connection.
//!
//! Unexpected closes and failed connects schedule one retry after a fixed
//! interval, repeated until a connect succeeds or [`ChatConnection::disconnect`]
//! is called. On success every stored handler is subscribed again.

use std::collections::HashMap;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Sleep};

use crate::client::services::message_parser;
use crate::client::services::stomp::{Command, Frame, FrameError};
use crate::client::services::websocket_client::{Connector, Link};
use crate::common::models::ChatMessage;

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("STOMP handshake failed: {0}")]
    Handshake(String),
    #[error("Protocol error: {0}")]
    Protocol(#[from] FrameError),
    #[error("Subscription cancelled by disconnect")]
    Disconnected,
    #[error("Chat connection has shut down")]
    Closed,
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub id: String,
    pub topic: String,
}

pub type MessageHandler = Arc<dyn Fn(ChatMessage) + Send + Sync>;

/// Point-in-time view of the subscription bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub subscribed_topics: Vec<String>,
    pub stored_handlers: Vec<String>,
}

enum Request {
    Connect,
    Subscribe {
        topic: String,
        handler: MessageHandler,
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        topic: String,
    },
    Send {
        destination: String,
        body: String,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
}

#[derive(Clone)]
pub struct ChatConnection {
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionState>,
    /// Bumped on every `disconnect`, so waiters can tell they were cut off.
    disconnects: watch::Receiver<u64>,
}

impl ChatConnection {
    /// Spawns the connection actor on the current tokio runtime. Nothing is
    /// dialled until the first `connect`, `subscribe` or `send`.
    pub fn new<C: Connector>(connector: C, reconnect_interval: Duration) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (disconnects_tx, disconnects_rx) = watch::channel(0);
        let actor = ConnectionActor {
            connector: Arc::new(connector),
            reconnect_interval,
            requests: requests_rx,
            state: state_tx,
            disconnects: disconnects_tx,
            link: None,
            subscriptions: HashMap::new(),
            topics_by_id: HashMap::new(),
            handlers: HashMap::new(),
            pending: HashMap::new(),
            next_subscription: 0,
            attempt: None,
            retry: None,
        };
        tokio::spawn(actor.run());
        Self {
            requests: requests_tx,
            state: state_rx,
            disconnects: disconnects_rx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Resolves once connected. Calling it while connected is a no-op and
    /// concurrent callers share the attempt in flight. A `disconnect` while
    /// waiting fails it with [`ChatError::Disconnected`].
    pub async fn connect(&self) -> Result<(), ChatError> {
        if self.is_connected() {
            debug!("[CHAT] Already connected to WebSocket server");
            return Ok(());
        }
        let disconnects = self.disconnect_marker();
        self.request(Request::Connect)?;
        self.wait_for_connection(disconnects).await
    }

    /// Readiness signal: resolves the next time the connection is up, or
    /// fails with [`ChatError::Disconnected`] if `disconnect` runs first.
    pub async fn wait_connected(&self) -> Result<(), ChatError> {
        self.wait_for_connection(self.disconnect_marker()).await
    }

    fn disconnect_marker(&self) -> watch::Receiver<u64> {
        let mut marker = self.disconnects.clone();
        marker.borrow_and_update();
        marker
    }

    async fn wait_for_connection(&self, mut disconnects: watch::Receiver<u64>) -> Result<(), ChatError> {
        let mut state = self.state.clone();
        let outcome = tokio::select! {
            biased;
            changed = disconnects.changed() => match changed {
                Ok(()) => Err(ChatError::Disconnected),
                Err(_) => Err(ChatError::Closed),
            },
            ready = state.wait_for(|s| *s == ConnectionState::Connected) => match ready {
                Ok(_) => Ok(()),
                Err(_) => Err(ChatError::Closed),
            },
        };
        outcome
    }

    /// Subscribes `handler` to `topic`. A second call for a topic that is
    /// already subscribed returns the existing subscription and keeps the
    /// first handler. While disconnected the request waits for the connection.
    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> Result<Subscription, ChatError>
    where
        F: Fn(ChatMessage) + Send + Sync + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Subscribe {
            topic: topic.to_string(),
            handler: Arc::new(handler),
            reply,
        })?;
        rx.await.map_err(|_| ChatError::Disconnected)
    }

    pub fn unsubscribe(&self, topic: &str) {
        if self
            .request(Request::Unsubscribe {
                topic: topic.to_string(),
            })
            .is_err()
        {
            warn!("[CHAT] Unsubscribe from {} after shutdown", topic);
        }
    }

    /// Waits for the connection, then sends. Never fails: a frame that cannot
    /// be delivered is logged and dropped, as is one still waiting when
    /// `disconnect` is called.
    pub async fn send(&self, destination: &str, body: impl Into<String>) {
        if !self.is_connected() {
            let disconnects = self.disconnect_marker();
            if self.request(Request::Connect).is_err() {
                warn!("[CHAT] Unable to send message. Chat connection has shut down.");
                return;
            }
            match self.wait_for_connection(disconnects).await {
                Ok(()) => {}
                Err(ChatError::Disconnected) => {
                    warn!("[CHAT] Message to {} dropped, disconnected before it could be sent.", destination);
                    return;
                }
                Err(_) => {
                    warn!("[CHAT] Unable to send message. Chat connection has shut down.");
                    return;
                }
            }
        }
        if self
            .request(Request::Send {
                destination: destination.to_string(),
                body: body.into(),
            })
            .is_err()
        {
            warn!("[CHAT] Unable to send message. Chat connection has shut down.");
        }
    }

    pub async fn send_json<T: Serialize>(&self, destination: &str, payload: &T) -> Result<(), ChatError> {
        let body = serde_json::to_string(payload)?;
        self.send(destination, body).await;
        Ok(())
    }

    /// Closes the socket, forgets every subscription and handler and stops
    /// any pending reconnect.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.request(Request::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn snapshot(&self) -> Result<Snapshot, ChatError> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Snapshot { reply })?;
        rx.await.map_err(|_| ChatError::Closed)
    }

    pub async fn subscribed_topics(&self) -> Result<Vec<String>, ChatError> {
        Ok(self.snapshot().await?.subscribed_topics)
    }

    pub async fn stored_handler_count(&self) -> Result<usize, ChatError> {
        Ok(self.snapshot().await?.stored_handlers.len())
    }

    fn request(&self, request: Request) -> Result<(), ChatError> {
        self.requests.send(request).map_err(|_| ChatError::Closed)
    }
}

enum Event {
    Request(Option<Request>),
    Frame(Option<Frame>),
    Attempt(Result<Link, ChatError>),
    RetryDue,
}

struct ConnectionActor<C> {
    connector: Arc<C>,
    reconnect_interval: Duration,
    requests: mpsc::UnboundedReceiver<Request>,
    state: watch::Sender<ConnectionState>,
    disconnects: watch::Sender<u64>,
    link: Option<Link>,
    /// topic -> live subscription
    subscriptions: HashMap<String, Subscription>,
    topics_by_id: HashMap<String, String>,
    /// topic -> handler, kept across transient drops
    handlers: HashMap<String, MessageHandler>,
    /// subscribe calls waiting for the connection
    pending: HashMap<String, Vec<oneshot::Sender<Subscription>>>,
    next_subscription: u64,
    attempt: Option<JoinHandle<Result<Link, ChatError>>>,
    /// At most one retry cycle is armed at a time.
    retry: Option<Pin<Box<Sleep>>>,
}

impl<C: Connector> ConnectionActor<C> {
    async fn run(mut self) {
        loop {
            match self.next_event().await {
                Event::Request(Some(request)) => self.handle_request(request),
                Event::Request(None) => break,
                Event::Frame(Some(frame)) => self.handle_frame(frame),
                Event::Frame(None) => self.handle_close(),
                Event::Attempt(result) => self.handle_attempt(result),
                Event::RetryDue => {
                    info!("[CHAT] Attempting to reconnect to WebSocket...");
                    self.begin_attempt();
                }
            }
        }
        self.teardown();
        debug!("[CHAT] Connection actor stopped");
    }

    async fn next_event(&mut self) -> Event {
        let incoming = self.link.as_mut().map(|link| &mut link.incoming);
        tokio::select! {
            request = self.requests.recv() => Event::Request(request),
            frame = next_frame(incoming) => Event::Frame(frame),
            result = join_attempt(&mut self.attempt) => Event::Attempt(result),
            _ = retry_due(&mut self.retry) => Event::RetryDue,
        }
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect => self.ensure_connecting(),
            Request::Subscribe {
                topic,
                handler,
                reply,
            } => self.handle_subscribe(topic, handler, reply),
            Request::Unsubscribe { topic } => self.handle_unsubscribe(&topic),
            Request::Send { destination, body } => self.handle_send(destination, body),
            Request::Disconnect { reply } => {
                self.teardown();
                self.disconnects.send_modify(|n| *n += 1);
                info!("[CHAT] Disconnected from WebSocket server");
                let _ = reply.send(());
            }
            Request::Snapshot { reply } => {
                let mut subscribed_topics: Vec<String> = self.subscriptions.keys().cloned().collect();
                let mut stored_handlers: Vec<String> = self.handlers.keys().cloned().collect();
                subscribed_topics.sort();
                stored_handlers.sort();
                let _ = reply.send(Snapshot {
                    subscribed_topics,
                    stored_handlers,
                });
            }
        }
    }

    /// Starts a connect unless one is already underway. A caller arriving
    /// during a retry cycle waits for that cycle.
    fn ensure_connecting(&mut self) {
        match self.current() {
            ConnectionState::Connected => debug!("[CHAT] Already connected to WebSocket server."),
            ConnectionState::Connecting => debug!("[CHAT] Connect already in flight"),
            ConnectionState::Reconnecting => debug!("[CHAT] Reconnect already scheduled"),
            ConnectionState::Disconnected => self.begin_attempt(),
        }
    }

    fn begin_attempt(&mut self) {
        self.retry = None;
        self.set_state(ConnectionState::Connecting);
        let connector = self.connector.clone();
        self.attempt = Some(tokio::spawn(async move { connector.open().await }));
    }

    fn handle_attempt(&mut self, result: Result<Link, ChatError>) {
        match result {
            Ok(link) => {
                self.link = Some(link);
                self.set_state(ConnectionState::Connected);
                info!("[CHAT] Connected to WebSocket server");
                self.resubscribe_all();
            }
            Err(e) => {
                error!("[CHAT] WebSocket connection error: {}", e);
                self.schedule_retry();
            }
        }
    }

    fn schedule_retry(&mut self) {
        if self.retry.is_some() {
            return;
        }
        self.set_state(ConnectionState::Reconnecting);
        debug!("[CHAT] Retrying in {:?}", self.reconnect_interval);
        self.retry = Some(Box::pin(sleep(self.reconnect_interval)));
    }

    fn handle_close(&mut self) {
        self.link = None;
        self.subscriptions.clear();
        self.topics_by_id.clear();
        warn!("[CHAT] Disconnected from WebSocket server");
        self.schedule_retry();
    }

    fn resubscribe_all(&mut self) {
        let mut topics: Vec<String> = self
            .handlers
            .keys()
            .filter(|t| !self.subscriptions.contains_key(*t))
            .cloned()
            .collect();
        topics.sort();
        for topic in topics {
            let subscription = self.subscribe_live(&topic);
            if let Some(waiters) = self.pending.remove(&topic) {
                for waiter in waiters {
                    let _ = waiter.send(subscription.clone());
                }
            }
        }
    }

    fn subscribe_live(&mut self, topic: &str) -> Subscription {
        let subscription = Subscription {
            id: format!("sub-{}", self.next_subscription),
            topic: topic.to_string(),
        };
        self.next_subscription += 1;
        self.transmit(Frame::subscribe(&subscription.id, topic));
        self.subscriptions
            .insert(topic.to_string(), subscription.clone());
        self.topics_by_id
            .insert(subscription.id.clone(), topic.to_string());
        info!("[CHAT] Subscribed to {}", topic);
        subscription
    }

    fn handle_subscribe(
        &mut self,
        topic: String,
        handler: MessageHandler,
        reply: oneshot::Sender<Subscription>,
    ) {
        if let Some(existing) = self.subscriptions.get(&topic) {
            info!("[CHAT] Already subscribed to {}", topic);
            let _ = reply.send(existing.clone());
            return;
        }
        if self.handlers.contains_key(&topic) {
            debug!("[CHAT] Subscription to {} already queued", topic);
            self.pending.entry(topic).or_default().push(reply);
            return;
        }

        self.handlers.insert(topic.clone(), handler);
        if self.link.is_some() {
            let subscription = self.subscribe_live(&topic);
            let _ = reply.send(subscription);
        } else {
            warn!("[CHAT] WebSocket is not connected. Subscription to {} deferred.", topic);
            self.pending.entry(topic).or_default().push(reply);
            self.ensure_connecting();
        }
    }

    fn handle_unsubscribe(&mut self, topic: &str) {
        match self.subscriptions.remove(topic) {
            Some(subscription) => {
                self.topics_by_id.remove(&subscription.id);
                self.handlers.remove(topic);
                self.transmit(Frame::unsubscribe(&subscription.id));
                info!("[CHAT] Unsubscribed from {}", topic);
            }
            None => warn!("[CHAT] No subscription found for {}", topic),
        }
    }

    fn handle_send(&mut self, destination: String, body: String) {
        if self.link.is_none() {
            warn!("[CHAT] Unable to send message. WebSocket is not connected.");
            return;
        }
        self.transmit(Frame::send(&destination, body));
        debug!("[CHAT] Message sent to destination: {}", destination);
    }

    fn transmit(&mut self, frame: Frame) {
        if let Some(link) = &self.link {
            if link.outgoing.send(frame).is_err() {
                warn!("[CHAT] Outgoing frame dropped, socket writer has stopped");
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        match frame.command {
            Command::Message => {
                let topic = frame
                    .get_header("subscription")
                    .and_then(|id| self.topics_by_id.get(id))
                    .or_else(|| {
                        frame
                            .get_header("destination")
                            .and_then(|d| self.subscriptions.get_key_value(d).map(|(k, _)| k))
                    })
                    .cloned();
                let Some(topic) = topic else {
                    debug!("[CHAT] MESSAGE for unknown subscription dropped");
                    return;
                };
                let Some(handler) = self.handlers.get(&topic).cloned() else {
                    return;
                };
                match message_parser::parse_chat_message(&frame) {
                    Ok(message) => handler(message),
                    Err(e) => warn!("[CHAT] Failed to parse message on {}: {}", topic, e),
                }
            }
            Command::Error => error!(
                "[CHAT] Server error: {}",
                frame.get_header("message").unwrap_or(frame.body.as_str())
            ),
            Command::Receipt => debug!("[CHAT] Receipt {:?}", frame.get_header("receipt-id")),
            other => debug!("[CHAT] Ignoring {} frame", other),
        }
    }

    fn teardown(&mut self) {
        if let Some(link) = self.link.take() {
            let _ = link.outgoing.send(Frame::disconnect());
        }
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        self.retry = None;
        self.subscriptions.clear();
        self.topics_by_id.clear();
        self.handlers.clear();
        // dropping the waiters fails their subscribe calls
        self.pending.clear();
        self.set_state(ConnectionState::Disconnected);
    }
}

async fn next_frame(incoming: Option<&mut mpsc::UnboundedReceiver<Frame>>) -> Option<Frame> {
    match incoming {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn join_attempt(attempt: &mut Option<JoinHandle<Result<Link, ChatError>>>) -> Result<Link, ChatError> {
    let Some(handle) = attempt.as_mut() else {
        return pending().await;
    };
    let result = match handle.await {
        Ok(result) => result,
        Err(e) => Err(ChatError::ConnectionFailed(format!("connect task failed: {}", e))),
    };
    *attempt = None;
    result
}

async fn retry_due(retry: &mut Option<Pin<Box<Sleep>>>) {
    let Some(timer) = retry.as_mut() else {
        return pending().await;
    };
    timer.as_mut().await;
    *retry = None;
}
