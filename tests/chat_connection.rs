use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration, Instant};

use donation_client::client::models::conversation::{Conversation, OWN_LABEL};
use donation_client::client::services::chat_connection::{
    ChatConnection, ChatError, ConnectionState, Snapshot,
};
use donation_client::client::services::chat_service::{conversation_topic, SEND_DESTINATION};
use donation_client::client::services::stomp::{Command, Frame};
use donation_client::client::services::websocket_client::{Connector, Link};
use donation_client::common::models::ChatMessage;

const INTERVAL: Duration = Duration::from_millis(5000);

#[derive(Default)]
struct BrokerState {
    attempt_times: Vec<Instant>,
    fail_next: usize,
    next_session: usize,
    /// session -> sender feeding that client's incoming frames
    sessions: HashMap<usize, mpsc::UnboundedSender<Frame>>,
    /// (session, subscription id, destination)
    subscriptions: Vec<(usize, String, String)>,
    received: Vec<Frame>,
}

/// In-memory STOMP broker. Routes `/app/chat` sends to the recipient's
/// per-sender queue, the way the chat server does.
#[derive(Clone, Default)]
struct Broker {
    state: Arc<Mutex<BrokerState>>,
}

impl Broker {
    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    fn connector(&self) -> BrokerConnector {
        BrokerConnector {
            broker: self.clone(),
        }
    }

    fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    fn attempts(&self) -> usize {
        self.lock().attempt_times.len()
    }

    fn attempt_times(&self) -> Vec<Instant> {
        self.lock().attempt_times.clone()
    }

    fn received(&self, command: Command) -> Vec<Frame> {
        self.lock()
            .received
            .iter()
            .filter(|f| f.command == command)
            .cloned()
            .collect()
    }

    fn live_subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .lock()
            .subscriptions
            .iter()
            .map(|(_, _, dest)| dest.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Drops every open session, as a server restart would.
    fn kill_all(&self) {
        let mut state = self.lock();
        state.sessions.clear();
        state.subscriptions.clear();
    }

    fn publish(&self, destination: &str, body: &str) {
        let state = self.lock();
        for (session, id, dest) in &state.subscriptions {
            if dest != destination {
                continue;
            }
            if let Some(tx) = state.sessions.get(session) {
                let frame = Frame::new(Command::Message)
                    .header("subscription", id.as_str())
                    .header("destination", dest.as_str())
                    .header("content-type", "application/json")
                    .with_body(body);
                let _ = tx.send(frame);
            }
        }
    }

    fn handle(&self, session: usize, frame: Frame) {
        self.lock().received.push(frame.clone());
        match frame.command {
            Command::Subscribe => {
                let id = frame.get_header("id").unwrap_or_default().to_string();
                let dest = frame.get_header("destination").unwrap_or_default().to_string();
                self.lock().subscriptions.push((session, id, dest));
            }
            Command::Unsubscribe => {
                let id = frame.get_header("id").unwrap_or_default().to_string();
                self.lock()
                    .subscriptions
                    .retain(|(s, sub, _)| !(*s == session && *sub == id));
            }
            Command::Send if frame.get_header("destination") == Some(SEND_DESTINATION) => {
                let message: ChatMessage = serde_json::from_str(&frame.body).unwrap();
                let queue = conversation_topic(&message.recipient_id, &message.sender_id);
                self.publish(&queue, &frame.body);
            }
            Command::Disconnect => {
                let mut state = self.lock();
                state.sessions.remove(&session);
                state.subscriptions.retain(|(s, _, _)| *s != session);
            }
            _ => {}
        }
    }
}

struct BrokerConnector {
    broker: Broker,
}

#[async_trait]
impl Connector for BrokerConnector {
    async fn open(&self) -> Result<Link, ChatError> {
        let session = {
            let mut state = self.broker.lock();
            state.attempt_times.push(Instant::now());
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(ChatError::ConnectionFailed("connection refused".into()));
            }
            state.next_session += 1;
            state.next_session
        };
        let (client, Link { outgoing, mut incoming }) = Link::pair();
        self.broker.lock().sessions.insert(session, outgoing);
        let broker = self.broker.clone();
        tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                broker.handle(session, frame);
            }
        });
        Ok(client)
    }
}

fn chat_json(from: &str, to: &str, content: &str) -> String {
    serde_json::to_string(&ChatMessage::outgoing(from, to, content)).unwrap()
}

/// Lets spawned tasks run to idle; the paused clock only moves afterwards.
async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

fn counter() -> (Arc<AtomicUsize>, impl Fn(ChatMessage) + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    (count, move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    })
}

#[tokio::test(start_paused = true)]
async fn connect_twice_opens_one_session() {
    let broker = Broker::default();
    let chat = ChatConnection::new(broker.connector(), INTERVAL);
    assert_eq!(chat.state(), ConnectionState::Disconnected);

    chat.connect().await.unwrap();
    chat.connect().await.unwrap();
    assert!(chat.is_connected());
    assert_eq!(broker.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_share_the_attempt() {
    let broker = Broker::default();
    let chat = ChatConnection::new(broker.connector(), INTERVAL);

    let other = chat.clone();
    let (a, b, c) = tokio::join!(chat.connect(), chat.connect(), other.connect());
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(broker.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_subscribe_keeps_first_handler() {
    let broker = Broker::default();
    let chat = ChatConnection::new(broker.connector(), INTERVAL);
    chat.connect().await.unwrap();

    let (first_count, first) = counter();
    let (second_count, second) = counter();
    let sub1 = chat.subscribe("/user/b/queue/messages/a", first).await.unwrap();
    let sub2 = chat.subscribe("/user/b/queue/messages/a", second).await.unwrap();
    assert_eq!(sub1, sub2);
    settle().await;

    assert_eq!(broker.received(Command::Subscribe).len(), 1);
    assert_eq!(chat.stored_handler_count().await.unwrap(), 1);

    broker.publish("/user/b/queue/messages/a", &chat_json("a", "b", "hi"));
    settle().await;
    assert_eq!(first_count.load(Ordering::SeqCst), 1);
    assert_eq!(second_count.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn subscribe_while_disconnected_waits_for_connection() {
    let broker = Broker::default();
    broker.fail_next(2);
    let chat = ChatConnection::new(broker.connector(), INTERVAL);
    let start = Instant::now();

    let (_, handler) = counter();
    let sub = chat.subscribe("/user/b/queue/messages/a", handler).await.unwrap();
    assert_eq!(sub.topic, "/user/b/queue/messages/a");
    assert!(start.elapsed() >= INTERVAL * 2);
    assert_eq!(broker.attempts(), 3);
    settle().await;
    assert_eq!(broker.received(Command::Subscribe).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn send_connects_first() {
    let broker = Broker::default();
    let chat = ChatConnection::new(broker.connector(), INTERVAL);

    chat.send(SEND_DESTINATION, chat_json("a", "b", "hello")).await;
    settle().await;

    assert!(chat.is_connected());
    let sends = broker.received(Command::Send);
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].get_header("destination"), Some(SEND_DESTINATION));
    let message: ChatMessage = serde_json::from_str(&sends[0].body).unwrap();
    assert_eq!(message.content, "hello");
}

#[tokio::test(start_paused = true)]
async fn failed_connects_retry_once_per_interval() {
    let broker = Broker::default();
    broker.fail_next(3);
    let chat = ChatConnection::new(broker.connector(), INTERVAL);

    // callers piling up during the retry cycle must not start extra loops
    let mut waiters = Vec::new();
    for _ in 0..5 {
        let c = chat.clone();
        waiters.push(tokio::spawn(async move { c.connect().await }));
    }
    let c = chat.clone();
    waiters.push(tokio::spawn(async move {
        c.send(SEND_DESTINATION, chat_json("a", "b", "queued")).await;
        Ok::<(), ChatError>(())
    }));
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }

    assert!(chat.is_connected());
    let times = broker.attempt_times();
    assert_eq!(times.len(), 4);
    for pair in times.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= INTERVAL, "retry after {:?}", gap);
        assert!(gap < INTERVAL + Duration::from_millis(50), "retry after {:?}", gap);
    }
}

#[tokio::test(start_paused = true)]
async fn reconnecting_state_while_waiting() {
    let broker = Broker::default();
    broker.fail_next(1);
    let chat = ChatConnection::new(broker.connector(), INTERVAL);

    let c = chat.clone();
    let waiter = tokio::spawn(async move { c.connect().await });
    settle().await;
    assert_eq!(chat.state(), ConnectionState::Reconnecting);
    assert_eq!(broker.attempts(), 1);

    waiter.await.unwrap().unwrap();
    assert_eq!(chat.state(), ConnectionState::Connected);
    assert_eq!(broker.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_resubscribes_stored_handlers() {
    let broker = Broker::default();
    let chat = ChatConnection::new(broker.connector(), INTERVAL);
    let (count, handler) = counter();
    chat.subscribe("/user/b/queue/messages/a", handler).await.unwrap();
    chat.subscribe("/user/b/queue/messages/c", |_| {}).await.unwrap();
    settle().await;

    broker.kill_all();
    let dropped_at = Instant::now();
    settle().await;
    assert_eq!(chat.state(), ConnectionState::Reconnecting);
    assert!(chat.subscribed_topics().await.unwrap().is_empty());
    assert_eq!(chat.stored_handler_count().await.unwrap(), 2);

    chat.wait_connected().await.unwrap();
    assert!(dropped_at.elapsed() >= INTERVAL);
    settle().await;
    assert_eq!(broker.attempts(), 2);
    assert_eq!(
        broker.live_subscriptions(),
        vec!["/user/b/queue/messages/a", "/user/b/queue/messages/c"]
    );
    assert_eq!(
        chat.subscribed_topics().await.unwrap(),
        vec!["/user/b/queue/messages/a", "/user/b/queue/messages/c"]
    );

    broker.publish("/user/b/queue/messages/a", &chat_json("a", "b", "back"));
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_retries_each_interval_until_back() {
    let broker = Broker::default();
    let chat = ChatConnection::new(broker.connector(), INTERVAL);
    chat.subscribe("/user/b/queue/messages/a", |_| {}).await.unwrap();
    settle().await;

    broker.fail_next(3);
    broker.kill_all();
    let dropped_at = Instant::now();
    settle().await;
    assert_eq!(chat.state(), ConnectionState::Reconnecting);
    chat.wait_connected().await.unwrap();

    let times = broker.attempt_times();
    assert_eq!(times.len(), 5);
    assert!(times[1] - dropped_at >= INTERVAL);
    for pair in times[1..].windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= INTERVAL, "retry after {:?}", gap);
        assert!(gap < INTERVAL + Duration::from_millis(50), "retry after {:?}", gap);
    }
    settle().await;
    assert_eq!(broker.live_subscriptions(), vec!["/user/b/queue/messages/a"]);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_forgets_topic() {
    let broker = Broker::default();
    let chat = ChatConnection::new(broker.connector(), INTERVAL);
    let (count, handler) = counter();
    let sub = chat.subscribe("/user/b/queue/messages/a", handler).await.unwrap();

    chat.unsubscribe("/user/b/queue/messages/a");
    // unknown topic: logged and ignored
    chat.unsubscribe("/user/b/queue/messages/nobody");
    settle().await;

    let unsubs = broker.received(Command::Unsubscribe);
    assert_eq!(unsubs.len(), 1);
    assert_eq!(unsubs[0].get_header("id"), Some(sub.id.as_str()));
    assert_eq!(chat.snapshot().await.unwrap(), Snapshot::default());

    broker.publish("/user/b/queue/messages/a", &chat_json("a", "b", "late"));
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_clears_everything_and_stops_retrying() {
    let broker = Broker::default();
    let chat = ChatConnection::new(broker.connector(), INTERVAL);
    chat.subscribe("/user/b/queue/messages/a", |_| {}).await.unwrap();
    chat.subscribe("/user/b/queue/messages/c", |_| {}).await.unwrap();

    chat.disconnect().await;
    settle().await;
    assert_eq!(chat.state(), ConnectionState::Disconnected);
    assert_eq!(chat.snapshot().await.unwrap(), Snapshot::default());
    assert_eq!(broker.received(Command::Disconnect).len(), 1);

    sleep(INTERVAL * 4).await;
    assert_eq!(broker.attempts(), 1);
    assert_eq!(chat.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_subscribe_and_retry() {
    let broker = Broker::default();
    broker.fail_next(usize::MAX);
    let chat = ChatConnection::new(broker.connector(), INTERVAL);

    let c = chat.clone();
    let pending = tokio::spawn(async move { c.subscribe("/user/b/queue/messages/a", |_| {}).await });
    sleep(INTERVAL + Duration::from_millis(100)).await;
    assert_eq!(broker.attempts(), 2);

    chat.disconnect().await;
    assert!(matches!(pending.await.unwrap(), Err(ChatError::Disconnected)));

    sleep(INTERVAL * 3).await;
    assert_eq!(broker.attempts(), 2);
    assert_eq!(chat.stored_handler_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_drops_waiting_sends_and_connects() {
    let broker = Broker::default();
    broker.fail_next(usize::MAX);
    let chat = ChatConnection::new(broker.connector(), INTERVAL);

    let c = chat.clone();
    let send = tokio::spawn(async move {
        c.send(SEND_DESTINATION, chat_json("a", "b", "stale")).await;
    });
    let c = chat.clone();
    let connect = tokio::spawn(async move { c.connect().await });
    sleep(INTERVAL + Duration::from_millis(100)).await;

    chat.disconnect().await;
    timeout(INTERVAL, send).await.unwrap().unwrap();
    let result = timeout(INTERVAL, connect).await.unwrap().unwrap();
    assert!(matches!(result, Err(ChatError::Disconnected)));

    broker.fail_next(0);
    chat.connect().await.unwrap();
    settle().await;
    assert!(broker.received(Command::Send).is_empty());
}

#[tokio::test(start_paused = true)]
async fn wait_connected_fails_on_disconnect() {
    let broker = Broker::default();
    let chat = ChatConnection::new(broker.connector(), INTERVAL);

    let c = chat.clone();
    let waiter = tokio::spawn(async move { c.wait_connected().await });
    settle().await;
    chat.disconnect().await;
    let result = timeout(INTERVAL, waiter).await.unwrap().unwrap();
    assert!(matches!(result, Err(ChatError::Disconnected)));
}

#[tokio::test(start_paused = true)]
async fn connect_after_disconnect_starts_fresh() {
    let broker = Broker::default();
    let chat = ChatConnection::new(broker.connector(), INTERVAL);
    chat.subscribe("/user/b/queue/messages/a", |_| {}).await.unwrap();
    chat.disconnect().await;

    chat.connect().await.unwrap();
    assert!(chat.is_connected());
    assert_eq!(broker.attempts(), 2);
    assert!(chat.subscribed_topics().await.unwrap().is_empty());

    chat.subscribe("/user/b/queue/messages/c", |_| {}).await.unwrap();
    settle().await;
    assert_eq!(broker.live_subscriptions(), vec!["/user/b/queue/messages/c"]);
}

#[tokio::test(start_paused = true)]
async fn conversation_delivers_between_two_users() {
    let broker = Broker::default();
    let alice_chat = ChatConnection::new(broker.connector(), INTERVAL);
    let bob_chat = ChatConnection::new(broker.connector(), INTERVAL);

    let alice = Conversation::new("alice@x.io", "bob@x.io", "Bob");
    let bob = Conversation::new("bob@x.io", "alice@x.io", "Alice");
    alice.open(&alice_chat).await.unwrap();
    bob.open(&bob_chat).await.unwrap();
    settle().await;

    let sent = alice.send_text(&alice_chat, "is the desk still free?").await.unwrap();
    assert!(sent.is_some());
    assert_eq!(alice.send_text(&alice_chat, "   ").await.unwrap(), None);
    settle().await;

    let own = alice.entries();
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].sender, OWN_LABEL);

    let received = bob.entries();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].sender, "Alice");
    assert_eq!(received[0].content, "is the desk still free?");

    bob.send_text(&bob_chat, "yes, come by").await.unwrap();
    settle().await;
    let thread = alice.entries();
    assert_eq!(thread.len(), 2);
    assert_eq!(thread[1].sender, "Bob");

    bob.close(&bob_chat);
    alice.send_text(&alice_chat, "thanks").await.unwrap();
    settle().await;
    assert_eq!(bob.len(), 2);
}
