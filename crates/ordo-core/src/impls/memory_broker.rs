//! InMemoryBroker - 開発用・テスト用のメッセージブローカー
//!
//! AMQP (RabbitMQ) の振る舞いのうち、スケジューラが依存する部分だけを再現する:
//! - durable queue / persistent message は `restart()` を跨いで残る
//! - `x-max-priority` 付きキューは priority 降順、同一 priority 内は FIFO
//! - `x-message-ttl` + `x-dead-letter-routing-key` で期限切れメッセージを転送
//! - `x-expires`: 一定時間使われず空のキューは削除される
//! - manual ack / reject(requeue)、consumer ごとの prefetch
//! - channel transaction (`tx_select` / `tx_commit` / `tx_rollback`)
//! - 接続が切れたら未 ack のメッセージは redelivered 付きでキューに戻る
//!
//! # 実装詳細
//! - 共有状態は `Arc<Mutex<BrokerState>>`、待機は `Notify` + `sleep_until`
//!   (TTL の期限が次の起床時刻)
//! - 時刻は `tokio::time::Instant` なので paused time のテストで TTL を進められる
//! - requeue されたメッセージは元の到着順 (seq) を保つので先頭に戻る

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::TransportError;
use crate::ports::{Delivery, OutboundMessage, QueueDeclaration, Subscription, Transport};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    priority: u8,
    persistent: bool,
    redelivered: bool,
    /// Dead-letter deadline; set while the message sits in a TTL queue.
    expires_at: Option<Instant>,
}

/// Ready messages keyed by (priority descending, arrival).
type ReadyKey = (Reverse<u8>, u64);

struct QueueState {
    declaration: QueueDeclaration,
    ready: BTreeMap<ReadyKey, StoredMessage>,
    /// Last declare or consume; drives `declaration.expires`.
    last_used: Instant,
}

impl QueueState {
    fn new(declaration: QueueDeclaration, now: Instant) -> Self {
        Self {
            declaration,
            ready: BTreeMap::new(),
            last_used: now,
        }
    }

    fn is_idle_expired(&self, now: Instant) -> bool {
        self.ready.is_empty()
            && self
                .declaration
                .expires
                .and_then(|idle| self.last_used.checked_add(idle))
                .is_some_and(|at| at <= now)
    }

    fn effective_priority(&self, priority: u8) -> u8 {
        match self.declaration.max_priority {
            Some(max) => priority.min(max),
            None => 0,
        }
    }

    fn push(&mut self, seq: u64, message: StoredMessage) {
        let key = (Reverse(self.effective_priority(message.priority)), seq);
        self.ready.insert(key, message);
    }

    fn pop(&mut self) -> Option<(u64, StoredMessage)> {
        self.ready
            .pop_first()
            .map(|((_, seq), message)| (seq, message))
    }
}

struct Unacked {
    connection: u64,
    consumer: u64,
    queue: String,
    seq: u64,
    message: StoredMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Handle {
    id: u64,
    epoch: u64,
}

struct BrokerState {
    available: bool,
    /// Bumped on restart; handles from an older epoch are dead.
    epoch: u64,
    queues: HashMap<String, QueueState>,
    open_connections: HashSet<u64>,
    unacked: HashMap<u64, Unacked>,
    next_seq: u64,
    next_tag: u64,
    next_connection: u64,
    next_consumer: u64,
    failing_commits: usize,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            available: true,
            epoch: 0,
            queues: HashMap::new(),
            open_connections: HashSet::new(),
            unacked: HashMap::new(),
            next_seq: 1,
            next_tag: 1,
            next_connection: 1,
            next_consumer: 1,
            failing_commits: 0,
        }
    }

    fn is_live(&self, handle: Handle) -> bool {
        handle.epoch == self.epoch && self.open_connections.contains(&handle.id)
    }

    fn ensure_live(&self, handle: Option<Handle>) -> Result<Handle, TransportError> {
        match handle {
            Some(h) if self.is_live(h) => Ok(h),
            _ => Err(TransportError::ConnectionClosed),
        }
    }

    fn ensure_queue(&self, name: &str) -> Result<(), TransportError> {
        if self.queues.contains_key(name) {
            Ok(())
        } else {
            Err(TransportError::UnknownQueue(name.to_string()))
        }
    }

    /// Append a message to `queue`, starting its TTL if the queue has one.
    fn route(
        &mut self,
        queue: &str,
        mut message: StoredMessage,
        now: Instant,
    ) -> Result<(), TransportError> {
        let seq = self.next_seq;
        let q = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
        message.expires_at = q.declaration.message_ttl.map(|ttl| now + ttl);
        q.push(seq, message);
        self.next_seq += 1;
        Ok(())
    }

    /// Dead-letter every expired message, then drop queues that have
    /// outlived their idle expiry. Returns whether any message moved.
    fn expire(&mut self, now: Instant) -> bool {
        let moved = self.dead_letter(now);
        self.drop_idle_queues(now);
        moved
    }

    fn drop_idle_queues(&mut self, now: Instant) {
        let in_flight: HashSet<String> = self.unacked.values().map(|u| u.queue.clone()).collect();
        self.queues.retain(|name, q| {
            let keep = in_flight.contains(name) || !q.is_idle_expired(now);
            if !keep {
                tracing::debug!(queue = %name, "idle queue expired");
            }
            keep
        });
    }

    fn dead_letter(&mut self, now: Instant) -> bool {
        let mut expired: Vec<(u64, Option<String>, StoredMessage)> = Vec::new();
        for q in self.queues.values_mut() {
            if q.declaration.message_ttl.is_none() {
                continue;
            }
            let keys: Vec<ReadyKey> = q
                .ready
                .iter()
                .filter(|(_, m)| m.expires_at.is_some_and(|at| at <= now))
                .map(|(key, _)| *key)
                .collect();
            for key in keys {
                if let Some(message) = q.ready.remove(&key) {
                    expired.push((key.1, q.declaration.dead_letter_routing_key.clone(), message));
                }
            }
        }
        if expired.is_empty() {
            return false;
        }

        // expiry keeps arrival order
        expired.sort_by_key(|(seq, _, _)| *seq);
        for (_, target, message) in expired {
            let Some(target) = target else {
                continue;
            };
            if let Err(err) = self.route(&target, message, now) {
                tracing::warn!(error = %err, "dead-lettered message dropped");
            }
        }
        true
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.queues
            .values()
            .flat_map(|q| q.ready.values())
            .filter_map(|m| m.expires_at)
            .min()
    }

    fn in_flight(&self, consumer: u64) -> usize {
        self.unacked
            .values()
            .filter(|u| u.consumer == consumer)
            .count()
    }

    fn requeue(&mut self, unacked: Unacked) {
        let Unacked {
            queue,
            seq,
            mut message,
            ..
        } = unacked;
        message.redelivered = true;
        if let Some(q) = self.queues.get_mut(&queue) {
            q.push(seq, message);
        }
    }

    /// Close a connection: everything it had not settled goes back.
    fn drop_connection(&mut self, id: u64) {
        self.open_connections.remove(&id);
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.connection == id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(u) = self.unacked.remove(&tag) {
                self.requeue(u);
            }
        }
    }

    /// Kill every connection at once (broker crash or shutdown).
    fn drop_all_connections(&mut self) {
        self.epoch += 1;
        self.open_connections.clear();
        let unacked: Vec<Unacked> = self.unacked.drain().map(|(_, u)| u).collect();
        for u in unacked {
            self.requeue(u);
        }
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
}

/// Shared broker. Cloning gives another handle on the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// A new, not yet opened connection.
    pub fn connection(&self) -> InMemoryConnection {
        InMemoryConnection {
            broker: Arc::clone(&self.inner),
            channel: Mutex::new(Channel::default()),
        }
    }

    /// Refuse (or accept again) new connections. Going offline kills every
    /// open connection.
    pub async fn set_available(&self, available: bool) {
        let mut state = self.inner.state.lock().await;
        state.available = available;
        if !available {
            state.drop_all_connections();
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Simulate a broker crash and restart: connections die, only durable
    /// queues and persistent messages survive.
    pub async fn restart(&self) {
        let mut state = self.inner.state.lock().await;
        state.drop_all_connections();
        state.queues.retain(|_, q| q.declaration.durable);
        for q in state.queues.values_mut() {
            q.ready.retain(|_, m| m.persistent);
        }
        state.failing_commits = 0;
        drop(state);
        tracing::info!("in-memory broker restarted");
        self.inner.notify.notify_waiters();
    }

    /// Make the next `n` transaction commits fail.
    pub async fn fail_next_commits(&self, n: usize) {
        self.inner.state.lock().await.failing_commits = n;
    }

    /// Messages waiting in `queue` (not delivered, not expired).
    pub async fn ready_count(&self, queue: &str) -> usize {
        let mut state = self.inner.state.lock().await;
        if state.expire(Instant::now()) {
            self.inner.notify.notify_waiters();
        }
        state.queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Delivered but not yet settled, across all queues.
    pub async fn unacked_count(&self) -> usize {
        self.inner.state.lock().await.unacked.len()
    }

    pub async fn queue_names(&self) -> Vec<String> {
        let mut state = self.inner.state.lock().await;
        if state.expire(Instant::now()) {
            self.inner.notify.notify_waiters();
        }
        let mut names: Vec<String> = state.queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn queue_declaration(&self, queue: &str) -> Option<QueueDeclaration> {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map(|q| q.declaration.clone())
    }

    /// Bodies waiting in `queue`, in delivery order.
    pub async fn peek(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.inner.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.ready.values().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct Channel {
    handle: Option<Handle>,
    /// Publishes buffered in transaction mode.
    tx: Option<Vec<(String, OutboundMessage)>>,
}

/// One connection (with one channel) to an `InMemoryBroker`.
pub struct InMemoryConnection {
    broker: Arc<BrokerInner>,
    channel: Mutex<Channel>,
}

#[async_trait]
impl Transport for InMemoryConnection {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut channel = self.channel.lock().await;
        let mut state = self.broker.state.lock().await;

        if channel.handle.is_some_and(|h| state.is_live(h)) {
            return Ok(());
        }
        if !state.available {
            return Err(TransportError::Unavailable(
                "broker is not accepting connections".to_string(),
            ));
        }

        let id = state.next_connection;
        state.next_connection += 1;
        state.open_connections.insert(id);
        channel.handle = Some(Handle {
            id,
            epoch: state.epoch,
        });
        channel.tx = None;
        tracing::debug!(connection = id, "connection opened");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut channel = self.channel.lock().await;
        channel.tx = None;
        let Some(handle) = channel.handle.take() else {
            return Ok(());
        };

        let mut state = self.broker.state.lock().await;
        if state.is_live(handle) {
            state.drop_connection(handle.id);
            drop(state);
            self.broker.notify.notify_waiters();
            tracing::debug!(connection = handle.id, "connection closed");
        }
        Ok(())
    }

    async fn is_open(&self) -> bool {
        let channel = self.channel.lock().await;
        let state = self.broker.state.lock().await;
        channel.handle.is_some_and(|h| state.is_live(h))
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), TransportError> {
        let channel = self.channel.lock().await;
        let mut state = self.broker.state.lock().await;
        state.ensure_live(channel.handle)?;

        let now = Instant::now();
        match state.queues.get_mut(&declaration.name) {
            Some(existing) if existing.declaration == *declaration => {
                existing.last_used = now;
                Ok(())
            }
            Some(_) => Err(TransportError::PreconditionFailed(
                declaration.name.clone(),
            )),
            None => {
                state.queues.insert(
                    declaration.name.clone(),
                    QueueState::new(declaration.clone(), now),
                );
                tracing::debug!(queue = %declaration.name, "queue declared");
                Ok(())
            }
        }
    }

    async fn tx_select(&self) -> Result<(), TransportError> {
        let mut channel = self.channel.lock().await;
        let state = self.broker.state.lock().await;
        state.ensure_live(channel.handle)?;
        channel.tx.get_or_insert_with(Vec::new);
        Ok(())
    }

    async fn tx_commit(&self) -> Result<(), TransportError> {
        let mut channel = self.channel.lock().await;
        let mut state = self.broker.state.lock().await;
        state.ensure_live(channel.handle)?;

        let Some(pending) = channel.tx.as_mut() else {
            return Ok(());
        };
        let pending = std::mem::take(pending);

        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(TransportError::CommitFailed(
                "injected commit failure".to_string(),
            ));
        }
        // all or nothing
        for (routing_key, _) in &pending {
            state.ensure_queue(routing_key)?;
        }

        let now = Instant::now();
        for (routing_key, message) in pending {
            state.route(&routing_key, stored(message), now)?;
        }
        drop(state);
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn tx_rollback(&self) -> Result<(), TransportError> {
        let mut channel = self.channel.lock().await;
        let state = self.broker.state.lock().await;
        state.ensure_live(channel.handle)?;
        if let Some(pending) = channel.tx.as_mut() {
            pending.clear();
        }
        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        let mut channel = self.channel.lock().await;
        let mut state = self.broker.state.lock().await;
        state.ensure_live(channel.handle)?;
        state.ensure_queue(routing_key)?;

        if let Some(pending) = channel.tx.as_mut() {
            pending.push((routing_key.to_string(), message));
            return Ok(());
        }

        state.route(routing_key, stored(message), Instant::now())?;
        drop(state);
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let channel = self.channel.lock().await;
        let mut state = self.broker.state.lock().await;
        let handle = state.ensure_live(channel.handle)?;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
        q.last_used = Instant::now();

        let consumer = state.next_consumer;
        state.next_consumer += 1;
        Ok(Box::new(InMemorySubscription {
            broker: Arc::clone(&self.broker),
            handle,
            consumer,
            queue: queue.to_string(),
            prefetch: usize::from(prefetch.max(1)),
        }))
    }
}

fn stored(message: OutboundMessage) -> StoredMessage {
    StoredMessage {
        body: message.body,
        priority: message.priority,
        persistent: message.persistent,
        redelivered: false,
        expires_at: None,
    }
}

struct InMemorySubscription {
    broker: Arc<BrokerInner>,
    handle: Handle,
    consumer: u64,
    queue: String,
    prefetch: usize,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Option<Box<dyn Delivery>> {
        loop {
            // register before checking so a notify in between is not lost
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.broker.state.lock().await;
                if !state.is_live(self.handle) {
                    return None;
                }
                if state.expire(Instant::now()) {
                    self.broker.notify.notify_waiters();
                }

                if state.in_flight(self.consumer) < self.prefetch
                    && let Some((seq, message)) = state
                        .queues
                        .get_mut(&self.queue)
                        .and_then(QueueState::pop)
                {
                    let tag = state.next_tag;
                    state.next_tag += 1;
                    let delivery = InMemoryDelivery {
                        broker: Arc::clone(&self.broker),
                        handle: self.handle,
                        tag,
                        body: message.body.clone(),
                        redelivered: message.redelivered,
                    };
                    state.unacked.insert(
                        tag,
                        Unacked {
                            connection: self.handle.id,
                            consumer: self.consumer,
                            queue: self.queue.clone(),
                            seq,
                            message,
                        },
                    );
                    return Some(Box::new(delivery));
                }

                state.next_expiry()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = tokio::time::sleep_until(at) => {},
                    }
                }
                None => notified.await,
            }
        }
    }
}

struct InMemoryDelivery {
    broker: Arc<BrokerInner>,
    handle: Handle,
    tag: u64,
    body: Vec<u8>,
    redelivered: bool,
}

impl InMemoryDelivery {
    async fn settle(self: Box<Self>, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock().await;
        if !state.is_live(self.handle) {
            // already returned to the queue when the connection died
            return Err(TransportError::ConnectionClosed);
        }
        let unacked = state
            .unacked
            .remove(&self.tag)
            .ok_or(TransportError::UnknownDeliveryTag(self.tag))?;
        if requeue {
            state.requeue(unacked);
        }
        drop(state);
        self.broker.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn delivery_tag(&self) -> u64 {
        self.tag
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.settle(false).await
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), TransportError> {
        self.settle(requeue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const LIVE: &str = "live";

    async fn open(broker: &InMemoryBroker) -> InMemoryConnection {
        let conn = broker.connection();
        conn.connect().await.unwrap();
        conn.declare_queue(&QueueDeclaration::durable(LIVE).with_max_priority(3))
            .await
            .unwrap();
        conn
    }

    fn msg(body: &str, priority: u8) -> OutboundMessage {
        OutboundMessage::persistent(body.as_bytes().to_vec(), priority)
    }

    async fn next_body(sub: &mut Box<dyn Subscription>) -> Box<dyn Delivery> {
        tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("delivery expected")
            .expect("connection open")
    }

    #[tokio::test]
    async fn delivers_by_priority_then_fifo() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker).await;
        for (body, p) in [("a", 1), ("b", 3), ("c", 3), ("d", 2)] {
            conn.publish(LIVE, msg(body, p)).await.unwrap();
        }

        let mut sub = conn.consume(LIVE, 1).await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..4 {
            let d = next_body(&mut sub).await;
            seen.push(String::from_utf8(d.body().to_vec()).unwrap());
            d.ack().await.unwrap();
        }
        assert_eq!(seen, ["b", "c", "d", "a"]);
    }

    #[tokio::test]
    async fn priority_is_capped_at_queue_maximum() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker).await;
        conn.publish(LIVE, msg("max", 3)).await.unwrap();
        conn.publish(LIVE, msg("over", 9)).await.unwrap();

        let bodies = broker.peek(LIVE).await;
        assert_eq!(bodies, vec![b"max".to_vec(), b"over".to_vec()]);
    }

    #[tokio::test]
    async fn prefetch_one_holds_back_until_ack() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker).await;
        conn.publish(LIVE, msg("first", 2)).await.unwrap();
        conn.publish(LIVE, msg("second", 2)).await.unwrap();

        let mut sub = conn.consume(LIVE, 1).await.unwrap();
        let first = next_body(&mut sub).await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
        assert!(blocked.is_err());

        first.ack().await.unwrap();
        let second = next_body(&mut sub).await;
        assert_eq!(second.body(), b"second");
    }

    #[tokio::test]
    async fn reject_with_requeue_returns_to_head_as_redelivered() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker).await;
        conn.publish(LIVE, msg("x", 2)).await.unwrap();
        conn.publish(LIVE, msg("y", 2)).await.unwrap();

        let mut sub = conn.consume(LIVE, 1).await.unwrap();
        let x = next_body(&mut sub).await;
        assert!(!x.redelivered());
        x.reject(true).await.unwrap();

        let again = next_body(&mut sub).await;
        assert_eq!(again.body(), b"x");
        assert!(again.redelivered());
    }

    #[tokio::test]
    async fn reject_without_requeue_drops_message() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker).await;
        conn.publish(LIVE, msg("x", 2)).await.unwrap();

        let mut sub = conn.consume(LIVE, 1).await.unwrap();
        next_body(&mut sub).await.reject(false).await.unwrap();

        assert_eq!(broker.ready_count(LIVE).await, 0);
        assert_eq!(broker.unacked_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_queue_dead_letters_into_live_queue() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker).await;
        let delay = QueueDeclaration::durable("live.delay.5000")
            .with_dead_letter(Duration::from_secs(5), LIVE);
        conn.declare_queue(&delay).await.unwrap();
        conn.publish("live.delay.5000", msg("later", 3)).await.unwrap();

        let start = Instant::now();
        let mut sub = conn.consume(LIVE, 1).await.unwrap();

        let early = tokio::time::timeout(Duration::from_secs(4), sub.next()).await;
        assert!(early.is_err());

        let d = sub.next().await.unwrap();
        assert_eq!(d.body(), b"later");
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(broker.ready_count("live.delay.5000").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_empty_queue_expires() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker).await;
        let delay = QueueDeclaration::durable("live.delay.5000")
            .with_dead_letter(Duration::from_secs(5), LIVE)
            .with_expiry(Duration::from_secs(10));
        conn.declare_queue(&delay).await.unwrap();
        conn.publish("live.delay.5000", msg("later", 2)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(broker.ready_count(LIVE).await, 1);
        assert!(broker.queue_names().await.contains(&"live.delay.5000".to_string()));

        // redeclaring counts as use
        conn.declare_queue(&delay).await.unwrap();
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(broker.queue_names().await.contains(&"live.delay.5000".to_string()));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(broker.queue_names().await, vec![LIVE.to_string()]);
        assert_eq!(broker.ready_count(LIVE).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_holding_messages_is_not_expired() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker).await;
        let slow = QueueDeclaration::durable("live.delay.30000")
            .with_dead_letter(Duration::from_secs(30), LIVE)
            .with_expiry(Duration::from_secs(1));
        conn.declare_queue(&slow).await.unwrap();
        conn.publish("live.delay.30000", msg("held", 2)).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(broker.ready_count("live.delay.30000").await, 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(broker.queue_names().await, vec![LIVE.to_string()]);
        assert_eq!(broker.ready_count(LIVE).await, 1);
    }

    #[tokio::test]
    async fn failed_commit_publishes_nothing() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker).await;
        broker.fail_next_commits(1).await;

        conn.tx_select().await.unwrap();
        conn.publish(LIVE, msg("a", 2)).await.unwrap();
        conn.publish(LIVE, msg("b", 2)).await.unwrap();
        assert_eq!(broker.ready_count(LIVE).await, 0);

        assert!(matches!(
            conn.tx_commit().await,
            Err(TransportError::CommitFailed(_))
        ));
        assert_eq!(broker.ready_count(LIVE).await, 0);

        conn.publish(LIVE, msg("c", 2)).await.unwrap();
        conn.tx_commit().await.unwrap();
        assert_eq!(broker.peek(LIVE).await, vec![b"c".to_vec()]);
    }

    #[tokio::test]
    async fn rollback_discards_buffered_publishes() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker).await;
        conn.tx_select().await.unwrap();
        conn.publish(LIVE, msg("a", 2)).await.unwrap();
        conn.tx_rollback().await.unwrap();
        conn.tx_commit().await.unwrap();
        assert_eq!(broker.ready_count(LIVE).await, 0);
    }

    #[tokio::test]
    async fn closing_a_connection_requeues_unsettled_deliveries() {
        let broker = InMemoryBroker::new();
        let worker = open(&broker).await;
        worker.publish(LIVE, msg("job", 2)).await.unwrap();

        let mut sub = worker.consume(LIVE, 1).await.unwrap();
        let d = next_body(&mut sub).await;
        worker.close().await.unwrap();
        worker.close().await.unwrap();

        assert!(sub.next().await.is_none());
        assert!(matches!(d.ack().await, Err(TransportError::ConnectionClosed)));

        let other = open(&broker).await;
        let mut sub = other.consume(LIVE, 1).await.unwrap();
        let again = next_body(&mut sub).await;
        assert_eq!(again.body(), b"job");
        assert!(again.redelivered());
    }

    #[tokio::test]
    async fn restart_keeps_durable_queues_and_persistent_messages() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker).await;
        let mut scratch = QueueDeclaration::durable("scratch");
        scratch.durable = false;
        conn.declare_queue(&scratch).await.unwrap();

        conn.publish(LIVE, msg("kept", 2)).await.unwrap();
        let mut transient = msg("lost", 2);
        transient.persistent = false;
        conn.publish(LIVE, transient).await.unwrap();
        conn.publish("scratch", msg("gone", 2)).await.unwrap();

        broker.restart().await;

        assert!(!conn.is_open().await);
        assert!(matches!(
            conn.publish(LIVE, msg("x", 2)).await,
            Err(TransportError::ConnectionClosed)
        ));
        conn.connect().await.unwrap();
        assert_eq!(broker.queue_names().await, vec![LIVE.to_string()]);
        assert_eq!(broker.peek(LIVE).await, vec![b"kept".to_vec()]);
    }

    #[tokio::test]
    async fn offline_broker_refuses_connections() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker).await;

        broker.set_available(false).await;
        assert!(!conn.is_open().await);
        assert!(matches!(
            conn.connect().await,
            Err(TransportError::Unavailable(_))
        ));

        broker.set_available(true).await;
        conn.connect().await.unwrap();
        conn.connect().await.unwrap();
        assert!(conn.is_open().await);
    }

    #[tokio::test]
    async fn redeclare_with_other_arguments_fails() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker).await;
        let err = conn
            .declare_queue(&QueueDeclaration::durable(LIVE))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::PreconditionFailed(LIVE.to_string()));
    }

    #[tokio::test]
    async fn publish_to_unknown_queue_is_an_error() {
        let broker = InMemoryBroker::new();
        let conn = open(&broker).await;
        assert_eq!(
            conn.publish("nowhere", msg("x", 1)).await,
            Err(TransportError::UnknownQueue("nowhere".to_string()))
        );
    }
}
