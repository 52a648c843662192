mod amqp;

pub use amqp::AmqpConnector;

use crate::error::BrokerError;
use crate::stats::PipelineStats;
use crate::telemetry::InboundRecord;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

impl ExchangeKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "direct" => Some(Self::Direct),
            "topic" => Some(Self::Topic),
            "fanout" => Some(Self::Fanout),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Fanout => "fanout",
        }
    }
}

/// Broker objects a consumer declares before subscribing. Declaration is
/// idempotent, so every (re)connect declares the full topology again.
#[derive(Clone, Debug)]
pub struct Topology {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub queue: String,
    pub routing_key: String,
    /// Pre-existing exchanges the queue is additionally bound to with the same routing key.
    pub extra_bindings: Vec<String>,
    pub dead_letter_exchange: Option<String>,
    pub prefetch: u16,
}

impl Topology {
    pub fn new(exchange: &str, exchange_kind: ExchangeKind, queue: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            exchange_kind,
            queue: queue.to_string(),
            routing_key: queue.to_string(),
            extra_bindings: Vec::new(),
            dead_letter_exchange: None,
            prefetch: 10,
        }
    }
}

/// What happens to a delivery whose body cannot be decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MalformedPolicy {
    Requeue,
    Discard,
    /// Requeue while the message has been delivered fewer than N times.
    RequeueUpTo(u32),
}

impl MalformedPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        let value = raw.trim().to_ascii_lowercase();
        match value.as_str() {
            "requeue" => Some(Self::Requeue),
            "discard" | "drop" | "dead-letter" => Some(Self::Discard),
            _ => {
                let limit = value.strip_prefix("requeue:")?.trim().parse::<u32>().ok()?;
                Some(Self::RequeueUpTo(limit.max(1)))
            }
        }
    }

    pub fn requeue(&self, delivery_count: u32) -> bool {
        match self {
            Self::Requeue => true,
            Self::Discard => false,
            Self::RequeueUpTo(limit) => delivery_count < *limit,
        }
    }
}

const MAX_TRACKED_REJECTIONS: usize = 4096;

/// Local delivery counts for rejected messages. Classic queues only report
/// whether a message was redelivered, so the broker count stalls at 2.
#[derive(Debug, Default)]
struct RejectTracker {
    counts: HashMap<u64, u32>,
}

impl RejectTracker {
    /// Records one more rejection of `key` and returns the larger of the local
    /// and broker-reported delivery counts.
    fn attempt(&mut self, key: u64, delivery_count: u32) -> u32 {
        if self.counts.len() >= MAX_TRACKED_REJECTIONS && !self.counts.contains_key(&key) {
            tracing::debug!(tracked = self.counts.len(), "resetting rejection counts");
            self.counts.clear();
        }
        let seen = self.counts.entry(key).or_insert(0);
        *seen = seen.saturating_add(1).max(delivery_count);
        *seen
    }

    fn forget(&mut self, key: u64) {
        self.counts.remove(&key);
    }
}

fn rejection_key(message_id: Option<&str>, body: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    match message_id {
        Some(id) => (0u8, id).hash(&mut hasher),
        None => (1u8, body).hash(&mut hasher),
    }
    hasher.finish()
}

#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

pub struct Delivery {
    pub body: Vec<u8>,
    /// 1 on first delivery.
    pub delivery_count: u32,
    pub message_id: Option<String>,
    pub acker: Box<dyn Acker>,
}

#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn close(&self);
}

/// A live subscription: the delivery stream plus a notification that fires
/// when the underlying connection is lost.
pub struct Session {
    pub deliveries: BoxStream<'static, Result<Delivery, BrokerError>>,
    pub closed: oneshot::Receiver<BrokerError>,
    pub handle: Arc<dyn SessionHandle>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, topology: &Topology, consumer_tag: &str)
        -> Result<Session, BrokerError>;
}

#[derive(Clone, Debug)]
pub struct ConsumerSettings {
    pub name: String,
    pub topology: Topology,
    pub connect_attempts: u32,
    pub connect_delay: Duration,
    pub reconnect_delay: Duration,
    pub malformed_policy: MalformedPolicy,
}

enum Interrupted {
    Cancelled,
    Lost(String),
}

pub struct QueueConsumer<C> {
    connector: C,
    settings: ConsumerSettings,
    stats: Arc<PipelineStats>,
    consumer_tag: String,
    closing: AtomicBool,
    pending: Mutex<Option<Session>>,
    active: Mutex<Option<Arc<dyn SessionHandle>>>,
    rejections: Mutex<RejectTracker>,
}

impl<C: Connector> QueueConsumer<C> {
    pub fn new(connector: C, settings: ConsumerSettings, stats: Arc<PipelineStats>) -> Self {
        let consumer_tag = format!("{}-{}", settings.name, uuid::Uuid::new_v4());
        Self {
            connector,
            settings,
            stats,
            consumer_tag,
            closing: AtomicBool::new(false),
            pending: Mutex::new(None),
            active: Mutex::new(None),
            rejections: Mutex::new(RejectTracker::default()),
        }
    }

    /// Connects and declares the topology, retrying with a delay that grows
    /// with the attempt number. Exhausting the attempts is fatal to the caller.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        let attempts = self.settings.connect_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.open_session().await {
                Ok(session) => {
                    *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(
                        consumer = %self.settings.name,
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "failed to connect to broker"
                    );
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.connect_delay * attempt).await;
                    }
                }
            }
        }
        Err(BrokerError::ConnectExhausted {
            attempts,
            last: Box::new(
                last_error
                    .unwrap_or_else(|| BrokerError::Unavailable("no connect attempt made".into())),
            ),
        })
    }

    /// Delivers decoded records to `on_message` until `cancel` fires or the
    /// consumer is closed. Connection loss is handled here: the loop reconnects
    /// at a fixed delay and re-subscribes without surfacing the failure.
    pub async fn consume<R, F, Fut>(&self, cancel: CancellationToken, mut on_message: F)
    where
        R: InboundRecord,
        F: FnMut(R) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut session = match pending {
            Some(session) => session,
            None => match self.reconnect(&cancel).await {
                Some(session) => session,
                None => return,
            },
        };
        tracing::info!(
            consumer = %self.settings.name,
            queue = %self.settings.topology.queue,
            kind = R::KIND,
            "consuming"
        );

        loop {
            match self.pump::<R, F, Fut>(&mut session, &cancel, &mut on_message).await {
                Interrupted::Cancelled => break,
                Interrupted::Lost(reason) => {
                    if self.closing.load(Ordering::SeqCst) {
                        break;
                    }
                    tracing::warn!(
                        consumer = %self.settings.name,
                        reason = %reason,
                        "broker connection lost; reconnecting"
                    );
                    if let Some(stale) = self.release_active() {
                        stale.close().await;
                    }
                    session = match self.reconnect(&cancel).await {
                        Some(next) => next,
                        None => break,
                    };
                }
            }
        }
        tracing::info!(consumer = %self.settings.name, "consumer stopped");
    }

    /// Marks the shutdown as intentional and closes the connection.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        drop(
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        if let Some(handle) = self.release_active() {
            handle.close().await;
        }
    }

    /// [`close`](Self::close) bounded by `deadline`. Returns false when the
    /// broker did not confirm the close in time; the consumer is still marked
    /// closed and disconnected.
    pub async fn close_by(&self, deadline: Instant) -> bool {
        match tokio::time::timeout_at(deadline, self.close()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    consumer = %self.settings.name,
                    "broker close did not finish before shutdown deadline"
                );
                false
            }
        }
    }

    async fn open_session(&self) -> Result<Session, BrokerError> {
        let session = self
            .connector
            .connect(&self.settings.topology, &self.consumer_tag)
            .await?;
        self.set_active(&session);
        tracing::info!(
            consumer = %self.settings.name,
            exchange = %self.settings.topology.exchange,
            queue = %self.settings.topology.queue,
            prefetch = self.settings.topology.prefetch,
            "connected to broker"
        );
        Ok(session)
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> Option<Session> {
        let mut attempt: u64 = 0;
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return None;
            }
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = self.open_session() => result,
            };
            match result {
                Ok(session) => {
                    tracing::info!(
                        consumer = %self.settings.name,
                        attempt,
                        "reconnected to broker"
                    );
                    return Some(session);
                }
                Err(err) => {
                    tracing::warn!(
                        consumer = %self.settings.name,
                        attempt,
                        error = %err,
                        retry_in_ms = self.settings.reconnect_delay.as_millis() as u64,
                        "reconnect failed"
                    );
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }
        }
    }

    async fn pump<R, F, Fut>(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
        on_message: &mut F,
    ) -> Interrupted
    where
        R: InboundRecord,
        F: FnMut(R) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => return Interrupted::Cancelled,
                reason = &mut session.closed => {
                    return Interrupted::Lost(match reason {
                        Ok(err) => err.to_string(),
                        Err(_) => "connection dropped".to_string(),
                    });
                }
                next = session.deliveries.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(err)) => return Interrupted::Lost(err.to_string()),
                    None => return Interrupted::Lost("delivery stream ended".to_string()),
                },
            };
            self.handle_delivery::<R, F, Fut>(delivery, on_message).await;
        }
    }

    async fn handle_delivery<R, F, Fut>(&self, delivery: Delivery, on_message: &mut F)
    where
        R: InboundRecord,
        F: FnMut(R) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let Delivery {
            mut body,
            delivery_count,
            message_id,
            acker,
        } = delivery;
        self.stats.records_consumed.fetch_add(1, Ordering::Relaxed);

        // Decoding rewrites the body in place, so key it first.
        let rejection = matches!(
            self.settings.malformed_policy,
            MalformedPolicy::RequeueUpTo(_)
        )
        .then(|| rejection_key(message_id.as_deref(), &body));

        let record = match R::decode(&mut body, Utc::now()) {
            Ok(record) => record,
            Err(err) => {
                self.stats.records_rejected.fetch_add(1, Ordering::Relaxed);
                let (delivery_count, requeue) = self.malformed_verdict(rejection, delivery_count);
                tracing::warn!(
                    consumer = %self.settings.name,
                    kind = R::KIND,
                    delivery_count,
                    requeue,
                    error = %err,
                    "rejecting undecodable message"
                );
                if let Err(err) = acker.nack(requeue).await {
                    tracing::warn!(
                        consumer = %self.settings.name,
                        error = %err,
                        "failed to nack message"
                    );
                }
                return;
            }
        };

        let device_id = record.device_id().to_string();
        match on_message(record).await {
            Ok(()) => {
                if let Err(err) = acker.ack().await {
                    tracing::warn!(
                        consumer = %self.settings.name,
                        device_id = %device_id,
                        error = %err,
                        "failed to ack message"
                    );
                }
            }
            Err(err) => {
                tracing::warn!(
                    consumer = %self.settings.name,
                    device_id = %device_id,
                    error = %err,
                    "message handler failed; requeueing"
                );
                if let Err(err) = acker.nack(true).await {
                    tracing::warn!(
                        consumer = %self.settings.name,
                        error = %err,
                        "failed to nack message"
                    );
                }
            }
        }
    }

    fn malformed_verdict(&self, rejection: Option<u64>, delivery_count: u32) -> (u32, bool) {
        let policy = self.settings.malformed_policy;
        let Some(key) = rejection else {
            return (delivery_count, policy.requeue(delivery_count));
        };
        let mut rejections = self
            .rejections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let attempts = rejections.attempt(key, delivery_count);
        let requeue = policy.requeue(attempts);
        if !requeue {
            rejections.forget(key);
        }
        (attempts, requeue)
    }

    fn set_active(&self, session: &Session) {
        let previous = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(session.handle.clone());
        if previous.is_none() {
            self.stats.broker_connected();
        }
    }

    fn release_active(&self) -> Option<Arc<dyn SessionHandle>> {
        let handle = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if handle.is_some() {
            self.stats.broker_disconnected();
        }
        handle
    }
}
