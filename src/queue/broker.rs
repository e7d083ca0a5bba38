//! Message broker with per-key ordered, single-flight delivery.
//!
//! # Architecture
//!
//! ```text
//!                                 ┌──────────────────────────────┐
//!                            ┌──► │ lane (requests, sr-A)        │ ──┐
//! ┌──────────┐   ┌────────┐  │    └──────────────────────────────┘   │   ┌───────────┐
//! │ publish  │─► │ route  │──┤    ┌──────────────────────────────┐   ├─► │ semaphore │─► handler
//! └──────────┘   │ by key │  ├──► │ lane (resources, sr-A)       │ ──┤   │ (bounded) │
//!                └────────┘  │    └──────────────────────────────┘   │   └───────────┘
//!                            └──► lane (requests, sr-B) ... ─────────┘
//! ```
//!
//! Lanes are created lazily on the first message for a (queue, grouping key)
//! pair. Each lane is a tokio task draining its own channel, so messages for
//! one key are handled strictly in order and never concurrently. A shared
//! semaphore bounds how many lanes handle a message at the same time.
//!
//! Lane channels are unbounded. A handler holding a permit publishes
//! follow-up messages into other lanes, and those lanes need a permit to
//! drain; a bounded channel would let a full lane block its own producer.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tokio::sync::{RwLock, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::message::{QueueMessage, QueueName};
use crate::poll::config::env_parse;
use crate::retry::{ErrorKind, Retriable, RetryConfig, RetryPolicy, RetryResult, retry_with_backoff};
use crate::types::SubscriptionResourceId;

const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("lane for {queue}/{key} is closed")]
    ChannelClosed {
        queue: QueueName,
        key: SubscriptionResourceId,
    },

    #[error("broker has no consumer")]
    NoConsumer,

    #[error("broker already has a consumer")]
    AlreadySubscribed,

    #[error("broker is shut down")]
    ShutDown,
}

impl Retriable for BrokerError {
    fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::ChannelClosed { .. } | BrokerError::NoConsumer => ErrorKind::Transient,
            BrokerError::AlreadySubscribed | BrokerError::ShutDown => ErrorKind::Permanent,
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Publishing side of a broker.
///
/// Implementations must deliver messages with the same
/// [`QueueMessage::queue`] and [`QueueMessage::grouping_key`] in publish
/// order, one at a time.
pub trait Broker: Send + Sync {
    type Error: std::error::Error + Retriable + Send + Sync + 'static;

    fn publish(
        &self,
        message: QueueMessage,
    ) -> impl Future<Output = std::result::Result<(), Self::Error>> + Send;

    /// Whether published messages outlive this process.
    fn is_durable(&self) -> bool {
        true
    }
}

/// Consuming side: handles one message at a time per lane.
pub trait MessageHandler: Send + Sync + 'static {
    type Error: std::error::Error + Retriable + Send + Sync + 'static;

    fn handle(
        &self,
        message: QueueMessage,
    ) -> impl Future<Output = std::result::Result<(), Self::Error>> + Send;
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    /// Maximum number of messages handled concurrently across all lanes.
    pub concurrency: usize,

    /// Redelivery of messages whose handling failed transiently.
    pub redelivery: RetryConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerConfig {
    pub fn new() -> Self {
        BrokerConfig {
            concurrency: DEFAULT_CONCURRENCY,
            redelivery: RetryConfig::DEFAULT,
        }
    }

    /// Reads `REMOTE_SYNC_CONCURRENCY`.
    pub fn from_env() -> Self {
        BrokerConfig {
            concurrency: env_parse("REMOTE_SYNC_CONCURRENCY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_CONCURRENCY),
            ..Self::new()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_redelivery(mut self, redelivery: RetryConfig) -> Self {
        self.redelivery = redelivery;
        self
    }
}

type LaneKey = (QueueName, SubscriptionResourceId);

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A handler failure with its retry classification.
#[derive(Debug, Error)]
#[error("{message}")]
struct HandlerFailure {
    kind: ErrorKind,
    message: String,
}

impl Retriable for HandlerFailure {
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// Object-safe view of a [`MessageHandler`], so the broker does not need the
/// handler's type (the handler usually owns a handle to the broker).
trait ErasedHandler: Send + Sync {
    fn handle_boxed(&self, message: QueueMessage) -> BoxFuture<'_, std::result::Result<(), HandlerFailure>>;
}

impl<H: MessageHandler> ErasedHandler for H {
    fn handle_boxed(&self, message: QueueMessage) -> BoxFuture<'_, std::result::Result<(), HandlerFailure>> {
        Box::pin(async move {
            self.handle(message).await.map_err(|e| HandlerFailure {
                kind: e.kind(),
                message: e.to_string(),
            })
        })
    }
}

struct LaneHandle {
    tx: mpsc::UnboundedSender<QueueMessage>,
    task: JoinHandle<()>,
}

/// A [`Broker`] running entirely inside this process.
///
/// Messages are not persisted; a restart loses queued messages. The broker
/// reports itself as non-durable, so a processor started on top of a
/// persistent store drops the queued markers left by the previous process
/// and the next webhook or scheduled poll re-discovers the changes.
pub struct InProcessBroker {
    config: BrokerConfig,
    handler: OnceLock<Arc<dyn ErasedHandler>>,
    lanes: RwLock<HashMap<LaneKey, LaneHandle>>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl InProcessBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self::new_with_shutdown(config, CancellationToken::new())
    }

    pub fn new_with_shutdown(config: BrokerConfig, shutdown: CancellationToken) -> Self {
        info!(concurrency = config.concurrency, "Creating in-process broker");
        InProcessBroker {
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
            handler: OnceLock::new(),
            lanes: RwLock::new(HashMap::new()),
            shutdown,
        }
    }

    /// Registers the consumer. Must be called once before publishing.
    ///
    /// The consumer usually needs a handle to this broker to publish
    /// follow-up messages, which is why it is not a constructor argument.
    pub fn subscribe<H: MessageHandler>(&self, handler: H) -> Result<()> {
        let handler: Arc<dyn ErasedHandler> = Arc::new(handler);
        self.handler
            .set(handler)
            .map_err(|_| BrokerError::AlreadySubscribed)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn lane_count(&self) -> usize {
        self.lanes.read().await.len()
    }

    /// Stops all lanes and waits for them to exit.
    ///
    /// A message being handled is finished; messages still buffered are
    /// dropped.
    pub async fn shutdown(&self) {
        info!("Shutting down broker lanes");
        self.shutdown.cancel();
        let handles: Vec<(LaneKey, LaneHandle)> = self.lanes.write().await.drain().collect();
        for ((queue, key), LaneHandle { tx, task }) in handles {
            drop(tx);
            if let Err(e) = task.await {
                warn!(%queue, %key, error = %e, "Lane task ended abnormally");
            }
        }
        debug!("All broker lanes stopped");
    }

    #[instrument(
        skip(self, message),
        fields(queue = %message.queue(), key = %message.grouping_key(), request_id = %message.request_id())
    )]
    async fn publish_message(&self, message: QueueMessage) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::ShutDown);
        }
        let key = (message.queue(), message.grouping_key().clone());
        let tx = self.get_or_spawn_lane(&key).await?;

        if tx.send(message).is_err() {
            // The lane task is gone; drop the handle so the next publish
            // spawns a fresh one.
            self.lanes.write().await.remove(&key);
            return Err(BrokerError::ChannelClosed {
                queue: key.0,
                key: key.1,
            });
        }
        trace!("Message published");
        Ok(())
    }

    async fn get_or_spawn_lane(
        &self,
        key: &LaneKey,
    ) -> Result<mpsc::UnboundedSender<QueueMessage>> {
        {
            let lanes = self.lanes.read().await;
            if let Some(handle) = lanes.get(key) {
                return Ok(handle.tx.clone());
            }
        }

        let mut lanes = self.lanes.write().await;
        if let Some(handle) = lanes.get(key) {
            return Ok(handle.tx.clone());
        }

        let handler = self.handler.get().cloned().ok_or(BrokerError::NoConsumer)?;
        debug!(queue = %key.0, key = %key.1, "Spawning new lane");

        let (tx, rx) = mpsc::unbounded_channel();
        let lane = Lane {
            queue: key.0,
            key: key.1.clone(),
            handler,
            permits: Arc::clone(&self.permits),
            redelivery: self.config.redelivery,
            cancel: self.shutdown.child_token(),
        };
        let task = tokio::spawn(lane.run(rx));

        lanes.insert(
            key.clone(),
            LaneHandle {
                tx: tx.clone(),
                task,
            },
        );
        Ok(tx)
    }
}

impl Broker for InProcessBroker {
    type Error = BrokerError;

    async fn publish(&self, message: QueueMessage) -> Result<()> {
        self.publish_message(message).await
    }

    fn is_durable(&self) -> bool {
        false
    }
}

struct Lane {
    queue: QueueName,
    key: SubscriptionResourceId,
    handler: Arc<dyn ErasedHandler>,
    permits: Arc<Semaphore>,
    redelivery: RetryConfig,
    cancel: CancellationToken,
}

impl Lane {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<QueueMessage>) {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            self.deliver(message).await;
            drop(permit);
        }
        debug!(queue = %self.queue, key = %self.key, "Lane stopped");
    }

    async fn deliver(&self, message: QueueMessage) {
        let request_id = message.request_id().clone();
        let handler = &self.handler;
        let result = retry_with_backoff(self.redelivery, RetryPolicy::RetryTransient, || {
            handler.handle_boxed(message.clone())
        })
        .await;

        match result {
            RetryResult::Success(()) => {
                trace!(queue = %self.queue, key = %self.key, %request_id, "Message handled");
            }
            RetryResult::ExhaustedRetries {
                last_error,
                attempts,
            } => {
                error!(
                    queue = %self.queue,
                    key = %self.key,
                    %request_id,
                    attempts,
                    error = %last_error,
                    "Message handling failed after retries, dropping"
                );
            }
            RetryResult::PermanentError(e) => {
                warn!(
                    queue = %self.queue,
                    key = %self.key,
                    %request_id,
                    error = %e,
                    "Message handling failed permanently, dropping"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::message::{ResourceChange, SubscriptionRequest};
    use crate::types::{ChangeInfo, RequestId};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Error)]
    #[error("handler failed")]
    struct TestFailure(ErrorKind);

    impl Retriable for TestFailure {
        fn kind(&self) -> ErrorKind {
            self.0
        }
    }

    /// Records handled messages; fails transiently `fail_first` times.
    #[derive(Default)]
    struct Recorder {
        handled: Mutex<Vec<QueueMessage>>,
        attempts: AtomicUsize,
        fail_first: usize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl MessageHandler for Arc<Recorder> {
        type Error = TestFailure;

        async fn handle(&self, message: QueueMessage) -> std::result::Result<(), TestFailure> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                return Err(TestFailure(ErrorKind::Transient));
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.handled.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn request(key: &str, n: usize) -> QueueMessage {
        QueueMessage::SubscriptionRequest(SubscriptionRequest {
            subscription_resource_id: SubscriptionResourceId::new(key),
            request_id: RequestId::new(format!("r{}", n)),
            received_at: chrono::Utc::now(),
        })
    }

    fn fast_redelivery() -> RetryConfig {
        RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(5), 2.0)
    }

    async fn wait_for(recorder: &Recorder, count: usize) {
        for _ in 0..500 {
            if recorder.handled.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {} messages", count);
    }

    #[tokio::test]
    async fn publish_without_consumer_fails() {
        let broker = InProcessBroker::new(BrokerConfig::new());
        let err = broker.publish(request("a", 0)).await.unwrap_err();
        assert!(matches!(err, BrokerError::NoConsumer));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn second_subscribe_is_rejected() {
        let broker = InProcessBroker::new(BrokerConfig::new());
        broker.subscribe(Arc::new(Recorder::default())).unwrap();
        assert!(matches!(
            broker.subscribe(Arc::new(Recorder::default())),
            Err(BrokerError::AlreadySubscribed)
        ));
    }

    #[tokio::test]
    async fn messages_for_one_key_are_handled_in_order() {
        let recorder = Arc::new(Recorder::default());
        let broker = InProcessBroker::new(BrokerConfig::new());
        broker.subscribe(Arc::clone(&recorder)).unwrap();

        for n in 0..10 {
            broker.publish(request("a", n)).await.unwrap();
        }
        wait_for(&recorder, 10).await;

        let ids: Vec<String> = recorder
            .handled
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.request_id().to_string())
            .collect();
        let expected: Vec<String> = (0..10).map(|n| format!("r{}", n)).collect();
        assert_eq!(ids, expected);
        assert_eq!(broker.lane_count().await, 1);
    }

    #[tokio::test]
    async fn queues_get_separate_lanes() {
        let recorder = Arc::new(Recorder::default());
        let broker = InProcessBroker::new(BrokerConfig::new());
        broker.subscribe(Arc::clone(&recorder)).unwrap();

        broker.publish(request("a", 0)).await.unwrap();
        broker
            .publish(QueueMessage::ResourceChange(ResourceChange::new(
                SubscriptionResourceId::new("a"),
                ChangeInfo::new("1", None, None),
                RequestId::new("r1"),
            )))
            .await
            .unwrap();
        wait_for(&recorder, 2).await;

        assert_eq!(broker.lane_count().await, 2);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_across_lanes() {
        let recorder = Arc::new(Recorder {
            delay: Duration::from_millis(20),
            ..Recorder::default()
        });
        let broker = InProcessBroker::new(BrokerConfig::new().with_concurrency(2));
        broker.subscribe(Arc::clone(&recorder)).unwrap();

        for n in 0..6 {
            broker.publish(request(&format!("key-{}", n), n)).await.unwrap();
        }
        wait_for(&recorder, 6).await;

        assert_eq!(broker.lane_count().await, 6);
        assert!(recorder.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn transient_failures_are_redelivered() {
        let recorder = Arc::new(Recorder {
            fail_first: 2,
            ..Recorder::default()
        });
        let broker =
            InProcessBroker::new(BrokerConfig::new().with_redelivery(fast_redelivery()));
        broker.subscribe(Arc::clone(&recorder)).unwrap();

        broker.publish(request("a", 0)).await.unwrap();
        wait_for(&recorder, 1).await;

        assert_eq!(recorder.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn publish_after_shutdown_fails() {
        let recorder = Arc::new(Recorder::default());
        let broker = InProcessBroker::new(BrokerConfig::new());
        broker.subscribe(recorder).unwrap();

        broker.shutdown().await;

        assert!(matches!(
            broker.publish(request("a", 0)).await,
            Err(BrokerError::ShutDown)
        ));
        assert_eq!(broker.lane_count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_message_in_flight() {
        let recorder = Arc::new(Recorder {
            delay: Duration::from_millis(50),
            ..Recorder::default()
        });
        let broker = InProcessBroker::new(BrokerConfig::new());
        broker.subscribe(Arc::clone(&recorder)).unwrap();

        broker.publish(request("a", 0)).await.unwrap();
        for _ in 0..100 {
            if recorder.in_flight.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        broker.shutdown().await;

        assert_eq!(recorder.handled.lock().unwrap().len(), 1);
        assert_eq!(recorder.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publishing_from_a_handler_never_blocks_on_a_busy_lane() {
        /// Fans every request out into `fanout` resource changes for the
        /// same key, while still holding its permit.
        struct FanOut {
            broker: OnceLock<Arc<InProcessBroker>>,
            fanout: usize,
            changes: AtomicUsize,
        }

        impl MessageHandler for Arc<FanOut> {
            type Error = BrokerError;

            async fn handle(&self, message: QueueMessage) -> Result<()> {
                match message {
                    QueueMessage::SubscriptionRequest(request) => {
                        let broker = self.broker.get().ok_or(BrokerError::NoConsumer)?;
                        for n in 0..self.fanout {
                            broker
                                .publish(QueueMessage::ResourceChange(ResourceChange::new(
                                    request.subscription_resource_id.clone(),
                                    ChangeInfo::new(format!("r-{}", n), None, None),
                                    request.request_id.clone(),
                                )))
                                .await?;
                        }
                    }
                    QueueMessage::ResourceChange(_) => {
                        self.changes.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Ok(())
            }
        }

        let broker = Arc::new(InProcessBroker::new(BrokerConfig::new().with_concurrency(1)));
        let handler = Arc::new(FanOut {
            broker: OnceLock::new(),
            fanout: 250,
            changes: AtomicUsize::new(0),
        });
        let _ = handler.broker.set(Arc::clone(&broker));
        broker.subscribe(Arc::clone(&handler)).unwrap();

        broker.publish(request("a", 0)).await.unwrap();
        for _ in 0..500 {
            if handler.changes.load(Ordering::SeqCst) == 250 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(handler.changes.load(Ordering::SeqCst), 250);
    }
}
