//! Broker consumer routing messages to the dispatcher and downstream.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use super::broker::{Broker, MessageHandler};
use super::message::{QueueMessage, ResourceChange};
use super::processor::{ProcessorError, WebHookProcessor};
use crate::persistence::{StoreError, SyncStore};
use crate::poll::ChangeSource;
use crate::retry::{ErrorKind, Retriable};

/// Downstream processing of one changed remote resource.
///
/// The change only identifies the resource; implementations fetch the
/// current state themselves, so handling an older change late is harmless.
pub trait ResourceConsumer: Send + Sync + 'static {
    type Error: std::error::Error + Retriable + Send + Sync + 'static;

    fn consume(
        &self,
        change: ResourceChange,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

#[derive(Debug, Error)]
pub enum HandlerError<D, C> {
    #[error(transparent)]
    Dispatch(D),

    #[error("clearing queued resource marker failed: {0}")]
    Store(#[from] StoreError),

    #[error("resource consumer failed: {0}")]
    Consumer(#[source] C),
}

impl<D: Retriable, C: Retriable> Retriable for HandlerError<D, C> {
    fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::Dispatch(e) => e.kind(),
            HandlerError::Store(e) => e.kind(),
            HandlerError::Consumer(e) => e.kind(),
        }
    }
}

/// Handles both queues: subscription requests run a processing cycle,
/// resource changes clear their queued marker and go to the consumer.
pub struct SyncHandler<St, B, S, C> {
    processor: Arc<WebHookProcessor<St, B, S>>,
    consumer: Arc<C>,
}

impl<St, B, S, C> SyncHandler<St, B, S, C> {
    pub fn new(processor: Arc<WebHookProcessor<St, B, S>>, consumer: Arc<C>) -> Self {
        SyncHandler {
            processor,
            consumer,
        }
    }
}

impl<St, B, S, C> MessageHandler for SyncHandler<St, B, S, C>
where
    St: SyncStore + 'static,
    B: Broker + 'static,
    S: ChangeSource + 'static,
    C: ResourceConsumer,
{
    type Error = HandlerError<ProcessorError<B, S>, C::Error>;

    async fn handle(&self, message: QueueMessage) -> Result<(), Self::Error> {
        match message {
            QueueMessage::SubscriptionRequest(request) => {
                let summary = self
                    .processor
                    .receive(&request)
                    .await
                    .map_err(HandlerError::Dispatch)?;
                debug!(enqueued = summary.enqueued, "Subscription request handled");
                Ok(())
            }
            QueueMessage::ResourceChange(change) => {
                // Cleared first: a newer version arriving while the consumer
                // runs must be enqueued again.
                self.processor
                    .resource_dequeued(&change.subscription_resource_id, &change.resource_id)?;
                self.consumer
                    .consume(change)
                    .await
                    .map_err(HandlerError::Consumer)
            }
        }
    }
}
