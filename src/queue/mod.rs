//! Work queue dispatch.
//!
//! A change notification (webhook delivery or scheduled trigger) becomes a
//! [`SubscriptionRequest`] on the broker, grouped by subscription resource.
//! Handling that request runs one poll cycle and publishes a
//! [`ResourceChange`] for every resource version not processed before.
//!
//! ```text
//! webhook / scheduler ─► WebHookProcessor::received ─► broker (requests lane)
//!                                                          │
//!                           SyncHandler ◄──────────────────┘
//!                             └─► WebHookProcessor::receive ─► poll ─► broker (resources lane)
//!                                                                          │
//!                           SyncHandler ◄──────────────────────────────────┘
//!                             └─► resource_dequeued ─► ResourceConsumer::consume
//! ```

pub mod broker;
pub mod handler;
pub mod message;
pub mod processor;
pub mod scheduler;

pub use broker::{Broker, BrokerConfig, BrokerError, InProcessBroker, MessageHandler};
pub use handler::{HandlerError, ResourceConsumer, SyncHandler};
pub use message::{QueueMessage, QueueName, ResourceChange, SubscriptionRequest};
pub use processor::{
    DispatchError, NotificationReceiver, ProcessorConfig, ProcessorError, ReceiveSummary,
    RequestIdGenerator, WebHookProcessor,
};
pub use scheduler::PollScheduler;
