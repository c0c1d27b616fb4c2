//! Event publication and worker dispatch.
//!
//! Status changes are persisted first and published second. The
//! [`EventPublisher`] owns delivery to a [`NotificationChannel`] on its own
//! task and keeps retrying until the store records the event as delivered.
//! The [`WorkerDispatcher`] consumes the in-process channel, runs the
//! workers whose interest key the event carries and acknowledges each
//! event once they finished.

pub mod channel;
pub mod dispatcher;
pub mod index_worker;
pub mod publisher;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::EventRecord;

pub use channel::{Delivery, FanoutChannel, LocalChannel, DEFAULT_CAPACITY};
pub use dispatcher::{Worker, WorkerDispatcher};
pub use index_worker::IndexWorker;
pub use publisher::{EventPublisher, PublisherHandle};

/// Errors raised while handing an event to a channel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// Delivery failed, may succeed later
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Nobody is listening; retrying immediately is pointless
    #[error("Channel closed")]
    Closed,
}

/// Destination for EventRecords
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel name for logging
    fn name(&self) -> &str;

    async fn send(&self, event: &EventRecord) -> Result<(), ChannelError>;
}
