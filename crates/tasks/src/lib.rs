mod enqueuer;
pub mod scheduled;

use anyhow::Result;
use async_trait::async_trait;
pub use enqueuer::{
    HttpQueueClient, HttpServiceResolver, PayloadSigner, QueueClient, QueueTask, QueueTaskEnqueuer,
    ServiceResolver,
};
use hook_relay_core::config::TargetEnvironment;

/// A unit of work handed to the backing push queue. Consumed exactly once;
/// after handoff the queue owns delivery and retry state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundRequest {
    /// Delivery/correlation id of the originating event.
    pub id: String,
    pub event_name: String,
    /// Serialized JSON payload.
    pub body: String,
    pub target_environment: TargetEnvironment,
    pub target_name: String,
    /// Schedule delivery this many seconds into the future.
    pub delay_in_seconds: Option<u64>,
}

#[async_trait]
pub trait TaskEnqueuer: Send + Sync {
    async fn enqueue(&self, request: BackgroundRequest) -> Result<()>;
}
