use std::time::Duration;

use anyhow::Result;

/// One message taken from the input queue and not yet acknowledged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Queue-local handle used to acknowledge this message.
    pub tag: u64,
    pub topic: String,
    pub payload: Vec<u8>,
    /// The broker flagged this as a redelivery.
    pub redelivered: bool,
}

/// Broker seam used by the dispatcher.
///
/// Implementations deliver at most one unacknowledged message at a time.
/// Any error returned here means the connection is unusable.
pub trait JobQueue {
    /// Wait up to `timeout` for the next message.
    fn next_delivery(&mut self, timeout: Duration) -> Result<Option<Delivery>>;

    /// Publish `payload` to `queue` and return once the broker has it.
    fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<()>;

    /// Acknowledge a delivery so the broker drops it.
    fn ack(&mut self, delivery: &Delivery) -> Result<()>;
}
