//! Queue lifecycle observation.

use crate::core::consumer::Consumer;
use crate::core::message::QueuedMessage;

/// Interface for sampling the events of a queue.
///
/// Callbacks fire under the queue's message lock, in position order for
/// `enqueued`. A panicking observer is caught, logged and ignored; it
/// never aborts the triggering operation.
pub trait QueueObserver: Send + Sync {
    /// A message has been added to the queue.
    fn enqueued(&self, _message: &QueuedMessage) {}

    /// A message has become unavailable for transfer (selected for
    /// delivery, expiry, purge or policy eviction).
    fn acquired(&self, _message: &QueuedMessage) {}

    /// A previously acquired message has been released back.
    fn requeued(&self, _message: &QueuedMessage) {}

    /// A message has been permanently removed.
    fn dequeued(&self, _message: &QueuedMessage) {}

    fn consumer_added(&self, _consumer: &dyn Consumer) {}

    fn consumer_removed(&self, _consumer: &dyn Consumer) {}
}
