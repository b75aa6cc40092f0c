//! Per-consumer message selection.

use crate::core::consumer::Consumer;
use crate::core::message::QueuedMessage;
use crate::core::queue::messages::Messages;
use crate::core::values::FieldTable;

/// Decides which message a consumer may take next and whether it is
/// permitted to acquire it.
///
/// Every method is invoked under the queue's message lock and must not
/// block or perform I/O. Allocators that track queue events (such as
/// the group manager) receive them through the `on_*` hooks, which the
/// queue fires alongside its registered observers.
pub trait MessageAllocator: Send {
    /// Next message available for destructive consumption.
    fn next_consumable(
        &mut self,
        _consumer: &dyn Consumer,
        messages: &mut dyn Messages,
    ) -> Option<QueuedMessage> {
        messages.front()
    }

    /// Next message available for browsing, relative to the consumer's
    /// cursor.
    fn next_browsable(
        &mut self,
        consumer: &dyn Consumer,
        messages: &mut dyn Messages,
    ) -> Option<QueuedMessage> {
        messages.next_after(consumer.position())
    }

    /// Permission check for a message previously returned by one of the
    /// `next_*` methods.
    fn acquire(&mut self, _consumer: &str, _message: &QueuedMessage) -> bool {
        true
    }

    /// Contribute allocator state to a management snapshot.
    fn query(&self, _out: &mut FieldTable) {}

    fn on_enqueued(&mut self, _message: &QueuedMessage) {}

    fn on_acquired(&mut self, _message: &QueuedMessage) {}

    fn on_requeued(&mut self, _message: &QueuedMessage) {}

    fn on_dequeued(&mut self, _message: &QueuedMessage) {}

    fn on_consumer_added(&mut self, _consumer: &str) {}

    fn on_consumer_removed(&mut self, _consumer: &str) {}
}

/// Default allocation: strict FIFO, no ownership constraints.
#[derive(Default)]
pub struct FifoAllocator;

impl MessageAllocator for FifoAllocator {}
