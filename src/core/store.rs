//! Persistent store contract consumed by the queue engine.

use std::sync::Arc;

use crate::core::error::Result;
use crate::core::message::Message;
use crate::core::values::FieldTable;

/// Marker for a store-level transaction; per-queue enqueue/dequeue
/// pairing only.
pub trait TransactionContext: Send + Sync {}

/// What the engine requires of persistent storage.
///
/// Enqueue and dequeue are asynchronous: the store must call
/// [`Message::enqueue_complete`] / [`Message::dequeue_complete`] once
/// the write is durable. The engine never holds a queue lock across any
/// of these calls.
pub trait Store: Send + Sync {
    fn create(&self, queue: &str, settings: &FieldTable) -> Result<()>;

    fn destroy(&self, queue: &str);

    fn flush(&self, queue: &str);

    fn enqueue(
        &self,
        ctx: Option<&dyn TransactionContext>,
        message: &Arc<Message>,
        queue: &str,
    ) -> Result<()>;

    fn dequeue(
        &self,
        ctx: Option<&dyn TransactionContext>,
        message: &Arc<Message>,
        queue: &str,
    ) -> Result<()>;

    /// Record a durable binding.
    fn bind(&self, exchange: &str, queue: &str, key: &str, args: &FieldTable) -> Result<()>;
}
