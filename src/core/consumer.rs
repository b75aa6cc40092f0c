//! Consumer-side contract the queue engine dispatches against.

use crate::core::message::{Message, Position, QueuedMessage};

/// A subscription attached to a queue.
///
/// The engine calls `filter`/`accept` under the queue's message lock, so
/// implementations must not block there. `notify` and `deliver` are
/// always invoked outside the lock.
pub trait Consumer: Send + Sync {
    /// Stable name, unique per queue; also the identity used for
    /// message-group ownership.
    fn name(&self) -> &str;

    /// Session identity, compared against the queue owner for no-local.
    fn session_id(&self) -> Option<&str> {
        None
    }

    /// Destructive consumers acquire; browsers do not.
    fn pre_acquires(&self) -> bool {
        true
    }

    /// Cursor: position of the last message seen by this consumer.
    fn position(&self) -> Position;

    fn set_position(&self, position: Position);

    /// Selector. Returning false means this consumer never wants the
    /// message and the cursor moves past it.
    fn filter(&self, _message: &Message) -> bool {
        true
    }

    /// Credit check. Returning false leaves the message in place for
    /// another consumer.
    fn accept(&self, _message: &Message) -> bool {
        true
    }

    /// Wake a consumer that previously found the queue empty.
    fn notify(&self);

    /// Hand over a message won by dispatch.
    fn deliver(&self, message: &QueuedMessage);
}
