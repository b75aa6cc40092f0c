//! Wake set for consumers waiting on an empty queue.

use std::sync::Arc;

use crate::core::consumer::Consumer;

/// Consumers that found nothing to take and asked to be woken.
///
/// Mutated only under the queue's message lock; notification happens
/// through a [`NotificationSet`] populated under the lock and fired
/// after it is released.
#[derive(Default)]
pub struct QueueListeners {
    listeners: Vec<Arc<dyn Consumer>>,
}

impl QueueListeners {
    pub fn add_listener(&mut self, consumer: Arc<dyn Consumer>) {
        if !self.listeners.iter().any(|c| c.name() == consumer.name()) {
            self.listeners.push(consumer);
        }
    }

    pub fn remove_listener(&mut self, name: &str) {
        self.listeners.retain(|c| c.name() != name);
    }

    /// Move every waiting consumer into `set`, to be notified once the
    /// message lock is dropped.
    pub fn populate(&mut self, set: &mut NotificationSet) {
        set.consumers.append(&mut self.listeners);
    }

    /// Copy the waiting consumers without clearing them (deletion path:
    /// every listener must wake and observe the deleted state).
    pub fn snapshot(&self, set: &mut NotificationSet) {
        set.consumers.extend(self.listeners.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

/// Consumers to wake once the current critical section ends.
#[derive(Default)]
pub struct NotificationSet {
    consumers: Vec<Arc<dyn Consumer>>,
}

impl NotificationSet {
    pub fn notify(self) {
        for consumer in self.consumers {
            consumer.notify();
        }
    }
}
