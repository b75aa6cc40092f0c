//! Message-group affinity.
//!
//! Messages sharing a group id are delivered to one consumer at a time:
//! the consumer that acquires the first message of a group owns the
//! group until every message it acquired from it is settled or
//! released. Free groups are handed out oldest-head-first.

use std::collections::{BTreeMap, HashMap, VecDeque};

use ahash::RandomState;
use tracing::{debug, error, trace};

use crate::core::consumer::Consumer;
use crate::core::message::{Position, QueuedMessage};
use crate::core::queue::allocator::MessageAllocator;
use crate::core::queue::messages::Messages;
use crate::core::values::{FieldTable, FieldValue};

pub const GROUP_HEADER_KEY: &str = "qpid.group_header_key";
pub const GROUP_TIMESTAMP_KEY: &str = "qpid.group_timestamp";

/// Group id assigned to messages lacking the configured header.
pub const DEFAULT_GROUP: &str = "qpid.no_group";

const QUERY_KEY: &str = "qpid.message_group_queue";

struct GroupState {
    id: String,
    owner: Option<String>,
    /// Outstanding acquired messages in this group.
    acquired: u32,
    /// Positions of the group's members, oldest first.
    members: VecDeque<Position>,
}

impl GroupState {
    fn owned(&self) -> bool {
        self.owner.is_some()
    }

    fn head(&self) -> Position {
        *self.members.front().expect("group has no members")
    }
}

/// Queue observer and allocator enforcing group ownership.
pub struct MessageGroupManager {
    queue: String,
    header_key: String,
    timestamp: bool,
    groups: HashMap<String, GroupState, RandomState>,
    /// Unowned groups with members, keyed by the position of their head
    /// member.
    free_groups: BTreeMap<Position, String>,
    /// Count of owned groups per consumer.
    consumers: HashMap<String, u32, RandomState>,
}

impl MessageGroupManager {
    /// Build a manager when the declare arguments ask for grouping.
    pub fn from_args(queue: &str, args: &FieldTable) -> Option<MessageGroupManager> {
        let header_key = args.get_as_str(GROUP_HEADER_KEY)?;
        if header_key.is_empty() {
            error!(queue, "a message group header key must be configured");
            return None;
        }
        let timestamp = args.integer_setting(GROUP_TIMESTAMP_KEY) != 0;
        debug!(
            queue,
            header_key, timestamp, "configured queue for message grouping"
        );
        Some(MessageGroupManager {
            queue: queue.to_string(),
            header_key: header_key.to_string(),
            timestamp,
            groups: HashMap::default(),
            free_groups: BTreeMap::new(),
            consumers: HashMap::default(),
        })
    }

    fn group_of(&self, message: &QueuedMessage) -> String {
        message
            .message
            .with_headers(|h| h.get_as_str(&self.header_key).map(str::to_string))
            .unwrap_or_else(|| DEFAULT_GROUP.to_string())
    }

    fn own(&mut self, group: &str, consumer: &str) {
        let state = self.groups.get_mut(group).expect("owning unknown group");
        state.owner = Some(consumer.to_string());
        *self.consumers.entry(consumer.to_string()).or_insert(0) += 1;
        let removed = self.free_groups.remove(&state.head());
        debug_assert!(removed.is_some(), "owned group was not on the free list");
        trace!(
            queue = %self.queue,
            consumer, group, "consumer has acquired group"
        );
    }

    fn disown(&mut self, group: &str) {
        let state = self.groups.get_mut(group).expect("disowning unknown group");
        let owner = state.owner.take().expect("disowning unowned group");
        if let Some(count) = self.consumers.get_mut(&owner) {
            *count = count.saturating_sub(1);
        }
        let head = state.head();
        let prior = self.free_groups.insert(head, group.to_string());
        debug_assert!(prior.is_none(), "free list already held this head");
        trace!(queue = %self.queue, owner, group, "consumer released group");
    }
}

impl MessageAllocator for MessageGroupManager {
    fn next_consumable(
        &mut self,
        consumer: &dyn Consumer,
        messages: &mut dyn Messages,
    ) -> Option<QueuedMessage> {
        if messages.is_empty() {
            return None;
        }

        let mut candidate = if let Some((&next_free, _)) = self.free_groups.iter().next() {
            if next_free < consumer.position() {
                // the oldest free group's head is behind this consumer
                let found = messages.find(next_free);
                debug_assert!(found.is_some(), "free group head missing from container");
                found?
            } else {
                messages.next_after(consumer.position())?
            }
        } else {
            // nothing free: only useful if this consumer owns groups
            if self.consumers.get(consumer.name()).copied().unwrap_or(0) == 0 {
                return None;
            }
            messages.next_after(consumer.position())?
        };

        loop {
            let group = self.group_of(&candidate);
            let Some(state) = self.groups.get(&group) else {
                debug_assert!(false, "message in unknown group");
                return None;
            };
            if !state.owned() || state.owner.as_deref() == Some(consumer.name()) {
                return Some(candidate);
            }
            candidate = messages.next_after(candidate.position)?;
        }
    }

    fn acquire(&mut self, consumer: &str, message: &QueuedMessage) -> bool {
        let group = self.group_of(message);
        let Some(state) = self.groups.get(&group) else {
            debug_assert!(false, "acquiring from unknown group");
            return false;
        };
        match state.owner.clone() {
            None => {
                self.own(&group, consumer);
                true
            }
            Some(owner) => owner == consumer,
        }
    }

    fn query(&self, out: &mut FieldTable) {
        let mut state = FieldTable::new();
        state.insert("group_header_key", self.header_key.clone());
        let groups = self
            .groups
            .values()
            .map(|g| {
                let mut info = FieldTable::new();
                info.insert("group_id", g.id.clone());
                info.insert("msg_count", g.members.len() as i64);
                if self.timestamp {
                    info.insert("timestamp", 0i64);
                }
                info.insert("consumer", g.owner.clone().unwrap_or_default());
                FieldValue::Map(info)
            })
            .collect();
        state.insert("group_state", FieldValue::List(groups));
        out.insert(QUERY_KEY, FieldValue::Map(state));
    }

    fn on_enqueued(&mut self, message: &QueuedMessage) {
        let group = self.group_of(message);
        let state = self.groups.entry(group.clone()).or_insert_with(|| GroupState {
            id: group.clone(),
            owner: None,
            acquired: 0,
            members: VecDeque::new(),
        });
        state.members.push_back(message.position);
        trace!(
            queue = %self.queue,
            group, total = state.members.len(), "added message to group"
        );
        if state.members.len() == 1 {
            // newly created group, no owner yet
            let prior = self.free_groups.insert(message.position, group);
            debug_assert!(prior.is_none(), "duplicate head position on free list");
        }
    }

    fn on_acquired(&mut self, message: &QueuedMessage) {
        let group = self.group_of(message);
        let Some(state) = self.groups.get_mut(&group) else {
            debug_assert!(false, "acquired in unknown group");
            return;
        };
        state.acquired += 1;
        trace!(
            queue = %self.queue,
            group, acquired = state.acquired, "acquired message in group"
        );
    }

    fn on_requeued(&mut self, message: &QueuedMessage) {
        let group = self.group_of(message);
        let must_disown = {
            let Some(state) = self.groups.get_mut(&group) else {
                debug_assert!(false, "requeued to unknown group");
                return;
            };
            debug_assert!(state.acquired > 0);
            state.acquired = state.acquired.saturating_sub(1);
            state.acquired == 0 && state.owned()
        };
        if must_disown {
            self.disown(&group);
        }
    }

    fn on_dequeued(&mut self, message: &QueuedMessage) {
        let group = self.group_of(message);
        let (empty, was_head, old_head, new_head, owned, acquired) = {
            let Some(state) = self.groups.get_mut(&group) else {
                debug_assert!(false, "dequeued from unknown group");
                return;
            };
            debug_assert!(!state.members.is_empty());
            let old_head = state.head();
            if let Some(i) = state.members.iter().position(|&p| p == message.position) {
                state.members.remove(i);
            }
            state.acquired = state.acquired.saturating_sub(1);
            (
                state.members.is_empty(),
                old_head == message.position,
                old_head,
                state.members.front().copied(),
                state.owned(),
                state.acquired,
            )
        };

        if empty {
            if !owned {
                self.free_groups.remove(&old_head);
            }
            trace!(queue = %self.queue, group, "deleting empty group");
            self.groups.remove(&group);
        } else if was_head && !owned {
            // rekey the free-list entry to the new head
            self.free_groups.remove(&old_head);
            self.free_groups.insert(new_head.expect("non-empty group"), group);
        } else if acquired == 0 && owned {
            self.disown(&group);
        }
    }

    fn on_consumer_added(&mut self, consumer: &str) {
        debug_assert!(!self.consumers.contains_key(consumer));
        self.consumers.insert(consumer.to_string(), 0);
        trace!(queue = %self.queue, consumer, "added consumer");
    }

    fn on_consumer_removed(&mut self, consumer: &str) {
        let owned: Vec<String> = self
            .groups
            .values()
            .filter(|g| g.owner.as_deref() == Some(consumer))
            .map(|g| g.id.clone())
            .collect();
        for group in owned {
            self.disown(&group);
        }
        self.consumers.remove(consumer);
        trace!(queue = %self.queue, consumer, "removed consumer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{Message, QueuedMessage};
    use crate::core::queue::messages::MessageDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct Cursor {
        name: String,
        position: AtomicU64,
    }

    impl Cursor {
        fn new(name: &str) -> Self {
            Cursor { name: name.to_string(), position: AtomicU64::new(0) }
        }
    }

    impl Consumer for Cursor {
        fn name(&self) -> &str {
            &self.name
        }
        fn position(&self) -> Position {
            self.position.load(Ordering::Relaxed)
        }
        fn set_position(&self, p: Position) {
            self.position.store(p, Ordering::Relaxed);
        }
        fn notify(&self) {}
        fn deliver(&self, _m: &QueuedMessage) {}
    }

    fn grouped(position: Position, group: &str) -> QueuedMessage {
        QueuedMessage::new(
            position,
            Arc::new(Message::builder("k").header("g", group).finish()),
        )
    }

    fn manager() -> MessageGroupManager {
        let mut args = FieldTable::new();
        args.insert(GROUP_HEADER_KEY, "g");
        MessageGroupManager::from_args("q", &args).unwrap()
    }

    fn setup(groups: &[&str]) -> (MessageGroupManager, MessageDeque) {
        let mut mgr = manager();
        let mut messages = MessageDeque::new();
        for (i, g) in groups.iter().enumerate() {
            let qm = grouped(i as Position + 1, g);
            mgr.on_enqueued(&qm);
            messages.push(qm);
        }
        (mgr, messages)
    }

    #[test]
    fn missing_header_key_disables_grouping() {
        assert!(MessageGroupManager::from_args("q", &FieldTable::new()).is_none());
    }

    #[test]
    fn acquire_takes_ownership_and_blocks_others() {
        let (mut mgr, mut messages) = setup(&["A", "A", "B"]);
        mgr.on_consumer_added("c1");
        mgr.on_consumer_added("c2");
        let c1 = Cursor::new("c1");
        let c2 = Cursor::new("c2");

        let first = mgr.next_consumable(&c1, &mut messages).unwrap();
        assert_eq!(first.position, 1);
        assert!(mgr.acquire("c1", &first));
        mgr.on_acquired(&first);
        messages.remove(first.position);
        c1.set_position(1);

        // c2 must skip past group A and land on B
        let other = mgr.next_consumable(&c2, &mut messages).unwrap();
        assert_eq!(other.position, 3);
        assert!(mgr.acquire("c2", &other));
        mgr.on_acquired(&other);

        // c1 still owns A, so it may take position 2
        let second = mgr.next_consumable(&c1, &mut messages).unwrap();
        assert_eq!(second.position, 2);
        assert!(mgr.acquire("c1", &second));
    }

    #[test]
    fn settling_all_acquired_messages_frees_the_group() {
        let (mut mgr, mut messages) = setup(&["A", "A"]);
        mgr.on_consumer_added("c1");
        let c1 = Cursor::new("c1");

        let first = mgr.next_consumable(&c1, &mut messages).unwrap();
        assert!(mgr.acquire("c1", &first));
        mgr.on_acquired(&first);
        messages.remove(first.position);
        mgr.on_dequeued(&first);

        // one member left, no outstanding acquires: A is free again
        assert_eq!(mgr.free_groups.len(), 1);
        assert_eq!(mgr.free_groups.values().next().unwrap(), "A");
        assert_eq!(*mgr.consumers.get("c1").unwrap(), 0);
    }

    #[test]
    fn requeue_of_last_acquired_message_disowns() {
        let (mut mgr, mut messages) = setup(&["A"]);
        mgr.on_consumer_added("c1");
        let c1 = Cursor::new("c1");
        let m = mgr.next_consumable(&c1, &mut messages).unwrap();
        assert!(mgr.acquire("c1", &m));
        mgr.on_acquired(&m);
        mgr.on_requeued(&m);
        assert!(mgr.free_groups.contains_key(&1));
        assert_eq!(*mgr.consumers.get("c1").unwrap(), 0);
    }

    #[test]
    fn dequeue_of_head_rekeys_free_list() {
        let (mut mgr, _messages) = setup(&["A", "A"]);
        // expiry-style removal of the unowned head
        let head = grouped(1, "A");
        mgr.on_acquired(&head);
        mgr.on_dequeued(&head);
        assert_eq!(mgr.free_groups.iter().next().unwrap(), (&2, &"A".to_string()));
    }

    #[test]
    fn consumer_removal_releases_owned_groups() {
        let (mut mgr, mut messages) = setup(&["A", "B"]);
        mgr.on_consumer_added("c1");
        let c1 = Cursor::new("c1");
        let a = mgr.next_consumable(&c1, &mut messages).unwrap();
        assert!(mgr.acquire("c1", &a));
        mgr.on_acquired(&a);
        c1.set_position(a.position);
        let b = mgr.next_consumable(&c1, &mut messages).unwrap();
        assert!(mgr.acquire("c1", &b));
        mgr.on_acquired(&b);
        assert!(mgr.free_groups.is_empty());

        mgr.on_consumer_removed("c1");
        assert_eq!(mgr.free_groups.len(), 2);
        assert!(!mgr.consumers.contains_key("c1"));
    }

    #[test]
    fn consumer_without_owned_groups_sees_nothing_when_none_free() {
        let (mut mgr, mut messages) = setup(&["A"]);
        mgr.on_consumer_added("c1");
        mgr.on_consumer_added("c2");
        let c1 = Cursor::new("c1");
        let c2 = Cursor::new("c2");
        let a = mgr.next_consumable(&c1, &mut messages).unwrap();
        assert!(mgr.acquire("c1", &a));
        mgr.on_acquired(&a);
        messages.remove(a.position);
        // group A is owned and has no deliverable members for c2
        assert!(mgr.next_consumable(&c2, &mut messages).is_none());
    }
}
