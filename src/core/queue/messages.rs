//! Ordered containers of queued messages.
//!
//! A queue owns exactly one container, picked at configure time:
//! - [`MessageDeque`]: plain FIFO.
//! - [`PriorityQueue`]: priority bands with optional fair-share credits.
//! - [`MessageMap`]: last-value semantics keyed by a header.
//! - [`LegacyLvq`]: the older last-value form keyed by `qpid.LVQ_key`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use ahash::RandomState;
use tracing::trace;

use crate::core::message::{Position, QueuedMessage};

/// Operations the queue engine needs of its message container. All
/// calls happen under the queue's message lock.
pub trait Messages: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a message. Bounded or keyed variants may displace an
    /// older message, which is returned for the caller to dequeue.
    fn push(&mut self, message: QueuedMessage) -> Option<QueuedMessage>;

    /// Remove and return the next consumable message.
    fn pop(&mut self) -> Option<QueuedMessage>;

    /// The message `pop` would return, left in place.
    fn front(&self) -> Option<QueuedMessage>;

    fn find(&self, position: Position) -> Option<QueuedMessage>;

    /// First message with a position strictly greater than `position`.
    fn next_after(&mut self, position: Position) -> Option<QueuedMessage>;

    fn remove(&mut self, position: Position) -> Option<QueuedMessage>;

    /// Restore a previously removed message, preserving position order.
    fn reinsert(&mut self, message: QueuedMessage);

    /// Visit messages in order, removing and returning those matching
    /// `predicate`.
    fn remove_if(&mut self, predicate: &mut dyn FnMut(&QueuedMessage) -> bool)
        -> Vec<QueuedMessage>;

    fn for_each(&self, f: &mut dyn FnMut(&QueuedMessage));
}

/* ------------------------------- Deque ---------------------------------- */

/// Insertion-ordered FIFO. Positions are assigned in push order, so the
/// deque is always position-sorted and lookups binary search.
#[derive(Default)]
pub struct MessageDeque {
    messages: VecDeque<QueuedMessage>,
}

impl MessageDeque {
    pub fn new() -> Self {
        Self::default()
    }

    fn index_of(&self, position: Position) -> Result<usize, usize> {
        self.messages.binary_search_by(|m| m.position.cmp(&position))
    }
}

impl Messages for MessageDeque {
    fn len(&self) -> usize {
        self.messages.len()
    }

    fn push(&mut self, message: QueuedMessage) -> Option<QueuedMessage> {
        self.messages.push_back(message);
        None
    }

    fn pop(&mut self) -> Option<QueuedMessage> {
        self.messages.pop_front()
    }

    fn front(&self) -> Option<QueuedMessage> {
        self.messages.front().cloned()
    }

    fn find(&self, position: Position) -> Option<QueuedMessage> {
        self.index_of(position).ok().map(|i| self.messages[i].clone())
    }

    fn next_after(&mut self, position: Position) -> Option<QueuedMessage> {
        let idx = self.messages.partition_point(|m| m.position <= position);
        self.messages.get(idx).cloned()
    }

    fn remove(&mut self, position: Position) -> Option<QueuedMessage> {
        self.index_of(position).ok().and_then(|i| self.messages.remove(i))
    }

    fn reinsert(&mut self, message: QueuedMessage) {
        let idx = self.messages.partition_point(|m| m.position < message.position);
        self.messages.insert(idx, message);
    }

    fn remove_if(&mut self, predicate: &mut dyn FnMut(&QueuedMessage) -> bool)
        -> Vec<QueuedMessage> {
        let mut matched = Vec::new();
        self.messages.retain(|m| {
            if predicate(m) {
                matched.push(m.clone());
                false
            } else {
                true
            }
        });
        matched
    }

    fn for_each(&self, f: &mut dyn FnMut(&QueuedMessage)) {
        for m in &self.messages {
            f(m);
        }
    }
}

/* ------------------------------ Priority -------------------------------- */

/// Priority bands, FIFO within each band, highest band served first.
///
/// With fair-share configured, each band holds a credit balance; a band
/// with credit left is preferred, and a fresh round of credits is dealt
/// once every candidate band is spent. Browse order stays position
/// order regardless of priority.
pub struct PriorityQueue {
    levels: Vec<VecDeque<QueuedMessage>>,
    shares: Option<Vec<u32>>,
    credits: Vec<u32>,
    count: usize,
}

impl PriorityQueue {
    pub fn new(level_count: usize) -> Self {
        let level_count = level_count.clamp(1, 10);
        PriorityQueue {
            levels: (0..level_count).map(|_| VecDeque::new()).collect(),
            shares: None,
            credits: vec![0; level_count],
            count: 0,
        }
    }

    /// Fair-share variant: `shares[level]` deliveries per round.
    pub fn with_fairshare(level_count: usize, shares: Vec<u32>) -> Self {
        let mut q = PriorityQueue::new(level_count);
        let mut shares = shares;
        shares.resize(q.levels.len(), 1);
        q.credits = shares.clone();
        q.shares = Some(shares);
        q
    }

    fn level_of(&self, message: &QueuedMessage) -> usize {
        let priority = message.message.priority().min(9) as usize;
        (priority * self.levels.len()) / 10
    }

    /// The band `pop` should serve next.
    fn select_level(&self) -> Option<usize> {
        let populated = || (0..self.levels.len()).rev().filter(|&l| !self.levels[l].is_empty());
        if self.shares.is_some() {
            if let Some(l) = populated().find(|&l| self.credits[l] > 0) {
                return Some(l);
            }
        }
        populated().next()
    }

    fn charge(&mut self, level: usize) {
        if self.shares.is_none() {
            return;
        }
        if self.credits[level] == 0 {
            // every candidate band was spent; deal a new round
            self.credits = self.shares.clone().expect("shares present");
        }
        self.credits[level] = self.credits[level].saturating_sub(1);
    }

    fn locate(&self, position: Position) -> Option<(usize, usize)> {
        for (l, level) in self.levels.iter().enumerate() {
            if let Ok(i) = level.binary_search_by(|m| m.position.cmp(&position)) {
                return Some((l, i));
            }
        }
        None
    }
}

impl Messages for PriorityQueue {
    fn len(&self) -> usize {
        self.count
    }

    fn push(&mut self, message: QueuedMessage) -> Option<QueuedMessage> {
        let level = self.level_of(&message);
        self.levels[level].push_back(message);
        self.count += 1;
        None
    }

    fn pop(&mut self) -> Option<QueuedMessage> {
        let level = self.select_level()?;
        self.charge(level);
        let m = self.levels[level].pop_front();
        if m.is_some() {
            self.count -= 1;
        }
        m
    }

    fn front(&self) -> Option<QueuedMessage> {
        self.select_level().and_then(|l| self.levels[l].front().cloned())
    }

    fn find(&self, position: Position) -> Option<QueuedMessage> {
        self.locate(position).map(|(l, i)| self.levels[l][i].clone())
    }

    fn next_after(&mut self, position: Position) -> Option<QueuedMessage> {
        let mut best: Option<QueuedMessage> = None;
        for level in &self.levels {
            let idx = level.partition_point(|m| m.position <= position);
            if let Some(candidate) = level.get(idx) {
                if best.as_ref().map(|b| candidate.position < b.position).unwrap_or(true) {
                    best = Some(candidate.clone());
                }
            }
        }
        best
    }

    fn remove(&mut self, position: Position) -> Option<QueuedMessage> {
        let (l, i) = self.locate(position)?;
        self.charge(l);
        self.count -= 1;
        self.levels[l].remove(i)
    }

    fn reinsert(&mut self, message: QueuedMessage) {
        let level = self.level_of(&message);
        let idx = self.levels[level].partition_point(|m| m.position < message.position);
        self.levels[level].insert(idx, message);
        self.count += 1;
    }

    fn remove_if(&mut self, predicate: &mut dyn FnMut(&QueuedMessage) -> bool)
        -> Vec<QueuedMessage> {
        let mut matched = Vec::new();
        for level in self.levels.iter_mut() {
            level.retain(|m| {
                if predicate(m) {
                    matched.push(m.clone());
                    false
                } else {
                    true
                }
            });
        }
        self.count -= matched.len();
        matched.sort_by_key(|m| m.position);
        matched
    }

    fn for_each(&self, f: &mut dyn FnMut(&QueuedMessage)) {
        for level in self.levels.iter().rev() {
            for m in level {
                f(m);
            }
        }
    }
}

/* ----------------------------- Last value ------------------------------- */

fn key_of(message: &QueuedMessage, header: &str) -> String {
    message
        .message
        .with_headers(|h| h.get_as_str(header).map(str::to_string))
        .unwrap_or_default()
}

/// Last-value container: at most one live message per value of the
/// configured header. A push carrying an already-present key displaces
/// the older message and takes a fresh tail position.
pub struct MessageMap {
    header: String,
    messages: BTreeMap<Position, QueuedMessage>,
    index: HashMap<String, Position, RandomState>,
}

impl MessageMap {
    pub fn new(header: impl Into<String>) -> Self {
        MessageMap {
            header: header.into(),
            messages: BTreeMap::new(),
            index: HashMap::default(),
        }
    }

    fn insert(&mut self, message: QueuedMessage) {
        self.index.insert(key_of(&message, &self.header), message.position);
        self.messages.insert(message.position, message);
    }

    fn erase(&mut self, position: Position) -> Option<QueuedMessage> {
        let removed = self.messages.remove(&position)?;
        let key = key_of(&removed, &self.header);
        if self.index.get(&key) == Some(&position) {
            self.index.remove(&key);
        }
        Some(removed)
    }

    fn displace(&mut self, message: QueuedMessage) -> Option<QueuedMessage> {
        let key = key_of(&message, &self.header);
        let displaced = self.index.get(&key).copied().and_then(|old| self.messages.remove(&old));
        self.index.insert(key, message.position);
        self.messages.insert(message.position, message);
        displaced
    }
}

impl Messages for MessageMap {
    fn len(&self) -> usize {
        self.messages.len()
    }

    fn push(&mut self, message: QueuedMessage) -> Option<QueuedMessage> {
        self.displace(message)
    }

    fn pop(&mut self) -> Option<QueuedMessage> {
        let position = *self.messages.keys().next()?;
        self.erase(position)
    }

    fn front(&self) -> Option<QueuedMessage> {
        self.messages.values().next().cloned()
    }

    fn find(&self, position: Position) -> Option<QueuedMessage> {
        self.messages.get(&position).cloned()
    }

    fn next_after(&mut self, position: Position) -> Option<QueuedMessage> {
        self.messages
            .range(position + 1..)
            .next()
            .map(|(_, m)| m.clone())
    }

    fn remove(&mut self, position: Position) -> Option<QueuedMessage> {
        self.erase(position)
    }

    fn reinsert(&mut self, message: QueuedMessage) {
        let key = key_of(&message, &self.header);
        if self.index.contains_key(&key) {
            // a newer value for this key arrived while the message was
            // acquired; the stale one stays out
            trace!(position = message.position, "dropping reinsert superseded by newer value");
            return;
        }
        self.insert(message);
    }

    fn remove_if(&mut self, predicate: &mut dyn FnMut(&QueuedMessage) -> bool)
        -> Vec<QueuedMessage> {
        let positions: Vec<Position> = self
            .messages
            .values()
            .filter(|m| predicate(m))
            .map(|m| m.position)
            .collect();
        positions.into_iter().filter_map(|p| self.erase(p)).collect()
    }

    fn for_each(&self, f: &mut dyn FnMut(&QueuedMessage)) {
        for m in self.messages.values() {
            f(m);
        }
    }
}

/* ----------------------------- Legacy LVQ ------------------------------- */

/// Header key the legacy last-value forms match on.
pub const LEGACY_LVQ_KEY: &str = "qpid.LVQ_key";

/// Older last-value behavior. Browsed entries are pinned against
/// displacement unless the queue was declared no-browse, in which case
/// browsing never pins and replacement always wins.
pub struct LegacyLvq {
    map: MessageMap,
    no_browse: bool,
    browsed: HashSet<Position>,
}

impl LegacyLvq {
    pub fn new(no_browse: bool) -> Self {
        LegacyLvq {
            map: MessageMap::new(LEGACY_LVQ_KEY),
            no_browse,
            browsed: HashSet::new(),
        }
    }
}

impl Messages for LegacyLvq {
    fn len(&self) -> usize {
        self.map.len()
    }

    fn push(&mut self, message: QueuedMessage) -> Option<QueuedMessage> {
        let key = key_of(&message, LEGACY_LVQ_KEY);
        if let Some(&old) = self.map.index.get(&key) {
            if !self.no_browse && self.browsed.contains(&old) {
                // a browser holds the old value; let it linger and only
                // repoint the key at the newcomer
                self.map.index.insert(key, message.position);
                self.map.messages.insert(message.position, message);
                return None;
            }
        }
        self.map.displace(message)
    }

    fn pop(&mut self) -> Option<QueuedMessage> {
        let m = self.map.pop();
        if let Some(m) = &m {
            self.browsed.remove(&m.position);
        }
        m
    }

    fn front(&self) -> Option<QueuedMessage> {
        self.map.front()
    }

    fn find(&self, position: Position) -> Option<QueuedMessage> {
        self.map.find(position)
    }

    fn next_after(&mut self, position: Position) -> Option<QueuedMessage> {
        let m = self.map.next_after(position);
        if let Some(m) = &m {
            if !self.no_browse {
                self.browsed.insert(m.position);
            }
        }
        m
    }

    fn remove(&mut self, position: Position) -> Option<QueuedMessage> {
        self.browsed.remove(&position);
        self.map.remove(position)
    }

    fn reinsert(&mut self, message: QueuedMessage) {
        self.map.reinsert(message);
    }

    fn remove_if(&mut self, predicate: &mut dyn FnMut(&QueuedMessage) -> bool)
        -> Vec<QueuedMessage> {
        let removed = self.map.remove_if(predicate);
        for m in &removed {
            self.browsed.remove(&m.position);
        }
        removed
    }

    fn for_each(&self, f: &mut dyn FnMut(&QueuedMessage)) {
        self.map.for_each(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Message;
    use std::sync::Arc;

    fn qm(position: Position) -> QueuedMessage {
        QueuedMessage::new(position, Arc::new(Message::builder("k").finish()))
    }

    fn keyed(position: Position, header: &str, value: &str) -> QueuedMessage {
        QueuedMessage::new(
            position,
            Arc::new(Message::builder("k").header(header, value).finish()),
        )
    }

    fn prioritised(position: Position, priority: u8) -> QueuedMessage {
        QueuedMessage::new(
            position,
            Arc::new(Message::builder("k").priority(priority).finish()),
        )
    }

    #[test]
    fn deque_is_fifo_with_position_lookup() {
        let mut q = MessageDeque::new();
        for p in 1..=4 {
            assert!(q.push(qm(p)).is_none());
        }
        assert_eq!(q.front().unwrap().position, 1);
        assert_eq!(q.next_after(2).unwrap().position, 3);
        assert_eq!(q.remove(3).unwrap().position, 3);
        assert!(q.find(3).is_none());
        assert_eq!(q.pop().unwrap().position, 1);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn deque_reinsert_restores_position_order() {
        let mut q = MessageDeque::new();
        for p in 1..=3 {
            q.push(qm(p));
        }
        let taken = q.remove(2).unwrap();
        q.reinsert(taken);
        let mut seen = Vec::new();
        q.for_each(&mut |m| seen.push(m.position));
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn priority_orders_by_band_then_fifo() {
        let mut q = PriorityQueue::new(10);
        q.push(prioritised(1, 0));
        q.push(prioritised(2, 9));
        q.push(prioritised(3, 9));
        q.push(prioritised(4, 5));
        assert_eq!(q.pop().unwrap().position, 2);
        assert_eq!(q.pop().unwrap().position, 3);
        assert_eq!(q.pop().unwrap().position, 4);
        assert_eq!(q.pop().unwrap().position, 1);
    }

    #[test]
    fn priority_browse_is_position_ordered() {
        let mut q = PriorityQueue::new(10);
        q.push(prioritised(1, 0));
        q.push(prioritised(2, 9));
        assert_eq!(q.next_after(0).unwrap().position, 1);
        assert_eq!(q.next_after(1).unwrap().position, 2);
        assert!(q.next_after(2).is_none());
    }

    #[test]
    fn fairshare_yields_to_lower_band_when_credit_spent() {
        // high band gets 2 deliveries per round, low band 1
        let mut q = PriorityQueue::with_fairshare(2, vec![1, 2]);
        for p in 1..=4 {
            q.push(prioritised(p, 9));
        }
        q.push(prioritised(5, 0));
        q.push(prioritised(6, 0));
        assert_eq!(q.pop().unwrap().position, 1);
        assert_eq!(q.pop().unwrap().position, 2);
        // high band exhausted; low band takes its turn
        assert_eq!(q.pop().unwrap().position, 5);
        // low band spent too: new round begins at the high band
        assert_eq!(q.pop().unwrap().position, 3);
    }

    #[test]
    fn message_map_keeps_last_value_per_key() {
        let mut q = MessageMap::new("k");
        assert!(q.push(keyed(1, "k", "x")).is_none());
        assert!(q.push(keyed(2, "k", "y")).is_none());
        let displaced = q.push(keyed(3, "k", "x")).unwrap();
        assert_eq!(displaced.position, 1);
        assert_eq!(q.len(), 2);
        let mut positions = Vec::new();
        q.for_each(&mut |m| positions.push(m.position));
        assert_eq!(positions, vec![2, 3]);
    }

    #[test]
    fn message_map_reinsert_ignores_superseded_value() {
        let mut q = MessageMap::new("k");
        q.push(keyed(1, "k", "x"));
        let taken = q.remove(1).unwrap();
        q.push(keyed(2, "k", "x"));
        q.reinsert(taken);
        assert_eq!(q.len(), 1);
        assert_eq!(q.front().unwrap().position, 2);
    }

    #[test]
    fn legacy_lvq_pins_browsed_entries() {
        let mut q = LegacyLvq::new(false);
        q.push(keyed(1, LEGACY_LVQ_KEY, "x"));
        assert_eq!(q.next_after(0).unwrap().position, 1); // browse pins
        assert!(q.push(keyed(2, LEGACY_LVQ_KEY, "x")).is_none());
        assert_eq!(q.len(), 2);

        let mut q = LegacyLvq::new(true);
        q.push(keyed(1, LEGACY_LVQ_KEY, "x"));
        assert_eq!(q.next_after(0).unwrap().position, 1); // no pin
        let displaced = q.push(keyed(2, LEGACY_LVQ_KEY, "x")).unwrap();
        assert_eq!(displaced.position, 1);
        assert_eq!(q.len(), 1);
    }
}
