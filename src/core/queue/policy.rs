//! Count/size caps and overflow behavior.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::core::error::{Error, Result};
use crate::core::message::{Message, Position, QueuedMessage};
use crate::core::values::FieldTable;

pub const MAX_COUNT_KEY: &str = "qpid.max_count";
pub const MAX_SIZE_KEY: &str = "qpid.max_size";
pub const POLICY_TYPE_KEY: &str = "qpid.policy_type";

/// What happens when a capped queue overflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyKind {
    /// Refuse the new message.
    #[default]
    Reject,
    /// Evict from the head to make room.
    Ring,
    /// Let the message in but release its content to the store.
    FlowToDisk,
}

impl PolicyKind {
    pub fn parse(value: &str) -> Option<PolicyKind> {
        match value {
            "reject" => Some(PolicyKind::Reject),
            "ring" => Some(PolicyKind::Ring),
            "flow_to_disk" | "flow-to-disk" => Some(PolicyKind::FlowToDisk),
            _ => None,
        }
    }
}

/// Enforces the configured caps for one queue. All methods are called
/// under the queue's message lock; evictions decided here are handed
/// back as a work list and performed by the caller after the lock is
/// released, so the view can briefly overshoot while those complete.
pub struct QueuePolicy {
    queue: String,
    kind: PolicyKind,
    max_count: u64,
    max_size: u64,
    count: u64,
    size: u64,
    /// Ring only: the policy's view of what is resident, oldest first.
    view: VecDeque<QueuedMessage>,
    /// Ring only: evictions announced but not yet performed.
    pending: Vec<QueuedMessage>,
    pending_positions: HashSet<Position>,
}

impl QueuePolicy {
    /// Build a policy from declare arguments; `None` when no cap is
    /// configured.
    pub fn from_args(queue: &str, args: &FieldTable) -> Option<QueuePolicy> {
        let max_count = args.integer_setting(MAX_COUNT_KEY).max(0) as u64;
        let max_size = args.integer_setting(MAX_SIZE_KEY).max(0) as u64;
        if max_count == 0 && max_size == 0 {
            return None;
        }
        let kind = args
            .get_as_str(POLICY_TYPE_KEY)
            .and_then(PolicyKind::parse)
            .unwrap_or_default();
        debug!(
            queue,
            ?kind, max_count, max_size, "configured queue policy"
        );
        Some(QueuePolicy {
            queue: queue.to_string(),
            kind,
            max_count,
            max_size,
            count: 0,
            size: 0,
            view: VecDeque::new(),
            pending: Vec::new(),
            pending_positions: HashSet::new(),
        })
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    /// Fall back to rejecting overflow; used when flow-to-disk was
    /// requested on a queue with no store behind it.
    pub fn demote_to_reject(&mut self) {
        self.kind = PolicyKind::Reject;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn over_limit(&self, extra_count: u64, extra_size: u64) -> bool {
        // evictions already announced are treated as gone
        let (pending_count, pending_size) = self.pending_totals();
        let count = self.count - pending_count + extra_count;
        let size = self.size - pending_size + extra_size;
        (self.max_count != 0 && count > self.max_count)
            || (self.max_size != 0 && size > self.max_size)
    }

    fn pending_totals(&self) -> (u64, u64) {
        let count = self.pending_positions.len() as u64;
        let size: u64 = self
            .view
            .iter()
            .filter(|m| self.pending_positions.contains(&m.position))
            .map(|m| m.message.content_size())
            .sum();
        (count, size)
    }

    /// Admission check for a message about to be pushed.
    pub fn try_enqueue(&mut self, message: &Arc<Message>) -> Result<()> {
        let incoming = message.content_size();
        if !self.over_limit(1, incoming) {
            self.count += 1;
            self.size += incoming;
            return Ok(());
        }
        match self.kind {
            PolicyKind::Reject => Err(Error::ResourceLimitExceeded {
                queue: self.queue.clone(),
                reason: format!(
                    "policy {}:{} exceeded at count {} size {}",
                    self.max_count, self.max_size, self.count, self.size
                ),
            }),
            PolicyKind::FlowToDisk => {
                message.release_content();
                self.count += 1;
                self.size += incoming;
                Ok(())
            }
            PolicyKind::Ring => {
                while self.over_limit(1, incoming) {
                    let victim = self
                        .view
                        .iter()
                        .find(|m| !self.pending_positions.contains(&m.position))
                        .cloned();
                    match victim {
                        Some(victim) => {
                            debug!(
                                queue = %self.queue,
                                position = victim.position,
                                "ring policy evicting head message"
                            );
                            self.pending_positions.insert(victim.position);
                            self.pending.push(victim);
                        }
                        None => {
                            // nothing evictable frees enough room
                            return Err(Error::ResourceLimitExceeded {
                                queue: self.queue.clone(),
                                reason: format!(
                                    "message of {} bytes cannot fit within {}:{}",
                                    incoming, self.max_count, self.max_size
                                ),
                            });
                        }
                    }
                }
                self.count += 1;
                self.size += incoming;
                Ok(())
            }
        }
    }

    /// Drain the evictions announced by [`QueuePolicy::try_enqueue`];
    /// the caller dequeues them outside the message lock.
    pub fn get_pending_dequeues(&mut self, out: &mut Vec<QueuedMessage>) {
        out.append(&mut self.pending);
    }

    /// A message landed in the container.
    pub fn enqueued(&mut self, message: &QueuedMessage) {
        if self.kind == PolicyKind::Ring {
            self.view.push_back(message.clone());
        }
    }

    /// A message is gone for good.
    pub fn dequeued(&mut self, message: &QueuedMessage) {
        self.count = self.count.saturating_sub(1);
        self.size = self.size.saturating_sub(message.message.content_size());
        if self.kind == PolicyKind::Ring {
            if let Some(i) = self.view.iter().position(|m| m.position == message.position) {
                self.view.remove(i);
            }
            self.pending_positions.remove(&message.position);
        }
    }

    /// Count a message restored during recovery (no admission check).
    pub fn recover_enqueued(&mut self, message: &Arc<Message>) {
        self.count += 1;
        self.size += message.content_size();
    }

    /// Undo the accounting of an admission whose transaction aborted
    /// before the push.
    pub fn enqueue_aborted(&mut self, message: &Arc<Message>) {
        self.count = self.count.saturating_sub(1);
        self.size = self.size.saturating_sub(message.content_size());
    }

    /// The policy's truth about whether a message is still enqueued.
    /// Used to ignore duplicate dequeue attempts.
    pub fn is_enqueued(&self, message: &QueuedMessage) -> bool {
        match self.kind {
            PolicyKind::Ring => self.view.iter().any(|m| m.position == message.position),
            _ => true,
        }
    }
}
