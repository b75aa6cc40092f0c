//! The queue engine.
//!
//! A queue accepts messages from exchanges, stores them in a pluggable
//! ordered container, and dispatches them to consumers under the
//! configured delivery discipline (FIFO, priority/fairshare, last-value
//! or message groups). It coordinates with an optional persistent
//! store, enforces count/size policies, supports browsing alongside
//! destructive consumption, expires messages, and deletes itself when
//! configured to.
//!
//! Lock hierarchy, always taken in this order and never held across
//! store I/O or consumer callbacks:
//! 1. ownership lock
//! 2. consumer lock
//! 3. message lock

pub mod allocator;
pub mod barrier;
pub mod group;
pub mod listeners;
pub mod messages;
pub mod policy;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::core::cluster::ClusterSafety;
use crate::core::consumer::Consumer;
use crate::core::error::{Error, Result};
use crate::core::exchange::{Exchange, ExchangeRegistry};
use crate::core::message::{Message, Position, QueuedMessage};
use crate::core::observer::QueueObserver;
use crate::core::store::{Store, TransactionContext};
use crate::core::timer::{Timer, TimerTask};
use crate::core::values::{FieldTable, FieldValue};

use allocator::{FifoAllocator, MessageAllocator};
use barrier::{ScopedUse, UsageBarrier};
use group::MessageGroupManager;
use listeners::{NotificationSet, QueueListeners};
use messages::{LegacyLvq, MessageDeque, MessageMap, Messages, PriorityQueue};
use policy::{PolicyKind, QueuePolicy};

pub const NO_LOCAL_KEY: &str = "no-local";
pub const TRACE_ID_KEY: &str = "qpid.trace.id";
pub const TRACE_EXCLUDE_KEY: &str = "qpid.trace.exclude";
pub const LVQ_KEY: &str = "qpid.last_value_queue_key";
pub const LEGACY_LVQ_FLAG: &str = "qpid.last_value_queue";
pub const LEGACY_LVQ_NO_BROWSE_FLAG: &str = "qpid.last_value_queue_no_browse";
pub const PERSIST_LAST_NODE_KEY: &str = "qpid.persist_last_node";
pub const EVENT_GENERATION_KEY: &str = "qpid.queue_event_generation";
pub const AUTO_DELETE_TIMEOUT_KEY: &str = "qpid.auto_delete_timeout";
pub const INSERT_SEQUENCE_NUMBERS_KEY: &str = "qpid.insert_sequence_numbers";
pub const PRIORITIES_KEY: &str = "x-qpid-priorities";
pub const FAIRSHARE_KEY: &str = "x-qpid-fairshare";

/// State protected by the message lock.
struct QueueState {
    messages: Box<dyn Messages>,
    sequence: Position,
    listeners: QueueListeners,
    policy: Option<QueuePolicy>,
    allocator: Box<dyn MessageAllocator>,
    observers: Vec<Arc<dyn QueueObserver>>,
    seq_no_key: Option<String>,
}

/// State protected by the consumer lock.
#[derive(Default)]
struct ConsumerState {
    count: u32,
    /// Session holding an exclusive subscription.
    exclusive: Option<String>,
}

/// Declare-time behavior switches, written once at configure.
#[derive(Default)]
struct QueueTraits {
    no_local: bool,
    persist_last_node: bool,
    trace_id: Option<String>,
    trace_exclude: Vec<String>,
    auto_delete_timeout: Duration,
    event_mode: u8,
}

/// Record of a binding made through this queue, for unbind on delete.
struct BindingRecord {
    exchange: String,
    key: String,
    args: FieldTable,
}

/// Management counters.
#[derive(Default)]
pub struct QueueStats {
    pub msg_enqueues: AtomicU64,
    pub byte_enqueues: AtomicU64,
    pub msg_dequeues: AtomicU64,
    pub byte_dequeues: AtomicU64,
}

enum ConsumeOutcome {
    Consumed(QueuedMessage),
    CantConsume { wake_others: bool },
    NoMessages,
    Expired(QueuedMessage),
}

pub struct Queue {
    name: String,
    autodelete: bool,
    store: RwLock<Option<Arc<dyn Store>>>,
    /// Ownership lock (level 1).
    owner: Mutex<Option<String>>,
    /// Consumer lock (level 2).
    consumers: Mutex<ConsumerState>,
    /// Message lock (level 3).
    state: Mutex<QueueState>,
    traits: RwLock<QueueTraits>,
    in_last_node_failure: AtomicBool,
    barrier: UsageBarrier,
    alternate_exchange: RwLock<Option<Arc<Exchange>>>,
    alternate_exchange_name: Mutex<Option<String>>,
    bindings: Mutex<Vec<BindingRecord>>,
    auto_delete_task: Mutex<Option<Arc<TimerTask>>>,
    pending_dequeues: Mutex<Vec<QueuedMessage>>,
    cluster: RwLock<Option<Arc<dyn ClusterSafety>>>,
    dequeue_since_purge: AtomicU64,
    persistence_id: AtomicU64,
    stats: QueueStats,
}

impl Queue {
    pub fn new(
        name: impl Into<String>,
        autodelete: bool,
        store: Option<Arc<dyn Store>>,
        owner: Option<String>,
    ) -> Arc<Queue> {
        Arc::new(Queue {
            name: name.into(),
            autodelete,
            store: RwLock::new(store),
            owner: Mutex::new(owner),
            consumers: Mutex::new(ConsumerState::default()),
            state: Mutex::new(QueueState {
                messages: Box::new(MessageDeque::new()),
                sequence: 0,
                listeners: QueueListeners::default(),
                policy: None,
                allocator: Box::new(FifoAllocator),
                observers: Vec::new(),
                seq_no_key: None,
            }),
            traits: RwLock::new(QueueTraits::default()),
            in_last_node_failure: AtomicBool::new(false),
            barrier: UsageBarrier::default(),
            alternate_exchange: RwLock::new(None),
            alternate_exchange_name: Mutex::new(None),
            bindings: Mutex::new(Vec::new()),
            auto_delete_task: Mutex::new(None),
            pending_dequeues: Mutex::new(Vec::new()),
            cluster: RwLock::new(None),
            dequeue_since_purge: AtomicU64::new(0),
            persistence_id: AtomicU64::new(0),
            stats: QueueStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_autodelete(&self) -> bool {
        self.autodelete
    }

    pub fn is_durable(&self) -> bool {
        self.store.read().is_some()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    fn store(&self) -> Option<Arc<dyn Store>> {
        self.store.read().clone()
    }

    /// Create the queue in the store (if any) and apply settings.
    pub fn create(&self, settings: &FieldTable) -> Result<()> {
        if let Some(store) = self.store() {
            store.create(&self.name, settings)?;
        }
        self.configure(settings);
        Ok(())
    }

    /// Apply declare-time arguments: container selection, policy,
    /// allocator and behavior flags.
    pub fn configure(&self, settings: &FieldTable) {
        let mut policy = QueuePolicy::from_args(&self.name, settings);
        if let Some(p) = &mut policy {
            if p.kind() == PolicyKind::FlowToDisk && self.store().is_none() {
                warn!(queue = %self.name, "flow to disk not valid for non-persisted queue");
                p.demote_to_reject();
            }
        }

        let mut container: Box<dyn Messages> = if let Some(key) = settings.get_as_str(LVQ_KEY) {
            debug!(queue = %self.name, key, "configured as last value queue");
            Box::new(MessageMap::new(key))
        } else if settings.flag(LEGACY_LVQ_NO_BROWSE_FLAG) {
            debug!(queue = %self.name, "configured as legacy last value queue with no-browse");
            Box::new(LegacyLvq::new(true))
        } else if settings.flag(LEGACY_LVQ_FLAG) {
            debug!(queue = %self.name, "configured as legacy last value queue");
            Box::new(LegacyLvq::new(false))
        } else if settings.integer_setting(PRIORITIES_KEY) > 0 {
            let levels = settings.integer_setting(PRIORITIES_KEY).clamp(1, 10) as usize;
            debug!(queue = %self.name, levels, "configured as priority queue");
            match fairshare_from_args(settings, levels) {
                Some(shares) => Box::new(PriorityQueue::with_fairshare(levels, shares)),
                None => Box::new(PriorityQueue::new(levels)),
            }
        } else {
            Box::new(MessageDeque::new())
        };

        // message grouping replaces the allocator, default container only
        let mut allocator: Box<dyn MessageAllocator> = Box::new(FifoAllocator);
        if settings.contains_key(group::GROUP_HEADER_KEY) {
            if settings.get_as_str(LVQ_KEY).is_some()
                || settings.flag(LEGACY_LVQ_FLAG)
                || settings.flag(LEGACY_LVQ_NO_BROWSE_FLAG)
                || settings.integer_setting(PRIORITIES_KEY) > 0
            {
                error!(queue = %self.name, "message grouping requires the default queue type");
            } else if let Some(manager) = MessageGroupManager::from_args(&self.name, settings) {
                allocator = Box::new(manager);
                container = Box::new(MessageDeque::new());
            }
        }

        {
            let mut st = self.state.lock();
            st.messages = container;
            st.allocator = allocator;
            st.policy = policy;
            st.seq_no_key = settings
                .get_as_str(INSERT_SEQUENCE_NUMBERS_KEY)
                .filter(|k| !k.is_empty())
                .map(str::to_string);
        }

        let mut traits = self.traits.write();
        traits.no_local = settings.flag(NO_LOCAL_KEY);
        traits.persist_last_node = settings.flag(PERSIST_LAST_NODE_KEY);
        if traits.persist_last_node {
            debug!(queue = %self.name, "configured to persist data if cluster fails to one node");
        }
        traits.trace_id = settings.get_as_str(TRACE_ID_KEY).map(str::to_string);
        traits.trace_exclude = settings
            .get_as_str(TRACE_EXCLUDE_KEY)
            .map(|s| {
                s.split(',')
                    .map(|e| e.trim().to_string())
                    .filter(|e| !e.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        traits.auto_delete_timeout =
            Duration::from_secs(settings.integer_setting(AUTO_DELETE_TIMEOUT_KEY).max(0) as u64);
        traits.event_mode = settings.integer_setting(EVENT_GENERATION_KEY).clamp(0, 2) as u8;
    }

    pub fn add_observer(&self, observer: Arc<dyn QueueObserver>) {
        self.state.lock().observers.push(observer);
    }

    pub fn set_cluster(&self, cluster: Arc<dyn ClusterSafety>) {
        *self.cluster.write() = Some(cluster);
    }

    fn assert_cluster_safe(&self) {
        if let Some(cluster) = &*self.cluster.read() {
            debug_assert!(cluster.is_safe(), "queue mutated outside cluster-safe context");
        }
    }

    // --- deletion state ---

    pub fn is_deleted(&self) -> bool {
        self.barrier.is_deleted()
    }

    fn check_not_deleted(&self) -> Result<()> {
        if self.is_deleted() {
            Err(Error::ResourceDeleted(self.name.clone()))
        } else {
            Ok(())
        }
    }

    // --- enqueue path ---

    fn is_local(&self, msg: &Message) -> bool {
        let traits = self.traits.read();
        if !traits.no_local {
            return false;
        }
        // local = published on the session owning the queue or holding
        // its exclusive subscription
        let Some(publisher) = msg.publisher() else { return false };
        if self.owner.lock().as_deref() == Some(publisher) {
            return true;
        }
        self.consumers.lock().exclusive.as_deref() == Some(publisher)
    }

    fn is_trace_excluded(&self, msg: &Message) -> bool {
        let traits = self.traits.read();
        !traits.trace_exclude.is_empty() && msg.is_excluded(&traits.trace_exclude)
    }

    /// Route a message into this queue, applying the local and trace
    /// filters first.
    pub fn deliver(&self, msg: Arc<Message>) -> Result<()> {
        if let Some(cluster) = &*self.cluster.read() {
            if cluster.defer_delivery(&self.name, &msg) {
                return Ok(());
            }
        }
        if msg.is_immediate() && self.consumer_count() == 0 {
            if let Some(alternate) = self.alternate_exchange() {
                if let Err(e) = alternate.route(&msg) {
                    warn!(queue = %self.name, "failed to reroute immediate message: {e}");
                }
            }
            return Ok(());
        }
        if self.is_local(&msg) {
            info!(queue = %self.name, "dropping 'local' message");
            return Ok(());
        }
        if self.is_trace_excluded(&msg) {
            info!(queue = %self.name, "dropping excluded message");
            return Ok(());
        }
        let mut msg = msg;
        self.enqueue(None, &mut msg, false)?;
        self.push(&msg, false);
        debug!(queue = %self.name, "message enqueued");
        Ok(())
    }

    /// Transactional completion path: message was already enqueued
    /// against the store, only the in-memory push remains.
    pub fn process(&self, msg: &Arc<Message>) {
        self.push(msg, false);
    }

    /// Store-side admission: policy check, last-node forcing, tracing,
    /// and the asynchronous store enqueue. Returns whether the store
    /// was engaged. The message handle may be replaced when tracing
    /// requires a private copy.
    pub fn enqueue(
        &self,
        ctx: Option<&dyn TransactionContext>,
        msg: &mut Arc<Message>,
        suppress_policy: bool,
    ) -> Result<bool> {
        let used = ScopedUse::new(&self.barrier);
        if !used.acquired {
            return Err(Error::ResourceDeleted(self.name.clone()));
        }

        if !suppress_policy {
            let mut pending = Vec::new();
            {
                let mut st = self.state.lock();
                if let Some(policy) = st.policy.as_mut() {
                    policy.try_enqueue(msg)?;
                    policy.get_pending_dequeues(&mut pending);
                }
            }
            // policy evictions are performed without holding the lock
            for victim in pending {
                self.evict(victim)?;
            }
        }

        if self.in_last_node_failure() && self.persist_last_node() {
            msg.force_persistent();
        }

        let trace_id = self.traits.read().trace_id.clone();
        if let Some(trace_id) = trace_id {
            // deep copy before mutating: the original frames may already
            // be in flight on other queues
            let copy = Arc::new(msg.deep_copy());
            copy.add_trace_id(&trace_id);
            *msg = copy;
        }

        if msg.is_persistent() || msg.content_releasable() {
            if let Some(store) = self.store() {
                // the store must answer with enqueue_complete once the
                // message is durably written
                msg.enqueue_async(&self.name);
                store.enqueue(ctx, msg, &self.name)?;
                return Ok(true);
            }
        }
        if self.store().is_none() {
            // transient queue: content must stay resident to remain
            // deliverable
            msg.block_content_release();
        }
        Ok(false)
    }

    pub fn enqueue_aborted(&self, msg: &Arc<Message>) {
        let mut st = self.state.lock();
        if let Some(policy) = st.policy.as_mut() {
            policy.enqueue_aborted(msg);
        }
    }

    /// Place a message into the container, assign its position, and
    /// wake a waiting consumer.
    fn push(&self, msg: &Arc<Message>, is_recovery: bool) {
        self.assert_cluster_safe();
        let mut set = NotificationSet::default();
        let displaced = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            st.sequence += 1;
            let position = st.sequence;
            if let Some(key) = st.seq_no_key.clone() {
                msg.set_header(key, position as i64);
            }
            let qm = QueuedMessage::new(position, Arc::clone(msg));
            let displaced = st.messages.push(qm.clone());
            st.listeners.populate(&mut set);
            self.enqueued_event(st, &qm);
            displaced
        };
        set.notify();

        if let Some(victim) = displaced {
            {
                let mut st = self.state.lock();
                self.acquired_event(&mut st, &victim);
            }
            if is_recovery {
                // no new store requests until recovery completes
                self.pending_dequeues.lock().push(victim);
            } else if let Err(e) = self.dequeue(None, &victim) {
                warn!(queue = %self.name, "dequeue of displaced message failed: {e}");
            }
        }
    }

    /// Remove a policy-evicted message from the container and dequeue it.
    fn evict(&self, victim: QueuedMessage) -> Result<()> {
        {
            let mut st = self.state.lock();
            if st.messages.remove(victim.position).is_none() {
                return Ok(());
            }
            self.acquired_event(&mut st, &victim);
        }
        self.dequeue(None, &victim)?;
        Ok(())
    }

    // --- dispatch path ---

    /// Offer the next available message to `consumer`. Returns whether
    /// a message was delivered.
    pub fn dispatch(&self, consumer: &Arc<dyn Consumer>) -> Result<bool> {
        match self.get_next_message(consumer)? {
            Some(qm) => {
                consumer.deliver(&qm);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn get_next_message(&self, consumer: &Arc<dyn Consumer>) -> Result<Option<QueuedMessage>> {
        self.check_not_deleted()?;
        if consumer.pre_acquires() {
            self.consume_next_message(consumer)
        } else {
            self.browse_next_message(consumer)
        }
    }

    fn consume_next_message(&self, consumer: &Arc<dyn Consumer>) -> Result<Option<QueuedMessage>> {
        loop {
            let outcome = {
                let mut guard = self.state.lock();
                let st = &mut *guard;
                match st.allocator.next_consumable(consumer.as_ref(), st.messages.as_mut()) {
                    None => {
                        debug!(
                            queue = %self.name,
                            consumer = consumer.name(),
                            "no messages available to dispatch"
                        );
                        st.listeners.add_listener(Arc::clone(consumer));
                        ConsumeOutcome::NoMessages
                    }
                    Some(qm) => {
                        if qm.message.has_expired() {
                            debug!(queue = %self.name, position = qm.position, "message expired");
                            consumer.set_position(qm.position);
                            if st.messages.remove(qm.position).is_some() {
                                self.acquired_event(st, &qm);
                                self.dequeue_since_purge.fetch_add(1, Ordering::Relaxed);
                            }
                            ConsumeOutcome::Expired(qm)
                        } else if !consumer.filter(&qm.message) {
                            // consumer will never want it; move past and
                            // leave other listeners asleep
                            consumer.set_position(qm.position);
                            ConsumeOutcome::CantConsume { wake_others: false }
                        } else if !consumer.accept(&qm.message) {
                            debug!(
                                queue = %self.name,
                                consumer = consumer.name(),
                                "consumer can't currently accept message"
                            );
                            ConsumeOutcome::CantConsume { wake_others: true }
                        } else {
                            let permitted = st.allocator.acquire(consumer.name(), &qm);
                            debug_assert!(permitted, "allocator denied an acquire it offered");
                            st.messages.remove(qm.position);
                            self.acquired_event(st, &qm);
                            self.dequeue_since_purge.fetch_add(1, Ordering::Relaxed);
                            consumer.set_position(qm.position);
                            ConsumeOutcome::Consumed(qm)
                        }
                    }
                }
            };
            match outcome {
                ConsumeOutcome::Consumed(qm) => return Ok(Some(qm)),
                ConsumeOutcome::NoMessages => return Ok(None),
                ConsumeOutcome::CantConsume { wake_others } => {
                    if wake_others {
                        self.notify_listener();
                    }
                    return Ok(None);
                }
                ConsumeOutcome::Expired(qm) => {
                    // the store dequeue happens outside the lock
                    self.dequeue(None, &qm)?;
                }
            }
        }
    }

    fn browse_next_message(&self, consumer: &Arc<dyn Consumer>) -> Result<Option<QueuedMessage>> {
        loop {
            let candidate = {
                let mut guard = self.state.lock();
                let st = &mut *guard;
                match st.allocator.next_browsable(consumer.as_ref(), st.messages.as_mut()) {
                    Some(qm) => Some(qm),
                    None => {
                        st.listeners.add_listener(Arc::clone(consumer));
                        None
                    }
                }
            };
            let Some(qm) = candidate else { return Ok(None) };
            if consumer.filter(&qm.message) && !qm.message.has_expired() {
                if consumer.accept(&qm.message) {
                    consumer.set_position(qm.position);
                    return Ok(Some(qm));
                }
                debug!(queue = %self.name, "browser can't currently accept message");
                return Ok(None);
            }
            // never wanted; keep seeking
            consumer.set_position(qm.position);
        }
    }

    /// Wake one round of waiting consumers if messages remain.
    pub fn notify_listener(&self) {
        self.assert_cluster_safe();
        let mut set = NotificationSet::default();
        {
            let mut st = self.state.lock();
            if !st.messages.is_empty() {
                st.listeners.populate(&mut set);
            }
        }
        set.notify();
    }

    // --- direct acquisition ---

    /// Destructively take the front message (acquired, not dequeued).
    pub fn get(&self) -> Option<QueuedMessage> {
        let mut st = self.state.lock();
        let qm = st.messages.pop()?;
        self.acquired_event(&mut st, &qm);
        self.dequeue_since_purge.fetch_add(1, Ordering::Relaxed);
        Some(qm)
    }

    /// Acquire the message at a specific position, if present.
    pub fn acquire_message_at(&self, position: Position) -> Option<QueuedMessage> {
        self.assert_cluster_safe();
        let mut st = self.state.lock();
        trace!(queue = %self.name, position, "attempting to acquire message");
        let qm = st.messages.remove(position)?;
        self.acquired_event(&mut st, &qm);
        self.dequeue_since_purge.fetch_add(1, Ordering::Relaxed);
        Some(qm)
    }

    /// Allocator-checked acquire on behalf of a named consumer.
    pub fn acquire(&self, qm: &QueuedMessage, consumer: &str) -> bool {
        self.assert_cluster_safe();
        let mut st = self.state.lock();
        if !st.allocator.acquire(consumer, qm) {
            debug!(
                queue = %self.name,
                consumer,
                position = qm.position,
                "not permitted to acquire message"
            );
            return false;
        }
        if st.messages.remove(qm.position).is_some() {
            self.acquired_event(&mut st, qm);
            self.dequeue_since_purge.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn find(&self, position: Position) -> Option<QueuedMessage> {
        self.state.lock().messages.find(position)
    }

    // --- requeue ---

    /// Restore a previously acquired message at its original position.
    pub fn requeue(&self, qm: &QueuedMessage) {
        self.assert_cluster_safe();
        let mut set = NotificationSet::default();
        let need_force = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if !is_enqueued_per_policy(st, qm) {
                return;
            }
            st.messages.reinsert(qm.clone());
            st.listeners.populate(&mut set);
            self.requeued_event(st, qm);
            self.in_last_node_failure()
                && self.persist_last_node()
                && !qm.message.is_stored_on(&self.name)
        };
        if need_force {
            // don't force a message to disk twice
            qm.message.force_persistent();
            if qm.message.is_forced_persistent() {
                let mut payload = Arc::clone(&qm.message);
                if let Err(e) = self.enqueue(None, &mut payload, false) {
                    error!(queue = %self.name, "failed to persist requeued message: {e}");
                }
            }
        }
        set.notify();
    }

    // --- dequeue ---

    /// Permanently remove a message: observer/policy bookkeeping plus
    /// the asynchronous store dequeue. Returns whether the store was
    /// engaged.
    pub fn dequeue(
        &self,
        ctx: Option<&dyn TransactionContext>,
        qm: &QueuedMessage,
    ) -> Result<bool> {
        let used = ScopedUse::new(&self.barrier);
        if !used.acquired {
            return Ok(false);
        }
        {
            let mut st = self.state.lock();
            if !is_enqueued_per_policy(&st, qm) {
                return Ok(false);
            }
            if ctx.is_none() {
                self.dequeued_event(&mut st, qm);
            }
        }
        // a message forced persistent on one queue must not dequeue
        // from a store it was never enqueued into
        let forced = qm.message.is_forced_persistent();
        if !forced || qm.message.is_stored_on(&self.name) {
            if qm.message.is_persistent() || qm.message.content_releasable() {
                if let Some(store) = self.store() {
                    qm.message.dequeue_async(&self.name);
                    store.dequeue(ctx, &qm.message, &self.name)?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Transactional dequeue commit: bookkeeping only.
    pub fn dequeue_committed(&self, qm: &QueuedMessage) {
        let mut st = self.state.lock();
        self.dequeued_event(&mut st, qm);
    }

    // --- expiry, purge and move ---

    /// Sweep expired messages. Skipped when dequeues since the last
    /// sweep already outpace one per second, since expiry is then
    /// happening organically on the dispatch path.
    pub fn purge_expired(&self, lapse: Duration) -> Result<usize> {
        let count = self.dequeue_since_purge.swap(0, Ordering::Relaxed);
        let seconds = lapse.as_secs();
        if seconds != 0 && count / seconds >= 1 {
            return Ok(0);
        }
        let expired = {
            let mut st = self.state.lock();
            st.messages.remove_if(&mut |qm| qm.message.has_expired())
        };
        let removed = expired.len();
        for qm in expired {
            {
                let mut st = self.state.lock();
                self.acquired_event(&mut st, &qm);
            }
            self.dequeue(None, &qm)?;
        }
        Ok(removed)
    }

    /// Remove up to `request` matching messages (0 = all), optionally
    /// rerouting them through `dest`. Safe even when the reroute lands
    /// back on this queue.
    pub fn purge(
        &self,
        request: u32,
        dest: Option<&Arc<Exchange>>,
        filter: Option<&FieldTable>,
    ) -> Result<usize> {
        let filter = MessageFilter::from_args(filter);
        let matches = self.collect_matches(request, &filter);
        for qm in &matches {
            {
                let mut st = self.state.lock();
                self.acquired_event(&mut st, qm);
            }
            self.dequeue(None, qm)?;
            if let Some(dest) = dest {
                if let Err(e) = dest.route_with_alternate(&qm.message) {
                    warn!(queue = %self.name, "failed to reroute purged message: {e}");
                }
            }
        }
        Ok(matches.len())
    }

    /// Move up to `qty` matching messages (0 = all) to another queue.
    /// Safe even when the destination is this same queue.
    pub fn move_messages(
        &self,
        dest: &Arc<Queue>,
        qty: u32,
        filter: Option<&FieldTable>,
    ) -> Result<usize> {
        let filter = MessageFilter::from_args(filter);
        let matches = self.collect_matches(qty, &filter);
        for qm in &matches {
            {
                let mut st = self.state.lock();
                self.acquired_event(&mut st, qm);
            }
            self.dequeue(None, qm)?;
            if let Err(e) = dest.deliver(Arc::clone(&qm.message)) {
                warn!(
                    queue = %self.name,
                    dest = dest.name(),
                    "failed to deliver moved message: {e}"
                );
            }
        }
        Ok(matches.len())
    }

    fn collect_matches(&self, cap: u32, filter: &MessageFilter) -> Vec<QueuedMessage> {
        let mut st = self.state.lock();
        let mut taken = 0u32;
        st.messages.remove_if(&mut |qm| {
            if (cap == 0 || taken < cap) && filter.matches(qm) {
                taken += 1;
                true
            } else {
                false
            }
        })
    }

    // --- consumers and exclusivity ---

    pub fn consume(&self, consumer: &Arc<dyn Consumer>, request_exclusive: bool) -> Result<()> {
        self.assert_cluster_safe();
        {
            let mut cs = self.consumers.lock();
            if cs.exclusive.is_some() {
                return Err(Error::ResourceLocked(self.name.clone()));
            }
            if request_exclusive {
                if cs.count > 0 {
                    return Err(Error::ResourceLocked(self.name.clone()));
                }
                let session = consumer.session_id().unwrap_or_else(|| consumer.name());
                cs.exclusive = Some(session.to_string());
            }
            cs.count += 1;
            // reset the auto-deletion timer if one is pending
            if let Some(task) = self.auto_delete_task.lock().take() {
                task.cancel();
            }
        }
        let mut st = self.state.lock();
        st.allocator.on_consumer_added(consumer.name());
        for observer in &st.observers {
            guarded(&self.name, "consumer-added", || {
                observer.consumer_added(consumer.as_ref())
            });
        }
        Ok(())
    }

    pub fn cancel(&self, consumer: &Arc<dyn Consumer>) {
        self.remove_listener(consumer);
        {
            let mut cs = self.consumers.lock();
            cs.count = cs.count.saturating_sub(1);
            cs.exclusive = None;
        }
        let mut st = self.state.lock();
        st.allocator.on_consumer_removed(consumer.name());
        for observer in &st.observers {
            guarded(&self.name, "consumer-removed", || {
                observer.consumer_removed(consumer.as_ref())
            });
        }
    }

    fn remove_listener(&self, consumer: &Arc<dyn Consumer>) {
        let mut set = NotificationSet::default();
        {
            let mut st = self.state.lock();
            st.listeners.remove_listener(consumer.name());
            if !st.messages.is_empty() {
                st.listeners.populate(&mut set);
            }
        }
        set.notify();
    }

    pub fn consumer_count(&self) -> u32 {
        self.consumers.lock().count
    }

    pub fn has_exclusive_consumer(&self) -> bool {
        self.consumers.lock().exclusive.is_some()
    }

    pub fn set_exclusive_owner(&self, owner: &str) -> bool {
        // reset the auto-deletion timer if one is pending
        if let Some(task) = self.auto_delete_task.lock().take() {
            task.cancel();
        }
        let mut current = self.owner.lock();
        if current.is_some() {
            false
        } else {
            *current = Some(owner.to_string());
            true
        }
    }

    pub fn release_exclusive_ownership(&self) {
        *self.owner.lock() = None;
    }

    pub fn is_exclusive_owner(&self, owner: &str) -> bool {
        self.owner.lock().as_deref() == Some(owner)
    }

    pub fn has_exclusive_owner(&self) -> bool {
        self.owner.lock().is_some()
    }

    // --- auto-deletion ---

    pub fn can_auto_delete(&self) -> bool {
        if !self.autodelete {
            return false;
        }
        let unowned = self.owner.lock().is_none();
        unowned && self.consumers.lock().count == 0
    }

    fn auto_delete_timeout(&self) -> Duration {
        self.traits.read().auto_delete_timeout
    }

    /// Delete the queue now, or schedule deletion after the configured
    /// timeout. The timed task re-checks eligibility when it fires, so
    /// a consumer subscribing in the meantime keeps the queue alive.
    pub fn try_auto_delete(queue: &Arc<Queue>, timer: &Timer, exchanges: &Arc<ExchangeRegistry>) {
        let timeout = queue.auto_delete_timeout();
        if !timeout.is_zero() && queue.can_auto_delete() {
            let q = Arc::clone(queue);
            let ex = Arc::clone(exchanges);
            let task = TimerTask::new(format!("auto-delete:{}", queue.name()), timeout, move || {
                // the queue may have been used after the task was
                // created but before it fired
                if q.can_auto_delete() && !q.is_deleted() {
                    debug!(queue = %q.name(), "auto-deleting");
                    q.destroyed(&ex);
                }
            });
            *queue.auto_delete_task.lock() = Some(Arc::clone(&task));
            timer.add(task);
            debug!(queue = %queue.name(), "timed auto-delete initiated");
        } else if queue.can_auto_delete() && !queue.is_deleted() {
            debug!(queue = %queue.name(), "auto-deleting");
            queue.destroyed(exchanges);
        }
    }

    // --- shutdown ---

    /// Tear the queue down: unbind, drain leftovers to the alternate
    /// exchange, flush and destroy the store, and wake every waiting
    /// consumer into the deleted state.
    pub fn destroyed(&self, exchanges: &ExchangeRegistry) {
        self.unbind(exchanges);
        if let Some(alternate) = self.alternate_exchange() {
            loop {
                let front = self.state.lock().messages.front();
                let Some(qm) = front else { break };
                if let Err(e) = alternate.route_with_alternate(&qm.message) {
                    warn!(queue = %self.name, "failed to reroute message on delete: {e}");
                }
                let popped = {
                    let mut st = self.state.lock();
                    let popped = st.messages.pop();
                    if let Some(popped) = &popped {
                        self.acquired_event(&mut st, popped);
                    }
                    popped
                };
                if let Some(popped) = popped {
                    self.dequeue_since_purge.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self.dequeue(None, &popped) {
                        warn!(queue = %self.name, "dequeue failed on delete: {e}");
                    }
                }
            }
            alternate.dec_alternate_users();
        }

        if let Some(store) = self.store() {
            // wait for in-flight users before tearing the store down
            self.barrier.destroy();
            store.flush(&self.name);
            store.destroy(&self.name);
            *self.store.write() = None;
        }
        if let Some(task) = self.auto_delete_task.lock().take() {
            task.cancel();
        }
        self.notify_deleted();
    }

    fn notify_deleted(&self) {
        let mut set = NotificationSet::default();
        {
            let st = self.state.lock();
            st.listeners.snapshot(&mut set);
            self.barrier.mark_deleted();
        }
        // woken consumers observe the deleted state on their next call
        set.notify();
    }

    // --- bindings ---

    pub fn bind(
        self: &Arc<Self>,
        exchange: &Arc<Exchange>,
        key: &str,
        args: &FieldTable,
    ) -> Result<bool> {
        if !exchange.bind(self, key, args) {
            return Ok(false);
        }
        self.bound(exchange.name(), key, args);
        if exchange.is_durable() && self.is_durable() {
            if let Some(store) = self.store() {
                store.bind(exchange.name(), &self.name, key, args)?;
            }
        }
        Ok(true)
    }

    pub fn bound(&self, exchange: &str, key: &str, args: &FieldTable) {
        self.bindings.lock().push(BindingRecord {
            exchange: exchange.to_string(),
            key: key.to_string(),
            args: args.clone(),
        });
    }

    pub fn unbind(&self, exchanges: &ExchangeRegistry) {
        let bindings = std::mem::take(&mut *self.bindings.lock());
        for binding in bindings {
            if let Ok(exchange) = exchanges.get(&binding.exchange) {
                exchange.unbind(&self.name, &binding.key);
            }
        }
    }

    // --- alternate exchange ---

    pub fn set_alternate_exchange(&self, exchange: Arc<Exchange>) {
        exchange.inc_alternate_users();
        *self.alternate_exchange.write() = Some(exchange);
    }

    pub fn alternate_exchange(&self) -> Option<Arc<Exchange>> {
        self.alternate_exchange.read().clone()
    }

    /// Record the alternate exchange by name during restore; resolved
    /// in [`Queue::recovery_complete`].
    pub fn set_alternate_exchange_name(&self, name: impl Into<String>) {
        *self.alternate_exchange_name.lock() = Some(name.into());
    }

    // --- recovery ---

    /// Re-admit a message read back from the store.
    pub fn recover(&self, msg: &Arc<Message>) {
        {
            let mut st = self.state.lock();
            if let Some(policy) = st.policy.as_mut() {
                policy.recover_enqueued(msg);
            }
        }
        self.push(msg, true);
        if self.store().is_some() {
            // already on disk; keep it off the last-node forcing path
            msg.add_to_sync_list(&self.name);
            if msg.is_content_released() {
                debug!(
                    queue = %self.name,
                    pid = msg.persistence_id(),
                    "content released after recovery"
                );
            }
        }
    }

    /// Account for a message prepared inside an uncommitted transaction.
    pub fn recover_prepared(&self, msg: &Arc<Message>) {
        let mut st = self.state.lock();
        if let Some(policy) = st.policy.as_mut() {
            policy.recover_enqueued(msg);
        }
    }

    /// Replica-side record of an enqueue performed elsewhere.
    pub fn update_enqueued(&self, qm: &QueuedMessage) -> Result<()> {
        let mut payload = Arc::clone(&qm.message);
        self.enqueue(None, &mut payload, true)?;
        let mut st = self.state.lock();
        if let Some(policy) = st.policy.as_mut() {
            policy.recover_enqueued(&payload);
        }
        self.enqueued_event(&mut st, qm);
        Ok(())
    }

    /// Resolve the restored alternate-exchange name and issue the store
    /// dequeues deferred during recovery.
    pub fn recovery_complete(&self, exchanges: &ExchangeRegistry) {
        let pending_name = self.alternate_exchange_name.lock().take();
        if let Some(name) = pending_name {
            match exchanges.get(&name) {
                Ok(exchange) => self.set_alternate_exchange(exchange),
                Err(_) => warn!(
                    queue = %self.name,
                    alternate = name,
                    "could not set alternate exchange: exchange does not exist"
                ),
            }
        }
        let pending = std::mem::take(&mut *self.pending_dequeues.lock());
        for qm in pending {
            if let Err(e) = self.dequeue(None, &qm) {
                warn!(queue = %self.name, "deferred dequeue failed: {e}");
            }
        }
    }

    // --- last-node failure ---

    /// Force every resident message persistent because the cluster has
    /// shrunk to this node. Store errors leave the queue transient.
    pub fn set_last_node_failure(&self) {
        if !self.persist_last_node() {
            return;
        }
        let resident = {
            let st = self.state.lock();
            let mut all = Vec::with_capacity(st.messages.len());
            st.messages.for_each(&mut |qm| all.push(qm.clone()));
            all
        };
        for qm in resident {
            if qm.message.is_stored_on(&self.name) {
                continue;
            }
            qm.message.force_persistent();
            if qm.message.is_forced_persistent() {
                let mut payload = Arc::clone(&qm.message);
                if let Err(e) = self.enqueue(None, &mut payload, false) {
                    error!(
                        queue = %self.name,
                        "unable to fail over to last node standing: {e}"
                    );
                    break;
                }
            }
        }
        self.in_last_node_failure.store(true, Ordering::Release);
    }

    pub fn clear_last_node_failure(&self) {
        self.in_last_node_failure.store(false, Ordering::Release);
    }

    fn in_last_node_failure(&self) -> bool {
        self.in_last_node_failure.load(Ordering::Acquire)
    }

    fn persist_last_node(&self) -> bool {
        self.traits.read().persist_last_node
    }

    // --- store maintenance ---

    pub fn flush(&self) {
        let used = ScopedUse::new(&self.barrier);
        if used.acquired {
            if let Some(store) = self.store() {
                store.flush(&self.name);
            }
        }
    }

    // --- management ---

    /// Snapshot allocator state into `out`.
    pub fn query(&self, out: &mut FieldTable) {
        self.state.lock().allocator.query(out);
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn position(&self) -> Position {
        self.state.lock().sequence
    }

    /// Sequence override for state replication.
    pub fn set_position(&self, position: Position) {
        self.state.lock().sequence = position;
    }

    pub fn event_mode(&self) -> u8 {
        self.traits.read().event_mode
    }

    pub fn persistence_id(&self) -> u64 {
        self.persistence_id.load(Ordering::Relaxed)
    }

    pub fn set_persistence_id(&self, id: u64) {
        self.persistence_id.store(id, Ordering::Relaxed);
    }

    // --- event fan-out (message lock held) ---

    fn enqueued_event(&self, st: &mut QueueState, qm: &QueuedMessage) {
        st.allocator.on_enqueued(qm);
        for observer in &st.observers {
            guarded(&self.name, "enqueue", || observer.enqueued(qm));
        }
        if let Some(policy) = st.policy.as_mut() {
            policy.enqueued(qm);
        }
        self.stats.msg_enqueues.fetch_add(1, Ordering::Relaxed);
        self.stats
            .byte_enqueues
            .fetch_add(qm.message.content_size(), Ordering::Relaxed);
    }

    fn acquired_event(&self, st: &mut QueueState, qm: &QueuedMessage) {
        st.allocator.on_acquired(qm);
        for observer in &st.observers {
            guarded(&self.name, "acquire", || observer.acquired(qm));
        }
    }

    fn requeued_event(&self, st: &mut QueueState, qm: &QueuedMessage) {
        st.allocator.on_requeued(qm);
        for observer in &st.observers {
            guarded(&self.name, "requeue", || observer.requeued(qm));
        }
    }

    fn dequeued_event(&self, st: &mut QueueState, qm: &QueuedMessage) {
        if let Some(policy) = st.policy.as_mut() {
            policy.dequeued(qm);
        }
        st.allocator.on_dequeued(qm);
        for observer in &st.observers {
            guarded(&self.name, "dequeue", || observer.dequeued(qm));
        }
        self.stats.msg_dequeues.fetch_add(1, Ordering::Relaxed);
        self.stats
            .byte_dequeues
            .fetch_add(qm.message.content_size(), Ordering::Relaxed);
    }
}

fn is_enqueued_per_policy(st: &QueueState, qm: &QueuedMessage) -> bool {
    st.policy.as_ref().map(|p| p.is_enqueued(qm)).unwrap_or(true)
}

/// One bad observer must not poison a delivery: panics are logged and
/// swallowed.
fn guarded(queue: &str, event: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(queue, event, "observer panicked during notification");
    }
}

fn fairshare_from_args(settings: &FieldTable, levels: usize) -> Option<Vec<u32>> {
    let base = settings.integer_setting(FAIRSHARE_KEY).max(0) as u32;
    let mut any = base > 0;
    let mut shares = vec![base.max(1); levels];
    for (level, share) in shares.iter_mut().enumerate() {
        let key = format!("{FAIRSHARE_KEY}-{level}");
        let v = settings.integer_setting(&key).max(0) as u32;
        if v > 0 {
            *share = v;
            any = true;
        }
    }
    any.then_some(shares)
}

/// Filter applied by purge and move requests.
enum MessageFilter {
    All,
    HeaderMatch { header: String, value: String },
}

const FILTER_TYPE_KEY: &str = "filter_type";
const FILTER_PARAMS_KEY: &str = "filter_params";
const HEADER_MATCH_TYPE: &str = "header_match_str";
const HEADER_KEY: &str = "header_key";
const HEADER_VALUE: &str = "header_value";

impl MessageFilter {
    /// Config shape:
    /// `{ "filter_type": "header_match_str",
    ///    "filter_params": { "header_key": k, "header_value": v } }`
    fn from_args(filter: Option<&FieldTable>) -> MessageFilter {
        let Some(filter) = filter else { return MessageFilter::All };
        if filter.get_as_str(FILTER_TYPE_KEY) == Some(HEADER_MATCH_TYPE) {
            if let Some(FieldValue::Map(params)) = filter.get(FILTER_PARAMS_KEY) {
                if let (Some(header), Some(value)) =
                    (params.get_as_str(HEADER_KEY), params.get_as_str(HEADER_VALUE))
                {
                    debug!(header, value, "message filtering by header value configured");
                    return MessageFilter::HeaderMatch {
                        header: header.to_string(),
                        value: value.to_string(),
                    };
                }
            }
        }
        error!("ignoring unrecognized message filter");
        MessageFilter::All
    }

    fn matches(&self, qm: &QueuedMessage) -> bool {
        match self {
            MessageFilter::All => true,
            MessageFilter::HeaderMatch { header, value } => qm
                .message
                .with_headers(|h| h.get_as_str(header) == Some(value)),
        }
    }
}
