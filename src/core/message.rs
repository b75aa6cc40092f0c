//! Messages as held by queues.
//!
//! A message is published once and may land on many queues, so it is
//! shared behind an `Arc` and all mutable state (headers, persistence
//! bookkeeping, content-release flags) sits behind interior mutability.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::core::values::FieldTable;

/// Per-queue sequence number assigned at push time.
pub type Position = u64;

/// Header under which trace identities accumulate (comma separated).
pub const TRACE_HEADER: &str = "x-qpid.trace";

/// Returns the current system time as a UNIX timestamp in milliseconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before Unix epoch")
        .as_millis() as u64
}

/// A target address on the outbound path: node name plus optional subject.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    pub name: String,
    pub subject: Option<String>,
}

impl Address {
    pub fn new(name: impl Into<String>) -> Self {
        Address { name: name.into(), subject: None }
    }

    pub fn with_subject(name: impl Into<String>, subject: impl Into<String>) -> Self {
        Address { name: name.into(), subject: Some(subject.into()) }
    }
}

/// Header fields of a message as they were received, kept alongside the
/// original encoded bytes so an unmodified forward can go out verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceivedHeader {
    pub durable: bool,
    pub priority: u8,
    pub ttl: Option<u32>,
    pub first_acquirer: bool,
    pub delivery_count: u32,
}

/// The original encoded form of a received message.
#[derive(Debug, Clone)]
pub struct EncodedMessage {
    /// Complete frame body as received.
    pub data: Bytes,
    /// Offset at which the bare message (everything after the header
    /// section) begins.
    pub bare_offset: usize,
    /// Header field values as received, for change detection.
    pub header: ReceivedHeader,
}

impl EncodedMessage {
    pub fn bare_message(&self) -> &[u8] {
        &self.data[self.bare_offset..]
    }
}

/// An entry in a message's store-synchronisation list: one per queue the
/// message has been handed to a store for.
#[derive(Debug)]
struct SyncEntry {
    queue: String,
}

/// A single publication, shared by every queue it was routed to.
#[derive(Debug)]
pub struct Message {
    durable: bool,
    priority: u8,
    /// Relative time-to-live as carried on the wire, if any.
    ttl: Option<u32>,
    /// Absolute expiry, milliseconds since the epoch; 0 = never expires.
    expires_at: u64,
    immediate: bool,
    publisher: Option<String>,
    routing_key: String,
    subject: Option<String>,
    message_id: Option<String>,
    user_id: Option<String>,
    correlation_id: Option<String>,
    content_type: Option<String>,
    reply_to: Option<Address>,
    content: Bytes,
    headers: RwLock<FieldTable>,
    original: Option<EncodedMessage>,

    redelivered: AtomicBool,
    persistence_id: AtomicU64,
    forced_persistent: AtomicBool,
    content_released: AtomicBool,
    release_blocked: AtomicBool,
    /// Outstanding asynchronous store operations across all queues.
    pending_store_ops: AtomicUsize,
    sync_list: Mutex<Vec<SyncEntry>>,
}

impl Message {
    pub fn builder(routing_key: impl Into<String>) -> MessageBuilder {
        MessageBuilder::new(routing_key)
    }

    pub fn durable(&self) -> bool {
        self.durable
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Relative time-to-live as received, for the outbound header.
    pub fn ttl(&self) -> Option<u32> {
        self.ttl
    }

    /// Absolute expiry in milliseconds since the epoch, 0 = never.
    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub fn has_expired(&self) -> bool {
        self.expires_at != 0 && current_timestamp() >= self.expires_at
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    pub fn publisher(&self) -> Option<&str> {
        self.publisher.as_deref()
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn reply_to(&self) -> Option<&Address> {
        self.reply_to.as_ref()
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn content_size(&self) -> u64 {
        self.content.len() as u64
    }

    pub fn original_encoded(&self) -> Option<&EncodedMessage> {
        self.original.as_ref()
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered.load(Ordering::Relaxed)
    }

    pub fn set_redelivered(&self) {
        self.redelivered.store(true, Ordering::Relaxed);
    }

    pub fn persistence_id(&self) -> u64 {
        self.persistence_id.load(Ordering::Relaxed)
    }

    pub fn set_persistence_id(&self, id: u64) {
        self.persistence_id.store(id, Ordering::Relaxed);
    }

    /// Run `f` with a read view of the application headers.
    pub fn with_headers<R>(&self, f: impl FnOnce(&FieldTable) -> R) -> R {
        f(&self.headers.read())
    }

    pub fn headers_clone(&self) -> FieldTable {
        self.headers.read().clone()
    }

    pub fn set_header(&self, key: impl Into<String>, value: impl Into<crate::core::values::FieldValue>) {
        self.headers.write().insert(key, value);
    }

    /// Append a trace identity to the trace header.
    pub fn add_trace_id(&self, id: &str) {
        let mut headers = self.headers.write();
        let trail = match headers.get_as_str(TRACE_HEADER) {
            Some(existing) if !existing.is_empty() => format!("{existing},{id}"),
            _ => id.to_string(),
        };
        headers.insert(TRACE_HEADER, trail);
    }

    /// True when any accumulated trace identity appears in `exclude`.
    pub fn is_excluded(&self, exclude: &[String]) -> bool {
        let headers = self.headers.read();
        match headers.get_as_str(TRACE_HEADER) {
            Some(trail) => trail.split(',').any(|id| exclude.iter().any(|e| e == id)),
            None => false,
        }
    }

    /// Deep copy prior to mutation, for when the original frames may
    /// already be in flight to other queues.
    pub fn deep_copy(&self) -> Message {
        Message {
            durable: self.durable,
            priority: self.priority,
            ttl: self.ttl,
            expires_at: self.expires_at,
            immediate: self.immediate,
            publisher: self.publisher.clone(),
            routing_key: self.routing_key.clone(),
            subject: self.subject.clone(),
            message_id: self.message_id.clone(),
            user_id: self.user_id.clone(),
            correlation_id: self.correlation_id.clone(),
            content_type: self.content_type.clone(),
            reply_to: self.reply_to.clone(),
            content: self.content.clone(),
            headers: RwLock::new(self.headers.read().clone()),
            original: self.original.clone(),
            redelivered: AtomicBool::new(self.is_redelivered()),
            persistence_id: AtomicU64::new(0),
            forced_persistent: AtomicBool::new(self.is_forced_persistent()),
            content_released: AtomicBool::new(false),
            release_blocked: AtomicBool::new(false),
            pending_store_ops: AtomicUsize::new(0),
            sync_list: Mutex::new(Vec::new()),
        }
    }

    // --- persistence state ---

    pub fn is_persistent(&self) -> bool {
        self.durable || self.is_forced_persistent()
    }

    pub fn force_persistent(&self) {
        self.forced_persistent.store(true, Ordering::Relaxed);
    }

    pub fn is_forced_persistent(&self) -> bool {
        self.forced_persistent.load(Ordering::Relaxed)
    }

    /// Content may be evicted to disk unless a transient queue has
    /// blocked release.
    pub fn content_releasable(&self) -> bool {
        !self.release_blocked.load(Ordering::Relaxed)
            && self.content_released.load(Ordering::Relaxed)
    }

    pub fn release_content(&self) {
        if !self.release_blocked.load(Ordering::Relaxed) {
            self.content_released.store(true, Ordering::Relaxed);
        }
    }

    pub fn is_content_released(&self) -> bool {
        self.content_released.load(Ordering::Relaxed)
    }

    pub fn block_content_release(&self) {
        self.release_blocked.store(true, Ordering::Relaxed);
    }

    // --- store synchronisation ---

    /// Record an asynchronous store enqueue issued on behalf of `queue`.
    /// The store must answer with [`Message::enqueue_complete`].
    pub fn enqueue_async(&self, queue: &str) {
        self.add_to_sync_list(queue);
        self.pending_store_ops.fetch_add(1, Ordering::AcqRel);
    }

    pub fn enqueue_complete(&self) {
        self.pending_store_ops.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn dequeue_async(&self, _queue: &str) {
        self.pending_store_ops.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dequeue_complete(&self) {
        self.pending_store_ops.fetch_sub(1, Ordering::AcqRel);
    }

    /// Register `queue` on the sync list without an outstanding
    /// operation (recovered messages are already on disk).
    pub fn add_to_sync_list(&self, queue: &str) {
        let mut list = self.sync_list.lock();
        if !list.iter().any(|e| e.queue == queue) {
            list.push(SyncEntry { queue: queue.to_string() });
        }
    }

    pub fn is_stored_on(&self, queue: &str) -> bool {
        self.sync_list.lock().iter().any(|e| e.queue == queue)
    }

    pub fn is_ingress_complete(&self) -> bool {
        self.pending_store_ops.load(Ordering::Acquire) == 0
    }
}

/// Builder for [`Message`]. Generated ids come from UUID v4.
#[derive(Debug)]
pub struct MessageBuilder {
    durable: bool,
    priority: u8,
    ttl: Option<u32>,
    expires_at: u64,
    immediate: bool,
    publisher: Option<String>,
    routing_key: String,
    subject: Option<String>,
    message_id: Option<String>,
    user_id: Option<String>,
    correlation_id: Option<String>,
    content_type: Option<String>,
    reply_to: Option<Address>,
    content: Bytes,
    headers: FieldTable,
    original: Option<EncodedMessage>,
}

impl MessageBuilder {
    pub fn new(routing_key: impl Into<String>) -> Self {
        MessageBuilder {
            durable: false,
            priority: 4,
            ttl: None,
            expires_at: 0,
            immediate: false,
            publisher: None,
            routing_key: routing_key.into(),
            subject: None,
            message_id: None,
            user_id: None,
            correlation_id: None,
            content_type: None,
            reply_to: None,
            content: Bytes::new(),
            headers: FieldTable::new(),
            original: None,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(9);
        self
    }

    /// Relative time-to-live; converted to an absolute expiry now.
    pub fn ttl_ms(mut self, ttl: u64) -> Self {
        if ttl == 0 {
            self.ttl = None;
            self.expires_at = 0;
        } else {
            self.ttl = Some(ttl.min(u32::MAX as u64) as u32);
            self.expires_at = current_timestamp() + ttl;
        }
        self
    }

    pub fn expires_at(mut self, at: u64) -> Self {
        self.expires_at = at;
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = Some(publisher.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn generated_message_id(mut self) -> Self {
        self.message_id = Some(Uuid::new_v4().to_string());
        self
    }

    pub fn user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn content_type(mut self, ct: impl Into<String>) -> Self {
        self.content_type = Some(ct.into());
        self
    }

    pub fn reply_to(mut self, address: Address) -> Self {
        self.reply_to = Some(address);
        self
    }

    pub fn content(mut self, content: impl Into<Bytes>) -> Self {
        self.content = content.into();
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<crate::core::values::FieldValue>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn headers(mut self, headers: FieldTable) -> Self {
        self.headers = headers;
        self
    }

    pub fn original_encoded(mut self, original: EncodedMessage) -> Self {
        self.original = Some(original);
        self
    }

    pub fn finish(self) -> Message {
        Message {
            durable: self.durable,
            priority: self.priority,
            ttl: self.ttl,
            expires_at: self.expires_at,
            immediate: self.immediate,
            publisher: self.publisher,
            routing_key: self.routing_key,
            subject: self.subject,
            message_id: self.message_id,
            user_id: self.user_id,
            correlation_id: self.correlation_id,
            content_type: self.content_type,
            reply_to: self.reply_to,
            content: self.content,
            headers: RwLock::new(self.headers),
            original: self.original,
            redelivered: AtomicBool::new(false),
            persistence_id: AtomicU64::new(0),
            forced_persistent: AtomicBool::new(false),
            content_released: AtomicBool::new(false),
            release_blocked: AtomicBool::new(false),
            pending_store_ops: AtomicUsize::new(0),
            sync_list: Mutex::new(Vec::new()),
        }
    }
}

/// A message as resident on one queue: the per-queue position plus the
/// shared payload.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub position: Position,
    pub message: Arc<Message>,
}

impl QueuedMessage {
    pub fn new(position: Position, message: Arc<Message>) -> Self {
        QueuedMessage { position, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_sets_absolute_expiry() {
        let m = Message::builder("k").ttl_ms(10_000).finish();
        assert!(m.expires_at() > current_timestamp());
        assert!(!m.has_expired());
        let expired = Message::builder("k").expires_at(1).finish();
        assert!(expired.has_expired());
    }

    #[test]
    fn trace_ids_accumulate_and_exclude() {
        let m = Message::builder("k").finish();
        m.add_trace_id("a");
        m.add_trace_id("b");
        assert!(m.is_excluded(&["b".to_string()]));
        assert!(!m.is_excluded(&["c".to_string()]));
    }

    #[test]
    fn sync_list_tracks_store_association() {
        let m = Message::builder("k").finish();
        assert!(m.is_ingress_complete());
        m.enqueue_async("q1");
        assert!(m.is_stored_on("q1"));
        assert!(!m.is_stored_on("q2"));
        assert!(!m.is_ingress_complete());
        m.enqueue_complete();
        assert!(m.is_ingress_complete());
    }

    #[test]
    fn forced_persistence_is_sticky() {
        let m = Message::builder("k").finish();
        assert!(!m.is_persistent());
        m.force_persistent();
        assert!(m.is_persistent());
        assert!(m.is_forced_persistent());
    }
}
