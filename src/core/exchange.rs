//! Exchanges and the exchange registry.
//!
//! An exchange routes published messages to the queues bound to it:
//! `direct` by routing-key equality, `fanout` to every binding, `topic`
//! by dotted-pattern match with `*` (one word) and `#` (zero or more).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::core::error::{Error, Result};
use crate::core::message::Message;
use crate::core::queue::Queue;
use crate::core::values::FieldTable;

/// Name of the always-present default exchange.
pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    pub fn parse(name: &str) -> Result<ExchangeKind> {
        match name {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            other => Err(Error::UnknownExchangeType(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }
}

struct Binding {
    queue: Weak<Queue>,
    queue_name: String,
    key: String,
    #[allow(dead_code)]
    args: FieldTable,
}

pub struct Exchange {
    name: String,
    kind: ExchangeKind,
    durable: bool,
    args: FieldTable,
    bindings: RwLock<Vec<Binding>>,
    alternate: RwLock<Option<Arc<Exchange>>>,
    /// Queues and exchanges naming this one as their alternate.
    alternate_users: AtomicUsize,
}

impl Exchange {
    pub fn new(
        name: impl Into<String>,
        kind: ExchangeKind,
        durable: bool,
        args: FieldTable,
    ) -> Arc<Exchange> {
        Arc::new(Exchange {
            name: name.into(),
            kind,
            durable,
            args,
            bindings: RwLock::new(Vec::new()),
            alternate: RwLock::new(None),
            alternate_users: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn args(&self) -> &FieldTable {
        &self.args
    }

    /// Add a binding; false when an identical binding already exists.
    pub fn bind(&self, queue: &Arc<Queue>, key: &str, args: &FieldTable) -> bool {
        let mut bindings = self.bindings.write();
        if bindings
            .iter()
            .any(|b| b.queue_name == queue.name() && b.key == key)
        {
            return false;
        }
        bindings.push(Binding {
            queue: Arc::downgrade(queue),
            queue_name: queue.name().to_string(),
            key: key.to_string(),
            args: args.clone(),
        });
        true
    }

    /// Remove a binding; false when none matched.
    pub fn unbind(&self, queue_name: &str, key: &str) -> bool {
        let mut bindings = self.bindings.write();
        let before = bindings.len();
        bindings.retain(|b| !(b.queue_name == queue_name && b.key == key));
        bindings.len() != before
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.read().len()
    }

    fn matches(&self, binding_key: &str, routing_key: &str) -> bool {
        match self.kind {
            ExchangeKind::Direct => binding_key == routing_key,
            ExchangeKind::Fanout => true,
            ExchangeKind::Topic => topic_match(binding_key, routing_key),
        }
    }

    /// Deliver to every bound queue matching the message's routing key.
    /// Returns whether any binding matched.
    pub fn route(&self, msg: &Arc<Message>) -> Result<bool> {
        let targets: Vec<Arc<Queue>> = {
            let bindings = self.bindings.read();
            bindings
                .iter()
                .filter(|b| self.matches(&b.key, msg.routing_key()))
                .filter_map(|b| b.queue.upgrade())
                .collect()
        };
        let matched = !targets.is_empty();
        for queue in targets {
            if let Err(e) = queue.deliver(Arc::clone(msg)) {
                warn!(
                    exchange = %self.name,
                    queue = queue.name(),
                    "delivery failed while routing: {e}"
                );
            }
        }
        Ok(matched)
    }

    /// Route, falling back to the alternate exchange for messages no
    /// binding wanted.
    pub fn route_with_alternate(&self, msg: &Arc<Message>) -> Result<bool> {
        if self.route(msg)? {
            return Ok(true);
        }
        match self.alternate.read().clone() {
            Some(alternate) => alternate.route(msg),
            None => Ok(false),
        }
    }

    pub fn set_alternate(&self, exchange: Arc<Exchange>) {
        exchange.inc_alternate_users();
        *self.alternate.write() = Some(exchange);
    }

    pub fn inc_alternate_users(&self) {
        self.alternate_users.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_alternate_users(&self) {
        self.alternate_users.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn in_use_as_alternate(&self) -> bool {
        self.alternate_users.load(Ordering::Relaxed) > 0
    }
}

/// Match a dotted topic pattern against a routing key. `*` matches one
/// word, `#` matches zero or more.
fn topic_match(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(&word), Some(&k)) if word == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

/// Name-to-exchange map. The default exchange (empty name, direct) is
/// always present.
pub struct ExchangeRegistry {
    exchanges: RwLock<HashMap<String, Arc<Exchange>>>,
}

impl ExchangeRegistry {
    pub fn new() -> Arc<ExchangeRegistry> {
        let registry = ExchangeRegistry { exchanges: RwLock::new(HashMap::new()) };
        registry.exchanges.write().insert(
            DEFAULT_EXCHANGE.to_string(),
            Exchange::new(DEFAULT_EXCHANGE, ExchangeKind::Direct, false, FieldTable::new()),
        );
        Arc::new(registry)
    }

    /// Create the exchange if absent; the bool reports whether it was
    /// created by this call.
    pub fn declare(
        &self,
        name: &str,
        kind: &str,
        durable: bool,
        args: &FieldTable,
    ) -> Result<(Arc<Exchange>, bool)> {
        let kind = ExchangeKind::parse(kind)?;
        // optimistic read first
        if let Some(existing) = self.exchanges.read().get(name) {
            return Ok((Arc::clone(existing), false));
        }
        let mut exchanges = self.exchanges.write();
        match exchanges.get(name) {
            Some(existing) => Ok((Arc::clone(existing), false)),
            None => {
                debug!(exchange = name, kind = kind.as_str(), "📭 declaring new exchange");
                let exchange = Exchange::new(name, kind, durable, args.clone());
                exchanges.insert(name.to_string(), Arc::clone(&exchange));
                Ok((exchange, true))
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<Exchange>> {
        self.exchanges
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("exchange {name}")))
    }

    pub fn get_default(&self) -> Arc<Exchange> {
        self.get(DEFAULT_EXCHANGE).expect("default exchange always present")
    }

    /// Idempotent removal. The default exchange cannot be destroyed.
    pub fn destroy(&self, name: &str) {
        if name == DEFAULT_EXCHANGE {
            return;
        }
        self.exchanges.write().remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_is_create_or_get() {
        let registry = ExchangeRegistry::new();
        let (first, created) = registry.declare("amq.direct", "direct", false, &FieldTable::new()).unwrap();
        assert!(created);
        let (second, created) = registry.declare("amq.direct", "direct", false, &FieldTable::new()).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let registry = ExchangeRegistry::new();
        assert!(matches!(
            registry.declare("x", "headers", false, &FieldTable::new()),
            Err(Error::UnknownExchangeType(_))
        ));
    }

    #[test]
    fn get_missing_is_not_found() {
        let registry = ExchangeRegistry::new();
        assert!(matches!(registry.get("nope"), Err(Error::NotFound(_))));
        registry.get_default();
    }

    #[test]
    fn destroy_is_idempotent_and_spares_default() {
        let registry = ExchangeRegistry::new();
        registry.declare("x", "fanout", false, &FieldTable::new()).unwrap();
        registry.destroy("x");
        registry.destroy("x");
        registry.destroy(DEFAULT_EXCHANGE);
        registry.get_default();
    }

    #[test]
    fn direct_routes_by_key_equality() {
        let registry = ExchangeRegistry::new();
        let (ex, _) = registry.declare("d", "direct", false, &FieldTable::new()).unwrap();
        let q = Queue::new("q", false, None, None);
        q.bind(&ex, "k1", &FieldTable::new()).unwrap();

        ex.route(&Arc::new(Message::builder("k1").finish())).unwrap();
        ex.route(&Arc::new(Message::builder("k2").finish())).unwrap();
        assert_eq!(q.message_count(), 1);
    }

    #[test]
    fn fanout_routes_everything() {
        let registry = ExchangeRegistry::new();
        let (ex, _) = registry.declare("f", "fanout", false, &FieldTable::new()).unwrap();
        let q1 = Queue::new("q1", false, None, None);
        let q2 = Queue::new("q2", false, None, None);
        q1.bind(&ex, "", &FieldTable::new()).unwrap();
        q2.bind(&ex, "", &FieldTable::new()).unwrap();

        ex.route(&Arc::new(Message::builder("anything").finish())).unwrap();
        assert_eq!(q1.message_count(), 1);
        assert_eq!(q2.message_count(), 1);
    }

    #[test]
    fn duplicate_binding_is_refused() {
        let registry = ExchangeRegistry::new();
        let (ex, _) = registry.declare("d", "direct", false, &FieldTable::new()).unwrap();
        let q = Queue::new("q", false, None, None);
        assert!(q.bind(&ex, "k", &FieldTable::new()).unwrap());
        assert!(!q.bind(&ex, "k", &FieldTable::new()).unwrap());
        assert_eq!(ex.binding_count(), 1);
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_match("a.b.c", "a.b.c"));
        assert!(topic_match("a.*.c", "a.b.c"));
        assert!(!topic_match("a.*.c", "a.b.d"));
        assert!(topic_match("a.#", "a"));
        assert!(topic_match("a.#", "a.b.c"));
        assert!(topic_match("#.c", "a.b.c"));
        assert!(topic_match("#", "anything.at.all"));
        assert!(!topic_match("a.b", "a.b.c"));
    }

    #[test]
    fn alternate_receives_unroutable() {
        let registry = ExchangeRegistry::new();
        let (main, _) = registry.declare("main", "direct", false, &FieldTable::new()).unwrap();
        let (alt, _) = registry.declare("alt", "fanout", false, &FieldTable::new()).unwrap();
        main.set_alternate(Arc::clone(&alt));
        assert!(alt.in_use_as_alternate());

        let q = Queue::new("dead-letters", false, None, None);
        q.bind(&alt, "", &FieldTable::new()).unwrap();

        let matched = main
            .route_with_alternate(&Arc::new(Message::builder("unbound").finish()))
            .unwrap();
        assert!(matched);
        assert_eq!(q.message_count(), 1);
    }
}
