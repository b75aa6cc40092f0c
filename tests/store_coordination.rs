#[path = "common.rs"]
mod common;

use std::sync::{Arc, Mutex};

use ambermq::core::consumer::Consumer;
use ambermq::core::exchange::ExchangeRegistry;
use ambermq::core::message::Message;
use ambermq::core::queue::Queue;
use ambermq::core::store::{Store, TransactionContext};
use ambermq::core::values::FieldTable;
use ambermq::{Error, Result};

use common::{text_message, TestConsumer};

/// In-memory store double that completes writes synchronously and
/// records every call.
#[derive(Default)]
struct TestStore {
    pub created: Mutex<Vec<String>>,
    pub enqueues: Mutex<Vec<(String, Option<String>)>>,
    pub dequeues: Mutex<Vec<String>>,
    pub flushed: Mutex<Vec<String>>,
    pub destroyed: Mutex<Vec<String>>,
    pub bindings: Mutex<Vec<(String, String, String)>>,
}

impl TestStore {
    fn new() -> Arc<TestStore> {
        Arc::new(TestStore::default())
    }
}

impl Store for TestStore {
    fn create(&self, queue: &str, _settings: &FieldTable) -> Result<()> {
        self.created.lock().unwrap().push(queue.to_string());
        Ok(())
    }

    fn destroy(&self, queue: &str) {
        self.destroyed.lock().unwrap().push(queue.to_string());
    }

    fn flush(&self, queue: &str) {
        self.flushed.lock().unwrap().push(queue.to_string());
    }

    fn enqueue(
        &self,
        _ctx: Option<&dyn TransactionContext>,
        message: &Arc<Message>,
        queue: &str,
    ) -> Result<()> {
        self.enqueues
            .lock()
            .unwrap()
            .push((queue.to_string(), message.message_id().map(String::from)));
        message.enqueue_complete();
        Ok(())
    }

    fn dequeue(
        &self,
        _ctx: Option<&dyn TransactionContext>,
        message: &Arc<Message>,
        queue: &str,
    ) -> Result<()> {
        self.dequeues.lock().unwrap().push(queue.to_string());
        message.dequeue_complete();
        Ok(())
    }

    fn bind(&self, exchange: &str, queue: &str, key: &str, _args: &FieldTable) -> Result<()> {
        self.bindings
            .lock()
            .unwrap()
            .push((exchange.to_string(), queue.to_string(), key.to_string()));
        Ok(())
    }
}

fn durable_message(queue: &str, body: &str) -> Arc<Message> {
    Arc::new(
        Message::builder(queue)
            .durable(true)
            .content(body.as_bytes().to_vec())
            .finish(),
    )
}

#[test]
fn persistent_messages_round_trip_through_the_store() {
    common::init_logging();

    let store = TestStore::new();
    let q = Queue::new("durable", false, Some(store.clone()), None);
    q.create(&FieldTable::new()).unwrap();
    assert_eq!(*store.created.lock().unwrap(), vec!["durable"]);

    let msg = durable_message("durable", "important");
    q.deliver(msg.clone()).unwrap();
    assert_eq!(store.enqueues.lock().unwrap().len(), 1);
    assert!(msg.is_stored_on("durable"));
    assert!(msg.is_ingress_complete());

    let c = TestConsumer::new("c");
    let d: Arc<dyn Consumer> = c.clone();
    q.consume(&d, false).unwrap();
    assert!(q.dispatch(&d).unwrap());

    // settlement drives the store dequeue
    let qm = c.delivered.lock().unwrap()[0].clone();
    assert!(q.dequeue(None, &qm).unwrap());
    assert_eq!(*store.dequeues.lock().unwrap(), vec!["durable"]);
}

#[test]
fn transient_messages_bypass_the_store() {
    common::init_logging();

    let store = TestStore::new();
    let q = Queue::new("durable", false, Some(store.clone()), None);
    q.create(&FieldTable::new()).unwrap();

    q.deliver(text_message("durable", "fleeting")).unwrap();
    assert!(store.enqueues.lock().unwrap().is_empty());

    let qm = q.get().unwrap();
    assert!(!q.dequeue(None, &qm).unwrap());
    assert!(store.dequeues.lock().unwrap().is_empty());
}

#[test]
fn destroy_flushes_then_tears_down_the_store() {
    common::init_logging();

    let exchanges = ExchangeRegistry::new();
    let store = TestStore::new();
    let q = Queue::new("durable", false, Some(store.clone()), None);
    q.create(&FieldTable::new()).unwrap();

    q.destroyed(&exchanges);
    assert_eq!(*store.flushed.lock().unwrap(), vec!["durable"]);
    assert_eq!(*store.destroyed.lock().unwrap(), vec!["durable"]);
    assert!(matches!(
        q.deliver(text_message("durable", "late")),
        Err(Error::ResourceDeleted(_))
    ));
}

#[test]
fn durable_binding_reaches_the_store() {
    common::init_logging();

    let exchanges = ExchangeRegistry::new();
    let store = TestStore::new();
    let (ex, _) = exchanges.declare("amq.direct", "direct", true, &FieldTable::new()).unwrap();
    let q = Queue::new("durable", false, Some(store.clone()), None);
    q.create(&FieldTable::new()).unwrap();

    assert!(q.bind(&ex, "k", &FieldTable::new()).unwrap());
    assert_eq!(
        *store.bindings.lock().unwrap(),
        vec![("amq.direct".to_string(), "durable".to_string(), "k".to_string())]
    );
}

#[test]
fn forced_persistence_on_one_queue_never_touches_anothers_store() {
    common::init_logging();

    let store = TestStore::new();
    let q1 = Queue::new("q1", false, Some(store.clone()), None);
    let q2 = Queue::new("q2", false, Some(store.clone()), None);
    q1.create(&FieldTable::new()).unwrap();
    q2.create(&FieldTable::new()).unwrap();

    // a transient publication landing on both queues gets forced to
    // disk through q1 only
    let msg = text_message("k", "shared");
    msg.force_persistent();
    let mut handle = Arc::clone(&msg);
    q1.enqueue(None, &mut handle, false).unwrap();
    q1.process(&handle);
    q2.process(&msg);

    assert_eq!(store.enqueues.lock().unwrap().len(), 1);

    // q2 must not issue a dequeue against a store it never enqueued into
    let qm2 = q2.get().unwrap();
    assert!(!q2.dequeue(None, &qm2).unwrap());
    assert_eq!(store.dequeues.lock().unwrap().len(), 0);

    let qm1 = q1.get().unwrap();
    assert!(q1.dequeue(None, &qm1).unwrap());
    assert_eq!(*store.dequeues.lock().unwrap(), vec!["q1"]);
}

#[test]
fn destroyed_queue_drains_into_the_alternate_exchange() {
    common::init_logging();

    let exchanges = ExchangeRegistry::new();
    let (alt, _) = exchanges.declare("alt", "fanout", false, &FieldTable::new()).unwrap();
    let dlq = Queue::new("dead-letters", false, None, None);
    dlq.configure(&FieldTable::new());
    dlq.bind(&alt, "", &FieldTable::new()).unwrap();

    let q = Queue::new("doomed", false, None, None);
    q.configure(&FieldTable::new());
    q.set_alternate_exchange(Arc::clone(&alt));
    assert!(alt.in_use_as_alternate());

    q.deliver(text_message("doomed", "a")).unwrap();
    q.deliver(text_message("doomed", "b")).unwrap();

    q.destroyed(&exchanges);
    assert_eq!(q.message_count(), 0);
    assert_eq!(dlq.message_count(), 2);
    assert!(!alt.in_use_as_alternate());
}
