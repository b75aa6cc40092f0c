#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};

use crossbeam_channel::{unbounded, Receiver, Sender};

use ambermq::core::consumer::Consumer;
use ambermq::core::message::{Message, Position, QueuedMessage};
use ambermq::core::observer::QueueObserver;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        std::mem::forget(ambermq::logging::init_logging());
    });
}

const UNLIMITED: u32 = u32::MAX;

type FilterFn = Box<dyn Fn(&Message) -> bool + Send + Sync>;

/// Scriptable consumer: credit window, optional selector, browse mode,
/// and a channel carrying wake-ups.
pub struct TestConsumer {
    name: String,
    session: Option<String>,
    browse: bool,
    credit: AtomicU32,
    position: AtomicU64,
    filter: Option<FilterFn>,
    pub delivered: Mutex<Vec<QueuedMessage>>,
    notify_tx: Sender<()>,
    pub notifications: Receiver<()>,
}

impl TestConsumer {
    fn build(name: &str, browse: bool, credit: u32, filter: Option<FilterFn>) -> Arc<Self> {
        let (notify_tx, notifications) = unbounded();
        Arc::new(TestConsumer {
            name: name.to_string(),
            session: None,
            browse,
            credit: AtomicU32::new(credit),
            position: AtomicU64::new(0),
            filter,
            delivered: Mutex::new(Vec::new()),
            notify_tx,
            notifications,
        })
    }

    /// Acquiring consumer with unlimited credit.
    pub fn new(name: &str) -> Arc<Self> {
        Self::build(name, false, UNLIMITED, None)
    }

    pub fn browser(name: &str) -> Arc<Self> {
        Self::build(name, true, UNLIMITED, None)
    }

    pub fn with_credit(name: &str, credit: u32) -> Arc<Self> {
        Self::build(name, false, credit, None)
    }

    pub fn with_filter(
        name: &str,
        filter: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::build(name, false, UNLIMITED, Some(Box::new(filter)))
    }

    pub fn add_credit(&self, n: u32) {
        self.credit.fetch_add(n, Ordering::SeqCst);
    }

    pub fn bodies(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|qm| String::from_utf8_lossy(qm.message.content()).to_string())
            .collect()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.delivered.lock().unwrap().iter().map(|qm| qm.position).collect()
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }

    pub fn was_notified(&self) -> bool {
        self.notifications.try_recv().is_ok()
    }
}

impl Consumer for TestConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn session_id(&self) -> Option<&str> {
        self.session.as_deref()
    }

    fn pre_acquires(&self) -> bool {
        !self.browse
    }

    fn position(&self) -> Position {
        self.position.load(Ordering::SeqCst)
    }

    fn set_position(&self, position: Position) {
        self.position.store(position, Ordering::SeqCst);
    }

    fn filter(&self, message: &Message) -> bool {
        self.filter.as_ref().map(|f| f(message)).unwrap_or(true)
    }

    fn accept(&self, _message: &Message) -> bool {
        let credit = self.credit.load(Ordering::SeqCst);
        if credit == UNLIMITED {
            return true;
        }
        if credit == 0 {
            return false;
        }
        self.credit.fetch_sub(1, Ordering::SeqCst);
        true
    }

    fn notify(&self) {
        let _ = self.notify_tx.send(());
    }

    fn deliver(&self, message: &QueuedMessage) {
        self.delivered.lock().unwrap().push(message.clone());
    }
}

/// Observer recording every event with its position, for ordering
/// assertions.
#[derive(Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<(&'static str, Position)>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events_named(&self, name: &str) -> Vec<Position> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(event, _)| *event == name)
            .map(|(_, position)| *position)
            .collect()
    }
}

impl QueueObserver for RecordingObserver {
    fn enqueued(&self, m: &QueuedMessage) {
        self.events.lock().unwrap().push(("enqueued", m.position));
    }
    fn acquired(&self, m: &QueuedMessage) {
        self.events.lock().unwrap().push(("acquired", m.position));
    }
    fn requeued(&self, m: &QueuedMessage) {
        self.events.lock().unwrap().push(("requeued", m.position));
    }
    fn dequeued(&self, m: &QueuedMessage) {
        self.events.lock().unwrap().push(("dequeued", m.position));
    }
}

pub fn text_message(queue: &str, body: &str) -> Arc<Message> {
    Arc::new(Message::builder(queue).content(body.as_bytes().to_vec()).finish())
}
