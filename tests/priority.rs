#[path = "common.rs"]
mod common;

use std::sync::Arc;

use ambermq::core::consumer::Consumer;
use ambermq::core::message::Message;
use ambermq::core::queue::{Queue, PRIORITIES_KEY};
use ambermq::core::values::FieldTable;

use common::TestConsumer;

fn prioritised(queue: &str, body: &str, priority: u8) -> Arc<Message> {
    Arc::new(
        Message::builder(queue)
            .priority(priority)
            .content(body.as_bytes().to_vec())
            .finish(),
    )
}

#[test]
fn higher_priority_messages_jump_the_queue() {
    common::init_logging();

    let mut settings = FieldTable::new();
    settings.insert(PRIORITIES_KEY, 10i64);
    let q = Queue::new("prio", false, None, None);
    q.configure(&settings);

    q.deliver(prioritised("prio", "low-1", 0)).unwrap();
    q.deliver(prioritised("prio", "high-1", 9)).unwrap();
    q.deliver(prioritised("prio", "mid-1", 5)).unwrap();
    q.deliver(prioritised("prio", "high-2", 9)).unwrap();

    let c = TestConsumer::new("c");
    let d: Arc<dyn Consumer> = c.clone();
    q.consume(&d, false).unwrap();
    while q.dispatch(&d).unwrap() {}

    assert_eq!(c.bodies(), vec!["high-1", "high-2", "mid-1", "low-1"]);
}
