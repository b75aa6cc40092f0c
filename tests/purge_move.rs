#[path = "common.rs"]
mod common;

use std::sync::Arc;

use ambermq::core::message::Message;
use ambermq::core::queue::Queue;
use ambermq::core::values::{FieldTable, FieldValue};

use common::{text_message, RecordingObserver};

fn flagged(queue: &str, colour: &str) -> Arc<Message> {
    Arc::new(Message::builder(queue).header("colour", colour).finish())
}

fn header_filter(key: &str, value: &str) -> FieldTable {
    let mut params = FieldTable::new();
    params.insert("header_key", key);
    params.insert("header_value", value);
    let mut filter = FieldTable::new();
    filter.insert("filter_type", "header_match_str");
    filter.insert("filter_params", FieldValue::Map(params));
    filter
}

#[test]
fn purge_all_empties_the_queue() {
    common::init_logging();

    let q = Queue::new("purged", false, None, None);
    q.configure(&FieldTable::new());
    let observer = RecordingObserver::new();
    q.add_observer(observer.clone());
    for i in 0..4 {
        q.deliver(text_message("purged", &format!("m{i}"))).unwrap();
    }

    assert_eq!(q.purge(0, None, None).unwrap(), 4);
    assert_eq!(q.message_count(), 0);
    assert_eq!(observer.events_named("dequeued"), vec![1, 2, 3, 4]);
}

#[test]
fn purge_honours_count_and_header_filter() {
    common::init_logging();

    let q = Queue::new("purged", false, None, None);
    q.configure(&FieldTable::new());
    q.deliver(flagged("purged", "red")).unwrap();
    q.deliver(flagged("purged", "blue")).unwrap();
    q.deliver(flagged("purged", "red")).unwrap();
    q.deliver(flagged("purged", "red")).unwrap();

    let filter = header_filter("colour", "red");
    assert_eq!(q.purge(2, None, Some(&filter)).unwrap(), 2);
    assert_eq!(q.message_count(), 2);
    // the blue message and the last red one remain
    assert!(q.find(2).is_some());
    assert!(q.find(4).is_some());
}

#[test]
fn move_transfers_matching_messages() {
    common::init_logging();

    let src = Queue::new("src", false, None, None);
    let dst = Queue::new("dst", false, None, None);
    src.configure(&FieldTable::new());
    dst.configure(&FieldTable::new());

    src.deliver(flagged("src", "red")).unwrap();
    src.deliver(flagged("src", "blue")).unwrap();
    src.deliver(flagged("src", "red")).unwrap();

    let filter = header_filter("colour", "red");
    assert_eq!(src.move_messages(&dst, 0, Some(&filter)).unwrap(), 2);
    assert_eq!(src.message_count(), 1);
    assert_eq!(dst.message_count(), 2);
}

#[test]
fn move_to_self_is_safe() {
    common::init_logging();

    let q = Queue::new("loopy", false, None, None);
    q.configure(&FieldTable::new());
    for i in 0..3 {
        q.deliver(text_message("loopy", &format!("m{i}"))).unwrap();
    }

    assert_eq!(q.move_messages(&q, 0, None).unwrap(), 3);
    assert_eq!(q.message_count(), 3);
    // the messages were re-enqueued at fresh positions
    assert!(q.find(4).is_some());
    assert!(q.find(6).is_some());
    assert!(q.find(1).is_none());
}
