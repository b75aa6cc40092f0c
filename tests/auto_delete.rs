#[path = "common.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use ambermq::core::consumer::Consumer;
use ambermq::core::exchange::ExchangeRegistry;
use ambermq::core::queue::{Queue, AUTO_DELETE_TIMEOUT_KEY};
use ambermq::core::timer::Timer;
use ambermq::core::values::FieldTable;
use ambermq::Error;

use common::{text_message, TestConsumer};

fn timed_settings(seconds: i64) -> FieldTable {
    let mut settings = FieldTable::new();
    settings.insert(AUTO_DELETE_TIMEOUT_KEY, seconds);
    settings
}

#[test]
fn unused_queue_is_deleted_immediately_without_timeout() {
    common::init_logging();

    let exchanges = ExchangeRegistry::new();
    let timer = Timer::new("queue-cleanup");
    let q = Queue::new("ephemeral", true, None, None);
    q.configure(&FieldTable::new());

    let c = TestConsumer::new("c");
    let d: Arc<dyn Consumer> = c.clone();
    q.consume(&d, false).unwrap();
    assert!(!q.can_auto_delete());
    q.cancel(&d);
    assert!(q.can_auto_delete());

    Queue::try_auto_delete(&q, &timer, &exchanges);
    assert!(q.is_deleted());
    assert!(matches!(
        q.deliver(text_message("ephemeral", "late")),
        Err(Error::ResourceDeleted(_))
    ));
}

#[test]
fn timed_deletion_waits_out_the_grace_period() {
    common::init_logging();

    let exchanges = ExchangeRegistry::new();
    let timer = Timer::new("queue-cleanup");
    let q = Queue::new("graceful", true, None, None);
    q.configure(&timed_settings(1));

    let c = TestConsumer::new("c");
    let d: Arc<dyn Consumer> = c.clone();
    q.consume(&d, false).unwrap();
    q.cancel(&d);
    Queue::try_auto_delete(&q, &timer, &exchanges);

    // still alive inside the grace period
    std::thread::sleep(Duration::from_millis(300));
    assert!(!q.is_deleted());
    q.deliver(text_message("graceful", "still-here")).unwrap();

    std::thread::sleep(Duration::from_millis(1_000));
    assert!(q.is_deleted());
    assert!(matches!(
        q.deliver(text_message("graceful", "late")),
        Err(Error::ResourceDeleted(_))
    ));
}

#[test]
fn resubscription_before_the_deadline_keeps_the_queue() {
    common::init_logging();

    let exchanges = ExchangeRegistry::new();
    let timer = Timer::new("queue-cleanup");
    let q = Queue::new("revived", true, None, None);
    q.configure(&timed_settings(1));

    let c = TestConsumer::new("c");
    let d: Arc<dyn Consumer> = c.clone();
    q.consume(&d, false).unwrap();
    q.cancel(&d);
    Queue::try_auto_delete(&q, &timer, &exchanges);

    // a new consumer arrives before the task fires
    std::thread::sleep(Duration::from_millis(200));
    let c2 = TestConsumer::new("c2");
    let d2: Arc<dyn Consumer> = c2.clone();
    q.consume(&d2, false).unwrap();

    std::thread::sleep(Duration::from_millis(1_200));
    assert!(!q.is_deleted());
    q.deliver(text_message("revived", "x")).unwrap();
    assert!(q.dispatch(&d2).unwrap());
}

#[test]
fn exclusive_owner_blocks_auto_delete() {
    common::init_logging();

    let q = Queue::new("owned", true, None, Some("session-9".to_string()));
    q.configure(&FieldTable::new());
    assert!(!q.can_auto_delete());
    q.release_exclusive_ownership();
    assert!(q.can_auto_delete());
}
