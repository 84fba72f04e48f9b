//! Scan → queue → handler scenarios over the in-memory broker.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{FakePlatform, Harness, item};
use herald_publisher::{ExpireHandler, ItemState, PublishHandler, ScanConfig, Scanner};
use herald_queue::{MemoryBroker, Task, TaskHandler, TaskOrigin, TaskPayload, TaskQueue, queues};

fn scanner(h: &Harness, broker: &MemoryBroker) -> Scanner {
    Scanner::new(
        h.store.clone(),
        TaskQueue::new(Arc::new(broker.clone())),
        ScanConfig::default(),
    )
}

#[tokio::test]
async fn test_scheduled_item_published_at_its_time() {
    let h = Harness::new();
    let broker = MemoryBroker::new();
    let now = Utc::now();
    let scheduled_at = now + chrono::Duration::seconds(30);

    let mut upcoming = item("item1");
    upcoming.scheduled_at = Some(scheduled_at);
    h.store.insert(upcoming).await;

    assert_eq!(scanner(&h, &broker).scan_scheduled(now).await.unwrap(), 1);

    let pending = broker.pending(queues::DOMAIN_HIGH).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].task.not_before, scheduled_at);
    assert_eq!(
        pending[0].task.payload,
        TaskPayload::PublishContent {
            item_id: "item1".to_string(),
            origin: TaskOrigin::Scan,
        }
    );

    // Not visible before its time
    assert!(broker.take_due(queues::DOMAIN_HIGH, now).await.is_empty());
    let due = broker.take_due(queues::DOMAIN_HIGH, scheduled_at).await;
    assert_eq!(due.len(), 1);

    let handler = PublishHandler::new(h.workflow.clone());
    handler.handle(&due[0].task).await.unwrap();

    let published = h.store.get("item1").await;
    assert_eq!(published.state(), ItemState::Published);
    assert_eq!(published.external_draft_id.as_deref(), Some("draft-123"));
    assert_eq!(FakePlatform::count(&h.platform.creates), 1);
    assert_eq!(FakePlatform::count(&h.platform.submits), 1);
}

#[tokio::test]
async fn test_repeated_ticks_emit_one_task_per_schedule() {
    let h = Harness::new();
    let broker = MemoryBroker::new();
    let now = Utc::now();

    let mut upcoming = item("item1");
    upcoming.scheduled_at = Some(now + chrono::Duration::minutes(4));
    h.store.insert(upcoming).await;

    let scanner = scanner(&h, &broker);
    assert_eq!(scanner.scan_scheduled(now).await.unwrap(), 1);
    for minute in 1..4 {
        let tick = now + chrono::Duration::minutes(minute);
        assert_eq!(scanner.scan_scheduled(tick).await.unwrap(), 0);
    }

    assert_eq!(broker.pending(queues::DOMAIN_HIGH).await.len(), 1);
}

#[tokio::test]
async fn test_concurrent_scan_tasks_publish_once() {
    let h = Harness::with_platform(FakePlatform {
        create_delay: Some(Duration::from_millis(50)),
        ..FakePlatform::default()
    });
    let mut upcoming = item("item1");
    upcoming.scheduled_at = Some(Utc::now());
    h.store.insert(upcoming).await;

    let first = Task::publish("item1", TaskOrigin::Scan);
    let second = Task::publish("item1", TaskOrigin::Scan);
    let handler = PublishHandler::new(h.workflow.clone());

    let (a, b) = tokio::join!(handler.handle(&first), handler.handle(&second));
    a.unwrap();
    b.unwrap();

    assert_eq!(FakePlatform::count(&h.platform.creates), 2);
    assert_eq!(FakePlatform::count(&h.platform.submits), 1);
    assert_eq!(FakePlatform::count(&h.platform.deletes), 1);

    let stored = h.store.get("item1").await;
    let draft_id = stored.external_draft_id.clone().unwrap();
    let live = h.platform.live_drafts.lock().await.clone();
    assert_eq!(live.into_iter().collect::<Vec<_>>(), vec![draft_id.clone()]);
    assert_eq!(*h.platform.submitted.lock().await, vec![draft_id]);
    assert_eq!(stored.state(), ItemState::Published);
}

#[tokio::test]
async fn test_long_overdue_items_do_not_starve_new_ones() {
    let h = Harness::new();
    let broker = MemoryBroker::new();
    let now = Utc::now();

    for id in ["stuck1", "stuck2"] {
        let mut stuck = item(id);
        stuck.scheduled_at = Some(now - chrono::Duration::days(30));
        h.store.insert(stuck).await;
    }
    let mut fresh = item("fresh");
    fresh.scheduled_at = Some(now + chrono::Duration::seconds(30));
    h.store.insert(fresh).await;

    let scanner = Scanner::new(
        h.store.clone(),
        TaskQueue::new(Arc::new(broker.clone())),
        ScanConfig {
            batch_size: 2,
            ..ScanConfig::default()
        },
    );
    for tick in 0..5 {
        scanner
            .scan_scheduled(now + chrono::Duration::seconds(tick))
            .await
            .unwrap();
    }

    let pending = broker.pending(queues::DOMAIN_HIGH).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(
        pending[0].task.payload,
        TaskPayload::PublishContent {
            item_id: "fresh".to_string(),
            origin: TaskOrigin::Scan,
        }
    );
}

#[tokio::test]
async fn test_scan_ignores_items_outside_window() {
    let h = Harness::new();
    let broker = MemoryBroker::new();
    let now = Utc::now();

    let mut later = item("later");
    later.scheduled_at = Some(now + chrono::Duration::minutes(30));
    h.store.insert(later).await;
    h.store.insert(item("unscheduled")).await;

    assert_eq!(scanner(&h, &broker).scan_scheduled(now).await.unwrap(), 0);
    assert!(broker.pending(queues::DOMAIN_HIGH).await.is_empty());
}

#[tokio::test]
async fn test_overdue_item_is_due_immediately() {
    let h = Harness::new();
    let broker = MemoryBroker::new();
    let now = Utc::now();

    let mut overdue = item("item1");
    overdue.scheduled_at = Some(now - chrono::Duration::minutes(2));
    h.store.insert(overdue).await;

    scanner(&h, &broker).scan_scheduled(now).await.unwrap();
    assert_eq!(broker.take_due(queues::DOMAIN_HIGH, now).await.len(), 1);
}

#[tokio::test]
async fn test_expiring_item_expired_at_its_time() {
    let h = Harness::new();
    let broker = MemoryBroker::new();
    let now = Utc::now();
    let expires_at = now + chrono::Duration::minutes(20);

    let mut live = item("item1");
    live.expires_at = Some(expires_at);
    live.external_draft_id = Some("draft-1".to_string());
    live.last_published_at = Some(now - chrono::Duration::days(3));
    h.store.insert(live).await;

    let scanner = scanner(&h, &broker);
    assert_eq!(scanner.scan_expiring(now).await.unwrap(), 1);

    let due = broker.take_due(queues::DOMAIN_LOW, expires_at).await;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].task.not_before, expires_at);

    // Handlers use the wall clock, so run the workflow at the due time directly
    h.workflow.expire("item1", expires_at).await.unwrap();
    assert_eq!(h.store.get("item1").await.state(), ItemState::Expired);

    // A second delivery for an expired item is a no-op
    ExpireHandler::new(h.workflow.clone())
        .handle(&due[0].task)
        .await
        .unwrap();

    // Expired items drop out of later scans
    assert_eq!(scanner.scan_expiring(now).await.unwrap(), 0);
}
