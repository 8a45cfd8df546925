use std::sync::Arc;
use std::time::Duration;

use keyleaseq::{IfInFlight, LeasedQueue, QueueError, QueueOptions};
use tokio::time::timeout;

fn queue() -> LeasedQueue<&'static str, i32> {
    LeasedQueue::new(QueueOptions::default())
}

#[tokio::test]
async fn basic_fifo() {
    let q = queue();
    q.put("a", 1, IfInFlight::Update).await.unwrap();
    q.put("b", 2, IfInFlight::Update).await.unwrap();

    let (k1, v1, t1) = q.get(None, None).await.unwrap();
    assert_eq!((k1, v1), ("a", 1));
    let (k2, v2, t2) = q.get(None, None).await.unwrap();
    assert_eq!((k2, v2), ("b", 2));

    q.ack(&t1).await.unwrap();
    q.ack(&t2).await.unwrap();
    assert_eq!(q.qsize().await, 0);
}

#[tokio::test]
async fn update_in_available_preserves_position_and_overwrites_value() {
    let q = queue();
    q.put("a", 1, IfInFlight::Update).await.unwrap();
    q.put("a", 2, IfInFlight::Update).await.unwrap();

    let (k, v, _t) = q.get(None, None).await.unwrap();
    assert_eq!((k, v), ("a", 2));
    assert_eq!(q.qsize().await, 0);
}

#[tokio::test]
async fn reject_while_in_flight() {
    let q = queue();
    q.put("a", 1, IfInFlight::Update).await.unwrap();
    let (_, _, t) = q.get(None, None).await.unwrap();

    let err = q.put("a", 9, IfInFlight::Reject).await.unwrap_err();
    assert_eq!(err, QueueError::KeyInFlight);

    q.ack(&t).await.unwrap();
    assert!(!q.contains(&"a").await);
}

#[tokio::test]
async fn take_consumes_a_key_out_of_fifo_order() {
    let q = Arc::new(queue());
    let taker = {
        let q = q.clone();
        tokio::spawn(async move { q.take("b", Some(Duration::from_secs(5)), None).await })
    };
    // Give the taker a moment to register before the keys exist.
    tokio::time::sleep(Duration::from_millis(20)).await;

    q.put("a", 1, IfInFlight::Update).await.unwrap();
    q.put("b", 2, IfInFlight::Update).await.unwrap();

    let (k, v, _t) = timeout(Duration::from_secs(5), taker)
        .await
        .expect("taker join timeout")
        .expect("taker task panicked")
        .expect("take should succeed");
    assert_eq!((k, v), ("b", 2));

    let (k2, v2, _t2) = q.get(None, None).await.unwrap();
    assert_eq!((k2, v2), ("a", 1), "take should have consumed b out of FIFO order");
}

#[tokio::test]
async fn reaper_requeues_expired_lease_to_front() {
    let opts = QueueOptions {
        default_lease_timeout: Some(Duration::from_millis(200)),
        ..QueueOptions::default()
    };
    let q = LeasedQueue::new(opts);
    q.start();

    q.put("x", 1, IfInFlight::Update).await.unwrap();
    let (_, _, t) = q.get(None, None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(q.qsize().await, 1);

    let (k, v, _t2) = q.get(None, None).await.unwrap();
    assert_eq!((k, v), ("x", 1));

    let err = q.ack(&t).await.unwrap_err();
    assert_eq!(err, QueueError::InvalidLease);
}

#[tokio::test]
async fn release_to_front_takes_priority_over_newer_items() {
    let q = queue();
    q.put("a", 1, IfInFlight::Update).await.unwrap();
    q.put("b", 2, IfInFlight::Update).await.unwrap();

    let (k, v, t) = q.get(None, None).await.unwrap();
    assert_eq!((k, v), ("a", 1));

    q.release(&t, true).await.unwrap();

    let (k2, v2, _t2) = q.get(None, None).await.unwrap();
    assert_eq!((k2, v2), ("a", 1));
}

#[tokio::test]
async fn empty_get_with_zero_timeout_fails_immediately_without_state_change() {
    let q = queue();
    let err = q
        .get(Some(Duration::from_millis(0)), None)
        .await
        .unwrap_err();
    assert_eq!(err, QueueError::Timeout);
    assert_eq!(q.qsize().await, 0);
    assert_eq!(q.inflight_size().await, 0);
}

#[tokio::test]
async fn close_wakes_a_waiting_get_with_closed_error() {
    let q = Arc::new(queue());
    let waiter = {
        let q = q.clone();
        tokio::spawn(async move { q.get(Some(Duration::from_secs(5)), None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    q.close().await;

    let result = timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter join timeout")
        .expect("waiter task panicked");
    assert_eq!(result.unwrap_err(), QueueError::Closed);
}

#[tokio::test]
async fn buffer_policy_does_not_duplicate_on_release() {
    let q = queue();
    q.put("a", 1, IfInFlight::Update).await.unwrap();
    let (_, _, t) = q.get(None, None).await.unwrap();

    q.put("a", 2, IfInFlight::Buffer).await.unwrap();
    assert_eq!(q.qsize().await, 1, "buffered duplicate is the only available node for the key");

    let size_before_release = q.qsize().await;
    q.release(&t, false).await.unwrap();
    assert_eq!(
        q.qsize().await,
        size_before_release,
        "releasing the original lease must not create a second available copy"
    );

    let (_, v, _t2) = q.get(None, None).await.unwrap();
    assert_eq!(v, 2, "the buffered value wins over the released lease's stale value");
}

#[tokio::test]
async fn scoped_closes_the_queue_on_normal_exit() {
    let q = Arc::new(LeasedQueue::new(QueueOptions::default()));
    let observed_open = q
        .clone()
        .scoped(|q| async move {
            q.put("a", 1, IfInFlight::Update).await.unwrap();
            q.qsize().await
        })
        .await;
    assert_eq!(observed_open, 1);

    let err = q.put("b", 2, IfInFlight::Update).await.unwrap_err();
    assert_eq!(err, QueueError::Closed);
}
