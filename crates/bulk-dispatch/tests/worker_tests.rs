//! Session worker behavior against a scripted SMSC

mod common;

use bulk_common::{Credentials, SendRequest, WorkerCommand, WorkerEvent};
use bulk_dispatch::{spawn_worker, WorkerConfig, WorkerHandle};
use common::{destination, job, sentinel, MockSmsc};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const ENDPOINT: &str = "smsc-a:2775";

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        id: 0,
        endpoint: ENDPOINT.to_string(),
        credentials: Credentials::new("lbtest", "secret"),
        reconnect_backoff: Duration::from_millis(50),
        max_reconnect_attempts: 3,
        max_submits_per_second: None,
    }
}

fn send(index: usize) -> WorkerCommand {
    WorkerCommand::Send(SendRequest {
        index,
        destination: Arc::from(destination(index)),
        job: Arc::new(job()),
    })
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for worker event")
        .expect("worker event channel closed")
}

async fn start(smsc: &MockSmsc, config: WorkerConfig) -> (WorkerHandle, mpsc::UnboundedReceiver<WorkerEvent>) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let handle = spawn_worker(config, smsc.connector(), events_tx, 64);
    assert_eq!(next_event(&mut events_rx).await, WorkerEvent::Ready { worker: 0 });
    (handle, events_rx)
}

#[tokio::test]
async fn test_submits_in_arrival_order() {
    let smsc = MockSmsc::new();
    let (handle, mut events) = start(&smsc, worker_config()).await;

    for index in 0..5 {
        handle.send(send(index)).await.unwrap();
    }
    for index in 0..5 {
        assert_eq!(
            next_event(&mut events).await,
            WorkerEvent::Processed { worker: 0, index }
        );
    }

    let expected: Vec<String> = (0..5).map(destination).collect();
    assert_eq!(smsc.submitted_destinations(), expected);

    handle.request_close();
    assert!(handle.join(Duration::from_secs(1)).await);
    assert_eq!(smsc.unbinds(), 1);
}

#[tokio::test]
async fn test_sentinel_ack_retried_exactly_once_then_dropped() {
    let smsc = MockSmsc::new();
    smsc.script_acks(&destination(0), vec![sentinel(), sentinel()]);
    let (handle, mut events) = start(&smsc, worker_config()).await;

    handle.send(send(0)).await.unwrap();
    handle.send(send(1)).await.unwrap();

    // index 0 never reports processed
    assert_eq!(
        next_event(&mut events).await,
        WorkerEvent::Processed { worker: 0, index: 1 }
    );
    assert_eq!(smsc.submission_count(&destination(0)), 2);

    handle.request_close();
    assert!(handle.join(Duration::from_secs(1)).await);
    assert_eq!(smsc.submission_count(&destination(0)), 2);
}

#[tokio::test]
async fn test_retry_succeeds_on_second_attempt() {
    let smsc = MockSmsc::new();
    smsc.script_acks(&destination(7), vec![sentinel()]);
    let (handle, mut events) = start(&smsc, worker_config()).await;

    handle.send(send(7)).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        WorkerEvent::Processed { worker: 0, index: 7 }
    );
    assert_eq!(smsc.submission_count(&destination(7)), 2);

    handle.request_close();
    assert!(handle.join(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_non_zero_status_counts_as_soft_failure() {
    let smsc = MockSmsc::new();
    smsc.script_acks(
        &destination(2),
        vec![bulk_smpp::SubmitAck::new(0x58, ""), bulk_smpp::SubmitAck::new(0x58, "")],
    );
    let (handle, mut events) = start(&smsc, worker_config()).await;

    handle.send(send(2)).await.unwrap();
    handle.send(send(3)).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        WorkerEvent::Processed { worker: 0, index: 3 }
    );
    assert_eq!(smsc.submission_count(&destination(2)), 2);

    handle.request_close();
    assert!(handle.join(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_retry_takes_priority_over_new_work() {
    let smsc = MockSmsc::new();
    smsc.set_submit_delay(Duration::from_millis(30));
    smsc.script_acks(&destination(0), vec![sentinel()]);
    let (handle, _events) = start(&smsc, worker_config()).await;

    // 1 and 2 are queued while 0 is in flight
    handle.send(send(0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    handle.send(send(1)).await.unwrap();
    handle.send(send(2)).await.unwrap();

    handle.request_close();
    assert!(handle.join(Duration::from_secs(2)).await);

    let order: Vec<String> = vec![destination(0), destination(0), destination(1), destination(2)];
    assert_eq!(smsc.submitted_destinations(), order);
}

#[tokio::test]
async fn test_reconnects_and_drains_queued_sends() {
    let smsc = MockSmsc::new();
    let (handle, mut events) = start(&smsc, worker_config()).await;

    smsc.drop_sessions(None);
    assert_eq!(next_event(&mut events).await, WorkerEvent::NotReady { worker: 0 });

    for index in 0..3 {
        handle.send(send(index)).await.unwrap();
    }

    assert_eq!(next_event(&mut events).await, WorkerEvent::Ready { worker: 0 });
    for index in 0..3 {
        assert_eq!(
            next_event(&mut events).await,
            WorkerEvent::Processed { worker: 0, index }
        );
    }

    handle.send(send(3)).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        WorkerEvent::Processed { worker: 0, index: 3 }
    );

    assert_eq!(smsc.connects().len(), 2);
    let expected: Vec<String> = (0..4).map(destination).collect();
    assert_eq!(smsc.submitted_destinations(), expected);

    handle.request_close();
    assert!(handle.join(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_in_flight_send_survives_session_loss() {
    let smsc = MockSmsc::new();
    smsc.set_submit_delay(Duration::from_millis(100));
    let (handle, mut events) = start(&smsc, worker_config()).await;

    handle.send(send(0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    smsc.drop_sessions(None);

    assert_eq!(next_event(&mut events).await, WorkerEvent::NotReady { worker: 0 });
    assert_eq!(next_event(&mut events).await, WorkerEvent::Ready { worker: 0 });
    assert_eq!(
        next_event(&mut events).await,
        WorkerEvent::Processed { worker: 0, index: 0 }
    );
    assert_eq!(smsc.submission_count(&destination(0)), 1);

    handle.request_close();
    assert!(handle.join(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_unanswered_submission_retried_once_then_dropped() {
    let smsc = MockSmsc::new();
    smsc.leave_unanswered(&destination(0), 100);
    let (handle, mut events) = start(&smsc, worker_config()).await;

    handle.send(send(0)).await.unwrap();
    handle.send(send(1)).await.unwrap();

    // the session stays bound; index 0 never reports processed
    assert_eq!(
        next_event(&mut events).await,
        WorkerEvent::Processed { worker: 0, index: 1 }
    );
    assert_eq!(smsc.submission_count(&destination(0)), 2);

    handle.request_close();
    assert!(handle.join(Duration::from_secs(1)).await);
    assert_eq!(smsc.submission_count(&destination(0)), 2);
    assert_eq!(smsc.connects().len(), 1);
}

#[tokio::test]
async fn test_unanswered_submission_succeeds_on_retry() {
    let smsc = MockSmsc::new();
    smsc.leave_unanswered(&destination(5), 1);
    let (handle, mut events) = start(&smsc, worker_config()).await;

    handle.send(send(5)).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        WorkerEvent::Processed { worker: 0, index: 5 }
    );
    assert_eq!(smsc.submission_count(&destination(5)), 2);

    handle.request_close();
    assert!(handle.join(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_session_lost_twice_mid_submit_drops_message() {
    let smsc = MockSmsc::new();
    smsc.close_on_submit(&destination(0));
    let (handle, mut events) = start(&smsc, worker_config()).await;

    handle.send(send(0)).await.unwrap();
    handle.send(send(1)).await.unwrap();

    assert_eq!(next_event(&mut events).await, WorkerEvent::NotReady { worker: 0 });
    assert_eq!(next_event(&mut events).await, WorkerEvent::Ready { worker: 0 });
    assert_eq!(next_event(&mut events).await, WorkerEvent::NotReady { worker: 0 });
    assert_eq!(next_event(&mut events).await, WorkerEvent::Ready { worker: 0 });
    assert_eq!(
        next_event(&mut events).await,
        WorkerEvent::Processed { worker: 0, index: 1 }
    );

    assert_eq!(smsc.submission_count(&destination(0)), 2);
    assert_eq!(smsc.connects().len(), 3);

    handle.request_close();
    assert!(handle.join(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_initial_bind_failure_reports_error() {
    let smsc = MockSmsc::new();
    smsc.fail_binds(true);

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let handle = spawn_worker(worker_config(), smsc.connector(), events_tx, 8);

    match next_event(&mut events).await {
        WorkerEvent::Error { worker, reason } => {
            assert_eq!(worker, 0);
            assert!(reason.contains(ENDPOINT));
        }
        other => panic!("expected error event, got {:?}", other),
    }

    // no automatic retry for a session that never bound
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(smsc.connects().len(), 1);

    handle.request_close();
    assert!(handle.join(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_gives_up_after_max_reconnect_attempts() {
    let smsc = MockSmsc::new();
    let (handle, mut events) = start(&smsc, worker_config()).await;

    smsc.fail_binds(true);
    smsc.drop_sessions(None);
    assert_eq!(next_event(&mut events).await, WorkerEvent::NotReady { worker: 0 });

    assert!(matches!(
        next_event(&mut events).await,
        WorkerEvent::Error { worker: 0, .. }
    ));
    // initial bind plus three failed reconnects
    assert_eq!(smsc.connects().len(), 4);

    handle.request_close();
    assert!(handle.join(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_join_terminates_unresponsive_worker() {
    let smsc = MockSmsc::new();
    smsc.hang_connect(true);

    let (events_tx, _events) = mpsc::unbounded_channel();
    let handle = spawn_worker(worker_config(), smsc.connector(), events_tx, 8);
    tokio::time::sleep(Duration::from_millis(20)).await;

    handle.request_close();
    let started = Instant::now();
    assert!(!handle.join(Duration::from_millis(100)).await);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_pause_and_resume_do_not_stop_draining() {
    let smsc = MockSmsc::new();
    let (handle, mut events) = start(&smsc, worker_config()).await;

    assert!(handle.try_send(WorkerCommand::Pause));
    handle.send(send(0)).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        WorkerEvent::Processed { worker: 0, index: 0 }
    );
    assert!(handle.try_send(WorkerCommand::Resume));

    handle.request_close();
    assert!(handle.join(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_submit_rate_limit() {
    let smsc = MockSmsc::new();
    let mut config = worker_config();
    config.max_submits_per_second = NonZeroU32::new(10);
    let (handle, mut events) = start(&smsc, config).await;

    let started = Instant::now();
    for index in 0..15 {
        handle.send(send(index)).await.unwrap();
    }
    for _ in 0..15 {
        next_event(&mut events).await;
    }

    // burst of 10, the remaining 5 at 100ms each
    assert!(started.elapsed() >= Duration::from_millis(400));

    handle.request_close();
    assert!(handle.join(Duration::from_secs(1)).await);
}
