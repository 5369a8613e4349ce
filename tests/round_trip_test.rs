//! Dispatch -> worker -> reply over the in-memory broker.

mod common;

use common::{Harness, RecordingNotifier, SHORT};
use relay_rs::broker::{Broker, Publish, Subscriptions};
use relay_rs::error::{Error, Result};
use relay_rs::model::{
    CorrelationToken, Envelope, ReplyAddress, Status, WorkConfirmation, WorkRequest,
};
use relay_rs::reply::{Correlation, ReplyCorrelator, ReplyListener};
use relay_rs::worker::{Handled, Job, JobOutcome, PayloadLengthJob};
use std::sync::Arc;
use std::time::Duration;

const WORK: &str = "work.queue";
const REPLY: &str = "reply.queue";

struct FailingJob;

impl Job for FailingJob {
    fn execute(&self, request: &WorkRequest) -> Result<JobOutcome> {
        Err(Error::ProcessingFailure(format!("cannot process {}", request.job_id)))
    }
}

/// Blows up on job id "BOOM", otherwise measures the payload.
struct PanickingJob;

impl Job for PanickingJob {
    fn execute(&self, request: &WorkRequest) -> Result<JobOutcome> {
        if request.job_id == "BOOM" {
            panic!("payload exploded");
        }
        PayloadLengthJob.execute(request)
    }
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn request_reply_round_trip() {
    let h = Harness::new();
    let pending = h
        .dispatcher()
        .request(WorkRequest::new("J1", "hello"), &h.correlator)
        .await
        .unwrap();

    let outcome = pending.confirmation.wait().await.unwrap();
    assert!(outcome.accepted);
    assert_eq!(outcome.correlation_token, pending.token);

    let delivery = h.broker.next_delivery(WORK).await.unwrap().unwrap();
    assert_eq!(delivery.envelope.correlation_token, Some(pending.token));
    assert!(delivery.envelope.persistent);
    assert_eq!(
        delivery.envelope.reply_to.as_ref().map(ToString::to_string),
        Some("app.direct/reply".to_string())
    );

    let handled = h.worker().handle(delivery).await;
    assert_eq!(handled, Handled::Processed { replied: true });

    let reply = h.broker.next_delivery(REPLY).await.unwrap().unwrap();
    assert_eq!(reply.envelope.correlation_token, Some(pending.token));
    match h.reply_listener().on_reply(reply).await {
        Correlation::Matched { token, confirmation } => {
            assert_eq!(token, pending.token);
            assert_eq!(confirmation.job_id, "J1");
        }
        other => panic!("expected Matched, got {other:?}"),
    }

    let confirmation = pending.reply.wait_timeout(SHORT).await.unwrap();
    assert_eq!(confirmation.job_id, "J1");
    assert_eq!(confirmation.status, Status::Success);
    assert!(confirmation.details.contains('5'), "{}", confirmation.details);

    assert_eq!(h.notifier.calls(), 1);
    assert_eq!(h.broker.unacked(), 0);
    assert_eq!(h.correlator.outstanding(), 0);
}

#[tokio::test]
async fn notify_target_reaches_notifier() {
    let h = Harness::new();
    h.dispatcher()
        .dispatch(WorkRequest::new("J2", "abc").notify("user@example.com"))
        .await
        .unwrap();

    let delivery = h.broker.next_delivery(WORK).await.unwrap().unwrap();
    h.worker().handle(delivery).await;

    let notices = h.notifier.notices.lock().unwrap().clone();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].job_id, "J2");
    assert_eq!(notices[0].status, Status::Success);
    assert_eq!(notices[0].target.as_deref(), Some("user@example.com"));
}

#[tokio::test]
async fn subscriptions_drive_many_requests() {
    let h = Harness::new();
    let subs = Subscriptions::new(h.broker.clone())
        .on(WORK, Arc::new(h.worker()))
        .on(REPLY, Arc::new(h.reply_listener()))
        .consumers_per_queue(4);
    let stop = subs.shutdown_handle();
    let running = tokio::spawn(subs.run());

    let dispatcher = h.dispatcher();
    let mut pending = Vec::new();
    for i in 0..20 {
        let req = WorkRequest::new(format!("JOB-{i}"), "x".repeat(i));
        pending.push(dispatcher.request(req, &h.correlator).await.unwrap());
    }

    for (i, p) in pending.into_iter().enumerate() {
        p.confirmation.wait_timeout(SHORT).await.unwrap();
        let reply = p.reply.wait_timeout(SHORT).await.unwrap();
        assert_eq!(reply.job_id, format!("JOB-{i}"));
        assert_eq!(reply.details, format!("Processed payload length={i}"));
    }

    stop.shutdown();
    tokio::time::timeout(SHORT, running)
        .await
        .expect("subscriptions did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(h.notifier.calls(), 20);
}

#[tokio::test]
async fn private_reply_queues_keep_requesters_apart() {
    let h = Harness::new();
    let alice = Arc::new(ReplyCorrelator::new());
    let bob = Arc::new(ReplyCorrelator::new());
    let alice_queue = h.topology.private_reply_queue();
    let bob_queue = h.topology.private_reply_queue();
    h.broker.declare_queue(&alice_queue).await.unwrap();
    h.broker.declare_queue(&bob_queue).await.unwrap();

    let subs = Subscriptions::new(h.broker.clone())
        .on(WORK, Arc::new(h.worker()))
        .on(
            alice_queue.clone(),
            Arc::new(ReplyListener::new(h.broker.clone(), alice.clone())),
        )
        .on(
            bob_queue.clone(),
            Arc::new(ReplyListener::new(h.broker.clone(), bob.clone())),
        )
        .consumers_per_queue(2);
    let stop = subs.shutdown_handle();
    let running = tokio::spawn(subs.run());

    let mut waits = Vec::new();
    for i in 0..10 {
        let (correlator, queue, who) = if i % 2 == 0 {
            (&alice, &alice_queue, "alice")
        } else {
            (&bob, &bob_queue, "bob")
        };
        let pending = h
            .dispatcher()
            .with_reply_address(ReplyAddress::direct(queue))
            .request(WorkRequest::new(format!("{who}-{i}"), "hi"), correlator)
            .await
            .unwrap();
        waits.push((format!("{who}-{i}"), pending));
    }

    // A reply landing on the other requester's queue would leave this waiter
    // to time out.
    for (job_id, pending) in waits {
        let reply = pending.reply.wait_timeout(SHORT).await.unwrap();
        assert_eq!(reply.job_id, job_id);
    }

    stop.shutdown();
    running.await.unwrap().unwrap();
    assert_eq!(alice.outstanding(), 0);
    assert_eq!(bob.outstanding(), 0);

    let shared = tokio::time::timeout(Duration::from_millis(50), h.broker.next_delivery(REPLY)).await;
    assert!(shared.is_err(), "reply leaked onto the shared reply queue");

    h.broker.delete_queue(&alice_queue).await.unwrap();
    h.broker.delete_queue(&bob_queue).await.unwrap();
    assert_eq!(h.broker.unacked(), 0);
}

#[tokio::test]
async fn consumers_exit_when_broker_closes() {
    let h = Harness::new();
    let subs = Subscriptions::new(h.broker.clone()).on(WORK, Arc::new(h.worker()));
    let running = tokio::spawn(subs.run());

    tokio::time::sleep(Duration::from_millis(20)).await;
    h.broker.close();
    tokio::time::timeout(SHORT, running)
        .await
        .expect("consumers kept running after close")
        .unwrap()
        .unwrap();
}

// ---------------------------------------------------------------------------
// Redelivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn redelivered_duplicate_is_skipped() {
    let h = Harness::new();
    let worker = h.worker();
    let dispatched = h
        .dispatcher()
        .dispatch(WorkRequest::new("J1", "hello"))
        .await
        .unwrap();

    // Consumer "crashes" after receiving: the broker hands the message out again.
    let first = h.broker.next_delivery(WORK).await.unwrap().unwrap();
    assert_eq!(h.broker.redeliver_unacked(), 1);
    let second = h.broker.next_delivery(WORK).await.unwrap().unwrap();
    assert!(second.redelivered);
    assert_eq!(second.envelope.correlation_token, Some(dispatched.token));

    assert_eq!(worker.handle(first).await, Handled::Processed { replied: true });
    assert_eq!(worker.handle(second).await, Handled::Duplicate);

    assert_eq!(h.notifier.calls(), 1);
    let reply = h.broker.next_delivery(REPLY).await.unwrap().unwrap();
    assert_eq!(reply.envelope.correlation_token, Some(dispatched.token));
    let another = tokio::time::timeout(Duration::from_millis(50), h.broker.next_delivery(REPLY)).await;
    assert!(another.is_err(), "second reply published for a duplicate");
    assert_eq!(h.broker.unacked(), 1, "only the reply is still unacked");
}

#[tokio::test]
async fn same_envelope_published_twice_runs_once() {
    let h = Harness::new();
    let subs = Subscriptions::new(h.broker.clone())
        .on(WORK, Arc::new(h.worker()))
        .on(REPLY, Arc::new(h.reply_listener()))
        .consumers_per_queue(2);
    let stop = subs.shutdown_handle();
    let running = tokio::spawn(subs.run());

    let token = CorrelationToken::mint();
    let reply = h.correlator.expect(token);
    let envelope = Envelope::json(&WorkRequest::new("J9", "dup"))
        .unwrap()
        .correlated(token)
        .reply_to(h.topology.reply_address())
        .persistent();
    for _ in 0..2 {
        h.broker
            .publish(Publish::mandatory("app.direct", "work", envelope.clone()))
            .await
            .unwrap();
    }

    assert_eq!(reply.wait_timeout(SHORT).await.unwrap().job_id, "J9");
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.shutdown();
    running.await.unwrap().unwrap();

    assert_eq!(h.notifier.calls(), 1);
    assert!(h.dedup.record(token).is_some());
}

// ---------------------------------------------------------------------------
// Worker failure modes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fire_and_forget_request_gets_no_reply() {
    let h = Harness::new();
    let envelope = Envelope::json(&WorkRequest::new("J3", "quiet"))
        .unwrap()
        .correlated(CorrelationToken::mint());
    h.broker
        .publish(Publish::mandatory("app.direct", "work", envelope))
        .await
        .unwrap();

    let delivery = h.broker.next_delivery(WORK).await.unwrap().unwrap();
    assert_eq!(h.worker().handle(delivery).await, Handled::Processed { replied: false });
    assert_eq!(h.notifier.calls(), 1);
    assert_eq!(h.broker.unacked(), 0);
}

#[tokio::test]
async fn processing_failure_replies_failure_without_notifying() {
    let h = Harness::new();
    let worker = h.worker().with_job(FailingJob);
    let pending = h
        .dispatcher()
        .request(WorkRequest::new("J4", "boom"), &h.correlator)
        .await
        .unwrap();

    let delivery = h.broker.next_delivery(WORK).await.unwrap().unwrap();
    assert_eq!(worker.handle(delivery).await, Handled::Failed { replied: true });
    assert_eq!(h.notifier.calls(), 0);
    assert_eq!(h.broker.unacked(), 0, "failed delivery must still be acked");

    let reply = h.broker.next_delivery(REPLY).await.unwrap().unwrap();
    h.reply_listener().on_reply(reply).await;
    let confirmation = pending.reply.wait_timeout(SHORT).await.unwrap();
    assert_eq!(confirmation.status, Status::Failure);
    assert!(confirmation.details.contains("cannot process J4"));
}

#[tokio::test]
async fn panicking_job_replies_failure_and_consumer_survives() {
    let h = Harness::new();
    let subs = Subscriptions::new(h.broker.clone())
        .on(WORK, Arc::new(h.worker().with_job(PanickingJob)))
        .on(REPLY, Arc::new(h.reply_listener()))
        .consumers_per_queue(1);
    let stop = subs.shutdown_handle();
    let running = tokio::spawn(subs.run());
    let dispatcher = h.dispatcher();

    let boom = dispatcher
        .request(WorkRequest::new("BOOM", "x"), &h.correlator)
        .await
        .unwrap();
    let reply = boom.reply.wait_timeout(SHORT).await.unwrap();
    assert_eq!(reply.job_id, "BOOM");
    assert_eq!(reply.status, Status::Failure);
    assert!(reply.details.contains("job panicked: payload exploded"), "{}", reply.details);

    // The only work consumer must still be alive.
    let ok = dispatcher
        .request(WorkRequest::new("OK", "abc"), &h.correlator)
        .await
        .unwrap();
    let reply = ok.reply.wait_timeout(SHORT).await.unwrap();
    assert_eq!(reply.status, Status::Success);
    assert_eq!(reply.details, "Processed payload length=3");

    stop.shutdown();
    running.await.unwrap().unwrap();
    assert_eq!(h.notifier.calls(), 1);
    assert_eq!(h.broker.unacked(), 0);
}

#[tokio::test]
async fn notification_failure_does_not_block_reply() {
    let h = Harness::with_notifier(RecordingNotifier::failing());
    h.dispatcher()
        .dispatch(WorkRequest::new("J5", "hello"))
        .await
        .unwrap();

    let delivery = h.broker.next_delivery(WORK).await.unwrap().unwrap();
    assert_eq!(h.worker().handle(delivery).await, Handled::Processed { replied: true });
    assert_eq!(h.notifier.calls(), 1);

    let reply = h.broker.next_delivery(REPLY).await.unwrap().unwrap();
    let confirmation: WorkConfirmation = reply.envelope.decode().unwrap();
    assert_eq!(confirmation.status, Status::Success);
}

#[tokio::test]
async fn undecodable_payload_is_acked_without_side_effects() {
    let h = Harness::new();
    let envelope = Envelope::json(&serde_json::json!({"unexpected": true}))
        .unwrap()
        .correlated(CorrelationToken::mint())
        .reply_to(h.topology.reply_address());
    h.broker
        .publish(Publish::mandatory("app.direct", "work", envelope))
        .await
        .unwrap();

    let delivery = h.broker.next_delivery(WORK).await.unwrap().unwrap();
    assert_eq!(h.worker().handle(delivery).await, Handled::Failed { replied: false });
    assert_eq!(h.notifier.calls(), 0);
    assert_eq!(h.broker.unacked(), 0);
}

#[tokio::test]
async fn delivery_without_token_is_discarded() {
    let h = Harness::new();
    let envelope = Envelope::json(&WorkRequest::new("J6", "anon")).unwrap();
    h.broker
        .publish(Publish::mandatory("app.direct", "work", envelope))
        .await
        .unwrap();

    let delivery = h.broker.next_delivery(WORK).await.unwrap().unwrap();
    assert_eq!(h.worker().handle(delivery).await, Handled::Discarded);
    assert_eq!(h.notifier.calls(), 0);
    assert!(h.dedup.is_empty());
    assert_eq!(h.broker.unacked(), 0);
}

// ---------------------------------------------------------------------------
// Reply correlation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reply_with_unknown_token_is_reported() {
    let h = Harness::new();
    let stray = CorrelationToken::mint();
    let envelope = Envelope::json(&WorkConfirmation {
        job_id: "OLD".to_string(),
        status: Status::Success,
        details: "from before a restart".to_string(),
    })
    .unwrap()
    .correlated(stray);
    h.broker
        .publish(Publish::mandatory("app.direct", "reply", envelope))
        .await
        .unwrap();

    let delivery = h.broker.next_delivery(REPLY).await.unwrap().unwrap();
    match h.reply_listener().on_reply(delivery).await {
        Correlation::Unknown { token, confirmation } => {
            assert_eq!(token, stray);
            assert_eq!(confirmation.job_id, "OLD");
        }
        other => panic!("expected Unknown, got {other:?}"),
    }
    assert_eq!(h.broker.unacked(), 0);
}
