//! End-to-end delivery tests: production engine and service against a local
//! receiver, with retries walked through on a test clock.

use std::time::Duration;

use courier_core::{
    models::{AuthConfig, Delivery, DeliveryJob, DeliveryStatus, WebhookEnvelope},
    Clock,
};
use courier_delivery::{
    queue::DeliveryQueue,
    signing::{verify_signature_header, SIGNATURE_HEADER, TIMESTAMP_HEADER},
    store::DeliveryStore,
    DeliveryError, JobOutcome,
};
use courier_testing::{
    sample_payload, MockReceiver, MockResponse, SubscriptionBuilder, TestEnv, TEST_EVENT,
    TEST_SECRET,
};
use wiremock::Request;

fn header<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers.get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn successful_delivery_marks_delivered_after_one_attempt() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.always(MockResponse::Status(200)).await;
    let sub = env.subscribe(receiver.url()).await;

    let delivery = env.service.enqueue_delivery(sub.id, TEST_EVENT, sample_payload()).await.unwrap();
    let outcomes = env.run_delivery_cycle().await.unwrap();

    assert_eq!(outcomes, vec![JobOutcome::Delivered]);
    let delivery = env.delivery(delivery.id).await.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(delivery.attempts, 1);
    assert_eq!(delivery.status_code, Some(200));
    assert!(delivery.delivered_at.is_some());
    assert_eq!(env.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn request_carries_envelope_and_verifiable_signature() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.always(MockResponse::Status(204)).await;
    let sub = env.subscribe(receiver.url()).await;

    let delivery = env.service.enqueue_delivery(sub.id, TEST_EVENT, sample_payload()).await.unwrap();
    env.run_delivery_cycle().await.unwrap();

    let requests = receiver.requests().await;
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let envelope: WebhookEnvelope = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(envelope.event, TEST_EVENT);
    assert_eq!(envelope.data, sample_payload());

    let signature = header(request, SIGNATURE_HEADER).unwrap();
    let timestamp: i64 = header(request, TIMESTAMP_HEADER).unwrap().parse().unwrap();
    assert!(verify_signature_header(
        &request.body,
        signature,
        TEST_SECRET,
        timestamp,
        env.clock.unix_seconds(),
        Duration::from_secs(300),
    ));

    assert_eq!(header(request, "content-type"), Some("application/json"));
    assert_eq!(header(request, "x-webhook-event"), Some(TEST_EVENT));
    assert_eq!(header(request, "x-webhook-attempt"), Some("1"));
    let delivery_id = delivery.id.to_string();
    assert_eq!(header(request, "x-webhook-delivery-id"), Some(delivery_id.as_str()));
}

#[tokio::test]
async fn persistent_failure_exhausts_retries_then_fails() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.always(MockResponse::Status(500)).await;
    let sub = env.subscribe(receiver.url()).await;

    let delivery = env.service.enqueue_delivery(sub.id, TEST_EVENT, sample_payload()).await.unwrap();
    let outcomes = env.run_until_settled(10).await.unwrap();

    assert_eq!(
        outcomes,
        vec![
            JobOutcome::RetryScheduled { next_attempt: 2 },
            JobOutcome::RetryScheduled { next_attempt: 3 },
            JobOutcome::RetryScheduled { next_attempt: 4 },
            JobOutcome::Failed,
        ]
    );
    assert_eq!(receiver.request_count().await, 4);

    let delivery = env.delivery(delivery.id).await.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempts, 4);
    assert_eq!(delivery.status_code, Some(500));
    assert_eq!(delivery.error.as_deref(), Some("HTTP 500: status 500"));
}

#[tokio::test]
async fn status_history_follows_the_state_machine() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.times(MockResponse::Status(502), 1).await;
    receiver.always(MockResponse::Status(200)).await;
    let sub = env.subscribe(receiver.url()).await;

    let delivery = env.service.enqueue_delivery(sub.id, TEST_EVENT, sample_payload()).await.unwrap();
    env.run_until_settled(5).await.unwrap();

    assert_eq!(
        env.store.status_history(delivery.id).await,
        vec![
            DeliveryStatus::Pending,
            DeliveryStatus::Processing,
            DeliveryStatus::Retrying,
            DeliveryStatus::Processing,
            DeliveryStatus::Delivered,
        ]
    );
    assert_eq!(env.delivery(delivery.id).await.unwrap().attempts, 2);
}

#[tokio::test]
async fn retries_follow_exponential_backoff() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.always(MockResponse::Status(503)).await;
    let sub = env.subscribe(receiver.url()).await;
    env.service.enqueue_delivery(sub.id, TEST_EVENT, sample_payload()).await.unwrap();

    let mut gaps = Vec::new();
    for _ in 0..3 {
        env.run_delivery_cycle().await.unwrap();
        let now = env.clock.now_utc();
        let next = env.queue.jobs().await[0].run_at;
        gaps.push((next - now).num_seconds());
        env.advance_to_next_job().await;
    }

    assert_eq!(gaps, vec![1, 2, 4]);
}

#[tokio::test]
async fn early_retry_is_not_claimed() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.always(MockResponse::Status(500)).await;
    let sub = env.subscribe(receiver.url()).await;
    env.service.enqueue_delivery(sub.id, TEST_EVENT, sample_payload()).await.unwrap();

    env.run_delivery_cycle().await.unwrap();
    env.advance_time(Duration::from_millis(500));

    assert!(env.run_delivery_cycle().await.unwrap().is_empty());
    assert_eq!(receiver.request_count().await, 1);
}

#[tokio::test]
async fn retry_after_lengthens_the_delay() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.times(MockResponse::RateLimited { retry_after: Some(120) }, 1).await;
    receiver.always(MockResponse::Status(200)).await;
    let sub = env.subscribe(receiver.url()).await;
    let delivery = env.service.enqueue_delivery(sub.id, TEST_EVENT, sample_payload()).await.unwrap();

    env.run_delivery_cycle().await.unwrap();
    let next = env.queue.jobs_for(delivery.id).await[0].run_at;
    assert_eq!((next - env.clock.now_utc()).num_seconds(), 120);

    env.run_until_settled(3).await.unwrap();
    assert_eq!(env.delivery(delivery.id).await.unwrap().status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn timeout_counts_as_failed_attempt() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.always(MockResponse::Delayed(Duration::from_secs(3))).await;
    let sub = env
        .add_subscription(SubscriptionBuilder::with_defaults(receiver.url()).timeout_ms(200).build())
        .await;

    let delivery = env.service.enqueue_delivery(sub.id, TEST_EVENT, sample_payload()).await.unwrap();
    let outcomes = env.run_delivery_cycle().await.unwrap();

    assert_eq!(outcomes, vec![JobOutcome::RetryScheduled { next_attempt: 2 }]);
    let delivery = env.delivery(delivery.id).await.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Retrying);
    assert_eq!(delivery.error.as_deref(), Some("request timeout after 200ms"));
    assert_eq!(delivery.status_code, None);
}

#[tokio::test]
async fn manual_retry_restarts_a_failed_delivery() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.times(MockResponse::Status(500), 1).await;
    receiver.always(MockResponse::Status(200)).await;
    let sub = env
        .add_subscription(SubscriptionBuilder::with_defaults(receiver.url()).max_retries(0).build())
        .await;

    let delivery = env.service.enqueue_delivery(sub.id, TEST_EVENT, sample_payload()).await.unwrap();
    assert_eq!(env.run_delivery_cycle().await.unwrap(), vec![JobOutcome::Failed]);

    let reset = env.service.retry_delivery(delivery.id).await.unwrap();
    assert_eq!(reset.status, DeliveryStatus::Pending);
    assert_eq!(reset.attempts, 0);

    assert_eq!(env.run_delivery_cycle().await.unwrap(), vec![JobOutcome::Delivered]);
    let delivery = env.delivery(delivery.id).await.unwrap();
    assert_eq!(delivery.attempts, 1);
    assert!(delivery.error.is_none());

    let err = env.service.retry_delivery(delivery.id).await.unwrap_err();
    assert!(matches!(err, DeliveryError::InvalidState { status: DeliveryStatus::Delivered }));
}

#[tokio::test]
async fn unsafe_target_at_dispatch_fails_without_retry() {
    let env = TestEnv::builder().strict_guard().build().unwrap();
    let sub = SubscriptionBuilder::with_defaults("http://127.0.0.1:9/hook").build();

    // Bypasses the service so only the dispatch-time check can stop it.
    let delivery = env
        .store
        .create_delivery(Delivery::new(sub.id, TEST_EVENT, sample_payload(), env.clock.now_utc()))
        .await
        .unwrap();
    let body = WebhookEnvelope::for_delivery(&delivery, env.clock.now_utc()).to_body().unwrap();
    env.queue
        .enqueue(DeliveryJob::first_attempt(&delivery, &sub, body), Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(env.run_delivery_cycle().await.unwrap(), vec![JobOutcome::Failed]);
    let delivery = env.delivery(delivery.id).await.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert!(delivery.error.unwrap().starts_with("unsafe target"));
}

#[tokio::test]
async fn illegal_api_key_header_fails_without_retry() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.always(MockResponse::Status(200)).await;
    let auth = AuthConfig::ApiKey { header: "X Api Key".to_string(), value: "key_123".to_string() };
    let sub = env
        .add_subscription(SubscriptionBuilder::with_defaults(receiver.url()).auth(auth).build())
        .await;

    let delivery = env.service.enqueue_delivery(sub.id, TEST_EVENT, sample_payload()).await.unwrap();
    assert_eq!(env.run_until_settled(5).await.unwrap(), vec![JobOutcome::Failed]);

    let delivery = env.delivery(delivery.id).await.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempts, 1);
    assert!(delivery.error.unwrap().starts_with("invalid auth configuration"));
    assert_eq!(receiver.request_count().await, 0);
}

#[tokio::test]
async fn duplicate_job_for_finished_delivery_is_skipped() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.always(MockResponse::Status(200)).await;
    let sub = env.subscribe(receiver.url()).await;
    let delivery = env.service.enqueue_delivery(sub.id, TEST_EVENT, sample_payload()).await.unwrap();

    let stale = env.queue.jobs_for(delivery.id).await[0].job.clone();
    env.run_delivery_cycle().await.unwrap();
    env.queue.enqueue(stale, Duration::ZERO).await.unwrap();

    assert_eq!(env.run_delivery_cycle().await.unwrap(), vec![JobOutcome::Skipped]);
    assert_eq!(receiver.request_count().await, 1);
    assert_eq!(env.engine_stats().await.duplicate_jobs_skipped, 1);
}

#[tokio::test]
async fn concurrent_workers_never_share_a_job() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.always(MockResponse::Status(200)).await;
    let sub = env.subscribe(receiver.url()).await;

    for i in 0..20 {
        env.service
            .enqueue_delivery(sub.id, TEST_EVENT, serde_json::json!({ "seq": i }))
            .await
            .unwrap();
    }

    let engine = env.engine();
    let (a, b, c, d) = tokio::join!(
        engine.process_available(),
        engine.process_available(),
        engine.process_available(),
        engine.process_available(),
    );
    let processed = a.unwrap().len() + b.unwrap().len() + c.unwrap().len() + d.unwrap().len();

    assert_eq!(processed, 20);
    assert_eq!(receiver.request_count().await, 20);

    let mut ids: Vec<_> = receiver
        .requests()
        .await
        .iter()
        .filter_map(|r| header(r, "x-webhook-delivery-id").map(str::to_string))
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20);
}

#[tokio::test]
async fn expired_lease_is_reclaimed_after_sweep() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.always(MockResponse::Status(200)).await;
    let sub = env.subscribe(receiver.url()).await;
    let delivery = env.service.enqueue_delivery(sub.id, TEST_EVENT, sample_payload()).await.unwrap();

    // A worker that crashed after claiming.
    let orphaned = env.queue.claim("crashed", Duration::from_secs(60)).await.unwrap();
    assert!(orphaned.is_some());
    assert!(env.run_delivery_cycle().await.unwrap().is_empty());

    env.advance_time(Duration::from_secs(61));
    assert_eq!(env.engine().sweep_stalled().await.unwrap(), 1);
    assert_eq!(env.run_delivery_cycle().await.unwrap(), vec![JobOutcome::Delivered]);
    assert_eq!(env.delivery(delivery.id).await.unwrap().status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn store_failure_after_send_leaves_job_for_redelivery() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.always(MockResponse::Status(200)).await;
    let sub = env.subscribe(receiver.url()).await;
    let delivery = env.service.enqueue_delivery(sub.id, TEST_EVENT, sample_payload()).await.unwrap();

    env.store.inject_update_error_on(DeliveryStatus::Delivered).await;
    assert!(env.run_delivery_cycle().await.is_err());

    let jobs = env.queue.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].leased);
    assert_eq!(env.delivery(delivery.id).await.unwrap().status, DeliveryStatus::Processing);
    assert!(env.run_delivery_cycle().await.unwrap().is_empty());

    env.advance_time(Duration::from_secs(61));
    assert_eq!(env.run_delivery_cycle().await.unwrap(), vec![JobOutcome::Delivered]);
    assert!(env.run_delivery_cycle().await.unwrap().is_empty());

    let delivery = env.delivery(delivery.id).await.unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Delivered);
    assert_eq!(env.queue.depth().await.unwrap(), 0);
    assert_eq!(receiver.request_count().await, 2);
    assert_eq!(
        env.store.status_history(delivery.id).await,
        vec![
            DeliveryStatus::Pending,
            DeliveryStatus::Processing,
            DeliveryStatus::Processing,
            DeliveryStatus::Delivered,
        ]
    );
}

#[tokio::test]
async fn enqueue_failure_during_retry_keeps_original_job() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.times(MockResponse::Status(500), 1).await;
    receiver.always(MockResponse::Status(200)).await;
    let sub = env.subscribe(receiver.url()).await;
    let delivery = env.service.enqueue_delivery(sub.id, TEST_EVENT, sample_payload()).await.unwrap();

    env.queue.inject_enqueue_error("broker unavailable").await;
    assert!(env.run_delivery_cycle().await.is_err());

    let jobs = env.queue.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job.attempt, 1);
    assert!(jobs[0].leased);
    assert_eq!(env.delivery(delivery.id).await.unwrap().status, DeliveryStatus::Retrying);

    env.advance_time(Duration::from_secs(61));
    assert_eq!(env.run_delivery_cycle().await.unwrap(), vec![JobOutcome::Delivered]);

    assert_eq!(env.delivery(delivery.id).await.unwrap().status, DeliveryStatus::Delivered);
    assert_eq!(env.queue.depth().await.unwrap(), 0);
    assert_eq!(receiver.request_count().await, 2);
}

#[tokio::test]
async fn fan_out_reaches_every_active_subscriber() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.always(MockResponse::Status(200)).await;
    env.subscribe(receiver.url()).await;
    env.subscribe(receiver.url()).await;
    env.add_subscription(SubscriptionBuilder::with_defaults(receiver.url()).inactive().build())
        .await;
    env.add_subscription(
        SubscriptionBuilder::with_defaults(receiver.url()).events(["contact.created"]).build(),
    )
    .await;

    let report = env.service.dispatch_event(TEST_EVENT, sample_payload()).await.unwrap();
    assert_eq!(report.enqueued.len(), 2);
    assert!(report.rejected.is_empty());

    env.run_delivery_cycle().await.unwrap();
    assert_eq!(receiver.request_count().await, 2);
}

#[tokio::test]
async fn stats_reflect_outcomes_within_window() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.times(MockResponse::Status(400), 1).await;
    receiver.always(MockResponse::Status(200)).await;
    let sub = env
        .add_subscription(SubscriptionBuilder::with_defaults(receiver.url()).max_retries(0).build())
        .await;

    for _ in 0..4 {
        env.service.enqueue_delivery(sub.id, TEST_EVENT, sample_payload()).await.unwrap();
    }
    env.run_delivery_cycle().await.unwrap();

    let stats = env.service.get_delivery_stats(sub.id, Duration::from_secs(3600)).await.unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.delivered, 3);
    assert_eq!(stats.failed, 1);
    assert!((stats.success_rate - 75.0).abs() < 1e-9);

    env.advance_time(Duration::from_secs(7200));
    let later = env.service.get_delivery_stats(sub.id, Duration::from_secs(3600)).await.unwrap();
    assert_eq!(later.total, 0);
}
