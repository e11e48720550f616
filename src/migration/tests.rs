use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::TimeZone;

use super::*;
use crate::broker::{BrokerAdmin, FieldValue, InMemoryBroker, MessageProperties, QueueSpec};
use crate::delay::DelayRequest;
use crate::gate::{DelayEntryGate, OutgoingMessage};
use crate::topology::{QueueKind, TopologyBuilder};

const ADDRESS: &str = "some-address";

fn sent_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn old_generation() -> TopologyGeneration {
    TopologyGeneration::new("", QueueKind::Classic { lazy: false })
}

fn new_generation() -> TopologyGeneration {
    TopologyGeneration::new("v2-", QueueKind::Quorum)
}

async fn broker_with(generations: &[&TopologyGeneration]) -> Arc<InMemoryBroker> {
    let broker = Arc::new(InMemoryBroker::new());
    for generation in generations {
        TopologyBuilder::new(broker.as_ref(), generation)
            .build()
            .await
            .unwrap();
    }
    broker
}

async fn send(broker: &Arc<InMemoryBroker>, delay_seconds: u64, address: &str) {
    DelayEntryGate::new(old_generation(), broker.clone())
        .send(
            OutgoingMessage {
                destination: address.to_string(),
                delay: DelayRequest::After(Duration::from_secs(delay_seconds)),
                properties: MessageProperties::default(),
                body: Bytes::from_static(b"payload"),
            },
            sent_at(),
        )
        .await
        .unwrap();
}

fn raw_message(routing_key: &str, properties: MessageProperties) -> Message {
    Message {
        routing_key: routing_key.to_string(),
        properties,
        body: Bytes::from_static(b"payload"),
    }
}

// ============================================================================
// replan
// ============================================================================

#[test]
fn test_replan_nothing_elapsed() {
    let (key, _) = encode(10, ADDRESS);
    let plan = replan(10, sent_at(), &key, sent_at()).unwrap();

    assert_eq!(plan.remaining_seconds, 10);
    assert_eq!(plan.routing_key, encode(10, ADDRESS).0);
    assert_eq!(plan.starting_level, 3);
    assert_eq!(plan.destination, ADDRESS);
}

#[test]
fn test_replan_fully_elapsed() {
    let (key, _) = encode(10, ADDRESS);
    let now = sent_at() + chrono::Duration::seconds(10);
    let plan = replan(10, sent_at(), &key, now).unwrap();

    assert_eq!(plan.remaining_seconds, 0);
    assert_eq!(plan.starting_level, 0);
    assert_eq!(plan.routing_key, encode(0, ADDRESS).0);
}

#[test]
fn test_replan_overdue_is_zero() {
    let (key, _) = encode(10, ADDRESS);
    let now = sent_at() + chrono::Duration::hours(1);
    assert_eq!(replan(10, sent_at(), &key, now).unwrap().remaining_seconds, 0);
}

#[test]
fn test_replan_partial_second_not_counted() {
    let (key, _) = encode(10, ADDRESS);
    let now = sent_at() + chrono::Duration::milliseconds(3_900);
    assert_eq!(replan(10, sent_at(), &key, now).unwrap().remaining_seconds, 7);
}

#[test]
fn test_replan_clock_skew_clamped() {
    let (key, _) = encode(10, ADDRESS);
    let now = sent_at() - chrono::Duration::seconds(30);
    let plan = replan(10, sent_at(), &key, now).unwrap();
    assert_eq!(plan.remaining_seconds, 10);
    assert_eq!(plan.routing_key, key);
}

#[test]
fn test_replan_keeps_dotted_address() {
    let (key, _) = encode(100, "billing.eu.input");
    let now = sent_at() + chrono::Duration::seconds(36);
    let plan = replan(100, sent_at(), &key, now).unwrap();
    assert_eq!(plan.destination, "billing.eu.input");
    assert_eq!(plan.routing_key, encode(64, "billing.eu.input").0);
    assert_eq!(plan.starting_level, 6);
}

#[test]
fn test_replan_surfaces_corrupt_key() {
    let err = replan(10, sent_at(), "not-a-cascade-key", sent_at()).unwrap_err();
    assert!(matches!(err, MigrationError::Decode(_)));
    assert!(err.to_string().contains("not-a-cascade-key"));
}

// ============================================================================
// OriginalSchedule
// ============================================================================

#[test]
fn test_schedule_from_headers() {
    let mut properties = MessageProperties::default();
    properties
        .headers
        .insert(DELAY_HEADER.to_string(), FieldValue::Int(42));
    properties.headers.insert(
        TIME_SENT_HEADER.to_string(),
        FieldValue::Text(sent_at().to_rfc3339()),
    );
    let message = raw_message(&encode(42, ADDRESS).0, properties);

    let schedule = OriginalSchedule::from_message(&message).unwrap();
    assert_eq!(schedule.delay_seconds, 42);
    assert_eq!(schedule.sent_at, sent_at());
}

#[test]
fn test_schedule_falls_back_to_key_and_timestamp() {
    let properties = MessageProperties {
        timestamp: Some(sent_at().timestamp() as u64),
        ..Default::default()
    };
    let message = raw_message(&encode(300, ADDRESS).0, properties);

    let schedule = OriginalSchedule::from_message(&message).unwrap();
    assert_eq!(schedule.delay_seconds, 300);
    assert_eq!(schedule.sent_at, sent_at());
}

#[test]
fn test_schedule_without_send_time_fails() {
    let message = raw_message(&encode(5, ADDRESS).0, MessageProperties::default());
    let err = OriginalSchedule::from_message(&message).unwrap_err();
    assert!(matches!(err, MigrationError::MissingHeader { .. }));
}

#[test]
fn test_schedule_rejects_bad_time_header() {
    let mut properties = MessageProperties::default();
    properties
        .headers
        .insert(TIME_SENT_HEADER.to_string(), "yesterday".into());
    let message = raw_message(&encode(5, ADDRESS).0, properties);

    let err = OriginalSchedule::from_message(&message).unwrap_err();
    assert_eq!(
        err,
        MigrationError::InvalidHeader {
            header: TIME_SENT_HEADER.to_string(),
            value: "yesterday".to_string(),
        }
    );
}

// ============================================================================
// State machine
// ============================================================================

#[tokio::test]
async fn test_state_machine_walks_every_state() {
    let old = old_generation();
    let new = new_generation();
    let broker = broker_with(&[&old, &new]).await;
    send(&broker, 10, ADDRESS).await;

    let fetched = broker.fetch("delay-level-03").await.unwrap().unwrap();
    let ctx = MigrationContext {
        source: broker.as_ref(),
        dispatcher: broker.as_ref(),
        target: &new,
        now: sent_at() + chrono::Duration::seconds(4),
    };

    let mut state = MigrationState::new(fetched);
    let mut seen = vec![state.name()];
    while !state.is_complete() {
        state.advance(&ctx).await.unwrap();
        seen.push(state.name());
    }

    assert_eq!(
        seen,
        vec![
            "NotStarted",
            "Decoded",
            "Replanned",
            "Republished",
            "OriginalRemoved"
        ]
    );
    assert_eq!(broker.unacked_count().await, 0);
    // 6 seconds left: parked at level 2 of the new generation.
    let parked = broker.queued_messages("v2-delay-level-02").await;
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].routing_key, encode(6, ADDRESS).0);

    let err = state.advance(&ctx).await.unwrap_err();
    assert_eq!(
        err,
        MigrationError::InvalidTransition {
            state: "OriginalRemoved"
        }
    );
}

#[tokio::test]
async fn test_failed_acknowledge_keeps_republished_state() {
    let new = new_generation();
    let broker = broker_with(&[&new]).await;
    let ctx = MigrationContext {
        source: broker.as_ref(),
        dispatcher: broker.as_ref(),
        target: &new,
        now: sent_at(),
    };
    let plan = replan(1, sent_at(), &encode(1, ADDRESS).0, sent_at()).unwrap();

    let mut state = MigrationState::Republished {
        delivery_tag: 999,
        plan,
    };
    let err = state.advance(&ctx).await.unwrap_err();

    assert!(matches!(err, MigrationError::Broker(BrokerError::Settle { tag: 999, .. })));
    assert_eq!(state.name(), "Republished");
    assert!(state.is_republished());
}

// ============================================================================
// Migrator
// ============================================================================

#[tokio::test]
async fn test_migrator_moves_every_parked_message() {
    let old = old_generation();
    let new = new_generation();
    let broker = broker_with(&[&old, &new]).await;
    for (delay, address) in [(10, "orders"), (3_600, "billing"), (1 << 20, "audit")] {
        send(&broker, delay, address).await;
    }

    let now = sent_at() + chrono::Duration::seconds(8);
    let report = Migrator::new(broker.as_ref(), broker.as_ref(), &old, &new)
        .run(now)
        .await
        .unwrap();

    assert_eq!(report.migrated, 3);
    assert!(report.is_clean());
    for level in 0..=MAX_LEVEL {
        assert_eq!(broker.queue_depth(&old.level_name(level)).await, 0);
    }

    let orders = broker.queued_messages("v2-delay-level-01").await;
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].routing_key, encode(2, "orders").0);

    let billing = broker.queued_messages("v2-delay-level-11").await;
    assert_eq!(billing.len(), 1);
    assert_eq!(billing[0].routing_key, encode(3_592, "billing").0);
    assert_eq!(billing[0].body, Bytes::from_static(b"payload"));

    let audit = broker.queued_messages("v2-delay-level-19").await;
    assert_eq!(audit[0].routing_key, encode((1 << 20) - 8, "audit").0);
}

#[tokio::test]
async fn test_migrator_reports_and_keeps_corrupt_message() {
    let old = old_generation();
    let new = new_generation();
    let broker = broker_with(&[&old, &new]).await;
    send(&broker, 20, ADDRESS).await;

    let mut properties = MessageProperties::default();
    properties
        .headers
        .insert(DELAY_HEADER.to_string(), FieldValue::Int(20));
    properties
        .headers
        .insert(TIME_SENT_HEADER.to_string(), sent_at().to_rfc3339().into());
    broker
        .enqueue("delay-level-04", raw_message("foreign.key", properties))
        .await
        .unwrap();

    let report = Migrator::new(broker.as_ref(), broker.as_ref(), &old, &new)
        .run(sent_at())
        .await
        .unwrap();

    assert_eq!(report.migrated, 1);
    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert_eq!(failure.queue, "delay-level-04");
    assert_eq!(failure.routing_key, "foreign.key");
    assert_eq!(failure.state, "Decoded");
    assert!(matches!(failure.error, MigrationError::Decode(_)));

    // Left where it was, not acknowledged away.
    let left = broker.queued_messages("delay-level-04").await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].routing_key, "foreign.key");
    assert_eq!(broker.unacked_count().await, 0);
}

#[tokio::test]
async fn test_overdue_message_without_destination_stays_put() {
    let old = old_generation();
    let new = new_generation();
    // Target built, but nothing bound to its delivery exchange.
    let broker = broker_with(&[&old, &new]).await;
    send(&broker, 10, "orders").await;

    let report = Migrator::new(broker.as_ref(), broker.as_ref(), &old, &new)
        .run(sent_at() + chrono::Duration::seconds(60))
        .await
        .unwrap();

    assert_eq!(report.migrated, 0);
    assert!(!report.is_clean());
    let failure = &report.failures[0];
    assert_eq!(failure.queue, "delay-level-03");
    assert_eq!(failure.state, "Replanned");
    assert!(matches!(
        failure.error,
        MigrationError::Broker(BrokerError::Unroutable { ref exchange, .. })
            if exchange == "v2-delay-level-00"
    ));

    let left = broker.queued_messages("delay-level-03").await;
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].routing_key, encode(10, "orders").0);
    assert_eq!(broker.unacked_count().await, 0);
}

#[tokio::test]
async fn test_overdue_message_delivered_once_destination_bound() {
    let old = old_generation();
    let new = new_generation();
    let broker = broker_with(&[&old, &new]).await;
    broker
        .declare_queue(&QueueSpec {
            name: "orders-input".to_string(),
            arguments: Default::default(),
        })
        .await
        .unwrap();
    TopologyBuilder::new(broker.as_ref(), &new)
        .bind_destination("orders-input", "orders")
        .await
        .unwrap();
    send(&broker, 10, "orders").await;

    let report = Migrator::new(broker.as_ref(), broker.as_ref(), &old, &new)
        .run(sent_at() + chrono::Duration::seconds(60))
        .await
        .unwrap();

    assert_eq!(report.migrated, 1);
    assert!(report.is_clean());
    assert_eq!(broker.queue_depth("delay-level-03").await, 0);
    assert_eq!(broker.queue_depth("orders-input").await, 1);
}

#[tokio::test]
async fn test_broker_failure_aborts_and_requeues_everything() {
    let old = old_generation();
    let new = new_generation();
    // New generation never built: republishing closes the channel.
    let broker = broker_with(&[&old]).await;
    let mut properties = MessageProperties::default();
    properties
        .headers
        .insert(TIME_SENT_HEADER.to_string(), sent_at().to_rfc3339().into());
    broker
        .enqueue("delay-level-03", raw_message("foreign.key", properties))
        .await
        .unwrap();
    send(&broker, 10, ADDRESS).await;
    send(&broker, 12, ADDRESS).await;

    let err = Migrator::new(broker.as_ref(), broker.as_ref(), &old, &new)
        .run(sent_at())
        .await
        .unwrap_err();

    assert!(matches!(err, MigrationError::Broker(BrokerError::Publish { .. })));
    assert!(err.aborts_run());
    assert_eq!(broker.queue_depth("delay-level-03").await, 3);
    assert_eq!(broker.unacked_count().await, 0);
    let keys: Vec<String> = broker
        .queued_messages("delay-level-03")
        .await
        .into_iter()
        .map(|m| m.routing_key)
        .collect();
    assert_eq!(keys[0], "foreign.key");
}

#[test]
fn test_only_broker_failures_abort() {
    let unroutable = MigrationError::Broker(BrokerError::Unroutable {
        exchange: "v2-delay-level-00".to_string(),
        routing_key: encode(0, ADDRESS).0,
    });
    let refused = MigrationError::Broker(BrokerError::Publish {
        exchange: "v2-delay-level-00".to_string(),
        message: "NOT_FOUND".to_string(),
    });
    let corrupt = replan(10, sent_at(), "foreign.key", sent_at()).unwrap_err();

    assert!(!unroutable.aborts_run());
    assert!(refused.aborts_run());
    assert!(!corrupt.aborts_run());
}

#[tokio::test]
async fn test_migrator_fetch_failure_aborts() {
    let old = old_generation();
    let new = new_generation();
    let broker = broker_with(&[&old, &new]).await;
    broker.fail_on("delay-level-27").await;

    let err = Migrator::new(broker.as_ref(), broker.as_ref(), &old, &new)
        .run(sent_at())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Broker(BrokerError::Fetch { .. })));
}

#[tokio::test]
async fn test_migrated_message_released_at_original_instant() {
    let old = old_generation();
    let new = new_generation();
    let broker = broker_with(&[&old, &new]).await;
    send(&broker, 100, ADDRESS).await;

    let elapsed = 37;
    Migrator::new(broker.as_ref(), broker.as_ref(), &old, &new)
        .run(sent_at() + chrono::Duration::seconds(elapsed))
        .await
        .unwrap();

    let mut waited_ms = 0;
    for level in (0..=MAX_LEVEL).rev() {
        let queue = new.level_name(level);
        if broker.queue_depth(&queue).await > 0 {
            waited_ms += broker.message_ttl(&queue).await.unwrap();
            broker.expire_queue(&queue).await.unwrap();
        }
    }
    assert_eq!(elapsed + waited_ms / 1000, 100);
}

#[tokio::test]
async fn test_migrator_refuses_same_prefix() {
    let old = old_generation();
    let same_names = TopologyGeneration::new("", QueueKind::Quorum);
    let broker = broker_with(&[&old]).await;
    send(&broker, 10, ADDRESS).await;

    let err = Migrator::new(broker.as_ref(), broker.as_ref(), &old, &same_names)
        .run(sent_at())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        MigrationError::SameGeneration {
            prefix: String::new()
        }
    );
    assert_eq!(broker.queue_depth("delay-level-03").await, 1);
}
