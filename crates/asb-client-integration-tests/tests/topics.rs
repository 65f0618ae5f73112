//! Integration tests for topics and subscriptions
//!
//! These tests verify:
//! - Sends to a topic fan out to every subscription
//! - Receives need a subscription, from the identity or the call
//! - A missing subscription fails before any request is made

mod common;

use asb_client::{ConfigurationError, OutboundMessage, ServiceBusError};
use chrono::Duration;
use common::{topic_client, verifying_bus};

#[tokio::test]
async fn test_identity_subscription_receives() -> anyhow::Result<()> {
    let bus = verifying_bus();
    bus.create_subscription("events", "audit");
    let client = topic_client(&bus, Some("audit"));

    client.send("events", &OutboundMessage::new("created")).await?;

    let message = client
        .peek_lock_message("events", Duration::seconds(5))
        .await?
        .expect("message on audit");
    assert!(message
        .location()
        .unwrap()
        .contains("/events/subscriptions/audit/messages/"));

    client.delete_message(&message).await?;
    assert_eq!(bus.message_count("events/subscriptions/audit"), 0);
    Ok(())
}

#[tokio::test]
async fn test_subscription_handles_settle_independently() -> anyhow::Result<()> {
    let bus = verifying_bus();
    bus.create_subscription("events", "audit");
    bus.create_subscription("events", "billing");
    let client = topic_client(&bus, None);

    client.send("events", &OutboundMessage::new("created")).await?;

    let audit = client.subscription("events", "audit");
    let billing = client.subscription("events", "billing");

    let from_audit = audit.peek_lock(Duration::seconds(5)).await?.expect("audit copy");
    let from_billing = billing
        .peek_lock(Duration::seconds(5))
        .await?
        .expect("billing copy");

    audit.delete_message(&from_audit).await?;
    billing.unlock_message(&from_billing).await?;

    assert_eq!(bus.message_count("events/subscriptions/audit"), 0);
    assert_eq!(bus.message_count("events/subscriptions/billing"), 1);

    let again = billing
        .receive_and_delete(Duration::seconds(5))
        .await?
        .expect("billing copy again");
    assert_eq!(again.body, from_billing.body);
    assert_eq!(bus.message_count("events/subscriptions/billing"), 0);
    Ok(())
}

/// Verify a topic receive without a subscription makes no request at all.
#[tokio::test]
async fn test_missing_subscription_is_local_error() {
    let bus = verifying_bus();
    bus.create_subscription("events", "audit");
    let client = topic_client(&bus, None);

    let err = client
        .peek_lock_message("events", Duration::seconds(5))
        .await
        .expect_err("subscription required");

    assert!(matches!(
        err,
        ServiceBusError::Configuration(ConfigurationError::SubscriptionRequired)
    ));
    assert_eq!(bus.request_count(), 0);
}
