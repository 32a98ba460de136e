//! Publishing errors stay scoped to the failing call.

use resilient_broker::bus::InMemoryBroker;
use resilient_broker::{BrokerError, EventEnvelope, ValidationError};
use serde::ser::{Error as _, Serialize, Serializer};

use crate::support::{connect, eventually, order_event};

struct Unencodable;

impl Serialize for Unencodable {
    fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(S::Error::custom("cannot encode"))
    }
}

#[tokio::test]
async fn encoding_failure_leaves_the_channel_usable() {
    let broker = InMemoryBroker::new();
    let client = connect(&broker).await;

    let err = client.publish("orders", &Unencodable).await.unwrap_err();
    assert!(matches!(err, BrokerError::Serialization(_)));
    assert!(broker.published("orders").is_empty());

    client
        .publish("orders", &serde_json::json!({ "id": 7 }))
        .await
        .unwrap();
    assert_eq!(broker.published("orders").len(), 1);
    assert_eq!(client.generation(), Some(1));
    assert_eq!(broker.dial_count(), 1);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn empty_destination_is_rejected() {
    let broker = InMemoryBroker::new();
    let client = connect(&broker).await;

    let err = client.publish("", &1).await.unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Validation(ValidationError::EmptyDestination)
    ));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_event_is_not_sent() {
    let broker = InMemoryBroker::new();
    let client = connect(&broker).await;

    let event = EventEnvelope::new("order", "orders", "");
    let err = client.publish_event("orders", &event).await.unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Validation(ValidationError::MissingField(_))
    ));
    assert!(!broker.has_destination("orders"));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn publish_while_disconnected_fails_then_recovers() {
    let broker = InMemoryBroker::new();
    let client = connect(&broker).await;

    broker.set_offline(true);
    broker.sever();
    let err = client
        .publish_event("orders", &order_event("orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Transport(_)));

    broker.set_offline(false);
    client.wait_connected().await.unwrap();
    client
        .publish_event("orders", &order_event("orders"))
        .await
        .unwrap();
    assert_eq!(broker.published("orders").len(), 1);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn batch_publishes_in_order() {
    let broker = InMemoryBroker::new();
    let client = connect(&broker).await;

    client
        .publisher()
        .publish_batch("numbers", &[1, 2, 3])
        .await
        .unwrap();
    let bodies: Vec<Vec<u8>> = broker
        .published("numbers")
        .into_iter()
        .map(|d| d.body)
        .collect();
    assert_eq!(bodies, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn publish_after_shutdown_is_refused() {
    let broker = InMemoryBroker::new();
    let client = connect(&broker).await;
    let publisher = client.publisher();

    client.shutdown().await.unwrap();
    let err = publisher.publish("orders", &1).await.unwrap_err();
    assert!(matches!(err, BrokerError::Shutdown));
    eventually("channels closed", || broker.open_channels() == 0).await;
}
