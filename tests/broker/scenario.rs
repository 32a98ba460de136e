//! Routing: each binding only sees its own destination.

use std::time::Duration;

use resilient_broker::bus::InMemoryBroker;

use crate::support::{connect, eventually, order_event, Recorder};

#[tokio::test]
async fn created_event_reaches_only_the_created_binding() {
    let broker = InMemoryBroker::new();
    let client = connect(&broker).await;

    let created = Recorder::new();
    let updated = Recorder::new();
    client.register(created.binding("orders.created")).unwrap();
    client.register(updated.binding("orders.updated")).unwrap();

    let event = order_event("orders.created");
    client.publish_event("orders.created", &event).await.unwrap();

    eventually("created callback", || created.len() == 1).await;
    let received = &created.events()[0];
    assert_eq!(received.event_type, "order");
    assert_eq!(received.resource, "orders.created");
    assert_eq!(received.created_by, "svc-a");
    assert_eq!(received, &event);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(updated.len(), 0);
    assert_eq!(client.stats("orders.updated").unwrap().received, 0);
    assert_eq!(client.stats("orders.created").unwrap().handled, 1);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn published_bodies_are_json_envelopes() {
    let broker = InMemoryBroker::new();
    let client = connect(&broker).await;

    let event = order_event("orders.created");
    client.publish_event("orders.created", &event).await.unwrap();

    let published = broker.published("orders.created");
    assert_eq!(published.len(), 1);
    assert_eq!(
        published[0].content_type.as_deref(),
        Some(resilient_broker::CONTENT_TYPE_JSON)
    );
    let decoded = resilient_broker::EventEnvelope::decode(&published[0].body).unwrap();
    assert_eq!(decoded, event);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn malformed_message_is_dropped_and_stream_continues() {
    let broker = InMemoryBroker::new();
    let client = connect(&broker).await;
    let recorder = Recorder::new();
    client.register(recorder.binding("orders")).unwrap();

    broker.publish_raw("orders", b"{\"type\": ".to_vec());
    client
        .publish_event("orders", &order_event("orders"))
        .await
        .unwrap();

    eventually("valid message handled", || recorder.len() == 1).await;
    let stats = client.stats("orders").unwrap();
    assert_eq!(stats.decode_failed, 1);
    assert_eq!(stats.handled, 1);

    client
        .publish_event("orders", &order_event("orders"))
        .await
        .unwrap();
    eventually("stream keeps reading", || recorder.len() == 2).await;

    client.shutdown().await.unwrap();
}
