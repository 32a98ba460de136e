//! Recovery after the broker drops the connection.

use std::time::Duration;

use resilient_broker::bus::InMemoryBroker;
use resilient_broker::ConnectionState;

use crate::support::{connect, eventually, order_event, Recorder};

#[tokio::test]
async fn bindings_resume_after_each_disconnect() {
    let broker = InMemoryBroker::new();
    let client = connect(&broker).await;
    let recorder = Recorder::new();
    client.register(recorder.binding("orders")).unwrap();
    eventually("first consumer", || broker.consumer_count("orders") == 1).await;
    assert_eq!(client.generation(), Some(1));

    for (round, generation) in [(1usize, 2u64), (2, 3)] {
        broker.sever();
        eventually("new session", || client.generation() == Some(generation)).await;
        client
            .publish_event("orders", &order_event("orders"))
            .await
            .unwrap();
        eventually("delivery after reconnect", || recorder.len() == round).await;
    }

    // Exactly one stream per binding, never a stale one next to a fresh one.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.consumer_count("orders"), 1);
    assert_eq!(broker.open_channels(), 1);
    assert_eq!(client.stats("orders").unwrap().streams_opened, 3);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn messages_published_during_outage_are_delivered_after_recovery() {
    let broker = InMemoryBroker::new();
    let client = connect(&broker).await;
    let recorder = Recorder::new();
    client.register(recorder.binding("orders")).unwrap();
    eventually("consumer", || broker.consumer_count("orders") == 1).await;

    broker.set_offline(true);
    broker.sever();
    // Another producer keeps writing while this client is away.
    broker.publish_raw("orders", order_event("orders").encode().unwrap());
    assert_eq!(broker.pending("orders"), 1);

    broker.set_offline(false);
    eventually("backlog delivered", || recorder.len() == 1).await;
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn keeps_redialing_until_the_broker_returns() {
    let broker = InMemoryBroker::new();
    let client = connect(&broker).await;
    let mut states = client.subscribe_state();

    broker.set_offline(true);
    broker.sever();

    states
        .wait_for(|s| matches!(s, ConnectionState::Reconnecting { attempt } if *attempt >= 2))
        .await
        .unwrap();
    assert!(broker.dial_count() >= 3);

    broker.set_offline(false);
    let generation = client.wait_connected().await.unwrap();
    assert_eq!(generation, 2);
    assert_eq!(
        client.state(),
        ConnectionState::Connected { generation: 2 }
    );

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn refused_dials_are_retried() {
    let broker = InMemoryBroker::new();
    let client = connect(&broker).await;

    broker.refuse_dials(3);
    broker.sever();

    eventually("reconnected", || client.generation() == Some(2)).await;
    // One initial dial, three refusals, one success.
    assert_eq!(broker.dial_count(), 5);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn binding_registered_during_outage_starts_on_reconnect() {
    let broker = InMemoryBroker::new();
    let client = connect(&broker).await;
    let early = Recorder::new();
    client.register(early.binding("early")).unwrap();
    eventually("early consumer", || broker.consumer_count("early") == 1).await;

    broker.set_offline(true);
    broker.sever();
    eventually("reconnecting", || {
        matches!(client.state(), ConnectionState::Reconnecting { .. })
    })
    .await;

    let late = Recorder::new();
    client.register(late.binding("late")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.consumer_count("late"), 0);

    broker.set_offline(false);
    client.wait_connected().await.unwrap();
    eventually("both consumers", || {
        broker.consumer_count("early") == 1 && broker.consumer_count("late") == 1
    })
    .await;

    client.publish_event("late", &order_event("late")).await.unwrap();
    eventually("late binding delivers", || late.len() == 1).await;
    assert_eq!(client.stats("late").unwrap().streams_opened, 1);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn state_turns_reconnecting_as_soon_as_the_channel_closes() {
    let broker = InMemoryBroker::new();
    let client = connect(&broker).await;
    assert_eq!(client.state(), ConnectionState::Connected { generation: 1 });

    broker.set_offline(true);
    broker.sever();
    assert!(matches!(
        client.state(),
        ConnectionState::Reconnecting { .. }
    ));

    broker.set_offline(false);
    client.wait_connected().await.unwrap();
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn wait_connected_does_not_return_the_dead_session() {
    let broker = InMemoryBroker::new();
    let client = connect(&broker).await;

    broker.sever();
    let generation = client.wait_connected().await.unwrap();
    assert_eq!(generation, 2);
    client.publish("orders", &1).await.unwrap();
    assert_eq!(broker.published("orders").len(), 1);

    client.shutdown().await.unwrap();
}
