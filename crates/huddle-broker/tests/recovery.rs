//! Broker outage and recovery through the in-process backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use huddle_broker::{Broker, BrokerTransport, LocalBroker, LocalBus, MessageHandler};
use tokio::sync::mpsc;

struct Collect(mpsc::UnboundedSender<String>);

#[async_trait]
impl MessageHandler for Collect {
    async fn handle(&self, _topic: &str, payload: Bytes) {
        let _ = self.0.send(String::from_utf8_lossy(&payload).into_owned());
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_resume_after_outage() {
    let bus = LocalBus::new();
    let broker = LocalBroker::new(Arc::clone(&bus));
    broker.start().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = broker
        .subscribe("voice", Arc::new(Collect(tx)))
        .await
        .unwrap();

    broker.publish("voice", Bytes::from_static(b"before")).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), "before");

    bus.sever();
    wait_until(|| !broker.is_connected()).await;

    let err = broker
        .publish("voice", Bytes::from_static(b"lost"))
        .await
        .unwrap_err();
    assert!(err.is_unavailable());

    // Still down: recovery keeps retrying without declaring success.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!broker.is_connected());
    assert_eq!(broker.restarts(), 0);

    bus.restore();
    wait_until(|| broker.is_connected()).await;
    assert_eq!(broker.restarts(), 1);

    // The caller never re-subscribed.
    broker.publish("voice", Bytes::from_static(b"after")).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), "after");
    assert_eq!(broker.subscription_count().await, 1);
}

#[tokio::test]
async fn test_closed_subscription_stops_delivery() {
    let bus = LocalBus::new();
    let transport = BrokerTransport::local_only()
        .with_prefix("huddle")
        .with_broker(Arc::new(LocalBroker::new(Arc::clone(&bus))));
    transport.start().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = transport
        .subscribe("typing", Arc::new(Collect(tx)), None)
        .await
        .unwrap();
    assert_eq!(subscription.topic(), "huddle:typing");

    transport
        .publish("typing", Bytes::from_static(b"one"), None)
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap(), "one");

    subscription.close().await;
    assert!(subscription.is_closed());

    transport
        .publish("typing", Bytes::from_static(b"two"), None)
        .await
        .unwrap();
    // Reader is gone, so the sender side was dropped with it.
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_two_brokers_share_a_bus() {
    let bus = LocalBus::new();
    let node_a = LocalBroker::new(Arc::clone(&bus));
    let node_b = LocalBroker::new(Arc::clone(&bus));
    node_a.start().await.unwrap();
    node_b.start().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = node_b
        .subscribe("presence", Arc::new(Collect(tx)))
        .await
        .unwrap();

    node_a
        .publish("presence", Bytes::from_static(b"from-a"))
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap(), "from-a");
}
