use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use tokmon_core::models::{ChatExchange, RelayEvent};
use tokmon_core::relay::{DropReason, Frame, HubConfig, HubEvent, RelayHub};

fn hub(buffer: usize) -> RelayHub {
    RelayHub::new(HubConfig {
        outbound_buffer: buffer,
        send_timeout: Duration::from_millis(200),
    })
}

fn text(frame: Frame) -> String {
    match frame {
        Frame::Text(text) => text,
        Frame::Binary(_) => panic!("expected a text frame"),
    }
}

#[tokio::test]
async fn publish_sends_typed_json_frames() {
    let hub = hub(8);
    let (_viewer, mut rx) = hub.connect();

    let exchange = ChatExchange::new("conv-1", json!({"q": 1}), json!({"a": 2}));
    let report = hub.publish(&RelayEvent::ChatExchange(exchange.clone())).unwrap();
    assert_eq!(report.delivered, 1);

    let frame: Value = serde_json::from_str(&text(rx.recv().await.unwrap())).unwrap();
    assert_eq!(frame["type"], "chatExchange");
    assert_eq!(frame["data"]["id"], exchange.id.to_string());
    assert_eq!(frame["data"]["request"]["q"], 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_producer_order_survives_concurrency() {
    let hub = Arc::new(hub(1024));
    let (viewer, mut rx) = hub.connect();
    let (a, _rx_a) = hub.connect();
    let (b, _rx_b) = hub.connect();

    let mut producers = Vec::new();
    for producer in [a, b] {
        let hub = hub.clone();
        producers.push(tokio::spawn(async move {
            for seq in 0..200 {
                hub.broadcast(Some(producer), Frame::Text(format!("{}:{}", producer, seq)));
                tokio::task::yield_now().await;
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    let mut last_a = -1i64;
    let mut last_b = -1i64;
    let mut received = 0;
    while let Ok(frame) = rx.try_recv() {
        let body = text(frame);
        let (origin, seq) = body.split_once(':').unwrap();
        let seq: i64 = seq.parse().unwrap();
        let last = if origin == a.to_string() {
            &mut last_a
        } else {
            &mut last_b
        };
        assert!(seq > *last, "out of order from {}", origin);
        *last = seq;
        received += 1;
    }

    assert_eq!(received, 400);
    assert_eq!(hub.state(viewer), tokmon_core::relay::ConnectionState::Open);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn churn_during_broadcast_removes_each_connection_once() {
    let hub = Arc::new(hub(4));
    let mut events = hub.subscribe_events();

    let broadcaster = {
        let hub = hub.clone();
        tokio::spawn(async move {
            for i in 0..500 {
                hub.broadcast(None, Frame::Binary(vec![(i % 256) as u8]));
                tokio::task::yield_now().await;
            }
        })
    };

    let mut ids = Vec::new();
    for _ in 0..50 {
        let (id, rx) = hub.connect();
        ids.push(id);
        drop(rx);
        tokio::task::yield_now().await;
        hub.disconnect(id, DropReason::PeerClosed);
    }
    broadcaster.await.unwrap();

    assert_eq!(hub.connection_count(), 0);

    let mut removals = std::collections::HashMap::new();
    while let Ok(event) = events.try_recv() {
        if let HubEvent::Disconnected { id, .. } = event {
            *removals.entry(id).or_insert(0) += 1;
        }
    }
    for id in ids {
        assert_eq!(removals.get(&id), Some(&1), "{} removed more or less than once", id);
    }
}
