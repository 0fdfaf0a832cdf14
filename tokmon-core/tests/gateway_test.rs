use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;

use tokmon_core::http::{self, GatewayState};
use tokmon_core::relay::{Frame, RelayHub};
use tokmon_core::repo::MemoryStore;
use tokmon_core::services::AggregationService;

struct TestServer {
    addr: SocketAddr,
    hub: RelayHub,
    shutdown: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        let service = Arc::new(AggregationService::with_store(Arc::new(MemoryStore::new())));
        let hub = RelayHub::default();
        let state = GatewayState::new(service, hub.clone());

        let listener = http::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            http::serve(listener, state, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
        });

        Self {
            addr,
            hub,
            shutdown: Some(tx),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.await.unwrap();
    }
}

#[tokio::test]
async fn exchange_roundtrip_relays_both_events() {
    let server = TestServer::start().await;
    let (_viewer, mut frames) = server.hub.connect();
    let client = reqwest::Client::new();

    let response = client
        .post(server.url("/api/exchange"))
        .json(&json!({
            "tokmon_conversation_id": "conv-e2e",
            "request": {"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]},
            "response": {"model": "gpt-4", "usage": {"prompt_tokens": 1000, "completion_tokens": 1000}}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let exchange: Value = response.json().await.unwrap();
    assert_eq!(exchange["conversation_id"], "conv-e2e");

    let Frame::Text(first) = frames.recv().await.unwrap() else {
        panic!("expected text frame");
    };
    let Frame::Text(second) = frames.recv().await.unwrap() else {
        panic!("expected text frame");
    };
    let first: Value = serde_json::from_str(&first).unwrap();
    let second: Value = serde_json::from_str(&second).unwrap();
    assert_eq!(first["type"], "chatExchange");
    assert_eq!(first["data"]["id"], exchange["id"]);
    assert_eq!(second["type"], "tokenUsageSummary");
    assert_eq!(second["data"]["total_usage"]["total_tokens"], 2000);

    let listed: Vec<Value> = client
        .get(server.url("/api/exchange?conversation_id=conv-e2e"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_relay_summaries_in_commit_order() {
    let server = TestServer::start().await;
    let (_viewer, mut frames) = server.hub.connect();
    let client = reqwest::Client::new();

    let mut posts = Vec::new();
    for _ in 0..20 {
        let client = client.clone();
        let url = server.url("/api/exchange");
        posts.push(tokio::spawn(async move {
            client
                .post(url)
                .json(&json!({
                    "conversation_id": "conv-order",
                    "request": {},
                    "response": {"model": "gpt-4", "usage": {"prompt_tokens": 10, "completion_tokens": 5}}
                }))
                .send()
                .await
                .unwrap()
                .status()
        }));
    }
    for post in posts {
        assert_eq!(post.await.unwrap(), 200);
    }

    let mut totals = Vec::new();
    while let Ok(Frame::Text(text)) = frames.try_recv() {
        let frame: Value = serde_json::from_str(&text).unwrap();
        if frame["type"] == "tokenUsageSummary" {
            totals.push(frame["data"]["total_usage"]["total_tokens"].as_u64().unwrap());
        }
    }

    assert_eq!(totals.len(), 20);
    assert!(totals.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", totals);
    assert_eq!(totals.last(), Some(&300));

    server.stop().await;
}

#[tokio::test]
async fn missing_conversation_id_is_bad_request() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let response = client
        .post(server.url("/api/exchange"))
        .json(&json!({"request": {}, "response": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], true);
    assert_eq!(body["code"], "E3001");

    server.stop().await;
}

#[tokio::test]
async fn summary_upsert_query_and_delete() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let saved: Value = client
        .post(server.url("/api/summary"))
        .json(&json!({
            "summary": {
                "tokmon_conversation_id": "conv-s",
                "monitored_program": "demo",
                "total_cost": 0.005,
                "total_usage": {"prompt_tokens": 30, "completion_tokens": 12, "total_tokens": 42},
                "models": ["gpt-4", "gpt-3.5-turbo"]
            }
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(saved["total_cost"], 0.005);
    assert_eq!(saved["monitored_program"], "demo");

    client
        .post(server.url("/api/exchange"))
        .json(&json!({"conversation_id": "conv-s", "request": "q", "response": "a"}))
        .send()
        .await
        .unwrap();

    let view: Value = client
        .get(server.url("/api/summary?tokmon_conversation_id=conv-s"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["conversation_id"], "conv-s");
    assert_eq!(view["chat_exchanges"].as_array().unwrap().len(), 1);

    let all: Vec<Value> = client
        .get(server.url("/api/summary"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all.len(), 1);

    let deleted: Value = client
        .delete(server.url("/api/delete/conv-s"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deleted["exchanges"], 1);
    assert_eq!(deleted["summaries"], 1);

    let missing = client
        .get(server.url("/api/summary?conversation_id=conv-s"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    server.stop().await;
}

#[tokio::test]
async fn health_reports_observers() {
    let server = TestServer::start().await;
    let (_viewer, _frames) = server.hub.connect();

    let health: Value = reqwest::get(server.url("/api/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["observers"], 1);

    server.stop().await;
}
