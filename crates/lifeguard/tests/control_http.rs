//! HTTP control plane against a live supervisor

mod common;

use common::{sh, supervisor};
use futures::StreamExt;
use lifeguard::control::{http, ControlPlane};
use lifeguard::Supervisor;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

struct TestServer {
    base: String,
    supervisor: Arc<Supervisor>,
    client: reqwest::Client,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        let supervisor = supervisor(vec![
            sh("web", "echo listening; exec sleep 30"),
            sh("worker", "exec sleep 30"),
        ]);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let control = ControlPlane::new(supervisor.clone());
        let task = tokio::spawn(async move {
            http::serve(listener, control).await.unwrap();
        });

        Self {
            base,
            supervisor,
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
            task,
        }
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let response = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn post(&self, path: &str) -> (u16, Value) {
        let response = self
            .client
            .post(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap_or(Value::Null))
    }

    async fn stop(self) {
        self.supervisor.shutdown().await;
        self.task.abort();
    }
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::start().await;
    let body = server
        .client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");
    server.stop().await;
}

#[tokio::test]
async fn test_lifecycle_over_http() {
    let server = TestServer::start().await;

    let (status, list) = server.get("/services").await;
    assert_eq!(status, 200);
    let names: Vec<&str> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["web", "worker"]);
    assert_eq!(list[0]["status"], "stopped");
    assert!(list[0].get("pid").is_none());

    let (status, body) = server.post("/services/web/start").await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert!(body.get("error").is_none());

    let (status, web) = server.get("/services/web").await;
    assert_eq!(status, 200);
    assert_eq!(web["name"], "web");
    assert_eq!(web["status"], "running");
    assert!(web["pid"].as_u64().is_some());
    assert!(web["uptimeMs"].as_u64().is_some());

    let pid = web["pid"].as_u64();
    let (_, body) = server.post("/services/web/restart").await;
    assert_eq!(body["success"], true);
    let (_, web) = server.get("/services/web").await;
    assert_ne!(web["pid"].as_u64(), pid);

    let (_, body) = server.post("/services/web/stop").await;
    assert_eq!(body["success"], true);
    let (_, web) = server.get("/services/web").await;
    assert_eq!(web["status"], "stopped");
    assert_eq!(web["lastExitCode"], Value::Null);

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_service_is_404() {
    let server = TestServer::start().await;

    let (status, _) = server.get("/services/nope").await;
    assert_eq!(status, 404);

    let (status, body) = server.post("/services/nope/start").await;
    assert_eq!(status, 404);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("nope"));

    let (status, body) = server.get("/services/nope/logs").await;
    assert_eq!(status, 404);
    assert_eq!(body["success"], false);

    server.stop().await;
}

#[tokio::test]
async fn test_logs_endpoint() {
    let server = TestServer::start().await;
    server.post("/services/web/start").await;

    let mut lines = Value::Null;
    for _ in 0..100 {
        let (_, body) = server.get("/services/web/logs?lines=5").await;
        if !body["lines"].as_array().unwrap().is_empty() {
            lines = body;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(lines["name"], "web");
    assert_eq!(lines["success"], true);
    assert_eq!(lines["lines"][0]["line"], "listening");
    assert_eq!(lines["lines"][0]["stream"], "stdout");

    server.stop().await;
}

#[tokio::test]
async fn test_events_stream() {
    let server = TestServer::start().await;

    let response = server
        .client
        .get(format!("{}/events", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let mut stream = response.bytes_stream();

    // The subscription exists once headers are back
    server.post("/services/worker/start").await;

    let received = tokio::time::timeout(Duration::from_secs(5), async {
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            buffer.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
            if buffer.contains("\"newState\":\"running\"") {
                break;
            }
        }
        buffer
    })
    .await
    .unwrap();

    assert!(received.contains("event: status"));
    assert!(received.contains("\"name\":\"worker\""));
    assert!(received.contains("\"oldState\":\"stopped\""));
    assert!(received.contains("\"newState\":\"starting\""));

    server.stop().await;
}
