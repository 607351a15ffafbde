//! HTTP surface tests against an in-process router with stubbed collaborators.
//!
//! Plain endpoints are exercised with `oneshot`; the event socket needs a real
//! listener, so those tests serve the same router on an ephemeral port.

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use device_safety_platform::{
    agent::ExecutorSet,
    generation::{GenerationError, TextGenerator},
    orchestrator::Orchestrator,
    registry::AgentRegistry,
    runs::RunManager,
    server::{create_router, AppState},
    settings::Settings,
    sources::{DataQuery, DataSource, SearchResponse, SourceError},
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tower::ServiceExt;

struct FixtureSource;

#[async_trait]
impl DataSource for FixtureSource {
    async fn search(&self, query: &DataQuery) -> Result<SearchResponse, SourceError> {
        Ok(SearchResponse {
            records: vec![json!({
                "event_type": "Malfunction",
                "reason_for_recall": "Software error",
                "dataset": query.dataset.endpoint(),
            })],
            total: 1,
        })
    }
}

/// Never answers, so collectors stay running until cancelled
struct HangingSource;

#[async_trait]
impl DataSource for HangingSource {
    async fn search(&self, _query: &DataQuery) -> Result<SearchResponse, SourceError> {
        std::future::pending().await
    }
}

struct CannedGenerator;

#[async_trait]
impl TextGenerator for CannedGenerator {
    fn model(&self) -> &str {
        "canned"
    }

    async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
        Ok("No unusual safety signal was found.".to_string())
    }
}

fn app() -> Router {
    app_with(Arc::new(FixtureSource))
}

fn app_with(source: Arc<dyn DataSource>) -> Router {
    let settings = Settings::default();
    let executors = ExecutorSet::with_defaults(source, Arc::new(CannedGenerator), 10);
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(AgentRegistry::with_defaults().unwrap()),
        executors,
        settings.orchestrator.clone(),
    ));
    let runs = Arc::new(RunManager::new(orchestrator, settings.orchestrator.retention()));
    create_router(AppState::new(runs), &settings)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn submit(query: &str) -> Request<Body> {
    Request::post("/queries")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "query": query }).to_string()))
        .unwrap()
}

async fn submit_run(app: &Router, query: &str) -> String {
    let (status, body) = send(app, submit(query)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    body["run_id"].as_str().unwrap().to_string()
}

/// Poll `/result` until the run is terminal
async fn wait_for_result(app: &Router, run_id: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (status, body) = send(app, get(&format!("/runs/{}/result", run_id))).await;
            if status == StatusCode::OK {
                return body;
            }
            assert_eq!(status, StatusCode::CONFLICT);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("run did not finish")
}

/// Poll the snapshot until `agent_id` is running
async fn wait_until_running(app: &Router, run_id: &str, agent_id: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (_, snapshot) = send(app, get(&format!("/runs/{}", run_id))).await;
            if snapshot["agents"][agent_id]["status"] == "running" {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("agent never started")
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_health_and_agent_listing() {
    let app = app();

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["agent_count"], 5);

    let (status, body) = send(&app, get("/agents")).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|agent| agent["id"].as_str().unwrap())
        .collect();
    assert_eq!(
        ids,
        vec![
            "device_info_collector",
            "events_collector",
            "recalls_collector",
            "pattern_analyzer",
            "narrative_writer"
        ]
    );
}

#[tokio::test]
async fn test_empty_query_is_rejected() {
    let app = app();
    let (status, body) = send(&app, submit("   ")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Query is empty");
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let app = app();
    let uri = format!("/runs/{}", uuid::Uuid::new_v4());
    let (status, _) = send(&app, get(&uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, get(&format!("{}/result", uri))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_submitted_run_reaches_result() {
    let app = app();
    let run_id = submit_run(&app, "insulin pump recalls").await;

    let (status, snapshot) = send(&app, get(&format!("/runs/{}", run_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["run_id"], run_id.as_str());
    assert!(snapshot["agents"].get("recalls_collector").is_some());

    let result = wait_for_result(&app, &run_id).await;
    assert_eq!(result["status"], "completed");
    assert!(result["results"].get("recalls_collector").is_some());
    assert_eq!(result["intent"]["category"], "recalls");
    assert_eq!(result["answer"], "No unusual safety signal was found.");
}

#[tokio::test]
async fn test_cancel_unknown_run() {
    let app = app();
    let request = Request::delete(format!("/runs/{}", uuid::Uuid::new_v4()))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_event_socket_delivers_ordered_frames() {
    let app = app();
    let addr = serve(app.clone()).await;
    let run_id = submit_run(&app, "pacemaker adverse events").await;

    let (mut socket, _) = connect_async(format!("ws://{}/runs/{}/events", addr, run_id))
        .await
        .unwrap();

    let mut frames: Vec<Value> = Vec::new();
    let close = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(message) = socket.next().await {
            match message.unwrap() {
                Message::Text(text) => frames.push(serde_json::from_str(&text).unwrap()),
                Message::Close(frame) => return frame,
                _ => {}
            }
        }
        None
    })
    .await
    .expect("socket never closed");

    assert!(frames.len() >= 3);
    for (index, frame) in frames.iter().enumerate() {
        assert_eq!(frame["sequence"], index as u64 + 1);
    }
    assert_eq!(frames.first().unwrap()["type"], "agent_states");
    let last = frames.last().unwrap();
    assert_eq!(last["type"], "complete");
    assert_eq!(last["payload"]["status"], "completed");
    assert_eq!(u16::from(close.unwrap().code), 1000);

    // The stream belongs to one subscriber
    assert!(connect_async(format!("ws://{}/runs/{}/events", addr, run_id))
        .await
        .is_err());
}

#[tokio::test]
async fn test_closing_event_socket_cancels_run() {
    let app = app_with(Arc::new(HangingSource));
    let addr = serve(app.clone()).await;
    let run_id = submit_run(&app, "insulin pump recalls").await;
    wait_until_running(&app, &run_id, "recalls_collector").await;

    let (mut socket, _) = connect_async(format!("ws://{}/runs/{}/events", addr, run_id))
        .await
        .unwrap();
    let Some(Ok(Message::Text(first))) = socket.next().await else {
        panic!("expected the initial agent states");
    };
    let first: Value = serde_json::from_str(&first).unwrap();
    assert_eq!(first["type"], "agent_states");
    socket.close(None).await.unwrap();

    let result = wait_for_result(&app, &run_id).await;
    assert_eq!(result["status"], "failed");
    assert_eq!(result["cancel_reason"], "Subscriber disconnected");
    assert_eq!(result["diagnostics"]["recalls_collector"]["error_kind"], "cancelled");
    assert_eq!(result["diagnostics"]["narrative_writer"]["status"], "skipped");
}

#[tokio::test]
async fn test_delete_cancels_running_run() {
    let app = app_with(Arc::new(HangingSource));
    let run_id = submit_run(&app, "insulin pump recalls").await;
    wait_until_running(&app, &run_id, "recalls_collector").await;

    let (status, _) = send(&app, get(&format!("/runs/{}/result", run_id))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let request = Request::delete(format!("/runs/{}", run_id))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let result = wait_for_result(&app, &run_id).await;
    assert_eq!(result["status"], "failed");
    assert_eq!(result["cancel_reason"], "Cancelled by request");
    assert_eq!(result["diagnostics"]["recalls_collector"]["status"], "failed");
    assert_eq!(result["diagnostics"]["recalls_collector"]["error_kind"], "cancelled");
    assert!(result["results"].as_object().map_or(true, |r| r.is_empty()));
}
