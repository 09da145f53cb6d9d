//! End-to-end HTTP tests against the real control surface: binds the API
//! router on loopback and drives it with actual HTTP requests, rather than
//! calling handler functions directly.

use campaign_runner::api::{serve, AppState, StatusObserver};
use campaign_runner::collector::Collector;
use campaign_runner::dispatcher::Dispatcher;
use campaign_runner::loader::SharedRegistry;
use campaign_runner::model::{Campaign, FeedbackPolicy, Guardrails, Metrics, Outputs, Target, Trigger};
use campaign_runner::scheduler::Runner;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const TEST_PORT: u16 = 18_181;
const WEBHOOK_SECRET: &str = "integration-test-secret";

fn push_campaign() -> Campaign {
    Campaign {
        id: "on-push".into(),
        name: String::new(),
        description: String::new(),
        agent: "gateway-direct".into(),
        trigger: Trigger {
            schedule: String::new(),
            event: "push".into(),
            depends_on: vec![],
            path_filters: vec![],
        },
        targets: vec![Target { forge: "github".into(), org: "acme".into(), repo: "*".into(), branch: String::new() }],
        tools: vec![],
        process: vec![],
        outputs: Outputs::default(),
        guardrails: Guardrails::default(),
        feedback: FeedbackPolicy::default(),
        metrics: Metrics::default(),
    }
}

async fn spawn_server() {
    let mut registry = HashMap::new();
    registry.insert("on-push".to_string(), push_campaign());
    let registry = SharedRegistry::new(registry);

    // No campaign in this test ever actually dispatches through these, since
    // a missing gateway only matters once a handler spawns a background run;
    // /health, /campaigns, and signature checks never reach the dispatcher.
    let dispatcher = Dispatcher::new("http://127.0.0.1:1", HashMap::new());
    let collector = Collector::new("http://127.0.0.1:1");
    let status_cache = Arc::new(RwLock::new(HashMap::new()));
    let runner = Arc::new(Runner::new(dispatcher, collector).with_observer(Arc::new(StatusObserver::new(status_cache.clone()))));

    let state = AppState { registry, runner, status_cache, webhook_secret: Some(WEBHOOK_SECRET.to_string()) };
    tokio::spawn(async move {
        serve(state, TEST_PORT).await.unwrap();
    });
    // Give the listener a moment to bind before the test sends requests.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
}

fn base_url() -> String {
    format!("http://127.0.0.1:{TEST_PORT}")
}

#[tokio::test]
async fn health_and_campaigns_round_trip() {
    spawn_server().await;
    let client = reqwest::Client::new();

    let health: serde_json::Value = client.get(format!("{}/health", base_url())).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["campaign_count"], 1);

    let campaigns: serde_json::Value = client.get(format!("{}/campaigns", base_url())).send().await.unwrap().json().await.unwrap();
    assert_eq!(campaigns["count"], 1);
    assert_eq!(campaigns["campaigns"][0]["id"], "on-push");
}

#[tokio::test]
async fn webhook_rejects_bad_signature_and_accepts_valid_one() {
    spawn_server().await;
    let client = reqwest::Client::new();
    let body = serde_json::json!({ "event": "push", "repo": "acme/widgets", "changed_files": [] }).to_string();

    let rejected = client
        .post(format!("{}/webhook", base_url()))
        .header("X-Hub-Signature-256", "sha256=deadbeef")
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), reqwest::StatusCode::FORBIDDEN);

    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(body.as_bytes());
    let digest = hex::encode(mac.finalize().into_bytes());

    let accepted = client
        .post(format!("{}/webhook", base_url()))
        .header("X-Hub-Signature-256", format!("sha256={digest}"))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), reqwest::StatusCode::OK);
    let parsed: serde_json::Value = accepted.json().await.unwrap();
    assert_eq!(parsed["triggered"][0], "on-push");
}
