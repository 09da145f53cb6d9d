use crate::loader::SharedRegistry;
use crate::model::CampaignResult;
use crate::observer::ResultObserver;
use crate::scheduler::Runner;
use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Registers itself as the scheduler's on-result observer to populate the
/// `/status` cache (§4.11).
pub struct StatusObserver {
    cache: Arc<RwLock<HashMap<String, CampaignResult>>>,
}

impl StatusObserver {
    pub fn new(cache: Arc<RwLock<HashMap<String, CampaignResult>>>) -> Self {
        StatusObserver { cache }
    }
}

#[async_trait]
impl ResultObserver for StatusObserver {
    async fn on_result(&self, result: &CampaignResult) {
        self.cache.write().await.insert(result.campaign_id.clone(), result.clone());
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: SharedRegistry,
    pub runner: Arc<Runner>,
    pub status_cache: Arc<RwLock<HashMap<String, CampaignResult>>>,
    pub webhook_secret: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/campaigns", get(list_campaigns))
        .route("/trigger", post(trigger))
        .route("/status", get(status))
        .route("/webhook", post(super::webhook::webhook))
        .with_state(state)
}

/// Binds and serves the API router on `port`. Runs until the process exits.
pub async fn serve(state: AppState, port: u16) -> Result<(), std::io::Error> {
    let app = router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("campaign_runner::api::server::serve(...): listening on {addr}");
    axum::serve(listener, app).await
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let count = state.registry.snapshot().await.len();
    Json(json!({ "status": "ok", "service": "campaign-runner", "campaign_count": count }))
}

async fn list_campaigns(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.registry.snapshot().await;
    let campaigns: Vec<_> = registry
        .values()
        .map(|c| {
            json!({
                "id": c.id,
                "name": c.name,
                "agent": c.agent,
                "schedule": c.trigger.schedule,
                "max_duration": c.guardrails.max_duration,
            })
        })
        .collect();
    let count = campaigns.len();
    Json(json!({ "campaigns": campaigns, "count": count }))
}

#[derive(Debug, Deserialize)]
pub struct TriggerQuery {
    pub campaign: String,
}

async fn trigger(State(state): State<AppState>, Query(query): Query<TriggerQuery>) -> impl IntoResponse {
    let Some(campaign) = state.registry.get(&query.campaign).await else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown campaign" }))).into_response();
    };

    spawn_dispatch(state.runner.clone(), campaign.clone());

    (StatusCode::ACCEPTED, Json(json!({ "status": "accepted", "campaign_id": campaign.id }))).into_response()
}

/// Spawns a detached background dispatch with a timeout equal to the
/// campaign's max duration; the HTTP caller never waits on it (§5).
pub(super) fn spawn_dispatch(runner: Arc<Runner>, campaign: crate::model::Campaign) {
    tokio::spawn(async move {
        let deadline = campaign.max_duration();
        if tokio::time::timeout(deadline, runner.run_campaign(&campaign)).await.is_err() {
            error!("campaign_runner::api::server::spawn_dispatch(...): dispatch of {} exceeded max_duration", campaign.id);
        }
    });
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub campaign: Option<String>,
}

async fn status(State(state): State<AppState>, Query(query): Query<StatusQuery>) -> impl IntoResponse {
    let cache = state.status_cache.read().await;
    match query.campaign {
        Some(id) => match cache.get(&id) {
            Some(result) => Json(serde_json::to_value(result).unwrap_or_default()).into_response(),
            None => Json(json!({ "status": "no_runs" })).into_response(),
        },
        None => {
            if cache.is_empty() {
                Json(json!({ "status": "no_runs" })).into_response()
            } else {
                Json(serde_json::to_value(&*cache).unwrap_or_default()).into_response()
            }
        }
    }
}
