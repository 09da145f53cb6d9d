//! Webhook ingestion (§4.12): signature verification and campaign matching
//! against a normalised `{event, forge, ref, repo, changed_files[]}` payload.

use super::server::{spawn_dispatch, AppState};
use crate::model::Campaign;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use hmac::{Hmac, Mac};
use log::warn;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    #[serde(default)]
    pub forge: String,
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    pub repo: String,
    #[serde(rename = "changed_files", default)]
    pub changed_files: Vec<String>,
}

pub async fn webhook(State(state): State<AppState>, headers: HeaderMap, body: axum::body::Bytes) -> impl IntoResponse {
    if let Some(secret) = &state.webhook_secret {
        if !signature_valid(secret, &headers, &body) {
            return (StatusCode::FORBIDDEN, Json(json!({ "error": "invalid signature" }))).into_response();
        }
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": format!("malformed payload: {e}") }))).into_response(),
    };

    let registry = state.registry.snapshot().await;
    let mut triggered = Vec::new();
    for campaign in registry.values() {
        if campaign_matches(campaign, &payload) {
            spawn_dispatch(state.runner.clone(), campaign.clone());
            triggered.push(campaign.id.clone());
        }
    }

    let count = triggered.len();
    (StatusCode::OK, Json(json!({ "triggered": triggered, "count": count }))).into_response()
}

/// Accepts either an `X-Hub-Signature-256: sha256=<hex>` HMAC header or a
/// verbatim shared-secret header, compared in constant time. When neither
/// validates, the caller is refused.
fn signature_valid(secret: &str, headers: &HeaderMap, body: &[u8]) -> bool {
    if let Some(sig_header) = headers.get("X-Hub-Signature-256").and_then(|v| v.to_str().ok()) {
        if let Some(hex_digest) = sig_header.strip_prefix("sha256=") {
            if let Ok(expected) = hex::decode(hex_digest) {
                if let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) {
                    mac.update(body);
                    return mac.verify_slice(&expected).is_ok();
                }
            }
        }
        return false;
    }

    if let Some(shared) = headers.get("X-Webhook-Secret").and_then(|v| v.to_str().ok()) {
        return shared.as_bytes().ct_eq(secret.as_bytes()).into();
    }

    warn!("campaign_runner::api::webhook::signature_valid(...): webhook secret configured but no recognised signature header present");
    false
}

fn campaign_matches(campaign: &Campaign, payload: &WebhookPayload) -> bool {
    if campaign.trigger.event.is_empty() || campaign.trigger.event != payload.event {
        return false;
    }
    if !campaign.targets.iter().any(|t| target_matches(t, &payload.repo)) {
        return false;
    }
    if !campaign.trigger.path_filters.is_empty() {
        let any_file_matches = payload.changed_files.iter().any(|file| {
            campaign.trigger.path_filters.iter().any(|pattern| {
                glob::Pattern::new(pattern).map(|p| p.matches(file)).unwrap_or(false)
            })
        });
        if !any_file_matches {
            return false;
        }
    }
    true
}

fn target_matches(target: &crate::model::Target, incoming_repo: &str) -> bool {
    if target.repo == "*" {
        return true;
    }
    let full = format!("{}/{}", target.org, target.repo);
    full == incoming_repo
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeedbackPolicy, Guardrails, Metrics, Outputs, Target, Trigger};

    fn campaign(event: &str, targets: Vec<Target>, path_filters: Vec<&str>) -> Campaign {
        Campaign {
            id: "c".into(),
            name: String::new(),
            description: String::new(),
            agent: "gateway-direct".into(),
            trigger: Trigger {
                schedule: String::new(),
                event: event.into(),
                depends_on: vec![],
                path_filters: path_filters.into_iter().map(|s| s.to_string()).collect(),
            },
            targets,
            tools: vec![],
            process: vec![],
            outputs: Outputs::default(),
            guardrails: Guardrails::default(),
            feedback: FeedbackPolicy::default(),
            metrics: Metrics::default(),
        }
    }

    fn payload(event: &str, repo: &str, changed: &[&str]) -> WebhookPayload {
        WebhookPayload {
            event: event.into(),
            forge: "github".into(),
            git_ref: "refs/heads/main".into(),
            repo: repo.into(),
            changed_files: changed.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn cron_only_campaign_never_matches_webhook() {
        let c = campaign("", vec![Target { forge: "github".into(), org: "acme".into(), repo: "*".into(), branch: String::new() }], vec![]);
        assert!(!campaign_matches(&c, &payload("push", "acme/widgets", &[])));
    }

    #[test]
    fn wildcard_target_matches_any_repo() {
        let c = campaign("push", vec![Target { forge: "github".into(), org: "acme".into(), repo: "*".into(), branch: String::new() }], vec![]);
        assert!(campaign_matches(&c, &payload("push", "anyone/anything", &[])));
    }

    #[test]
    fn path_filters_require_at_least_one_match() {
        let c = campaign(
            "push",
            vec![Target { forge: "github".into(), org: "acme".into(), repo: "widgets".into(), branch: String::new() }],
            vec!["src/**/*.rs"],
        );
        assert!(campaign_matches(&c, &payload("push", "acme/widgets", &["src/lib.rs"])));
        assert!(!campaign_matches(&c, &payload("push", "acme/widgets", &["README.md"])));
    }

    #[test]
    fn hmac_signature_round_trips() {
        let secret = "topsecret";
        let body = b"{\"event\":\"push\"}";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let digest = hex::encode(mac.finalize().into_bytes());

        let mut headers = HeaderMap::new();
        headers.insert("X-Hub-Signature-256", format!("sha256={digest}").parse().unwrap());
        assert!(signature_valid(secret, &headers, body));

        let mut bad_headers = HeaderMap::new();
        bad_headers.insert("X-Hub-Signature-256", "sha256=deadbeef".parse().unwrap());
        assert!(!signature_valid(secret, &bad_headers, body));
    }

    #[test]
    fn shared_secret_header_compared_constant_time() {
        let secret = "topsecret";
        let mut headers = HeaderMap::new();
        headers.insert("X-Webhook-Secret", secret.parse().unwrap());
        assert!(signature_valid(secret, &headers, b"anything"));

        let mut wrong = HeaderMap::new();
        wrong.insert("X-Webhook-Secret", "nope".parse().unwrap());
        assert!(!signature_valid(secret, &wrong, b"anything"));
    }
}
