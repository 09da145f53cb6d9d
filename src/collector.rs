//! Durable state via the gateway's secret-store tools: result persistence,
//! previous-run recall, and the global kill switch.

use crate::gateway::GatewayClient;
use crate::model::CampaignResult;
use log::{error, warn};

pub const KILL_SWITCH_KEY: &str = "campaigns/global-kill";

pub struct Collector {
    gateway: GatewayClient,
}

impl Collector {
    pub fn new(gateway_url: impl Into<String>) -> Self {
        Collector { gateway: GatewayClient::new(gateway_url) }
    }

    /// Persists `result` under `<setec-key>/latest` and `<setec-key>/runs/<run-id>`.
    /// History-write failure is logged but non-fatal; `/latest` failure is returned.
    pub async fn store_result(&self, setec_key: &str, result: &CampaignResult) -> Result<(), String> {
        let json = serde_json::to_string(result).map_err(|e| e.to_string())?;
        let latest_key = format!("{setec_key}/latest");
        let run_key = format!("{setec_key}/runs/{}", result.run_id);

        if let Err(e) = self.gateway.secret_put(&run_key, &json).await {
            warn!("campaign_runner::collector::store_result(...): history write failed for {run_key}: {e}");
        }

        if let Err(e) = self.gateway.secret_put(&latest_key, &json).await {
            error!("campaign_runner::collector::store_result(...): latest write failed for {latest_key}: {e}");
            return Err(e);
        }
        Ok(())
    }

    /// Fetches `<setec-key>/latest` and returns its findings, or `None` if
    /// absent or unparseable.
    pub async fn previous_findings(&self, setec_key: &str) -> Option<Vec<crate::model::Finding>> {
        let latest_key = format!("{setec_key}/latest");
        let raw = self.gateway.secret_get(&latest_key).await.ok().flatten()?;
        let result: CampaignResult = serde_json::from_str(&raw).ok()?;
        Some(result.findings)
    }

    /// `true` iff the kill switch value is exactly `"true"`.
    pub async fn kill_switch_active(&self) -> bool {
        matches!(self.gateway.secret_get(KILL_SWITCH_KEY).await, Ok(Some(v)) if v == "true")
    }

    pub async fn clear_kill_switch(&self) -> Result<(), String> {
        self.gateway.secret_put(KILL_SWITCH_KEY, "false").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn previous_findings_parses_envelope() {
        let result = CampaignResult::skeleton("sweep", "sweep-1", Utc::now());
        let json = serde_json::to_string(&result).unwrap();
        let parsed: CampaignResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.campaign_id, "sweep");
        assert!(parsed.findings.is_empty());
    }
}
