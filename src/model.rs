//! Campaign data model: the declarative shape read from `index.json` plus
//! per-campaign JSON files, and the result shape produced by a dispatch.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub forge: String,
    pub org: String,
    pub repo: String,
    #[serde(default)]
    pub branch: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Trigger {
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub event: String,
    #[serde(rename = "dependsOn", default)]
    pub depends_on: Vec<String>,
    #[serde(rename = "pathFilters", default)]
    pub path_filters: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Outputs {
    #[serde(rename = "setecKey", default)]
    pub setec_key: String,
    #[serde(rename = "issueLabels", default)]
    pub issue_labels: Vec<String>,
    #[serde(rename = "issueRepo", default)]
    pub issue_repo: String,
    #[serde(rename = "prBranchPrefix", default)]
    pub pr_branch_prefix: String,
    #[serde(rename = "prBodyTemplate", default)]
    pub pr_body_template: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenBudget {
    #[serde(rename = "maxTokens", default)]
    pub max_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Guardrails {
    #[serde(rename = "maxDuration", default)]
    pub max_duration: String,
    #[serde(rename = "readOnly", default)]
    pub read_only: bool,
    #[serde(rename = "killSwitch", default)]
    pub kill_switch: String,
    #[serde(rename = "aiApiBudget", default)]
    pub ai_api_budget: TokenBudget,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedbackPolicy {
    #[serde(rename = "createIssues", default)]
    pub create_issues: bool,
    #[serde(rename = "createPRs", default)]
    pub create_prs: bool,
    #[serde(rename = "closeResolvedIssues", default)]
    pub close_resolved_issues: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metrics {
    #[serde(rename = "successCriteria", default)]
    pub success_criteria: String,
    #[serde(default)]
    pub kpis: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Campaign {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub process: Vec<String>,
    #[serde(default)]
    pub outputs: Outputs,
    #[serde(default)]
    pub guardrails: Guardrails,
    #[serde(default)]
    pub feedback: FeedbackPolicy,
    #[serde(default)]
    pub metrics: Metrics,
}

impl Campaign {
    /// `guardrails.max_duration` parsed as a duration, defaulting to 30
    /// minutes when empty or unparseable (§6).
    pub fn max_duration(&self) -> std::time::Duration {
        parse_duration(&self.guardrails.max_duration)
            .unwrap_or(std::time::Duration::from_secs(30 * 60))
    }
}

/// Parses durations of the shape `"30m"`, `"1h"`, `"45s"`. Not a general
/// duration grammar — only the unit suffixes campaigns actually use.
pub fn parse_duration(s: &str) -> Option<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (num, unit) = s.split_at(s.len() - 1);
    let n: u64 = num.parse().ok()?;
    match unit {
        "s" => Some(std::time::Duration::from_secs(n)),
        "m" => Some(std::time::Duration::from_secs(n * 60)),
        "h" => Some(std::time::Duration::from_secs(n * 3600)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
    Timeout,
    Error,
    BudgetExceeded,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
            RunStatus::Timeout => "timeout",
            RunStatus::Error => "error",
            RunStatus::BudgetExceeded => "budget_exceeded",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolTraceEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub tool: String,
    pub summary: String,
    #[serde(default)]
    pub error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RemediationHints {
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub find: String,
    #[serde(default)]
    pub replace: String,
    #[serde(rename = "commitMessage", default)]
    pub commit_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Finding {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(rename = "campaignId", default)]
    pub campaign_id: String,
    #[serde(rename = "runId", default)]
    pub run_id: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub fixable: bool,
    #[serde(rename = "remediationType", default)]
    pub remediation_type: String,
    #[serde(rename = "remediationHints", default)]
    pub remediation_hints: RemediationHints,
}

impl Finding {
    /// Fingerprint, substituting the title when absent (§3 invariant).
    pub fn fingerprint_or_title(&self) -> &str {
        if self.fingerprint.is_empty() {
            &self.title
        } else {
            &self.fingerprint
        }
    }

    /// A finding is PR-eligible iff fixable and all of file/find/replace are set (§3, §8).
    pub fn is_pr_eligible(&self) -> bool {
        self.fixable
            && !self.remediation_hints.file.is_empty()
            && !self.remediation_hints.find.is_empty()
            && !self.remediation_hints.replace.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffMetadata {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "messageType")]
    pub message_type: String,
    pub priority: String,
    pub fingerprint: String,
    #[serde(rename = "campaignId")]
    pub campaign_id: String,
    #[serde(rename = "runId", default)]
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "actionRequested")]
    pub action_requested: String,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutedFinding {
    pub finding: Finding,
    #[serde(rename = "targetAgent")]
    pub target_agent: String,
    pub labels: Vec<String>,
    pub handoff: HandoffMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CampaignResult {
    #[serde(rename = "campaignId")]
    pub campaign_id: String,
    #[serde(rename = "runId")]
    pub run_id: String,
    pub status: String,
    #[serde(rename = "startedAt")]
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "finishedAt")]
    pub finished_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub kpis: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub error: String,
    #[serde(rename = "toolCalls", default)]
    pub tool_calls: u32,
    #[serde(rename = "tokensUsed", default)]
    pub tokens_used: u64,
    #[serde(rename = "toolTrace", default)]
    pub tool_trace: Vec<ToolTraceEntry>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(rename = "discussionUrl", default)]
    pub discussion_url: String,
}

impl CampaignResult {
    pub fn skeleton(campaign_id: &str, run_id: &str, started_at: chrono::DateTime<chrono::Utc>) -> Self {
        CampaignResult {
            campaign_id: campaign_id.to_string(),
            run_id: run_id.to_string(),
            started_at,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    #[serde(rename = "toolCalls", default)]
    pub tool_calls: u32,
    #[serde(rename = "tokensUsed", default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub kpis: HashMap<String, serde_json::Value>,
    #[serde(rename = "toolTrace", default)]
    pub tool_trace: Vec<ToolTraceEntry>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub error: String,
}

impl Default for DispatchResult {
    fn default() -> Self {
        DispatchResult {
            tool_calls: 0,
            tokens_used: 0,
            kpis: HashMap::new(),
            tool_trace: Vec::new(),
            findings: Vec::new(),
            error: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl InstallationToken {
    pub fn remaining(&self, now: chrono::DateTime<chrono::Utc>) -> chrono::Duration {
        self.expires_at - now
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndexEntry {
    #[serde(default)]
    pub file: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "lastRun", default)]
    pub last_run: Option<String>,
    #[serde(rename = "lastResult", default)]
    pub last_result: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CampaignIndex {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub campaigns: HashMap<String, IndexEntry>,
}
