//! Feedback handler: issue and pull-request lifecycle, keyed by finding
//! fingerprint, with duplicate-PR suppression (§4.8).

use crate::model::{Campaign, Finding};
use log::{error, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

const DEFAULT_BRANCH_PREFIX: &str = "sid/fix-";
const DEFAULT_BASE_BRANCH: &str = "main";

/// Issue + PR lifecycle against the forge's REST API, authenticated with
/// the current bot installation token. The token is swapped in place by
/// the scheduler's token-refresh step (`update_token`), matching the
/// `UpdateToken` capability of §4.3.
pub struct FeedbackHandler {
    client: reqwest::Client,
    api_base: String,
    token: Arc<RwLock<String>>,
}

impl FeedbackHandler {
    pub fn new(api_base: impl Into<String>, initial_token: impl Into<String>) -> Self {
        FeedbackHandler {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            token: Arc::new(RwLock::new(initial_token.into())),
        }
    }

    pub async fn update_token(&self, token: String) {
        *self.token.write().await = token;
    }

    async fn auth_headers(&self) -> (String, &'static str) {
        let token = self.token.read().await.clone();
        (format!("token {token}"), "application/vnd.github+json")
    }

    /// Creates or skips an issue per finding; operates only when
    /// `campaign.feedback.create_issues` is set.
    pub async fn handle_issues(&self, campaign: &Campaign, findings: &[Finding]) {
        if !campaign.feedback.create_issues || campaign.outputs.issue_repo.is_empty() {
            return;
        }
        for finding in findings {
            if let Err(e) = self.create_issue_if_absent(campaign, finding).await {
                error!(
                    "campaign_runner::feedback::handle_issues(...): issue creation failed for fingerprint {}: {e}",
                    finding.fingerprint_or_title()
                );
            }
        }
    }

    async fn create_issue_if_absent(&self, campaign: &Campaign, finding: &Finding) -> Result<(), String> {
        let repo = &campaign.outputs.issue_repo;
        let fp = finding.fingerprint_or_title();
        if self.find_open_issue(repo, fp).await?.is_some() {
            info!("campaign_runner::feedback::create_issue_if_absent(...): issue for {fp} already exists, skipping");
            return Ok(());
        }

        let mut labels: Vec<String> = finding.labels.clone();
        labels.extend(campaign.outputs.issue_labels.iter().cloned());
        labels.sort();
        labels.dedup();

        let (owner, name) = split_repo(repo)?;
        let url = format!("{}/repos/{owner}/{name}/issues", self.api_base);
        let (auth, accept) = self.auth_headers().await;
        let body = json!({
            "title": finding.title,
            "body": format!("{}\n\n<!-- fingerprint: {fp} -->", finding.body),
            "labels": labels,
        });
        let resp = self
            .client
            .post(url)
            .header("Authorization", auth)
            .header("Accept", accept)
            .header("User-Agent", "campaign-runner")
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("create issue failed: status {}", resp.status()));
        }
        Ok(())
    }

    async fn find_open_issue(&self, repo: &str, fingerprint: &str) -> Result<Option<Value>, String> {
        let (owner, name) = split_repo(repo)?;
        let query = format!("repo:{owner}/{name} is:issue is:open \"{fingerprint}\"");
        let url = format!("{}/search/issues", self.api_base);
        let (auth, accept) = self.auth_headers().await;
        let resp = self
            .client
            .get(url)
            .query(&[("q", query.as_str())])
            .header("Authorization", auth)
            .header("Accept", accept)
            .header("User-Agent", "campaign-runner")
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("issue search failed: status {}", resp.status()));
        }
        let body: Value = resp.json().await.map_err(|e| e.to_string())?;
        Ok(body.get("items").and_then(|i| i.as_array()).and_then(|a| a.first().cloned()))
    }

    /// Closes issues for findings present in `previous` but absent from
    /// `current`, when `close_resolved_issues` is set.
    pub async fn close_resolved(&self, campaign: &Campaign, previous: &[Finding], current: &[Finding]) {
        if !campaign.feedback.close_resolved_issues {
            return;
        }
        let current_fps: std::collections::HashSet<&str> =
            current.iter().map(|f| f.fingerprint_or_title()).collect();
        for prev in previous {
            let fp = prev.fingerprint_or_title();
            if current_fps.contains(fp) {
                continue;
            }
            match self.find_open_issue(&campaign.outputs.issue_repo, fp).await {
                Ok(Some(issue)) => {
                    if let Err(e) = self.close_issue(&campaign.outputs.issue_repo, &issue).await {
                        error!("campaign_runner::feedback::close_resolved(...): failed to close issue for {fp}: {e}");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("campaign_runner::feedback::close_resolved(...): lookup failed for {fp}: {e}"),
            }
        }
    }

    /// Applies each routed finding's handoff labels to its already-filed
    /// issue, as a follow-up call run after handoff routing (§3, §4.10).
    pub async fn apply_handoff_labels(&self, campaign: &Campaign, routed: &[crate::model::RoutedFinding]) {
        if campaign.outputs.issue_repo.is_empty() {
            return;
        }
        for r in routed {
            if r.labels.is_empty() {
                continue;
            }
            let fp = r.finding.fingerprint_or_title();
            match self.find_open_issue(&campaign.outputs.issue_repo, fp).await {
                Ok(Some(issue)) => {
                    if let Err(e) = self.add_labels(&campaign.outputs.issue_repo, &issue, &r.labels).await {
                        error!("campaign_runner::feedback::apply_handoff_labels(...): failed to label issue for {fp}: {e}");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("campaign_runner::feedback::apply_handoff_labels(...): lookup failed for {fp}: {e}"),
            }
        }
    }

    async fn add_labels(&self, repo: &str, issue: &Value, labels: &[String]) -> Result<(), String> {
        let (owner, name) = split_repo(repo)?;
        let number = issue.get("number").and_then(|n| n.as_u64()).ok_or("issue missing number")?;
        let (auth, accept) = self.auth_headers().await;
        let url = format!("{}/repos/{owner}/{name}/issues/{number}/labels", self.api_base);
        let resp = self
            .client
            .post(url)
            .header("Authorization", auth)
            .header("Accept", accept)
            .header("User-Agent", "campaign-runner")
            .json(&json!({ "labels": labels }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("add labels failed: status {}", resp.status()));
        }
        Ok(())
    }

    async fn close_issue(&self, repo: &str, issue: &Value) -> Result<(), String> {
        let (owner, name) = split_repo(repo)?;
        let number = issue.get("number").and_then(|n| n.as_u64()).ok_or("issue missing number")?;
        let (auth, accept) = self.auth_headers().await;

        let comment_url = format!("{}/repos/{owner}/{name}/issues/{number}/comments", self.api_base);
        let comment_resp = self
            .client
            .post(&comment_url)
            .header("Authorization", auth.clone())
            .header("Accept", accept)
            .header("User-Agent", "campaign-runner")
            .json(&json!({ "body": "Resolved: no longer detected in the latest run." }))
            .send()
            .await;
        if let Err(e) = comment_resp {
            warn!("campaign_runner::feedback::close_issue(...): resolution comment failed: {e}");
        }

        let patch_url = format!("{}/repos/{owner}/{name}/issues/{number}", self.api_base);
        let resp = self
            .client
            .patch(patch_url)
            .header("Authorization", auth)
            .header("Accept", accept)
            .header("User-Agent", "campaign-runner")
            .json(&json!({ "state": "closed" }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("close issue failed: status {}", resp.status()));
        }
        Ok(())
    }

    /// Creates branch + patch + PR for every PR-eligible finding, skipping
    /// any whose head branch already has an open PR (§4.8).
    pub async fn handle_prs(&self, campaign: &Campaign, findings: &[Finding]) {
        if !campaign.feedback.create_prs || campaign.guardrails.read_only || campaign.outputs.issue_repo.is_empty() {
            return;
        }
        for finding in findings {
            if !finding.is_pr_eligible() {
                continue;
            }
            if let Err(e) = self.create_pr(campaign, finding).await {
                error!(
                    "campaign_runner::feedback::handle_prs(...): PR creation failed for fingerprint {}: {e}",
                    finding.fingerprint_or_title()
                );
            }
        }
    }

    fn branch_name(&self, campaign: &Campaign, finding: &Finding) -> String {
        let prefix = if campaign.outputs.pr_branch_prefix.is_empty() {
            DEFAULT_BRANCH_PREFIX
        } else {
            &campaign.outputs.pr_branch_prefix
        };
        let fp = finding.fingerprint_or_title().to_lowercase();
        let slug: String = fp
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .take(24)
            .collect();
        format!("{prefix}{slug}")
    }

    async fn create_pr(&self, campaign: &Campaign, finding: &Finding) -> Result<(), String> {
        let repo = &campaign.outputs.issue_repo;
        let (owner, name) = split_repo(repo)?;
        let branch = self.branch_name(campaign, finding);
        let base = campaign
            .targets
            .first()
            .map(|t| t.branch.as_str())
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_BASE_BRANCH);

        if self.open_pr_exists(owner, name, &branch).await? {
            info!("campaign_runner::feedback::create_pr(...): PR on {branch} already exists, skipping");
            return Ok(());
        }

        let base_sha = self.ref_sha(owner, name, base).await?;
        self.create_ref(owner, name, &branch, &base_sha).await?;
        self.patch_file(owner, name, &branch, finding).await?;
        self.open_pull_request(campaign, owner, name, &branch, base, finding).await?;
        Ok(())
    }

    async fn open_pr_exists(&self, owner: &str, name: &str, branch: &str) -> Result<bool, String> {
        let url = format!("{}/repos/{owner}/{name}/pulls", self.api_base);
        let (auth, accept) = self.auth_headers().await;
        let head = format!("{owner}:{branch}");
        let resp = self
            .client
            .get(url)
            .query(&[("state", "open"), ("head", head.as_str())])
            .header("Authorization", auth)
            .header("Accept", accept)
            .header("User-Agent", "campaign-runner")
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("PR list failed: status {}", resp.status()));
        }
        let prs: Vec<Value> = resp.json().await.map_err(|e| e.to_string())?;
        Ok(!prs.is_empty())
    }

    async fn ref_sha(&self, owner: &str, name: &str, branch: &str) -> Result<String, String> {
        let url = format!("{}/repos/{owner}/{name}/git/ref/heads/{branch}", self.api_base);
        let (auth, accept) = self.auth_headers().await;
        let resp = self
            .client
            .get(url)
            .header("Authorization", auth)
            .header("Accept", accept)
            .header("User-Agent", "campaign-runner")
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("get ref failed: status {}", resp.status()));
        }
        let body: Value = resp.json().await.map_err(|e| e.to_string())?;
        body.get("object")
            .and_then(|o| o.get("sha"))
            .and_then(|s| s.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| "ref response missing object.sha".to_string())
    }

    async fn create_ref(&self, owner: &str, name: &str, branch: &str, sha: &str) -> Result<(), String> {
        let url = format!("{}/repos/{owner}/{name}/git/refs", self.api_base);
        let (auth, accept) = self.auth_headers().await;
        let resp = self
            .client
            .post(url)
            .header("Authorization", auth)
            .header("Accept", accept)
            .header("User-Agent", "campaign-runner")
            .json(&json!({ "ref": format!("refs/heads/{branch}"), "sha": sha }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("create ref failed: status {}", resp.status()));
        }
        Ok(())
    }

    async fn patch_file(&self, owner: &str, name: &str, branch: &str, finding: &Finding) -> Result<(), String> {
        let hints = &finding.remediation_hints;
        let url = format!("{}/repos/{owner}/{name}/contents/{}", self.api_base, hints.file);
        let (auth, accept) = self.auth_headers().await;

        let resp = self
            .client
            .get(&url)
            .query(&[("ref", branch)])
            .header("Authorization", auth.clone())
            .header("Accept", accept)
            .header("User-Agent", "campaign-runner")
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("get file contents failed: status {}", resp.status()));
        }
        let body: Value = resp.json().await.map_err(|e| e.to_string())?;
        let encoded = body.get("content").and_then(|c| c.as_str()).ok_or("file response missing content")?;
        let sha = body.get("sha").and_then(|s| s.as_str()).ok_or("file response missing sha")?;
        let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded.replace('\n', ""))
            .map_err(|e| e.to_string())?;
        let original = String::from_utf8(decoded).map_err(|e| e.to_string())?;

        if !original.contains(&hints.find) {
            return Err(format!("literal \"{}\" not found in {}", hints.find, hints.file));
        }
        let patched = original.replacen(&hints.find, &hints.replace, 1);
        let encoded_patched = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, patched.as_bytes());
        let message = if hints.commit_message.is_empty() {
            format!("fix: {}", finding.title)
        } else {
            hints.commit_message.clone()
        };

        let resp = self
            .client
            .put(&url)
            .header("Authorization", auth)
            .header("Accept", accept)
            .header("User-Agent", "campaign-runner")
            .json(&json!({
                "message": message,
                "content": encoded_patched,
                "sha": sha,
                "branch": branch,
            }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("put file contents failed: status {}", resp.status()));
        }
        Ok(())
    }

    async fn open_pull_request(
        &self,
        campaign: &Campaign,
        owner: &str,
        name: &str,
        branch: &str,
        base: &str,
        finding: &Finding,
    ) -> Result<(), String> {
        let url = format!("{}/repos/{owner}/{name}/pulls", self.api_base);
        let (auth, accept) = self.auth_headers().await;
        let title = format!("fix: {}", finding.title);
        let pr_body = render_pr_body(campaign, finding);

        let resp = self
            .client
            .post(url)
            .header("Authorization", auth)
            .header("Accept", accept)
            .header("User-Agent", "campaign-runner")
            .json(&json!({ "title": title, "head": branch, "base": base, "body": pr_body }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("create PR failed: status {}", resp.status()));
        }
        Ok(())
    }
}

fn render_pr_body(campaign: &Campaign, finding: &Finding) -> String {
    let template = &campaign.outputs.pr_body_template;
    if template.is_empty() {
        format!(
            "Automated fix from campaign `{}`.\n\n- Severity: {}\n- Remediation: {}\n- Fingerprint: `{}`\n\n{}",
            campaign.id,
            finding.severity,
            finding.remediation_type,
            finding.fingerprint_or_title(),
            finding.body,
        )
    } else {
        template
            .replace("{{title}}", &finding.title)
            .replace("{{severity}}", &finding.severity)
            .replace("{{campaign}}", &campaign.id)
            .replace("{{fingerprint}}", finding.fingerprint_or_title())
    }
}

fn split_repo(repo: &str) -> Result<(&str, &str), String> {
    repo.split_once('/').ok_or_else(|| format!("issue repo \"{repo}\" is not owner/repo shaped"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeedbackPolicy, Guardrails, Metrics, Outputs, RemediationHints, Target, Trigger};

    fn campaign(prefix: &str) -> Campaign {
        Campaign {
            id: "sweep".into(),
            name: String::new(),
            description: String::new(),
            agent: "gateway-direct".into(),
            trigger: Trigger::default(),
            targets: vec![Target { forge: "github".into(), org: "acme".into(), repo: "widgets".into(), branch: String::new() }],
            tools: vec![],
            process: vec![],
            outputs: Outputs {
                setec_key: "campaigns/sweep".into(),
                issue_labels: vec![],
                issue_repo: "acme/widgets".into(),
                pr_branch_prefix: prefix.into(),
                pr_body_template: String::new(),
            },
            guardrails: Guardrails::default(),
            feedback: FeedbackPolicy { create_issues: true, create_prs: true, close_resolved_issues: true },
            metrics: Metrics::default(),
        }
    }

    fn finding_fp1() -> Finding {
        Finding {
            title: "Something broke".into(),
            body: "details".into(),
            severity: "high".into(),
            labels: vec![],
            campaign_id: "sweep".into(),
            run_id: "sweep-1".into(),
            fingerprint: "fp1".into(),
            fixable: true,
            remediation_type: "patch".into(),
            remediation_hints: RemediationHints {
                file: "README.md".into(),
                find: "old".into(),
                replace: "new".into(),
                commit_message: "fix typo".into(),
            },
        }
    }

    #[test]
    fn branch_name_matches_scenario_5() {
        let handler = FeedbackHandler::new("https://api.github.com", "tok");
        let name = handler.branch_name(&campaign("bot/fix-"), &finding_fp1());
        assert_eq!(name, "bot/fix-fp1");
    }

    #[test]
    fn default_prefix_used_when_unset() {
        let handler = FeedbackHandler::new("https://api.github.com", "tok");
        let name = handler.branch_name(&campaign(""), &finding_fp1());
        assert_eq!(name, format!("{DEFAULT_BRANCH_PREFIX}fp1"));
    }

    #[test]
    fn pr_body_default_contains_fingerprint() {
        let body = render_pr_body(&campaign("bot/fix-"), &finding_fp1());
        assert!(body.contains("fp1"));
    }

    #[test]
    fn pr_body_template_substitutes_placeholders() {
        let mut c = campaign("bot/fix-");
        c.outputs.pr_body_template = "{{title}} / {{severity}} / {{campaign}} / {{fingerprint}}".into();
        let body = render_pr_body(&c, &finding_fp1());
        assert_eq!(body, "Something broke / high / sweep / fp1");
    }

    #[test]
    fn split_repo_rejects_malformed_value() {
        assert!(split_repo("not-owner-slash-repo").is_err());
        assert_eq!(split_repo("acme/widgets").unwrap(), ("acme", "widgets"));
    }
}
