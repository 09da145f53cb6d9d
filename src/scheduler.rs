//! The top-level scheduling loop: `RunDue`'s two-pass evaluation, kill-switch
//! staleness handling, and the post-deploy smoke test (§4.3, §5).
//!
//! [`Runner`] holds the per-campaign `RunCampaign` sequence and is shared
//! (via `Arc`) between the scheduler's own loop and the API server's manual
//! `/trigger` and `/webhook` handlers, so both paths persist, feed back, and
//! publish identically.

use crate::collector::Collector;
use crate::dispatcher::Dispatcher;
use crate::feedback::FeedbackHandler;
use crate::loader::SharedRegistry;
use crate::model::{Campaign, CampaignResult};
use crate::observer::{NullObserver, ResultObserver};
use crate::publisher::Publisher;
use crate::router;
use crate::token_provider::TokenProvider;
use chrono::Utc;
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// How long the kill switch may remain active before the scheduler
/// auto-clears it and proceeds anyway (§5).
const KILL_SWITCH_STALE_THRESHOLD: Duration = Duration::from_secs(6 * 3600);

/// Well-known campaign id used for the post-deploy smoke test, if present
/// in the registry.
const SMOKE_TEST_CAMPAIGN_ID: &str = "smoke-test";

/// The `RunCampaign` sequence (§4.3): token refresh, kill-switch check,
/// deadline-bounded dispatch, status mapping, persistence, and downstream
/// feedback/publish/route fan-out.
pub struct Runner {
    dispatcher: Arc<Dispatcher>,
    collector: Arc<Collector>,
    feedback: Option<Arc<FeedbackHandler>>,
    publisher: Option<Arc<Publisher>>,
    token_provider: Option<Arc<TokenProvider>>,
    observer: Arc<dyn ResultObserver>,
}

impl Runner {
    pub fn new(dispatcher: Dispatcher, collector: Collector) -> Self {
        Runner {
            dispatcher: Arc::new(dispatcher),
            collector: Arc::new(collector),
            feedback: None,
            publisher: None,
            token_provider: None,
            observer: Arc::new(NullObserver),
        }
    }

    pub fn with_feedback(mut self, feedback: FeedbackHandler) -> Self {
        self.feedback = Some(Arc::new(feedback));
        self
    }

    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(Arc::new(publisher));
        self
    }

    pub fn with_token_provider(mut self, provider: TokenProvider) -> Self {
        self.token_provider = Some(Arc::new(provider));
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ResultObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Runs `campaign` end to end. Returns `None` when the kill switch
    /// refuses the run (no result is persisted in that case, per §4.12).
    pub async fn run_campaign(&self, campaign: &Campaign) -> Option<CampaignResult> {
        self.refresh_token().await;

        if self.collector.kill_switch_active().await {
            info!("campaign_runner::scheduler::Runner::run_campaign(...): kill switch active, refusing run of {}", campaign.id);
            return None;
        }

        Some(self.dispatch_and_finish(campaign).await)
    }

    /// Identical to [`Runner::run_campaign`] but skips the kill-switch
    /// check — used by the scheduler loop, which has already resolved
    /// staleness and either cleared the switch or declined to call this at all.
    async fn run_campaign_unchecked(&self, campaign: &Campaign) -> CampaignResult {
        self.refresh_token().await;
        self.dispatch_and_finish(campaign).await
    }

    async fn refresh_token(&self) {
        let Some(provider) = &self.token_provider else { return };
        match provider.token().await {
            Ok(tok) => {
                if let Some(feedback) = &self.feedback {
                    feedback.update_token(tok.token.clone()).await;
                }
                if let Some(publisher) = &self.publisher {
                    publisher.update_token(tok.token.clone()).await;
                }
            }
            Err(e) => error!("campaign_runner::scheduler::Runner::refresh_token(...): token refresh failed: {e}"),
        }
    }

    async fn dispatch_and_finish(&self, campaign: &Campaign) -> CampaignResult {
        let run_id = format!("{}-{}", campaign.id, Utc::now().timestamp());
        let started_at = Utc::now();
        let mut result = CampaignResult::skeleton(&campaign.id, &run_id, started_at);
        result.agent = campaign.agent.clone();

        let deadline = campaign.max_duration();
        let outcome = tokio::time::timeout(deadline, self.dispatcher.dispatch(campaign, &run_id)).await;

        match outcome {
            Err(_) => {
                result.status = "timeout".to_string();
                result.error = "dispatch exceeded campaign max_duration".to_string();
            }
            Ok(dispatch) => {
                result.tool_calls = dispatch.tool_calls;
                result.tokens_used = dispatch.tokens_used;
                result.kpis = dispatch.kpis;
                result.tool_trace = dispatch.tool_trace;
                result.findings = dispatch.findings;
                result.error = dispatch.error.clone();
                result.status = if dispatch.error.is_empty() {
                    "success".to_string()
                } else if crate::error::RunnerError::is_budget_exceeded(&dispatch.error) {
                    "budget_exceeded".to_string()
                } else {
                    "failure".to_string()
                };
            }
        }
        result.finished_at = Utc::now();

        self.finish_run(campaign, result).await
    }

    /// Persists the result, runs feedback/publisher/router, and notifies
    /// the observer. Failures in any downstream component are logged, never
    /// fatal to the run (§4.12 failure semantics).
    async fn finish_run(&self, campaign: &Campaign, result: CampaignResult) -> CampaignResult {
        let previous = if !campaign.outputs.setec_key.is_empty() {
            self.collector.previous_findings(&campaign.outputs.setec_key).await
        } else {
            None
        };

        if !campaign.outputs.setec_key.is_empty() {
            if let Err(e) = self.collector.store_result(&campaign.outputs.setec_key, &result).await {
                error!("campaign_runner::scheduler::Runner::finish_run(...): failed to persist result for {}: {e}", campaign.id);
            }
        }

        if let Some(feedback) = &self.feedback {
            feedback.handle_issues(campaign, &result.findings).await;
            if let Some(previous) = &previous {
                feedback.close_resolved(campaign, previous, &result.findings).await;
            }
            feedback.handle_prs(campaign, &result.findings).await;
        }

        let mut result = result;
        if let Some(publisher) = &self.publisher {
            if Publisher::should_publish(&result.status) {
                match publisher.publish(campaign, &result).await {
                    Ok(published) => {
                        result.discussion_url = published.url;
                        // Handoff routing runs strictly after the discussion
                        // already exists, never folded into its creation (§4.9, §4.10).
                        let routed = router::route(campaign, &result.findings);
                        publisher.apply_handoffs(&published.id, &routed).await;
                        if let Some(feedback) = &self.feedback {
                            feedback.apply_handoff_labels(campaign, &routed).await;
                        }
                    }
                    Err(e) => error!("campaign_runner::scheduler::Runner::finish_run(...): publish failed for {}: {e}", campaign.id),
                }
            }
        }

        self.observer.on_result(&result).await;
        result
    }
}

pub struct Scheduler {
    registry: SharedRegistry,
    runner: Arc<Runner>,
    completed: HashSet<String>,
    kill_switch_since: Option<std::time::Instant>,
    startup_kill_switch_cleared: bool,
}

impl Scheduler {
    pub fn new(registry: SharedRegistry, runner: Arc<Runner>) -> Self {
        Scheduler {
            registry,
            runner,
            completed: HashSet::new(),
            kill_switch_since: None,
            startup_kill_switch_cleared: false,
        }
    }

    /// Runs the main loop: immediately, then every `interval`.
    pub async fn run_forever(&mut self, interval: Duration) {
        self.startup().await;
        loop {
            self.run_due(Utc::now()).await;
            tokio::time::sleep(interval).await;
        }
    }

    /// Clears any pre-existing active kill switch exactly once, then, if a
    /// smoke-test campaign is registered, runs it once with a short,
    /// non-fatal timeout.
    async fn startup(&mut self) {
        if !self.startup_kill_switch_cleared {
            if self.runner.collector().kill_switch_active().await {
                warn!("campaign_runner::scheduler::startup(...): clearing stale kill switch found active at startup");
                if let Err(e) = self.runner.collector().clear_kill_switch().await {
                    error!("campaign_runner::scheduler::startup(...): failed to clear kill switch: {e}");
                }
            }
            self.startup_kill_switch_cleared = true;
        }

        let smoke_test = self.registry.get(SMOKE_TEST_CAMPAIGN_ID).await;
        if let Some(campaign) = smoke_test {
            info!("campaign_runner::scheduler::startup(...): running post-deploy smoke test \"{SMOKE_TEST_CAMPAIGN_ID}\"");
            let deadline = Duration::from_secs(60);
            if tokio::time::timeout(deadline, self.runner.run_campaign_unchecked(&campaign)).await.is_err() {
                warn!("campaign_runner::scheduler::startup(...): smoke test timed out, continuing startup anyway");
            }
        }
    }

    /// The two-pass `RunDue` evaluation (§4.3).
    pub async fn run_due(&mut self, now: chrono::DateTime<Utc>) {
        let registry = self.registry.snapshot().await;

        // Pass 1: independent campaigns.
        for campaign in registry.values() {
            if !campaign.trigger.depends_on.is_empty() {
                continue;
            }
            if !is_due(campaign, now) {
                continue;
            }
            if self.run_campaign(campaign).await {
                self.completed.insert(campaign.id.clone());
            }
        }

        // Pass 2: dependency-gated campaigns.
        for campaign in registry.values() {
            if campaign.trigger.depends_on.is_empty() {
                continue;
            }
            let ready = campaign.trigger.depends_on.iter().all(|dep| self.completed.contains(dep));
            if !ready {
                continue;
            }
            if self.run_campaign(campaign).await {
                self.completed.insert(campaign.id.clone());
            }
        }
    }

    /// Runs a single campaign by id, for `--campaign <id>` one-shot mode.
    /// Returns `true` iff the run reported success.
    pub async fn run_one(&mut self, campaign_id: &str) -> bool {
        let Some(campaign) = self.registry.get(campaign_id).await else {
            error!("campaign_runner::scheduler::run_one(...): unknown campaign \"{campaign_id}\"");
            return false;
        };
        self.run_campaign(&campaign).await
    }

    async fn run_campaign(&mut self, campaign: &Campaign) -> bool {
        if self.kill_switch_blocks(campaign).await {
            return false;
        }
        let result = self.runner.run_campaign_unchecked(campaign).await;
        result.status == "success"
    }

    /// Resolves kill-switch staleness before delegating to the runner: an
    /// active switch younger than the threshold blocks the run outright; an
    /// active switch older than the threshold is auto-cleared and the run
    /// proceeds (§5).
    async fn kill_switch_blocks(&mut self, campaign: &Campaign) -> bool {
        if !self.runner.collector().kill_switch_active().await {
            self.kill_switch_since = None;
            return false;
        }
        let since = *self.kill_switch_since.get_or_insert_with(std::time::Instant::now);
        if since.elapsed() > KILL_SWITCH_STALE_THRESHOLD {
            warn!(
                "campaign_runner::scheduler::kill_switch_blocks(...): kill switch stale for over 6h, auto-clearing and proceeding with {}",
                campaign.id
            );
            if let Err(e) = self.runner.collector().clear_kill_switch().await {
                error!("campaign_runner::scheduler::kill_switch_blocks(...): failed to auto-clear: {e}");
            }
            self.kill_switch_since = None;
            false
        } else {
            info!("campaign_runner::scheduler::kill_switch_blocks(...): kill switch active, refusing run of {}", campaign.id);
            true
        }
    }
}

/// `isDue` rules (§4.3).
fn is_due(campaign: &Campaign, now: chrono::DateTime<Utc>) -> bool {
    if !campaign.trigger.depends_on.is_empty() {
        return false;
    }
    if campaign.trigger.event == "push" || campaign.trigger.event == "pull_request" {
        return false;
    }
    if campaign.trigger.schedule.is_empty() {
        return false;
    }
    crate::cron::matches(&campaign.trigger.schedule, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeedbackPolicy, Guardrails, Metrics, Outputs, Target, Trigger};

    fn campaign_with(schedule: &str, event: &str, depends_on: &[&str]) -> Campaign {
        Campaign {
            id: "c".into(),
            name: String::new(),
            description: String::new(),
            agent: "gateway-direct".into(),
            trigger: Trigger {
                schedule: schedule.into(),
                event: event.into(),
                depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
                path_filters: vec![],
            },
            targets: vec![Target { forge: "github".into(), org: "acme".into(), repo: "w".into(), branch: String::new() }],
            tools: vec![],
            process: vec![],
            outputs: Outputs::default(),
            guardrails: Guardrails::default(),
            feedback: FeedbackPolicy::default(),
            metrics: Metrics::default(),
        }
    }

    #[test]
    fn manual_only_campaign_is_never_due() {
        let c = campaign_with("", "manual", &[]);
        assert!(!is_due(&c, Utc::now()));
    }

    #[test]
    fn webhook_events_are_not_cron_due() {
        let c = campaign_with("0 4 * * *", "push", &[]);
        assert!(!is_due(&c, Utc::now()));
    }

    #[test]
    fn dependent_campaign_is_never_cron_due() {
        let c = campaign_with("* * * * *", "", &["other"]);
        assert!(!is_due(&c, Utc::now()));
    }

    #[test]
    fn scheduled_campaign_defers_to_cron_matcher() {
        let due_time = chrono::DateTime::parse_from_rfc3339("2026-03-01T04:00:00Z").unwrap().with_timezone(&Utc);
        let c = campaign_with("0 4 * * *", "", &[]);
        assert!(is_due(&c, due_time));
    }
}
