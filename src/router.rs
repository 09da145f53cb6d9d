//! Finding router: matches findings against routing rules and attaches
//! handoff metadata destined for a target agent (§4.10).

use crate::model::{Campaign, Finding, HandoffMetadata, RoutedFinding};
use chrono::Utc;
use sha2::{Digest, Sha256};

pub const SECURITY_AGENT: &str = "security-agent";
pub const GENERAL_AGENT: &str = "general-agent";
pub const UPSTREAM_AGENT: &str = "upstream-agent";

const RJ_META_PREFIX: &str = "<!-- rj-meta\n";
const RJ_META_SUFFIX: &str = "\n-->";

struct Rule {
    source_agent: Option<&'static str>,
    severities: &'static [&'static str],
    label_substring: Option<&'static str>,
    campaign_prefix: Option<&'static str>,
    target: &'static str,
    labels: &'static [&'static str],
}

const RULES: &[Rule] = &[
    Rule {
        source_agent: None,
        severities: &["critical", "high"],
        label_substring: Some("security"),
        campaign_prefix: None,
        target: SECURITY_AGENT,
        labels: &["handoff:security-agent", "severity:high"],
    },
    Rule {
        source_agent: None,
        severities: &[],
        label_substring: Some("credential"),
        campaign_prefix: None,
        target: SECURITY_AGENT,
        labels: &["handoff:security-agent"],
    },
    Rule {
        source_agent: Some(SECURITY_AGENT),
        severities: &[],
        label_substring: Some("code-quality"),
        campaign_prefix: None,
        target: GENERAL_AGENT,
        labels: &["handoff:general-agent"],
    },
    Rule {
        source_agent: None,
        severities: &[],
        label_substring: Some("dependency"),
        campaign_prefix: None,
        target: GENERAL_AGENT,
        labels: &["handoff:general-agent"],
    },
    Rule {
        source_agent: None,
        severities: &[],
        label_substring: None,
        campaign_prefix: Some("xa-upstream"),
        target: UPSTREAM_AGENT,
        labels: &["handoff:upstream-agent"],
    },
];

fn rule_matches(rule: &Rule, campaign: &Campaign, finding: &Finding) -> bool {
    if let Some(src) = rule.source_agent {
        if campaign.agent != src {
            return false;
        }
    }
    if !rule.severities.is_empty() && !rule.severities.contains(&finding.severity.as_str()) {
        return false;
    }
    if let Some(sub) = rule.label_substring {
        if !finding.labels.iter().any(|l| l.contains(sub)) {
            return false;
        }
    }
    if let Some(prefix) = rule.campaign_prefix {
        if !campaign.id.starts_with(prefix) {
            return false;
        }
    }
    true
}

/// Derives a fingerprint for a finding missing one: SHA-256 over
/// `"<campaign-id>:<title>"`, hex-encoded.
pub fn derive_fingerprint(campaign_id: &str, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{campaign_id}:{title}").as_bytes());
    hex::encode(hasher.finalize())
}

/// Routes every finding in `findings` against the priority-ordered rule
/// table, first match wins. Non-matching findings are dropped.
pub fn route(campaign: &Campaign, findings: &[Finding]) -> Vec<RoutedFinding> {
    let mut routed = Vec::new();
    for finding in findings {
        let Some(rule) = RULES.iter().find(|r| rule_matches(r, campaign, finding)) else {
            continue;
        };

        let fingerprint = if finding.fingerprint.is_empty() {
            derive_fingerprint(&campaign.id, &finding.title)
        } else {
            finding.fingerprint.clone()
        };

        let handoff = HandoffMetadata {
            protocol_version: "1".to_string(),
            from: campaign.agent.clone(),
            to: rule.target.to_string(),
            message_type: "handoff".to_string(),
            priority: finding.severity.clone(),
            fingerprint,
            campaign_id: campaign.id.clone(),
            run_id: finding.run_id.clone(),
            timestamp: Utc::now(),
            action_requested: "review".to_string(),
            context: Default::default(),
        };

        routed.push(RoutedFinding {
            finding: finding.clone(),
            target_agent: rule.target.to_string(),
            labels: rule.labels.iter().map(|s| s.to_string()).collect(),
            handoff,
        });
    }
    routed
}

/// Formats a handoff metadata block as `<!-- rj-meta\n<indented JSON>\n-->`.
pub fn format_rj_meta(meta: &HandoffMetadata) -> String {
    let json = serde_json::to_string_pretty(meta).unwrap_or_default();
    format!("{RJ_META_PREFIX}{json}{RJ_META_SUFFIX}")
}

/// Extracts and parses the first `rj-meta` HTML comment block from free-form text.
pub fn parse_rj_meta(text: &str) -> Option<HandoffMetadata> {
    let start = text.find(RJ_META_PREFIX)? + RJ_META_PREFIX.len();
    let end = text[start..].find(RJ_META_SUFFIX)? + start;
    serde_json::from_str(&text[start..end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeedbackPolicy, Guardrails, Metrics, Outputs, RemediationHints, Trigger};

    fn campaign(id: &str, agent: &str) -> Campaign {
        Campaign {
            id: id.into(),
            name: String::new(),
            description: String::new(),
            agent: agent.into(),
            trigger: Trigger::default(),
            targets: vec![],
            tools: vec![],
            process: vec![],
            outputs: Outputs::default(),
            guardrails: Guardrails::default(),
            feedback: FeedbackPolicy::default(),
            metrics: Metrics::default(),
        }
    }

    fn finding(severity: &str, labels: &[&str]) -> Finding {
        Finding {
            title: "X".into(),
            body: String::new(),
            severity: severity.into(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            campaign_id: "c".into(),
            run_id: "c-1".into(),
            fingerprint: String::new(),
            fixable: false,
            remediation_type: String::new(),
            remediation_hints: RemediationHints::default(),
        }
    }

    #[test]
    fn high_severity_security_finding_routes_to_security_agent() {
        let c = campaign("sweep", "generalist");
        let f = finding("high", &["security"]);
        let routed = route(&c, &[f]);
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].target_agent, SECURITY_AGENT);
        assert!(routed[0].labels.contains(&"severity:high".to_string()));
    }

    #[test]
    fn credential_label_routes_regardless_of_severity() {
        let c = campaign("sweep", "generalist");
        let f = finding("low", &["credential-leak"]);
        let routed = route(&c, &[f]);
        assert_eq!(routed[0].target_agent, SECURITY_AGENT);
    }

    #[test]
    fn security_agent_code_quality_routes_to_general_agent() {
        let c = campaign("sweep", SECURITY_AGENT);
        let f = finding("medium", &["code-quality"]);
        let routed = route(&c, &[f]);
        assert_eq!(routed[0].target_agent, GENERAL_AGENT);
    }

    #[test]
    fn xa_upstream_prefix_routes_to_upstream_agent() {
        let c = campaign("xa-upstream-sync", "generalist");
        let f = finding("low", &[]);
        let routed = route(&c, &[f]);
        assert_eq!(routed[0].target_agent, UPSTREAM_AGENT);
    }

    #[test]
    fn non_matching_finding_is_dropped() {
        let c = campaign("sweep", "generalist");
        let f = finding("low", &["unrelated"]);
        assert!(route(&c, &[f]).is_empty());
    }

    #[test]
    fn rj_meta_round_trips() {
        let meta = HandoffMetadata {
            protocol_version: "1".into(),
            from: "generalist".into(),
            to: SECURITY_AGENT.into(),
            message_type: "handoff".into(),
            priority: "high".into(),
            fingerprint: "abc123".into(),
            campaign_id: "sweep".into(),
            run_id: "sweep-1".into(),
            timestamp: Utc::now(),
            action_requested: "review".into(),
            context: Default::default(),
        };
        let formatted = format_rj_meta(&meta);
        let parsed = parse_rj_meta(&formatted).expect("should parse back");
        assert_eq!(parsed.fingerprint, meta.fingerprint);
        assert_eq!(parsed.to, meta.to);
    }

    #[test]
    fn fingerprint_derivation_is_deterministic() {
        let a = derive_fingerprint("sweep", "X");
        let b = derive_fingerprint("sweep", "X");
        assert_eq!(a, b);
        assert_ne!(a, derive_fingerprint("sweep", "Y"));
    }
}
