//! Runtime configuration: CLI flags with environment-variable fallbacks for
//! credentials (§6). No file-based config layer — campaigns are data, not
//! settings, and are read by [`crate::loader`] instead.

use clap::Parser;
use std::collections::HashMap;

#[derive(Debug, Parser)]
#[command(name = "campaign-runner", about = "Autonomous agent campaign runner")]
pub struct Config {
    /// Directory containing index.json and the referenced campaign JSONs.
    #[arg(long, default_value = "/etc/campaigns")]
    pub campaigns_dir: String,

    /// Tool-gateway base URL (JSON-RPC endpoint).
    #[arg(long, env = "CAMPAIGN_RUNNER_GATEWAY_URL")]
    pub gateway_url: String,

    /// Agent sidecar URLs, one per supported agent: `--agent-url name=http://host:port`.
    #[arg(long = "agent-url", value_parser = parse_agent_url)]
    pub agent_urls: Vec<(String, String)>,

    /// Run `RunDue` once and exit.
    #[arg(long)]
    pub once: bool,

    /// Run a single campaign by id and exit.
    #[arg(long)]
    pub campaign: Option<String>,

    /// Scheduler cycle period in seconds.
    #[arg(long, default_value_t = 60)]
    pub interval: u64,

    /// HTTP API port; 0 disables the API server.
    #[arg(long, default_value_t = 8080)]
    pub api_port: u16,

    /// GitHub App id used to mint installation tokens.
    #[arg(long, env = "CAMPAIGN_RUNNER_APP_ID")]
    pub app_id: Option<String>,

    /// RSA private key, PEM content (not a path).
    #[arg(long, env = "CAMPAIGN_RUNNER_PRIVATE_KEY")]
    pub private_key_pem: Option<String>,

    /// RSA private key, path to a PEM file. Used when `private_key_pem` is absent.
    #[arg(long, env = "CAMPAIGN_RUNNER_PRIVATE_KEY_PATH")]
    pub private_key_path: Option<String>,

    /// Installation id; auto-discovered via the forge API when absent.
    #[arg(long, env = "CAMPAIGN_RUNNER_INSTALLATION_ID")]
    pub installation_id: Option<u64>,

    /// Opaque bearer token used when no app identity is configured.
    #[arg(long, env = "CAMPAIGN_RUNNER_BEARER_TOKEN")]
    pub bearer_token: Option<String>,

    /// Forge repository owner used by the publisher.
    #[arg(long, env = "CAMPAIGN_RUNNER_FORGE_OWNER")]
    pub forge_owner: Option<String>,

    /// Forge repository name used by the publisher.
    #[arg(long, env = "CAMPAIGN_RUNNER_FORGE_REPO")]
    pub forge_repo: Option<String>,

    /// Shared secret for webhook signature verification.
    #[arg(long, env = "CAMPAIGN_RUNNER_WEBHOOK_SECRET")]
    pub webhook_secret: Option<String>,
}

fn parse_agent_url(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(name, url)| (name.to_string(), url.to_string()))
        .ok_or_else(|| format!("expected name=url, got \"{s}\""))
}

impl Config {
    pub fn agent_url_map(&self) -> HashMap<String, String> {
        self.agent_urls.iter().cloned().collect()
    }

    /// Resolves the private key, preferring inline PEM content over a path.
    pub fn resolve_private_key(&self) -> Result<Option<Vec<u8>>, String> {
        if let Some(pem) = &self.private_key_pem {
            return Ok(Some(pem.as_bytes().to_vec()));
        }
        if let Some(path) = &self.private_key_path {
            return std::fs::read(path).map(Some).map_err(|e| format!("cannot read private key at {path}: {e}"));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_agent_url_flag() {
        assert_eq!(parse_agent_url("generalist=http://localhost:9001"), Ok(("generalist".to_string(), "http://localhost:9001".to_string())));
        assert!(parse_agent_url("no-equals-sign").is_err());
    }

    #[test]
    fn agent_url_map_builds_from_pairs() {
        let cfg = Config {
            campaigns_dir: "/etc/campaigns".into(),
            gateway_url: "http://gateway".into(),
            agent_urls: vec![("a".into(), "http://a".into()), ("b".into(), "http://b".into())],
            once: false,
            campaign: None,
            interval: 60,
            api_port: 8080,
            app_id: None,
            private_key_pem: None,
            private_key_path: None,
            installation_id: None,
            bearer_token: None,
            forge_owner: None,
            forge_repo: None,
            webhook_secret: None,
        };
        let map = cfg.agent_url_map();
        assert_eq!(map.get("a"), Some(&"http://a".to_string()));
        assert_eq!(map.len(), 2);
    }
}
