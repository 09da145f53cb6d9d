use campaign_runner::api::{self, AppState, StatusObserver};
use campaign_runner::collector::Collector;
use campaign_runner::config::Config;
use campaign_runner::dispatcher::Dispatcher;
use campaign_runner::feedback::FeedbackHandler;
use campaign_runner::loader::{self, SharedRegistry};
use campaign_runner::publisher::Publisher;
use campaign_runner::scheduler::{Runner, Scheduler};
use campaign_runner::token_provider::TokenProvider;
use clap::Parser;
use log::{error, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const FORGE_API_BASE: &str = "https://api.github.com";

#[tokio::main]
async fn main() {
    env_logger::init();
    let config = Config::parse();

    let campaigns_dir = PathBuf::from(&config.campaigns_dir);
    let initial = match loader::load_registry(&campaigns_dir) {
        Ok(registry) => registry,
        Err(e) => {
            error!("campaign_runner::main(...): fatal: cannot load campaign index: {e}");
            std::process::exit(1);
        }
    };
    let registry = SharedRegistry::new(initial);
    registry.spawn_hot_reload(campaigns_dir);

    let dispatcher = Dispatcher::new(config.gateway_url.clone(), config.agent_url_map());
    let collector = Collector::new(config.gateway_url.clone());

    let initial_token = config.bearer_token.clone().unwrap_or_default();
    let mut runner = Runner::new(dispatcher, collector).with_feedback(FeedbackHandler::new(FORGE_API_BASE, initial_token.clone()));

    if let (Some(owner), Some(repo)) = (&config.forge_owner, &config.forge_repo) {
        match Publisher::new(owner.clone(), repo.clone(), initial_token.clone()) {
            Ok(publisher) => match publisher.init().await {
                Ok(()) => runner = runner.with_publisher(publisher),
                Err(e) => warn!("campaign_runner::main(...): publisher init failed, discussions disabled: {e}"),
            },
            Err(e) => warn!("campaign_runner::main(...): publisher construction failed, discussions disabled: {e}"),
        }
    }

    match config.resolve_private_key() {
        Ok(Some(pem)) => {
            if let Some(app_id) = &config.app_id {
                match TokenProvider::new(app_id.clone(), &pem, config.installation_id) {
                    Ok(provider) => runner = runner.with_token_provider(provider),
                    Err(e) => error!("campaign_runner::main(...): token provider construction failed: {e}"),
                }
            } else {
                warn!("campaign_runner::main(...): private key configured without an app id, skipping token provider");
            }
        }
        Ok(None) => {}
        Err(e) => error!("campaign_runner::main(...): {e}"),
    }

    let status_cache: Arc<RwLock<HashMap<String, campaign_runner::model::CampaignResult>>> = Arc::new(RwLock::new(HashMap::new()));
    runner = runner.with_observer(Arc::new(StatusObserver::new(status_cache.clone())));
    let runner = Arc::new(runner);

    if let Some(campaign_id) = &config.campaign {
        let mut scheduler = Scheduler::new(registry, runner);
        let success = scheduler.run_one(campaign_id).await;
        std::process::exit(if success { 0 } else { 1 });
    }

    if config.once {
        let mut scheduler = Scheduler::new(registry, runner);
        scheduler.run_due(chrono::Utc::now()).await;
        std::process::exit(0);
    }

    let mut scheduler = Scheduler::new(registry.clone(), runner.clone());
    let interval = Duration::from_secs(config.interval);

    if config.api_port != 0 {
        let state = AppState {
            registry,
            runner: runner.clone(),
            status_cache,
            webhook_secret: config.webhook_secret.clone(),
        };
        let port = config.api_port;
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, port).await {
                error!("campaign_runner::main(...): API server stopped: {e}");
            }
        });
    } else {
        info!("campaign_runner::main(...): api-port=0, API server disabled");
    }

    tokio::select! {
        _ = scheduler.run_forever(interval) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("campaign_runner::main(...): received shutdown signal, exiting");
        }
    }
}
