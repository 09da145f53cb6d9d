//! Result observer: a single callback the scheduler invokes after every
//! completed or refused run, so the API server can populate its `/status`
//! cache without the scheduler knowing anything about HTTP.

use crate::model::CampaignResult;
use async_trait::async_trait;

/// Receives a [`CampaignResult`] after each `RunCampaign` completes.
///
/// The default implementation is a no-op; the API server is the only
/// production implementor, registered via [`crate::scheduler::Scheduler::with_observer`].
#[async_trait]
pub trait ResultObserver: Send + Sync {
    async fn on_result(&self, _result: &CampaignResult) {}
}

/// An observer that does nothing, used when no API server is configured.
pub struct NullObserver;

#[async_trait]
impl ResultObserver for NullObserver {
    async fn on_result(&self, _result: &CampaignResult) {}
}
