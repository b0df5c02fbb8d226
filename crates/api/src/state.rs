//! Shared application state for the Axum API server.

use std::sync::Arc;

use postbox_engine::campaign::CampaignService;
use postbox_engine::producer::EmailProducer;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub emails: Arc<EmailProducer>,
    pub campaigns: Arc<CampaignService>,
}

impl AppState {
    pub fn new(emails: Arc<EmailProducer>, campaigns: Arc<CampaignService>) -> Self {
        Self { emails, campaigns }
    }
}
