//! Campaign scheduler: a cancellable periodic task that fans out due campaigns.
//!
//! Ticks once immediately on start, then every minute. Within a tick, due
//! campaigns are processed oldest schedule first; one campaign failing is
//! logged and does not hold up the rest. Shutdown is observed between ticks
//! and between campaigns.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use postbox_engine::campaign::CampaignService;

use crate::directory::RecipientDirectory;

pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

pub struct CampaignScheduler {
    campaigns: Arc<CampaignService>,
    directory: Arc<dyn RecipientDirectory>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CampaignScheduler {
    pub fn new(campaigns: Arc<CampaignService>, directory: Arc<dyn RecipientDirectory>) -> Self {
        Self {
            campaigns,
            directory,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the timer loop. Calling it again while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }

        *handle = Some(tokio::spawn(self.clone().run()));
        tracing::info!(
            interval_secs = POLL_INTERVAL.as_secs(),
            "Campaign scheduler started"
        );
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Campaign scheduler task panicked");
            }
        }

        tracing::info!("Campaign scheduler stopped");
    }

    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.process_pending_campaigns(&self.cancel).await;
                }
            }
        }
    }

    /// Process every campaign due now. Returns how many were processed.
    ///
    /// The user population is only resolved if some due campaign is not in
    /// test mode, and at most once per call.
    pub async fn process_pending_campaigns(&self, cancel: &CancellationToken) -> usize {
        let due = match self.campaigns.get_pending_campaigns(Utc::now()).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to fetch pending campaigns");
                return 0;
            }
        };

        if due.is_empty() {
            tracing::debug!("No campaigns due");
            return 0;
        }

        tracing::info!(count = due.len(), "Processing due campaigns");

        let mut user_emails: Option<Vec<String>> = None;
        let mut processed = 0;

        for campaign in &due {
            if cancel.is_cancelled() {
                tracing::info!("Shutdown requested, leaving remaining campaigns for later");
                break;
            }

            if !campaign.is_test_mode() && user_emails.is_none() {
                match self.directory.all_user_emails().await {
                    Ok(emails) => {
                        tracing::debug!(count = emails.len(), "Resolved user emails");
                        user_emails = Some(emails);
                    }
                    Err(e) => {
                        tracing::error!(
                            campaign_id = %campaign.id,
                            error = %e,
                            "Failed to resolve user emails, campaign left pending"
                        );
                        continue;
                    }
                }
            }

            let recipients = user_emails.as_deref().unwrap_or_default();
            match self.campaigns.process_campaign(campaign, recipients).await {
                Ok(outcome) => {
                    processed += 1;
                    tracing::debug!(
                        campaign_id = %campaign.id,
                        status = %outcome.status,
                        "Campaign fan-out finished"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        campaign_id = %campaign.id,
                        error = %e,
                        "Failed to process campaign"
                    );
                }
            }
        }

        processed
    }
}
