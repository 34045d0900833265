//! Campaign operations — the surface an external CRUD layer calls:
//! lifecycle changes, manual enrollment, progress queries and the
//! odd maintenance job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use dripflow_core::{
    Campaign, CampaignStats, CampaignStatus, DripflowError, Result, ScheduleKind,
};
use dripflow_gateway::DeliveryGateway;
use dripflow_store::Store;

use crate::clock;
use crate::enroll::Enroller;

/// Aggregate view of where a campaign's leads stand.
#[derive(Debug, Serialize)]
pub struct ProgressSummary {
    pub total: u64,
    pub active: u64,
    pub completed: u64,
    pub per_step: Vec<StepCount>,
}

#[derive(Debug, Serialize)]
pub struct StepCount {
    pub step_index: i32,
    pub leads: u64,
}

/// Campaign lifecycle and query operations.
pub struct CampaignService {
    store: Arc<Store>,
    gateway: Arc<dyn DeliveryGateway>,
    enroller: Enroller,
}

impl CampaignService {
    pub fn new(store: Arc<Store>, gateway: Arc<dyn DeliveryGateway>) -> Self {
        let enroller = Enroller::new(store.clone());
        Self {
            store,
            gateway,
            enroller,
        }
    }

    /// Validate and persist a new campaign, in draft.
    pub fn create_campaign(&self, mut campaign: Campaign) -> Result<Campaign> {
        campaign.validate()?;
        campaign.status = CampaignStatus::Draft;
        campaign.updated_at = Utc::now();
        self.store.save_campaign(&campaign)?;
        tracing::info!("campaign {} created ({})", campaign.name, campaign.id);
        Ok(campaign)
    }

    pub fn update_campaign(&self, mut campaign: Campaign) -> Result<Campaign> {
        campaign.validate()?;
        if self.store.get_campaign(&campaign.id)?.is_none() {
            return Err(DripflowError::NotFound(format!(
                "campaign {}",
                campaign.id
            )));
        }
        campaign.updated_at = Utc::now();
        self.store.save_campaign(&campaign)?;
        Ok(campaign)
    }

    /// Arm a campaign. Broadcasts get their first `next_run`; a
    /// `once` schedule fires at its start date even when that date
    /// has already passed.
    pub fn activate(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut campaign = self.get(id)?;
        campaign.validate()?;
        if let Some(schedule) = campaign.schedule() {
            campaign.stats.next_run = match schedule.kind {
                ScheduleKind::Once => Some(schedule.start_date),
                _ => clock::next_run(schedule, now),
            };
            if campaign.stats.next_run.is_none() {
                return Err(DripflowError::InvalidCampaign(
                    "schedule produces no future run".into(),
                ));
            }
        }
        campaign.status = CampaignStatus::Scheduled;
        campaign.updated_at = now;
        self.store.save_campaign(&campaign)?;
        tracing::info!("campaign {} activated", campaign.name);
        Ok(())
    }

    /// Pause: stops new enrollments and new dispatch. Claims
    /// already acquired finish on their own.
    pub fn pause(&self, id: &str) -> Result<()> {
        self.get(id)?;
        self.store.set_campaign_status(id, CampaignStatus::Paused)
    }

    pub fn set_active(&self, id: &str, active: bool, now: DateTime<Utc>) -> Result<()> {
        if active {
            self.activate(id, now)
        } else {
            self.pause(id)
        }
    }

    /// Cancel a campaign and bulk-cancel its pending jobs.
    pub fn cancel(&self, id: &str) -> Result<u64> {
        self.get(id)?;
        self.store.set_campaign_status(id, CampaignStatus::Cancelled)?;
        let cancelled = self.store.cancel_pending_jobs(id)?;
        tracing::info!("campaign {id} cancelled, {cancelled} pending jobs dropped");
        Ok(cancelled)
    }

    /// Delete a campaign; progress rows go with it, pending jobs
    /// are cancelled in place.
    pub fn delete_campaign(&self, id: &str) -> Result<()> {
        self.get(id)?;
        self.store.delete_campaign(id)?;
        tracing::info!("campaign {id} deleted");
        Ok(())
    }

    /// Manually enroll one lead, bypassing the audience filter but
    /// not the idempotency rule.
    pub fn enroll_lead(&self, campaign_id: &str, lead_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let campaign = self.get(campaign_id)?;
        let lead = self
            .store
            .get_lead(lead_id)?
            .ok_or_else(|| DripflowError::NotFound(format!("lead {lead_id}")))?;
        self.enroller.enroll(&campaign, &lead, now)
    }

    /// Drop one lead's progress and start them over from step 0.
    /// Returns false when the lead could not be re-enrolled (it has
    /// been retired in the meantime); the old progress is gone
    /// either way.
    pub fn reset_lead_progress(
        &self,
        campaign_id: &str,
        lead_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.store.delete_progress(lead_id, campaign_id)?;
        self.enroll_lead(campaign_id, lead_id, now)
    }

    pub fn progress_summary(&self, campaign_id: &str) -> Result<ProgressSummary> {
        self.get(campaign_id)?;
        let (total, active, completed) = self.store.progress_counts(campaign_id)?;
        let per_step = self
            .store
            .leads_per_step(campaign_id)?
            .into_iter()
            .map(|(step_index, leads)| StepCount { step_index, leads })
            .collect();
        Ok(ProgressSummary {
            total,
            active,
            completed,
            per_step,
        })
    }

    pub fn stats(&self, campaign_id: &str) -> Result<CampaignStats> {
        Ok(self.get(campaign_id)?.stats)
    }

    /// Send one flow to one lead right now, outside any campaign.
    pub async fn test_send(&self, bot_id: &str, flow_id: &str, lead_id: &str) -> Result<()> {
        let bot = self
            .store
            .get_bot(bot_id)?
            .ok_or_else(|| DripflowError::NotFound(format!("bot {bot_id}")))?;
        let flow = self
            .store
            .get_flow(flow_id)?
            .ok_or_else(|| DripflowError::NotFound(format!("flow {flow_id}")))?;
        let lead = self
            .store
            .get_lead(lead_id)?
            .ok_or_else(|| DripflowError::NotFound(format!("lead {lead_id}")))?;
        self.gateway
            .send_flow(&bot, &lead, &flow)
            .await
            .map_err(|e| DripflowError::Gateway(e.to_string()))?;
        Ok(())
    }

    /// Stop every lead still moving through a campaign's sequence.
    pub fn pause_all_leads(&self, campaign_id: &str) -> Result<u64> {
        self.get(campaign_id)?;
        self.store.complete_all_progress(campaign_id)
    }

    /// Stamp a tag on every lead that finished the sequence.
    pub fn tag_completed_leads(&self, campaign_id: &str, tag: &str) -> Result<u64> {
        self.get(campaign_id)?;
        let mut tagged = 0;
        for lead_id in self.store.completed_lead_ids(campaign_id)? {
            if let Some(mut lead) = self.store.get_lead(&lead_id)?
                && !lead.has_tag(tag)
            {
                lead.tags.push(tag.to_string());
                self.store.save_lead(&lead)?;
                tagged += 1;
            }
        }
        Ok(tagged)
    }

    fn get(&self, id: &str) -> Result<Campaign> {
        self.store
            .get_campaign(id)?
            .ok_or_else(|| DripflowError::NotFound(format!("campaign {id}")))
    }
}
