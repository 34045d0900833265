//! Broadcast execution — turning a due broadcast campaign into
//! one-shot delivery jobs, executing those jobs, and finalizing the
//! run once every job is terminal.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use dripflow_core::{Campaign, CampaignStatus, JobStatus, Result, ScheduledMessage};
use dripflow_gateway::{DeliveryError, DeliveryGateway};
use dripflow_state::ClaimService;
use dripflow_store::Store;

use crate::clock;
use crate::enroll;
use crate::throttle::ThrottleController;

/// What happened to one job this tick.
#[derive(Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Sent,
    Failed,
    Cancelled,
    /// Rescheduled for a later tick.
    Deferred,
    /// Lost the status race or the campaign is paused.
    Skipped,
}

/// Runs broadcast campaigns through their job pipeline.
pub struct BroadcastRunner {
    store: Arc<Store>,
    gateway: Arc<dyn DeliveryGateway>,
    throttle: ThrottleController,
}

impl BroadcastRunner {
    pub fn new(
        store: Arc<Store>,
        gateway: Arc<dyn DeliveryGateway>,
        throttle: ThrottleController,
    ) -> Self {
        Self {
            store,
            gateway,
            throttle,
        }
    }

    /// Fire a due broadcast: evaluate the audience once and create
    /// one pending job per matched lead. The caller holds the
    /// campaign claim.
    pub fn trigger(&self, campaign: &Campaign, now: DateTime<Utc>) -> Result<bool> {
        let Some((flow_id, _)) = broadcast_parts(campaign) else {
            self.store
                .record_run_error(&campaign.id, "campaign is not a broadcast")?;
            return Ok(false);
        };
        if !self
            .store
            .transition_campaign(&campaign.id, CampaignStatus::Scheduled, CampaignStatus::Running)?
        {
            return Ok(false);
        }

        let audience: Vec<_> = self
            .store
            .active_leads(&campaign.bot_id)?
            .into_iter()
            .filter(|lead| enroll::matches(&campaign.filter, lead, now))
            .collect();

        let jobs: Vec<ScheduledMessage> = audience
            .iter()
            .map(|lead| {
                ScheduledMessage::new(
                    &campaign.user_id,
                    &campaign.bot_id,
                    &lead.id,
                    flow_id,
                    &campaign.id,
                    now,
                )
            })
            .collect();
        self.store.insert_jobs(&jobs)?;
        self.store.start_run(&campaign.id, now, jobs.len() as u64)?;
        tracing::info!(
            "📣 broadcast {} fired: {} leads targeted",
            campaign.name,
            jobs.len()
        );

        if jobs.is_empty() {
            self.try_finalize(campaign, now)?;
        }
        Ok(true)
    }

    /// Close the current run when its jobs have drained: fold the
    /// outcomes into the campaign, re-arm recurring schedules or
    /// complete the campaign.
    pub fn try_finalize(&self, campaign: &Campaign, now: DateTime<Utc>) -> Result<bool> {
        if self.store.open_job_count(&campaign.id)? > 0 {
            return Ok(false);
        }
        let Some((run_id, run_date, targeted)) = self.store.open_run(&campaign.id)? else {
            return Ok(false);
        };

        let mut outcomes = self.store.job_outcomes_since(&campaign.id, run_date)?;
        outcomes.targeted = targeted;
        self.store.finish_run(run_id, &campaign.id, &outcomes)?;

        let next = broadcast_parts(campaign)
            .and_then(|(_, schedule)| clock::next_run(schedule, now));
        self.store.set_next_run(&campaign.id, next)?;
        let to = if next.is_some() {
            CampaignStatus::Scheduled
        } else {
            CampaignStatus::Completed
        };
        self.store
            .transition_campaign(&campaign.id, CampaignStatus::Running, to)?;
        tracing::info!(
            "broadcast {} run closed: {}/{} delivered, next run {:?}",
            campaign.name,
            outcomes.succeeded,
            outcomes.targeted,
            next
        );
        Ok(true)
    }

    /// Deliver one due job. The caller holds the job claim; the
    /// pending→processing transition is the second line of defense.
    pub async fn execute_job(
        &self,
        campaign: &Campaign,
        job: &ScheduledMessage,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome> {
        if matches!(
            campaign.status,
            CampaignStatus::Paused | CampaignStatus::Draft
        ) {
            return Ok(JobOutcome::Skipped);
        }
        if !self
            .store
            .transition_job(&job.id, JobStatus::Pending, JobStatus::Processing)?
        {
            return Ok(JobOutcome::Skipped);
        }

        let lead = match self.store.get_lead(&job.lead_id)? {
            Some(lead) => lead,
            None => {
                self.store.mark_job_failed(&job.id, "lead record missing")?;
                return Ok(JobOutcome::Failed);
            }
        };
        if !lead.is_active {
            self.store.mark_job_cancelled(&job.id, "lead inactive")?;
            return Ok(JobOutcome::Cancelled);
        }
        let Some(flow) = self.store.get_flow(&job.flow_id)? else {
            self.store
                .mark_job_failed(&job.id, &format!("flow {} not found", job.flow_id))?;
            return Ok(JobOutcome::Failed);
        };
        let Some(bot) = self.store.get_bot(&job.bot_id)? else {
            self.store
                .mark_job_failed(&job.id, &format!("bot {} not found", job.bot_id))?;
            return Ok(JobOutcome::Failed);
        };

        match self.gateway.send_flow(&bot, &lead, &flow).await {
            Ok(_) => {
                self.store.mark_job_sent(&job.id, now)?;
                self.store.touch_lead_interaction(&lead.id, now)?;
                self.throttle
                    .clear_attempts(&ClaimService::job_key(&job.id))
                    .await?;
                Ok(JobOutcome::Sent)
            }
            Err(err @ DeliveryError::Unreachable { .. }) => {
                self.store.mark_lead_inactive(&lead.id)?;
                // The error text prefix is what run finalization
                // counts as "blocked".
                self.store.mark_job_failed(&job.id, &err.to_string())?;
                Ok(JobOutcome::Failed)
            }
            Err(DeliveryError::RateLimited { retry_after_secs }) => {
                self.throttle
                    .start_cooldown(&job.bot_id, retry_after_secs)
                    .await?;
                self.defer_job(job, now, Some(retry_after_secs)).await
            }
            Err(DeliveryError::Transient(reason)) => {
                tracing::debug!("job {}: transient failure: {reason}", job.id);
                self.defer_job(job, now, None).await
            }
        }
    }

    async fn defer_job(
        &self,
        job: &ScheduledMessage,
        now: DateTime<Utc>,
        retry_after_secs: Option<u64>,
    ) -> Result<JobOutcome> {
        let unit_key = ClaimService::job_key(&job.id);
        let attempts = self.throttle.record_attempt(&unit_key).await?;
        if self.throttle.attempts_exhausted(attempts) {
            self.store
                .mark_job_failed(&job.id, &format!("gave up after {attempts} attempts"))?;
            return Ok(JobOutcome::Failed);
        }
        let backoff = self.throttle.backoff(attempts).as_secs();
        let wait = backoff.max(retry_after_secs.unwrap_or(0));
        self.store
            .reschedule_job(&job.id, now + Duration::seconds(wait as i64), attempts)?;
        Ok(JobOutcome::Deferred)
    }
}

fn broadcast_parts(campaign: &Campaign) -> Option<(&str, &dripflow_core::Schedule)> {
    match &campaign.kind {
        dripflow_core::CampaignKind::Broadcast { flow_id, schedule } => {
            Some((flow_id, schedule))
        }
        dripflow_core::CampaignKind::Sequence { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockGateway, bot, flow, lead};
    use dripflow_core::{CampaignKind, RetryConfig, Schedule, ScheduleKind};
    use dripflow_state::MemoryState;

    struct Fixture {
        store: Arc<Store>,
        gateway: Arc<MockGateway>,
        runner: BroadcastRunner,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let gateway = Arc::new(MockGateway::new());
        let throttle = ThrottleController::new(Arc::new(MemoryState::new()), RetryConfig::default());
        let runner = BroadcastRunner::new(store.clone(), gateway.clone(), throttle);
        Fixture {
            store,
            gateway,
            runner,
        }
    }

    fn broadcast_campaign(kind: ScheduleKind, start: DateTime<Utc>) -> Campaign {
        let mut campaign = Campaign::new(
            "u1",
            "b1",
            "blast",
            CampaignKind::Broadcast {
                flow_id: "f1".into(),
                schedule: Schedule {
                    kind,
                    start_date: start,
                    end_date: None,
                    time_of_day: Some("09:00".into()),
                    days_of_week: vec![],
                    timezone: "UTC".into(),
                },
            },
        );
        campaign.status = CampaignStatus::Scheduled;
        campaign
    }

    #[test]
    fn test_trigger_creates_jobs_for_matched_audience() {
        let fx = fixture();
        let now = Utc::now();
        fx.store.save_bot(&bot("b1")).unwrap();
        fx.store.save_flow(&flow("f1")).unwrap();
        let mut vip = lead("l1", "b1");
        vip.tags.push("vip".into());
        fx.store.save_lead(&vip).unwrap();
        fx.store.save_lead(&lead("l2", "b1")).unwrap();

        let mut campaign = broadcast_campaign(ScheduleKind::Once, now - Duration::hours(1));
        campaign.filter.tags = vec!["vip".into()];
        fx.store.save_campaign(&campaign).unwrap();

        assert!(fx.runner.trigger(&campaign, now).unwrap());
        let due = fx.store.due_jobs(now, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].lead_id, "l1");

        let loaded = fx.store.get_campaign(&campaign.id).unwrap().unwrap();
        assert_eq!(loaded.status, CampaignStatus::Running);
        assert_eq!(loaded.stats.targeted, 1);
    }

    #[test]
    fn test_trigger_loses_status_race() {
        let fx = fixture();
        let now = Utc::now();
        let mut campaign = broadcast_campaign(ScheduleKind::Once, now);
        campaign.status = CampaignStatus::Running;
        fx.store.save_campaign(&campaign).unwrap();

        // Already running: the conditional transition refuses.
        assert!(!fx.runner.trigger(&campaign, now).unwrap());
    }

    #[tokio::test]
    async fn test_job_lifecycle_sent() {
        let fx = fixture();
        let now = Utc::now();
        fx.store.save_bot(&bot("b1")).unwrap();
        fx.store.save_flow(&flow("f1")).unwrap();
        fx.store.save_lead(&lead("l1", "b1")).unwrap();
        let mut campaign = broadcast_campaign(ScheduleKind::Once, now);
        campaign.status = CampaignStatus::Running;
        fx.store.save_campaign(&campaign).unwrap();

        let job = ScheduledMessage::new("u1", "b1", "l1", "f1", &campaign.id, now);
        fx.store.insert_job(&job).unwrap();

        let outcome = fx.runner.execute_job(&campaign, &job, now).await.unwrap();
        assert_eq!(outcome, JobOutcome::Sent);
        assert_eq!(fx.gateway.sent_count(), 1);
        assert_eq!(
            fx.store.get_job(&job.id).unwrap().unwrap().status,
            JobStatus::Sent
        );

        // A second executor loses the pending→processing race.
        let outcome = fx.runner.execute_job(&campaign, &job, now).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_unreachable_job_blocks_lead() {
        let fx = fixture();
        let now = Utc::now();
        fx.store.save_bot(&bot("b1")).unwrap();
        fx.store.save_flow(&flow("f1")).unwrap();
        fx.store.save_lead(&lead("l1", "b1")).unwrap();
        let mut campaign = broadcast_campaign(ScheduleKind::Once, now);
        campaign.status = CampaignStatus::Running;
        fx.store.save_campaign(&campaign).unwrap();
        fx.gateway.push_err(DeliveryError::Unreachable {
            reason: "chat not found".into(),
        });

        let job = ScheduledMessage::new("u1", "b1", "l1", "f1", &campaign.id, now);
        fx.store.insert_job(&job).unwrap();

        let outcome = fx.runner.execute_job(&campaign, &job, now).await.unwrap();
        assert_eq!(outcome, JobOutcome::Failed);
        assert!(!fx.store.get_lead("l1").unwrap().unwrap().is_active);
        let stored = fx.store.get_job(&job.id).unwrap().unwrap();
        assert!(stored.error.unwrap().starts_with("recipient unreachable"));
    }

    #[tokio::test]
    async fn test_rate_limited_job_reschedules() {
        let fx = fixture();
        let now = Utc::now();
        fx.store.save_bot(&bot("b1")).unwrap();
        fx.store.save_flow(&flow("f1")).unwrap();
        fx.store.save_lead(&lead("l1", "b1")).unwrap();
        let mut campaign = broadcast_campaign(ScheduleKind::Once, now);
        campaign.status = CampaignStatus::Running;
        fx.store.save_campaign(&campaign).unwrap();
        fx.gateway
            .push_err(DeliveryError::RateLimited { retry_after_secs: 45 });

        let job = ScheduledMessage::new("u1", "b1", "l1", "f1", &campaign.id, now);
        fx.store.insert_job(&job).unwrap();

        let outcome = fx.runner.execute_job(&campaign, &job, now).await.unwrap();
        assert_eq!(outcome, JobOutcome::Deferred);
        let stored = fx.store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert!(stored.scheduled_time >= now + Duration::seconds(45));
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_finalize_rearms_daily_and_completes_once() {
        let fx = fixture();
        let now = Utc::now();
        fx.store.save_bot(&bot("b1")).unwrap();
        fx.store.save_flow(&flow("f1")).unwrap();
        fx.store.save_lead(&lead("l1", "b1")).unwrap();

        // Daily campaign: finalization re-arms for tomorrow.
        let daily = {
            let mut c = broadcast_campaign(ScheduleKind::Daily, now - Duration::days(1));
            fx.store.save_campaign(&c).unwrap();
            fx.runner.trigger(&c, now).unwrap();
            c.status = CampaignStatus::Running;
            c
        };
        for job in fx.store.due_jobs(now, 10).unwrap() {
            fx.runner.execute_job(&daily, &job, now).await.unwrap();
        }
        assert!(fx.runner.try_finalize(&daily, now).unwrap());
        let loaded = fx.store.get_campaign(&daily.id).unwrap().unwrap();
        assert_eq!(loaded.status, CampaignStatus::Scheduled);
        assert!(loaded.stats.next_run.unwrap() > now);
        assert_eq!(loaded.stats.succeeded, 1);
        fx.store.delete_campaign(&daily.id).unwrap();

        // Once campaign: no next run, campaign completes.
        fx.store.save_lead(&lead("l1", "b1")).unwrap();
        let once = {
            let mut c = broadcast_campaign(ScheduleKind::Once, now - Duration::hours(1));
            fx.store.save_campaign(&c).unwrap();
            fx.runner.trigger(&c, now).unwrap();
            c.status = CampaignStatus::Running;
            c
        };
        for job in fx.store.due_jobs(now, 10).unwrap() {
            fx.runner.execute_job(&once, &job, now).await.unwrap();
        }
        assert!(fx.runner.try_finalize(&once, now).unwrap());
        let loaded = fx.store.get_campaign(&once.id).unwrap().unwrap();
        assert_eq!(loaded.status, CampaignStatus::Completed);
        assert!(loaded.stats.next_run.is_none());
    }

    #[test]
    fn test_finalize_waits_for_open_jobs() {
        let fx = fixture();
        let now = Utc::now();
        fx.store.save_bot(&bot("b1")).unwrap();
        fx.store.save_flow(&flow("f1")).unwrap();
        fx.store.save_lead(&lead("l1", "b1")).unwrap();
        let mut campaign = broadcast_campaign(ScheduleKind::Once, now - Duration::hours(1));
        fx.store.save_campaign(&campaign).unwrap();
        fx.runner.trigger(&campaign, now).unwrap();
        campaign.status = CampaignStatus::Running;

        // A pending job keeps the run open.
        assert!(!fx.runner.try_finalize(&campaign, now).unwrap());
    }
}
