//! Poller/dispatcher — the periodic tick that finds due work,
//! claims it, gates it through the throttle, and hands it to the
//! advancement engine or the broadcast job pipeline.
//!
//! One unit's failure never aborts the tick; contended claims are
//! skipped silently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use dripflow_core::{Campaign, CampaignStatus, DispatcherConfig, Result, RetryConfig};
use dripflow_gateway::DeliveryGateway;
use dripflow_state::{ClaimService, SharedState};
use dripflow_store::Store;

use crate::advance::{AdvanceOutcome, SequenceAdvancer};
use crate::broadcast::{BroadcastRunner, JobOutcome};
use crate::enroll::Enroller;
use crate::throttle::ThrottleController;

/// What one tick accomplished.
#[derive(Debug, Default)]
pub struct TickReport {
    pub broadcasts_fired: u32,
    pub runs_finalized: u32,
    pub steps_sent: u32,
    pub jobs_sent: u32,
    pub deferred: u32,
    pub contended: u32,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.broadcasts_fired == 0
            && self.runs_finalized == 0
            && self.steps_sent == 0
            && self.jobs_sent == 0
            && self.deferred == 0
    }
}

/// The dispatcher: owns one tick's worth of orchestration.
pub struct Dispatcher {
    store: Arc<Store>,
    state: Arc<dyn SharedState>,
    claims: ClaimService,
    throttle: ThrottleController,
    advancer: SequenceAdvancer,
    broadcaster: BroadcastRunner,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        state: Arc<dyn SharedState>,
        gateway: Arc<dyn DeliveryGateway>,
        config: DispatcherConfig,
        retry: RetryConfig,
    ) -> Self {
        let claims = ClaimService::new(state.clone());
        let throttle = ThrottleController::new(state.clone(), retry);
        let advancer = SequenceAdvancer::new(store.clone(), gateway.clone(), throttle.clone());
        let broadcaster = BroadcastRunner::new(store.clone(), gateway, throttle.clone());
        Self {
            store,
            state,
            claims,
            throttle,
            advancer,
            broadcaster,
            config,
        }
    }

    fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.config.claim_ttl_secs)
    }

    /// One dispatcher tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        self.fire_due_broadcasts(now, &mut report).await?;
        self.finalize_drained_runs(now, &mut report).await?;
        self.advance_due_sequences(now, &mut report).await?;
        self.execute_due_jobs(now, &mut report).await?;

        if !report.is_idle() {
            let summary = format!(
                "broadcasts={} finalized={} steps={} jobs={} deferred={}",
                report.broadcasts_fired,
                report.runs_finalized,
                report.steps_sent,
                report.jobs_sent,
                report.deferred
            );
            self.state.push_log("dispatch", &summary).await?;
        }
        Ok(report)
    }

    async fn fire_due_broadcasts(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        for campaign in self.store.due_broadcasts(now, self.config.batch_size)? {
            let key = ClaimService::campaign_key(&campaign.id);
            let Some(token) = self.claims.try_claim(&key, self.claim_ttl()).await? else {
                report.contended += 1;
                continue;
            };
            match self.broadcaster.trigger(&campaign, now) {
                Ok(true) => report.broadcasts_fired += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("broadcast {} trigger failed: {e}", campaign.id),
            }
            self.claims.release(&key, &token).await?;
        }
        Ok(())
    }

    async fn finalize_drained_runs(
        &self,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        for campaign in self.store.running_broadcasts()? {
            let key = ClaimService::campaign_key(&campaign.id);
            let Some(token) = self.claims.try_claim(&key, self.claim_ttl()).await? else {
                continue;
            };
            match self.broadcaster.try_finalize(&campaign, now) {
                Ok(true) => report.runs_finalized += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("broadcast {} finalize failed: {e}", campaign.id),
            }
            self.claims.release(&key, &token).await?;
        }
        Ok(())
    }

    async fn advance_due_sequences(
        &self,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let mut campaigns: HashMap<String, Option<Campaign>> = HashMap::new();
        for mut progress in self.store.due_progress(now, self.config.batch_size)? {
            let campaign = match campaigns
                .entry(progress.campaign_id.clone())
                .or_insert_with(|| {
                    self.store
                        .get_campaign(&progress.campaign_id)
                        .ok()
                        .flatten()
                }) {
                Some(campaign) if dispatchable(campaign.status) => campaign.clone(),
                _ => continue,
            };

            if !self
                .throttle
                .has_budget(&campaign.bot_id, &campaign.throttling)
                .await?
            {
                continue;
            }

            let key =
                ClaimService::sequence_key(&progress.id, progress.last_step_index + 1);
            let Some(token) = self.claims.try_claim(&key, self.claim_ttl()).await? else {
                report.contended += 1;
                continue;
            };
            match self.advancer.advance(&campaign, &mut progress, now).await {
                Ok(AdvanceOutcome::Sent { .. }) => {
                    report.steps_sent += 1;
                    self.throttle.consume_slot(&campaign.bot_id).await?;
                    self.throttle.pace(&campaign.throttling).await;
                }
                Ok(AdvanceOutcome::Deferred) => report.deferred += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!("progress {} advance failed: {e}", progress.id),
            }
            self.claims.release(&key, &token).await?;
        }
        Ok(())
    }

    async fn execute_due_jobs(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        let mut campaigns: HashMap<String, Option<Campaign>> = HashMap::new();
        for job in self.store.due_jobs(now, self.config.batch_size)? {
            let Some(campaign) = campaigns
                .entry(job.campaign_id.clone())
                .or_insert_with(|| self.store.get_campaign(&job.campaign_id).ok().flatten())
                .clone()
            else {
                // Orphan job; its campaign is gone.
                self.store.mark_job_cancelled(&job.id, "campaign deleted")?;
                continue;
            };

            if !self
                .throttle
                .has_budget(&job.bot_id, &campaign.throttling)
                .await?
            {
                continue;
            }

            let key = ClaimService::job_key(&job.id);
            let Some(token) = self.claims.try_claim(&key, self.claim_ttl()).await? else {
                report.contended += 1;
                continue;
            };
            match self.broadcaster.execute_job(&campaign, &job, now).await {
                Ok(JobOutcome::Sent) => {
                    report.jobs_sent += 1;
                    self.throttle.consume_slot(&job.bot_id).await?;
                    self.throttle.pace(&campaign.throttling).await;
                }
                Ok(JobOutcome::Deferred) => report.deferred += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!("job {} execution failed: {e}", job.id),
            }
            self.claims.release(&key, &token).await?;
        }
        Ok(())
    }
}

fn dispatchable(status: CampaignStatus) -> bool {
    matches!(status, CampaignStatus::Scheduled | CampaignStatus::Running)
}

/// Run the dispatcher loop as a background tokio task.
pub fn spawn_dispatcher(dispatcher: Arc<Dispatcher>) -> tokio::task::JoinHandle<()> {
    let tick_secs = dispatcher.config.tick_secs;
    tokio::spawn(async move {
        tracing::info!("⏰ Dispatcher started (tick every {tick_secs}s)");
        let mut interval = tokio::time::interval(Duration::from_secs(tick_secs));
        loop {
            interval.tick().await;
            match dispatcher.tick(Utc::now()).await {
                Ok(report) if !report.is_idle() => {
                    tracing::info!(
                        "tick: {} broadcasts, {} steps, {} jobs, {} deferred",
                        report.broadcasts_fired,
                        report.steps_sent,
                        report.jobs_sent,
                        report.deferred
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!("dispatch tick failed: {e}"),
            }
        }
    })
}

/// Run the enrollment sweep as a background tokio task.
pub fn spawn_enrollment_sweep(
    enroller: Arc<Enroller>,
    sweep_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Enrollment sweep started (every {sweep_secs}s)");
        let mut interval = tokio::time::interval(Duration::from_secs(sweep_secs));
        loop {
            interval.tick().await;
            if let Err(e) = enroller.sweep(Utc::now()) {
                tracing::error!("enrollment sweep failed: {e}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockGateway, bot, flow, lead, sequence_campaign, step};
    use chrono::Duration as ChronoDuration;
    use dripflow_core::{CampaignKind, Schedule, ScheduleKind, TimeUnit};
    use dripflow_gateway::DeliveryError;
    use dripflow_state::MemoryState;

    struct Fixture {
        store: Arc<Store>,
        state: Arc<MemoryState>,
        gateway: Arc<MockGateway>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let state = Arc::new(MemoryState::new());
        let gateway = Arc::new(MockGateway::new());
        let dispatcher = Dispatcher::new(
            store.clone(),
            state.clone(),
            gateway.clone(),
            DispatcherConfig::default(),
            RetryConfig::default(),
        );
        Fixture {
            store,
            state,
            gateway,
            dispatcher,
        }
    }

    /// Sequence campaign with pacing disabled so ticks stay fast.
    fn fast_sequence(bot_id: &str, steps: Vec<dripflow_core::SequenceStep>) -> Campaign {
        let mut campaign = sequence_campaign(bot_id, steps);
        campaign.throttling.delay_between_messages = 0;
        campaign.status = CampaignStatus::Scheduled;
        campaign
    }

    fn seed_common(fx: &Fixture) {
        fx.store.save_bot(&bot("b1")).unwrap();
        fx.store.save_flow(&flow("f1")).unwrap();
        fx.store.save_flow(&flow("f2")).unwrap();
    }

    #[tokio::test]
    async fn test_tick_advances_due_sequence() {
        let fx = fixture();
        seed_common(&fx);
        fx.store.save_lead(&lead("l1", "b1")).unwrap();
        let campaign = fast_sequence("b1", vec![step("f1", 0, TimeUnit::Minutes)]);
        fx.store.save_campaign(&campaign).unwrap();
        let now = Utc::now();
        let progress =
            dripflow_core::SequenceProgress::new("l1", &campaign.id, now - ChronoDuration::minutes(1));
        fx.store.insert_progress_if_absent(&progress).unwrap();

        let report = fx.dispatcher.tick(now).await.unwrap();
        assert_eq!(report.steps_sent, 1);
        assert_eq!(fx.gateway.sent_count(), 1);
        let advanced = fx.store.get_progress("l1", &campaign.id).unwrap().unwrap();
        assert!(advanced.is_completed);

        let logs = fx.state.recent_logs("dispatch", 5).await.unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn test_paused_campaign_not_dispatched() {
        let fx = fixture();
        seed_common(&fx);
        fx.store.save_lead(&lead("l1", "b1")).unwrap();
        let mut campaign = fast_sequence("b1", vec![step("f1", 0, TimeUnit::Minutes)]);
        campaign.status = CampaignStatus::Paused;
        fx.store.save_campaign(&campaign).unwrap();
        let now = Utc::now();
        let progress =
            dripflow_core::SequenceProgress::new("l1", &campaign.id, now - ChronoDuration::minutes(1));
        fx.store.insert_progress_if_absent(&progress).unwrap();

        let report = fx.dispatcher.tick(now).await.unwrap();
        assert_eq!(report.steps_sent, 0);
        assert_eq!(fx.gateway.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_throttle_limits_sends_per_window() {
        let fx = fixture();
        seed_common(&fx);
        let mut campaign = fast_sequence("b1", vec![step("f1", 0, TimeUnit::Minutes)]);
        campaign.throttling.messages_per_minute = 1;
        fx.store.save_campaign(&campaign).unwrap();
        let now = Utc::now();
        for i in 0..3 {
            let l = lead(&format!("l{i}"), "b1");
            fx.store.save_lead(&l).unwrap();
            let progress = dripflow_core::SequenceProgress::new(
                &l.id,
                &campaign.id,
                now - ChronoDuration::minutes(1),
            );
            fx.store.insert_progress_if_absent(&progress).unwrap();
        }

        let report = fx.dispatcher.tick(now).await.unwrap();
        assert_eq!(report.steps_sent, 1);
        assert_eq!(fx.gateway.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_claimed_unit_is_skipped() {
        let fx = fixture();
        seed_common(&fx);
        fx.store.save_lead(&lead("l1", "b1")).unwrap();
        let campaign = fast_sequence("b1", vec![step("f1", 0, TimeUnit::Minutes)]);
        fx.store.save_campaign(&campaign).unwrap();
        let now = Utc::now();
        let progress =
            dripflow_core::SequenceProgress::new("l1", &campaign.id, now - ChronoDuration::minutes(1));
        fx.store.insert_progress_if_absent(&progress).unwrap();

        // Another poller holds the step claim.
        let claims = ClaimService::new(fx.state.clone());
        let key = ClaimService::sequence_key(&progress.id, 0);
        let _token = claims
            .try_claim(&key, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let report = fx.dispatcher.tick(now).await.unwrap();
        assert_eq!(report.steps_sent, 0);
        assert_eq!(report.contended, 1);
        assert_eq!(fx.gateway.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_contended_claim_leaves_budget_for_next_unit() {
        let fx = fixture();
        seed_common(&fx);
        fx.store.save_lead(&lead("l1", "b1")).unwrap();
        fx.store.save_lead(&lead("l2", "b1")).unwrap();
        let mut campaign = fast_sequence("b1", vec![step("f1", 0, TimeUnit::Minutes)]);
        campaign.throttling.messages_per_minute = 1;
        fx.store.save_campaign(&campaign).unwrap();
        let now = Utc::now();
        // The earlier-due record is held by another poller; the
        // later one must still get the window's single slot.
        let held = dripflow_core::SequenceProgress::new(
            "l1",
            &campaign.id,
            now - ChronoDuration::minutes(2),
        );
        fx.store.insert_progress_if_absent(&held).unwrap();
        let free = dripflow_core::SequenceProgress::new(
            "l2",
            &campaign.id,
            now - ChronoDuration::minutes(1),
        );
        fx.store.insert_progress_if_absent(&free).unwrap();

        let claims = ClaimService::new(fx.state.clone());
        let key = ClaimService::sequence_key(&held.id, 0);
        let _token = claims
            .try_claim(&key, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let report = fx.dispatcher.tick(now).await.unwrap();
        assert_eq!(report.contended, 1);
        assert_eq!(report.steps_sent, 1);
        assert_eq!(fx.gateway.sent(), vec![("l2".to_string(), "f1".to_string())]);
    }

    #[tokio::test]
    async fn test_completion_without_send_leaves_budget() {
        let fx = fixture();
        seed_common(&fx);
        let mut retired = lead("l1", "b1");
        retired.is_active = false;
        fx.store.save_lead(&retired).unwrap();
        fx.store.save_lead(&lead("l2", "b1")).unwrap();
        let mut campaign = fast_sequence("b1", vec![step("f1", 0, TimeUnit::Minutes)]);
        campaign.throttling.messages_per_minute = 1;
        fx.store.save_campaign(&campaign).unwrap();
        let now = Utc::now();
        // The retired lead's record comes up first and completes
        // without a delivery; that must not charge the window.
        let first = dripflow_core::SequenceProgress::new(
            "l1",
            &campaign.id,
            now - ChronoDuration::minutes(2),
        );
        fx.store.insert_progress_if_absent(&first).unwrap();
        let second = dripflow_core::SequenceProgress::new(
            "l2",
            &campaign.id,
            now - ChronoDuration::minutes(1),
        );
        fx.store.insert_progress_if_absent(&second).unwrap();

        let report = fx.dispatcher.tick(now).await.unwrap();
        assert_eq!(report.steps_sent, 1);
        assert_eq!(fx.gateway.sent(), vec![("l2".to_string(), "f1".to_string())]);
    }

    #[tokio::test]
    async fn test_rate_limit_cools_down_whole_bot() {
        let fx = fixture();
        seed_common(&fx);
        let campaign = fast_sequence(
            "b1",
            vec![step("f1", 0, TimeUnit::Minutes), step("f2", 5, TimeUnit::Minutes)],
        );
        fx.store.save_campaign(&campaign).unwrap();
        let now = Utc::now();
        for i in 0..2 {
            let l = lead(&format!("l{i}"), "b1");
            fx.store.save_lead(&l).unwrap();
            let progress = dripflow_core::SequenceProgress::new(
                &l.id,
                &campaign.id,
                now - ChronoDuration::minutes(1),
            );
            fx.store.insert_progress_if_absent(&progress).unwrap();
        }
        fx.gateway
            .push_err(DeliveryError::RateLimited { retry_after_secs: 60 });

        let report = fx.dispatcher.tick(now).await.unwrap();
        // First unit hit the limit; the bot cooled down before the
        // second was attempted.
        assert_eq!(report.deferred, 1);
        assert_eq!(fx.gateway.sent_count(), 0);

        let second = fx.dispatcher.tick(now).await.unwrap();
        assert_eq!(second.steps_sent, 0);
    }

    #[tokio::test]
    async fn test_broadcast_end_to_end() {
        let fx = fixture();
        seed_common(&fx);
        fx.store.save_lead(&lead("l1", "b1")).unwrap();
        fx.store.save_lead(&lead("l2", "b1")).unwrap();
        let now = Utc::now();
        let mut campaign = Campaign::new(
            "u1",
            "b1",
            "blast",
            CampaignKind::Broadcast {
                flow_id: "f1".into(),
                schedule: Schedule {
                    kind: ScheduleKind::Once,
                    start_date: now - ChronoDuration::hours(1),
                    end_date: None,
                    time_of_day: None,
                    days_of_week: vec![],
                    timezone: "UTC".into(),
                },
            },
        );
        campaign.throttling.delay_between_messages = 0;
        campaign.status = CampaignStatus::Scheduled;
        campaign.stats.next_run = Some(now - ChronoDuration::minutes(1));
        fx.store.save_campaign(&campaign).unwrap();

        // First tick fires the broadcast and delivers its jobs.
        let report = fx.dispatcher.tick(now).await.unwrap();
        assert_eq!(report.broadcasts_fired, 1);
        assert_eq!(report.jobs_sent, 2);

        // Second tick finalizes the drained run.
        let report = fx.dispatcher.tick(now).await.unwrap();
        assert_eq!(report.runs_finalized, 1);
        let loaded = fx.store.get_campaign(&campaign.id).unwrap().unwrap();
        assert_eq!(loaded.status, CampaignStatus::Completed);
        assert_eq!(loaded.stats.targeted, 2);
        assert_eq!(loaded.stats.succeeded, 2);
    }

    #[tokio::test]
    async fn test_job_for_deleted_campaign_cancelled() {
        let fx = fixture();
        seed_common(&fx);
        fx.store.save_lead(&lead("l1", "b1")).unwrap();
        let now = Utc::now();
        let job = dripflow_core::ScheduledMessage::new("u1", "b1", "l1", "f1", "gone", now);
        fx.store.insert_job(&job).unwrap();

        fx.dispatcher.tick(now).await.unwrap();
        assert_eq!(
            fx.store.get_job(&job.id).unwrap().unwrap().status,
            dripflow_core::JobStatus::Cancelled
        );
    }
}
