//! Sequence advancement — the state machine that moves one lead
//! through one campaign's steps. Called by the dispatcher with a
//! claim already held; this module only mutates the durable record.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use dripflow_core::{Campaign, Result, SequenceProgress, SequenceStep, StepRecord};
use dripflow_gateway::{DeliveryError, DeliveryGateway};
use dripflow_state::ClaimService;
use dripflow_store::Store;

use crate::clock;
use crate::throttle::ThrottleController;

/// What happened to one due progress record this tick.
#[derive(Debug)]
pub enum AdvanceOutcome {
    /// Step delivered, record advanced.
    Sent { step_index: i32 },
    /// Inactive steps consumed without a send.
    Skipped,
    /// Sequence finished (all steps done, or lead retired).
    Completed,
    /// Transient trouble; the record stays due for a later tick.
    Deferred,
    /// Terminal failure recorded on the progress log.
    Failed { reason: String },
}

/// Advances due sequence progress records.
pub struct SequenceAdvancer {
    store: Arc<Store>,
    gateway: Arc<dyn DeliveryGateway>,
    throttle: ThrottleController,
}

impl SequenceAdvancer {
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

    /// Run one transition on a due record. The caller holds the
    /// step claim for the duration of this call.
    pub async fn advance(
        &self,
        campaign: &Campaign,
        progress: &mut SequenceProgress,
        now: DateTime<Utc>,
    ) -> Result<AdvanceOutcome> {
        let steps = match campaign.sequence_steps() {
            Some(steps) if !steps.is_empty() => steps,
            _ => {
                return self
                    .fail_terminal(progress, -1, "", now, "campaign has no sequence steps")
                    .await;
            }
        };

        let lead = match self.store.get_lead(&progress.lead_id)? {
            Some(lead) => lead,
            None => {
                return self
                    .fail_terminal(progress, -1, "", now, "lead record missing")
                    .await;
            }
        };
        if !lead.is_active {
            self.complete(campaign, progress, now, false)?;
            return Ok(AdvanceOutcome::Completed);
        }

        let due_index = progress.last_step_index + 1;
        let mut next_index = due_index;
        while (next_index as usize) < steps.len() && !steps[next_index as usize].active {
            next_index += 1;
        }
        if next_index as usize >= steps.len() {
            self.complete(campaign, progress, now, true)?;
            return Ok(AdvanceOutcome::Completed);
        }
        let step = &steps[next_index as usize];
        if next_index != due_index {
            // Inactive steps consume no delivery attempt; the first
            // active one fires at its own offset from now.
            progress.last_step_index = next_index - 1;
            progress.next_step_scheduled_for = Some(clock::next_step_due(now, step));
            self.store.update_progress(progress)?;
            tracing::debug!(
                "progress {}: skipped to step {next_index} without sending",
                progress.id
            );
            return Ok(AdvanceOutcome::Skipped);
        }

        let flow = match self.store.get_flow(&step.flow_id)? {
            Some(flow) => flow,
            None => {
                let reason = format!("flow {} not found", step.flow_id);
                return self
                    .fail_terminal(progress, next_index, &step.flow_id, now, &reason)
                    .await;
            }
        };
        let bot = match self.store.get_bot(&campaign.bot_id)? {
            Some(bot) => bot,
            None => {
                let reason = format!("bot {} not found", campaign.bot_id);
                return self
                    .fail_terminal(progress, next_index, &step.flow_id, now, &reason)
                    .await;
            }
        };

        match self.gateway.send_flow(&bot, &lead, &flow).await {
            Ok(_) => {
                self.record_success(campaign, progress, steps, next_index, now)
                    .await?;
                Ok(AdvanceOutcome::Sent {
                    step_index: next_index,
                })
            }
            Err(DeliveryError::Unreachable { reason }) => {
                // Recipient is gone for good: retire the lead and
                // close the sequence; remaining steps never fire.
                self.store.mark_lead_inactive(&lead.id)?;
                self.fail_terminal(progress, next_index, &step.flow_id, now, &reason)
                    .await
            }
            Err(DeliveryError::RateLimited { retry_after_secs }) => {
                self.throttle
                    .start_cooldown(&campaign.bot_id, retry_after_secs)
                    .await?;
                self.defer(progress, next_index, &step.flow_id, now, Some(retry_after_secs))
                    .await
            }
            Err(DeliveryError::Transient(reason)) => {
                tracing::debug!("progress {}: transient failure: {reason}", progress.id);
                self.defer(progress, next_index, &step.flow_id, now, None)
                    .await
            }
        }
    }

    async fn record_success(
        &self,
        campaign: &Campaign,
        progress: &mut SequenceProgress,
        steps: &[SequenceStep],
        step_index: i32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store.append_step_record(
            &progress.id,
            &StepRecord {
                step_index,
                flow_id: steps[step_index as usize].flow_id.clone(),
                scheduled_for: progress.next_step_scheduled_for,
                sent_at: now,
                success: true,
                error: None,
            },
        )?;

        progress.last_step_index = step_index;
        progress.last_step_sent_at = Some(now);
        let following = (step_index + 1) as usize;
        if following < steps.len() {
            progress.next_step_scheduled_for = Some(clock::next_step_due(now, &steps[following]));
            self.store.update_progress(progress)?;
        } else {
            self.complete(campaign, progress, now, true)?;
        }

        self.throttle
            .clear_attempts(&ClaimService::sequence_key(&progress.id, step_index))
            .await?;
        self.store.add_messages_sent(&campaign.id, 1)?;
        self.store
            .bump_daily_stats(&campaign.id, now.date_naive(), 1, 0, 0)?;
        self.store.touch_lead_interaction(&progress.lead_id, now)?;
        Ok(())
    }

    /// Transient path: leave the index untouched and push the due
    /// time out by the backoff (or the provider's retry-after hint
    /// when larger). Bounded attempts; after that the unit fails.
    async fn defer(
        &self,
        progress: &mut SequenceProgress,
        step_index: i32,
        flow_id: &str,
        now: DateTime<Utc>,
        retry_after_secs: Option<u64>,
    ) -> Result<AdvanceOutcome> {
        let unit_key = ClaimService::sequence_key(&progress.id, step_index);
        let attempts = self.throttle.record_attempt(&unit_key).await?;
        if self.throttle.attempts_exhausted(attempts) {
            return self
                .fail_terminal(
                    progress,
                    step_index,
                    flow_id,
                    now,
                    &format!("gave up after {attempts} attempts"),
                )
                .await;
        }

        let backoff = self.throttle.backoff(attempts).as_secs();
        let wait = backoff.max(retry_after_secs.unwrap_or(0));
        progress.next_step_scheduled_for = Some(now + Duration::seconds(wait as i64));
        self.store.update_progress(progress)?;
        Ok(AdvanceOutcome::Deferred)
    }

    async fn fail_terminal(
        &self,
        progress: &mut SequenceProgress,
        step_index: i32,
        flow_id: &str,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<AdvanceOutcome> {
        tracing::warn!("progress {}: terminal failure: {reason}", progress.id);
        self.store.append_step_record(
            &progress.id,
            &StepRecord {
                step_index,
                flow_id: flow_id.to_string(),
                scheduled_for: progress.next_step_scheduled_for,
                sent_at: now,
                success: false,
                error: Some(reason.to_string()),
            },
        )?;
        progress.is_completed = true;
        progress.completed_at = Some(now);
        progress.next_step_scheduled_for = None;
        self.store.update_progress(progress)?;
        if step_index >= 0 {
            self.throttle
                .clear_attempts(&ClaimService::sequence_key(&progress.id, step_index))
                .await?;
        }
        Ok(AdvanceOutcome::Failed {
            reason: reason.to_string(),
        })
    }

    fn complete(
        &self,
        campaign: &Campaign,
        progress: &mut SequenceProgress,
        now: DateTime<Utc>,
        count_completion: bool,
    ) -> Result<()> {
        progress.is_completed = true;
        progress.completed_at = Some(now);
        progress.next_step_scheduled_for = None;
        self.store.update_progress(progress)?;
        if count_completion {
            self.store.add_flows_completed(&campaign.id, 1)?;
            self.store
                .bump_daily_stats(&campaign.id, now.date_naive(), 0, 0, 1)?;
        }
        tracing::info!("progress {} completed", progress.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockGateway, bot, flow, lead, sequence_campaign, step};
    use dripflow_core::{RetryConfig, TimeUnit};
    use dripflow_state::MemoryState;

    struct Fixture {
        store: Arc<Store>,
        gateway: Arc<MockGateway>,
        advancer: SequenceAdvancer,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let gateway = Arc::new(MockGateway::new());
        let throttle = ThrottleController::new(Arc::new(MemoryState::new()), RetryConfig::default());
        let advancer = SequenceAdvancer::new(store.clone(), gateway.clone(), throttle);
        Fixture {
            store,
            gateway,
            advancer,
        }
    }

    fn seed_two_step(fx: &Fixture) -> (dripflow_core::Campaign, SequenceProgress) {
        fx.store.save_bot(&bot("b1")).unwrap();
        fx.store.save_lead(&lead("l1", "b1")).unwrap();
        fx.store.save_flow(&flow("f1")).unwrap();
        fx.store.save_flow(&flow("f2")).unwrap();
        let campaign = sequence_campaign(
            "b1",
            vec![step("f1", 0, TimeUnit::Minutes), step("f2", 30, TimeUnit::Minutes)],
        );
        fx.store.save_campaign(&campaign).unwrap();
        let progress = SequenceProgress::new("l1", &campaign.id, Utc::now());
        fx.store.insert_progress_if_absent(&progress).unwrap();
        (campaign, progress)
    }

    #[tokio::test]
    async fn test_success_advances_and_schedules_next() {
        let fx = fixture();
        let (campaign, mut progress) = seed_two_step(&fx);
        let now = Utc::now();

        let outcome = fx.advancer.advance(&campaign, &mut progress, now).await.unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Sent { step_index: 0 }));
        assert_eq!(progress.last_step_index, 0);
        assert_eq!(
            progress.next_step_scheduled_for,
            Some(now + Duration::minutes(30))
        );
        assert_eq!(fx.gateway.sent(), vec![("l1".to_string(), "f1".to_string())]);

        let records = fx.store.step_records(&progress.id).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
    }

    #[tokio::test]
    async fn test_last_step_completes_sequence() {
        let fx = fixture();
        let (campaign, mut progress) = seed_two_step(&fx);
        progress.last_step_index = 0;
        fx.store.update_progress(&progress).unwrap();

        let outcome = fx
            .advancer
            .advance(&campaign, &mut progress, Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Sent { step_index: 1 }));
        assert!(progress.is_completed);
        assert!(progress.next_step_scheduled_for.is_none());

        let loaded = fx.store.get_campaign(&campaign.id).unwrap().unwrap();
        assert_eq!(loaded.stats.flows_completed, 1);
        assert_eq!(loaded.stats.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_inactive_lead_completes_without_sending() {
        let fx = fixture();
        let (campaign, mut progress) = seed_two_step(&fx);
        fx.store.mark_lead_inactive("l1").unwrap();

        let outcome = fx
            .advancer
            .advance(&campaign, &mut progress, Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Completed));
        assert_eq!(fx.gateway.sent_count(), 0);
        // Not a real completion, no counter bump.
        let loaded = fx.store.get_campaign(&campaign.id).unwrap().unwrap();
        assert_eq!(loaded.stats.flows_completed, 0);
    }

    #[tokio::test]
    async fn test_unreachable_retires_lead_and_stops_sequence() {
        let fx = fixture();
        let (campaign, mut progress) = seed_two_step(&fx);
        fx.gateway.push_err(DeliveryError::Unreachable {
            reason: "bot was blocked by the user".into(),
        });

        let outcome = fx
            .advancer
            .advance(&campaign, &mut progress, Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Failed { .. }));
        assert!(progress.is_completed);
        assert!(!fx.store.get_lead("l1").unwrap().unwrap().is_active);

        let records = fx.store.step_records(&progress.id).unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
    }

    #[tokio::test]
    async fn test_rate_limit_defers_without_advancing() {
        let fx = fixture();
        let (campaign, mut progress) = seed_two_step(&fx);
        fx.gateway
            .push_err(DeliveryError::RateLimited { retry_after_secs: 30 });
        let now = Utc::now();

        let outcome = fx.advancer.advance(&campaign, &mut progress, now).await.unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Deferred));
        assert_eq!(progress.last_step_index, -1);
        // Deferred at least as far as the provider asked.
        assert!(progress.next_step_scheduled_for.unwrap() >= now + Duration::seconds(30));
        assert!(!progress.is_completed);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_into_terminal() {
        let fx = fixture();
        let (campaign, mut progress) = seed_two_step(&fx);
        for _ in 0..3 {
            fx.gateway.push_err(DeliveryError::Transient("flaky".into()));
        }

        let first = fx
            .advancer
            .advance(&campaign, &mut progress, Utc::now())
            .await
            .unwrap();
        assert!(matches!(first, AdvanceOutcome::Deferred));
        let second = fx
            .advancer
            .advance(&campaign, &mut progress, Utc::now())
            .await
            .unwrap();
        assert!(matches!(second, AdvanceOutcome::Deferred));
        // Third attempt hits the bound.
        let third = fx
            .advancer
            .advance(&campaign, &mut progress, Utc::now())
            .await
            .unwrap();
        assert!(matches!(third, AdvanceOutcome::Failed { .. }));
        assert!(progress.is_completed);
    }

    #[tokio::test]
    async fn test_inactive_step_skipped_without_send() {
        let fx = fixture();
        fx.store.save_bot(&bot("b1")).unwrap();
        fx.store.save_lead(&lead("l1", "b1")).unwrap();
        fx.store.save_flow(&flow("f1")).unwrap();
        fx.store.save_flow(&flow("f2")).unwrap();
        let mut inactive = step("f1", 0, TimeUnit::Minutes);
        inactive.active = false;
        let campaign =
            sequence_campaign("b1", vec![inactive, step("f2", 60, TimeUnit::Minutes)]);
        fx.store.save_campaign(&campaign).unwrap();
        let mut progress = SequenceProgress::new("l1", &campaign.id, Utc::now());
        fx.store.insert_progress_if_absent(&progress).unwrap();
        let now = Utc::now();

        let outcome = fx.advancer.advance(&campaign, &mut progress, now).await.unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Skipped));
        assert_eq!(fx.gateway.sent_count(), 0);
        assert_eq!(progress.last_step_index, 0);
        assert_eq!(
            progress.next_step_scheduled_for,
            Some(now + Duration::hours(1))
        );
    }

    #[tokio::test]
    async fn test_missing_flow_is_terminal_config_error() {
        let fx = fixture();
        fx.store.save_bot(&bot("b1")).unwrap();
        fx.store.save_lead(&lead("l1", "b1")).unwrap();
        let campaign = sequence_campaign("b1", vec![step("missing", 0, TimeUnit::Minutes)]);
        fx.store.save_campaign(&campaign).unwrap();
        let mut progress = SequenceProgress::new("l1", &campaign.id, Utc::now());
        fx.store.insert_progress_if_absent(&progress).unwrap();

        let outcome = fx
            .advancer
            .advance(&campaign, &mut progress, Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, AdvanceOutcome::Failed { .. }));
        assert!(progress.is_completed);
        assert_eq!(fx.gateway.sent_count(), 0);
    }
}
