//! Enrollment — matching leads against campaign audience filters
//! and creating their progress records. Runs as a periodic sweep
//! for pre-existing leads and immediately for new ones.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use dripflow_core::{AudienceFilter, Campaign, DripflowError, Lead, Result, SequenceProgress};
use dripflow_store::Store;

use crate::clock;

/// Does a lead fall inside a campaign's audience? Tag inclusion is
/// any-of; exclusion, custom fields and recency must all hold.
pub fn matches(filter: &AudienceFilter, lead: &Lead, now: DateTime<Utc>) -> bool {
    if !filter.tags.is_empty() && !filter.tags.iter().any(|t| lead.has_tag(t)) {
        return false;
    }
    if filter.exclude_tags.iter().any(|t| lead.has_tag(t)) {
        return false;
    }
    for (key, value) in &filter.custom_fields {
        if lead.custom_fields.get(key) != Some(value) {
            return false;
        }
    }
    if let Some(days) = filter.last_interaction_days
        && lead.last_interaction < now - Duration::days(days as i64)
    {
        return false;
    }
    true
}

/// Creates sequence progress records for qualifying leads.
pub struct Enroller {
    store: Arc<Store>,
}

impl Enroller {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Enroll one lead into one sequence campaign. Step 0's offset
    /// anchors to enrollment time. Idempotent: returns false when a
    /// progress record already exists.
    pub fn enroll(&self, campaign: &Campaign, lead: &Lead, now: DateTime<Utc>) -> Result<bool> {
        let steps = campaign.sequence_steps().ok_or_else(|| {
            DripflowError::InvalidCampaign(format!("campaign {} is not a sequence", campaign.id))
        })?;
        let first = steps.first().ok_or_else(|| {
            DripflowError::InvalidCampaign(format!("campaign {} has no steps", campaign.id))
        })?;
        if !lead.is_active {
            return Ok(false);
        }

        let first_due = clock::next_step_due(now, first);
        let progress = SequenceProgress::new(&lead.id, &campaign.id, first_due);
        if !self.store.insert_progress_if_absent(&progress)? {
            return Ok(false);
        }

        self.store.add_leads_entered(&campaign.id, 1)?;
        self.store
            .bump_daily_stats(&campaign.id, now.date_naive(), 0, 1, 0)?;
        tracing::debug!(
            "enrolled lead {} into campaign {}, step 0 due {first_due}",
            lead.id,
            campaign.id
        );
        Ok(true)
    }

    /// Sweep every active sequence campaign for matching leads not
    /// yet enrolled. Returns the number of new enrollments.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut enrolled = 0;
        for campaign in self.store.active_sequence_campaigns()? {
            let candidates = self
                .store
                .active_leads_not_enrolled(&campaign.bot_id, &campaign.id)?;
            for lead in candidates {
                if matches(&campaign.filter, &lead, now) && self.enroll(&campaign, &lead, now)? {
                    enrolled += 1;
                }
            }
        }
        if enrolled > 0 {
            tracing::info!("enrollment sweep added {enrolled} leads");
        }
        Ok(enrolled)
    }

    /// Immediate enrollment check when a lead is created.
    pub fn on_new_lead(&self, lead: &Lead, now: DateTime<Utc>) -> Result<u64> {
        let mut enrolled = 0;
        for campaign in self.store.active_sequence_campaigns()? {
            if campaign.bot_id == lead.bot_id
                && matches(&campaign.filter, lead, now)
                && self.enroll(&campaign, lead, now)?
            {
                enrolled += 1;
            }
        }
        Ok(enrolled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{lead, sequence_campaign, step};
    use dripflow_core::{CampaignStatus, TimeUnit};

    fn filter() -> AudienceFilter {
        AudienceFilter::default()
    }

    #[test]
    fn test_tag_inclusion_any_of() {
        let now = Utc::now();
        let mut f = filter();
        f.tags = vec!["vip".into(), "trial".into()];

        let mut l = lead("l1", "b1");
        assert!(!matches(&f, &l, now));
        l.tags.push("trial".into());
        assert!(matches(&f, &l, now));
    }

    #[test]
    fn test_tag_exclusion_wins() {
        let now = Utc::now();
        let mut f = filter();
        f.exclude_tags = vec!["churned".into()];

        let mut l = lead("l1", "b1");
        assert!(matches(&f, &l, now));
        l.tags.push("churned".into());
        assert!(!matches(&f, &l, now));
    }

    #[test]
    fn test_custom_field_equality() {
        let now = Utc::now();
        let mut f = filter();
        f.custom_fields.insert("plan".into(), "pro".into());

        let mut l = lead("l1", "b1");
        assert!(!matches(&f, &l, now));
        l.custom_fields.insert("plan".into(), "free".into());
        assert!(!matches(&f, &l, now));
        l.custom_fields.insert("plan".into(), "pro".into());
        assert!(matches(&f, &l, now));
    }

    #[test]
    fn test_recency_filter() {
        let now = Utc::now();
        let mut f = filter();
        f.last_interaction_days = Some(7);

        let mut l = lead("l1", "b1");
        l.last_interaction = now - Duration::days(3);
        assert!(matches(&f, &l, now));
        l.last_interaction = now - Duration::days(10);
        assert!(!matches(&f, &l, now));
    }

    #[test]
    fn test_enrollment_is_idempotent() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let enroller = Enroller::new(store.clone());
        let now = Utc::now();

        let l = lead("l1", "b1");
        store.save_lead(&l).unwrap();
        let mut campaign = sequence_campaign("b1", vec![step("f1", 10, TimeUnit::Minutes)]);
        campaign.status = CampaignStatus::Scheduled;
        store.save_campaign(&campaign).unwrap();

        assert!(enroller.enroll(&campaign, &l, now).unwrap());
        assert!(!enroller.enroll(&campaign, &l, now).unwrap());

        let progress = store.get_progress("l1", &campaign.id).unwrap().unwrap();
        assert_eq!(progress.last_step_index, -1);
        assert_eq!(
            progress.next_step_scheduled_for,
            Some(now + Duration::minutes(10))
        );
        let loaded = store.get_campaign(&campaign.id).unwrap().unwrap();
        assert_eq!(loaded.stats.leads_entered, 1);
    }

    #[test]
    fn test_sweep_enrolls_matching_leads_only() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let enroller = Enroller::new(store.clone());
        let now = Utc::now();

        let mut vip = lead("l1", "b1");
        vip.tags.push("vip".into());
        store.save_lead(&vip).unwrap();
        store.save_lead(&lead("l2", "b1")).unwrap();
        store.save_lead(&lead("l3", "other-bot")).unwrap();

        let mut campaign = sequence_campaign("b1", vec![step("f1", 0, TimeUnit::Minutes)]);
        campaign.filter.tags = vec!["vip".into()];
        campaign.status = CampaignStatus::Scheduled;
        store.save_campaign(&campaign).unwrap();

        assert_eq!(enroller.sweep(now).unwrap(), 1);
        assert!(store.get_progress("l1", &campaign.id).unwrap().is_some());
        assert!(store.get_progress("l2", &campaign.id).unwrap().is_none());
        // Re-sweep finds nothing new.
        assert_eq!(enroller.sweep(now).unwrap(), 0);
    }

    #[test]
    fn test_on_new_lead_checks_only_its_bot() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let enroller = Enroller::new(store.clone());
        let now = Utc::now();

        let mut campaign = sequence_campaign("b1", vec![step("f1", 0, TimeUnit::Minutes)]);
        campaign.status = CampaignStatus::Scheduled;
        store.save_campaign(&campaign).unwrap();

        let l = lead("l1", "b1");
        store.save_lead(&l).unwrap();
        assert_eq!(enroller.on_new_lead(&l, now).unwrap(), 1);

        let other = lead("l2", "b2");
        store.save_lead(&other).unwrap();
        assert_eq!(enroller.on_new_lead(&other, now).unwrap(), 0);
    }
}
