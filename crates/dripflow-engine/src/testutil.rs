//! Shared fixtures for engine tests: a scriptable delivery gateway
//! and entity builders.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use dripflow_core::{
    Bot, Campaign, CampaignKind, Flow, Lead, MessagePart, SequenceStep, TimeInterval, TimeUnit,
};
use dripflow_gateway::{DeliveryError, DeliveryGateway, DeliveryReceipt};

/// Gateway that replays scripted outcomes. When the script runs dry
/// it keeps succeeding.
#[derive(Default)]
pub struct MockGateway {
    script: Mutex<VecDeque<Result<DeliveryReceipt, DeliveryError>>>,
    sent: Mutex<Vec<(String, String)>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_err(&self, err: DeliveryError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    /// (lead_id, flow_id) pairs of successful deliveries.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl DeliveryGateway for MockGateway {
    async fn send_flow(
        &self,
        _bot: &Bot,
        lead: &Lead,
        flow: &Flow,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(DeliveryReceipt { parts_sent: 1 }));
        if outcome.is_ok() {
            self.sent
                .lock()
                .unwrap()
                .push((lead.id.clone(), flow.id.clone()));
        }
        outcome
    }
}

pub fn bot(id: &str) -> Bot {
    Bot {
        id: id.into(),
        user_id: "u1".into(),
        token: "token".into(),
        username: "testbot".into(),
    }
}

pub fn lead(id: &str, bot_id: &str) -> Lead {
    Lead {
        id: id.into(),
        user_id: "u1".into(),
        bot_id: bot_id.into(),
        chat_id: format!("chat-{id}"),
        first_name: "Ana".into(),
        last_name: String::new(),
        username: String::new(),
        tags: Vec::new(),
        custom_fields: HashMap::new(),
        is_active: true,
        last_interaction: Utc::now(),
        created_at: Utc::now(),
    }
}

pub fn flow(id: &str) -> Flow {
    Flow {
        id: id.into(),
        name: format!("flow {id}"),
        parts: vec![MessagePart::text("Hi {first_name}")],
    }
}

pub fn step(flow_id: &str, value: u32, unit: TimeUnit) -> SequenceStep {
    SequenceStep {
        flow_id: flow_id.into(),
        interval: TimeInterval { value, unit },
        time_of_day: None,
        active: true,
        description: None,
    }
}

pub fn sequence_campaign(bot_id: &str, steps: Vec<SequenceStep>) -> Campaign {
    Campaign::new("u1", bot_id, "drip", CampaignKind::Sequence { steps })
}
