//! Telegram Bot API gateway — sends flows part by part and maps
//! Bot API failures onto the delivery error taxonomy.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use dripflow_core::{Bot, Flow, Lead, MessagePart, PartKind};

use crate::render::render;
use crate::{DeliveryError, DeliveryGateway, DeliveryReceipt};

/// Substrings in Bot API error descriptions that mean the recipient
/// is permanently gone.
const PERMANENT_MARKERS: &[&str] = &["bot was blocked", "user is deactivated", "chat not found"];

/// Telegram Bot API gateway. One instance serves every bot; the
/// token comes from the `Bot` passed per call.
pub struct TelegramGateway {
    client: reqwest::Client,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    description: Option<String>,
    error_code: Option<i64>,
    parameters: Option<ApiParameters>,
}

#[derive(Debug, Deserialize)]
struct ApiParameters {
    retry_after: Option<u64>,
}

impl TelegramGateway {
    pub fn new(api_base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    fn api_url(&self, token: &str, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, token, method)
    }

    /// Build the request body for one rendered part.
    fn part_body(part: &MessagePart, lead: &Lead, chat_id: &str) -> serde_json::Value {
        let mut body = json!({ "chat_id": chat_id });

        match part.kind {
            PartKind::Text => {
                let text = part.text.as_deref().unwrap_or_default();
                body["text"] = json!(render(text, lead));
            }
            _ => {
                let field = match part.kind {
                    PartKind::Photo => "photo",
                    PartKind::Video => "video",
                    PartKind::Audio => "audio",
                    PartKind::Document => "document",
                    PartKind::Text => unreachable!(),
                };
                body[field] = json!(part.media_ref.as_deref().unwrap_or_default());
                if let Some(caption) = &part.caption {
                    body["caption"] = json!(render(caption, lead));
                }
            }
        }

        if !part.buttons.is_empty() {
            let rows: Vec<Vec<serde_json::Value>> = part
                .buttons
                .iter()
                .map(|b| vec![json!({ "text": b.text, "url": b.url })])
                .collect();
            body["reply_markup"] = json!({ "inline_keyboard": rows });
        }
        body
    }

    fn method_for(kind: PartKind) -> &'static str {
        match kind {
            PartKind::Text => "sendMessage",
            PartKind::Photo => "sendPhoto",
            PartKind::Video => "sendVideo",
            PartKind::Audio => "sendAudio",
            PartKind::Document => "sendDocument",
        }
    }

    async fn send_part(&self, bot: &Bot, lead: &Lead, part: &MessagePart) -> Result<(), DeliveryError> {
        let body = Self::part_body(part, lead, &lead.chat_id);
        let response = self
            .client
            .post(self.api_url(&bot.token, Self::method_for(part.kind)))
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("request failed: {e}")))?;

        let api: ApiResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::Transient(format!("invalid response: {e}")))?;

        if api.ok {
            return Ok(());
        }
        Err(classify(&api))
    }
}

/// Map an error response onto the delivery taxonomy.
fn classify(api: &ApiResponse) -> DeliveryError {
    let description = api.description.as_deref().unwrap_or_default();

    if api.error_code == Some(429) {
        let retry_after_secs = api
            .parameters
            .as_ref()
            .and_then(|p| p.retry_after)
            .unwrap_or(30);
        return DeliveryError::RateLimited { retry_after_secs };
    }

    let lowered = description.to_lowercase();
    if PERMANENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return DeliveryError::Unreachable {
            reason: description.to_string(),
        };
    }

    DeliveryError::Transient(description.to_string())
}

#[async_trait]
impl DeliveryGateway for TelegramGateway {
    async fn send_flow(
        &self,
        bot: &Bot,
        lead: &Lead,
        flow: &Flow,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let mut receipt = DeliveryReceipt::default();
        for part in &flow.parts {
            if !part.is_sendable() {
                tracing::debug!("skipping empty part in flow {}", flow.id);
                continue;
            }
            if part.delay_secs > 0 {
                tokio::time::sleep(std::time::Duration::from_secs(part.delay_secs as u64)).await;
            }
            self.send_part(bot, lead, part).await?;
            receipt.parts_sent += 1;
        }
        Ok(receipt)
    }
}
