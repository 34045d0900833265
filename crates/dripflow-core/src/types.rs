//! Leads, flows and bots: the entities campaigns act on. Dripflow
//! reads leads and flips `is_active`/`last_interaction`, but their
//! CRUD lives outside this engine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generate a fresh entity id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// An outbound messaging identity (one bot token per tenant bot).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    pub user_id: String,
    pub token: String,
    pub username: String,
}

/// A tracked contact targetable by campaigns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub user_id: String,
    pub bot_id: String,
    /// Provider-side chat/recipient id.
    pub chat_id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom_fields: HashMap<String, String>,
    /// False once the recipient is permanently unreachable.
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub last_interaction: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Lead {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// What kind of content a message part carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartKind {
    Text,
    Photo,
    Video,
    Audio,
    Document,
}

/// An inline button attached to a message part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartButton {
    pub text: String,
    pub url: String,
}

/// One message in a flow: text or a media reference, optional
/// caption and buttons, and a delay applied before sending it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePart {
    pub kind: PartKind,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media_ref: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub buttons: Vec<PartButton>,
    /// Seconds to wait before sending this part.
    #[serde(default)]
    pub delay_secs: u32,
}

impl MessagePart {
    /// A part with nothing to send is skipped rather than failed.
    pub fn is_sendable(&self) -> bool {
        match self.kind {
            PartKind::Text => self.text.as_deref().is_some_and(|t| !t.is_empty()),
            _ => self.media_ref.as_deref().is_some_and(|m| !m.is_empty()),
        }
    }

    pub fn text(content: &str) -> Self {
        Self {
            kind: PartKind::Text,
            text: Some(content.to_string()),
            media_ref: None,
            caption: None,
            buttons: Vec::new(),
            delay_secs: 0,
        }
    }
}

/// An ordered list of message parts sent as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub name: String,
    pub parts: Vec<MessagePart>,
}
