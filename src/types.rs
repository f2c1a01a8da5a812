use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::IngestError;

/// Remote collections the extractor knows how to page through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Users,
    Customers,
    Conversations,
    Messages,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Users => "users",
            EntityKind::Customers => "customers",
            EntityKind::Conversations => "conversations",
            EntityKind::Messages => "messages",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "users" => Some(EntityKind::Users),
            "customers" => Some(EntityKind::Customers),
            "conversations" => Some(EntityKind::Conversations),
            "messages" => Some(EntityKind::Messages),
            _ => None,
        }
    }
}

/// Where a classification came from. The derived ordering is the overwrite
/// priority: `Warehouse > ApiOverride > Ai > None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    None,
    Ai,
    ApiOverride,
    Warehouse,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::None => "none",
            Provenance::Ai => "ai",
            Provenance::ApiOverride => "api_override",
            Provenance::Warehouse => "warehouse",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "warehouse" => Provenance::Warehouse,
            "api_override" => Provenance::ApiOverride,
            "ai" => Provenance::Ai,
            _ => Provenance::None,
        }
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Support conversation as stored locally. Upserted wholesale on every fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub source_type: Option<String>,
    pub status: Option<String>,
    pub category_tag: Option<String>,
    pub assignee: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub priority: Option<String>,
    pub ticket_type: Option<String>,
    pub submitter: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub sentiment: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationEnvelope {
    id: Option<String>,
    source_type: Option<String>,
    status: Option<String>,
    #[serde(alias = "tag")]
    category: Option<String>,
    assigned_to_user_id: Option<String>,
    created_at: Option<JsonValue>,
    updated_at: Option<JsonValue>,
    closed_at: Option<JsonValue>,
    priority: Option<JsonValue>,
    ticket_type_id: Option<String>,
    submitter_user_id: Option<String>,
    title: Option<String>,
    summary: Option<String>,
    sentiment: Option<String>,
}

impl Conversation {
    /// Decode a raw API payload, rejecting anything without an object shape or id.
    pub fn from_payload(payload: &JsonValue) -> Result<Self, IngestError> {
        if !payload.is_object() {
            return Err(IngestError::NotAnObject);
        }
        let env: ConversationEnvelope = serde_json::from_value(payload.clone())
            .map_err(|e| IngestError::Malformed(e.to_string()))?;
        let id = non_empty(env.id).ok_or(IngestError::MissingField("id"))?;

        Ok(Self {
            id,
            source_type: env.source_type,
            status: env.status,
            category_tag: env.category,
            assignee: env.assigned_to_user_id,
            created_at: env.created_at.as_ref().and_then(parse_timestamp),
            updated_at: env.updated_at.as_ref().and_then(parse_timestamp),
            closed_at: env.closed_at.as_ref().and_then(parse_timestamp),
            priority: env.priority.as_ref().and_then(scalar_to_string),
            ticket_type: env.ticket_type_id,
            submitter: env.submitter_user_id,
            title: env.title,
            summary: env.summary,
            sentiment: env.sentiment,
        })
    }
}

/// A single message inside a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sent_at: DateTime<Utc>,
    pub sender: Option<String>,
    pub text: String,
    pub is_private_note: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageEnvelope {
    id: Option<String>,
    conversation_id: Option<String>,
    #[serde(alias = "ts")]
    timestamp: Option<JsonValue>,
    #[serde(alias = "user")]
    user_id: Option<String>,
    #[serde(alias = "content")]
    text: Option<String>,
    #[serde(default)]
    is_private_note: bool,
}

impl Message {
    /// Decode a raw message payload. `conversation_id` fills in for payloads
    /// listed under a conversation that do not repeat the parent id.
    pub fn from_payload(payload: &JsonValue, conversation_id: &str) -> Result<Self, IngestError> {
        if !payload.is_object() {
            return Err(IngestError::NotAnObject);
        }
        let env: MessageEnvelope = serde_json::from_value(payload.clone())
            .map_err(|e| IngestError::Malformed(e.to_string()))?;
        let id = non_empty(env.id).ok_or(IngestError::MissingField("id"))?;
        let conversation_id = non_empty(env.conversation_id)
            .or_else(|| non_empty(Some(conversation_id.to_string())))
            .ok_or(IngestError::MissingField("conversationId"))?;
        let sent_at = env
            .timestamp
            .as_ref()
            .and_then(parse_timestamp)
            .ok_or(IngestError::MissingField("timestamp"))?;

        Ok(Self {
            id,
            conversation_id,
            sent_at,
            sender: env.user_id,
            text: env.text.unwrap_or_default(),
            is_private_note: env.is_private_note,
        })
    }
}

/// The resolved payload of one classification, independent of storage metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: Option<String>,
    pub sub_category: Option<String>,
    pub resolution: Option<String>,
    pub reasoning: Option<String>,
}

/// Persisted classification for a conversation (one-to-one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub conversation_id: String,
    pub category: Option<String>,
    pub sub_category: Option<String>,
    pub reasoning: Option<String>,
    pub resolution: Option<String>,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
    pub updated_time: Option<DateTime<Utc>>,
    pub excluded: bool,
}

impl ClassificationRecord {
    /// Resolved locally but not yet confirmed on the remote side.
    pub fn is_pending(&self) -> bool {
        if self.excluded || self.category.is_none() || self.resolution.is_none() {
            return false;
        }
        match self.updated_time {
            None => true,
            Some(updated) => updated < self.created_at,
        }
    }

    pub fn lifecycle(&self) -> LifecycleState {
        if self.excluded {
            LifecycleState::Excluded
        } else if self.provenance == Provenance::None {
            LifecycleState::Unresolved
        } else if self.is_pending() {
            LifecycleState::Classified
        } else if self.updated_time.is_some() {
            LifecycleState::Synced
        } else {
            // Classified without a resolution: never pushed automatically.
            LifecycleState::Incomplete
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unclassified,
    Unresolved,
    Incomplete,
    Classified,
    Synced,
    Excluded,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Unclassified => "unclassified",
            LifecycleState::Unresolved => "unresolved",
            LifecycleState::Incomplete => "incomplete",
            LifecycleState::Classified => "classified",
            LifecycleState::Synced => "synced",
            LifecycleState::Excluded => "excluded",
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Accepts RFC 3339 strings, plain `YYYY-MM-DD HH:MM:SS` strings, and epoch
/// seconds given either as a number or as a Slack-style `"1700000000.000100"`.
pub fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
                return Some(naive.and_utc());
            }
            s.parse::<f64>().ok().and_then(epoch_seconds)
        }
        JsonValue::Number(n) => n.as_f64().and_then(epoch_seconds),
        _ => None,
    }
}

fn epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.trunc() as i64;
    let micros = ((secs - secs.trunc()) * 1_000_000.0).round() as u32;
    Utc.timestamp_opt(whole, micros * 1_000).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn provenance_priority_is_totally_ordered() {
        assert!(Provenance::Warehouse > Provenance::ApiOverride);
        assert!(Provenance::ApiOverride > Provenance::Ai);
        assert!(Provenance::Ai > Provenance::None);
        assert_eq!(Provenance::from_str("api_override"), Provenance::ApiOverride);
        assert_eq!(Provenance::from_str("garbage"), Provenance::None);
    }

    #[test]
    fn conversation_payload_requires_id() {
        let err = Conversation::from_payload(&json!({"title": "no id"})).unwrap_err();
        assert!(matches!(err, IngestError::MissingField("id")));
        assert!(matches!(
            Conversation::from_payload(&json!(["not", "an", "object"])),
            Err(IngestError::NotAnObject)
        ));
    }

    #[test]
    fn conversation_payload_decodes_named_fields() {
        let conv = Conversation::from_payload(&json!({
            "id": "c-1",
            "status": "closed",
            "priority": 5,
            "createdAt": "2024-03-01T10:00:00.000Z",
            "submitterUserId": "u-9",
            "somethingUnknown": true
        }))
        .unwrap();
        assert_eq!(conv.id, "c-1");
        assert_eq!(conv.priority.as_deref(), Some("5"));
        assert_eq!(conv.submitter.as_deref(), Some("u-9"));
        assert!(conv.created_at.is_some());
    }

    #[test]
    fn message_payload_uses_parent_conversation_id() {
        let msg = Message::from_payload(
            &json!({"id": "m-1", "ts": "1700000000.000100", "text": "hello"}),
            "c-1",
        )
        .unwrap();
        assert_eq!(msg.conversation_id, "c-1");
        assert_eq!(msg.sent_at.timestamp(), 1_700_000_000);
        assert!(!msg.is_private_note);
    }

    #[test]
    fn pending_requires_category_and_resolution() {
        let now = Utc::now();
        let mut record = ClassificationRecord {
            conversation_id: "c".into(),
            category: Some("LangGraph".into()),
            sub_category: None,
            reasoning: None,
            resolution: None,
            provenance: Provenance::Ai,
            created_at: now,
            updated_time: None,
            excluded: false,
        };
        assert!(!record.is_pending());
        record.resolution = Some("Resolved".into());
        assert!(record.is_pending());
        record.updated_time = Some(now);
        assert!(!record.is_pending());
        assert_eq!(record.lifecycle(), LifecycleState::Synced);
    }
}
