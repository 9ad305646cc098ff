//! Wire protocol for document synchronization over the message router.
//!
//! Every router message is a positional JSON argument list:
//!
//! ```text
//! ┌────────────────────────────────┬──────────────────────────────────────────────┐
//! │ Topic                          │ Args                                         │
//! ├────────────────────────────────┼──────────────────────────────────────────────┤
//! │ code.document.{id}.changed     │ [documentId, ChangeEvent, senderId]          │
//! │ code.cursor.{id}.moved         │ [documentId, position, senderId, senderName] │
//! │ code.user.joined               │ [documentId, {id, username}]                 │
//! │ code.user.left                 │ [documentId, {id, username}]                 │
//! │ code.ping                      │ [documentId, {userId, timestamp}]            │
//! └────────────────────────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Identifiers are carried as strings. Peers that send numeric ids are
//! accepted; the number is normalized to its decimal string.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ───────────────────────────────────────────────────────────────────
// Topics
// ───────────────────────────────────────────────────────────────────

/// The five router topics a session publishes or subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    DocumentChanged,
    CursorMoved,
    UserJoined,
    UserLeft,
    Ping,
}

impl TopicKind {
    /// Topics a connected session subscribes to.
    pub const SUBSCRIBED: [TopicKind; 4] = [
        TopicKind::DocumentChanged,
        TopicKind::CursorMoved,
        TopicKind::UserJoined,
        TopicKind::UserLeft,
    ];

    /// Full topic name for a document.
    pub fn topic(self, document_id: &str) -> String {
        match self {
            TopicKind::DocumentChanged => format!("code.document.{document_id}.changed"),
            TopicKind::CursorMoved => format!("code.cursor.{document_id}.moved"),
            TopicKind::UserJoined => "code.user.joined".to_string(),
            TopicKind::UserLeft => "code.user.left".to_string(),
            TopicKind::Ping => "code.ping".to_string(),
        }
    }

    /// Classify a topic name. Document-scoped topics for any document match.
    pub fn classify(topic: &str) -> Option<TopicKind> {
        match topic {
            "code.user.joined" => return Some(TopicKind::UserJoined),
            "code.user.left" => return Some(TopicKind::UserLeft),
            "code.ping" => return Some(TopicKind::Ping),
            _ => {}
        }
        if let Some(rest) = topic.strip_prefix("code.document.") {
            if rest.strip_suffix(".changed").is_some_and(|id| !id.is_empty()) {
                return Some(TopicKind::DocumentChanged);
            }
        }
        if let Some(rest) = topic.strip_prefix("code.cursor.") {
            if rest.strip_suffix(".moved").is_some_and(|id| !id.is_empty()) {
                return Some(TopicKind::CursorMoved);
            }
        }
        None
    }
}

// ───────────────────────────────────────────────────────────────────
// Change events
// ───────────────────────────────────────────────────────────────────

/// One replacement: characters `from..to` are replaced by `insert`.
///
/// Offsets count Unicode scalar values. Within a sequence, each span is
/// interpreted against the text produced by the spans before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditSpan {
    pub from: usize,
    pub to: usize,
    #[serde(alias = "text")]
    pub insert: String,
}

impl EditSpan {
    pub fn new(from: usize, to: usize, insert: impl Into<String>) -> Self {
        Self {
            from,
            to,
            insert: insert.into(),
        }
    }

    /// Pure insertion at `at`.
    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self::new(at, at, text)
    }

    /// Pure deletion of `from..to`.
    pub fn delete(from: usize, to: usize) -> Self {
        Self::new(from, to, String::new())
    }

    /// A span that neither removes nor inserts anything.
    pub fn is_noop(&self) -> bool {
        self.from == self.to && self.insert.is_empty()
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        if self.from > self.to {
            return Err(ProtocolError::InvertedSpan {
                from: self.from,
                to: self.to,
            });
        }
        Ok(())
    }
}

/// A document mutation as carried on `code.document.{id}.changed`.
///
/// Wire shapes:
/// - `{"type": "full_text", "text": ...}`
/// - `{"type": "range_edits", "edits": [{"from", "to", "insert"}, ...]}`
/// - `{"from", "to", "text"}` (untagged, older clients)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    FullText { text: String },
    RangeEdits { edits: Vec<EditSpan> },
    LegacySingleEdit(EditSpan),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TaggedChange {
    FullText { text: String },
    RangeEdits { edits: Vec<EditSpan> },
}

#[derive(Deserialize)]
struct LegacyChange {
    from: Option<usize>,
    to: Option<usize>,
    text: Option<String>,
}

impl ChangeEvent {
    /// The spans this event applies, in application order. `None` for `FullText`.
    pub fn spans(&self) -> Option<&[EditSpan]> {
        match self {
            ChangeEvent::FullText { .. } => None,
            ChangeEvent::RangeEdits { edits } => Some(edits),
            ChangeEvent::LegacySingleEdit(span) => Some(std::slice::from_ref(span)),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ChangeEvent::FullText { text } => json!({ "type": "full_text", "text": text }),
            ChangeEvent::RangeEdits { edits } => json!({ "type": "range_edits", "edits": edits }),
            ChangeEvent::LegacySingleEdit(span) => {
                json!({ "from": span.from, "to": span.to, "text": span.insert })
            }
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let object = value
            .as_object()
            .ok_or(ProtocolError::WrongType("change event", "object"))?;

        let change = if object.contains_key("type") {
            match serde_json::from_value::<TaggedChange>(value.clone())
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?
            {
                TaggedChange::FullText { text } => ChangeEvent::FullText { text },
                TaggedChange::RangeEdits { edits } => ChangeEvent::RangeEdits { edits },
            }
        } else {
            let legacy = serde_json::from_value::<LegacyChange>(value.clone())
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
            if legacy.from.is_none() && legacy.to.is_none() && legacy.text.is_none() {
                return Err(ProtocolError::MissingField("change event"));
            }
            let from = legacy.from.unwrap_or(0);
            // A missing `to` means a pure insertion at `from`.
            let to = legacy.to.unwrap_or(from);
            ChangeEvent::LegacySingleEdit(EditSpan::new(from, to, legacy.text.unwrap_or_default()))
        };

        if let Some(spans) = change.spans() {
            for span in spans {
                span.validate()?;
            }
        }
        Ok(change)
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence, cursor and keepalive payloads
// ───────────────────────────────────────────────────────────────────

/// `{id, username}` as announced on the presence topics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresenceUser {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub username: String,
}

impl PresenceUser {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

/// Ephemeral cursor position of one user in one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorUpdate {
    pub document_id: String,
    pub position: usize,
    pub user_id: String,
    pub username: String,
}

/// Keepalive payload `{userId, timestamp}`; timestamp is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    #[serde(deserialize_with = "deserialize_id")]
    pub user_id: String,
    pub timestamp: u64,
}

// ───────────────────────────────────────────────────────────────────
// Inbound decoding
// ───────────────────────────────────────────────────────────────────

/// Envelope of a `code.document.{id}.changed` message before the change
/// payload itself is decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEnvelope<'a> {
    pub document_id: String,
    pub sender_id: String,
    pub change: &'a Value,
}

impl<'a> ChangeEnvelope<'a> {
    pub fn decode(args: &'a [Value]) -> Result<Self, ProtocolError> {
        let document_id = id_arg(args, 0, "documentId")?;
        let change = args.get(1).ok_or(ProtocolError::MissingField("change"))?;
        let sender_id = id_arg(args, 2, "senderId")?;
        Ok(Self {
            document_id,
            sender_id,
            change,
        })
    }
}

/// Args of `code.document.{id}.changed`.
pub fn change_args(document_id: &str, change: &ChangeEvent, sender_id: &str) -> Vec<Value> {
    vec![json!(document_id), change.to_value(), json!(sender_id)]
}

impl CursorUpdate {
    pub fn to_args(&self) -> Vec<Value> {
        vec![
            json!(self.document_id),
            json!(self.position),
            json!(self.user_id),
            json!(self.username),
        ]
    }

    pub fn from_args(args: &[Value]) -> Result<Self, ProtocolError> {
        let document_id = id_arg(args, 0, "documentId")?;
        let position = args
            .get(1)
            .ok_or(ProtocolError::MissingField("position"))?
            .as_u64()
            .ok_or(ProtocolError::WrongType("position", "non-negative integer"))?;
        let user_id = id_arg(args, 2, "senderId")?;
        let username = match args.get(3) {
            Some(Value::String(name)) => name.clone(),
            Some(Value::Null) | None => String::new(),
            Some(_) => return Err(ProtocolError::WrongType("senderName", "string")),
        };
        Ok(Self {
            document_id,
            position: position as usize,
            user_id,
            username,
        })
    }
}

/// Args of `code.user.joined` / `code.user.left`.
pub fn presence_args(document_id: &str, user: &PresenceUser) -> Vec<Value> {
    vec![json!(document_id), json!({ "id": user.id, "username": user.username })]
}

/// Decode `code.user.joined` / `code.user.left` args.
pub fn decode_presence(args: &[Value]) -> Result<(String, PresenceUser), ProtocolError> {
    let document_id = id_arg(args, 0, "documentId")?;
    let user = args.get(1).ok_or(ProtocolError::MissingField("user"))?;
    let user = PresenceUser::deserialize(user).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    Ok((document_id, user))
}

/// Args of `code.ping`.
pub fn ping_args(document_id: &str, ping: &Ping) -> Vec<Value> {
    vec![
        json!(document_id),
        json!({ "userId": ping.user_id, "timestamp": ping.timestamp }),
    ]
}

fn id_arg(args: &[Value], index: usize, name: &'static str) -> Result<String, ProtocolError> {
    let value = args.get(index).ok_or(ProtocolError::MissingField(name))?;
    id_string(value).ok_or(ProtocolError::WrongType(name, "string or integer id"))
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.is_u64() || n.is_i64() => Some(n.to_string()),
        _ => None,
    }
}

/// Accepts string or integer identifiers.
pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    id_string(&value).ok_or_else(|| de::Error::custom("expected a string or integer id"))
}

/// Inbound payload errors. Messages that fail to decode are dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` must be a {1}")]
    WrongType(&'static str, &'static str),
    #[error("edit span {from}..{to} is inverted")]
    InvertedSpan { from: usize, to: usize },
    #[error("malformed payload: {0}")]
    Malformed(String),
}
