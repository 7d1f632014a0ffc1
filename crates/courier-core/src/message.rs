//! Raw message model and the message classifier.
//!
//! The transport hands over messages with their wire payload as a JSON
//! object keyed by message-type field (`conversation`,
//! `extendedTextMessage`, `imageMessage`, ...). The classifier reduces
//! that to a `{kind, text, quoted}` triple the dispatcher works with.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Chat JID that carries status posts instead of conversation.
pub const STATUS_BROADCAST: &str = "status@broadcast";

/// Domain suffix of group chat JIDs.
pub const GROUP_SUFFIX: &str = "@g.us";

/// Addressing key of a transport message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageKey {
    /// Chat the message belongs to.
    pub remote_jid: String,
    /// Whether the authenticated account sent it.
    pub from_me: bool,
    /// Transport-assigned message id.
    pub id: String,
    /// Actual sender inside a group chat.
    pub participant: Option<String>,
}

/// A raw inbound message as emitted by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub key: MessageKey,
    pub push_name: Option<String>,
    /// Unix seconds.
    pub timestamp: i64,
    /// Wire payload; `None` for keyless protocol events.
    pub content: Option<Value>,
}

/// Resolved message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Contact,
    Location,
    /// A `*Message` payload outside the known set; holds the
    /// uppercased field prefix (e.g. `POLLCREATION`).
    Other(String),
    Unknown,
}

impl MessageKind {
    /// Wire tag for this kind.
    pub fn tag(&self) -> &str {
        match self {
            Self::Text => "TEXT",
            Self::Image => "IMAGE",
            Self::Video => "VIDEO",
            Self::Audio => "AUDIO",
            Self::Document => "DOCUMENT",
            Self::Sticker => "STICKER",
            Self::Contact => "CONTACT",
            Self::Location => "LOCATION",
            Self::Other(tag) => tag,
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Placeholder text shown when a payload carries no caption.
    fn placeholder(&self) -> String {
        match self {
            Self::Image => "[Image]".to_string(),
            Self::Video => "[Video]".to_string(),
            Self::Audio => "[Audio]".to_string(),
            Self::Document => "[Document]".to_string(),
            Self::Sticker => "[Sticker]".to_string(),
            Self::Contact => "[Contact]".to_string(),
            Self::Location => "[Location]".to_string(),
            other => format!("[{}]", other.tag()),
        }
    }
}

/// A message quoted by another message, reconstructed from quoting
/// context.
#[derive(Debug, Clone)]
pub struct QuotedMessage {
    pub key: MessageKey,
    pub kind: MessageKind,
    pub content: Value,
}

/// Classifier output.
#[derive(Debug, Clone)]
pub struct Classified {
    pub kind: MessageKind,
    pub text: String,
    pub quoted: Option<QuotedMessage>,
    /// JIDs mentioned by the message.
    pub mentioned: Vec<String>,
}

/// Whether a JID addresses a group chat.
pub fn is_group_jid(jid: &str) -> bool {
    jid.ends_with(GROUP_SUFFIX)
}

/// Base identifier of a JID: the user part with any device suffix
/// stripped (`1234:5@s.whatsapp.net` → `1234`).
pub fn base_user(jid: &str) -> &str {
    let user = jid.split('@').next().unwrap_or(jid);
    user.split(':').next().unwrap_or(user)
}

const MEDIA_FIELDS: &[(&str, MessageKind)] = &[
    ("imageMessage", MessageKind::Image),
    ("videoMessage", MessageKind::Video),
    ("audioMessage", MessageKind::Audio),
    ("documentMessage", MessageKind::Document),
    ("stickerMessage", MessageKind::Sticker),
    ("contactMessage", MessageKind::Contact),
    ("locationMessage", MessageKind::Location),
];

/// Resolve the kind of a wire payload object.
fn payload_kind(payload: &serde_json::Map<String, Value>) -> MessageKind {
    let has_body = payload
        .get("conversation")
        .and_then(Value::as_str)
        .is_some_and(|s| !s.is_empty())
        || payload
            .get("extendedTextMessage")
            .and_then(|e| e.get("text"))
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty());
    if has_body {
        return MessageKind::Text;
    }

    for (field, kind) in MEDIA_FIELDS {
        if payload.contains_key(*field) {
            return kind.clone();
        }
    }

    // Fallback: any other `*Message` field names the type.
    if let Some(key) = payload.keys().find(|k| k.ends_with("Message")) {
        let prefix = &key[..key.len() - "Message".len()];
        if !prefix.is_empty() {
            return MessageKind::Other(prefix.to_uppercase());
        }
    }

    MessageKind::Unknown
}

/// Extract display text for a payload of the given kind.
fn payload_text(payload: &serde_json::Map<String, Value>, kind: &MessageKind) -> String {
    match kind {
        MessageKind::Text => payload
            .get("conversation")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .or_else(|| {
                payload
                    .get("extendedTextMessage")
                    .and_then(|e| e.get("text"))
                    .and_then(Value::as_str)
            })
            .unwrap_or("")
            .to_string(),
        MessageKind::Image
        | MessageKind::Video
        | MessageKind::Audio
        | MessageKind::Document
        | MessageKind::Sticker
        | MessageKind::Contact
        | MessageKind::Location => {
            let field = MEDIA_FIELDS
                .iter()
                .find(|(_, k)| k == kind)
                .map(|(f, _)| *f)
                .unwrap_or_default();
            payload
                .get(field)
                .and_then(|m| m.get("caption"))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| kind.placeholder())
        }
        other => other.placeholder(),
    }
}

/// Find the quoting context carried by a payload. Context lives inside
/// the message-type object (`extendedTextMessage.contextInfo`,
/// `imageMessage.contextInfo`, ...).
fn context_info(payload: &serde_json::Map<String, Value>) -> Option<&Value> {
    if let Some(ctx) = payload
        .get("extendedTextMessage")
        .and_then(|e| e.get("contextInfo"))
    {
        return Some(ctx);
    }
    payload
        .values()
        .filter_map(|v| v.get("contextInfo"))
        .next()
}

/// Build the synthetic quoted-message record from quoting context.
fn extract_quoted(ctx: &Value, outer: &MessageKey) -> Option<QuotedMessage> {
    let participant = ctx.get("participant").and_then(Value::as_str)?;
    let quoted_payload = ctx.get("quotedMessage")?;
    let payload_obj = quoted_payload.as_object()?;

    // fromMe: the quoting participant is the outer message's own
    // participant (group) or chat JID (direct).
    let own = outer.participant.as_deref().unwrap_or(&outer.remote_jid);
    let from_me = base_user(participant) == base_user(own);

    let stanza_id = ctx
        .get("stanzaId")
        .and_then(Value::as_str)
        .unwrap_or_default();

    Some(QuotedMessage {
        key: MessageKey {
            remote_jid: participant.to_string(),
            from_me,
            id: stanza_id.to_string(),
            participant: Some(participant.to_string()),
        },
        kind: payload_kind(payload_obj),
        content: quoted_payload.clone(),
    })
}

/// Classify a raw transport message into `{kind, text, quoted}`.
pub fn classify(raw: &RawMessage) -> Classified {
    let Some(payload) = raw.content.as_ref().and_then(Value::as_object) else {
        return Classified {
            kind: MessageKind::Unknown,
            text: MessageKind::Unknown.placeholder(),
            quoted: None,
            mentioned: Vec::new(),
        };
    };

    let kind = payload_kind(payload);
    let text = payload_text(payload, &kind);

    let ctx = context_info(payload);
    let quoted = ctx.and_then(|c| extract_quoted(c, &raw.key));
    let mentioned = ctx
        .and_then(|c| c.get("mentionedJid"))
        .and_then(Value::as_array)
        .map(|jids| {
            jids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Classified {
        kind,
        text,
        quoted,
        mentioned,
    }
}
