use crate::error::CourierError;
use crate::message::{self, MessageKey, RawMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Opaque transport authentication material persisted per session.
///
/// The transport defines the shape; Courier only stores and returns
/// it. Losing an update forces the user to re-pair, so writes are
/// never deferred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCredentials {
    /// Transport auth blob.
    pub creds: Value,
    /// Signal/key material backing the auth state.
    pub keys: Value,
}

/// Classified reason for a link closing.
///
/// Classification is by reason code from the transport, never by
/// heuristic; exactly one variant applies per close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The account was unlinked on the phone. Terminal.
    LoggedOut,
    /// Server closed the stream.
    ConnectionClosed,
    /// Network failure.
    ConnectionLost,
}

impl DisconnectReason {
    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }

    /// Whether a reconnect may be attempted for this reason.
    pub fn should_reconnect(&self) -> bool {
        !self.is_logged_out()
    }
}

/// Events emitted by an established link, in transport order.
#[derive(Debug)]
pub enum LinkEvent {
    /// Updated credential material; must be persisted before further
    /// processing.
    CredentialsUpdate(SessionCredentials),
    /// Handshake completed; the authenticated account JID is known.
    Open { self_jid: String },
    /// Link closed with a classified reason.
    Closed { reason: DisconnectReason },
    /// Inbound message.
    Message(Box<RawMessage>),
}

/// Rank of a group member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRank {
    Member,
    Admin,
    Superadmin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupParticipant {
    pub jid: String,
    pub rank: GroupRank,
}

impl GroupParticipant {
    pub fn is_admin(&self) -> bool {
        matches!(self.rank, GroupRank::Admin | GroupRank::Superadmin)
    }
}

/// Group metadata as fetched from the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub jid: String,
    pub subject: String,
    pub participants: Vec<GroupParticipant>,
}

impl GroupMetadata {
    /// Find a participant by JID, ignoring device suffixes.
    pub fn participant(&self, jid: &str) -> Option<&GroupParticipant> {
        let base = message::base_user(jid);
        self.participants
            .iter()
            .find(|p| message::base_user(&p.jid) == base)
    }

    /// Whether the JID holds admin or superadmin rank.
    pub fn is_admin(&self, jid: &str) -> bool {
        self.participant(jid).is_some_and(GroupParticipant::is_admin)
    }
}

/// Group participant mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantUpdate {
    Promote,
    Demote,
    Remove,
}

/// Transport factory — establishes one link per phone number.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link for `number`, resuming from stored credentials when
    /// present. Returns the capability handle and its event stream.
    async fn connect(
        &self,
        number: &str,
        stored: Option<SessionCredentials>,
    ) -> Result<(Arc<dyn TransportLink>, mpsc::Receiver<LinkEvent>), CourierError>;
}

/// Per-session capability surface of an established link.
#[async_trait]
pub trait TransportLink: Send + Sync {
    /// Request a pairing code for a not-yet-paired number.
    async fn request_pairing_code(&self, number: &str) -> Result<String, CourierError>;

    /// Send a text message, optionally quoting the triggering message.
    async fn send_text(
        &self,
        jid: &str,
        text: &str,
        quote: Option<&RawMessage>,
    ) -> Result<(), CourierError>;

    /// React to a message with an emoji.
    async fn react(&self, key: &MessageKey, emoji: &str) -> Result<(), CourierError>;

    /// Mark a message as read.
    async fn mark_read(&self, key: &MessageKey) -> Result<(), CourierError>;

    /// Fetch metadata for a group chat.
    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata, CourierError>;

    /// Promote, demote, or remove group participants.
    async fn update_participants(
        &self,
        group_jid: &str,
        members: &[String],
        update: ParticipantUpdate,
    ) -> Result<(), CourierError>;

    /// Follow a channel. Best-effort; failures are per-channel.
    async fn subscribe_channel(&self, _channel_jid: &str) -> Result<(), CourierError> {
        Ok(())
    }

    /// Unlink the account. The transport will emit a logged-out close.
    async fn logout(&self) -> Result<(), CourierError>;

    /// Drop the socket without unlinking.
    async fn close(&self);
}
