//! Shared mocks for server tests: a recording transport link and a
//! scripted transport factory.

use async_trait::async_trait;
use courier_core::error::CourierError;
use courier_core::message::{MessageKey, RawMessage};
use courier_core::traits::{
    GroupMetadata, GroupParticipant, GroupRank, LinkEvent, ParticipantUpdate, SessionCredentials,
    Transport, TransportLink,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// A direct-chat text message from a fixed test sender.
pub fn text_message(text: &str) -> RawMessage {
    RawMessage {
        key: MessageKey {
            remote_jid: "15551234567@s.whatsapp.net".to_string(),
            from_me: false,
            id: "MSG1".to_string(),
            participant: None,
        },
        push_name: Some("Tester".to_string()),
        timestamp: chrono::Utc::now().timestamp(),
        content: Some(json!({"conversation": text})),
    }
}

/// Transport link that records every outbound call.
#[derive(Default)]
pub struct RecordingLink {
    pub sent: Mutex<Vec<(String, String)>>,
    pub reactions: Mutex<Vec<(String, String)>>,
    pub read_marks: Mutex<Vec<String>>,
    pub participant_updates: Mutex<Vec<(String, Vec<String>, ParticipantUpdate)>>,
    pub subscriptions: Mutex<Vec<String>>,
    pub closed: AtomicBool,
    fail_metadata: bool,
    fail_pairing: bool,
    fail_subscribe: Vec<String>,
    group: Option<GroupMetadata>,
}

impl RecordingLink {
    pub fn failing_metadata() -> Self {
        Self {
            fail_metadata: true,
            ..Self::default()
        }
    }

    pub fn with_group(participants: &[(&str, GroupRank)]) -> Self {
        Self {
            group: Some(GroupMetadata {
                jid: "123-456@g.us".to_string(),
                subject: "Test Group".to_string(),
                participants: participants
                    .iter()
                    .map(|(jid, rank)| GroupParticipant {
                        jid: jid.to_string(),
                        rank: *rank,
                    })
                    .collect(),
            }),
            ..Self::default()
        }
    }
}

#[async_trait]
impl TransportLink for RecordingLink {
    async fn request_pairing_code(&self, _number: &str) -> Result<String, CourierError> {
        if self.fail_pairing {
            return Err(CourierError::Transport("pairing unavailable".into()));
        }
        Ok("TEST-CODE".to_string())
    }

    async fn send_text(
        &self,
        jid: &str,
        text: &str,
        _quote: Option<&RawMessage>,
    ) -> Result<(), CourierError> {
        self.sent
            .lock()
            .unwrap()
            .push((jid.to_string(), text.to_string()));
        Ok(())
    }

    async fn react(&self, key: &MessageKey, emoji: &str) -> Result<(), CourierError> {
        self.reactions
            .lock()
            .unwrap()
            .push((key.id.clone(), emoji.to_string()));
        Ok(())
    }

    async fn mark_read(&self, key: &MessageKey) -> Result<(), CourierError> {
        self.read_marks.lock().unwrap().push(key.id.clone());
        Ok(())
    }

    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata, CourierError> {
        if self.fail_metadata {
            return Err(CourierError::Transport("metadata query failed".into()));
        }
        self.group
            .clone()
            .map(|mut g| {
                g.jid = jid.to_string();
                g
            })
            .ok_or_else(|| CourierError::Transport("no group configured".into()))
    }

    async fn update_participants(
        &self,
        group_jid: &str,
        members: &[String],
        update: ParticipantUpdate,
    ) -> Result<(), CourierError> {
        self.participant_updates.lock().unwrap().push((
            group_jid.to_string(),
            members.to_vec(),
            update,
        ));
        Ok(())
    }

    async fn subscribe_channel(&self, channel_jid: &str) -> Result<(), CourierError> {
        if self.fail_subscribe.iter().any(|c| c == channel_jid) {
            return Err(CourierError::Transport("subscription rejected".into()));
        }
        self.subscriptions
            .lock()
            .unwrap()
            .push(channel_jid.to_string());
        Ok(())
    }

    async fn logout(&self) -> Result<(), CourierError> {
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// One scripted connection: the link handed out and the event sender
/// the test drives it with.
pub struct MockConnection {
    pub link: Arc<RecordingLink>,
    pub tx: mpsc::Sender<LinkEvent>,
    pub at: tokio::time::Instant,
    pub had_credentials: bool,
}

/// Transport factory producing recording links on demand.
#[derive(Default)]
pub struct MockTransport {
    pub connections: Mutex<Vec<MockConnection>>,
    pub fail_connect: AtomicBool,
    pub fail_pairing: AtomicBool,
    /// Channel JIDs every produced link refuses to subscribe to.
    pub subscribe_failures: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn connect_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn connection(&self, index: usize) -> (Arc<RecordingLink>, mpsc::Sender<LinkEvent>) {
        let connections = self.connections.lock().unwrap();
        let conn = &connections[index];
        (conn.link.clone(), conn.tx.clone())
    }

    pub fn connect_instants(&self) -> Vec<tokio::time::Instant> {
        self.connections.lock().unwrap().iter().map(|c| c.at).collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        _number: &str,
        stored: Option<SessionCredentials>,
    ) -> Result<(Arc<dyn TransportLink>, mpsc::Receiver<LinkEvent>), CourierError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(CourierError::Transport("connect refused".into()));
        }
        let (tx, rx) = mpsc::channel(16);
        let link = Arc::new(RecordingLink {
            fail_pairing: self.fail_pairing.load(Ordering::SeqCst),
            fail_subscribe: self.subscribe_failures.lock().unwrap().clone(),
            ..RecordingLink::default()
        });
        self.connections.lock().unwrap().push(MockConnection {
            link: link.clone(),
            tx,
            at: tokio::time::Instant::now(),
            had_credentials: stored.is_some(),
        });
        Ok((link, rx))
    }
}
