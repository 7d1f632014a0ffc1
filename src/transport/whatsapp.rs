//! WhatsApp transport adapter over `whatsapp-rust`.
//!
//! One `Bot` per connected number. Device state lives in the crate's
//! own SQLite backend (one file per number); the Session row carries a
//! pointer to it so a restart can find the right backend again.
//!
//! Not every capability maps onto the crate's surface: read receipts
//! and group participant mutation are not exposed, and `logout`
//! unlinks locally by dropping the device state rather than remotely.

use async_trait::async_trait;
use courier_core::config::Config;
use courier_core::error::CourierError;
use courier_core::message::{MessageKey, RawMessage};
use courier_core::traits::{
    DisconnectReason, GroupMetadata, GroupParticipant, GroupRank, LinkEvent, ParticipantUpdate,
    SessionCredentials, Transport, TransportLink,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};
use wacore::proto_helpers::MessageExt;
use wacore::types::events::Event;
use wacore_binary::jid::Jid;
use whatsapp_rust::bot::Bot;
use whatsapp_rust::client::Client;
use whatsapp_rust::pair_code::PairCodeOptions;
use whatsapp_rust::store::traits::Backend;
use whatsapp_rust::store::SqliteStore;
use whatsapp_rust_tokio_transport::TokioWebSocketTransportFactory;
use whatsapp_rust_ureq_http_client::UreqHttpClient;

/// How long a pairing-code request waits for the transport to issue
/// one.
const PAIRING_CODE_WAIT: Duration = Duration::from_secs(60);

pub struct WhatsAppTransport {
    /// Directory holding one device-state database per number.
    session_dir: PathBuf,
}

impl WhatsAppTransport {
    pub fn new(config: &Config) -> Self {
        let base = Path::new(&config.store.db_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self {
            session_dir: base.join("wa-sessions"),
        }
    }

    fn session_db(&self, number: &str) -> PathBuf {
        self.session_dir.join(format!("{number}.db"))
    }
}

/// Buffers the pairing code emitted by the running bot until the
/// lifecycle asks for it.
#[derive(Default)]
struct PairingSlot {
    code: Mutex<Option<String>>,
    notify: Notify,
}

impl PairingSlot {
    fn put(&self, code: String) {
        *self.code.lock().unwrap() = Some(code);
        self.notify.notify_waiters();
    }

    async fn wait(&self, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(code) = self.code.lock().unwrap().clone() {
                return Some(code);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }
}

fn transport_err(context: &str, e: impl std::fmt::Display) -> CourierError {
    CourierError::Transport(format!("{context}: {e}"))
}

fn parse_jid(jid: &str) -> Result<Jid, CourierError> {
    jid.parse()
        .map_err(|e| transport_err(&format!("invalid jid '{jid}'"), e))
}

/// Reduce a `waproto` message to the JSON payload shape the classifier
/// works with. Only fields the dispatcher cares about are carried.
fn payload_json(msg: &waproto::whatsapp::Message) -> Value {
    let mut payload = serde_json::Map::new();

    if let Some(text) = msg.conversation.as_deref() {
        payload.insert("conversation".to_string(), json!(text));
    }
    if let Some(ext) = msg.extended_text_message.as_deref() {
        let mut inner = serde_json::Map::new();
        if let Some(text) = ext.text.as_deref() {
            inner.insert("text".to_string(), json!(text));
        }
        if let Some(ctx) = ext.context_info.as_deref() {
            let mut context = serde_json::Map::new();
            if let Some(participant) = ctx.participant.as_deref() {
                context.insert("participant".to_string(), json!(participant));
            }
            if let Some(stanza_id) = ctx.stanza_id.as_deref() {
                context.insert("stanzaId".to_string(), json!(stanza_id));
            }
            if let Some(quoted) = ctx.quoted_message.as_deref() {
                context.insert("quotedMessage".to_string(), payload_json(quoted));
            }
            if !ctx.mentioned_jid.is_empty() {
                context.insert("mentionedJid".to_string(), json!(ctx.mentioned_jid));
            }
            inner.insert("contextInfo".to_string(), Value::Object(context));
        }
        payload.insert("extendedTextMessage".to_string(), Value::Object(inner));
    }
    if let Some(img) = msg.image_message.as_deref() {
        payload.insert(
            "imageMessage".to_string(),
            json!({"caption": img.caption.as_deref().unwrap_or("")}),
        );
    }
    if let Some(video) = msg.video_message.as_deref() {
        payload.insert(
            "videoMessage".to_string(),
            json!({"caption": video.caption.as_deref().unwrap_or("")}),
        );
    }
    if msg.audio_message.is_some() {
        payload.insert("audioMessage".to_string(), json!({}));
    }
    if let Some(doc) = msg.document_message.as_deref() {
        payload.insert(
            "documentMessage".to_string(),
            json!({"caption": doc.caption.as_deref().unwrap_or("")}),
        );
    }
    if msg.sticker_message.is_some() {
        payload.insert("stickerMessage".to_string(), json!({}));
    }

    // Anything the mapping above missed still classifies through the
    // text helper.
    if payload.is_empty() {
        if let Some(text) = msg.text_content() {
            payload.insert("conversation".to_string(), json!(text));
        }
    }

    Value::Object(payload)
}

fn raw_message(msg: &waproto::whatsapp::Message, info: &wacore::types::message::MessageInfo) -> RawMessage {
    RawMessage {
        key: MessageKey {
            remote_jid: info.source.chat.to_string(),
            from_me: info.source.is_from_me,
            id: info.id.clone(),
            participant: if info.source.is_group {
                Some(info.source.sender.to_string())
            } else {
                None
            },
        },
        push_name: (!info.push_name.is_empty()).then(|| info.push_name.clone()),
        timestamp: chrono::Utc::now().timestamp(),
        content: Some(payload_json(msg)),
    }
}

#[async_trait]
impl Transport for WhatsAppTransport {
    async fn connect(
        &self,
        number: &str,
        stored: Option<SessionCredentials>,
    ) -> Result<(Arc<dyn TransportLink>, mpsc::Receiver<LinkEvent>), CourierError> {
        std::fs::create_dir_all(&self.session_dir)
            .map_err(|e| transport_err("session dir create failed", e))?;
        let db_path = self.session_db(number);

        let backend = Arc::new(
            SqliteStore::new(&db_path.to_string_lossy())
                .await
                .map_err(|e| transport_err("device store open failed", e))?,
        ) as Arc<dyn Backend>;

        let (event_tx, event_rx) = mpsc::channel::<LinkEvent>(64);
        let pairing = Arc::new(PairingSlot::default());

        let tx = event_tx.clone();
        let slot = pairing.clone();
        let self_number = number.to_string();
        let mut builder = Bot::builder()
            .with_backend(backend)
            .with_transport_factory(TokioWebSocketTransportFactory::new())
            .with_http_client(UreqHttpClient::new())
            .on_event(move |event, _client| {
                let tx = tx.clone();
                let slot = slot.clone();
                let number = self_number.clone();
                async move {
                    match event {
                        Event::Connected(_) => {
                            let _ = tx
                                .send(LinkEvent::Open {
                                    self_jid: format!("{number}@s.whatsapp.net"),
                                })
                                .await;
                        }
                        Event::LoggedOut(_) => {
                            let _ = tx
                                .send(LinkEvent::Closed {
                                    reason: DisconnectReason::LoggedOut,
                                })
                                .await;
                        }
                        Event::StreamError(stream_error) => {
                            warn!("whatsapp stream error for {number}: {stream_error:?}");
                            let _ = tx
                                .send(LinkEvent::Closed {
                                    reason: DisconnectReason::ConnectionLost,
                                })
                                .await;
                        }
                        Event::PairingCode { code, .. } => {
                            info!("pairing code issued for {number}");
                            slot.put(code);
                        }
                        Event::Message(msg, info) => {
                            let raw = raw_message(&msg, &info);
                            let _ = tx.send(LinkEvent::Message(Box::new(raw))).await;
                        }
                        _ => {}
                    }
                }
            });

        // Pair-code flow only when there is nothing to resume from.
        if stored.is_none() {
            builder = builder.with_pair_code(PairCodeOptions {
                phone_number: number.to_string(),
                ..Default::default()
            });
        }

        let mut bot = builder
            .build()
            .await
            .map_err(|e| transport_err("bot build failed", e))?;
        let client = bot.client();
        let mut run_handle = bot
            .run()
            .await
            .map_err(|e| transport_err("bot start failed", e))?;

        // The run loop ending without a classified reason still closes
        // the link.
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        {
            let tx = event_tx.clone();
            let number = number.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    result = &mut run_handle => {
                        if let Err(e) = result {
                            warn!("whatsapp run loop for {number} ended: {e}");
                        }
                        let _ = tx
                            .send(LinkEvent::Closed {
                                reason: DisconnectReason::ConnectionClosed,
                            })
                            .await;
                    }
                    _ = &mut close_rx => {
                        run_handle.abort();
                    }
                }
            });
        }

        // The device state lives in the crate's own backend; the
        // Session row records where.
        let _ = event_tx
            .send(LinkEvent::CredentialsUpdate(SessionCredentials {
                creds: json!({"deviceDb": db_path.to_string_lossy()}),
                keys: json!({}),
            }))
            .await;

        let link = Arc::new(WhatsAppLink {
            client,
            pairing,
            close: Mutex::new(Some(close_tx)),
            events: event_tx,
            db_path,
        });

        Ok((link, event_rx))
    }
}

struct WhatsAppLink {
    client: Arc<Client>,
    pairing: Arc<PairingSlot>,
    close: Mutex<Option<oneshot::Sender<()>>>,
    events: mpsc::Sender<LinkEvent>,
    db_path: PathBuf,
}

impl WhatsAppLink {
    fn signal_close(&self) {
        if let Some(tx) = self.close.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl TransportLink for WhatsAppLink {
    async fn request_pairing_code(&self, number: &str) -> Result<String, CourierError> {
        self.pairing
            .wait(PAIRING_CODE_WAIT)
            .await
            .ok_or_else(|| {
                CourierError::Transport(format!("no pairing code issued for {number} in time"))
            })
    }

    async fn send_text(
        &self,
        jid: &str,
        text: &str,
        quote: Option<&RawMessage>,
    ) -> Result<(), CourierError> {
        let jid = parse_jid(jid)?;

        let message = match quote {
            Some(quoted) => waproto::whatsapp::Message {
                extended_text_message: Some(Box::new(
                    waproto::whatsapp::message::ExtendedTextMessage {
                        text: Some(text.to_string()),
                        context_info: Some(Box::new(waproto::whatsapp::ContextInfo {
                            stanza_id: Some(quoted.key.id.clone()),
                            participant: quoted
                                .key
                                .participant
                                .clone()
                                .or_else(|| Some(quoted.key.remote_jid.clone())),
                            ..Default::default()
                        })),
                        ..Default::default()
                    },
                )),
                ..Default::default()
            },
            None => waproto::whatsapp::Message {
                conversation: Some(text.to_string()),
                ..Default::default()
            },
        };

        self.client
            .send_message(jid, message)
            .await
            .map_err(|e| transport_err("send failed", e))?;
        Ok(())
    }

    async fn react(&self, key: &MessageKey, emoji: &str) -> Result<(), CourierError> {
        let jid = parse_jid(&key.remote_jid)?;
        let message = waproto::whatsapp::Message {
            reaction_message: Some(Box::new(waproto::whatsapp::message::ReactionMessage {
                key: Some(waproto::whatsapp::MessageKey {
                    remote_jid: Some(key.remote_jid.clone()),
                    from_me: Some(key.from_me),
                    id: Some(key.id.clone()),
                    participant: key.participant.clone(),
                }),
                text: Some(emoji.to_string()),
                ..Default::default()
            })),
            ..Default::default()
        };
        self.client
            .send_message(jid, message)
            .await
            .map_err(|e| transport_err("reaction failed", e))?;
        Ok(())
    }

    async fn mark_read(&self, key: &MessageKey) -> Result<(), CourierError> {
        // Read receipts are not exposed by the crate surface in use.
        debug!("mark_read unsupported, skipping for {}", key.id);
        Ok(())
    }

    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata, CourierError> {
        let group_jid = parse_jid(jid)?;
        let group = self
            .client
            .query_group_metadata(&group_jid)
            .await
            .map_err(|e| transport_err("group metadata query failed", e))?;

        Ok(GroupMetadata {
            jid: jid.to_string(),
            subject: group.subject.clone(),
            participants: group
                .participants
                .iter()
                .map(|p| GroupParticipant {
                    jid: p.jid.to_string(),
                    rank: if p.is_super_admin {
                        GroupRank::Superadmin
                    } else if p.is_admin {
                        GroupRank::Admin
                    } else {
                        GroupRank::Member
                    },
                })
                .collect(),
        })
    }

    async fn update_participants(
        &self,
        _group_jid: &str,
        _members: &[String],
        _update: ParticipantUpdate,
    ) -> Result<(), CourierError> {
        Err(CourierError::Transport(
            "group participant updates are not exposed by this transport build".to_string(),
        ))
    }

    async fn subscribe_channel(&self, channel_jid: &str) -> Result<(), CourierError> {
        debug!("channel subscription unsupported, skipping {channel_jid}");
        Ok(())
    }

    async fn logout(&self) -> Result<(), CourierError> {
        // Local unlink: drop the socket and the device state so the
        // next pairing starts from scratch.
        self.signal_close();
        if let Err(e) = std::fs::remove_file(&self.db_path) {
            warn!("device store removal failed: {e}");
        }
        let _ = self
            .events
            .send(LinkEvent::Closed {
                reason: DisconnectReason::LoggedOut,
            })
            .await;
        Ok(())
    }

    async fn close(&self) {
        self.signal_close();
    }
}
