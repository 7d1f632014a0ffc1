//! # courier-plugins
//!
//! The command plugin interface, the registry that indexes plugins by
//! pattern and alias, and the built-in plugin set.

mod group;
mod misc;
mod registry;

pub use registry::Registry;

use async_trait::async_trait;
use courier_core::error::CourierError;
use courier_core::message::{self, Classified, RawMessage};
use courier_core::traits::{GroupMetadata, TransportLink};
use std::sync::Arc;

/// Static descriptor of a command: how it is invoked and presented.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    /// Primary invocation name.
    pub pattern: &'static str,
    /// Alternative names resolving to the same command.
    pub aliases: &'static [&'static str],
    pub desc: &'static str,
    /// Menu grouping.
    pub category: &'static str,
    /// Emoji the dispatcher reacts with before execution.
    pub react_with: Option<&'static str>,
}

/// A chat command. Implementations are registered through
/// [`Registry`]; there is exactly one registration interface.
#[async_trait]
pub trait Command: Send + Sync {
    fn spec(&self) -> &CommandSpec;

    /// Run the command. Errors are caught at the dispatch boundary,
    /// logged, and never surfaced to the chat.
    async fn execute(&self, inv: &Invocation) -> Result<(), CourierError>;
}

/// Everything a command execution may touch, resolved once per
/// inbound message by the dispatcher.
pub struct Invocation {
    pub link: Arc<dyn TransportLink>,
    /// The triggering message as received.
    pub raw: RawMessage,
    /// Classifier output for the triggering message.
    pub message: Classified,
    /// Chat JID the message arrived in.
    pub from: String,
    /// JID of the actual sender.
    pub sender: String,
    pub is_group: bool,
    /// Group metadata; `None` outside groups or when the fetch failed.
    pub group: Option<GroupMetadata>,
    pub is_admin: bool,
    pub is_owner: bool,
    /// Whitespace-split tokens after the command name.
    pub args: Vec<String>,
    /// Raw argument tail after the command name, trimmed.
    pub q: String,
}

impl Invocation {
    /// Reply in the originating chat, quoting the triggering message.
    pub async fn reply(&self, text: &str) -> Result<(), CourierError> {
        self.link.send_text(&self.from, text, Some(&self.raw)).await
    }

    /// Whether the sender may run moderation commands.
    pub fn can_moderate(&self) -> bool {
        self.is_admin || self.is_owner
    }

    /// Resolve the JIDs a moderation command targets: mentions first,
    /// then the quoted sender, then a phone number argument.
    pub fn targets(&self) -> Vec<String> {
        if !self.message.mentioned.is_empty() {
            return self.message.mentioned.clone();
        }
        if let Some(quoted) = &self.message.quoted {
            return vec![quoted.key.remote_jid.clone()];
        }
        self.args
            .iter()
            .filter_map(|arg| {
                let digits: String = arg.chars().filter(char::is_ascii_digit).collect();
                if digits.is_empty() {
                    None
                } else {
                    Some(format!("{digits}@s.whatsapp.net"))
                }
            })
            .collect()
    }

    /// Short display handle for a JID (`@user` mention text).
    pub fn mention_tag(jid: &str) -> String {
        format!("@{}", message::base_user(jid))
    }
}

/// The full built-in plugin set, in registration order.
pub fn builtin_set() -> Vec<Arc<dyn Command>> {
    vec![
        Arc::new(group::Promote),
        Arc::new(group::Demote),
        Arc::new(group::TagAll),
        Arc::new(misc::Jid),
        Arc::new(misc::Echo),
    ]
}
