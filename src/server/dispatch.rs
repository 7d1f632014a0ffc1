//! Command resolver and dispatcher.
//!
//! One inbound message resolves to at most one command invocation:
//! auto-status traffic is routed first, then the prefix is checked,
//! then built-ins, then the plugin registry. Unknown commands are
//! dropped silently and plugin failures never reach the chat.

use courier_core::config::Config;
use courier_core::message::{self, classify, Classified, RawMessage, STATUS_BROADCAST};
use courier_core::traits::TransportLink;
use courier_plugins::{Invocation, Registry};
use courier_store::{Store, UserSettings};
use std::sync::Arc;
use tracing::{debug, warn};

use super::builtins;

/// Parsed command line: name, positional args, raw tail.
pub(crate) struct ParsedCommand {
    pub name: String,
    pub args: Vec<String>,
    pub q: String,
}

/// Resolves inbound messages to command invocations.
pub struct Dispatcher {
    pub(crate) config: Arc<Config>,
    pub(crate) store: Store,
    pub(crate) registry: Arc<Registry>,
    pub(crate) defaults: UserSettings,
}

impl Dispatcher {
    pub fn new(config: Arc<Config>, store: Store, registry: Arc<Registry>) -> Self {
        let defaults = UserSettings::from_config(&config);
        Self {
            config,
            store,
            registry,
            defaults,
        }
    }

    /// Handle one inbound message for the session identified by
    /// `number`. `self_jid` is the authenticated account JID, empty
    /// until the link has opened.
    pub async fn dispatch(
        &self,
        link: Arc<dyn TransportLink>,
        number: &str,
        self_jid: &str,
        raw: RawMessage,
    ) {
        if raw.key.remote_jid == STATUS_BROADCAST {
            self.handle_status(&link, number, &raw).await;
            return;
        }
        if raw.content.is_none() {
            return;
        }

        let classified = classify(&raw);
        let settings = self.store.settings_or_default(number, &self.defaults).await;

        let Some(body) = classified.text.strip_prefix(&settings.prefix) else {
            return;
        };
        let body = body.trim_start();
        let Some(first) = body.split_whitespace().next() else {
            return;
        };
        let parsed = ParsedCommand {
            name: first.to_lowercase(),
            args: body
                .split_whitespace()
                .skip(1)
                .map(str::to_string)
                .collect(),
            q: body[first.len()..].trim().to_string(),
        };

        // Built-ins resolve before the registry and short-circuit.
        if builtins::try_handle(self, &link, number, self_jid, &raw, &settings, &parsed).await {
            return;
        }

        let Some(command) = self.registry.get(&parsed.name) else {
            debug!("unknown command '{}' from {number}", parsed.name);
            return;
        };

        let inv = self
            .build_invocation(link.clone(), raw, classified, self_jid, parsed)
            .await;

        if let Some(emoji) = command.spec().react_with {
            if let Err(e) = link.react(&inv.raw.key, emoji).await {
                debug!("command reaction failed: {e}");
            }
        }

        // Exactly one execution; errors are logged and never surfaced
        // to the chat.
        if let Err(e) = command.execute(&inv).await {
            warn!("command '{}' failed for {number}: {e}", command.spec().pattern);
        }
    }

    async fn build_invocation(
        &self,
        link: Arc<dyn TransportLink>,
        raw: RawMessage,
        classified: Classified,
        self_jid: &str,
        parsed: ParsedCommand,
    ) -> Invocation {
        let from = raw.key.remote_jid.clone();
        let is_group = message::is_group_jid(&from);
        let sender = raw
            .key
            .participant
            .clone()
            .unwrap_or_else(|| from.clone());

        // Metadata is fetched only for groups; a failed fetch downgrades
        // the permission flags instead of aborting dispatch.
        let group = if is_group {
            match link.group_metadata(&from).await {
                Ok(meta) => Some(meta),
                Err(e) => {
                    warn!("group metadata fetch failed for {from}: {e}");
                    None
                }
            }
        } else {
            None
        };

        let is_admin = group.as_ref().is_some_and(|g| g.is_admin(&sender));
        let is_owner =
            !self_jid.is_empty() && message::base_user(&sender) == message::base_user(self_jid);

        Invocation {
            link,
            raw,
            message: classified,
            from,
            sender,
            is_group,
            group,
            is_admin,
            is_owner,
            args: parsed.args,
            q: parsed.q,
        }
    }

    /// Auto-status handling: view/react/reply per the session's
    /// settings. Never reaches command parsing.
    async fn handle_status(&self, link: &Arc<dyn TransportLink>, number: &str, raw: &RawMessage) {
        let settings = self.store.settings_or_default(number, &self.defaults).await;

        if settings.auto_status_seen {
            if let Err(e) = link.mark_read(&raw.key).await {
                debug!("status mark-read failed: {e}");
            }
        }
        if settings.auto_status_react {
            let emoji = &self.config.auto_status.react_emoji;
            if let Err(e) = link.react(&raw.key, emoji).await {
                debug!("status reaction failed: {e}");
            }
        }
        if settings.auto_status_reply {
            if let Some(poster) = &raw.key.participant {
                let text = &self.config.auto_status.reply_text;
                if let Err(e) = link.send_text(poster, text, None).await {
                    debug!("status reply failed: {e}");
                }
            }
        }
    }
}
