//! Built-in commands resolved before the plugin registry.

use courier_core::config::Config;
use courier_core::message::{self, RawMessage};
use courier_core::traits::TransportLink;
use courier_plugins::CommandSpec;
use courier_store::UserSettings;
use std::sync::Arc;
use tracing::{debug, warn};

use super::dispatch::{Dispatcher, ParsedCommand};

/// Try to resolve the parsed command against the built-in set.
/// Returns `true` when the command was handled, short-circuiting
/// registry dispatch.
pub(super) async fn try_handle(
    dispatcher: &Dispatcher,
    link: &Arc<dyn TransportLink>,
    number: &str,
    self_jid: &str,
    raw: &RawMessage,
    settings: &UserSettings,
    parsed: &ParsedCommand,
) -> bool {
    match parsed.name.as_str() {
        "ping" | "speed" => {
            ping(link, raw).await;
            true
        }
        "prefix" => {
            prefix(dispatcher, link, number, self_jid, raw, settings, parsed).await;
            true
        }
        "menu" | "help" | "alias" => {
            let text = render_menu(
                &dispatcher.config,
                &settings.prefix,
                &dispatcher.registry.descriptors(),
            );
            reply(link, raw, &text).await;
            true
        }
        _ => false,
    }
}

async fn reply(link: &Arc<dyn TransportLink>, raw: &RawMessage, text: &str) {
    if let Err(e) = link.send_text(&raw.key.remote_jid, text, Some(raw)).await {
        debug!("builtin reply failed: {e}");
    }
}

async fn ping(link: &Arc<dyn TransportLink>, raw: &RawMessage) {
    let latency = (chrono::Utc::now().timestamp_millis() - raw.timestamp * 1000).max(0);
    reply(link, raw, &format!("Pong! {latency} ms")).await;
}

/// Owner-only prefix mutation. Without an argument, reports the
/// current prefix.
async fn prefix(
    dispatcher: &Dispatcher,
    link: &Arc<dyn TransportLink>,
    number: &str,
    self_jid: &str,
    raw: &RawMessage,
    settings: &UserSettings,
    parsed: &ParsedCommand,
) {
    let sender = raw.key.participant.as_deref().unwrap_or(&raw.key.remote_jid);
    let is_owner =
        !self_jid.is_empty() && message::base_user(sender) == message::base_user(self_jid);
    if !is_owner {
        reply(link, raw, "Only the session owner can change the prefix.").await;
        return;
    }

    let Some(new_prefix) = parsed.args.first() else {
        reply(
            link,
            raw,
            &format!(
                "Current prefix: {}\nUsage: {}prefix <new prefix>",
                settings.prefix, settings.prefix
            ),
        )
        .await;
        return;
    };

    match dispatcher
        .store
        .set_prefix(number, new_prefix, &dispatcher.defaults)
        .await
    {
        Ok(()) => reply(link, raw, &format!("Prefix changed to {new_prefix}")).await,
        Err(e) => warn!("prefix update failed for {number}: {e}"),
    }
}

fn render_menu(config: &Config, prefix: &str, specs: &[CommandSpec]) -> String {
    let mut out = format!(
        "{} command menu\nowner: {}\nprefix: {}\n",
        config.bot.name, config.bot.owner_name, prefix
    );

    out.push_str("\ncore\n");
    for (name, desc) in [
        ("ping", "Measure round-trip latency"),
        ("prefix", "Change the command prefix (owner only)"),
        ("menu", "Show this menu"),
    ] {
        out.push_str(&format!("  {prefix}{name}: {desc}\n"));
    }

    // Categories in registration order.
    let mut categories: Vec<&str> = Vec::new();
    for spec in specs {
        if !categories.contains(&spec.category) {
            categories.push(spec.category);
        }
    }
    for category in categories {
        out.push_str(&format!("\n{category}\n"));
        for spec in specs.iter().filter(|s| s.category == category) {
            out.push_str(&format!("  {prefix}{}: {}\n", spec.pattern, spec.desc));
        }
    }

    if !config.bot.menu_image_url.is_empty() {
        out.push('\n');
        out.push_str(&config.bot.menu_image_url);
        out.push('\n');
    }

    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testutil::{text_message, RecordingLink};
    use courier_core::config::StoreConfig;
    use courier_plugins::{builtin_set, Registry};
    use courier_store::Store;

    async fn dispatcher() -> Dispatcher {
        let store = Store::new(&StoreConfig {
            db_path: ":memory:".to_string(),
        })
        .await
        .unwrap();
        Dispatcher::new(
            Arc::new(Config::default()),
            store,
            Arc::new(Registry::new(builtin_set())),
        )
    }

    #[tokio::test]
    async fn ping_replies_with_latency() {
        let dispatcher = dispatcher().await;
        let link = Arc::new(RecordingLink::default());

        dispatcher
            .dispatch(link.clone(), "111", "", text_message(".ping"))
            .await;

        let sent = link.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.starts_with("Pong!"));
    }

    #[tokio::test]
    async fn speed_is_an_alias_for_ping() {
        let dispatcher = dispatcher().await;
        let link = Arc::new(RecordingLink::default());

        dispatcher
            .dispatch(link.clone(), "111", "", text_message(".speed"))
            .await;

        assert!(link.sent.lock().unwrap()[0].1.starts_with("Pong!"));
    }

    #[tokio::test]
    async fn prefix_change_requires_owner() {
        let dispatcher = dispatcher().await;
        let link = Arc::new(RecordingLink::default());

        // Sender 15551234567, authenticated account is someone else.
        dispatcher
            .dispatch(
                link.clone(),
                "111",
                "19998887777@s.whatsapp.net",
                text_message(".prefix !"),
            )
            .await;

        let sent = link.sent.lock().unwrap();
        assert!(sent[0].1.contains("owner"));
        drop(sent);
        assert!(dispatcher.store.get_settings("111").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn owner_prefix_change_persists() {
        let dispatcher = dispatcher().await;
        let link = Arc::new(RecordingLink::default());

        dispatcher
            .dispatch(
                link.clone(),
                "111",
                "15551234567@s.whatsapp.net",
                text_message(".prefix !"),
            )
            .await;

        let sent = link.sent.lock().unwrap();
        assert!(sent[0].1.contains('!'));
        drop(sent);

        let settings = dispatcher.store.get_settings("111").await.unwrap().unwrap();
        assert_eq!(settings.prefix, "!");

        // The new prefix is effective on the next message.
        dispatcher
            .dispatch(
                link.clone(),
                "111",
                "15551234567@s.whatsapp.net",
                text_message("!ping"),
            )
            .await;
        assert_eq!(link.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn prefix_without_argument_reports_current() {
        let dispatcher = dispatcher().await;
        let link = Arc::new(RecordingLink::default());

        dispatcher
            .dispatch(
                link.clone(),
                "111",
                "15551234567@s.whatsapp.net",
                text_message(".prefix"),
            )
            .await;

        assert!(link.sent.lock().unwrap()[0].1.contains("Current prefix: ."));
    }

    #[tokio::test]
    async fn menu_lists_builtins_and_registered_commands() {
        let dispatcher = dispatcher().await;
        let link = Arc::new(RecordingLink::default());

        dispatcher
            .dispatch(link.clone(), "111", "", text_message(".menu"))
            .await;

        let sent = link.sent.lock().unwrap();
        let menu = &sent[0].1;
        assert!(menu.contains(".ping"));
        assert!(menu.contains(".promote"));
        assert!(menu.contains(".echo"));
        assert!(menu.contains("Courier"));
    }

    #[tokio::test]
    async fn alias_triggers_the_menu() {
        let dispatcher = dispatcher().await;
        let link = Arc::new(RecordingLink::default());

        dispatcher
            .dispatch(link.clone(), "111", "", text_message(".alias"))
            .await;

        let sent = link.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("command menu"));
    }

    #[tokio::test]
    async fn builtins_shadow_registry_entries() {
        // A plugin registered under "ping" never runs; the built-in
        // wins.
        let dispatcher = dispatcher().await;
        let link = Arc::new(RecordingLink::default());

        dispatcher
            .dispatch(link.clone(), "111", "", text_message(".help"))
            .await;

        let sent = link.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("command menu"));
    }
}
