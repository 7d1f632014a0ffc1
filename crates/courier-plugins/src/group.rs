//! Group moderation commands.

use crate::{Command, CommandSpec, Invocation};
use async_trait::async_trait;
use courier_core::error::CourierError;
use courier_core::traits::ParticipantUpdate;

/// Common guard for moderation commands: group chat, admin-or-owner
/// sender, at least one target. Replies with the failure reason and
/// returns `None` when any gate fails.
async fn moderation_targets(inv: &Invocation) -> Result<Option<Vec<String>>, CourierError> {
    if !inv.is_group {
        inv.reply("This command only works in group chats.").await?;
        return Ok(None);
    }
    if !inv.can_moderate() {
        inv.reply("Only group admins can use this command.").await?;
        return Ok(None);
    }
    let targets = inv.targets();
    if targets.is_empty() {
        inv.reply("Mention, quote, or name the member to target.")
            .await?;
        return Ok(None);
    }
    Ok(Some(targets))
}

fn tag_list(targets: &[String]) -> String {
    targets
        .iter()
        .map(|t| Invocation::mention_tag(t))
        .collect::<Vec<_>>()
        .join(", ")
}

pub struct Promote;

const PROMOTE: CommandSpec = CommandSpec {
    pattern: "promote",
    aliases: &["makeadmin"],
    desc: "Grant admin rank to the targeted members",
    category: "group",
    react_with: None,
};

#[async_trait]
impl Command for Promote {
    fn spec(&self) -> &CommandSpec {
        &PROMOTE
    }

    async fn execute(&self, inv: &Invocation) -> Result<(), CourierError> {
        let Some(targets) = moderation_targets(inv).await? else {
            return Ok(());
        };
        inv.link
            .update_participants(&inv.from, &targets, ParticipantUpdate::Promote)
            .await?;
        inv.reply(&format!("Promoted {}", tag_list(&targets))).await
    }
}

pub struct Demote;

const DEMOTE: CommandSpec = CommandSpec {
    pattern: "demote",
    aliases: &[],
    desc: "Remove admin rank from the targeted members",
    category: "group",
    react_with: None,
};

#[async_trait]
impl Command for Demote {
    fn spec(&self) -> &CommandSpec {
        &DEMOTE
    }

    async fn execute(&self, inv: &Invocation) -> Result<(), CourierError> {
        let Some(targets) = moderation_targets(inv).await? else {
            return Ok(());
        };
        inv.link
            .update_participants(&inv.from, &targets, ParticipantUpdate::Demote)
            .await?;
        inv.reply(&format!("Demoted {}", tag_list(&targets))).await
    }
}

pub struct TagAll;

const TAGALL: CommandSpec = CommandSpec {
    pattern: "tagall",
    aliases: &["everyone"],
    desc: "Mention every member of the group",
    category: "group",
    react_with: Some("\u{1f4e2}"),
};

#[async_trait]
impl Command for TagAll {
    fn spec(&self) -> &CommandSpec {
        &TAGALL
    }

    async fn execute(&self, inv: &Invocation) -> Result<(), CourierError> {
        if !inv.is_group {
            return inv.reply("This command only works in group chats.").await;
        }
        if !inv.can_moderate() {
            return inv.reply("Only group admins can use this command.").await;
        }
        let Some(group) = &inv.group else {
            return inv.reply("Could not load the member list.").await;
        };

        let mut out = String::new();
        if !inv.q.is_empty() {
            out.push_str(&inv.q);
            out.push_str("\n\n");
        }
        for participant in &group.participants {
            out.push_str(&Invocation::mention_tag(&participant.jid));
            out.push('\n');
        }
        inv.reply(out.trim_end()).await
    }
}
