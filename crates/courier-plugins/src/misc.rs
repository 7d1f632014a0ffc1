//! Utility commands.

use crate::{Command, CommandSpec, Invocation};
use async_trait::async_trait;
use courier_core::error::CourierError;

pub struct Jid;

const JID: CommandSpec = CommandSpec {
    pattern: "jid",
    aliases: &["id"],
    desc: "Show the chat and sender identifiers",
    category: "utility",
    react_with: None,
};

#[async_trait]
impl Command for Jid {
    fn spec(&self) -> &CommandSpec {
        &JID
    }

    async fn execute(&self, inv: &Invocation) -> Result<(), CourierError> {
        inv.reply(&format!("chat: {}\nsender: {}", inv.from, inv.sender))
            .await
    }
}

pub struct Echo;

const ECHO: CommandSpec = CommandSpec {
    pattern: "echo",
    aliases: &["say"],
    desc: "Repeat the given text",
    category: "utility",
    react_with: None,
};

#[async_trait]
impl Command for Echo {
    fn spec(&self) -> &CommandSpec {
        &ECHO
    }

    async fn execute(&self, inv: &Invocation) -> Result<(), CourierError> {
        if inv.q.is_empty() {
            return inv.reply("Nothing to echo.").await;
        }
        inv.reply(&inv.q).await
    }
}
