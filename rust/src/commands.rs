//! Handlers behind the bot's slash commands.
//!
//! The interaction transport decodes a command and the invoking member into a
//! [`CommandContext`], calls [`handle`], and sends the [`CommandReply`] back
//! privately to the invoker. Admin commands are rejected before any state is
//! read or written.

use thiserror::Error;
use tracing::{info, warn};

use crate::eligibility::{self, Ineligible};
use crate::engine::{KeyPolicy, TransferEngine, TransferError, TransferOutcome, TransferReason};
use crate::model::{CustodyRecord, GuildId, MemberId, TransferEvent};
use crate::notice;
use crate::platform::{Member, OutboundMessage, PlatformError};
use crate::store::StoreError;

pub const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ShowKey,
    NewKey,
    TransferKey { target: MemberId },
    ForceTransfer,
    History { limit: Option<usize> },
    AmIKeyOwner,
    VerifyKey { key: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ShowKey => "showkey",
            Command::NewKey => "newkey",
            Command::TransferKey { .. } => "transferkey",
            Command::ForceTransfer => "forcetransfer",
            Command::History { .. } => "history",
            Command::AmIKeyOwner => "amikeyowner",
            Command::VerifyKey { .. } => "verifykey",
        }
    }

    pub fn requires_admin(&self) -> bool {
        !matches!(self, Command::AmIKeyOwner | Command::VerifyKey { .. })
    }
}

/// Who invoked a command and where.
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// `None` when the command arrived outside a guild (direct messages).
    pub guild: Option<GuildId>,
    pub invoker: Member,
}

#[derive(Debug)]
pub enum CommandOutput {
    CurrentKey(CustodyRecord),
    Transferred(TransferOutcome),
    History(Vec<TransferEvent>),
    Ownership(bool),
    Verification(bool),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("You don't have permission to use this command.")]
    Unauthorized,
    #[error("Failed to find a valid member to assign the key.")]
    NoEligibleCandidate,
    #[error("Cannot transfer key to a bot.")]
    TargetIsBot,
    #[error("Cannot transfer key to an admin.")]
    TargetIsAdmin,
    #[error("That member could not be found in this server.")]
    UnknownMember,
    #[error("An error occurred: {0}")]
    Internal(String),
}

impl From<TransferError> for CommandError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::NoEligibleCandidate => CommandError::NoEligibleCandidate,
            other => CommandError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        CommandError::Internal(err.to_string())
    }
}

impl From<PlatformError> for CommandError {
    fn from(err: PlatformError) -> Self {
        CommandError::Internal(err.to_string())
    }
}

impl From<Ineligible> for CommandError {
    fn from(reason: Ineligible) -> Self {
        match reason {
            Ineligible::Bot => CommandError::TargetIsBot,
            Ineligible::Admin => CommandError::TargetIsAdmin,
        }
    }
}

/// Private reply for the invoking member.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub success: bool,
    /// Always true: replies are only visible to the invoker.
    pub ephemeral: bool,
    pub message: OutboundMessage,
}

impl CommandReply {
    pub fn from_result(ctx: &CommandContext, result: &Result<CommandOutput, CommandError>) -> Self {
        let (success, message) = match result {
            Ok(output) => (true, render(ctx, output)),
            Err(err) => (false, OutboundMessage::text(err.to_string())),
        };
        Self {
            success,
            ephemeral: true,
            message,
        }
    }
}

fn render(ctx: &CommandContext, output: &CommandOutput) -> OutboundMessage {
    let mention = ctx.invoker.id.mention();
    match output {
        CommandOutput::CurrentKey(record) => notice::current_key(record),
        CommandOutput::Transferred(outcome) => OutboundMessage::text(format!(
            "Transferred the key to {} ({}).",
            outcome.event.new_holder.mention(),
            outcome.event.reason
        )),
        CommandOutput::History(events) => notice::history(events),
        CommandOutput::Ownership(true) => {
            OutboundMessage::text(format!("Yes, {mention}, you are the current key holder! 🔑"))
        }
        CommandOutput::Ownership(false) => {
            OutboundMessage::text(format!("No, {mention}, you are not the current key holder."))
        }
        CommandOutput::Verification(true) => {
            OutboundMessage::text("Key verified! You are indeed the rightful key holder. 🔑")
        }
        CommandOutput::Verification(false) => OutboundMessage::text("Invalid key or you are not the key holder."),
    }
}

fn is_admin(engine: &TransferEngine, ctx: &CommandContext) -> bool {
    ctx.guild.is_some() && ctx.invoker.has_role(engine.settings().admin_role)
}

/// Runs `command` for the invoker described by `ctx`.
pub async fn handle(
    engine: &TransferEngine,
    ctx: &CommandContext,
    command: Command,
) -> Result<CommandOutput, CommandError> {
    if command.requires_admin() && !is_admin(engine, ctx) {
        warn!(command = command.name(), invoker = %ctx.invoker.id, "unauthorized command rejected");
        return Err(CommandError::Unauthorized);
    }

    match command {
        Command::ShowKey => Ok(CommandOutput::CurrentKey(engine.ledger().read().await?)),
        Command::NewKey => {
            let guild = admin_guild(ctx)?;
            let outcome = engine
                .rotate(guild, TransferReason::AdminGeneratedNewKey, KeyPolicy::Regenerate)
                .await?;
            info!(invoker = %ctx.invoker.id, holder = %outcome.event.new_holder, "new key generated");
            Ok(CommandOutput::Transferred(outcome))
        }
        Command::TransferKey { target } => {
            let guild = admin_guild(ctx)?;
            let member = engine
                .gateway()
                .member(guild, target)
                .await?
                .ok_or(CommandError::UnknownMember)?;
            eligibility::check_member(&member, engine.settings().admin_role)?;
            let reason = TransferReason::ManualTransfer {
                by: ctx.invoker.username.clone(),
            };
            Ok(CommandOutput::Transferred(engine.transfer(guild, member.id, reason).await?))
        }
        Command::ForceTransfer => {
            let guild = admin_guild(ctx)?;
            let reason = TransferReason::ForcedTransfer {
                by: ctx.invoker.username.clone(),
            };
            Ok(CommandOutput::Transferred(engine.rotate(guild, reason, KeyPolicy::Keep).await?))
        }
        Command::History { limit } => {
            let record = engine.ledger().read().await?;
            let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
            Ok(CommandOutput::History(record.recent_history(limit).cloned().collect()))
        }
        Command::AmIKeyOwner => {
            let record = engine.ledger().read().await?;
            Ok(CommandOutput::Ownership(record.is_holder(ctx.invoker.id)))
        }
        Command::VerifyKey { key } => {
            let record = engine.ledger().read().await?;
            Ok(CommandOutput::Verification(record.verify(ctx.invoker.id, &key)))
        }
    }
}

fn admin_guild(ctx: &CommandContext) -> Result<GuildId, CommandError> {
    ctx.guild.ok_or(CommandError::Unauthorized)
}
