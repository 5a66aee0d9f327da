//! Boundary to the chat platform.
//!
//! The custody logic never talks to Discord directly; it goes through
//! [`GuildGateway`], which the REST adapter in `discord` implements and which
//! tests replace with an in-memory guild.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::model::{ChannelId, GuildId, MemberId, RoleId};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("rate limited; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("response decode failed: {0}")]
    Decode(String),
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound(_))
    }
}

/// A guild member as the custody logic sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: MemberId,
    /// Account username, stable across guilds. Used in history reasons.
    pub username: String,
    /// Guild nickname, else global display name, else username.
    pub name: String,
    /// Automated (bot) account.
    pub bot: bool,
    pub roles: Vec<RoleId>,
}

impl Member {
    pub fn has_role(&self, role: RoleId) -> bool {
        self.roles.contains(&role)
    }
}

/// The account the bot is logged in as.
#[derive(Debug, Clone)]
pub struct BotIdentity {
    pub id: MemberId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Rich message block, serialized in Discord's embed shape.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Embed {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn color(mut self, color: u32) -> Self {
        self.color = Some(color);
        self
    }

    pub fn timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        self.fields.push(EmbedField {
            name: name.into(),
            value: value.into(),
            inline,
        });
        self
    }
}

/// A message ready to be posted to a channel or a member's DMs.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct OutboundMessage {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            embeds: Vec::new(),
        }
    }

    pub fn embed(embed: Embed) -> Self {
        Self {
            content: String::new(),
            embeds: vec![embed],
        }
    }
}

/// Operations the custody logic needs from the chat platform.
#[async_trait]
pub trait GuildGateway: Send + Sync {
    /// Identity of the connected bot. A successful call means the connection is ready.
    async fn current_user(&self) -> Result<BotIdentity, PlatformError>;

    /// Guilds the bot is a member of.
    async fn guilds(&self) -> Result<Vec<GuildId>, PlatformError>;

    /// Current membership of `guild`, fetched fresh on every call.
    async fn members(&self, guild: GuildId) -> Result<Vec<Member>, PlatformError>;

    /// A single member, `None` when they are not (or no longer) in the guild.
    async fn member(&self, guild: GuildId, member: MemberId) -> Result<Option<Member>, PlatformError>;

    async fn add_role(&self, guild: GuildId, member: MemberId, role: RoleId) -> Result<(), PlatformError>;

    async fn remove_role(&self, guild: GuildId, member: MemberId, role: RoleId) -> Result<(), PlatformError>;

    async fn send_channel_message(
        &self,
        channel: ChannelId,
        message: &OutboundMessage,
    ) -> Result<(), PlatformError>;

    /// Private message to a member; fails with `Forbidden` when their DMs are closed.
    async fn send_direct_message(
        &self,
        member: MemberId,
        message: &OutboundMessage,
    ) -> Result<(), PlatformError>;
}
