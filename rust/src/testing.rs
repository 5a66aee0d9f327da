//! In-memory guild used by unit tests across the crate.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::model::{ChannelId, GuildId, MemberId, RoleId};
use crate::platform::{BotIdentity, GuildGateway, Member, OutboundMessage, PlatformError};

pub const GUILD: GuildId = GuildId(1);
pub const ADMIN_ROLE: RoleId = RoleId(900);
pub const HOLDER_ROLE: RoleId = RoleId(901);
pub const LOG_CHANNEL: ChannelId = ChannelId(500);

pub fn human(id: u64) -> Member {
    Member {
        id: MemberId(id),
        username: format!("user{id}"),
        name: format!("Display Name {id}"),
        bot: false,
        roles: Vec::new(),
    }
}

pub fn bot(id: u64) -> Member {
    Member {
        bot: true,
        ..human(id)
    }
}

pub fn admin(id: u64) -> Member {
    Member {
        roles: vec![ADMIN_ROLE],
        ..human(id)
    }
}

#[derive(Default)]
struct State {
    guilds: Vec<GuildId>,
    members: HashMap<GuildId, Vec<Member>>,
    channel_messages: Vec<(ChannelId, OutboundMessage)>,
    direct_messages: Vec<(MemberId, OutboundMessage)>,
    closed_dms: HashSet<MemberId>,
    failing_channels: HashSet<ChannelId>,
    fail_grants: bool,
    fail_member_listing: bool,
}

/// Fake gateway recording every side effect.
#[derive(Default)]
pub struct FakeGuild {
    state: Mutex<State>,
}

impl FakeGuild {
    pub fn with_members(members: Vec<Member>) -> Self {
        let fake = Self::default();
        {
            let mut state = fake.state.lock().unwrap();
            state.guilds.push(GUILD);
            state.members.insert(GUILD, members);
        }
        fake
    }

    pub fn add_guild(&self, guild: GuildId, members: Vec<Member>) {
        let mut state = self.state.lock().unwrap();
        state.guilds.push(guild);
        state.members.insert(guild, members);
    }

    pub fn remove_member(&self, guild: GuildId, member: MemberId) {
        let mut state = self.state.lock().unwrap();
        if let Some(list) = state.members.get_mut(&guild) {
            list.retain(|m| m.id != member);
        }
    }

    pub fn close_dms(&self, member: MemberId) {
        self.state.lock().unwrap().closed_dms.insert(member);
    }

    pub fn break_channel(&self, channel: ChannelId) {
        self.state.lock().unwrap().failing_channels.insert(channel);
    }

    pub fn fail_grants(&self) {
        self.state.lock().unwrap().fail_grants = true;
    }

    pub fn fail_member_listing(&self) {
        self.state.lock().unwrap().fail_member_listing = true;
    }

    pub fn has_role(&self, guild: GuildId, member: MemberId, role: RoleId) -> bool {
        let state = self.state.lock().unwrap();
        state
            .members
            .get(&guild)
            .and_then(|list| list.iter().find(|m| m.id == member))
            .is_some_and(|m| m.has_role(role))
    }

    pub fn holders_of(&self, guild: GuildId, role: RoleId) -> Vec<MemberId> {
        let state = self.state.lock().unwrap();
        state
            .members
            .get(&guild)
            .map(|list| list.iter().filter(|m| m.has_role(role)).map(|m| m.id).collect())
            .unwrap_or_default()
    }

    pub fn channel_messages(&self, channel: ChannelId) -> Vec<OutboundMessage> {
        let state = self.state.lock().unwrap();
        state
            .channel_messages
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn direct_messages(&self, member: MemberId) -> Vec<OutboundMessage> {
        let state = self.state.lock().unwrap();
        state
            .direct_messages
            .iter()
            .filter(|(m, _)| *m == member)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    fn with_member<T>(
        &self,
        guild: GuildId,
        member: MemberId,
        f: impl FnOnce(&mut Member) -> T,
    ) -> Result<T, PlatformError> {
        let mut state = self.state.lock().unwrap();
        state
            .members
            .get_mut(&guild)
            .and_then(|list| list.iter_mut().find(|m| m.id == member))
            .map(f)
            .ok_or_else(|| PlatformError::NotFound(format!("member {member}")))
    }
}

#[async_trait]
impl GuildGateway for FakeGuild {
    async fn current_user(&self) -> Result<BotIdentity, PlatformError> {
        Ok(BotIdentity {
            id: MemberId(1_000),
            name: "keybearer".into(),
        })
    }

    async fn guilds(&self) -> Result<Vec<GuildId>, PlatformError> {
        Ok(self.state.lock().unwrap().guilds.clone())
    }

    async fn members(&self, guild: GuildId) -> Result<Vec<Member>, PlatformError> {
        let state = self.state.lock().unwrap();
        if state.fail_member_listing {
            return Err(PlatformError::Transport("connection reset".into()));
        }
        Ok(state.members.get(&guild).cloned().unwrap_or_default())
    }

    async fn member(&self, guild: GuildId, member: MemberId) -> Result<Option<Member>, PlatformError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .members
            .get(&guild)
            .and_then(|list| list.iter().find(|m| m.id == member))
            .cloned())
    }

    async fn add_role(&self, guild: GuildId, member: MemberId, role: RoleId) -> Result<(), PlatformError> {
        if self.state.lock().unwrap().fail_grants {
            return Err(PlatformError::Forbidden("missing permissions".into()));
        }
        self.with_member(guild, member, |m| {
            if !m.has_role(role) {
                m.roles.push(role);
            }
        })
    }

    async fn remove_role(&self, guild: GuildId, member: MemberId, role: RoleId) -> Result<(), PlatformError> {
        self.with_member(guild, member, |m| m.roles.retain(|r| *r != role))
    }

    async fn send_channel_message(
        &self,
        channel: ChannelId,
        message: &OutboundMessage,
    ) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_channels.contains(&channel) {
            return Err(PlatformError::NotFound(format!("channel {channel}")));
        }
        state.channel_messages.push((channel, message.clone()));
        Ok(())
    }

    async fn send_direct_message(
        &self,
        member: MemberId,
        message: &OutboundMessage,
    ) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        if state.closed_dms.contains(&member) {
            return Err(PlatformError::Forbidden("cannot send messages to this user".into()));
        }
        state.direct_messages.push((member, message.clone()));
        Ok(())
    }
}
