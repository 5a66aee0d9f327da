//! Discord HTTP API adapter.
//!
//! All Discord-facing I/O goes through this type. The bot only needs REST:
//! membership listings, role grants, and messages. This crate does not
//! receive slash-command interactions; `commands` is the library surface an
//! interaction layer would call into.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::Credential;
use crate::model::{ChannelId, GuildId, MemberId, RoleId};
use crate::platform::{BotIdentity, GuildGateway, Member, OutboundMessage, PlatformError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MEMBER_PAGE: usize = 1000;
const GUILD_PAGE: usize = 200;
/// Longest rate-limit wait honoured before giving up on a request.
const MAX_RETRY_WAIT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct ApiUser {
    id: MemberId,
    username: String,
    #[serde(default)]
    global_name: Option<String>,
    #[serde(default)]
    bot: bool,
}

#[derive(Deserialize)]
struct ApiMember {
    user: ApiUser,
    #[serde(default)]
    nick: Option<String>,
    #[serde(default)]
    roles: Vec<RoleId>,
}

impl From<ApiMember> for Member {
    fn from(api: ApiMember) -> Self {
        let username = api.user.username;
        let name = api
            .nick
            .or(api.user.global_name)
            .unwrap_or_else(|| username.clone());
        Member {
            id: api.user.id,
            username,
            name,
            bot: api.user.bot,
            roles: api.roles,
        }
    }
}

#[derive(Deserialize)]
struct ApiGuild {
    id: GuildId,
}

#[derive(Deserialize)]
struct ApiChannel {
    id: ChannelId,
}

#[derive(Deserialize)]
struct RateLimitBody {
    retry_after: f64,
}

pub struct DiscordRestGateway {
    http: Client,
    base_url: String,
    authorization: Credential,
}

impl DiscordRestGateway {
    pub fn new(base_url: impl Into<String>, token: &Credential) -> Result<Self, PlatformError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("DiscordBot (keybearer, ", env!("CARGO_PKG_VERSION"), ")"))
            .build()
            .map_err(|e| PlatformError::Transport(format!("{e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            authorization: Credential::new(format!("Bot {}", token.expose())),
        })
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Response, PlatformError> {
        let url = format!("{}{}", self.base_url, path);
        let mut retried = false;
        loop {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header(reqwest::header::AUTHORIZATION, self.authorization.expose());
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| PlatformError::Transport(format!("{method} {path}: {e}")))?;

            let result = classify(response).await;
            let wait = result.as_ref().err().and_then(|err| retry_delay(err, retried));
            match wait {
                Some(wait) => {
                    warn!(%method, path, ?wait, "rate limited; retrying once");
                    tokio::time::sleep(wait).await;
                    retried = true;
                }
                None => return result,
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, PlatformError> {
        let response = self.execute(Method::GET, path, None).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| PlatformError::Decode(format!("GET {path}: {e}")))
    }

    async fn post_message(&self, channel: ChannelId, message: &OutboundMessage) -> Result<(), PlatformError> {
        let body = serde_json::to_value(message).map_err(|e| PlatformError::Decode(format!("{e}")))?;
        self.execute(Method::POST, &format!("/channels/{channel}/messages"), Some(&body))
            .await?;
        debug!(%channel, "message posted");
        Ok(())
    }
}

/// How long to wait before the single retry, if `err` deserves one.
fn retry_delay(err: &PlatformError, retried: bool) -> Option<Duration> {
    match err {
        PlatformError::RateLimited { retry_after } if !retried && *retry_after <= MAX_RETRY_WAIT => Some(*retry_after),
        _ => None,
    }
}

/// Cursor for the next page, `None` once a short page shows the listing is done.
fn next_page_after<T, Id>(page: &[T], page_size: usize, id: impl Fn(&T) -> Id) -> Option<Id> {
    if page.len() < page_size {
        return None;
    }
    page.last().map(id)
}

/// Maps non-success statuses onto [`PlatformError`].
async fn classify(response: Response) -> Result<Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => PlatformError::NotFound(url),
        StatusCode::FORBIDDEN => PlatformError::Forbidden(url),
        StatusCode::TOO_MANY_REQUESTS => {
            let seconds = serde_json::from_str::<RateLimitBody>(&body)
                .map(|limit| limit.retry_after)
                .unwrap_or(1.0);
            PlatformError::RateLimited {
                retry_after: Duration::try_from_secs_f64(seconds).unwrap_or(MAX_RETRY_WAIT),
            }
        }
        other => PlatformError::Status {
            status: other.as_u16(),
            body,
        },
    })
}

#[async_trait]
impl GuildGateway for DiscordRestGateway {
    async fn current_user(&self) -> Result<BotIdentity, PlatformError> {
        let user: ApiUser = self.get_json("/users/@me").await?;
        Ok(BotIdentity {
            id: user.id,
            name: user.username,
        })
    }

    async fn guilds(&self) -> Result<Vec<GuildId>, PlatformError> {
        let mut guilds = Vec::new();
        let mut after: Option<GuildId> = None;
        loop {
            let mut path = format!("/users/@me/guilds?limit={GUILD_PAGE}");
            if let Some(last) = after {
                path.push_str(&format!("&after={last}"));
            }
            let page: Vec<ApiGuild> = self.get_json(&path).await?;
            let next = next_page_after(&page, GUILD_PAGE, |g| g.id);
            guilds.extend(page.into_iter().map(|g| g.id));
            match next {
                Some(last) => after = Some(last),
                None => return Ok(guilds),
            }
        }
    }

    async fn members(&self, guild: GuildId) -> Result<Vec<Member>, PlatformError> {
        let mut members = Vec::new();
        let mut after = MemberId(0);
        loop {
            let path = format!("/guilds/{guild}/members?limit={MEMBER_PAGE}&after={after}");
            let page: Vec<ApiMember> = self.get_json(&path).await?;
            let next = next_page_after(&page, MEMBER_PAGE, |m| m.user.id);
            members.extend(page.into_iter().map(Member::from));
            match next {
                Some(last) => after = last,
                None => {
                    debug!(%guild, count = members.len(), "fetched guild membership");
                    return Ok(members);
                }
            }
        }
    }

    async fn member(&self, guild: GuildId, member: MemberId) -> Result<Option<Member>, PlatformError> {
        match self.get_json::<ApiMember>(&format!("/guilds/{guild}/members/{member}")).await {
            Ok(api) => Ok(Some(api.into())),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn add_role(&self, guild: GuildId, member: MemberId, role: RoleId) -> Result<(), PlatformError> {
        self.execute(Method::PUT, &format!("/guilds/{guild}/members/{member}/roles/{role}"), None)
            .await
            .map(|_| ())
    }

    async fn remove_role(&self, guild: GuildId, member: MemberId, role: RoleId) -> Result<(), PlatformError> {
        self.execute(Method::DELETE, &format!("/guilds/{guild}/members/{member}/roles/{role}"), None)
            .await
            .map(|_| ())
    }

    async fn send_channel_message(
        &self,
        channel: ChannelId,
        message: &OutboundMessage,
    ) -> Result<(), PlatformError> {
        self.post_message(channel, message).await
    }

    async fn send_direct_message(
        &self,
        member: MemberId,
        message: &OutboundMessage,
    ) -> Result<(), PlatformError> {
        let body = json!({ "recipient_id": member });
        let response = self.execute(Method::POST, "/users/@me/channels", Some(&body)).await?;
        let channel: ApiChannel = response
            .json()
            .await
            .map_err(|e| PlatformError::Decode(format!("open DM with {member}: {e}")))?;
        self.post_message(channel.id, message).await
    }
}
