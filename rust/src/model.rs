//! Identifiers and the persisted custody record.
//!
//! The record keeps the on-disk JSON shape the bot has always used
//! (`current_key_holder`, `key`, `transfer_history`, `last_transfer`) so that
//! existing `database.json` files keep loading. Snowflakes are written as
//! strings but older files stored them as numbers, so both are accepted.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Snowflakes arrive as JSON strings from Discord and as numbers from older state files.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawSnowflake {
    Number(u64),
    Text(String),
}

fn deserialize_snowflake<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match RawSnowflake::deserialize(deserializer)? {
        RawSnowflake::Number(value) => Ok(value),
        RawSnowflake::Text(text) => text
            .trim()
            .parse::<u64>()
            .map_err(|e| serde::de::Error::custom(format!("invalid snowflake {text:?}: {e}"))),
    }
}

macro_rules! snowflake {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserialize_snowflake(deserializer).map(Self)
            }
        }
    };
}

snowflake!(
    /// A guild member (Discord user id).
    MemberId
);
snowflake!(RoleId);
snowflake!(ChannelId);
snowflake!(
    /// A guild (Discord server) the bot is connected to.
    GuildId
);

impl MemberId {
    /// Discord mention markup for this member.
    pub fn mention(self) -> String {
        format!("<@{}>", self.0)
    }
}

mod timestamp {
    //! RFC 3339 on write. Naive ISO-8601 values (no offset) are read as UTC.

    use super::*;

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse(&text).map_err(serde::de::Error::custom)
    }

    pub fn parse(text: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
            return Ok(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|e| format!("invalid timestamp {text:?}: {e}"))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(ts) => serializer.serialize_some(&ts.to_rfc3339()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(text) => parse(&text).map(Some).map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}

/// Immutable record of one custody change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub new_holder: MemberId,
    #[serde(default)]
    pub previous_holder: Option<MemberId>,
    pub reason: String,
}

/// Result of [`CustodyRecord::apply_transfer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedTransfer {
    pub event: TransferEvent,
    /// Key in force after the transfer.
    pub key: String,
    pub key_generated: bool,
}

/// The single persisted custody state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodyRecord {
    #[serde(rename = "current_key_holder", default)]
    pub current_holder: Option<MemberId>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(rename = "transfer_history", default)]
    pub history: Vec<TransferEvent>,
    #[serde(rename = "last_transfer", default, with = "timestamp::option")]
    pub last_transfer_at: Option<DateTime<Utc>>,
}

impl CustodyRecord {
    /// Moves custody to `new_holder` and appends the matching history entry.
    ///
    /// Supplies a key from `generate` when none exists (or when `regenerate`
    /// is set); the previous key is reused otherwise.
    pub fn apply_transfer(
        &mut self,
        new_holder: MemberId,
        reason: impl Into<String>,
        now: DateTime<Utc>,
        regenerate: bool,
        generate: impl FnOnce() -> String,
    ) -> AppliedTransfer {
        let (key, key_generated) = match self.key.take() {
            Some(existing) if !regenerate && !existing.trim().is_empty() => (existing, false),
            _ => (generate(), true),
        };
        self.key = Some(key.clone());

        let event = TransferEvent {
            timestamp: now,
            new_holder,
            previous_holder: self.current_holder,
            reason: reason.into(),
        };

        self.current_holder = Some(new_holder);
        self.last_transfer_at = Some(now);
        self.history.push(event.clone());
        AppliedTransfer {
            event,
            key,
            key_generated,
        }
    }

    /// The last `limit` transfer events, newest first. A zero limit yields everything.
    pub fn recent_history(&self, limit: usize) -> impl Iterator<Item = &TransferEvent> {
        let start = match limit {
            0 => 0,
            limit => self.history.len().saturating_sub(limit),
        };
        self.history[start..].iter().rev()
    }

    pub fn is_holder(&self, member: MemberId) -> bool {
        self.current_holder == Some(member)
    }

    /// True only when `member` holds custody and `candidate` matches the stored key.
    pub fn verify(&self, member: MemberId, candidate: &str) -> bool {
        self.is_holder(member)
            && self
                .key
                .as_deref()
                .is_some_and(|key| !key.trim().is_empty() && key == candidate)
    }
}
