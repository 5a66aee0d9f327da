//! Custody transfers.
//!
//! A transfer is split in two phases. The durable phase loads the record,
//! moves custody, and saves it; if that fails nothing else happens and the
//! caller gets an error. Only after the commit does the side-effect phase run
//! (role reconciliation, log entry, DM, announcements). Each of those steps is
//! attempted independently and reported in [`TransferOutcome`]; none of them
//! can undo the commit.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::eligibility;
use crate::keygen::generate_key;
use crate::model::{ChannelId, GuildId, MemberId, RoleId, TransferEvent};
use crate::notice;
use crate::platform::{GuildGateway, PlatformError};
use crate::store::{Ledger, StoreError};

/// Roles and channels the engine works with.
#[derive(Debug, Clone)]
pub struct CustodySettings {
    pub admin_role: RoleId,
    pub key_holder_role: RoleId,
    pub log_channel: ChannelId,
    pub protected_channels: Vec<ChannelId>,
}

/// Why custody changed hands. Rendered into the free-text history reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferReason {
    Scheduled,
    BotRestart,
    AdminGeneratedNewKey,
    ManualTransfer { by: String },
    ForcedTransfer { by: String },
}

impl fmt::Display for TransferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferReason::Scheduled => f.write_str("Scheduled Transfer"),
            TransferReason::BotRestart => f.write_str("Bot Restart"),
            TransferReason::AdminGeneratedNewKey => f.write_str("Admin Generated New Key"),
            TransferReason::ManualTransfer { by } => write!(f, "Manual Transfer by {by}"),
            TransferReason::ForcedTransfer { by } => write!(f, "Forced Transfer by {by}"),
        }
    }
}

/// Whether a transfer keeps the current key or replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPolicy {
    Keep,
    Regenerate,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no eligible member to receive the key")]
    NoEligibleCandidate,
    #[error("membership lookup failed: {0}")]
    Membership(#[source] PlatformError),
    #[error("custody state not saved: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    RevokePreviousHolder(MemberId),
    /// Another member of the guild still carried the key-holder role.
    RevokeStrayHolder(MemberId),
    /// Listing the guild to find stray role carriers.
    StrayHolderSweep,
    GrantNewHolder,
    LogChannel,
    DirectMessage,
    Announce(ChannelId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Done,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideEffectReport {
    pub step: SideEffect,
    pub status: StepStatus,
}

/// A committed transfer plus what happened to each side effect.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub event: TransferEvent,
    pub key: String,
    pub key_generated: bool,
    pub side_effects: Vec<SideEffectReport>,
}

impl TransferOutcome {
    pub fn failures(&self) -> impl Iterator<Item = &SideEffectReport> {
        self.side_effects
            .iter()
            .filter(|report| matches!(report.status, StepStatus::Failed(_)))
    }

    pub fn status_of(&self, step: SideEffect) -> Option<&StepStatus> {
        self.side_effects
            .iter()
            .find(|report| report.step == step)
            .map(|report| &report.status)
    }
}

pub struct TransferEngine {
    ledger: Arc<Ledger>,
    gateway: Arc<dyn GuildGateway>,
    settings: CustodySettings,
    /// Held for a whole transfer so role changes from two transfers never interleave.
    transfer_lock: Mutex<()>,
}

impl TransferEngine {
    pub fn new(ledger: Arc<Ledger>, gateway: Arc<dyn GuildGateway>, settings: CustodySettings) -> Self {
        Self {
            ledger,
            gateway,
            settings,
            transfer_lock: Mutex::new(()),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn gateway(&self) -> &dyn GuildGateway {
        self.gateway.as_ref()
    }

    pub fn settings(&self) -> &CustodySettings {
        &self.settings
    }

    /// Random eligible member of `guild`, from a fresh membership listing.
    pub async fn select_candidate(&self, guild: GuildId) -> Result<Option<MemberId>, TransferError> {
        let members = self
            .gateway
            .members(guild)
            .await
            .map_err(TransferError::Membership)?;
        Ok(eligibility::select_candidate(&members, self.settings.admin_role))
    }

    /// Picks a random eligible member and transfers custody to them.
    pub async fn rotate(
        &self,
        guild: GuildId,
        reason: TransferReason,
        policy: KeyPolicy,
    ) -> Result<TransferOutcome, TransferError> {
        let candidate = self
            .select_candidate(guild)
            .await?
            .ok_or(TransferError::NoEligibleCandidate)?;
        self.transfer_with(guild, candidate, reason, policy).await
    }

    /// Transfers custody to `new_holder`, keeping the current key.
    ///
    /// The caller is responsible for having validated `new_holder` as an
    /// eligible member of `guild`.
    pub async fn transfer(
        &self,
        guild: GuildId,
        new_holder: MemberId,
        reason: TransferReason,
    ) -> Result<TransferOutcome, TransferError> {
        self.transfer_with(guild, new_holder, reason, KeyPolicy::Keep).await
    }

    pub async fn transfer_with(
        &self,
        guild: GuildId,
        new_holder: MemberId,
        reason: TransferReason,
        policy: KeyPolicy,
    ) -> Result<TransferOutcome, TransferError> {
        let _serialized = self.transfer_lock.lock().await;
        let now = Utc::now();
        let reason_text = reason.to_string();

        let committed = self
            .ledger
            .update(|record| {
                Ok::<_, StoreError>(record.apply_transfer(
                    new_holder,
                    reason_text.as_str(),
                    now,
                    policy == KeyPolicy::Regenerate,
                    generate_key,
                ))
            })
            .await;

        let applied = match committed {
            Ok(applied) => applied,
            Err(err) => {
                error!(%guild, %new_holder, reason = %reason_text, "key transfer not committed: {err}");
                let alert = notice::transfer_failure(new_holder, &reason_text, &err.to_string(), now);
                if let Err(log_err) = self
                    .gateway
                    .send_channel_message(self.settings.log_channel, &alert)
                    .await
                {
                    warn!("could not mirror transfer failure to log channel: {log_err}");
                }
                return Err(err.into());
            }
        };

        info!(
            %guild,
            new_holder = %applied.event.new_holder,
            previous_holder = ?applied.event.previous_holder,
            reason = %applied.event.reason,
            key_generated = applied.key_generated,
            "key custody transferred"
        );

        let side_effects = self.apply_side_effects(guild, &applied.event, &applied.key).await;
        Ok(TransferOutcome {
            event: applied.event,
            key: applied.key,
            key_generated: applied.key_generated,
            side_effects,
        })
    }

    async fn apply_side_effects(&self, guild: GuildId, event: &TransferEvent, key: &str) -> Vec<SideEffectReport> {
        let mut reports = Vec::new();
        let holder = event.new_holder;

        if let Some(previous) = event.previous_holder.filter(|previous| *previous != holder) {
            reports.push(self.revoke_previous(guild, previous).await);
        }
        self.revoke_stray_holders(guild, event, &mut reports).await;

        let granted = self
            .gateway
            .add_role(guild, holder, self.settings.key_holder_role)
            .await;
        if let Err(err) = &granted {
            error!(%guild, %holder, "key-holder role grant failed: {err}");
        }
        reports.push(report(SideEffect::GrantNewHolder, granted));

        let logged = self
            .gateway
            .send_channel_message(self.settings.log_channel, &notice::transfer_log(event, key))
            .await;
        reports.push(report(SideEffect::LogChannel, logged));

        let notified = self
            .gateway
            .send_direct_message(holder, &notice::holder_notice(key))
            .await;
        reports.push(report(SideEffect::DirectMessage, notified));

        let announcement = notice::holder_announcement(holder);
        for channel in &self.settings.protected_channels {
            let sent = self.gateway.send_channel_message(*channel, &announcement).await;
            reports.push(report(SideEffect::Announce(*channel), sent));
        }

        for failure in reports.iter().filter(|r| matches!(r.status, StepStatus::Failed(_))) {
            warn!(%guild, step = ?failure.step, status = ?failure.status, "transfer side effect failed");
        }
        reports
    }

    /// Takes the key-holder role away from the previous holder. A holder who
    /// left the guild is expected and only skipped.
    async fn revoke_previous(&self, guild: GuildId, previous: MemberId) -> SideEffectReport {
        let step = SideEffect::RevokePreviousHolder(previous);
        let role = self.settings.key_holder_role;

        let member = match self.gateway.member(guild, previous).await {
            Ok(Some(member)) => member,
            Ok(None) => return skipped(step, "previous holder is no longer in the guild"),
            Err(err) if err.is_not_found() => return skipped(step, "previous holder is no longer in the guild"),
            Err(err) => return report(step, Err(err)),
        };
        if !member.has_role(role) {
            return skipped(step, "previous holder does not carry the key-holder role");
        }

        match self.gateway.remove_role(guild, previous, role).await {
            Err(err) if err.is_not_found() => skipped(step, "previous holder left during revocation"),
            result => report(step, result),
        }
    }

    /// Custody is shared by every guild, so the recorded previous holder may
    /// belong to another guild. Anyone here still carrying the role, apart
    /// from the new holder, loses it.
    async fn revoke_stray_holders(
        &self,
        guild: GuildId,
        event: &TransferEvent,
        reports: &mut Vec<SideEffectReport>,
    ) {
        let role = self.settings.key_holder_role;
        let members = match self.gateway.members(guild).await {
            Ok(members) => members,
            Err(err) => {
                warn!(%guild, "could not list members to sweep stray key holders: {err}");
                reports.push(report(SideEffect::StrayHolderSweep, Err(err)));
                return;
            }
        };

        let strays = members.iter().filter(|member| {
            member.has_role(role) && member.id != event.new_holder && Some(member.id) != event.previous_holder
        });
        for stray in strays {
            let step = SideEffect::RevokeStrayHolder(stray.id);
            let status = match self.gateway.remove_role(guild, stray.id, role).await {
                Ok(()) => {
                    info!(%guild, member = %stray.id, "revoked stray key-holder role");
                    StepStatus::Done
                }
                Err(err) if err.is_not_found() => StepStatus::Skipped("member left during revocation".into()),
                Err(err) => StepStatus::Failed(err.to_string()),
            };
            reports.push(SideEffectReport { step, status });
        }
    }
}

fn report(step: SideEffect, result: Result<(), PlatformError>) -> SideEffectReport {
    let status = match result {
        Ok(()) => StepStatus::Done,
        Err(err) => StepStatus::Failed(err.to_string()),
    };
    SideEffectReport { step, status }
}

fn skipped(step: SideEffect, why: &str) -> SideEffectReport {
    SideEffectReport {
        step,
        status: StepStatus::Skipped(why.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygen::{KEY_ALPHABET, KEY_LENGTH};
    use crate::model::CustodyRecord;
    use crate::store::memory::MemoryStore;
    use crate::testing::*;

    const ANNOUNCE: ChannelId = ChannelId(700);

    fn settings() -> CustodySettings {
        CustodySettings {
            admin_role: ADMIN_ROLE,
            key_holder_role: HOLDER_ROLE,
            log_channel: LOG_CHANNEL,
            protected_channels: vec![ANNOUNCE],
        }
    }

    fn engine_with(store: MemoryStore, guild: Arc<FakeGuild>) -> TransferEngine {
        TransferEngine::new(Arc::new(Ledger::new(store)), guild, settings())
    }

    #[tokio::test]
    async fn first_transfer_generates_key_and_records_history() {
        let guild = Arc::new(FakeGuild::with_members(vec![human(42)]));
        let engine = engine_with(MemoryStore::default(), Arc::clone(&guild));

        let outcome = engine
            .transfer(GUILD, MemberId(42), TransferReason::BotRestart)
            .await
            .expect("transfer commits");

        let record = engine.ledger().read().await.unwrap();
        assert_eq!(record.current_holder, Some(MemberId(42)));
        let key = record.key.clone().expect("key generated");
        assert_eq!(key.len(), KEY_LENGTH);
        assert!(key.bytes().all(|b| KEY_ALPHABET.contains(&b)));
        assert_eq!(record.history.len(), 1);
        assert_eq!(record.history[0].new_holder, MemberId(42));
        assert_eq!(record.history[0].previous_holder, None);
        assert_eq!(record.history[0].reason, "Bot Restart");
        assert_eq!(record.last_transfer_at, Some(record.history[0].timestamp));

        assert!(outcome.key_generated);
        assert_eq!(outcome.failures().count(), 0);
        assert!(guild.has_role(GUILD, MemberId(42), HOLDER_ROLE));
    }

    #[tokio::test]
    async fn transfer_keeps_existing_key_and_moves_role() {
        let mut previous = human(42);
        previous.roles.push(HOLDER_ROLE);
        let guild = Arc::new(FakeGuild::with_members(vec![previous, human(7)]));
        let store = MemoryStore::with_record(CustodyRecord {
            current_holder: Some(MemberId(42)),
            key: Some("ABC123".into()),
            ..CustodyRecord::default()
        });
        let engine = engine_with(store, Arc::clone(&guild));

        let outcome = engine
            .transfer(
                GUILD,
                MemberId(7),
                TransferReason::ManualTransfer { by: "admin1".into() },
            )
            .await
            .expect("transfer commits");

        let record = engine.ledger().read().await.unwrap();
        assert_eq!(record.current_holder, Some(MemberId(7)));
        assert_eq!(record.key.as_deref(), Some("ABC123"));
        assert_eq!(record.history.len(), 1);
        assert_eq!(record.history[0].previous_holder, Some(MemberId(42)));
        assert_eq!(record.history[0].new_holder, MemberId(7));
        assert_eq!(record.history[0].reason, "Manual Transfer by admin1");

        assert!(!outcome.key_generated);
        assert_eq!(
            outcome.status_of(SideEffect::RevokePreviousHolder(MemberId(42))),
            Some(&StepStatus::Done)
        );
        assert_eq!(guild.holders_of(GUILD, HOLDER_ROLE), vec![MemberId(7)]);
    }

    #[tokio::test]
    async fn regeneration_replaces_key_in_same_commit() {
        let guild = Arc::new(FakeGuild::with_members(vec![human(5)]));
        let store = MemoryStore::with_record(CustodyRecord {
            key: Some("OLDKEY".into()),
            ..CustodyRecord::default()
        });
        let engine = engine_with(store, guild);

        let outcome = engine
            .rotate(GUILD, TransferReason::AdminGeneratedNewKey, KeyPolicy::Regenerate)
            .await
            .expect("rotation commits");

        assert!(outcome.key_generated);
        assert_ne!(outcome.key, "OLDKEY");
        let record = engine.ledger().read().await.unwrap();
        assert_eq!(record.key.as_deref(), Some(outcome.key.as_str()));
        assert_eq!(record.history[0].reason, "Admin Generated New Key");
    }

    #[tokio::test]
    async fn departed_previous_holder_is_skipped_not_fatal() {
        let mut previous = human(42);
        previous.roles.push(HOLDER_ROLE);
        let guild = Arc::new(FakeGuild::with_members(vec![previous, human(7)]));
        guild.remove_member(GUILD, MemberId(42));
        let store = MemoryStore::with_record(CustodyRecord {
            current_holder: Some(MemberId(42)),
            key: Some("ABC123".into()),
            ..CustodyRecord::default()
        });
        let engine = engine_with(store, Arc::clone(&guild));

        let outcome = engine
            .transfer(GUILD, MemberId(7), TransferReason::Scheduled)
            .await
            .expect("transfer commits");

        assert!(matches!(
            outcome.status_of(SideEffect::RevokePreviousHolder(MemberId(42))),
            Some(StepStatus::Skipped(_))
        ));
        assert_eq!(outcome.failures().count(), 0);
        assert!(guild.has_role(GUILD, MemberId(7), HOLDER_ROLE));
    }

    #[tokio::test]
    async fn stray_role_carriers_lose_the_role() {
        let mut stray = human(9);
        stray.roles.push(HOLDER_ROLE);
        let guild = Arc::new(FakeGuild::with_members(vec![stray, human(7)]));
        // Recorded holder lives in another guild.
        let store = MemoryStore::with_record(CustodyRecord {
            current_holder: Some(MemberId(42)),
            key: Some("ABC123".into()),
            ..CustodyRecord::default()
        });
        let engine = engine_with(store, Arc::clone(&guild));

        let outcome = engine
            .transfer(GUILD, MemberId(7), TransferReason::Scheduled)
            .await
            .expect("transfer commits");

        assert!(matches!(
            outcome.status_of(SideEffect::RevokePreviousHolder(MemberId(42))),
            Some(StepStatus::Skipped(_))
        ));
        assert_eq!(
            outcome.status_of(SideEffect::RevokeStrayHolder(MemberId(9))),
            Some(&StepStatus::Done)
        );
        assert_eq!(outcome.failures().count(), 0);
        assert_eq!(guild.holders_of(GUILD, HOLDER_ROLE), vec![MemberId(7)]);
    }

    #[tokio::test]
    async fn same_holder_keeps_role() {
        let mut holder = human(7);
        holder.roles.push(HOLDER_ROLE);
        let guild = Arc::new(FakeGuild::with_members(vec![holder]));
        let store = MemoryStore::with_record(CustodyRecord {
            current_holder: Some(MemberId(7)),
            key: Some("ABC123".into()),
            ..CustodyRecord::default()
        });
        let engine = engine_with(store, Arc::clone(&guild));

        let outcome = engine
            .transfer(GUILD, MemberId(7), TransferReason::Scheduled)
            .await
            .expect("transfer commits");

        assert!(outcome
            .side_effects
            .iter()
            .all(|r| !matches!(r.step, SideEffect::RevokePreviousHolder(_))));
        assert!(guild.has_role(GUILD, MemberId(7), HOLDER_ROLE));
    }

    #[tokio::test]
    async fn notifications_go_to_log_holder_and_protected_channels() {
        let guild = Arc::new(FakeGuild::with_members(vec![human(42)]));
        let engine = engine_with(MemoryStore::default(), Arc::clone(&guild));

        let outcome = engine
            .transfer(GUILD, MemberId(42), TransferReason::Scheduled)
            .await
            .unwrap();

        let spoilered = format!("||{}||", outcome.key);
        let log = guild.channel_messages(LOG_CHANNEL);
        assert_eq!(log.len(), 1);
        assert!(log[0].embeds[0].fields.iter().any(|f| f.value == spoilered));

        let dms = guild.direct_messages(MemberId(42));
        assert_eq!(dms.len(), 1);
        assert!(dms[0].embeds[0].fields.iter().any(|f| f.value == spoilered));

        let announcements = guild.channel_messages(ANNOUNCE);
        assert_eq!(announcements.len(), 1);
        assert!(announcements[0].content.contains("<@42>"));
        assert!(!announcements[0].content.contains(&outcome.key));
    }

    #[tokio::test]
    async fn best_effort_failures_do_not_roll_back() {
        let guild = Arc::new(FakeGuild::with_members(vec![human(42)]));
        guild.close_dms(MemberId(42));
        guild.break_channel(ANNOUNCE);
        let engine = engine_with(MemoryStore::default(), Arc::clone(&guild));

        let outcome = engine
            .transfer(GUILD, MemberId(42), TransferReason::Scheduled)
            .await
            .expect("durable transfer still succeeds");

        assert!(matches!(outcome.status_of(SideEffect::DirectMessage), Some(StepStatus::Failed(_))));
        assert!(matches!(
            outcome.status_of(SideEffect::Announce(ANNOUNCE)),
            Some(StepStatus::Failed(_))
        ));
        assert_eq!(outcome.status_of(SideEffect::LogChannel), Some(&StepStatus::Done));
        assert_eq!(outcome.failures().count(), 2);
        assert_eq!(engine.ledger().read().await.unwrap().current_holder, Some(MemberId(42)));
    }

    #[tokio::test]
    async fn failed_grant_is_reported_but_state_stands() {
        let guild = Arc::new(FakeGuild::with_members(vec![human(42)]));
        guild.fail_grants();
        let engine = engine_with(MemoryStore::default(), Arc::clone(&guild));

        let outcome = engine
            .transfer(GUILD, MemberId(42), TransferReason::Scheduled)
            .await
            .expect("durable transfer still succeeds");

        assert!(matches!(outcome.status_of(SideEffect::GrantNewHolder), Some(StepStatus::Failed(_))));
        assert_eq!(engine.ledger().read().await.unwrap().current_holder, Some(MemberId(42)));
    }

    #[tokio::test]
    async fn store_failure_stops_before_side_effects() {
        let guild = Arc::new(FakeGuild::with_members(vec![human(42)]));
        let engine = engine_with(MemoryStore::failing(), Arc::clone(&guild));

        let err = engine
            .transfer(GUILD, MemberId(42), TransferReason::Scheduled)
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Store(_)));
        assert!(!guild.has_role(GUILD, MemberId(42), HOLDER_ROLE));
        assert!(guild.direct_messages(MemberId(42)).is_empty());
        assert!(guild.channel_messages(ANNOUNCE).is_empty());
        let log = guild.channel_messages(LOG_CHANNEL);
        assert_eq!(log.len(), 1, "failure is mirrored to the log channel");
        assert_eq!(log[0].embeds[0].title.as_deref(), Some("⚠️ Key Transfer Failed"));
    }

    #[tokio::test]
    async fn rotation_without_candidates_leaves_state_alone() {
        let guild = Arc::new(FakeGuild::with_members(vec![bot(1), admin(2)]));
        let engine = engine_with(MemoryStore::default(), guild);

        let err = engine
            .rotate(GUILD, TransferReason::Scheduled, KeyPolicy::Keep)
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::NoEligibleCandidate));
        assert_eq!(engine.ledger().read().await.unwrap(), CustodyRecord::default());
    }

    #[tokio::test]
    async fn rotation_only_picks_eligible_members() {
        let guild = Arc::new(FakeGuild::with_members(vec![bot(1), admin(2), human(3)]));
        let engine = engine_with(MemoryStore::default(), guild);

        for _ in 0..10 {
            let outcome = engine
                .rotate(GUILD, TransferReason::Scheduled, KeyPolicy::Keep)
                .await
                .unwrap();
            assert_eq!(outcome.event.new_holder, MemberId(3));
        }
        assert_eq!(engine.ledger().read().await.unwrap().history.len(), 10);
    }

    #[tokio::test]
    async fn concurrent_transfers_are_serialized() {
        let members: Vec<_> = (10..30).map(human).collect();
        let guild = Arc::new(FakeGuild::with_members(members));
        let engine = Arc::new(engine_with(MemoryStore::default(), Arc::clone(&guild)));

        let mut tasks = Vec::new();
        for id in 10..30u64 {
            let engine = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move {
                engine.transfer(GUILD, MemberId(id), TransferReason::Scheduled).await
            }));
        }
        for task in tasks {
            task.await.unwrap().expect("transfer commits");
        }

        let record = engine.ledger().read().await.unwrap();
        assert_eq!(record.history.len(), 20);
        for pair in record.history.windows(2) {
            assert_eq!(pair[1].previous_holder, Some(pair[0].new_holder));
        }
        assert_eq!(guild.holders_of(GUILD, HOLDER_ROLE), vec![record.current_holder.unwrap()]);
    }

    #[test]
    fn reasons_render_as_history_text() {
        assert_eq!(TransferReason::Scheduled.to_string(), "Scheduled Transfer");
        assert_eq!(TransferReason::BotRestart.to_string(), "Bot Restart");
        assert_eq!(TransferReason::AdminGeneratedNewKey.to_string(), "Admin Generated New Key");
        assert_eq!(
            TransferReason::ForcedTransfer { by: "mod".into() }.to_string(),
            "Forced Transfer by mod"
        );
    }
}
