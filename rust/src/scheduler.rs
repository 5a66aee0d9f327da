//! Periodic key rotation.
//!
//! Once the connection is ready the scheduler hands the key to a fresh member
//! in every guild ("Bot Restart"), then repeats a scheduled rotation each
//! interval. Missed ticks are skipped rather than replayed, so a long outage
//! produces one rotation at the next wake-up.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::engine::{KeyPolicy, TransferEngine, TransferError, TransferReason};
use crate::model::{GuildId, MemberId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Waiting,
    Firing,
}

/// Result of one rotation pass for one guild.
#[derive(Debug)]
pub struct GuildRotation {
    pub guild: GuildId,
    pub result: Result<MemberId, TransferError>,
}

pub struct RotationScheduler {
    engine: Arc<TransferEngine>,
    every: Duration,
    state: Mutex<SchedulerState>,
    shutdown: watch::Sender<bool>,
}

impl RotationScheduler {
    pub fn new(engine: Arc<TransferEngine>, every: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            engine,
            every,
            state: Mutex::new(SchedulerState::Idle),
            shutdown,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: SchedulerState) {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
    }

    /// Runs the startup rotation and then the periodic loop on a background task.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let mut stop = self.shutdown.subscribe();
        tokio::spawn(async move {
            info!(interval_secs = self.every.as_secs(), "rotation scheduler started");

            self.set_state(SchedulerState::Firing);
            self.rotate_all(TransferReason::BotRestart).await;

            let mut ticker = interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; the startup pass already covered it.
            ticker.tick().await;

            loop {
                if *stop.borrow() {
                    break;
                }
                self.set_state(SchedulerState::Waiting);
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                self.set_state(SchedulerState::Firing);
                self.rotate_all(TransferReason::Scheduled).await;
            }

            self.set_state(SchedulerState::Idle);
            info!("rotation scheduler stopped");
        })
    }

    /// Signals the background loop to exit after any rotation in progress.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// One rotation in every connected guild. Failures are logged per guild
    /// and never abort the remaining guilds.
    pub async fn rotate_all(&self, reason: TransferReason) -> Vec<GuildRotation> {
        let guilds = match self.engine.gateway().guilds().await {
            Ok(guilds) => guilds,
            Err(err) => {
                error!(reason = %reason, "could not list guilds; skipping rotation: {err}");
                return Vec::new();
            }
        };

        let mut results = Vec::with_capacity(guilds.len());
        for guild in guilds {
            let result = self
                .engine
                .rotate(guild, reason.clone(), KeyPolicy::Keep)
                .await
                .map(|outcome| outcome.event.new_holder);
            match &result {
                Ok(holder) => debug!(%guild, %holder, reason = %reason, "rotation complete"),
                Err(TransferError::NoEligibleCandidate) => {
                    warn!(%guild, reason = %reason, "no eligible member; key stays put")
                }
                Err(err) => error!(%guild, reason = %reason, "rotation failed: {err}"),
            }
            results.push(GuildRotation { guild, result });
        }
        results
    }
}
