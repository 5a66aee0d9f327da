//! Keybearer: a Discord bot that keeps one shared server key in circulation.
//!
//! Custody of the key moves to a random eligible member on a fixed interval,
//! on every restart, and on admin request. The durable custody record is the
//! source of truth; role grants and notifications follow it on a best-effort
//! basis.

pub mod commands;
pub mod config;
pub mod discord;
pub mod eligibility;
pub mod engine;
pub mod integrity;
pub mod keygen;
pub mod model;
pub mod notice;
pub mod platform;
pub mod scheduler;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
