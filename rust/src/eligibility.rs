//! Who may hold the key.
//!
//! A member is eligible when they are a human account and do not carry the
//! admin role. Selection works on whatever membership snapshot it is handed;
//! callers fetch a fresh one for every decision.

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

use crate::model::{MemberId, RoleId};
use crate::platform::Member;

/// Why a specific member cannot receive the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Ineligible {
    #[error("member is a bot account")]
    Bot,
    #[error("member holds the admin role")]
    Admin,
}

/// Checks a single member against the exclusion rules.
pub fn check_member(member: &Member, admin_role: RoleId) -> Result<(), Ineligible> {
    if member.bot {
        return Err(Ineligible::Bot);
    }
    if member.has_role(admin_role) {
        return Err(Ineligible::Admin);
    }
    Ok(())
}

pub fn is_eligible(member: &Member, admin_role: RoleId) -> bool {
    check_member(member, admin_role).is_ok()
}

/// Picks a uniformly random eligible member, `None` when nobody qualifies.
pub fn select_candidate(members: &[Member], admin_role: RoleId) -> Option<MemberId> {
    select_candidate_with(members, admin_role, &mut rand::thread_rng())
}

pub fn select_candidate_with<R: Rng + ?Sized>(
    members: &[Member],
    admin_role: RoleId,
    rng: &mut R,
) -> Option<MemberId> {
    let eligible: Vec<&Member> = members
        .iter()
        .filter(|member| is_eligible(member, admin_role))
        .collect();
    eligible.choose(rng).map(|member| member.id)
}
