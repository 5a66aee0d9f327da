//! Message builders for transfer notifications and command replies.

use chrono::{DateTime, Utc};

use crate::model::{CustodyRecord, MemberId, TransferEvent};
use crate::platform::{Embed, OutboundMessage};

const GREEN: u32 = 0x00ff00;
/// Discord rejects embeds with more fields than this.
pub const MAX_EMBED_FIELDS: usize = 25;

/// Discord spoiler markup, hides the key until clicked.
pub fn spoiler(text: &str) -> String {
    format!("||{text}||")
}

/// Operational log entry for a completed transfer.
pub fn transfer_log(event: &TransferEvent, key: &str) -> OutboundMessage {
    OutboundMessage::embed(
        Embed::new("🔑 Key Transfer")
            .description(format!("The key has been transferred to {}", event.new_holder.mention()))
            .color(GREEN)
            .timestamp(event.timestamp)
            .field("Reason", event.reason.clone(), true)
            .field("Key", spoiler(key), false),
    )
}

/// Private notice to the new holder disclosing the key.
pub fn holder_notice(key: &str) -> OutboundMessage {
    OutboundMessage::embed(
        Embed::new("🎉 You've received the key!")
            .description("You are now the holder of the server key!")
            .color(GREEN)
            .field("Your Key", spoiler(key), false)
            .field(
                "Information",
                "This key grants you special access to certain channels in the server. Keep it safe! \
                 The key will be automatically transferred to someone else later.",
                false,
            ),
    )
}

/// Public announcement posted in each protected channel.
pub fn holder_announcement(holder: MemberId) -> OutboundMessage {
    OutboundMessage::text(format!(
        "🔑 {} is now the key holder and has access to this channel!",
        holder.mention()
    ))
}

/// Mirrors a failed transfer into the operational log.
pub fn transfer_failure(target: MemberId, reason: &str, detail: &str, at: DateTime<Utc>) -> OutboundMessage {
    OutboundMessage::embed(
        Embed::new("⚠️ Key Transfer Failed")
            .description(format!("Could not transfer the key to {}", target.mention()))
            .color(0xff0000)
            .timestamp(at)
            .field("Reason", reason, true)
            .field("Error", detail, false),
    )
}

pub fn current_key(record: &CustodyRecord) -> OutboundMessage {
    let Some(key) = record.key.as_deref() else {
        return OutboundMessage::text("No key has been generated yet.");
    };
    let mut embed = Embed::new("🔑 Current Key")
        .description(format!("The current key is: {}", spoiler(key)))
        .color(GREEN);
    if let Some(holder) = record.current_holder {
        embed = embed.field("Current Holder", holder.mention(), false);
    }
    OutboundMessage::embed(embed)
}

/// Newest-first history listing; `events` is expected in that order already.
pub fn history(events: &[TransferEvent]) -> OutboundMessage {
    if events.is_empty() {
        return OutboundMessage::text("No transfer history available.");
    }
    let shown = &events[..events.len().min(MAX_EMBED_FIELDS)];
    let mut embed = Embed::new("🔑 Key Transfer History")
        .color(GREEN)
        .description(format!("Showing last {} transfers", shown.len()));
    for (index, event) in shown.iter().enumerate() {
        embed = embed.field(
            format!("{}. {}", index + 1, event.timestamp.format("%Y-%m-%d %H:%M:%S UTC")),
            format!(
                "Transferred to: {}\nReason: {}",
                event.new_holder.mention(),
                event.reason
            ),
            false,
        );
    }
    OutboundMessage::embed(embed)
}
