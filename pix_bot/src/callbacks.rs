//! Callback query handlers for the admin review keyboard.

use anyhow::Result;
use log::{info, warn};
use teloxide::{prelude::*, types::MaybeInaccessibleMessage};

use crate::dependencies::BotDependencies;
use crate::transactions::state::{
    ApproveOutcome, approve, attempt_delivery, force_delivered, reject, reverse,
};

pub async fn handle_callback_query(
    bot: Bot,
    query: teloxide::types::CallbackQuery,
    bot_deps: BotDependencies,
) -> Result<()> {
    let Some(data) = query.data.clone() else {
        return Ok(());
    };

    // every pix_* action is admin-only
    let user_id = query.from.id.0 as i64;
    if user_id != bot_deps.settings.admin_chat_id {
        warn!("callback {} from non-admin user {}", data, user_id);
        bot.answer_callback_query(query.id.clone())
            .text("❌ Only the shop admin can do that.")
            .await?;
        return Ok(());
    }

    let outcome: String = if let Some(txid) = data.strip_prefix("pix_approve:") {
        match approve(&bot, &bot_deps, txid, "admin").await? {
            ApproveOutcome::Delivered => format!("✅ {} approved and delivered", txid),
            ApproveOutcome::DeliveryFailed => {
                format!("⚠️ {} approved, delivery failed - retry is scheduled", txid)
            }
            ApproveOutcome::AlreadyDelivered => format!("✅ {} was already delivered", txid),
            ApproveOutcome::Conflict => {
                format!("⚠️ {} changed state already, nothing done", txid)
            }
        }
    } else if let Some(txid) = data.strip_prefix("pix_reject:") {
        reject(&bot, &bot_deps, txid, "the receipt could not be confirmed").await?;
        format!("🚫 {} rejected, buyer notified", txid)
    } else if let Some(txid) = data.strip_prefix("pix_reverse:") {
        reverse(&bot, &bot_deps, txid).await?;
        format!("↩️ {} marked reversed", txid)
    } else if let Some(txid) = data.strip_prefix("pix_redeliver:") {
        let Some(tx) = bot_deps.transactions.get(txid) else {
            anyhow::bail!("unknown txid {}", txid);
        };
        match attempt_delivery(&bot, &bot_deps, &tx).await {
            ApproveOutcome::Delivered => format!("📦 {} redelivered", txid),
            ApproveOutcome::DeliveryFailed => format!("⚠️ {} still failing delivery", txid),
            ApproveOutcome::AlreadyDelivered => format!("✅ {} was already delivered", txid),
            ApproveOutcome::Conflict => format!("⚠️ {} is not awaiting delivery", txid),
        }
    } else if let Some(txid) = data.strip_prefix("pix_forcedeliver:") {
        force_delivered(&bot_deps, txid).await?;
        format!("✅ {} marked delivered manually", txid)
    } else {
        warn!("unrecognized callback data: {}", data);
        bot.answer_callback_query(query.id).await?;
        return Ok(());
    };

    info!("admin action on callback {}: {}", data, outcome);
    bot.answer_callback_query(query.id.clone())
        .text(outcome.clone())
        .await?;

    // drop the keyboard so the action is not repeatable from the same card
    if let Some(MaybeInaccessibleMessage::Regular(message)) = &query.message {
        let updated = format!(
            "{}\n\n{}",
            message.text().unwrap_or_default(),
            outcome
        );
        bot.edit_message_text(message.chat.id, message.id, updated)
            .await?;
    }
    Ok(())
}
