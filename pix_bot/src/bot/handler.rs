//! Message handlers: the purchase flow and proof uploads.

use anyhow::Result;
use log::{error, info};
use pix_core::helpers::dto::{Charge, ProofKind};
use pix_core::pix::payload::create_charge;
use pix_core::pix::qr::render_qr_png;
use teloxide::net::Download;
use teloxide::types::{ChatId, InputFile, ParseMode};
use teloxide::utils::command::BotCommands;
use teloxide::{Bot, prelude::*};

use crate::commands::Command;
use crate::dependencies::BotDependencies;
use crate::products::dto::Fulfillment;
use crate::transactions::dto::{SubjectRef, Transaction};
use crate::transactions::state::submit_proof;
use crate::utils::{escape_html, format_timestamp};

pub async fn handle_start(bot: Bot, msg: Message) -> Result<()> {
    bot.send_message(
        msg.chat.id,
        "👋 Welcome! This shop sells digital goods and group access paid via PIX.\n\n🛍 /products - see what's available\n💳 /buy <item_id> - get a PIX charge\n📸 After paying, send me a screenshot or PDF of your receipt and I'll confirm it.",
    )
    .await?;
    Ok(())
}

pub async fn handle_help(bot: Bot, msg: Message) -> Result<()> {
    bot.send_message(msg.chat.id, Command::descriptions().to_string())
        .await?;
    Ok(())
}

pub async fn handle_products(bot: Bot, msg: Message, bot_deps: BotDependencies) -> Result<()> {
    let items = bot_deps.catalog.list_items();
    if items.is_empty() {
        bot.send_message(msg.chat.id, "🛍 The catalog is empty right now, check back later!")
            .await?;
        return Ok(());
    }

    let listing = items
        .iter()
        .map(|item| {
            let kind = match &item.fulfillment {
                Fulfillment::GroupAccess { duration_days, .. } => {
                    format!("group access, {} days", duration_days)
                }
                Fulfillment::MediaPack { file_ids } => {
                    format!("media pack, {} files", file_ids.len())
                }
                _ => "digital product".to_string(),
            };
            format!(
                "• <b>{}</b> (<code>{}</code>) - R$ {} - {}",
                escape_html(&item.name),
                item.id,
                item.price,
                kind
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    bot.send_message(
        msg.chat.id,
        format!("🛍 <b>Available items</b>\n\n{}\n\n💳 Buy one with /buy <code>item_id</code>", listing),
    )
    .parse_mode(ParseMode::Html)
    .await?;
    Ok(())
}

/// Sends one charge to the buyer: QR photo, copy-paste payload and the
/// human expiry time.
pub async fn send_charge(
    bot: &Bot,
    chat_id: ChatId,
    charge: &Charge,
    created_at: i64,
    window_minutes: i64,
) -> Result<()> {
    let qr = render_qr_png(&charge.payload)?;
    let expires_at = created_at + window_minutes * 60;
    let caption = format!(
        "💳 <b>PIX charge - R$ {}</b>\n\nScan the QR above or copy the code:\n<code>{}</code>\n\n⏰ Valid until {}.\n\n📸 After paying, send me your receipt (screenshot or PDF) here.",
        charge.amount,
        escape_html(&charge.payload),
        format_timestamp(expires_at),
    );

    bot.send_photo(chat_id, InputFile::memory(qr))
        .caption(caption)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

pub async fn handle_buy(
    bot: Bot,
    msg: Message,
    item_id: &str,
    bot_deps: BotDependencies,
) -> Result<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let telegram_id = user.id.0 as i64;

    let item_id = item_id.trim();
    if item_id.is_empty() {
        bot.send_message(msg.chat.id, "Usage: /buy <item_id> - see /products for the ids.")
            .await?;
        return Ok(());
    }

    let Some(item) = bot_deps.catalog.get_item(item_id) else {
        bot.send_message(
            msg.chat.id,
            format!("❓ No item with id <code>{}</code>. See /products.", escape_html(item_id)),
        )
        .parse_mode(ParseMode::Html)
        .await?;
        return Ok(());
    };

    let subject = match &item.fulfillment {
        Fulfillment::GroupAccess { group_id, .. } => SubjectRef::Group(*group_id),
        Fulfillment::MediaPack { .. } => SubjectRef::MediaPack(item.id.clone()),
        _ => SubjectRef::Product(item.id.clone()),
    };

    // at most one open charge per (user, subject): reuse the newest
    if let Some(existing) = bot_deps.transactions.find_active(telegram_id, &subject) {
        info!(
            "reusing open charge {} for user {} on {}",
            existing.txid,
            telegram_id,
            subject.describe()
        );
        let charge = Charge {
            txid: existing.txid.clone(),
            pix_key: existing.pix_key.clone(),
            amount: existing.amount,
            payload: existing.pix_payload.clone(),
        };
        bot.send_message(
            msg.chat.id,
            "ℹ️ You already have an open charge for this item - here it is again.",
        )
        .await?;
        send_charge(
            &bot,
            msg.chat.id,
            &charge,
            existing.created_at,
            bot_deps.settings.payment_window_minutes,
        )
        .await?;
        return Ok(());
    }

    let charge = match create_charge(
        &bot_deps.settings.pix_key,
        &bot_deps.settings.merchant_name,
        &bot_deps.settings.merchant_city,
        item.price,
        None,
    ) {
        Ok(charge) => charge,
        Err(e) => {
            error!("charge creation failed for item {}: {}", item.id, e);
            bot.send_message(
                msg.chat.id,
                "😞 The shop is misconfigured and cannot issue charges right now. The operator has been notified.",
            )
            .await?;
            return Err(e.into());
        }
    };

    let tx = Transaction::new(&charge, telegram_id, msg.chat.id.0, subject);
    bot_deps.transactions.put(&tx)?;
    info!(
        "created charge {} for user {} on item {}",
        charge.txid, telegram_id, item.id
    );

    send_charge(
        &bot,
        msg.chat.id,
        &charge,
        tx.created_at,
        bot_deps.settings.payment_window_minutes,
    )
    .await?;
    Ok(())
}

pub async fn handle_status(bot: Bot, msg: Message, bot_deps: BotDependencies) -> Result<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let telegram_id = user.id.0 as i64;

    match bot_deps.transactions.find_newest_open_for_user(telegram_id) {
        Some(tx) => {
            bot.send_message(
                msg.chat.id,
                format!(
                    "📦 Your latest payment (<code>{}</code>) for {} is: <b>{}</b>.",
                    tx.txid,
                    escape_html(&tx.subject.describe()),
                    tx.status.label()
                ),
            )
            .parse_mode(ParseMode::Html)
            .await?;
        }
        None => {
            bot.send_message(
                msg.chat.id,
                "📦 No open payments right now. Use /buy to start one!",
            )
            .await?;
        }
    }
    Ok(())
}

/// A photo or document arriving in DM is treated as a payment proof
/// for the buyer's most recent open transaction.
pub async fn handle_proof_message(bot: Bot, msg: Message, bot_deps: BotDependencies) -> Result<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let telegram_id = user.id.0 as i64;

    let Some(tx) = bot_deps.transactions.find_newest_open_for_user(telegram_id) else {
        bot.send_message(
            msg.chat.id,
            "🤔 I got your file, but you have no open purchase. Use /buy first, then send the receipt.",
        )
        .await?;
        return Ok(());
    };

    let picked = if let Some(photos) = msg.photo() {
        photos
            .last()
            .map(|photo| (photo.file.id.clone(), ProofKind::Image))
    } else if let Some(document) = msg.document() {
        let mime = document
            .mime_type
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_default();
        if mime.contains("pdf") {
            Some((document.file.id.clone(), ProofKind::Pdf))
        } else if mime.starts_with("image/") {
            Some((document.file.id.clone(), ProofKind::Image))
        } else {
            None
        }
    } else {
        None
    };

    let Some((file_id, kind)) = picked else {
        bot.send_message(
            msg.chat.id,
            "❓ I can only read image or PDF receipts. Please send a screenshot or the PDF from your bank app.",
        )
        .await?;
        return Ok(());
    };

    let file_info = bot.get_file(file_id.clone()).await?;
    let mut bytes: Vec<u8> = Vec::new();
    bot.download_file(&file_info.path, &mut bytes).await?;

    // self-hosted fallback URL for the by-URL OCR stage
    let public_url = format!(
        "https://api.telegram.org/file/bot{}/{}",
        bot.token(),
        file_info.path
    );

    submit_proof(
        &bot,
        &bot_deps,
        tx,
        file_id.to_string(),
        kind,
        bytes,
        Some(public_url),
    )
    .await
}
