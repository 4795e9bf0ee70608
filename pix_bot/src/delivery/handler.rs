//! Delivery of purchased goods, with failure classification feeding
//! the retry loop and admin escalation.

use std::time::Duration;

use log::{error, info};
use teloxide::types::{
    ChatId, FileId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, ParseMode,
};
use teloxide::{ApiError, Bot, RequestError, prelude::*};

use crate::dependencies::BotDependencies;
use crate::products::dto::{CatalogItem, Fulfillment};
use crate::transactions::dto::{DeliveryErrorKind, SubjectRef, Transaction};
use crate::utils::{escape_html, format_timestamp};

/// Delay between consecutive outbound sends, to stay under the chat
/// platform's rate limits when shipping media packs.
const SEND_SPACING: Duration = Duration::from_millis(400);

#[derive(Debug)]
pub struct DeliveryFailure {
    pub kind: DeliveryErrorKind,
    pub message: String,
}

impl DeliveryFailure {
    fn from_request_error(err: RequestError) -> Self {
        let kind = classify(&err);
        Self {
            kind,
            message: err.to_string(),
        }
    }

    fn unknown(message: impl Into<String>) -> Self {
        Self {
            kind: DeliveryErrorKind::Unknown,
            message: message.into(),
        }
    }
}

/// Maps a chat-platform error onto a retry class. A blocked recipient
/// can never be reached by retrying, so that goes straight to an
/// operator; rate limits and network blips retry silently.
pub fn classify(err: &RequestError) -> DeliveryErrorKind {
    match err {
        RequestError::Api(ApiError::BotBlocked) | RequestError::Api(ApiError::UserDeactivated) => {
            DeliveryErrorKind::Blocked
        }
        RequestError::RetryAfter(_) | RequestError::Network(_) | RequestError::Io(_) => {
            DeliveryErrorKind::Temporary
        }
        _ => DeliveryErrorKind::Unknown,
    }
}

fn resolve_item(deps: &BotDependencies, subject: &SubjectRef) -> Option<CatalogItem> {
    match subject {
        SubjectRef::Product(id) | SubjectRef::MediaPack(id) => deps.catalog.get_item(id),
        SubjectRef::Group(group_id) => deps.catalog.find_group_item(*group_id),
    }
}

/// Ships the goods for one validated transaction. Used both by the
/// synchronous attempt on approval and by the retry job; it is
/// idempotent from the buyer's point of view (a re-send, not a second
/// grant of anything that wasn't already theirs).
pub async fn deliver(
    bot: &Bot,
    deps: &BotDependencies,
    tx: &Transaction,
) -> Result<(), DeliveryFailure> {
    let item = resolve_item(deps, &tx.subject).ok_or_else(|| {
        DeliveryFailure::unknown(format!(
            "no catalog item for {} on txid {}",
            tx.subject.describe(),
            tx.txid
        ))
    })?;

    let chat = ChatId(tx.chat_id);

    match &item.fulfillment {
        Fulfillment::Text { content } => {
            bot.send_message(
                chat,
                format!(
                    "✅ <b>Payment confirmed!</b>\n\n🎁 <b>{}</b>\n\n{}",
                    escape_html(&item.name),
                    escape_html(content)
                ),
            )
            .parse_mode(ParseMode::Html)
            .await
            .map_err(DeliveryFailure::from_request_error)?;
        }
        Fulfillment::TelegramFile { file_id, caption } => {
            let mut request = bot.send_document(chat, InputFile::file_id(FileId(file_id.clone())));
            if let Some(caption) = caption {
                request = request.caption(caption.clone());
            }
            request
                .await
                .map_err(DeliveryFailure::from_request_error)?;
        }
        Fulfillment::MediaPack { file_ids } => {
            bot.send_message(
                chat,
                format!(
                    "✅ <b>Payment confirmed!</b> Sending <b>{}</b> ({} files)...",
                    escape_html(&item.name),
                    file_ids.len()
                ),
            )
            .parse_mode(ParseMode::Html)
            .await
            .map_err(DeliveryFailure::from_request_error)?;

            for file_id in file_ids {
                bot.send_document(chat, InputFile::file_id(FileId(file_id.clone())))
                    .await
                    .map_err(DeliveryFailure::from_request_error)?;
                tokio::time::sleep(SEND_SPACING).await;
            }
        }
        Fulfillment::GroupAccess {
            group_id,
            duration_days,
        } => {
            let link = bot
                .create_chat_invite_link(ChatId(*group_id))
                .member_limit(1)
                .await
                .map_err(DeliveryFailure::from_request_error)?;

            let membership = deps
                .memberships
                .upsert_extend(
                    tx.telegram_id,
                    *group_id,
                    i64::from(*duration_days) * 24 * 3600,
                    &tx.txid,
                )
                .map_err(|e| DeliveryFailure::unknown(format!("membership store: {}", e)))?;

            bot.send_message(
                chat,
                format!(
                    "✅ <b>Payment confirmed!</b>\n\n🔑 Your access to <b>{}</b> is active until {}.\n\n👉 Join here: {}",
                    escape_html(&item.name),
                    format_timestamp(membership.expires_at),
                    link.invite_link
                ),
            )
            .parse_mode(ParseMode::Html)
            .await
            .map_err(DeliveryFailure::from_request_error)?;
        }
    }

    info!("delivered {} for txid {}", tx.subject.describe(), tx.txid);
    Ok(())
}

/// Non-retryable escalation: tells an operator a recipient cannot be
/// reached and offers the two manual resolutions.
pub async fn escalate_blocked(bot: &Bot, deps: &BotDependencies, tx: &Transaction, detail: &str) {
    let keyboard = InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("🔁 Force retry", format!("pix_redeliver:{}", tx.txid)),
        InlineKeyboardButton::callback(
            "✅ Mark delivered",
            format!("pix_forcedeliver:{}", tx.txid),
        ),
    ]]);

    let text = format!(
        "🚫 <b>Delivery blocked</b>\n\nTxid: <code>{}</code>\nBuyer: <code>{}</code>\nSubject: {}\nAttempts: {}\nError: {}\n\nThe recipient cannot be reached automatically.",
        tx.txid,
        tx.telegram_id,
        escape_html(&tx.subject.describe()),
        tx.delivery_attempts,
        escape_html(detail),
    );

    if let Err(e) = bot
        .send_message(ChatId(deps.settings.admin_chat_id), text)
        .parse_mode(ParseMode::Html)
        .reply_markup(keyboard)
        .await
    {
        error!("failed to escalate blocked delivery {}: {}", tx.txid, e);
    }
}
