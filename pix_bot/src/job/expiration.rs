//! Scheduled lifecycle work: expiring stale charges, membership
//! renewal reminders, and the grace-period expiry sweep with its
//! race-safe double-check.

use chrono::Utc;
use log::{error, info, warn};
use pix_core::error::CoreError;
use pix_core::helpers::dto::Charge;
use pix_core::pix::payload::create_charge;
use pix_core::pix::qr::render_qr_png;
use teloxide::types::{ChatId, InputFile, ParseMode, UserId};
use teloxide::{Bot, prelude::*};
use tokio_cron_scheduler::Job;

use crate::dependencies::BotDependencies;
use crate::memberships::dto::GroupMembership;
use crate::transactions::dto::{SubjectRef, Transaction, TransactionStatus};
use crate::transactions::state::attempt_delivery;
use crate::utils::{escape_html, format_time_duration};

const DAY_SECS: i64 = 24 * 3600;

/// Every minute: force-expire open charges past the payment window.
/// Proof-sent records that already carry a verdict are parked for
/// manual review and are left to the human.
pub fn job_expire_stale_transactions(bot: Bot, deps: BotDependencies) -> Job {
    Job::new_async("0 * * * * *", move |_uuid, _l| {
        let bot = bot.clone();
        let deps = deps.clone();
        Box::pin(async move {
            let now = Utc::now().timestamp();
            let window = deps.settings.payment_window_minutes;
            for tx in deps.transactions.list_open() {
                if !tx.is_past_window(now, window) {
                    continue;
                }
                if tx.status == TransactionStatus::ProofSent && tx.ocr_result.is_some() {
                    continue;
                }
                match deps.transactions.transition(
                    &tx.txid,
                    &[TransactionStatus::Pending, TransactionStatus::ProofSent],
                    TransactionStatus::Expired,
                    |_| {},
                ) {
                    Ok(expired) => {
                        info!("txid {} expired after {} minutes", expired.txid, window);
                        let message = format!(
                            "⏰ <b>Charge expired</b>\n\nYour PIX charge for {} was valid for {} minutes and was not paid.\n\nUse /buy whenever you want a fresh one.",
                            escape_html(&expired.subject.describe()),
                            window
                        );
                        if let Err(e) = bot
                            .send_message(ChatId(expired.chat_id), message)
                            .parse_mode(ParseMode::Html)
                            .await
                        {
                            warn!("could not notify {} of expiry: {}", expired.txid, e);
                        }
                    }
                    Err(CoreError::ConcurrencyConflict(_)) => {
                        // settled between scan and write; their outcome stands
                    }
                    Err(e) => error!("failed to expire {}: {}", tx.txid, e),
                }
            }
        })
    })
    .expect("Failed to create cron job")
}

/// Membership cycle every five minutes: early reminder, final-day
/// reminder, and the grace-expiry sweep. Each member is processed in
/// isolation so one bad record never halts the rest.
pub fn job_membership_cycle(bot: Bot, deps: BotDependencies) -> Job {
    Job::new_async("0 */5 * * * *", move |_uuid, _l| {
        let bot = bot.clone();
        let deps = deps.clone();
        Box::pin(async move {
            let now = Utc::now().timestamp();
            let members = deps.memberships.list_active();
            info!("membership cycle: {} active membership(s)", members.len());
            for membership in members {
                if let Err(e) = process_membership(&bot, &deps, &membership, now).await {
                    error!(
                        "membership cycle failed for user {} group {}: {}",
                        membership.telegram_id, membership.group_id, e
                    );
                }
            }
        })
    })
    .expect("Failed to create cron job")
}

async fn process_membership(
    bot: &Bot,
    deps: &BotDependencies,
    membership: &GroupMembership,
    now: i64,
) -> anyhow::Result<()> {
    let remaining = membership.expires_at - now;
    let reminder_window = deps.settings.reminder_days_before * DAY_SECS;
    let grace = deps.settings.expiry_grace_hours * 3600;

    if remaining > DAY_SECS && remaining <= reminder_window && membership.reminded_at.is_none() {
        send_renewal_reminder(bot, deps, membership, remaining, false).await
    } else if remaining > 0 && remaining <= DAY_SECS && membership.urgent_reminded_at.is_none() {
        send_renewal_reminder(bot, deps, membership, remaining, true).await
    } else if now - membership.expires_at > grace {
        sweep_lapsed_membership(bot, deps, membership).await
    } else {
        Ok(())
    }
}

/// Reuses the member's open renewal charge if one exists (only the QR
/// image is regenerated), otherwise issues a fresh one. Calling this
/// twice within one window therefore leaves exactly one open charge.
async fn reuse_or_create_renewal(
    deps: &BotDependencies,
    membership: &GroupMembership,
) -> anyhow::Result<Charge> {
    // i64::MAX cutoff: only open renewals count for reuse
    if let Some(existing) =
        deps.transactions
            .find_renewal(membership.telegram_id, membership.group_id, i64::MAX)
    {
        info!(
            "reusing open renewal {} for user {} group {}",
            existing.txid, membership.telegram_id, membership.group_id
        );
        return Ok(Charge {
            txid: existing.txid,
            pix_key: existing.pix_key,
            amount: existing.amount,
            payload: existing.pix_payload,
        });
    }

    let item = deps
        .catalog
        .find_group_item(membership.group_id)
        .ok_or_else(|| {
            anyhow::anyhow!("no catalog item sells access to group {}", membership.group_id)
        })?;

    let charge = create_charge(
        &deps.settings.pix_key,
        &deps.settings.merchant_name,
        &deps.settings.merchant_city,
        item.price,
        None,
    )?;
    let tx = Transaction::new(
        &charge,
        membership.telegram_id,
        membership.telegram_id,
        SubjectRef::Group(membership.group_id),
    );
    deps.transactions.put(&tx)?;
    info!(
        "issued renewal charge {} for user {} group {}",
        charge.txid, membership.telegram_id, membership.group_id
    );
    Ok(charge)
}

async fn send_renewal_reminder(
    bot: &Bot,
    deps: &BotDependencies,
    membership: &GroupMembership,
    remaining: i64,
    urgent: bool,
) -> anyhow::Result<()> {
    let charge = reuse_or_create_renewal(deps, membership).await?;
    let qr = render_qr_png(&charge.payload)?;

    let headline = if urgent {
        "🚨 <b>Your access expires today!</b>"
    } else {
        "⏳ <b>Your access expires soon</b>"
    };
    let caption = format!(
        "{}\n\nTime left: {}.\n\n💰 Renew for R$ {} - pay the QR above or copy the code:\n<code>{}</code>\n\nThen send me a screenshot of your receipt.",
        headline,
        format_time_duration(remaining),
        charge.amount,
        charge.payload
    );

    bot.send_photo(ChatId(membership.telegram_id), InputFile::memory(qr))
        .caption(caption)
        .parse_mode(ParseMode::Html)
        .await?;

    deps.memberships
        .set_reminded(membership.telegram_id, membership.group_id, urgent)?;
    Ok(())
}

/// Any non-terminal renewal for the pair blocks removal: approved
/// ones get re-delivered, open ones just park the kick until they
/// settle.
fn renewal_blocking_removal(
    deps: &BotDependencies,
    membership: &GroupMembership,
    approved_since: i64,
) -> Option<Transaction> {
    deps.transactions
        .find_renewal(membership.telegram_id, membership.group_id, approved_since)
}

/// The destructive pass. The renewal check runs twice, at selection
/// and again right before the kick, because a renewal can land in
/// between. The mark-expired write is conditional and fails if the
/// record moved at all since it was read.
async fn sweep_lapsed_membership(
    bot: &Bot,
    deps: &BotDependencies,
    membership: &GroupMembership,
) -> anyhow::Result<()> {
    let reminder_window = deps.settings.reminder_days_before * DAY_SECS;
    let approved_since = membership.expires_at - reminder_window;

    // check 1: selection time
    if let Some(renewal) = renewal_blocking_removal(deps, membership, approved_since) {
        return honor_renewal(bot, deps, membership, &renewal).await;
    }

    if !deps.memberships.mark_expired_if_unchanged(membership)? {
        info!(
            "membership for user {} group {} changed mid-sweep, skipping removal",
            membership.telegram_id, membership.group_id
        );
        return Ok(());
    }

    // check 2: immediately before the destructive action. A renewal
    // created or approved after check 1 never touches the membership
    // record, so it slips past the conditional update above.
    if let Some(renewal) = renewal_blocking_removal(deps, membership, approved_since) {
        return honor_renewal(bot, deps, membership, &renewal).await;
    }

    // Revocation is a kick (ban + immediate unban), never a permanent
    // ban. Platform failures here (missing bot privileges) must not
    // undo the stored expiry; log and continue.
    let chat = ChatId(membership.group_id);
    let user = UserId(membership.telegram_id as u64);
    match bot.ban_chat_member(chat, user).await {
        Ok(_) => {
            if let Err(e) = bot.unban_chat_member(chat, user).await {
                warn!(
                    "could not unban user {} in group {} after kick: {}",
                    membership.telegram_id, membership.group_id, e
                );
            }
        }
        Err(e) => warn!(
            "could not kick user {} from group {}: {}",
            membership.telegram_id, membership.group_id, e
        ),
    }

    info!(
        "membership expired for user {} group {}",
        membership.telegram_id, membership.group_id
    );

    // offer a way back in
    let charge = reuse_or_create_renewal(deps, membership).await?;
    let qr = render_qr_png(&charge.payload)?;
    bot.send_photo(ChatId(membership.telegram_id), InputFile::memory(qr))
        .caption(format!(
            "🔒 <b>Your group access has expired</b> and you were removed.\n\n💰 Rejoin any time for R$ {}: pay the QR above or copy the code:\n<code>{}</code>\n\nThen send me your receipt.",
            charge.amount, charge.payload
        ))
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

/// A renewal exists, so the member keeps their access: approved ones
/// get an idempotent re-invite (re-running delivery extends the
/// membership and re-sends the invite), open ones get a patience note.
async fn honor_renewal(
    bot: &Bot,
    deps: &BotDependencies,
    membership: &GroupMembership,
    renewal: &Transaction,
) -> anyhow::Result<()> {
    match renewal.status {
        TransactionStatus::Validated | TransactionStatus::DeliveryFailed => {
            info!(
                "sweep found approved renewal {} for user {}, ensuring access",
                renewal.txid, membership.telegram_id
            );
            attempt_delivery(bot, deps, renewal).await;
        }
        TransactionStatus::Delivered => {
            // delivered but the membership record lagged (restart mid
            // delivery); restore the grant without re-charging
            if let Some(item) = deps.catalog.find_group_item(membership.group_id) {
                if let crate::products::dto::Fulfillment::GroupAccess { duration_days, .. } =
                    item.fulfillment
                {
                    deps.memberships.upsert_extend(
                        membership.telegram_id,
                        membership.group_id,
                        i64::from(duration_days) * DAY_SECS,
                        &renewal.txid,
                    )?;
                    info!(
                        "restored membership for user {} group {} from delivered renewal {}",
                        membership.telegram_id, membership.group_id, renewal.txid
                    );
                }
            }
        }
        _ => {
            bot.send_message(
                ChatId(membership.telegram_id),
                "👀 Your renewal payment is still under review - your access is safe in the meantime.",
            )
            .await?;
        }
    }
    Ok(())
}

/// Hourly: drop expired verdicts from the in-memory cache.
pub fn job_purge_verdict_cache(deps: BotDependencies) -> Job {
    Job::new_async("0 0 * * * *", move |_uuid, _l| {
        let deps = deps.clone();
        Box::pin(async move {
            deps.pipeline.purge_cache();
        })
    })
    .expect("Failed to create cron job")
}
