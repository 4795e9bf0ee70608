//! Transition orchestration: every legal state change, the side
//! effects it triggers, and the optimistic conflict handling. All
//! writes go through the storage CAS, so a racing trigger on the same
//! transaction makes exactly one writer win; the loser logs and
//! stands down.

use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use pix_core::error::CoreError;
use pix_core::helpers::dto::{Decision, ProofKind, Verdict};
use pix_core::score::decide;
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup, ParseMode};
use teloxide::{Bot, prelude::*};

use crate::delivery::handler::{deliver, escalate_blocked};
use crate::dependencies::BotDependencies;
use crate::proof::dto::ProofInput;
use crate::transactions::dto::{DeliveryErrorKind, Transaction, TransactionStatus};
use crate::utils::escape_html;

/// What an approval attempt amounted to.
#[derive(Debug, PartialEq, Eq)]
pub enum ApproveOutcome {
    Delivered,
    DeliveryFailed,
    /// Idempotent no-op: the product was already delivered once and
    /// must never be delivered twice for one payment.
    AlreadyDelivered,
    /// Another writer changed the state first; their outcome stands.
    Conflict,
}

fn is_conflict(err: &CoreError) -> bool {
    matches!(err, CoreError::ConcurrencyConflict(_))
}

/// Where an approval stands before any delivery is attempted.
#[derive(Debug)]
enum ApprovalStart {
    AlreadyDelivered,
    Conflict,
    Validated(Transaction),
}

/// The storage half of an approval: the delivered-already guard and
/// the conditional move into `Validated`. Exactly one caller per txid
/// ever gets `Validated` back, which is what makes delivery single-shot.
fn begin_approval(deps: &BotDependencies, txid: &str, source: &str) -> Result<ApprovalStart> {
    let Some(current) = deps.transactions.get(txid) else {
        anyhow::bail!("unknown txid {}", txid);
    };

    if current.status == TransactionStatus::Delivered {
        info!(
            "txid {} already delivered, approval by {} is a no-op",
            txid, source
        );
        return Ok(ApprovalStart::AlreadyDelivered);
    }

    match deps.transactions.transition(
        txid,
        &[TransactionStatus::ProofSent],
        TransactionStatus::Validated,
        |t| t.validated_at = Some(Utc::now().timestamp()),
    ) {
        Ok(tx) => Ok(ApprovalStart::Validated(tx)),
        Err(e) if is_conflict(&e) => {
            info!("approval of {} by {} lost the race: {}", txid, source, e);
            Ok(ApprovalStart::Conflict)
        }
        Err(e) => Err(e.into()),
    }
}

/// Window guard for an uploaded proof: past the payment window the
/// charge is force-expired (a concurrent settlement stands) and the
/// upload is refused. Returns whether the proof was too late.
fn expire_late_proof(deps: &BotDependencies, tx: &Transaction, now: i64) -> bool {
    let window = deps.settings.payment_window_minutes;
    if !tx.is_past_window(now, window) {
        return false;
    }
    match deps.transactions.transition(
        &tx.txid,
        &[TransactionStatus::Pending, TransactionStatus::ProofSent],
        TransactionStatus::Expired,
        |_| {},
    ) {
        Ok(_) => info!("txid {} expired on late proof upload", tx.txid),
        Err(e) if is_conflict(&e) => {
            info!("txid {} already settled, ignoring late proof", tx.txid)
        }
        Err(e) => warn!("failed to expire txid {}: {}", tx.txid, e),
    }
    true
}

/// Handles an uploaded proof for the buyer's newest open transaction:
/// enforces the payment window, records the proof, runs the analysis
/// cascade and acts on the verdict.
pub async fn submit_proof(
    bot: &Bot,
    deps: &BotDependencies,
    tx: Transaction,
    file_ref: String,
    kind: ProofKind,
    bytes: Vec<u8>,
    public_url: Option<String>,
) -> Result<()> {
    let now = Utc::now().timestamp();

    if expire_late_proof(deps, &tx, now) {
        bot.send_message(
            ChatId(tx.chat_id),
            format!(
                "⏰ <b>Payment window expired</b>\n\nThis charge was only valid for {} minutes. If you already paid, contact support; otherwise use /buy to get a fresh charge.",
                deps.settings.payment_window_minutes
            ),
        )
        .parse_mode(ParseMode::Html)
        .await?;
        return Ok(());
    }

    let tx = match deps.transactions.transition(
        &tx.txid,
        &[TransactionStatus::Pending, TransactionStatus::ProofSent],
        TransactionStatus::ProofSent,
        |t| {
            t.proof_file_ref = Some(file_ref.clone());
            t.proof_kind = Some(kind);
            t.proof_received_at = Some(now);
        },
    ) {
        Ok(tx) => tx,
        Err(e) if is_conflict(&e) => {
            info!("txid {} no longer open, ignoring proof: {}", tx.txid, e);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    bot.send_message(
        ChatId(tx.chat_id),
        "🔎 Proof received! Analyzing your receipt, this takes a few seconds...",
    )
    .await?;

    let input = ProofInput {
        txid: tx.txid.clone(),
        bytes,
        public_url,
        kind,
        expected_amount: tx.amount,
        expected_key: tx.pix_key.clone(),
    };
    let verdict = deps.pipeline.analyze(&input).await;

    if let Err(e) = deps.transactions.update(&tx.txid, |t| {
        t.ocr_result = Some(verdict.clone());
    }) {
        warn!("failed to persist verdict for {}: {}", tx.txid, e);
    }

    match decide(
        &verdict,
        deps.settings.auto_approve_confidence,
        deps.settings.auto_reject_confidence,
    ) {
        Decision::Approve => {
            approve(bot, deps, &tx.txid, "auto").await?;
        }
        Decision::Reject => {
            reject(
                bot,
                deps,
                &tx.txid,
                "the receipt does not match this charge",
            )
            .await?;
        }
        Decision::Manual => {
            bot.send_message(
                ChatId(tx.chat_id),
                "👀 Your proof needs a quick human look. You'll be notified as soon as it's reviewed - nothing else to do for now.",
            )
            .await?;
            notify_manual_review(bot, deps, &tx, &verdict).await;
        }
    }

    Ok(())
}

async fn notify_manual_review(bot: &Bot, deps: &BotDependencies, tx: &Transaction, v: &Verdict) {
    let keyboard = InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("✅ Approve", format!("pix_approve:{}", tx.txid)),
        InlineKeyboardButton::callback("❌ Reject", format!("pix_reject:{}", tx.txid)),
        InlineKeyboardButton::callback("↩️ Reverse", format!("pix_reverse:{}", tx.txid)),
    ]]);

    let text = format!(
        "🧐 <b>Manual review needed</b>\n\nTxid: <code>{}</code>\nBuyer: <code>{}</code>\nSubject: {}\nAmount: R$ {}\n\nVerdict: confidence {}, amount seen: {}, key found: {}\nReason: {}",
        tx.txid,
        tx.telegram_id,
        escape_html(&tx.subject.describe()),
        tx.amount,
        v.confidence,
        v.extracted_amount
            .map(|a| a.to_string())
            .unwrap_or_else(|| "none".to_string()),
        v.key_found,
        escape_html(&v.reason),
    );

    if let Err(e) = bot
        .send_message(ChatId(deps.settings.admin_chat_id), text)
        .parse_mode(ParseMode::Html)
        .reply_markup(keyboard)
        .await
    {
        warn!("failed to notify admin for manual review {}: {}", tx.txid, e);
    }
}

/// Approves a transaction and synchronously attempts delivery.
/// Idempotent: a second approval of the same txid never re-delivers.
pub async fn approve(
    bot: &Bot,
    deps: &BotDependencies,
    txid: &str,
    source: &str,
) -> Result<ApproveOutcome> {
    let validated = match begin_approval(deps, txid, source)? {
        ApprovalStart::AlreadyDelivered => return Ok(ApproveOutcome::AlreadyDelivered),
        ApprovalStart::Conflict => return Ok(ApproveOutcome::Conflict),
        ApprovalStart::Validated(tx) => tx,
    };

    info!("txid {} validated by {}", txid, source);
    Ok(attempt_delivery(bot, deps, &validated).await)
}

/// One delivery attempt for a validated transaction, recording the
/// outcome. Entering `Validated` always comes through here before
/// control returns to the trigger.
pub async fn attempt_delivery(
    bot: &Bot,
    deps: &BotDependencies,
    tx: &Transaction,
) -> ApproveOutcome {
    match deliver(bot, deps, tx).await {
        Ok(()) => {
            match deps.transactions.transition(
                &tx.txid,
                &[TransactionStatus::Validated, TransactionStatus::DeliveryFailed],
                TransactionStatus::Delivered,
                |t| {
                    t.delivered_at = Some(Utc::now().timestamp());
                    t.delivery_error = None;
                },
            ) {
                Ok(_) => ApproveOutcome::Delivered,
                Err(e) => {
                    warn!("delivered {} but could not record it: {}", tx.txid, e);
                    ApproveOutcome::Delivered
                }
            }
        }
        Err(failure) => {
            warn!(
                "delivery of {} failed ({:?}): {}",
                tx.txid, failure.kind, failure.message
            );
            let updated = deps.transactions.transition(
                &tx.txid,
                &[TransactionStatus::Validated, TransactionStatus::DeliveryFailed],
                TransactionStatus::DeliveryFailed,
                |t| {
                    t.delivery_attempts += 1;
                    t.delivery_error = Some(failure.kind);
                    t.last_delivery_attempt_at = Some(Utc::now().timestamp());
                },
            );
            if failure.kind == DeliveryErrorKind::Blocked {
                let tx_for_escalation = updated.as_ref().unwrap_or(tx);
                escalate_blocked(bot, deps, tx_for_escalation, &failure.message).await;
            }
            ApproveOutcome::DeliveryFailed
        }
    }
}

/// Rejects a proof with an explicit, actionable message to the buyer.
pub async fn reject(bot: &Bot, deps: &BotDependencies, txid: &str, reason: &str) -> Result<()> {
    let rejected = match deps.transactions.transition(
        txid,
        &[TransactionStatus::ProofSent],
        TransactionStatus::Rejected,
        |_| {},
    ) {
        Ok(tx) => tx,
        Err(e) if is_conflict(&e) => {
            info!("rejection of {} lost the race: {}", txid, e);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    bot.send_message(
        ChatId(rejected.chat_id),
        format!(
            "❌ <b>Payment proof rejected</b>\n\nReason: {}.\n\nIf you believe this is a mistake, contact support with your receipt. To try again, use /buy for a new charge.",
            escape_html(reason)
        ),
    )
    .parse_mode(ParseMode::Html)
    .await?;
    Ok(())
}

/// Admin force-action for disputes, allowed from any non-terminal
/// state.
pub async fn reverse(bot: &Bot, deps: &BotDependencies, txid: &str) -> Result<()> {
    let reversed = match deps.transactions.transition(
        txid,
        &[
            TransactionStatus::Pending,
            TransactionStatus::ProofSent,
            TransactionStatus::Validated,
            TransactionStatus::DeliveryFailed,
        ],
        TransactionStatus::Reversed,
        |_| {},
    ) {
        Ok(tx) => tx,
        Err(e) if is_conflict(&e) => {
            info!("reverse of {} skipped: {}", txid, e);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    bot.send_message(
        ChatId(reversed.chat_id),
        "↩️ This payment was reversed by an operator. Contact support for details.",
    )
    .await?;
    Ok(())
}

/// Manual resolution when the automated channel cannot reach the
/// buyer: the operator confirms delivery happened out of band.
pub async fn force_delivered(deps: &BotDependencies, txid: &str) -> Result<()> {
    match deps.transactions.transition(
        txid,
        &[
            TransactionStatus::Validated,
            TransactionStatus::DeliveryFailed,
        ],
        TransactionStatus::Delivered,
        |t| {
            t.delivered_at = Some(Utc::now().timestamp());
            t.delivery_error = None;
        },
    ) {
        Ok(_) => Ok(()),
        Err(e) if is_conflict(&e) => {
            info!("force-deliver of {} skipped: {}", txid, e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::transactions::dto::SubjectRef;
    use pix_core::pix::payload::create_charge;

    fn test_settings() -> Settings {
        Settings {
            pix_key: "teste@pix.com".into(),
            merchant_name: "Loja".into(),
            merchant_city: "SP".into(),
            admin_chat_id: 1,
            ocr_api_url: "http://localhost/unused".into(),
            ocr_api_key: String::new(),
            openai_api_key: None,
            auto_approve_confidence: 70,
            auto_reject_confidence: 40,
            payment_window_minutes: 30,
            expiry_grace_hours: 24,
            reminder_days_before: 3,
            verdict_cache_ttl_secs: 60,
            ocr_stage_timeout_secs: 5,
            catalog_path: None,
        }
    }

    fn test_deps() -> BotDependencies {
        let db = sled::Config::new().temporary(true).open().unwrap();
        BotDependencies::new(db, test_settings()).unwrap()
    }

    fn pending_tx(deps: &BotDependencies) -> Transaction {
        let charge = create_charge(
            "teste@pix.com",
            "Loja",
            "SP",
            "10.00".parse().unwrap(),
            None,
        )
        .unwrap();
        let tx = Transaction::new(&charge, 7, 7, SubjectRef::Product("p1".into()));
        deps.transactions.put(&tx).unwrap();
        tx
    }

    fn proof_sent_tx(deps: &BotDependencies) -> Transaction {
        let tx = pending_tx(deps);
        deps.transactions
            .transition(
                &tx.txid,
                &[TransactionStatus::Pending],
                TransactionStatus::ProofSent,
                |_| {},
            )
            .unwrap()
    }

    #[test]
    fn test_one_approval_wins_and_delivered_never_repeats() {
        let deps = test_deps();
        let tx = proof_sent_tx(&deps);

        let first = begin_approval(&deps, &tx.txid, "admin").unwrap();
        assert!(matches!(first, ApprovalStart::Validated(_)));

        // a racing second approver loses: the state already moved
        assert!(matches!(
            begin_approval(&deps, &tx.txid, "auto").unwrap(),
            ApprovalStart::Conflict
        ));

        deps.transactions
            .transition(
                &tx.txid,
                &[TransactionStatus::Validated],
                TransactionStatus::Delivered,
                |t| t.delivered_at = Some(Utc::now().timestamp()),
            )
            .unwrap();

        // a delivered transaction can be approved again safely, but
        // nothing is ever handed out a second time
        assert!(matches!(
            begin_approval(&deps, &tx.txid, "admin").unwrap(),
            ApprovalStart::AlreadyDelivered
        ));
    }

    #[test]
    fn test_proof_after_window_expires_the_charge() {
        let deps = test_deps();
        let mut tx = pending_tx(&deps);
        tx.created_at -= 31 * 60;
        deps.transactions.put(&tx).unwrap();

        assert!(expire_late_proof(&deps, &tx, Utc::now().timestamp()));
        let stored = deps.transactions.get(&tx.txid).unwrap();
        assert_eq!(stored.status, TransactionStatus::Expired);
    }

    #[test]
    fn test_proof_inside_window_leaves_charge_open() {
        let deps = test_deps();
        let mut tx = pending_tx(&deps);
        tx.created_at -= 29 * 60;
        deps.transactions.put(&tx).unwrap();

        assert!(!expire_late_proof(&deps, &tx, Utc::now().timestamp()));
        let stored = deps.transactions.get(&tx.txid).unwrap();
        assert_eq!(stored.status, TransactionStatus::Pending);
    }
}
