//! Periodic retry of failed deliveries. Blocked recipients are not
//! retried here; they were escalated to an operator when the failure
//! was classified.

use std::time::Duration;

use teloxide::Bot;
use tokio_cron_scheduler::Job;

use crate::dependencies::BotDependencies;
use crate::transactions::dto::{DeliveryErrorKind, TransactionStatus};
use crate::transactions::state::attempt_delivery;

/// Spacing between retried sends, for outbound rate limits.
const RETRY_SPACING: Duration = Duration::from_millis(500);

pub fn job_retry_failed_deliveries(bot: Bot, deps: BotDependencies) -> Job {
    Job::new_async("0 * * * * *", move |_uuid, _l| {
        let bot = bot.clone();
        let deps = deps.clone();
        Box::pin(async move {
            let failed = deps
                .transactions
                .list_with_status(TransactionStatus::DeliveryFailed);
            if failed.is_empty() {
                return;
            }
            log::info!("delivery retry: {} transaction(s) to retry", failed.len());

            for tx in failed {
                if tx.delivery_error == Some(DeliveryErrorKind::Blocked) {
                    continue;
                }
                let outcome = attempt_delivery(&bot, &deps, &tx).await;
                log::info!("retry of {} ended as {:?}", tx.txid, outcome);
                tokio::time::sleep(RETRY_SPACING).await;
            }
        })
    })
    .expect("Failed to create cron job")
}
