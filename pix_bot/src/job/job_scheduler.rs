use anyhow::Result;
use teloxide::Bot;
use tokio_cron_scheduler::JobScheduler;

use crate::delivery::retry::job_retry_failed_deliveries;
use crate::dependencies::BotDependencies;
use crate::job::expiration::{
    job_expire_stale_transactions, job_membership_cycle, job_purge_verdict_cache,
};

pub async fn schedule_jobs(bot: Bot, deps: BotDependencies) -> Result<()> {
    log::info!("Initializing job scheduler...");

    let scheduler = match JobScheduler::new().await {
        Ok(scheduler) => scheduler,
        Err(e) => {
            log::error!("Failed to create job scheduler: {}", e);
            return Err(anyhow::anyhow!("Failed to create job scheduler: {}", e));
        }
    };

    let job_expire = job_expire_stale_transactions(bot.clone(), deps.clone());
    let job_memberships = job_membership_cycle(bot.clone(), deps.clone());
    let job_retry = job_retry_failed_deliveries(bot, deps.clone());
    let job_cache = job_purge_verdict_cache(deps);

    if let Err(e) = scheduler.add(job_expire).await {
        log::error!("Failed to add charge expiry job to scheduler: {}", e);
        return Err(anyhow::anyhow!("Failed to add charge expiry job: {}", e));
    }

    if let Err(e) = scheduler.add(job_memberships).await {
        log::error!("Failed to add membership cycle job to scheduler: {}", e);
        return Err(anyhow::anyhow!("Failed to add membership cycle job: {}", e));
    }

    if let Err(e) = scheduler.add(job_retry).await {
        log::error!("Failed to add delivery retry job to scheduler: {}", e);
        return Err(anyhow::anyhow!("Failed to add delivery retry job: {}", e));
    }

    if let Err(e) = scheduler.add(job_cache).await {
        log::error!("Failed to add cache purge job to scheduler: {}", e);
        return Err(anyhow::anyhow!("Failed to add cache purge job: {}", e));
    }

    if let Err(e) = scheduler.start().await {
        log::error!("Failed to start job scheduler: {}", e);
        return Err(anyhow::anyhow!("Failed to start scheduler: {}", e));
    }

    log::info!("All jobs scheduled successfully");
    Ok(())
}
