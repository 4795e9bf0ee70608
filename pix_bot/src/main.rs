mod bot;
mod callbacks;
mod commands;
mod config;
mod delivery;
mod dependencies;
mod job;
mod memberships;
mod products;
mod proof;
mod transactions;
mod utils;

use teloxide::prelude::*;

use crate::bot::handler_tree::handler_tree;
use crate::config::Settings;
use crate::dependencies::BotDependencies;
use crate::job::job_scheduler::schedule_jobs;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();
    log::info!("Starting pix_bot...");

    let settings = Settings::from_env().expect("invalid configuration");
    let bot = Bot::from_env();
    let db = sled::open("pix_db").expect("Failed to open sled DB");
    let bot_deps = BotDependencies::new(db, settings).expect("Failed to build dependencies");

    if let Some(path) = bot_deps.settings.catalog_path.clone() {
        match bot_deps.catalog.seed_from_file(&path).await {
            Ok(count) => log::info!("seeded {} catalog item(s) from {}", count, path),
            Err(e) => log::warn!("could not seed catalog from {}: {}", path, e),
        }
    }

    schedule_jobs(bot.clone(), bot_deps.clone())
        .await
        .expect("Failed to start background jobs");

    Dispatcher::builder(bot, handler_tree())
        .dependencies(dptree::deps![bot_deps])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}
