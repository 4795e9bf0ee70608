use anyhow::Result;
use teloxide::{Bot, types::Message};

use crate::bot::handler::{
    handle_buy, handle_help, handle_products, handle_start, handle_status,
};
use crate::commands::Command;
use crate::dependencies::BotDependencies;

pub async fn answers(
    bot: Bot,
    msg: Message,
    cmd: Command,
    bot_deps: BotDependencies,
) -> Result<()> {
    match cmd {
        Command::Start => handle_start(bot, msg).await,
        Command::Help => handle_help(bot, msg).await,
        Command::Products => handle_products(bot, msg, bot_deps).await,
        Command::Buy(item_id) => handle_buy(bot, msg, &item_id, bot_deps).await,
        Command::Status => handle_status(bot, msg, bot_deps).await,
    }
}
