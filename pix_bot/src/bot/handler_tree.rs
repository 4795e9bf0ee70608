use anyhow::Result;
use teloxide::{
    Bot,
    dispatching::{DpHandlerDescription, HandlerExt, UpdateFilterExt},
    dptree::{self, Handler},
    types::{Message, Update},
};

use crate::{
    bot::{answers::answers, handler::handle_proof_message},
    callbacks::handle_callback_query,
    commands::Command,
    dependencies::BotDependencies,
};

pub fn handler_tree() -> Handler<'static, Result<()>, DpHandlerDescription> {
    dptree::entry()
        .branch(
            Update::filter_message()
                .branch(
                    dptree::entry()
                        .filter_command::<Command>()
                        .endpoint(answers),
                )
                // A DM with an attachment is a payment proof.
                .branch(
                    dptree::entry()
                        .filter(|msg: Message| {
                            msg.chat.is_private()
                                && (msg.photo().is_some() || msg.document().is_some())
                        })
                        .endpoint(
                            |bot: Bot, msg: Message, bot_deps: BotDependencies| async move {
                                handle_proof_message(bot, msg, bot_deps).await
                            },
                        ),
                ),
        )
        .branch(Update::filter_callback_query().endpoint(
            |bot: Bot,
             query: teloxide::types::CallbackQuery,
             bot_deps: BotDependencies| async move {
                handle_callback_query(bot, query, bot_deps).await
            },
        ))
}
