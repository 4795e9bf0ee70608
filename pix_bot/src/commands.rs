use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
pub enum Command {
    #[command(description = "Welcome message and how to buy.")]
    Start,
    #[command(description = "Display this text.")]
    Help,
    #[command(description = "List items available for purchase.")]
    Products,
    #[command(description = "Buy an item: /buy <item_id>.")]
    Buy(String),
    #[command(description = "Show the status of your latest payment.")]
    Status,
}
