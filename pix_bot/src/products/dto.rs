use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How a purchased item reaches the buyer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fulfillment {
    /// Secret text (license key, download link).
    Text { content: String },
    /// A file already uploaded to Telegram, re-sent by file id.
    TelegramFile {
        file_id: String,
        caption: Option<String>,
    },
    /// Several Telegram files sent in sequence.
    MediaPack { file_ids: Vec<String> },
    /// Time-boxed membership in a group or channel.
    GroupAccess { group_id: i64, duration_days: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    pub name: String,
    pub price: Decimal,
    pub fulfillment: Fulfillment,
}
