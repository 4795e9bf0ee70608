use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};

/// All tunables, read once at startup. The merchant key is validated
/// here so a misconfigured deployment dies immediately instead of
/// handing out unpayable QR codes.
#[derive(Clone, Debug)]
pub struct Settings {
    pub pix_key: String,
    pub merchant_name: String,
    pub merchant_city: String,
    pub admin_chat_id: i64,
    pub ocr_api_url: String,
    pub ocr_api_key: String,
    /// Absent key switches the vision stage off entirely.
    pub openai_api_key: Option<String>,
    pub auto_approve_confidence: u8,
    pub auto_reject_confidence: u8,
    pub payment_window_minutes: i64,
    pub expiry_grace_hours: i64,
    pub reminder_days_before: i64,
    pub verdict_cache_ttl_secs: u64,
    pub ocr_stage_timeout_secs: u64,
    pub catalog_path: Option<String>,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let pix_key = env::var("PIX_KEY").context("PIX_KEY not set")?;
        if pix_key.trim().is_empty() {
            anyhow::bail!("PIX_KEY is empty; refusing to start without a merchant key");
        }

        let admin_chat_id = env::var("ADMIN_CHAT_ID")
            .context("ADMIN_CHAT_ID not set")?
            .parse()
            .context("ADMIN_CHAT_ID is not a chat id")?;

        Ok(Self {
            pix_key,
            merchant_name: env::var("MERCHANT_NAME").unwrap_or_else(|_| "PIX Seller".to_string()),
            merchant_city: env::var("MERCHANT_CITY").unwrap_or_else(|_| "SAO PAULO".to_string()),
            admin_chat_id,
            ocr_api_url: env::var("OCR_API_URL")
                .unwrap_or_else(|_| "https://api.ocr.space/parse/image".to_string()),
            ocr_api_key: env::var("OCR_API_KEY").unwrap_or_default(),
            openai_api_key: env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            auto_approve_confidence: env_or("AUTO_APPROVE_CONFIDENCE", 70),
            auto_reject_confidence: env_or("AUTO_REJECT_CONFIDENCE", 40),
            payment_window_minutes: env_or("PAYMENT_WINDOW_MINUTES", 30),
            expiry_grace_hours: env_or("EXPIRY_GRACE_HOURS", 24),
            reminder_days_before: env_or("REMINDER_DAYS_BEFORE", 3),
            verdict_cache_ttl_secs: env_or("VERDICT_CACHE_TTL_SECS", 3600),
            ocr_stage_timeout_secs: env_or("OCR_STAGE_TIMEOUT_SECS", 45),
            catalog_path: env::var("CATALOG_PATH").ok(),
        })
    }
}
