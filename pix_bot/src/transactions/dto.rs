use chrono::Utc;
use pix_core::helpers::dto::{Charge, ProofKind, Verdict};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Transaction lifecycle. The serde names are string-stable: they are
/// persisted and used as filter predicates by the scheduler jobs, so
/// renaming a variant is a data migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    ProofSent,
    Validated,
    Delivered,
    Rejected,
    Expired,
    Reversed,
    DeliveryFailed,
}

impl TransactionStatus {
    /// Terminal states never mutate again except by admin force-action.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Delivered
                | TransactionStatus::Rejected
                | TransactionStatus::Expired
                | TransactionStatus::Reversed
        )
    }

    /// A payment still waiting on the payer or on review.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Pending | TransactionStatus::ProofSent
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "awaiting payment",
            TransactionStatus::ProofSent => "proof under review",
            TransactionStatus::Validated => "payment confirmed",
            TransactionStatus::Delivered => "delivered",
            TransactionStatus::Rejected => "rejected",
            TransactionStatus::Expired => "expired",
            TransactionStatus::Reversed => "reversed",
            TransactionStatus::DeliveryFailed => "delivery failed, retrying",
        }
    }
}

/// What is being purchased. Exactly one of the three.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SubjectRef {
    Product(String),
    MediaPack(String),
    Group(i64),
}

impl SubjectRef {
    pub fn describe(&self) -> String {
        match self {
            SubjectRef::Product(id) => format!("product {}", id),
            SubjectRef::MediaPack(id) => format!("media pack {}", id),
            SubjectRef::Group(id) => format!("group {}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryErrorKind {
    /// Recipient unreachable (blocked the bot). Not retryable.
    Blocked,
    /// Network trouble or rate limit. Retryable.
    Temporary,
    /// Anything unclassified. Retryable, logged for triage.
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    pub telegram_id: i64,
    pub chat_id: i64,
    pub amount: Decimal,
    pub pix_key: String,
    pub pix_payload: String,
    pub subject: SubjectRef,
    pub status: TransactionStatus,
    pub proof_file_ref: Option<String>,
    pub proof_kind: Option<ProofKind>,
    pub ocr_result: Option<Verdict>,
    pub delivery_attempts: u32,
    pub delivery_error: Option<DeliveryErrorKind>,
    pub last_delivery_attempt_at: Option<i64>,
    pub created_at: i64,
    pub proof_received_at: Option<i64>,
    pub validated_at: Option<i64>,
    pub delivered_at: Option<i64>,
}

impl Transaction {
    pub fn new(charge: &Charge, telegram_id: i64, chat_id: i64, subject: SubjectRef) -> Self {
        Self {
            txid: charge.txid.clone(),
            telegram_id,
            chat_id,
            amount: charge.amount,
            pix_key: charge.pix_key.clone(),
            pix_payload: charge.payload.clone(),
            subject,
            status: TransactionStatus::Pending,
            proof_file_ref: None,
            proof_kind: None,
            ocr_result: None,
            delivery_attempts: 0,
            delivery_error: None,
            last_delivery_attempt_at: None,
            created_at: Utc::now().timestamp(),
            proof_received_at: None,
            validated_at: None,
            delivered_at: None,
        }
    }

    /// Wall-clock payment window check; deadlines compare timestamps,
    /// nothing in flight is cancelled.
    pub fn is_past_window(&self, now: i64, window_minutes: i64) -> bool {
        now - self.created_at > window_minutes * 60
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde_names_are_stable() {
        let json = serde_json::to_string(&TransactionStatus::ProofSent).unwrap();
        assert_eq!(json, "\"proof_sent\"");
        let json = serde_json::to_string(&TransactionStatus::DeliveryFailed).unwrap();
        assert_eq!(json, "\"delivery_failed\"");
        let back: TransactionStatus = serde_json::from_str("\"expired\"").unwrap();
        assert_eq!(back, TransactionStatus::Expired);
    }

    #[test]
    fn test_terminal_and_open_partition() {
        use TransactionStatus::*;
        for s in [Pending, ProofSent, Validated, DeliveryFailed] {
            assert!(!s.is_terminal());
        }
        for s in [Delivered, Rejected, Expired, Reversed] {
            assert!(s.is_terminal());
            assert!(!s.is_open());
        }
    }

    #[test]
    fn test_payment_window() {
        let charge = pix_core::pix::payload::create_charge(
            "k@x.com",
            "Loja",
            "SP",
            "10.00".parse().unwrap(),
            None,
        )
        .unwrap();
        let tx = Transaction::new(&charge, 1, 1, SubjectRef::Product("p1".into()));
        assert!(!tx.is_past_window(tx.created_at + 29 * 60, 30));
        assert!(tx.is_past_window(tx.created_at + 31 * 60, 30));
    }
}
