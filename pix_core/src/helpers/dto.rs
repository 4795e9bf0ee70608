use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One issued PIX charge: everything outbound messaging needs to show
/// the payer. `payload` is the round-trip-exact field; the QR image is
/// rendered from it on demand and never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Charge {
    pub txid: String,
    pub pix_key: String,
    pub amount: Decimal,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofKind {
    Image,
    Pdf,
}

/// Which pipeline stage produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMethod {
    Vision,
    OcrUpload,
    OcrUrl,
    Manual,
}

/// Outcome of analyzing one proof file. `is_valid: None` means every
/// automated stage failed and a human has to look.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub is_valid: Option<bool>,
    pub confidence: u8,
    pub extracted_amount: Option<Decimal>,
    pub key_found: bool,
    pub method: AnalysisMethod,
    pub reason: String,
}

impl Verdict {
    pub fn manual_fallback(reason: impl Into<String>) -> Self {
        Self {
            is_valid: None,
            confidence: 0,
            extracted_amount: None,
            key_found: false,
            method: AnalysisMethod::Manual,
            reason: reason.into(),
        }
    }
}

/// What the state machine should do with a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
    Manual,
}
