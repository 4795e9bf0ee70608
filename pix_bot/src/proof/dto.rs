use pix_core::helpers::dto::ProofKind;
use rust_decimal::Decimal;

/// Everything a pipeline stage needs to judge one proof file. The raw
/// bytes are always downloaded server-side first; `public_url` exists
/// only for the by-URL OCR fallback, because handing a third party a
/// URL and hoping it fetches is the unreliable path.
#[derive(Debug, Clone)]
pub struct ProofInput {
    pub txid: String,
    pub bytes: Vec<u8>,
    pub public_url: Option<String>,
    pub kind: ProofKind,
    pub expected_amount: Decimal,
    pub expected_key: String,
}
