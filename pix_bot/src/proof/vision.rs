//! Vision-model stage: structured extraction from the receipt image.
//! Feature-flagged on `OPENAI_API_KEY`; absent key means the pipeline
//! starts at the OCR stage.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use open_ai_rust_responses_by_sshift::types::InputItem;
use open_ai_rust_responses_by_sshift::{Client as OAIClient, Model, RecoveryPolicy, Request};
use pix_core::helpers::dto::{AnalysisMethod, ProofKind, Verdict};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::dto::ProofInput;
use super::pipeline::ProofAnalyzer;

#[derive(Debug, Deserialize)]
struct VisionExtraction {
    is_valid: bool,
    #[serde(default)]
    amount: Option<String>,
    #[serde(default)]
    key_found: bool,
    #[serde(default)]
    confidence: u8,
    #[serde(default)]
    reason: Option<String>,
}

pub struct VisionAnalyzer {
    client: OAIClient,
}

impl VisionAnalyzer {
    pub fn new(api_key: &str) -> Result<Self> {
        let client = OAIClient::new_with_recovery(api_key, RecoveryPolicy::default())
            .map_err(|e| anyhow!("failed to create OpenAI client: {}", e))?;
        Ok(Self { client })
    }

    fn prompt(input: &ProofInput) -> String {
        format!(
            "You are validating a Brazilian PIX payment receipt. \
             Expected amount: {} BRL. Expected recipient key: {}. \
             Reply with ONLY a JSON object, no markdown fences, with \
             fields: is_valid (bool: the receipt shows a completed PIX \
             payment of exactly the expected amount to the expected \
             key), amount (string, the amount shown, e.g. \"21.90\"), \
             key_found (bool), confidence (0-100 integer), reason \
             (short string).",
            input.expected_amount, input.expected_key
        )
    }

    fn parse_reply(raw: &str) -> Result<VisionExtraction> {
        // Models occasionally fence the JSON anyway; strip before parsing.
        let trimmed = raw
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        serde_json::from_str(trimmed)
            .map_err(|e| anyhow!("vision reply is not the requested JSON: {} ({})", e, trimmed))
    }
}

#[async_trait]
impl ProofAnalyzer for VisionAnalyzer {
    fn name(&self) -> &'static str {
        "vision"
    }

    async fn analyze(&self, input: &ProofInput) -> Result<Verdict> {
        if input.kind == ProofKind::Pdf {
            return Err(anyhow!("vision stage only handles images"));
        }

        let data_url = format!(
            "data:image/jpeg;base64,{}",
            general_purpose::STANDARD.encode(&input.bytes)
        );

        let content = vec![
            InputItem::content_image_with_detail(&data_url, "high"),
            InputItem::content_text(&Self::prompt(input)),
        ];

        let request = Request::builder()
            .model(Model::GPT4o)
            .input_items(vec![InputItem::message("user", content)])
            .max_output_tokens(300)
            .temperature(0.0)
            .build();

        let response = self.client.responses.create(request).await?;
        let extraction = Self::parse_reply(&response.output_text())?;

        let extracted_amount = extraction
            .amount
            .as_deref()
            .and_then(|s| s.replace(',', ".").parse::<Decimal>().ok());

        let amounts_match = extracted_amount
            .map(|a| a.round_dp(2) == input.expected_amount.round_dp(2))
            .unwrap_or(false);

        if extraction.is_valid && !amounts_match {
            // Model asserting validity while the amount disagrees is a
            // contradiction; fall through to OCR instead of trusting it.
            return Err(anyhow!(
                "vision asserted validity but amount {:?} != expected {}",
                extraction.amount,
                input.expected_amount
            ));
        }

        let reason = extraction
            .reason
            .unwrap_or_else(|| "vision model verdict".to_string());

        Ok(Verdict {
            is_valid: Some(extraction.is_valid && amounts_match),
            confidence: extraction.confidence.min(100),
            extracted_amount,
            key_found: extraction.key_found,
            method: AnalysisMethod::Vision,
            reason,
        })
    }
}
