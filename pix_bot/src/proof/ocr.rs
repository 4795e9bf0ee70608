//! OCR stages: multipart upload of the raw bytes, and the by-URL
//! fallback against the same text-extraction service.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::debug;
use pix_core::helpers::dto::{AnalysisMethod, ProofKind, Verdict};
use pix_core::score::score_text;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use super::dto::ProofInput;
use super::pipeline::ProofAnalyzer;

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(rename = "ParsedResults", default)]
    parsed_results: Vec<ParsedResult>,
    #[serde(rename = "IsErroredOnProcessing", default)]
    is_errored: bool,
    #[serde(rename = "ErrorMessage", default)]
    error_message: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ParsedResult {
    #[serde(rename = "ParsedText", default)]
    parsed_text: String,
}

impl OcrResponse {
    fn into_text(self) -> Result<String> {
        if self.is_errored {
            return Err(anyhow!(
                "OCR service reported an error: {:?}",
                self.error_message
            ));
        }
        let text: String = self
            .parsed_results
            .into_iter()
            .map(|r| r.parsed_text)
            .collect::<Vec<_>>()
            .join("\n");
        if text.trim().is_empty() {
            return Err(anyhow!("OCR service returned no text"));
        }
        Ok(text)
    }
}

#[derive(Clone)]
pub struct OcrClient {
    client: Client,
    api_url: String,
    api_key: String,
    approve_threshold: u8,
}

impl OcrClient {
    pub fn new(api_url: String, api_key: String, approve_threshold: u8) -> Self {
        Self {
            client: Client::new(),
            api_url,
            api_key,
            approve_threshold,
        }
    }

    fn base_form(&self, kind: ProofKind) -> Form {
        let mut form = Form::new()
            .text("apikey", self.api_key.clone())
            .text("language", "por")
            .text("OCREngine", "2");
        // PDFs go down the specialized extraction path
        if kind == ProofKind::Pdf {
            form = form.text("filetype", "PDF");
        }
        form
    }

    async fn request_text(&self, form: Form) -> Result<String> {
        let response = self
            .client
            .post(&self.api_url)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unreadable body".to_string());
            return Err(anyhow!("OCR service returned {}: {}", status, body));
        }

        let parsed: OcrResponse = response.json().await?;
        parsed.into_text()
    }

    pub async fn extract_from_bytes(&self, input: &ProofInput) -> Result<String> {
        let filename = match input.kind {
            ProofKind::Pdf => "proof.pdf",
            ProofKind::Image => "proof.jpg",
        };
        let part = Part::bytes(input.bytes.clone()).file_name(filename);
        let form = self.base_form(input.kind).part("file", part);
        self.request_text(form).await
    }

    pub async fn extract_from_url(&self, input: &ProofInput) -> Result<String> {
        let url = input
            .public_url
            .as_ref()
            .ok_or_else(|| anyhow!("no public URL available for this proof"))?;
        let form = self.base_form(input.kind).text("url", url.clone());
        self.request_text(form).await
    }
}

/// Primary OCR stage: ship the bytes we already hold.
pub struct OcrUploadAnalyzer {
    pub ocr: OcrClient,
}

#[async_trait]
impl ProofAnalyzer for OcrUploadAnalyzer {
    fn name(&self) -> &'static str {
        "ocr-upload"
    }

    async fn analyze(&self, input: &ProofInput) -> Result<Verdict> {
        let text = self.ocr.extract_from_bytes(input).await?;
        debug!(
            "ocr-upload extracted {} chars for txid {}",
            text.len(),
            input.txid
        );
        Ok(score_text(
            &text,
            input.expected_amount,
            &input.expected_key,
            AnalysisMethod::OcrUpload,
            self.ocr.approve_threshold,
        ))
    }
}

/// Fallback OCR stage: pass the file's public URL instead.
pub struct OcrUrlAnalyzer {
    pub ocr: OcrClient,
}

#[async_trait]
impl ProofAnalyzer for OcrUrlAnalyzer {
    fn name(&self) -> &'static str {
        "ocr-url"
    }

    async fn analyze(&self, input: &ProofInput) -> Result<Verdict> {
        let text = self.ocr.extract_from_url(input).await?;
        debug!(
            "ocr-url extracted {} chars for txid {}",
            text.len(),
            input.txid
        );
        Ok(score_text(
            &text,
            input.expected_amount,
            &input.expected_key,
            AnalysisMethod::OcrUrl,
            self.ocr.approve_threshold,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ocr_response_joins_pages() {
        let raw = r#"{
            "ParsedResults": [
                {"ParsedText": "page one"},
                {"ParsedText": "page two"}
            ],
            "IsErroredOnProcessing": false
        }"#;
        let parsed: OcrResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.into_text().unwrap(), "page one\npage two");
    }

    #[test]
    fn test_ocr_response_error_flag() {
        let raw = r#"{
            "ParsedResults": [],
            "IsErroredOnProcessing": true,
            "ErrorMessage": ["file too large"]
        }"#;
        let parsed: OcrResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.into_text().is_err());
    }

    #[test]
    fn test_empty_text_is_an_error_not_a_verdict() {
        let raw = r#"{"ParsedResults": [{"ParsedText": "  "}], "IsErroredOnProcessing": false}"#;
        let parsed: OcrResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.into_text().is_err());
    }
}
