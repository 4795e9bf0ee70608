//! Confidence scoring over OCR-extracted text, and the approve /
//! reject / manual decision with its dead-band.

use regex::Regex;
use rust_decimal::Decimal;

use crate::helpers::dto::{AnalysisMethod, Decision, Verdict};

pub const AMOUNT_POINTS: u8 = 50;
pub const KEY_POINTS: u8 = 30;
pub const KEYWORD_POINTS: u8 = 20;

pub const DEFAULT_AUTO_APPROVE: u8 = 70;
pub const DEFAULT_AUTO_REJECT: u8 = 40;

/// Payment-confirmation vocabulary, Brazilian receipts first.
const CONFIRMATION_KEYWORDS: &[&str] = &[
    "pago",
    "paga",
    "aprovado",
    "aprovada",
    "concluído",
    "concluido",
    "concluída",
    "concluida",
    "transferido",
    "transferida",
    "efetuado",
    "realizado",
    "comprovante",
    "paid",
    "approved",
    "completed",
    "transferred",
];

/// Pulls every currency-looking token out of the text, handling the
/// Brazilian `1.234,56` shape as well as plain `21.90` / `21,90`.
pub fn extract_amounts(text: &str) -> Vec<Decimal> {
    let re = Regex::new(r"(?:[Rr]\$\s*)?(\d{1,3}(?:\.\d{3})+,\d{2}|\d+,\d{2}|\d+\.\d{2})")
        .expect("amount regex is valid");
    re.captures_iter(text)
        .filter_map(|cap| {
            let raw = cap.get(1)?.as_str();
            let normalized = if raw.contains(',') {
                raw.replace('.', "").replace(',', ".")
            } else {
                raw.to_string()
            };
            normalized.parse::<Decimal>().ok()
        })
        .collect()
}

fn amounts_equal(a: Decimal, b: Decimal) -> bool {
    a.round_dp(2) == b.round_dp(2)
}

/// Additive scoring of extracted text against the expected charge:
/// +50 for a matching amount token, +30 for the key appearing
/// verbatim, +20 for any confirmation keyword. `is_valid` requires
/// the amount and the key, not just the point total.
pub fn score_text(
    text: &str,
    expected_amount: Decimal,
    expected_key: &str,
    method: AnalysisMethod,
    approve_threshold: u8,
) -> Verdict {
    let amounts = extract_amounts(text);
    let matched_amount = amounts
        .iter()
        .copied()
        .find(|a| amounts_equal(*a, expected_amount));

    // The key is matched literally (regex-escaped), case-insensitive.
    let key_found = Regex::new(&format!("(?i){}", regex::escape(expected_key)))
        .map(|re| re.is_match(text))
        .unwrap_or(false);

    let lowered = text.to_lowercase();
    let keyword_found = CONFIRMATION_KEYWORDS.iter().any(|kw| lowered.contains(kw));

    let mut confidence = 0u8;
    let mut parts = Vec::new();
    if matched_amount.is_some() {
        confidence += AMOUNT_POINTS;
        parts.push("amount matched");
    }
    if key_found {
        confidence += KEY_POINTS;
        parts.push("key found");
    }
    if keyword_found {
        confidence += KEYWORD_POINTS;
        parts.push("confirmation keyword");
    }

    let reason = if parts.is_empty() {
        "no expected fields found in extracted text".to_string()
    } else {
        parts.join(", ")
    };

    Verdict {
        is_valid: Some(confidence >= approve_threshold && matched_amount.is_some() && key_found),
        confidence,
        extracted_amount: matched_amount.or_else(|| amounts.first().copied()),
        key_found,
        method,
        reason,
    }
}

/// The 40/70 dead-band: auto-approve only above the high bar with a
/// positive verdict, auto-reject only below the low bar with a
/// negative one, everything between goes to a human.
pub fn decide(verdict: &Verdict, approve_threshold: u8, reject_threshold: u8) -> Decision {
    match verdict.is_valid {
        Some(true) if verdict.confidence >= approve_threshold => Decision::Approve,
        Some(false) if verdict.confidence < reject_threshold => Decision::Reject,
        _ => Decision::Manual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn score(text: &str) -> Verdict {
        score_text(
            text,
            dec("21.90"),
            "teste@pix.com",
            AnalysisMethod::OcrUpload,
            DEFAULT_AUTO_APPROVE,
        )
    }

    #[test]
    fn test_full_receipt_scores_100() {
        let v = score("Comprovante: R$ 21,90 aprovado\nChave: teste@pix.com");
        assert_eq!(v.confidence, 100);
        assert_eq!(v.is_valid, Some(true));
        assert_eq!(v.extracted_amount, Some(dec("21.90")));
        assert!(v.key_found);
    }

    #[test]
    fn test_confidence_is_monotonic() {
        let none = score("nothing useful here");
        let amount = score("valor R$ 21,90");
        let amount_key = score("valor R$ 21,90 para teste@pix.com");
        let all = score("valor R$ 21,90 para teste@pix.com - pago");
        assert!(none.confidence <= amount.confidence);
        assert!(amount.confidence <= amount_key.confidence);
        assert!(amount_key.confidence <= all.confidence);
        assert_eq!(all.confidence, 100);
    }

    #[test]
    fn test_amount_alone_is_not_valid() {
        let v = score("transferido: R$ 21,90");
        assert_eq!(v.confidence, 70);
        // 70 points but no key match, so the verdict is negative
        assert_eq!(v.is_valid, Some(false));
    }

    #[test]
    fn test_dot_decimal_and_thousands_formats() {
        let v = score("paid 21.90 to teste@pix.com");
        assert_eq!(v.is_valid, Some(true));

        let big = score_text(
            "R$ 1.234,56 pago a teste@pix.com",
            dec("1234.56"),
            "teste@pix.com",
            AnalysisMethod::OcrUpload,
            DEFAULT_AUTO_APPROVE,
        );
        assert_eq!(big.confidence, 100);
    }

    #[test]
    fn test_wrong_amount_scores_low() {
        let v = score("R$ 5,00 enviado para outra@chave.com");
        assert_eq!(v.confidence, 0);
        assert_eq!(v.is_valid, Some(false));
        // the stray amount is still surfaced for the admin view
        assert_eq!(v.extracted_amount, Some(dec("5.00")));
    }

    #[test]
    fn test_key_is_matched_literally() {
        // a regex metachar in the key must not blow up or over-match
        let v = score_text(
            "chave: a+b@pix.com",
            dec("21.90"),
            "a+b@pix.com",
            AnalysisMethod::OcrUrl,
            DEFAULT_AUTO_APPROVE,
        );
        assert!(v.key_found);

        let miss = score_text(
            "chave: axb@pix.com",
            dec("21.90"),
            "a+b@pix.com",
            AnalysisMethod::OcrUrl,
            DEFAULT_AUTO_APPROVE,
        );
        assert!(!miss.key_found);
    }

    #[test]
    fn test_dead_band_always_manual() {
        for confidence in 40..70u8 {
            for is_valid in [Some(true), Some(false), None] {
                let v = Verdict {
                    is_valid,
                    confidence,
                    extracted_amount: None,
                    key_found: false,
                    method: AnalysisMethod::OcrUpload,
                    reason: String::new(),
                };
                assert_eq!(
                    decide(&v, DEFAULT_AUTO_APPROVE, DEFAULT_AUTO_REJECT),
                    Decision::Manual,
                    "confidence {} must sit in the dead band",
                    confidence
                );
            }
        }
    }

    #[test]
    fn test_decision_edges() {
        let approve = Verdict {
            is_valid: Some(true),
            confidence: 70,
            extracted_amount: None,
            key_found: true,
            method: AnalysisMethod::OcrUpload,
            reason: String::new(),
        };
        assert_eq!(
            decide(&approve, DEFAULT_AUTO_APPROVE, DEFAULT_AUTO_REJECT),
            Decision::Approve
        );

        let reject = Verdict {
            is_valid: Some(false),
            confidence: 39,
            ..approve.clone()
        };
        assert_eq!(
            decide(&reject, DEFAULT_AUTO_APPROVE, DEFAULT_AUTO_REJECT),
            Decision::Reject
        );

        // a null verdict never auto-resolves regardless of confidence
        let null = Verdict {
            is_valid: None,
            confidence: 0,
            ..approve
        };
        assert_eq!(
            decide(&null, DEFAULT_AUTO_APPROVE, DEFAULT_AUTO_REJECT),
            Decision::Manual
        );
    }
}
