//! BR Code ("Copia e Cola") payload builder and parser.
//!
//! The payload is a flat sequence of `id(2) len(2) value` fields in a
//! fixed order, with nested sub-fields inside the merchant-account
//! template (26) and the additional-data template (62), terminated by
//! a CRC16 trailer. Field ids and ordering follow the BCB PIX manual.

use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;

use crate::error::{CoreError, CoreResult};
use crate::helpers::dto::Charge;
use crate::pix::crc::{crc16_ccitt, verify_trailer};

const ID_PAYLOAD_FORMAT: &str = "00";
const ID_POINT_OF_INITIATION: &str = "01";
const ID_MERCHANT_ACCOUNT: &str = "26";
const ID_MERCHANT_CATEGORY: &str = "52";
const ID_CURRENCY: &str = "53";
const ID_AMOUNT: &str = "54";
const ID_COUNTRY: &str = "58";
const ID_MERCHANT_NAME: &str = "59";
const ID_MERCHANT_CITY: &str = "60";
const ID_ADDITIONAL_DATA: &str = "62";
const ID_CRC: &str = "63";

const SUB_ID_GUI: &str = "00";
const SUB_ID_KEY: &str = "01";
const SUB_ID_TXID: &str = "05";

const PIX_GUI: &str = "br.gov.bcb.pix";
const CURRENCY_BRL: &str = "986";

/// Charges are one-shot, so the point-of-initiation method is 12.
const INITIATION_ONE_TIME: &str = "12";

pub const TXID_PREFIX: &str = "M";
pub const MAX_TXID_LEN: usize = 25;

const MAX_MERCHANT_NAME_LEN: usize = 25;
const MAX_MERCHANT_CITY_LEN: usize = 15;
/// Room left for the key inside template 26 once the GUI sub-field
/// (4 + 14 bytes) and the key header (4 bytes) are accounted for.
const MAX_KEY_LEN: usize = 77;

/// Generates a fresh txid: fixed prefix, the last 8 digits of the
/// epoch-millis clock, and 4 random uppercase alphanumerics. Always
/// ASCII and well under the 25-char protocol ceiling.
pub fn generate_txid() -> String {
    let millis = Utc::now().timestamp_millis().to_string();
    let tail_start = millis.len().saturating_sub(8);
    let mut rng = rand::thread_rng();
    let salt: String = (0..4)
        .map(|_| {
            const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
            CHARSET[rng.gen_range(0..CHARSET.len())] as char
        })
        .collect();
    format!("{}{}{}", TXID_PREFIX, &millis[tail_start..], salt)
}

/// The PIX manual forbids delimiter characters inside the txid, so we
/// keep strictly alphanumeric ASCII.
pub fn sanitize_txid(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(MAX_TXID_LEN)
        .collect()
}

fn sanitize_ascii(raw: &str, max_len: usize) -> String {
    raw.chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control())
        .take(max_len)
        .collect()
}

/// Validates and normalizes a charge amount to exactly two decimal
/// places. The stored amount and the encoded amount must be the same
/// value, so every caller goes through this before persisting.
pub fn normalize_amount(amount: Decimal) -> CoreResult<Decimal> {
    if amount.is_sign_negative() {
        return Err(CoreError::Validation(format!(
            "charge amount must not be negative, got {}",
            amount
        )));
    }
    let mut rounded = amount.round_dp(2);
    rounded.rescale(2);
    Ok(rounded)
}

fn tlv(id: &str, value: &str) -> String {
    debug_assert!(value.len() <= 99);
    format!("{}{:02}{}", id, value.len(), value)
}

/// Builds the full copy-paste payload for one charge.
///
/// A missing merchant key is a fatal configuration error: once a QR is
/// shown to a payer it cannot be recalled, so this fails loudly rather
/// than emitting a code that routes nowhere.
pub fn create_charge(
    pix_key: &str,
    merchant_name: &str,
    merchant_city: &str,
    amount: Decimal,
    txid: Option<String>,
) -> CoreResult<Charge> {
    let key = sanitize_ascii(pix_key.trim(), MAX_KEY_LEN);
    if key.is_empty() {
        return Err(CoreError::Configuration(
            "PIX merchant key is missing or empty; refusing to emit an unpayable charge".into(),
        ));
    }

    let txid = match txid {
        Some(raw) => {
            let clean = sanitize_txid(&raw);
            if clean.is_empty() {
                return Err(CoreError::Validation(format!(
                    "txid {:?} has no valid characters",
                    raw
                )));
            }
            clean
        }
        None => generate_txid(),
    };

    let amount = normalize_amount(amount)?;

    let name = sanitize_ascii(merchant_name.trim(), MAX_MERCHANT_NAME_LEN);
    let city = sanitize_ascii(merchant_city.trim(), MAX_MERCHANT_CITY_LEN);

    let merchant_account = format!("{}{}", tlv(SUB_ID_GUI, PIX_GUI), tlv(SUB_ID_KEY, &key));
    let additional_data = tlv(SUB_ID_TXID, &txid);

    let mut payload = String::new();
    payload.push_str(&tlv(ID_PAYLOAD_FORMAT, "01"));
    payload.push_str(&tlv(ID_POINT_OF_INITIATION, INITIATION_ONE_TIME));
    payload.push_str(&tlv(ID_MERCHANT_ACCOUNT, &merchant_account));
    payload.push_str(&tlv(ID_MERCHANT_CATEGORY, "0000"));
    payload.push_str(&tlv(ID_CURRENCY, CURRENCY_BRL));
    if !amount.is_zero() {
        payload.push_str(&tlv(ID_AMOUNT, &amount.to_string()));
    }
    payload.push_str(&tlv(ID_COUNTRY, "BR"));
    if !name.is_empty() {
        payload.push_str(&tlv(ID_MERCHANT_NAME, &name));
    }
    if !city.is_empty() {
        payload.push_str(&tlv(ID_MERCHANT_CITY, &city));
    }
    payload.push_str(&tlv(ID_ADDITIONAL_DATA, &additional_data));

    // CRC is computed over everything up to and including its own
    // "6304" header, then appended as 4 uppercase hex digits.
    payload.push_str(ID_CRC);
    payload.push_str("04");
    let crc = crc16_ccitt(payload.as_bytes());
    payload.push_str(&format!("{:04X}", crc));

    Ok(Charge {
        txid,
        pix_key: key,
        amount,
        payload,
    })
}

/// Fields recovered from an encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCharge {
    pub pix_key: Option<String>,
    pub txid: Option<String>,
    pub amount: Option<Decimal>,
    pub merchant_name: Option<String>,
    pub merchant_city: Option<String>,
}

fn split_tlv(data: &str) -> CoreResult<Vec<(String, String)>> {
    // byte offsets below double as char offsets, so only ASCII input
    // may pass this point
    if !data.is_ascii() {
        return Err(CoreError::Validation(
            "payload contains non-ASCII characters".into(),
        ));
    }
    let bytes = data.as_bytes();
    let mut fields = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        if pos + 4 > bytes.len() {
            return Err(CoreError::Validation("truncated TLV header".into()));
        }
        let id = &data[pos..pos + 2];
        let len: usize = data[pos + 2..pos + 4]
            .parse()
            .map_err(|_| CoreError::Validation(format!("bad TLV length at offset {}", pos)))?;
        let value_end = pos + 4 + len;
        if value_end > bytes.len() {
            return Err(CoreError::Validation(format!(
                "TLV field {} overruns the payload",
                id
            )));
        }
        fields.push((id.to_string(), data[pos + 4..value_end].to_string()));
        pos = value_end;
    }
    Ok(fields)
}

fn sub_field(template: &str, wanted: &str) -> Option<String> {
    split_tlv(template)
        .ok()?
        .into_iter()
        .find(|(id, _)| id == wanted)
        .map(|(_, v)| v)
}

/// Parses a payload back into its fields, verifying the CRC trailer
/// first.
pub fn parse_payload(payload: &str) -> CoreResult<DecodedCharge> {
    if !verify_trailer(payload) {
        return Err(CoreError::Validation(
            "payload CRC trailer does not match".into(),
        ));
    }

    let mut decoded = DecodedCharge {
        pix_key: None,
        txid: None,
        amount: None,
        merchant_name: None,
        merchant_city: None,
    };

    for (id, value) in split_tlv(payload)? {
        match id.as_str() {
            x if x == ID_MERCHANT_ACCOUNT => {
                decoded.pix_key = sub_field(&value, SUB_ID_KEY);
            }
            x if x == ID_ADDITIONAL_DATA => {
                decoded.txid = sub_field(&value, SUB_ID_TXID);
            }
            x if x == ID_AMOUNT => {
                decoded.amount = value.parse::<Decimal>().ok();
            }
            x if x == ID_MERCHANT_NAME => {
                decoded.merchant_name = Some(value);
            }
            x if x == ID_MERCHANT_CITY => {
                decoded.merchant_city = Some(value);
            }
            _ => {}
        }
    }

    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let charge = create_charge(
            "teste@pix.com",
            "Loja Teste",
            "SAO PAULO",
            dec("21.90"),
            Some("M12345678ABCD".to_string()),
        )
        .unwrap();

        assert_eq!(charge.txid, "M12345678ABCD");
        assert!(verify_trailer(&charge.payload));

        let decoded = parse_payload(&charge.payload).unwrap();
        assert_eq!(decoded.pix_key.as_deref(), Some("teste@pix.com"));
        assert_eq!(decoded.txid.as_deref(), Some("M12345678ABCD"));
        assert_eq!(decoded.amount, Some(dec("21.90")));
        assert_eq!(decoded.merchant_name.as_deref(), Some("Loja Teste"));
    }

    #[test]
    fn test_missing_key_is_fatal() {
        let err = create_charge("", "Loja", "SP", dec("10.00"), None).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));

        let err = create_charge("   ", "Loja", "SP", dec("10.00"), None).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn test_negative_amount_rejected() {
        let err = create_charge("k@x.com", "Loja", "SP", dec("-1.00"), None).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn test_amount_rounded_to_two_places_before_encoding() {
        let charge = create_charge("k@x.com", "Loja", "SP", dec("21.899"), None).unwrap();
        // stored and encoded amounts must agree after rounding
        assert_eq!(charge.amount, dec("21.90"));
        let decoded = parse_payload(&charge.payload).unwrap();
        assert_eq!(decoded.amount, Some(charge.amount));
    }

    #[test]
    fn test_zero_amount_omits_field_54() {
        let charge = create_charge(
            "k@x.com",
            "Loja",
            "SP",
            dec("0.00"),
            Some("TXFIXED01".to_string()),
        )
        .unwrap();
        let fields = split_tlv(&charge.payload).unwrap();
        assert!(fields.iter().all(|(id, _)| id != ID_AMOUNT));
        let decoded = parse_payload(&charge.payload).unwrap();
        assert_eq!(decoded.amount, None);
    }

    #[test]
    fn test_generated_txid_shape() {
        let txid = generate_txid();
        assert!(txid.starts_with(TXID_PREFIX));
        assert_eq!(txid.len(), TXID_PREFIX.len() + 8 + 4);
        assert!(txid.len() <= MAX_TXID_LEN);
        assert!(txid.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_txid_sanitization_strips_delimiters() {
        let charge = create_charge(
            "k@x.com",
            "Loja",
            "SP",
            dec("5.00"),
            Some("TX*123-456|".to_string()),
        )
        .unwrap();
        assert_eq!(charge.txid, "TX123456");
    }

    #[test]
    fn test_tampered_payload_rejected_by_parser() {
        let charge = create_charge("k@x.com", "Loja", "SP", dec("5.00"), None).unwrap();
        let mut tampered = charge.payload.clone();
        tampered.replace_range(10..11, "X");
        assert!(parse_payload(&tampered).is_err());
    }

    #[test]
    fn test_non_ascii_payload_rejected_not_panicking() {
        // scanned codes sometimes arrive mangled by the OCR layer;
        // multi-byte chars must produce a clean error either way
        assert!(parse_payload("00020126çç0014br.gov.bcb.pix6304AAAA").is_err());
        assert!(split_tlv("0002ção1").is_err());
    }

    #[test]
    fn test_merchant_fields_truncated() {
        let charge = create_charge(
            "k@x.com",
            "A merchant name that is way past the ceiling",
            "A very long city name here",
            dec("5.00"),
            None,
        )
        .unwrap();
        let decoded = parse_payload(&charge.payload).unwrap();
        assert_eq!(decoded.merchant_name.unwrap().len(), 25);
        assert_eq!(decoded.merchant_city.unwrap().len(), 15);
    }
}
