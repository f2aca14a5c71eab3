//! Tagged-field response parsing and classification.
//!
//! The gateway answers with a flat XML document of tagged fields:
//!
//! ```text
//! <RESPONSE><FIELDS>
//!   <FIELD KEY="AUTH_RESP">00</FIELD>
//!   <FIELD KEY="AUTH_GUID">09LMQ4NBTAF1R7JQ9MK</FIELD>
//! </FIELDS></RESPONSE>
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use z_payments_core::{parse_decimal_string, TransactionNumber};

use crate::error::GatewayError;
use crate::fields;
use crate::types::{FieldMap, GatewayResponse, Outcome, StatusResult};

static FIELD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<FIELD\s+KEY\s*=\s*"([A-Za-z0-9_]+)"\s*>([^<]*)</FIELD>|<FIELD\s+KEY\s*=\s*"([A-Za-z0-9_]+)"\s*/>"#)
        .expect("field pattern is valid")
});

/// Response codes that mean the issuer approved the operation.
///
/// `00` is a plain approval, `85` is "no reason to decline" returned for
/// zero-value verifications and tokenization.
pub const APPROVAL_CODES: [&str; 2] = ["00", "85"];

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Extract the tagged fields of a response body.
///
/// # Errors
///
/// Returns `GatewayError::MalformedResponse` when the body holds no fields.
pub fn parse_tagged_fields(body: &str) -> Result<FieldMap, GatewayError> {
    let mut map = FieldMap::new();
    for captures in FIELD_RE.captures_iter(body) {
        if let (Some(key), Some(value)) = (captures.get(1), captures.get(2)) {
            map.insert(key.as_str().to_string(), unescape(value.as_str().trim()));
        } else if let Some(key) = captures.get(3) {
            map.insert(key.as_str().to_string(), String::new());
        }
    }

    if map.is_empty() {
        return Err(GatewayError::MalformedResponse(
            "no tagged fields in response".into(),
        ));
    }
    Ok(map)
}

fn non_empty(map: &FieldMap, name: &str) -> Option<String> {
    map.get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Classify a field set as Approved, Declined or `ValidationRejected`.
///
/// # Errors
///
/// Returns `GatewayError::MalformedResponse` when neither a response code nor
/// an error code is present, or when the amount or transaction number cannot
/// be parsed.
pub fn classify(map: &FieldMap) -> Result<GatewayResponse, GatewayError> {
    let (outcome, response_code, response_message) =
        if let Some(error_code) = non_empty(map, fields::ERROR_CODE) {
            (
                Outcome::ValidationRejected,
                error_code,
                non_empty(map, fields::ERROR_TEXT).unwrap_or_default(),
            )
        } else {
            let code = non_empty(map, fields::AUTH_RESP).ok_or_else(|| {
                GatewayError::MalformedResponse(format!("missing {}", fields::AUTH_RESP))
            })?;
            let outcome = if APPROVAL_CODES.contains(&code.as_str()) {
                Outcome::Approved
            } else {
                Outcome::Declined
            };
            (
                outcome,
                code,
                non_empty(map, fields::AUTH_RESP_TEXT).unwrap_or_default(),
            )
        };

    let approved_amount_minor = non_empty(map, fields::AUTH_AMOUNT)
        .map(|amount| {
            parse_decimal_string(&amount)
                .map_err(|e| GatewayError::MalformedResponse(e.to_string()))
        })
        .transpose()?;

    let transaction_number = non_empty(map, fields::TRAN_NBR)
        .map(|n| {
            n.parse::<TransactionNumber>()
                .map_err(|e| GatewayError::MalformedResponse(e.to_string()))
        })
        .transpose()?;

    Ok(GatewayResponse {
        outcome,
        response_code,
        response_message,
        financial_token: non_empty(map, fields::AUTH_GUID),
        auth_code: non_empty(map, fields::AUTH_CODE),
        storage_token: non_empty(map, fields::STORAGE_TOKEN),
        card_brand: non_empty(map, fields::CARD_BRAND),
        last_four: non_empty(map, fields::LAST_FOUR),
        approved_amount_minor,
        transaction_number,
    })
}

/// Parse and classify a direct-submission response body.
///
/// # Errors
///
/// Returns `GatewayError::MalformedResponse` if the body cannot be interpreted.
pub fn parse_response(body: &str) -> Result<GatewayResponse, GatewayError> {
    classify(&parse_tagged_fields(body)?)
}

/// Parse a status-query response body.
///
/// # Errors
///
/// Returns `GatewayError::MalformedResponse` if the body cannot be interpreted.
pub fn parse_status(body: &str) -> Result<StatusResult, GatewayError> {
    let map = parse_tagged_fields(body)?;
    match non_empty(&map, fields::FOUND).as_deref() {
        Some("N") => Ok(StatusResult::NotFound),
        Some("Y") => Ok(StatusResult::Found {
            response: classify(&map)?,
            return_code: non_empty(&map, fields::RETURN_CODE),
        }),
        other => Err(GatewayError::MalformedResponse(format!(
            "unexpected {} value: {other:?}",
            fields::FOUND
        ))),
    }
}

/// Parse a key-exchange response body into the authorization code.
///
/// # Errors
///
/// - `GatewayError::Rejected` if the gateway refused the exchange.
/// - `GatewayError::MalformedResponse` if no code is present.
pub fn parse_key_exchange(body: &str) -> Result<String, GatewayError> {
    let map = parse_tagged_fields(body)?;
    if let Some(code) = non_empty(&map, fields::ERROR_CODE) {
        return Err(GatewayError::Rejected {
            code,
            message: non_empty(&map, fields::ERROR_TEXT).unwrap_or_default(),
        });
    }
    non_empty(&map, fields::TAC)
        .ok_or_else(|| GatewayError::MalformedResponse(format!("missing {}", fields::TAC)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const APPROVED: &str = r#"<RESPONSE><FIELDS>
        <FIELD KEY="AUTH_RESP">00</FIELD>
        <FIELD KEY="AUTH_RESP_TEXT">APPROVAL</FIELD>
        <FIELD KEY="AUTH_GUID">09LMQ4NBTAF1R7JQ9MK</FIELD>
        <FIELD KEY="AUTH_CODE">057093</FIELD>
        <FIELD KEY="AUTH_AMOUNT">99.99</FIELD>
        <FIELD KEY="TRAN_NBR">42</FIELD>
        <FIELD KEY="CARD_BRAND"/>
    </FIELDS></RESPONSE>"#;

    #[test]
    fn approved_response() {
        let response = parse_response(APPROVED).unwrap();
        assert_eq!(response.outcome, Outcome::Approved);
        assert_eq!(response.financial_token.as_deref(), Some("09LMQ4NBTAF1R7JQ9MK"));
        assert_eq!(response.auth_code.as_deref(), Some("057093"));
        assert_eq!(response.approved_amount_minor, Some(9999));
        assert_eq!(
            response.transaction_number.unwrap().as_str(),
            "0000000042"
        );
        assert!(response.card_brand.is_none());
    }

    #[test]
    fn declined_response() {
        let body = r#"<FIELD KEY="AUTH_RESP">05</FIELD><FIELD KEY="AUTH_RESP_TEXT">DO NOT HONOR</FIELD>"#;
        let response = parse_response(body).unwrap();
        assert_eq!(response.outcome, Outcome::Declined);
        assert_eq!(response.response_code, "05");
        assert_eq!(response.response_message, "DO NOT HONOR");
    }

    #[test]
    fn rejected_submission() {
        let body = r#"<FIELD KEY="ERROR_CODE">E105</FIELD><FIELD KEY="ERROR_TEXT">INVALID AMOUNT &amp; TYPE</FIELD>"#;
        let response = parse_response(body).unwrap();
        assert_eq!(response.outcome, Outcome::ValidationRejected);
        assert_eq!(response.response_message, "INVALID AMOUNT & TYPE");
    }

    #[test]
    fn malformed_bodies() {
        assert!(matches!(
            parse_response("<html>502 Bad Gateway</html>"),
            Err(GatewayError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_response(r#"<FIELD KEY="AUTH_GUID">x</FIELD>"#),
            Err(GatewayError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_response(r#"<FIELD KEY="AUTH_RESP">00</FIELD><FIELD KEY="AUTH_AMOUNT">1.005</FIELD>"#),
            Err(GatewayError::MalformedResponse(_))
        ));
    }

    #[test]
    fn status_results() {
        assert_eq!(
            parse_status(r#"<FIELD KEY="FOUND">N</FIELD>"#).unwrap(),
            StatusResult::NotFound
        );
        let found = parse_status(
            r#"<FIELD KEY="FOUND">Y</FIELD><FIELD KEY="AUTH_RESP">85</FIELD><FIELD KEY="RETURN_CODE">R03</FIELD>"#,
        )
        .unwrap();
        match found {
            StatusResult::Found {
                response,
                return_code,
            } => {
                assert!(response.is_approved());
                assert_eq!(return_code.as_deref(), Some("R03"));
            }
            StatusResult::NotFound => panic!("expected found"),
        }
    }

    #[test]
    fn key_exchange() {
        assert_eq!(
            parse_key_exchange(r#"<FIELD KEY="TAC">abc123</FIELD>"#).unwrap(),
            "abc123"
        );
        assert!(matches!(
            parse_key_exchange(r#"<FIELD KEY="ERROR_CODE">E1</FIELD>"#),
            Err(GatewayError::Rejected { .. })
        ));
    }
}
