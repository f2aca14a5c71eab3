//! Monetary amounts.
//!
//! Amounts are carried as `i64` minor units (cents) end to end. The gateway
//! speaks decimal strings (`"99.99"`); conversion goes through `rust_decimal`
//! so it is exact and never touches binary floating point.

use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Smallest chargeable amount in minor units.
pub const MIN_AMOUNT_MINOR: i64 = 1;

/// Largest chargeable amount in minor units ($999,999.99).
pub const MAX_AMOUNT_MINOR: i64 = 99_999_999;

/// Errors produced while validating or converting amounts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyError {
    /// Amount outside of `MIN_AMOUNT_MINOR..=MAX_AMOUNT_MINOR`.
    #[error("amount {0} is out of range")]
    OutOfRange(i64),

    /// The decimal string could not be parsed.
    #[error("invalid decimal amount: {0}")]
    InvalidDecimal(String),

    /// The decimal string has sub-cent precision.
    #[error("amount has more than two fractional digits: {0}")]
    TooPrecise(String),

    /// Invalid ISO 4217 currency code.
    #[error("invalid currency code: {0}")]
    InvalidCurrency(String),
}

/// Validate that a charge amount is within gateway limits.
///
/// # Errors
///
/// Returns `MoneyError::OutOfRange` for amounts below one cent or above the
/// gateway maximum.
pub fn validate_amount(amount_minor: i64) -> Result<(), MoneyError> {
    if (MIN_AMOUNT_MINOR..=MAX_AMOUNT_MINOR).contains(&amount_minor) {
        Ok(())
    } else {
        Err(MoneyError::OutOfRange(amount_minor))
    }
}

/// Render minor units as the gateway's two-decimal string.
#[must_use]
pub fn to_decimal_string(amount_minor: i64) -> String {
    Decimal::new(amount_minor, 2).to_string()
}

/// Parse the gateway's decimal string into minor units.
///
/// Trailing zeros beyond the second fractional digit are accepted
/// (`"10.500"`), any other sub-cent precision is rejected.
///
/// # Errors
///
/// Returns an error for unparseable, negative, over-precise or overflowing input.
pub fn parse_decimal_string(input: &str) -> Result<i64, MoneyError> {
    let trimmed = input.trim();
    let value = Decimal::from_str_exact(trimmed)
        .map_err(|_| MoneyError::InvalidDecimal(trimmed.to_string()))?
        .normalize();

    if value.is_sign_negative() && !value.is_zero() {
        return Err(MoneyError::InvalidDecimal(trimmed.to_string()));
    }
    if value.scale() > 2 {
        return Err(MoneyError::TooPrecise(trimmed.to_string()));
    }

    value
        .checked_mul(Decimal::ONE_HUNDRED)
        .and_then(|cents| cents.to_i64())
        .ok_or_else(|| MoneyError::InvalidDecimal(trimmed.to_string()))
}

/// An ISO 4217 alphabetic currency code.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    /// US dollars, the gateway's settlement currency.
    #[must_use]
    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    /// Return the code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Currency {
    fn default() -> Self {
        Self::usd()
    }
}

impl FromStr for Currency {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_uppercase();
        if code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()) {
            Ok(Self(code))
        } else {
            Err(MoneyError::InvalidCurrency(s.to_string()))
        }
    }
}

impl TryFrom<String> for Currency {
    type Error = MoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl fmt::Debug for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Currency({})", self.0)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn renders_two_decimals() {
        assert_eq!(to_decimal_string(9999), "99.99");
        assert_eq!(to_decimal_string(100), "1.00");
        assert_eq!(to_decimal_string(5), "0.05");
        assert_eq!(to_decimal_string(99_999_999), "999999.99");
    }

    #[test]
    fn parses_gateway_strings() {
        assert_eq!(parse_decimal_string("99.99").unwrap(), 9999);
        assert_eq!(parse_decimal_string("1").unwrap(), 100);
        assert_eq!(parse_decimal_string("0.1").unwrap(), 10);
        assert_eq!(parse_decimal_string(" 10.500 ").unwrap(), 1050);
    }

    #[test]
    fn rejects_sub_cent_and_negative() {
        assert!(matches!(
            parse_decimal_string("0.001"),
            Err(MoneyError::TooPrecise(_))
        ));
        assert!(parse_decimal_string("-1.00").is_err());
        assert!(parse_decimal_string("abc").is_err());
        assert!(parse_decimal_string("1e3").is_err());
    }

    #[test]
    fn amount_bounds() {
        assert!(validate_amount(0).is_err());
        assert!(validate_amount(1).is_ok());
        assert!(validate_amount(MAX_AMOUNT_MINOR).is_ok());
        assert!(validate_amount(MAX_AMOUNT_MINOR + 1).is_err());
    }

    #[test]
    fn currency_codes() {
        assert_eq!("usd".parse::<Currency>().unwrap().as_str(), "USD");
        assert!("US".parse::<Currency>().is_err());
        assert!("U$D".parse::<Currency>().is_err());
    }

    proptest! {
        #[test]
        fn decimal_string_roundtrip(cents in MIN_AMOUNT_MINOR..=MAX_AMOUNT_MINOR) {
            let rendered = to_decimal_string(cents);
            prop_assert_eq!(parse_decimal_string(&rendered).unwrap(), cents);
        }
    }
}
