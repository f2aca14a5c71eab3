//! Browser-flow callback fields.
//!
//! After a browser submission the gateway posts the result, form encoded, to
//! the merchant's callback endpoint. The post is signed with the merchant's
//! MAC secret and addressed by transaction number.

use z_payments_core::TransactionNumber;

use crate::config::MerchantCredentials;
use crate::crypto::verify_fields;
use crate::error::GatewayError;
use crate::fields;
use crate::response::classify;
use crate::types::{FieldMap, GatewayResponse};

/// Fields of one gateway callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackFields {
    fields: FieldMap,
}

impl CallbackFields {
    /// Collect callback fields from decoded form pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Raw field value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Check the callback MAC against the merchant secret.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::InvalidSignature` when the MAC is missing or wrong.
    pub fn verify(&self, credentials: &MerchantCredentials) -> Result<(), GatewayError> {
        if verify_fields(&credentials.mac_secret, &self.fields) {
            Ok(())
        } else {
            Err(GatewayError::InvalidSignature)
        }
    }

    /// Transaction number the callback resolves.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::MalformedResponse` if it is missing or invalid.
    pub fn transaction_number(&self) -> Result<TransactionNumber, GatewayError> {
        self.get(fields::TRAN_NBR)
            .ok_or_else(|| GatewayError::MalformedResponse(format!("missing {}", fields::TRAN_NBR)))?
            .parse::<TransactionNumber>()
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))
    }

    /// Classify the result carried by the callback.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::MalformedResponse` if the result cannot be interpreted.
    pub fn classify(&self) -> Result<GatewayResponse, GatewayError> {
        classify(&self.fields)
    }
}
