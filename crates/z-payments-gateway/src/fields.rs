//! Gateway field names and transaction type codes.

use serde::{Deserialize, Serialize};
use z_payments_core::{PaymentMethodType, TransactionType};

use crate::error::GatewayError;

// ============================================================================
// Merchant identification
// ============================================================================

/// Customer (processor account) number.
pub const CUST_NBR: &str = "CUST_NBR";
/// Merchant number.
pub const MERCH_NBR: &str = "MERCH_NBR";
/// Doing-business-as number.
pub const DBA_NBR: &str = "DBA_NBR";
/// Terminal number.
pub const TERMINAL_NBR: &str = "TERMINAL_NBR";

// ============================================================================
// Request fields
// ============================================================================

/// Transaction type code, see [`TranType`].
pub const TRAN_TYPE: &str = "TRAN_TYPE";
/// Merchant-side transaction number.
pub const TRAN_NBR: &str = "TRAN_NBR";
/// Decimal amount (`"99.99"`).
pub const AMOUNT: &str = "AMOUNT";
/// Financial token of the transaction a follow-up acts on.
pub const ORIG_AUTH_GUID: &str = "ORIG_AUTH_GUID";
/// Storage token of a saved payment method.
pub const STORAGE_GUID: &str = "STORAGE_GUID";
/// Bank account number.
pub const ACCOUNT_NBR: &str = "ACCOUNT_NBR";
/// Bank routing number.
pub const ROUTING_NBR: &str = "ROUTING_NBR";
/// Bank account type (`C` checking, `S` savings).
pub const ACCOUNT_TYPE: &str = "ACCOUNT_TYPE";
/// Name on the bank account.
pub const ACCOUNT_HOLDER: &str = "ACCOUNT_HOLDER";
/// Browser-flow group (`AUTH`, `SALE`).
pub const TRAN_GROUP: &str = "TRAN_GROUP";
/// Where the gateway sends the browser after a browser submission.
pub const REDIRECT_URL: &str = "REDIRECT_URL";
/// `Y` when the browser submission should also return a storage token.
pub const TOKENIZE: &str = "TOKENIZE";
/// Short-lived authorization code for a browser submission.
pub const TAC: &str = "TAC";
/// Keyed signature over the other fields.
pub const MAC: &str = "MAC";

// ============================================================================
// Response and callback fields
// ============================================================================

/// Two-character response code.
pub const AUTH_RESP: &str = "AUTH_RESP";
/// Response text.
pub const AUTH_RESP_TEXT: &str = "AUTH_RESP_TEXT";
/// Financial token of the processed transaction.
pub const AUTH_GUID: &str = "AUTH_GUID";
/// Issuer authorization code.
pub const AUTH_CODE: &str = "AUTH_CODE";
/// Approved amount.
pub const AUTH_AMOUNT: &str = "AUTH_AMOUNT";
/// Storage token, present only for tokenizing requests.
pub const STORAGE_TOKEN: &str = "STORAGE_TOKEN";
/// Card brand reported by the gateway.
pub const CARD_BRAND: &str = "CARD_BRAND";
/// Last four digits of the card or account.
pub const LAST_FOUR: &str = "LAST_FOUR";
/// Submission error code, set when a request is rejected before the issuer.
pub const ERROR_CODE: &str = "ERROR_CODE";
/// Submission error text.
pub const ERROR_TEXT: &str = "ERROR_TEXT";
/// Status query: whether the gateway knows the transaction number (`Y`/`N`).
pub const FOUND: &str = "FOUND";
/// Status query: ACH return reason code, set once the bank returned the entry.
pub const RETURN_CODE: &str = "RETURN_CODE";

/// Gateway transaction type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TranType {
    /// Card authorization.
    CardAuth,
    /// Card sale.
    CardSale,
    /// Capture of a card authorization.
    CardCapture,
    /// Card refund.
    CardRefund,
    /// Card void.
    CardVoid,
    /// ACH debit.
    AchDebit,
    /// ACH credit.
    AchCredit,
    /// ACH void.
    AchVoid,
    /// ACH pre-note (zero-value debit).
    AchPrenote,
    /// Tokenize a bank account.
    AchStorage,
}

impl TranType {
    /// Wire code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::CardAuth => "CCE1",
            Self::CardSale => "CCE2",
            Self::CardCapture => "CCE4",
            Self::CardRefund => "CCE9",
            Self::CardVoid => "CCEX",
            Self::AchDebit => "CKC2",
            Self::AchCredit => "CKC3",
            Self::AchVoid => "CKCX",
            Self::AchPrenote => "CKC0",
            Self::AchStorage => "CKC8",
        }
    }

    /// Code for an operation over a funding family.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Unsupported` for combinations the gateway does
    /// not offer (ACH authorizations and captures, card pre-notes).
    pub fn for_operation(
        transaction_type: TransactionType,
        method_type: PaymentMethodType,
    ) -> Result<Self, GatewayError> {
        use PaymentMethodType::{Ach, CreditCard};
        use TransactionType::{Authorization, Capture, Refund, Sale, Verification, Void};

        match (transaction_type, method_type) {
            (Authorization, CreditCard) => Ok(Self::CardAuth),
            (Sale, CreditCard) => Ok(Self::CardSale),
            (Capture, CreditCard) => Ok(Self::CardCapture),
            (Refund, CreditCard) => Ok(Self::CardRefund),
            (Void, CreditCard) => Ok(Self::CardVoid),
            (Sale, Ach) => Ok(Self::AchDebit),
            (Refund, Ach) => Ok(Self::AchCredit),
            (Void, Ach) => Ok(Self::AchVoid),
            (Verification, Ach) => Ok(Self::AchPrenote),
            (Authorization | Capture, Ach) | (Verification, CreditCard) => {
                Err(GatewayError::Unsupported(format!(
                    "{transaction_type:?} over {method_type:?}"
                )))
            }
        }
    }
}

/// What a browser submission does once the card data reaches the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserOperation {
    /// Authorize only.
    Authorization,
    /// Authorize and capture.
    Sale,
}

impl BrowserOperation {
    /// `TRAN_GROUP` value.
    #[must_use]
    pub const fn group(self) -> &'static str {
        match self {
            Self::Authorization => "AUTH",
            Self::Sale => "SALE",
        }
    }

    /// The transaction type recorded for this browser operation.
    #[must_use]
    pub const fn transaction_type(self) -> TransactionType {
        match self {
            Self::Authorization => TransactionType::Authorization,
            Self::Sale => TransactionType::Sale,
        }
    }
}
