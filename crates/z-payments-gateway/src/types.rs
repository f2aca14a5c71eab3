//! Request and response types of the gateway protocol.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use z_payments_core::{
    to_decimal_string, AchAccountDetails, AchAccountType, GatewayResult, GatewayToken,
    TransactionNumber,
};

use crate::config::MerchantCredentials;
use crate::fields::{self, BrowserOperation, TranType};

/// Field map sent to or received from the gateway.
pub type FieldMap = BTreeMap<String, String>;

fn merchant_fields(credentials: &MerchantCredentials) -> FieldMap {
    let mut map = FieldMap::new();
    map.insert(fields::CUST_NBR.into(), credentials.cust_nbr.clone());
    map.insert(fields::MERCH_NBR.into(), credentials.merch_nbr.clone());
    map.insert(fields::DBA_NBR.into(), credentials.dba_nbr.clone());
    map.insert(fields::TERMINAL_NBR.into(), credentials.terminal_nbr.clone());
    map
}

/// How a direct request is funded.
#[derive(Debug, Clone)]
pub enum Funding {
    /// A gateway token: the parent's financial token for follow-ups, or a
    /// saved method's storage token for new charges.
    Token(GatewayToken),
    /// Raw bank account details (tokenization and unsaved pre-notes).
    BankAccount(AchAccountDetails),
}

/// A server-to-server submission.
#[derive(Debug, Clone)]
pub struct DirectRequest {
    /// Gateway transaction type.
    pub tran_type: TranType,
    /// Transaction number, stable across retries of the same record.
    pub transaction_number: TransactionNumber,
    /// Amount in minor units (zero for pre-notes and tokenization).
    pub amount_minor: i64,
    /// Funding instrument.
    pub funding: Funding,
}

impl DirectRequest {
    /// Unsigned field set for this request.
    #[must_use]
    pub fn to_fields(&self, credentials: &MerchantCredentials) -> FieldMap {
        let mut map = merchant_fields(credentials);
        map.insert(fields::TRAN_TYPE.into(), self.tran_type.code().into());
        map.insert(fields::TRAN_NBR.into(), self.transaction_number.to_string());
        map.insert(fields::AMOUNT.into(), to_decimal_string(self.amount_minor));

        match &self.funding {
            Funding::Token(GatewayToken::Financial(token)) => {
                map.insert(fields::ORIG_AUTH_GUID.into(), token.clone());
            }
            Funding::Token(GatewayToken::Storage(token)) => {
                map.insert(fields::STORAGE_GUID.into(), token.clone());
            }
            Funding::BankAccount(account) => {
                map.insert(fields::ROUTING_NBR.into(), account.routing_number.clone());
                map.insert(fields::ACCOUNT_NBR.into(), account.account_number.clone());
                map.insert(
                    fields::ACCOUNT_TYPE.into(),
                    match account.account_type {
                        AchAccountType::Checking => "C",
                        AchAccountType::Savings => "S",
                    }
                    .into(),
                );
                map.insert(fields::ACCOUNT_HOLDER.into(), account.account_holder.clone());
            }
        }
        map
    }
}

/// Classification of a gateway answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The issuer approved the operation.
    Approved,
    /// The issuer or gateway declined the operation.
    Declined,
    /// The submission was malformed and rejected before reaching the issuer.
    ValidationRejected,
}

/// A classified gateway answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    /// Classification.
    pub outcome: Outcome,
    /// Response or error code.
    pub response_code: String,
    /// Response or error text.
    pub response_message: String,
    /// Financial token of the processed transaction.
    pub financial_token: Option<String>,
    /// Issuer authorization code.
    pub auth_code: Option<String>,
    /// Storage token, for tokenizing requests.
    pub storage_token: Option<String>,
    /// Card brand.
    pub card_brand: Option<String>,
    /// Last four digits of the card or account.
    pub last_four: Option<String>,
    /// Approved amount in minor units.
    pub approved_amount_minor: Option<i64>,
    /// Transaction number echoed by the gateway.
    pub transaction_number: Option<TransactionNumber>,
}

impl GatewayResponse {
    /// Whether the issuer approved the operation.
    #[must_use]
    pub fn is_approved(&self) -> bool {
        self.outcome == Outcome::Approved
    }

    /// Fields to persist onto the transaction record.
    #[must_use]
    pub fn to_result(&self) -> GatewayResult {
        GatewayResult {
            gateway_transaction_id: self.financial_token.clone(),
            response_code: Some(self.response_code.clone()),
            response_message: Some(self.response_message.clone()),
            auth_code: self.auth_code.clone(),
        }
    }
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusResult {
    /// The gateway has no transaction under this number.
    NotFound,
    /// The gateway processed the transaction.
    Found {
        /// Classified outcome of the original submission.
        response: GatewayResponse,
        /// ACH return reason, once the bank has returned the entry.
        return_code: Option<String>,
    },
}

/// Request for a short-lived authorization code.
#[derive(Debug, Clone)]
pub struct KeyExchangeRequest {
    /// Transaction number the code is bound to.
    pub transaction_number: TransactionNumber,
    /// Amount in minor units.
    pub amount_minor: i64,
    /// Operation the browser submission performs.
    pub operation: BrowserOperation,
    /// Merchant page the browser returns to.
    pub return_url: String,
    /// Whether a storage token should be returned.
    pub tokenize: bool,
}

impl KeyExchangeRequest {
    /// Unsigned field set for this request.
    #[must_use]
    pub fn to_fields(&self, credentials: &MerchantCredentials) -> FieldMap {
        let mut map = merchant_fields(credentials);
        map.insert(fields::TRAN_NBR.into(), self.transaction_number.to_string());
        map.insert(fields::AMOUNT.into(), to_decimal_string(self.amount_minor));
        map.insert(fields::TRAN_GROUP.into(), self.operation.group().into());
        map.insert(fields::REDIRECT_URL.into(), self.return_url.clone());
        map.insert(
            fields::TOKENIZE.into(),
            if self.tokenize { "Y" } else { "N" }.into(),
        );
        map
    }
}

/// Hidden-field form the merchant page renders for a browser submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserForm {
    /// Where the browser posts the form.
    pub post_url: String,
    /// Hidden fields, card fields are added by the browser.
    pub fields: FieldMap,
}

impl BrowserForm {
    /// Build the form for an exchanged authorization code.
    #[must_use]
    pub fn new(
        post_url: &str,
        credentials: &MerchantCredentials,
        request: &KeyExchangeRequest,
        authorization_code: &str,
    ) -> Self {
        let mut map = request.to_fields(credentials);
        map.insert(fields::TAC.into(), authorization_code.to_string());
        Self {
            post_url: post_url.to_string(),
            fields: map,
        }
    }
}
