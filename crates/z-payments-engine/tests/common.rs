//! Common test utilities for engine integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use z_payments_core::{
    AchAccountDetails, AchAccountType, CustomerId, GatewayToken, IdempotencyKey, MerchantId,
    Metadata, PaymentMethod, PaymentMethodId, PaymentMethodRef, PaymentMethodType,
    TransactionNumber,
};
use z_payments_engine::{
    AllowAll, Caller, ChargeRequest, EngineConfig, PaymentEngine, StaticCredentials,
};
use z_payments_gateway::crypto::sign_fields;
use z_payments_gateway::{
    fields, CallbackFields, DirectRequest, FieldMap, Gateway, GatewayError, GatewayResponse,
    KeyExchangeRequest, MerchantCredentials, Outcome, StatusResult, TranType,
};
use z_payments_store::MemoryStore;

/// What the fake gateway does with the next direct submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Process and approve.
    Approve,
    /// Process and decline with response code `05`.
    Decline,
    /// Time out without processing.
    Timeout,
    /// Process and approve, then time out before answering.
    TimeoutAfterProcessing,
    /// Refuse the connection.
    Unreachable,
}

/// A submission the fake gateway received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub tran_type: TranType,
    pub transaction_number: TransactionNumber,
    pub amount_minor: i64,
}

#[derive(Default)]
struct FakeState {
    script: VecDeque<Reply>,
    submissions: Vec<Submission>,
    processed: HashMap<TransactionNumber, GatewayResponse>,
    returns: HashMap<TransactionNumber, String>,
    status_unreachable: bool,
    reject_key_exchange: bool,
}

/// Scriptable in-process gateway.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeState>,
    delay: Duration,
}

pub fn approved(number: &TransactionNumber, amount_minor: i64) -> GatewayResponse {
    GatewayResponse {
        outcome: Outcome::Approved,
        response_code: "00".into(),
        response_message: "APPROVAL".into(),
        financial_token: Some(format!("fin-{number}")),
        auth_code: Some("A1B2C3".into()),
        storage_token: None,
        card_brand: None,
        last_four: None,
        approved_amount_minor: Some(amount_minor),
        transaction_number: Some(number.clone()),
    }
}

pub fn declined(number: &TransactionNumber) -> GatewayResponse {
    GatewayResponse {
        outcome: Outcome::Declined,
        response_code: "05".into(),
        response_message: "DO NOT HONOR".into(),
        financial_token: Some(format!("fin-{number}")),
        auth_code: None,
        storage_token: None,
        card_brand: None,
        last_four: None,
        approved_amount_minor: None,
        transaction_number: Some(number.clone()),
    }
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// A gateway that takes `delay` to answer each submission.
    pub fn slow(delay: Duration) -> Self {
        Self {
            state: Mutex::default(),
            delay,
        }
    }

    /// Queue replies for the next submissions; afterwards every submission
    /// is approved.
    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.state.lock().unwrap().script.extend(replies);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submissions.clone()
    }

    /// Submissions of one gateway transaction type.
    pub fn submissions_of(&self, tran_type: TranType) -> Vec<Submission> {
        self.submissions()
            .into_iter()
            .filter(|s| s.tran_type == tran_type)
            .collect()
    }

    /// Make the gateway know `number` as processed with `response`.
    pub fn mark_processed(&self, number: &TransactionNumber, response: GatewayResponse) {
        self.state
            .lock()
            .unwrap()
            .processed
            .insert(number.clone(), response);
    }

    /// Have the bank return a processed pre-note.
    pub fn return_entry(&self, number: &TransactionNumber, code: &str) {
        self.state
            .lock()
            .unwrap()
            .returns
            .insert(number.clone(), code.to_string());
    }

    pub fn set_status_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().status_unreachable = unreachable;
    }

    pub fn set_reject_key_exchange(&self, reject: bool) {
        self.state.lock().unwrap().reject_key_exchange = reject;
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn submit(
        &self,
        _credentials: &MerchantCredentials,
        request: &DirectRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.submissions.push(Submission {
            tran_type: request.tran_type,
            transaction_number: request.transaction_number.clone(),
            amount_minor: request.amount_minor,
        });

        let number = &request.transaction_number;
        let mut approval = approved(number, request.amount_minor);
        if request.tran_type == TranType::AchStorage {
            approval.storage_token = Some(format!("stor-{number}"));
            approval.last_four = Some("6789".into());
        }

        match state.script.pop_front().unwrap_or(Reply::Approve) {
            Reply::Approve => {
                state.processed.insert(number.clone(), approval.clone());
                Ok(approval)
            }
            Reply::Decline => {
                let response = declined(number);
                state.processed.insert(number.clone(), response.clone());
                Ok(response)
            }
            Reply::TimeoutAfterProcessing => {
                state.processed.insert(number.clone(), approval);
                Err(GatewayError::Timeout)
            }
            Reply::Timeout => Err(GatewayError::Timeout),
            Reply::Unreachable => Err(GatewayError::Unreachable("connection refused".into())),
        }
    }

    async fn exchange_key(
        &self,
        _credentials: &MerchantCredentials,
        request: &KeyExchangeRequest,
    ) -> Result<String, GatewayError> {
        if self.state.lock().unwrap().reject_key_exchange {
            return Err(GatewayError::Rejected {
                code: "E12".into(),
                message: "invalid merchant".into(),
            });
        }
        Ok(format!("tac-{}", request.transaction_number))
    }

    async fn query_status(
        &self,
        _credentials: &MerchantCredentials,
        transaction_number: &TransactionNumber,
    ) -> Result<StatusResult, GatewayError> {
        let state = self.state.lock().unwrap();
        if state.status_unreachable {
            return Err(GatewayError::Unreachable("connection refused".into()));
        }
        Ok(match state.processed.get(transaction_number) {
            Some(response) => StatusResult::Found {
                response: response.clone(),
                return_code: state.returns.get(transaction_number).cloned(),
            },
            None => StatusResult::NotFound,
        })
    }

    fn browser_post_url(&self) -> &str {
        "https://gateway.test/browserpost"
    }
}

// ============================================================================
// Harness
// ============================================================================

pub const MAC_SECRET: &str = "test-mac-secret";

pub fn credentials() -> MerchantCredentials {
    MerchantCredentials {
        cust_nbr: "9001".into(),
        merch_nbr: "900300".into(),
        dba_nbr: "2".into(),
        terminal_nbr: "77".into(),
        mac_secret: MAC_SECRET.into(),
    }
}

/// Engine configuration with short in-flight waits.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        in_flight_wait: Duration::from_millis(500),
        in_flight_poll: Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

/// Engine wired to an in-memory store and a fake gateway.
pub struct Harness {
    pub engine: PaymentEngine,
    pub gateway: Arc<FakeGateway>,
    pub store: Arc<MemoryStore>,
    pub merchant_id: MerchantId,
    pub caller: Caller,
    pub customer_id: CustomerId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(FakeGateway::new(), test_config())
    }

    pub fn with(gateway: FakeGateway, config: EngineConfig) -> Self {
        let merchant_id = MerchantId::generate();
        let gateway = Arc::new(gateway);
        let store = Arc::new(MemoryStore::new());
        let credentials = StaticCredentials::new().with(merchant_id, credentials());

        let engine = PaymentEngine::new(
            store.clone(),
            gateway.clone(),
            Arc::new(credentials),
            Arc::new(AllowAll),
            config,
        );

        Self {
            engine,
            gateway,
            store,
            merchant_id,
            caller: Caller::new("merchant-app", merchant_id),
            customer_id: CustomerId::generate(),
        }
    }

    /// A caller from another merchant.
    pub fn stranger(&self) -> Caller {
        Caller::new("other-app", MerchantId::generate())
    }

    /// Save a card for the test customer directly in the store.
    pub fn saved_card(&self) -> PaymentMethod {
        self.saved_method(PaymentMethodType::CreditCard, true)
    }

    /// Save a bank account for the test customer directly in the store.
    pub fn saved_bank_account(&self, verified: bool) -> PaymentMethod {
        self.saved_method(PaymentMethodType::Ach, verified)
    }

    fn saved_method(&self, method_type: PaymentMethodType, verified: bool) -> PaymentMethod {
        use z_payments_store::Store;

        let now = Utc::now();
        let method = PaymentMethod {
            id: PaymentMethodId::generate(),
            merchant_id: self.merchant_id,
            customer_id: self.customer_id,
            method_type,
            storage_token: format!("stor-{}", PaymentMethodId::generate()),
            last_four: "4242".into(),
            card_brand: None,
            ach_account_type: (method_type == PaymentMethodType::Ach)
                .then_some(AchAccountType::Checking),
            is_active: true,
            is_verified: verified,
            created_at: now,
            updated_at: now,
        };
        self.store.put_payment_method(&method).unwrap();
        method
    }

    /// A signed callback for `number` carrying `pairs`.
    pub fn callback(&self, number: &TransactionNumber, pairs: &[(&str, &str)]) -> CallbackFields {
        let mut map: FieldMap = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        map.insert(fields::TRAN_NBR.into(), number.to_string());
        let mac = sign_fields(MAC_SECRET, &map);
        map.insert(fields::MAC.into(), mac);
        CallbackFields::from_pairs(map)
    }
}

pub fn key(value: &str) -> IdempotencyKey {
    IdempotencyKey::new(value).unwrap()
}

/// A card charge funded by a one-time token.
pub fn card_charge(amount_minor: i64) -> ChargeRequest {
    ChargeRequest {
        customer_id: None,
        amount_minor,
        currency: z_payments_core::Currency::usd(),
        payment_method: PaymentMethodRef::one_time(GatewayToken::Storage("tok_visa".into())),
        metadata: Metadata::new(),
    }
}

/// A charge against a saved method.
pub fn saved_charge(method: &PaymentMethod, amount_minor: i64) -> ChargeRequest {
    ChargeRequest {
        customer_id: Some(method.customer_id),
        amount_minor,
        currency: z_payments_core::Currency::usd(),
        payment_method: PaymentMethodRef::saved(method.id),
        metadata: Metadata::new(),
    }
}

pub fn bank_account() -> AchAccountDetails {
    AchAccountDetails {
        routing_number: "021000021".into(),
        account_number: "123456789".into(),
        account_type: AchAccountType::Checking,
        account_holder: "Jane Doe".into(),
    }
}
