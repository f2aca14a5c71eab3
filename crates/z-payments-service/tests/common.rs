//! Common test utilities for z-payments integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum_test::{TestRequest, TestServer};
use chrono::Utc;

use z_payments_core::{
    CustomerId, MerchantId, PaymentMethod, PaymentMethodId, PaymentMethodType,
    TransactionNumber,
};
use z_payments_engine::{AllowAll, EngineConfig, PaymentEngine, StaticCredentials};
use z_payments_gateway::crypto::sign_fields;
use z_payments_gateway::{
    fields, DirectRequest, FieldMap, Gateway, GatewayError, GatewayResponse, KeyExchangeRequest,
    MerchantCredentials, Outcome, StatusResult, TranType,
};
use z_payments_service::{create_router, AppState, ServiceConfig};
use z_payments_store::{MemoryStore, Store};

pub const MAC_SECRET: &str = "test-mac-secret";

/// In-process gateway that approves everything unless told otherwise.
#[derive(Default)]
pub struct StubGateway {
    processed: Mutex<Vec<(TransactionNumber, GatewayResponse)>>,
    decline_amounts: Mutex<HashSet<i64>>,
    unreachable: Mutex<bool>,
}

impl StubGateway {
    /// Decline every submission for exactly `amount_minor`.
    pub fn decline_amount(&self, amount_minor: i64) {
        self.decline_amounts.lock().unwrap().insert(amount_minor);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock().unwrap() = unreachable;
    }

    pub fn submission_count(&self) -> usize {
        self.processed.lock().unwrap().len()
    }
}

#[async_trait]
impl Gateway for StubGateway {
    async fn submit(
        &self,
        _credentials: &MerchantCredentials,
        request: &DirectRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        if *self.unreachable.lock().unwrap() {
            return Err(GatewayError::Unreachable("connection refused".into()));
        }

        let number = request.transaction_number.clone();
        let declined = self
            .decline_amounts
            .lock()
            .unwrap()
            .contains(&request.amount_minor);

        let response = GatewayResponse {
            outcome: if declined {
                Outcome::Declined
            } else {
                Outcome::Approved
            },
            response_code: if declined { "05" } else { "00" }.into(),
            response_message: if declined { "DO NOT HONOR" } else { "APPROVAL" }.into(),
            financial_token: Some(format!("fin-{number}")),
            auth_code: (!declined).then(|| "A1B2C3".to_string()),
            storage_token: (request.tran_type == TranType::AchStorage)
                .then(|| format!("stor-{number}")),
            card_brand: None,
            last_four: (request.tran_type == TranType::AchStorage).then(|| "6789".to_string()),
            approved_amount_minor: (!declined).then_some(request.amount_minor),
            transaction_number: Some(number.clone()),
        };

        self.processed
            .lock()
            .unwrap()
            .push((number, response.clone()));
        Ok(response)
    }

    async fn exchange_key(
        &self,
        _credentials: &MerchantCredentials,
        request: &KeyExchangeRequest,
    ) -> Result<String, GatewayError> {
        Ok(format!("tac-{}", request.transaction_number))
    }

    async fn query_status(
        &self,
        _credentials: &MerchantCredentials,
        transaction_number: &TransactionNumber,
    ) -> Result<StatusResult, GatewayError> {
        let processed = self.processed.lock().unwrap();
        Ok(processed
            .iter()
            .rev()
            .find(|(number, _)| number == transaction_number)
            .map_or(StatusResult::NotFound, |(_, response)| StatusResult::Found {
                response: response.clone(),
                return_code: None,
            }))
    }

    fn browser_post_url(&self) -> &str {
        "https://gateway.test/browserpost"
    }
}

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// The gateway behind the engine.
    pub gateway: Arc<StubGateway>,
    /// The store behind the engine.
    pub store: Arc<MemoryStore>,
    /// The merchant every request acts for.
    pub merchant_id: MerchantId,
    /// A customer of that merchant.
    pub customer_id: CustomerId,
    /// The service API key for merchant requests.
    pub service_api_key: String,
    /// The admin API key.
    pub admin_api_key: String,
}

impl TestHarness {
    /// Create a new test harness with a fresh in-memory store.
    pub fn new() -> Self {
        let merchant_id = MerchantId::generate();
        let gateway = Arc::new(StubGateway::default());
        let store = Arc::new(MemoryStore::new());

        let credentials = StaticCredentials::new().with(
            merchant_id,
            MerchantCredentials {
                cust_nbr: "9001".into(),
                merch_nbr: "900300".into(),
                dba_nbr: "2".into(),
                terminal_nbr: "77".into(),
                mac_secret: MAC_SECRET.into(),
            },
        );

        let engine = PaymentEngine::new(
            store.clone(),
            gateway.clone(),
            Arc::new(credentials),
            Arc::new(AllowAll),
            EngineConfig::default(),
        );

        let service_api_key = "test-service-key".to_string();
        let admin_api_key = "test-admin-key".to_string();

        let config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            service_api_key: Some(service_api_key.clone()),
            admin_api_key: Some(admin_api_key.clone()),
            ..ServiceConfig::default()
        };

        let state = AppState::new(engine, config);
        let router: Router = create_router(state);

        let server = TestServer::new(router).expect("Failed to create test server");

        Self {
            server,
            gateway,
            store,
            merchant_id,
            customer_id: CustomerId::generate(),
            service_api_key,
            admin_api_key,
        }
    }

    /// An authenticated GET.
    pub fn get(&self, path: &str) -> TestRequest {
        self.authenticated(self.server.get(path))
    }

    /// An authenticated POST carrying `idempotency_key`.
    pub fn post(&self, path: &str, idempotency_key: &str) -> TestRequest {
        self.authenticated(self.server.post(path))
            .add_header("idempotency-key", idempotency_key.to_string())
    }

    /// An authenticated PATCH carrying `idempotency_key`.
    pub fn patch(&self, path: &str, idempotency_key: &str) -> TestRequest {
        self.authenticated(self.server.patch(path))
            .add_header("idempotency-key", idempotency_key.to_string())
    }

    /// An authenticated DELETE.
    pub fn delete(&self, path: &str) -> TestRequest {
        self.authenticated(self.server.delete(path))
    }

    /// An admin POST.
    pub fn admin_post(&self, path: &str) -> TestRequest {
        self.server
            .post(path)
            .add_header("x-admin-key", self.admin_api_key.clone())
    }

    fn authenticated(&self, request: TestRequest) -> TestRequest {
        request
            .add_header("x-api-key", self.service_api_key.clone())
            .add_header("x-merchant-id", self.merchant_id.to_string())
            .add_header("x-service-name", "checkout".to_string())
    }

    /// Save an active, verified card for the test customer.
    pub fn saved_card(&self) -> PaymentMethod {
        let now = Utc::now();
        let method = PaymentMethod {
            id: PaymentMethodId::generate(),
            merchant_id: self.merchant_id,
            customer_id: self.customer_id,
            method_type: PaymentMethodType::CreditCard,
            storage_token: format!("stor-{}", PaymentMethodId::generate()),
            last_four: "4242".into(),
            card_brand: Some("VISA".into()),
            ach_account_type: None,
            is_active: true,
            is_verified: true,
            created_at: now,
            updated_at: now,
        };
        self.store.put_payment_method(&method).unwrap();
        method
    }

    /// A signed callback form for `number` carrying `pairs`.
    pub fn callback_form(&self, number: &str, pairs: &[(&str, &str)]) -> FieldMap {
        let mut map: FieldMap = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        map.insert(fields::TRAN_NBR.into(), number.to_string());
        let mac = sign_fields(MAC_SECRET, &map);
        map.insert(fields::MAC.into(), mac);
        map
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
