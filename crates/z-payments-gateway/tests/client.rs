//! Gateway client tests against a mock gateway.

use std::time::Duration;

use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use z_payments_core::{GatewayToken, MerchantId, TransactionNumber};
use z_payments_gateway::{
    BrowserOperation, DirectRequest, Funding, Gateway, GatewayClient, GatewayConfig, GatewayError,
    KeyExchangeRequest, MerchantCredentials, MerchantGateway, Outcome, StatusResult, TranType,
};

fn credentials() -> MerchantCredentials {
    MerchantCredentials {
        cust_nbr: "9001".into(),
        merch_nbr: "900300".into(),
        dba_nbr: "2".into(),
        terminal_nbr: "77".into(),
        mac_secret: "test-secret".into(),
    }
}

fn client_for(server: &MockServer) -> GatewayClient {
    GatewayClient::new(GatewayConfig::with_base_url(&server.uri())).unwrap()
}

fn sale() -> DirectRequest {
    DirectRequest {
        tran_type: TranType::CardSale,
        transaction_number: TransactionNumber::derive(&MerchantId::generate(), "sale-1"),
        amount_minor: 9999,
        funding: Funding::Token(GatewayToken::Storage("stor-1".into())),
    }
}

#[tokio::test]
async fn approved_submission() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/direct"))
        .and(body_string_contains("TRAN_TYPE=CCE2"))
        .and(body_string_contains("AMOUNT=99.99"))
        .and(body_string_contains("MAC="))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<RESPONSE><FIELDS><FIELD KEY="AUTH_RESP">00</FIELD><FIELD KEY="AUTH_GUID">guid-9</FIELD></FIELDS></RESPONSE>"#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let response = client_for(&server)
        .submit(&credentials(), &sale())
        .await
        .unwrap();
    assert_eq!(response.outcome, Outcome::Approved);
    assert_eq!(response.financial_token.as_deref(), Some("guid-9"));
}

#[tokio::test]
async fn declined_submission_is_not_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/direct"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<FIELD KEY="AUTH_RESP">51</FIELD><FIELD KEY="AUTH_RESP_TEXT">INSUFFICIENT FUNDS</FIELD>"#,
        ))
        .mount(&server)
        .await;

    let response = client_for(&server)
        .submit(&credentials(), &sale())
        .await
        .unwrap();
    assert_eq!(response.outcome, Outcome::Declined);
    assert_eq!(response.response_code, "51");
}

#[tokio::test]
async fn server_error_is_ambiguous() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/direct"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .submit(&credentials(), &sale())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Http { status: 503 }));
    assert!(err.is_ambiguous());
}

#[tokio::test]
async fn slow_gateway_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/direct"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let mut config = GatewayConfig::with_base_url(&server.uri());
    config.timeout = Duration::from_millis(50);
    let client = GatewayClient::new(config).unwrap();

    let err = client.submit(&credentials(), &sale()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Timeout));
}

#[tokio::test]
async fn unreachable_gateway() {
    // Nothing listens on port 9 (discard) on a test host.
    let client = GatewayClient::new(GatewayConfig::with_base_url("http://127.0.0.1:9")).unwrap();
    let err = client.submit(&credentials(), &sale()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Unreachable(_)));
    assert!(!err.is_ambiguous());
}

#[tokio::test]
async fn browser_session_and_status_query() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/keyexchange"))
        .and(body_string_contains("TRAN_GROUP=AUTH"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"<FIELD KEY="TAC">tac-77</FIELD>"#),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"<FIELD KEY="FOUND">N</FIELD>"#))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let scoped = MerchantGateway::new(&client, credentials());
    let number = TransactionNumber::derive(&MerchantId::generate(), "browser-1");

    let (code, form) = scoped
        .begin_browser(&KeyExchangeRequest {
            transaction_number: number.clone(),
            amount_minor: 2500,
            operation: BrowserOperation::Authorization,
            return_url: "https://shop.example/done".into(),
            tokenize: false,
        })
        .await
        .unwrap();
    assert_eq!(code, "tac-77");
    assert_eq!(form.post_url, format!("{}/browserpost", server.uri()));
    assert_eq!(form.fields["TRAN_NBR"], number.as_str());

    assert_eq!(
        scoped.query_status(&number).await.unwrap(),
        StatusResult::NotFound
    );
}
