mod fixtures;
use fixtures::*;

use std::collections::HashMap;

use relay_executors::{
    test_utils::borrowed_job,
    webhook::{
        SIGNATURE_HEADER_NAME, TIMESTAMP_HEADER_NAME, WebhookError, WebhookJobHandler,
        WebhookJobPayload, WebhookRetryConfig, sign_payload,
    },
};
use relay_queue::{DurableExecution, job::JobError};
use serde_json::json;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn handler() -> WebhookJobHandler {
    WebhookJobHandler::new(
        reqwest::Client::new(),
        WebhookRetryConfig {
            max_attempts: 3,
            ..Default::default()
        },
    )
}

fn payload(server: &MockServer, hmac_secret: Option<&str>) -> WebhookJobPayload {
    WebhookJobPayload {
        url: format!("{}/webhook", server.uri()),
        body: json!({ "queueId": "tx-1", "status": "mined" }).to_string(),
        headers: None,
        hmac_secret: hmac_secret.map(str::to_string),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn signed_delivery_succeeds() {
    setup_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .and(header("content-type", "application/json; charset=utf-8"))
        .and(header_exists(SIGNATURE_HEADER_NAME))
        .and(header_exists(TIMESTAMP_HEADER_NAME))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .expect(1)
        .mount(&server)
        .await;

    let job = borrowed_job("wh-1", payload(&server, Some("whsec")), 1);
    let output = handler().process(&job).await.unwrap();

    assert_eq!(output.status_code, 200);
    assert!(output.response_body.unwrap().contains("ok"));

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let timestamp = request.headers[TIMESTAMP_HEADER_NAME].to_str().unwrap();
    let signature = request.headers[SIGNATURE_HEADER_NAME].to_str().unwrap();
    let body = String::from_utf8(request.body.clone()).unwrap();
    assert_eq!(signature, sign_payload("whsec", timestamp, &body).unwrap());
}

#[tokio::test]
async fn custom_headers_are_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .and(header("authorization", "Bearer token123"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let mut data = payload(&server, None);
    data.headers = Some(HashMap::from([(
        "Authorization".to_string(),
        "Bearer token123".to_string(),
    )]));

    let output = handler().process(&borrowed_job("wh-2", data, 1)).await.unwrap();
    assert_eq!(output.status_code, 204);
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = handler()
        .process(&borrowed_job("wh-3", payload(&server, None), 1))
        .await
        .unwrap_err();

    match err {
        JobError::Nack { error, delay, .. } => {
            assert!(matches!(error, WebhookError::Http { status: 503, .. }));
            assert!(delay.is_some());
        }
        other => panic!("expected a nack, got {other:?}"),
    }
}

#[tokio::test]
async fn rate_limited_delivery_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let err = handler()
        .process(&borrowed_job("wh-4", payload(&server, None), 2))
        .await
        .unwrap_err();
    assert!(err.is_nack());
}

#[tokio::test]
async fn client_errors_fail_immediately() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad payload"))
        .mount(&server)
        .await;

    let err = handler()
        .process(&borrowed_job("wh-5", payload(&server, None), 1))
        .await
        .unwrap_err();

    match err {
        JobError::Fail(WebhookError::Http { status, body_preview }) => {
            assert_eq!(status, 400);
            assert_eq!(body_preview, "bad payload");
        }
        other => panic!("expected a failure, got {other:?}"),
    }
}

#[tokio::test]
async fn server_errors_fail_once_attempts_are_spent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = handler()
        .process(&borrowed_job("wh-6", payload(&server, None), 3))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Fail(WebhookError::Http { status: 500, .. })));
}

#[tokio::test]
async fn unreachable_endpoint_is_a_network_error() {
    // nothing listens on port 9 locally
    let data = WebhookJobPayload {
        url: "http://127.0.0.1:9/webhook".to_string(),
        body: "{}".to_string(),
        headers: None,
        hmac_secret: None,
    };

    let err = handler()
        .process(&borrowed_job("wh-7", data, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Nack { error: WebhookError::Network(_), .. }));
}
