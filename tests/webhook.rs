//! End-to-end tests for webhook delivery.

use std::time::Duration;

use axum::http::{Method, StatusCode};
use docserve::ServerConfig;

mod common;

use common::{fast_webhook_config, form, start_receiver, start_server, CONVERTED_PREFIX};

#[tokio::test]
async fn async_webhook_receives_the_zipped_outputs() {
    let (hooks, mut deliveries) = start_receiver().await;
    let server = start_server(fast_webhook_config()).await;

    let res = reqwest::Client::new()
        .post(server.url("/forms/convert"))
        .header("Gotenberg-Webhook-Url", format!("{hooks}/done"))
        .header("Gotenberg-Webhook-Error-Url", format!("{hooks}/error"))
        .header("Gotenberg-Trace", "webhook-trace")
        .multipart(form(&[("a.txt", "first"), ("b.txt", "second")]))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let delivery = tokio::time::timeout(Duration::from_secs(10), deliveries.recv())
        .await
        .expect("webhook was not called")
        .unwrap();
    assert_eq!(delivery.kind, "done");
    assert_eq!(delivery.method, Method::POST);
    assert_eq!(delivery.header("content-type"), "application/zip");
    assert_eq!(delivery.header("gotenberg-trace"), "webhook-trace");
    assert!(delivery.header("content-disposition").starts_with("attachment; filename="));
    assert!(delivery.body.starts_with(b"PK\x03\x04"));

    server.stop().await;
}

#[tokio::test]
async fn sync_webhook_delivers_before_answering() {
    let (hooks, mut deliveries) = start_receiver().await;
    let server = start_server(fast_webhook_config()).await;

    let res = reqwest::Client::new()
        .post(server.url("/forms/convert"))
        .header("Gotenberg-Webhook-Url", format!("{hooks}/done"))
        .header("Gotenberg-Webhook-Error-Url", format!("{hooks}/error"))
        .header("Gotenberg-Webhook-Method", "PUT")
        .header("Gotenberg-Webhook-Sync", "true")
        .header("Gotenberg-Webhook-Extra-Http-Headers", r#"{"X-Token": "t0k3n"}"#)
        .multipart(form(&[("report.txt", "numbers")]))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let delivery = deliveries.try_recv().expect("delivery should be done already");
    assert_eq!(delivery.kind, "done");
    assert_eq!(delivery.method, Method::PUT);
    assert_eq!(delivery.header("x-token"), "t0k3n");
    assert_eq!(delivery.header("content-type"), "application/pdf");
    assert!(delivery.body.starts_with(CONVERTED_PREFIX));

    server.stop().await;
}

#[tokio::test]
async fn failures_are_posted_to_the_error_url() {
    let (hooks, mut deliveries) = start_receiver().await;
    let server = start_server(fast_webhook_config()).await;

    let res = reqwest::Client::new()
        .post(server.url("/forms/convert"))
        .header("Gotenberg-Webhook-Url", format!("{hooks}/done"))
        .header("Gotenberg-Webhook-Error-Url", format!("{hooks}/error"))
        .multipart(reqwest::multipart::Form::new().text("landscape", "true"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let delivery = tokio::time::timeout(Duration::from_secs(10), deliveries.recv())
        .await
        .expect("error webhook was not called")
        .unwrap();
    assert_eq!(delivery.kind, "error");
    let envelope: serde_json::Value = serde_json::from_slice(&delivery.body).unwrap();
    assert_eq!(envelope["status"], 400);
    assert_eq!(envelope["message"], "no form file found for extensions: [.txt]");

    server.stop().await;
}

#[tokio::test]
async fn invalid_webhook_headers_fail_fast() {
    let (hooks, mut deliveries) = start_receiver().await;
    let mut config = fast_webhook_config();
    if let Some(toml::Value::Table(flags)) = config.modules.get_mut("webhook") {
        flags.insert(
            "allow_list".to_string(),
            toml::Value::String(r"^http://127\.0\.0\.1".to_string()),
        );
    }
    let server = start_server(config).await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/forms/convert"))
        .header("Gotenberg-Webhook-Url", format!("{hooks}/done"))
        .multipart(form(&[("a.txt", "first")]))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        res.text().await.unwrap(),
        "Invalid 'Gotenberg-Webhook-Error-Url' header: empty value or header not provided"
    );

    let res = client
        .post(server.url("/forms/convert"))
        .header("Gotenberg-Webhook-Url", "http://example.com/done")
        .header("Gotenberg-Webhook-Error-Url", format!("{hooks}/error"))
        .multipart(form(&[("a.txt", "first")]))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = client
        .post(server.url("/forms/convert"))
        .header("Gotenberg-Webhook-Url", format!("{hooks}/done"))
        .header("Gotenberg-Webhook-Error-Url", format!("{hooks}/error"))
        .header("Gotenberg-Webhook-Method", "DELETE")
        .multipart(form(&[("a.txt", "first")]))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    assert!(deliveries.try_recv().is_err());
    server.stop().await;
}

#[tokio::test]
async fn disabled_webhook_is_forbidden() {
    let mut config = ServerConfig::default();
    let flags: toml::Table = toml::from_str("disable = true").unwrap();
    config
        .modules
        .insert("webhook".to_string(), toml::Value::Table(flags));
    let server = start_server(config).await;

    let res = reqwest::Client::new()
        .post(server.url("/forms/convert"))
        .header("Gotenberg-Webhook-Url", "http://127.0.0.1:9/done")
        .multipart(form(&[("a.txt", "first")]))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    server.stop().await;
}

#[tokio::test]
async fn shutdown_waits_for_async_jobs() {
    let (hooks, mut deliveries) = start_receiver().await;
    let server = start_server(fast_webhook_config()).await;

    let res = reqwest::Client::new()
        .post(server.url("/forms/convert"))
        .header("Gotenberg-Webhook-Url", format!("{hooks}/done"))
        .header("Gotenberg-Webhook-Error-Url", format!("{hooks}/error"))
        .multipart(form(&[("a.txt", "first")]))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    server.stop().await;

    let delivery = deliveries.try_recv().expect("job finished before shutdown completed");
    assert_eq!(delivery.kind, "done");
}
