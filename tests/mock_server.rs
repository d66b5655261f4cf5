//! Integration tests for stub selection, templating, verification and the
//! server lifecycle, using stubs declared with the builder API.

use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use stub_mock_server::{
    DelayConfig, GlobalSettings, MockServer, RequestMatcher, ResponseDefinition, StubDefinition,
    NO_MATCH_HEADER,
};

fn json_response(status: u16, body: &str) -> ResponseDefinition {
    ResponseDefinition::with_status(status)
        .header("Content-Type", "application/json")
        .text_body(body)
}

/// Poll the journal until a request for `path` has reached the server.
async fn wait_until_received(server: &MockServer, path: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !server.received_requests().iter().any(|r| r.path == path) {
        assert!(Instant::now() < deadline, "request for {} never arrived", path);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_create_book_with_exact_json_body() {
    let server = MockServer::default();
    server
        .register(StubDefinition::new(
            RequestMatcher::post()
                .path_exact("/books")
                .body_json(json!({"title": "Test Book", "author": "Test Author", "price": 29.99})),
            json_response(
                200,
                r#"{"id":"12345","title":"Test Book","author":"Test Author","price":29.99}"#,
            ),
        ))
        .unwrap();
    let base_url = server.start().await.unwrap();

    let response = Client::new()
        .post(format!("{}/books", base_url))
        .json(&json!({"title": "Test Book", "author": "Test Author", "price": 29.99}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["id"], "12345");

    server.stop().await;
}

#[tokio::test]
async fn test_exact_path_overrides_pattern_registered_earlier() {
    let server = MockServer::default();
    server
        .register(StubDefinition::new(
            RequestMatcher::get().path_regex("/books/.*"),
            json_response(200, r#"{"id":"{{request.path.[1]}}"}"#),
        ))
        .unwrap();
    let base_url = server.start().await.unwrap();
    let client = Client::new();

    let before: Value = client
        .get(format!("{}/books/999999", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(before["id"], "999999");

    server
        .register(StubDefinition::new(
            RequestMatcher::get().path_exact("/books/999999"),
            json_response(404, r#"{"detail":"Book not found"}"#),
        ))
        .unwrap();

    let response = client
        .get(format!("{}/books/999999", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().get(NO_MATCH_HEADER).is_none());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"detail": "Book not found"}));

    let other: Value = client
        .get(format!("{}/books/12345", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(other["id"], "12345");

    server.stop().await;
}

#[tokio::test]
async fn test_method_only_stub_answers_patch() {
    let server = MockServer::default();
    server
        .register(StubDefinition::new(
            RequestMatcher::patch(),
            json_response(405, r#"{"detail":"Method not allowed"}"#),
        ))
        .unwrap();
    let base_url = server.start().await.unwrap();

    let response = Client::new()
        .patch(format!("{}/books/1", base_url))
        .json(&json!({"title": "Updated Book"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_json_falls_back_to_raw_pattern() {
    let server = MockServer::default();
    server
        .register(StubDefinition::new(
            RequestMatcher::post()
                .path_exact("/books")
                .body_json(json!({"title": "Test Book", "author": "Test Author", "price": 29.99})),
            json_response(200, r#"{"id":"12345"}"#),
        ))
        .unwrap();
    server
        .register(StubDefinition::new(
            RequestMatcher::post()
                .path_exact("/books")
                .body_matching(".*[^}]+"),
            json_response(400, r#"{"detail":"Invalid JSON format"}"#),
        ))
        .unwrap();
    let base_url = server.start().await.unwrap();

    let response = Client::new()
        .post(format!("{}/books", base_url))
        .header("content-type", "application/json")
        .body(r#"{"title":"Test Book","author":"Test Author","price":29.99"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"detail": "Invalid JSON format"}));

    server.stop().await;
}

#[tokio::test]
async fn test_unmatched_request_gets_marked_404() {
    let server = MockServer::default();
    let base_url = server.start().await.unwrap();

    let response = Client::new()
        .get(format!("{}/nothing/here", base_url))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()[NO_MATCH_HEADER], "true");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "no_matching_stub");
    assert_eq!(body["path"], "/nothing/here");

    server.stop().await;
}

#[tokio::test]
async fn test_broken_template_returns_500_and_server_survives() {
    let server = MockServer::default();
    server
        .register(StubDefinition::new(
            RequestMatcher::get().path_exact("/broken"),
            ResponseDefinition::with_status(200).text_body("{{#if request.method}}"),
        ))
        .unwrap();
    server
        .register(StubDefinition::new(
            RequestMatcher::get().path_exact("/ok"),
            ResponseDefinition::with_status(200).text_body("fine"),
        ))
        .unwrap();
    let base_url = server.start().await.unwrap();
    let client = Client::new();

    let response = client.get(format!("{}/broken", base_url)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "template_render_failed");

    let response = client.get(format!("{}/ok", base_url)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "fine");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_request_line_does_not_stop_server() {
    let server = MockServer::default();
    server
        .register(StubDefinition::new(
            RequestMatcher::get().path_exact("/ping"),
            ResponseDefinition::with_status(200).text_body("pong"),
        ))
        .unwrap();
    let base_url = server.start().await.unwrap();
    let addr = server.address().unwrap();

    tokio::task::spawn_blocking(move || {
        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream.write_all(b"NOT AN HTTP REQUEST\r\n\r\n").unwrap();
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
    })
    .await
    .unwrap();

    let response = Client::new()
        .get(format!("{}/ping", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "pong");

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests() {
    let server = MockServer::default();
    server
        .register(
            StubDefinition::new(
                RequestMatcher::get().path_regex("/books/[^/]+"),
                json_response(200, r#"{"id":"{{request.path.[1]}}"}"#),
            )
            .with_delay(DelayConfig {
                fixed_ms: 50,
                ..DelayConfig::default()
            }),
        )
        .unwrap();
    let base_url = server.start().await.unwrap();
    let client = Client::new();

    let mut handles = Vec::new();
    for i in 0..20 {
        let client = client.clone();
        let url = format!("{}/books/{}", base_url, i);
        handles.push(tokio::spawn(async move {
            let body: Value = client.get(url).send().await.unwrap().json().await.unwrap();
            body["id"].as_str().unwrap().to_string()
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), i.to_string());
    }
    assert_eq!(
        server
            .received_count(&RequestMatcher::get().path_regex("/books/.*"))
            .unwrap(),
        20
    );

    server.stop().await;
}

#[tokio::test]
async fn test_verification_and_reset() {
    let server = MockServer::default();
    server
        .register(StubDefinition::new(
            RequestMatcher::post().path_exact("/books"),
            ResponseDefinition::with_status(201),
        ))
        .unwrap();
    let base_url = server.start().await.unwrap();
    let client = Client::new();

    client
        .post(format!("{}/books", base_url))
        .json(&json!({"title": "Dune"}))
        .send()
        .await
        .unwrap();

    let created = RequestMatcher::post()
        .path_exact("/books")
        .body_json(json!({"title": "Dune"}));
    assert!(server.was_received(&created).unwrap());
    assert!(!server
        .was_received(&RequestMatcher::get().path_exact("/books"))
        .unwrap());
    assert_eq!(
        server.received_requests()[0].matched_stub.as_deref(),
        Some("stub-0")
    );

    server.reset();
    server.reset();
    assert_eq!(server.stub_count(), 0);
    assert!(!server.was_received(&created).unwrap());

    let response = client
        .post(format!("{}/books", base_url))
        .json(&json!({"title": "Dune"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()[NO_MATCH_HEADER], "true");

    server.stop().await;
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_requests() {
    let server = MockServer::default();
    server
        .register(
            StubDefinition::new(
                RequestMatcher::get().path_exact("/slow"),
                ResponseDefinition::with_status(200).text_body("done"),
            )
            .with_delay(DelayConfig {
                fixed_ms: 300,
                ..DelayConfig::default()
            }),
        )
        .unwrap();
    let base_url = server.start().await.unwrap();

    let client = Client::new();
    let request = client.get(format!("{}/slow", base_url)).send();
    let in_flight = tokio::spawn(request);
    wait_until_received(&server, "/slow").await;

    server.stop().await;
    let response = in_flight.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "done");

    let refused = Client::new()
        .get(format!("{}/slow", base_url))
        .timeout(Duration::from_secs(2))
        .send()
        .await;
    assert!(refused.is_err());
}

#[tokio::test]
async fn test_stop_closes_connections_after_grace_period() {
    let server = MockServer::new(GlobalSettings {
        grace_period_ms: 100,
        ..GlobalSettings::default()
    });
    server
        .register(
            StubDefinition::new(
                RequestMatcher::get().path_exact("/stuck"),
                ResponseDefinition::with_status(200),
            )
            .with_delay(DelayConfig {
                fixed_ms: 5_000,
                ..DelayConfig::default()
            }),
        )
        .unwrap();
    let base_url = server.start().await.unwrap();

    let client = Client::new();
    let request = client.get(format!("{}/stuck", base_url)).send();
    let in_flight = tokio::spawn(request);
    wait_until_received(&server, "/stuck").await;

    let started = Instant::now();
    server.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let result = in_flight.await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(result.is_err());
    assert!(!server.is_running());
}
