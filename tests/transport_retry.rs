mod support;

use std::time::Duration;

use posthog_server_rs::{ClientOptionsBuilder, Error, Transport};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use support::{ResponseScript, ScriptedServer};

fn transport(configure: impl FnOnce(ClientOptionsBuilder) -> ClientOptionsBuilder) -> Transport {
    let options = configure(ClientOptionsBuilder::new().api_key("phc_test"))
        .build()
        .unwrap();
    Transport::new(&options)
}

#[tokio::test]
async fn retries_on_5xx_with_growing_backoff() {
    let server = ScriptedServer::start(vec![
        ResponseScript::new(503),
        ResponseScript::new(503),
        ResponseScript::json(200, json!({"status": "Ok"})),
    ])
    .await;

    let transport = transport(|options| {
        options
            .max_retries(3)
            .initial_retry_delay(Duration::from_millis(10))
            .max_retry_delay(Duration::from_secs(30))
    });

    let body: serde_json::Value = transport
        .post_json(&server.url("/batch/"), &json!({"ping": true}), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(body, json!({"status": "Ok"}));

    let requests = server.requests();
    assert_eq!(requests.len(), 3);

    // Waits between attempts: 10ms, then doubled to 20ms.
    let first_gap = requests[1].at - requests[0].at;
    let second_gap = requests[2].at - requests[1].at;
    assert!(first_gap >= Duration::from_millis(10), "first gap {:?}", first_gap);
    assert!(second_gap >= Duration::from_millis(20), "second gap {:?}", second_gap);
    assert!(second_gap < Duration::from_secs(5));
}

#[tokio::test]
async fn honors_retry_after_date_in_the_past_as_zero_wait() {
    let just_passed = (chrono::Utc::now() - chrono::Duration::milliseconds(100))
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    let server = ScriptedServer::start(vec![
        ResponseScript::new(429).header("retry-after", &just_passed),
        ResponseScript::json(200, json!({"status": 1})),
    ])
    .await;

    // A 5s backoff would dominate the gap if Retry-After were ignored.
    let transport = transport(|options| {
        options
            .max_retries(3)
            .initial_retry_delay(Duration::from_secs(5))
    });

    let body: serde_json::Value = transport
        .post_json(&server.url("/capture/"), &json!({"ping": true}), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(body, json!({"status": 1}));

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    let gap = requests[1].at - requests[0].at;
    assert!(gap < Duration::from_secs(2), "retry waited {:?}", gap);
}

#[tokio::test]
async fn non_retryable_status_fails_after_one_attempt() {
    let server = ScriptedServer::start(vec![ResponseScript::json(
        400,
        json!({"type": "validation_error", "code": "malformed", "detail": "bad batch", "attr": null}),
    )])
    .await;

    let transport = transport(|options| options.initial_retry_delay(Duration::from_millis(10)));
    let result: Result<serde_json::Value, Error> = transport
        .post_json(&server.url("/batch/"), &json!({}), &CancellationToken::new())
        .await;

    match result {
        Err(Error::Api { status, body }) => {
            assert_eq!(status.as_u16(), 400);
            assert_eq!(body.code, "malformed");
        }
        other => panic!("expected Api error, got {:?}", other),
    }
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn unauthorized_has_a_distinct_surface() {
    let server = ScriptedServer::start(vec![ResponseScript::json(
        401,
        json!({"type": "authentication_error", "code": "invalid_api_key", "detail": "nope", "attr": null}),
    )])
    .await;

    let transport = transport(|options| options);
    let result: Result<serde_json::Value, Error> = transport
        .post_json(&server.url("/batch/"), &json!({}), &CancellationToken::new())
        .await;

    match result {
        Err(Error::Unauthorized(body)) => assert_eq!(body.code, "invalid_api_key"),
        other => panic!("expected Unauthorized, got {:?}", other),
    }
}

#[tokio::test]
async fn not_found_is_a_network_style_error() {
    let server = ScriptedServer::start(vec![ResponseScript::new(404)]).await;

    let transport = transport(|options| options);
    let result: Result<serde_json::Value, Error> = transport
        .post_json(&server.url("/nope/"), &json!({}), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::NotFound(_))));
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn exhausted_retries_surface_a_connection_error() {
    let server = ScriptedServer::start(vec![ResponseScript::new(500)]).await;

    let transport = transport(|options| {
        options
            .max_retries(1)
            .initial_retry_delay(Duration::from_millis(5))
    });
    let result: Result<serde_json::Value, Error> = transport
        .post_json(&server.url("/batch/"), &json!({}), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::Connection(_))));
    // 1 attempt + 1 retry.
    assert_eq!(server.requests().len(), 2);
}

#[tokio::test]
async fn compressed_bodies_are_gzip_with_the_right_headers() {
    use std::io::Read;

    let server =
        ScriptedServer::start(vec![ResponseScript::json(200, json!({"status": 1}))]).await;

    let transport = transport(|options| options.enable_compression(true));
    let payload = json!({"api_key": "phc_test", "batch": [{"event": "e1"}]});
    let _: serde_json::Value = transport
        .post_json(&server.url("/batch/"), &payload, &CancellationToken::new())
        .await
        .unwrap();

    let requests = server.requests();
    assert_eq!(requests[0].header("content-encoding"), Some("gzip"));
    assert_eq!(requests[0].header("content-type"), Some("application/json"));

    let mut decoder = flate2::read::GzDecoder::new(&requests[0].body[..]);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed).unwrap();
    let restored: serde_json::Value = serde_json::from_slice(&decompressed).unwrap();
    assert_eq!(restored, payload);
}

#[tokio::test]
async fn requests_carry_the_library_user_agent() {
    let server =
        ScriptedServer::start(vec![ResponseScript::json(200, json!({"status": 1}))]).await;

    let transport = transport(|options| options);
    let _: serde_json::Value = transport
        .post_json(&server.url("/capture/"), &json!({}), &CancellationToken::new())
        .await
        .unwrap();

    let agent = server.requests()[0]
        .header("user-agent")
        .expect("user-agent header missing")
        .to_string();
    assert!(
        agent.starts_with("posthog-server-rs/"),
        "unexpected agent {}",
        agent
    );
    assert!(agent.contains("rust"));
}

#[tokio::test]
async fn cancellation_aborts_immediately() {
    let server =
        ScriptedServer::start(vec![ResponseScript::json(200, json!({"status": 1}))]).await;

    let transport = transport(|options| options);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result: Result<serde_json::Value, Error> = transport
        .post_json(&server.url("/batch/"), &json!({}), &cancel)
        .await;
    assert!(matches!(result, Err(Error::Cancelled)));
}
