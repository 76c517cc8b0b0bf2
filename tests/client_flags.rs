use std::collections::HashMap;
use std::time::Duration;

use httpmock::prelude::*;
use posthog_server_rs::flags::FlagValue;
use posthog_server_rs::{client, Client, ClientOptionsBuilder};
use serde_json::json;

fn decide_body() -> serde_json::Value {
    json!({
        "featureFlags": {"beta": "variant-a", "simple": true},
        "featureFlagPayloads": {"beta": {"color": "red"}},
        "errorsWhileComputingFlags": false,
        "requestId": "9a81babb-17d5-4c55-9b76-9d18e4b9c7cc"
    })
}

async fn remote_only_client(server: &MockServer) -> Client {
    let options = ClientOptionsBuilder::new()
        .host(server.base_url())
        .api_key("phc_test")
        .build()
        .unwrap();
    client(options).await
}

#[tokio::test]
async fn flags_fall_back_to_the_decision_endpoint() {
    let server = MockServer::start();
    let decide = server.mock(|when, then| {
        when.method(POST).path("/decide/").query_param("v", "3");
        then.status(200).json_body(decide_body());
    });

    let client = remote_only_client(&server).await;
    let value = client
        .get_feature_flag("beta", "user-1", None, None, None)
        .await
        .unwrap();
    assert_eq!(value, Some(FlagValue::String("variant-a".to_string())));
    decide.assert();

    client.dispose().await;
}

#[tokio::test]
async fn is_feature_enabled_treats_variants_as_enabled() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/decide/");
        then.status(200).json_body(decide_body());
    });

    let client = remote_only_client(&server).await;
    assert!(client
        .is_feature_enabled("beta", "user-1", None, None, None)
        .await
        .unwrap());
    assert!(client
        .is_feature_enabled("simple", "user-1", None, None, None)
        .await
        .unwrap());
    assert!(!client
        .is_feature_enabled("missing", "user-1", None, None, None)
        .await
        .unwrap());

    client.dispose().await;
}

#[tokio::test]
async fn payloads_come_back_with_the_decisions() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/decide/");
        then.status(200).json_body(decide_body());
    });

    let client = remote_only_client(&server).await;
    let payload = client
        .get_feature_flag_payload("beta", "user-1", None, None, None)
        .await
        .unwrap();
    assert_eq!(payload, Some(json!({"color": "red"})));

    client.dispose().await;
}

#[tokio::test]
async fn request_scope_fetches_each_context_once() {
    let server = MockServer::start();
    let decide = server.mock(|when, then| {
        when.method(POST).path("/decide/");
        then.status(200).json_body(decide_body());
    });

    let client = remote_only_client(&server).await;
    let scope = client.request_scope();

    let mut properties = HashMap::new();
    properties.insert("plan".to_string(), json!("pro"));

    let first = scope
        .get_all_flags("user-1", None, Some(properties.clone()), None)
        .await
        .unwrap();
    let second = scope
        .get_all_flags("user-1", None, Some(properties.clone()), None)
        .await
        .unwrap();
    assert_eq!(first.flags, second.flags);
    assert_eq!(decide.hits(), 1, "same context must reuse the cached decisions");

    // A changed context is a different cache key and a fresh fetch.
    properties.insert("plan".to_string(), json!("free"));
    scope
        .get_all_flags("user-1", None, Some(properties.clone()), None)
        .await
        .unwrap();
    assert_eq!(decide.hits(), 2);

    // Scoped single-flag lookups ride on the same cached decision set.
    let value = scope
        .get_feature_flag("beta", "user-1", None, Some(properties), None)
        .await
        .unwrap();
    assert_eq!(value, Some(FlagValue::String("variant-a".to_string())));
    assert_eq!(decide.hits(), 2);

    client.dispose().await;
}

#[tokio::test]
async fn scopeless_calls_always_fetch() {
    let server = MockServer::start();
    let decide = server.mock(|when, then| {
        when.method(POST).path("/decide/");
        then.status(200).json_body(decide_body());
    });

    let client = remote_only_client(&server).await;
    client
        .get_all_feature_flags("user-1", None, None, None)
        .await
        .unwrap();
    client
        .get_all_feature_flags("user-1", None, None, None)
        .await
        .unwrap();
    assert_eq!(decide.hits(), 2);

    client.dispose().await;
}

#[tokio::test]
async fn local_and_remote_decisions_merge_with_remote_winning() {
    let server = MockServer::start();

    // Snapshot holds one locally decidable flag and one continuity flag.
    server.mock(|when, then| {
        when.method(GET).path("/api/feature_flag/local_evaluation/");
        then.status(200).json_body(json!({
            "flags": [
                {"key": "local-on", "active": true, "filters": {
                    "groups": [{"properties": [], "rollout_percentage": 100.0, "variant": null}]
                }},
                {"key": "sticky", "active": true, "ensure_experience_continuity": true, "filters": {
                    "groups": [{"properties": [], "rollout_percentage": 100.0, "variant": null}]
                }}
            ],
            "group_type_mapping": {},
            "cohorts": {}
        }));
    });
    let decide = server.mock(|when, then| {
        when.method(POST).path("/decide/");
        then.status(200).json_body(json!({
            "featureFlags": {"sticky": true, "local-on": false},
            "featureFlagPayloads": {},
            "errorsWhileComputingFlags": false
        }));
    });

    let options = ClientOptionsBuilder::new()
        .host(server.base_url())
        .api_key("phc_test")
        .personal_api_key("phx_personal")
        .flag_poll_interval(Duration::from_secs(60))
        .build()
        .unwrap();
    let client = client(options).await;

    // Wait out the initial poll, then ask for everything.
    let mut decisions = None;
    for _ in 0..200 {
        let all = client
            .get_all_feature_flags("user-1", None, None, None)
            .await
            .unwrap();
        if all.flags.contains_key("sticky") && all.flags.contains_key("local-on") {
            decisions = Some(all);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let decisions = decisions.expect("snapshot never loaded");

    assert_eq!(decisions.flags.get("sticky"), Some(&FlagValue::Boolean(true)));
    // The server's answer overrides the local one on merge.
    assert_eq!(
        decisions.flags.get("local-on"),
        Some(&FlagValue::Boolean(false))
    );
    assert!(decide.hits() >= 1);

    client.dispose().await;
}

#[tokio::test]
async fn remote_config_requires_the_personal_key() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/api/feature_flag/local_evaluation/");
        then.status(200).json_body(json!({"flags": [], "group_type_mapping": {}, "cohorts": {}}));
    });
    let config = server.mock(|when, then| {
        when.method(GET)
            .path("/api/projects/@current/feature_flags/my-flag/remote_config/")
            .header("Authorization", "Bearer phx_personal");
        then.status(200).json_body(json!({"banner": "spring-sale"}));
    });

    let options = ClientOptionsBuilder::new()
        .host(server.base_url())
        .api_key("phc_test")
        .personal_api_key("phx_personal")
        .build()
        .unwrap();
    let with_key = client(options).await;
    let payload = with_key.get_remote_config_payload("my-flag").await.unwrap();
    assert_eq!(payload, json!({"banner": "spring-sale"}));
    config.assert();
    with_key.dispose().await;

    // Without the privileged credential the call is a configuration error.
    let without_key = remote_only_client(&server).await;
    let result = without_key.get_remote_config_payload("my-flag").await;
    assert!(matches!(
        result,
        Err(posthog_server_rs::Error::Configuration(_))
    ));
    without_key.dispose().await;
}
