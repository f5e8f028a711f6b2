mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use realtime_sync_cell::*;
use shared_utils::test_utils::{MockSupabaseResponses, TestConfig};

use common::{test_settings, wait_for};

fn notifications_filter(subject: &str) -> SubscriptionFilter {
    FeedSpec::notifications().filter_for(&Subject::from(subject))
}

#[tokio::test]
async fn test_snapshot_queries_filtered_newest_first() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_supabase_url(&mock_server.uri()).to_app_config();

    Mock::given(method("GET"))
        .and(path("/rest/v1/notifications"))
        .and(query_param("select", "*"))
        .and(query_param("recipient_id", "eq.u1"))
        .and(query_param("order", "created_at.desc"))
        .and(header("apikey", "test-anon-key"))
        .and(header("authorization", "Bearer user-jwt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::notification_row("n2", "u1", false),
            MockSupabaseResponses::notification_row("n1", "u1", true),
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let loader = SupabaseSnapshotLoader::new(&config);
    let rows = tokio_test::assert_ok!(loader.load(&notifications_filter("u1"), "user-jwt").await);

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], "n2");
}

#[tokio::test]
async fn test_profile_snapshot_orders_by_updated_at() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_supabase_url(&mock_server.uri()).to_app_config();

    Mock::given(method("GET"))
        .and(path("/rest/v1/profiles"))
        .and(query_param("id", "eq.u1"))
        .and(query_param("order", "updated_at.desc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::profile_row("u1", "obgyn")
        ])))
        .mount(&mock_server)
        .await;

    let loader = SupabaseSnapshotLoader::new(&config);
    let filter = FeedSpec::profiles().filter_for(&Subject::from("u1"));
    let rows = loader.load(&filter, "user-jwt").await.unwrap();

    assert_eq!(rows[0]["role"], "obgyn");
}

#[tokio::test]
async fn test_unauthorized_snapshot_is_fetch_error() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_supabase_url(&mock_server.uri()).to_app_config();

    Mock::given(method("GET"))
        .and(path("/rest/v1/notifications"))
        .respond_with(ResponseTemplate::new(401).set_body_json(
            MockSupabaseResponses::error_response("JWT expired", "PGRST301"),
        ))
        .mount(&mock_server)
        .await;

    let loader = SupabaseSnapshotLoader::new(&config);
    let result = loader.load(&notifications_filter("u1"), "expired").await;

    assert_matches!(result, Err(SyncError::Fetch(message)) if message.contains("Authentication"));
}

#[tokio::test]
async fn test_unreachable_backend_is_fetch_error() {
    let config = TestConfig::with_supabase_url("http://127.0.0.1:9").to_app_config();

    let loader = SupabaseSnapshotLoader::new(&config);
    let result = loader.load(&notifications_filter("u1"), "user-jwt").await;

    assert_matches!(result, Err(SyncError::Fetch(_)));
}

#[tokio::test]
async fn test_session_over_rest_snapshot() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_supabase_url(&mock_server.uri()).to_app_config();

    Mock::given(method("GET"))
        .and(path("/rest/v1/notifications"))
        .and(query_param("recipient_id", "eq.u1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::notification_row("n1", "u1", false)
        ])))
        .mount(&mock_server)
        .await;

    let source = BroadcastEventSource::new();
    let sources = SyncSources::new(
        Arc::new(SupabaseSnapshotLoader::new(&config)),
        Arc::new(source.clone()),
        test_settings(),
    );
    let manager = SubscriptionManager::new(FeedSpec::notifications(), sources);
    let subject = Subject::from("u1");

    let view = manager.start(&subject, "user-jwt").await;
    let state = wait_for(&view, |s| s.state == SessionState::Live).await;
    assert!(state.snapshot_loaded);
    assert_eq!(view.unread_count(), 1);

    let filter = manager.feed().filter_for(&subject);
    source
        .publish(&filter, RawChange::update(MockSupabaseResponses::notification_row("n1", "u1", true)))
        .await;
    wait_for(&view, |s| s.entities.iter().all(|e| e.flag("is_read") == Some(true))).await;
    assert_eq!(view.unread_count(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_slow_rest_snapshot_times_out() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_supabase_url(&mock_server.uri()).to_app_config();

    Mock::given(method("GET"))
        .and(path("/rest/v1/notifications"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&mock_server)
        .await;

    let sources = SyncSources::new(
        Arc::new(SupabaseSnapshotLoader::new(&config)),
        Arc::new(BroadcastEventSource::new()),
        test_settings(),
    );
    let manager = SubscriptionManager::new(FeedSpec::notifications(), sources);

    let view = manager.start(&Subject::from("u1"), "user-jwt").await;
    let state = wait_for(&view, |s| s.state == SessionState::Live).await;

    assert!(!state.snapshot_loaded);
    assert!(view.is_empty());

    manager.shutdown().await;
}
