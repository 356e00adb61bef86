// Store round-trip and cleanup tests

use chrono::{Duration, Utc};
use tempfile::TempDir;

use auto::store::{AlertRecord, MetricRecord, SessionRecord, Store};

fn create_test_store() -> (Store, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::open(temp_dir.path().join("test.db")).unwrap();
    (store, temp_dir)
}

fn session_record(id: &str) -> SessionRecord {
    SessionRecord {
        id: id.to_string(),
        agent_id: id.to_string(),
        agent_type: "opencode".to_string(),
        agent_name: "Fix bug".to_string(),
        directory: "/work".to_string(),
        project_id: "global".to_string(),
        status: "running".to_string(),
        start_time: Utc::now() - Duration::hours(1),
        end_time: None,
        last_activity: Some(Utc::now()),
        tokens_in: 1000,
        tokens_out: 500,
        estimated_cost: 0.01,
        tool_calls: 5,
        error_count: 0,
        output: None,
        metadata: None,
    }
}

#[tokio::test]
async fn save_and_get_session_round_trips() {
    let (store, _temp) = create_test_store();
    let rec = session_record("ses_A");

    store.sessions().save(&rec).await.unwrap();
    let loaded = store.sessions().get("ses_A").await.unwrap().unwrap();

    assert_eq!(loaded.id, rec.id);
    assert_eq!(loaded.agent_name, rec.agent_name);
    assert_eq!(loaded.status, rec.status);
    assert_eq!(loaded.tokens_in, rec.tokens_in);
    assert_eq!(loaded.start_time, rec.start_time);
    assert!(loaded.end_time.is_none());
}

#[tokio::test]
async fn get_missing_session_is_none() {
    let (store, _temp) = create_test_store();
    assert!(store.sessions().get("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn upsert_replaces_mutable_fields_but_not_start_time() {
    let (store, _temp) = create_test_store();
    let rec = session_record("ses_A");
    store.sessions().save(&rec).await.unwrap();

    let mut updated = rec.clone();
    updated.status = "idle".to_string();
    updated.tokens_in = 2000;
    updated.start_time = Utc::now(); // must be ignored on conflict
    store.sessions().save(&updated).await.unwrap();

    let loaded = store.sessions().get("ses_A").await.unwrap().unwrap();
    assert_eq!(loaded.status, "idle");
    assert_eq!(loaded.tokens_in, 2000);
    assert_eq!(loaded.start_time, rec.start_time);

    let all = store.sessions().list(0, None).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn list_sessions_filters_by_status() {
    let (store, _temp) = create_test_store();

    let mut running = session_record("ses_A");
    running.status = "running".to_string();
    store.sessions().save(&running).await.unwrap();

    let mut idle = session_record("ses_B");
    idle.status = "idle".to_string();
    store.sessions().save(&idle).await.unwrap();

    let running_only = store.sessions().list(0, Some("running")).await.unwrap();
    assert_eq!(running_only.len(), 1);
    assert_eq!(running_only[0].id, "ses_A");

    let all = store.sessions().list(0, None).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn output_chunks_concatenate_in_order() {
    let (store, _temp) = create_test_store();
    store.sessions().save(&session_record("ses_A")).await.unwrap();

    store.sessions().append_output("ses_A", "first ").await.unwrap();
    store.sessions().append_output("ses_A", "second").await.unwrap();

    let output = store.sessions().get_output("ses_A").await.unwrap();
    assert_eq!(output, "first second");

    assert_eq!(store.sessions().get_output("ses_B").await.unwrap(), "");
}

#[tokio::test]
async fn alerts_round_trip_and_read_flags() {
    let (store, _temp) = create_test_store();

    let rec = AlertRecord {
        id: "alert-1".to_string(),
        agent_id: Some("ses_A".to_string()),
        level: "error".to_string(),
        message: "Agent Error: boom".to_string(),
        timestamp: Utc::now(),
        read: false,
        metadata: None,
    };
    store.alerts().save(&rec).await.unwrap();

    let listed = store.alerts().list(1, false).await.unwrap();
    assert_eq!(listed[0].id, "alert-1");
    assert_eq!(store.alerts().unread_count().await.unwrap(), 1);

    store.alerts().mark_read("alert-1").await.unwrap();
    let unread = store.alerts().list(0, true).await.unwrap();
    assert!(unread.iter().all(|a| a.id != "alert-1"));
    assert_eq!(store.alerts().unread_count().await.unwrap(), 0);
}

#[tokio::test]
async fn alerts_list_newest_first() {
    let (store, _temp) = create_test_store();

    for i in 0..3 {
        store
            .alerts()
            .save(&AlertRecord {
                id: format!("alert-{i}"),
                agent_id: None,
                level: "info".to_string(),
                message: "m".to_string(),
                timestamp: Utc::now() - Duration::minutes(10 - i),
                read: false,
                metadata: None,
            })
            .await
            .unwrap();
    }

    let listed = store.alerts().list(0, false).await.unwrap();
    assert_eq!(listed[0].id, "alert-2");
    assert_eq!(listed[2].id, "alert-0");
}

#[tokio::test]
async fn metrics_round_trip() {
    let (store, _temp) = create_test_store();

    let rec = MetricRecord {
        id: "m-1".to_string(),
        agent_id: "ses_A".to_string(),
        metric: "tokens_in".to_string(),
        value: 1000.0,
        timestamp: Utc::now(),
    };
    store.metrics().save(&rec).await.unwrap();

    let since = Utc::now() - Duration::hours(1);
    let points = store.metrics().get("ses_A", "tokens_in", since).await.unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].value, 1000.0);

    let other = store.metrics().get("ses_A", "tokens_out", since).await.unwrap();
    assert!(other.is_empty());
}

#[tokio::test]
async fn cleanup_zero_retains_active_sessions() {
    let (store, _temp) = create_test_store();

    // Active: no end_time, never deleted
    store.sessions().save(&session_record("ses_active")).await.unwrap();

    // Ended an hour ago, with an output chunk
    let mut ended = session_record("ses_ended");
    ended.status = "completed".to_string();
    ended.end_time = Some(Utc::now() - Duration::hours(1));
    store.sessions().save(&ended).await.unwrap();
    store.sessions().append_output("ses_ended", "bye").await.unwrap();

    store.cleanup(0).await.unwrap();

    assert!(store.sessions().get("ses_active").await.unwrap().is_some());
    assert!(store.sessions().get("ses_ended").await.unwrap().is_none());
    assert_eq!(store.sessions().get_output("ses_ended").await.unwrap(), "");
}

#[tokio::test]
async fn cleanup_respects_retention_horizon() {
    let (store, _temp) = create_test_store();

    let mut recent = session_record("ses_recent");
    recent.end_time = Some(Utc::now() - Duration::days(2));
    store.sessions().save(&recent).await.unwrap();

    let mut old = session_record("ses_old");
    old.end_time = Some(Utc::now() - Duration::days(40));
    store.sessions().save(&old).await.unwrap();

    store.cleanup(30).await.unwrap();

    assert!(store.sessions().get("ses_recent").await.unwrap().is_some());
    assert!(store.sessions().get("ses_old").await.unwrap().is_none());
}

#[tokio::test]
async fn stats_aggregate_over_projection() {
    let (store, _temp) = create_test_store();

    store.sessions().save(&session_record("ses_A")).await.unwrap();
    let mut second = session_record("ses_B");
    second.status = "idle".to_string();
    second.error_count = 2;
    store.sessions().save(&second).await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total_sessions, 2);
    assert_eq!(stats.sessions_by_status.get("running"), Some(&1));
    assert_eq!(stats.sessions_by_status.get("idle"), Some(&1));
    assert_eq!(stats.total_tokens_in, 2000);
    assert_eq!(stats.total_errors, 2);
}

#[tokio::test]
async fn export_json_contains_sections() {
    let (store, _temp) = create_test_store();
    store.sessions().save(&session_record("ses_A")).await.unwrap();

    let json = store.export_json().await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert!(value["sessions"].is_array());
    assert!(value["alerts"].is_array());
    assert!(value["statistics"].is_object());
}
