// Session manager reconciliation, query, and command tests

mod common;

use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use auto::agent::{Agent, Event, EventKind, Metrics, SpawnConfig, Status};
use auto::config::Config;
use auto::provider::{ProviderError, Registry};
use auto::session::{GroupMode, Manager};
use auto::store::Store;

use common::{make_agent, wait_for, MockProvider};

struct Fixture {
    manager: Arc<Manager>,
    provider: Arc<MockProvider>,
    store: Store,
    scope: CancellationToken,
    _temp: TempDir,
}

async fn start_manager(agents: Vec<Agent>) -> Fixture {
    let temp = TempDir::new().unwrap();
    let store = Store::open(temp.path().join("test.db")).unwrap();

    let provider = Arc::new(MockProvider::new("mock"));
    for agent in agents {
        provider.add_agent(agent);
    }

    let registry = Arc::new(Registry::new());
    registry.register(provider.clone());

    let manager = Arc::new(Manager::new(
        Config::default(),
        Some(store.clone()),
        registry,
        None,
    ));

    let scope = CancellationToken::new();
    Arc::clone(&manager).start(&scope).await.unwrap();

    Fixture {
        manager,
        provider,
        store,
        scope,
        _temp: temp,
    }
}

#[tokio::test]
async fn startup_discovery_fills_live_map_and_store() {
    let fixture = start_manager(vec![
        make_agent("ses_A", "frontend-dev", Status::Running),
        make_agent("ses_B", "backend-api", Status::Idle),
    ])
    .await;

    assert_eq!(fixture.manager.list().len(), 2);
    assert!(fixture.manager.get("ses_A").is_some());

    let row = fixture.store.sessions().get("ses_A").await.unwrap().unwrap();
    assert_eq!(row.status, "running");
    assert_eq!(row.agent_name, "frontend-dev");
}

#[tokio::test]
async fn discovered_event_inserts_agent() {
    let fixture = start_manager(vec![]).await;

    let agent = make_agent("ses_new", "newcomer", Status::Running);
    fixture
        .provider
        .send_event(Event::new(EventKind::Discovered, &agent))
        .await;

    assert!(wait_for(|| fixture.manager.get("ses_new").is_some()).await);
}

#[tokio::test]
async fn terminated_event_removes_agent() {
    let agent = make_agent("ses_A", "frontend-dev", Status::Running);
    let fixture = start_manager(vec![agent.clone()]).await;

    fixture
        .provider
        .send_event(Event::new(EventKind::Terminated, &agent))
        .await;

    assert!(wait_for(|| fixture.manager.get("ses_A").is_none()).await);
}

#[tokio::test]
async fn updated_event_projects_to_store() {
    let agent = make_agent("ses_A", "frontend-dev", Status::Running);
    let fixture = start_manager(vec![agent.clone()]).await;

    agent.set_status(Status::Idle);
    fixture
        .provider
        .send_event(Event::new(EventKind::Updated, &agent))
        .await;

    let mut projected = false;
    for _ in 0..100 {
        let row = fixture.store.sessions().get("ses_A").await.unwrap();
        if row.map(|r| r.status == "idle").unwrap_or(false) {
            projected = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(projected, "store never reflected the idle status");
}

#[tokio::test]
async fn output_event_appends_chunk() {
    let agent = make_agent("ses_A", "frontend-dev", Status::Running);
    let fixture = start_manager(vec![agent.clone()]).await;

    agent.append_output(b"hello from the agent\n");
    fixture
        .provider
        .send_event(Event::new(EventKind::Output, &agent))
        .await;

    let mut appended = false;
    for _ in 0..100 {
        let output = fixture.store.sessions().get_output("ses_A").await.unwrap();
        if output.contains("hello from the agent") {
            appended = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(appended, "output chunk never reached the store");
}

#[tokio::test]
async fn search_is_case_insensitive_substring() {
    let fixture = start_manager(vec![
        make_agent("ses_1", "frontend-dev", Status::Running),
        make_agent("ses_2", "backend-api", Status::Running),
        make_agent("ses_3", "database-worker", Status::Running),
    ])
    .await;

    let hits = fixture.manager.search("END");
    let mut names: Vec<String> = hits.iter().map(|a| a.name()).collect();
    names.sort();
    assert_eq!(names, vec!["backend-api", "frontend-dev"]);
}

#[tokio::test]
async fn filter_counts_match() {
    let fixture = start_manager(vec![
        make_agent("ses_1", "a", Status::Running),
        make_agent("ses_2", "b", Status::Idle),
        make_agent("ses_3", "c", Status::Running),
    ])
    .await;

    assert_eq!(fixture.manager.filter_by_status(Status::Running).len(), 2);
    assert_eq!(fixture.manager.active_count(), 2);
    assert_eq!(fixture.manager.stats().total, 3);
}

#[tokio::test]
async fn stats_totals_are_consistent() {
    let a = make_agent("ses_1", "a", Status::Running);
    a.set_metrics(Metrics {
        tokens_in: 100,
        tokens_out: 50,
        tool_calls: 3,
        ..Metrics::default()
    });
    let b = make_agent("ses_2", "b", Status::Errored);
    b.set_metrics(Metrics {
        tokens_in: 10,
        error_count: 1,
        ..Metrics::default()
    });

    let fixture = start_manager(vec![a, b]).await;
    let stats = fixture.manager.stats();

    assert_eq!(stats.total, 2);
    let by_status_sum: usize = stats.by_status.values().sum();
    assert_eq!(by_status_sum, stats.total);
    assert_eq!(stats.total, fixture.manager.list().len());
    assert_eq!(stats.total_tokens_in, 110);
    assert_eq!(stats.total_tool_calls, 3);
    assert_eq!(stats.total_errors, 1);
}

#[tokio::test]
async fn parent_child_queries() {
    let parent = make_agent("ses_parent", "parent", Status::Running);
    let child1 = make_agent("ses_c1", "child-one", Status::Running);
    child1.set_parent_id("ses_parent");
    let child2 = make_agent("ses_c2", "child-two", Status::Idle);
    child2.set_parent_id("ses_parent");

    let fixture = start_manager(vec![parent, child1, child2]).await;

    let primary = fixture.manager.list_primary();
    assert_eq!(primary.len(), 1);
    assert_eq!(primary[0].id(), "ses_parent");

    // Every agent is either primary or a child, never both
    for agent in fixture.manager.list() {
        assert_eq!(
            agent.parent_id().is_empty(),
            primary.iter().any(|p| p.id() == agent.id())
        );
    }

    let children = fixture.manager.children("ses_parent");
    assert_eq!(children.len(), 2);
    assert_eq!(
        fixture.manager.child_count("ses_parent"),
        children.len()
    );
    for child in &children {
        assert_eq!(child.parent_id(), "ses_parent");
    }
}

#[tokio::test]
async fn group_by_modes() {
    let a = make_agent("ses_1", "a", Status::Running);
    a.set_project_id("proj-x");
    let b = make_agent("ses_2", "b", Status::Idle);
    b.set_project_id("proj-x");
    let c = make_agent("ses_3", "c", Status::Running);
    c.set_project_id("proj-y");

    let fixture = start_manager(vec![a, b, c]).await;

    let flat = fixture.manager.group_by(GroupMode::Flat);
    assert_eq!(flat.len(), 1);
    assert_eq!(flat[0].name, "all");
    assert_eq!(flat[0].agents.len(), 3);

    let by_project = fixture.manager.group_by(GroupMode::Project);
    assert_eq!(by_project.len(), 2);

    let by_status = fixture.manager.group_by(GroupMode::Status);
    let running = by_status.iter().find(|g| g.name == "running").unwrap();
    assert_eq!(running.agents.len(), 2);
}

#[tokio::test]
async fn spawn_falls_back_to_first_provider() {
    let fixture = start_manager(vec![]).await;

    let agent = fixture
        .manager
        .spawn(SpawnConfig {
            kind: "no-such-kind".to_string(),
            name: "spawned".to_string(),
            directory: "/tmp".to_string(),
            ..SpawnConfig::default()
        })
        .await
        .unwrap();

    assert_eq!(agent.kind(), "mock");
    assert!(fixture.manager.get(agent.id()).is_some());
}

#[tokio::test]
async fn spawn_with_no_providers_errors() {
    let registry = Arc::new(Registry::new());
    let manager = Arc::new(Manager::new(Config::default(), None, registry, None));

    let err = manager
        .spawn(SpawnConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Unavailable(_)));
}

#[tokio::test]
async fn terminate_latches_cancelled_and_persists() {
    let agent = make_agent("ses_A", "frontend-dev", Status::Running);
    let fixture = start_manager(vec![agent.clone()]).await;

    fixture.manager.terminate("ses_A").await.unwrap();

    assert_eq!(agent.status(), Status::Cancelled);
    assert_eq!(
        fixture.provider.terminated.lock().unwrap().as_slice(),
        &["ses_A".to_string()]
    );

    // Later status changes are ignored for a cancelled agent
    agent.set_status(Status::Running);
    assert_eq!(agent.status(), Status::Cancelled);

    let row = fixture.store.sessions().get("ses_A").await.unwrap().unwrap();
    assert_eq!(row.status, "cancelled");
}

#[tokio::test]
async fn unknown_ids_are_soft_no_ops() {
    let fixture = start_manager(vec![]).await;

    fixture.manager.terminate("nope").await.unwrap();
    fixture.manager.send_input("nope", "hello").await.unwrap();
    assert!(fixture.provider.inputs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn send_input_delegates_to_provider() {
    let fixture = start_manager(vec![make_agent("ses_A", "a", Status::Running)]).await;

    fixture.manager.send_input("ses_A", "do the thing").await.unwrap();

    assert_eq!(
        fixture.provider.inputs.lock().unwrap().as_slice(),
        &[("ses_A".to_string(), "do the thing".to_string())]
    );
}

#[tokio::test]
async fn refresh_evicts_agents_not_returned() {
    let kept = make_agent("ses_kept", "kept", Status::Running);
    let fixture = start_manager(vec![kept]).await;

    // An agent that arrived by event but is not in the provider's set
    let transient = make_agent("ses_transient", "transient", Status::Running);
    fixture
        .provider
        .send_event(Event::new(EventKind::Discovered, &transient))
        .await;
    assert!(wait_for(|| fixture.manager.get("ses_transient").is_some()).await);

    fixture.manager.refresh().await.unwrap();

    let ids: Vec<String> = fixture
        .manager
        .list()
        .iter()
        .map(|a| a.id().to_string())
        .collect();
    assert_eq!(ids, vec!["ses_kept"]);
}

#[tokio::test]
async fn last_activity_time_is_max() {
    let older = make_agent("ses_old", "old", Status::Idle);
    older.set_last_activity(Utc::now() - chrono::Duration::minutes(10));
    let newer = make_agent("ses_new", "new", Status::Running);
    let newest = newer.last_activity();

    let fixture = start_manager(vec![older, newer]).await;

    assert_eq!(fixture.manager.last_activity_time(), Some(newest));
}

#[tokio::test]
async fn callback_fires_on_events() {
    let fixture = start_manager(vec![]).await;

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    fixture.manager.set_on_event(move |event| {
        seen_clone.lock().unwrap().push(event.agent_id.clone());
    });

    let agent = make_agent("ses_A", "a", Status::Running);
    fixture
        .provider
        .send_event(Event::new(EventKind::Discovered, &agent))
        .await;

    assert!(wait_for(|| !seen.lock().unwrap().is_empty()).await);
    assert_eq!(seen.lock().unwrap()[0], "ses_A");
}

#[tokio::test]
async fn cancellation_stops_reconciliation() {
    let fixture = start_manager(vec![]).await;

    fixture.scope.cancel();
    // Allow the reconciliation task to observe cancellation
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let agent = make_agent("ses_late", "late", Status::Running);
    fixture
        .provider
        .try_send_event(Event::new(EventKind::Discovered, &agent));

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(fixture.manager.get("ses_late").is_none());
}
