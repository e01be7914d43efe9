mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{depends_on, goal, props, urn, FakeProvider, Harness};
use serde_json::json;
use strata_core::{
    CustomTimeouts, HookType, OperationType, OutputReference, PendingOperation, PropertyValue, Snapshot,
};
use strata_engine::{
    ChangeKind, EngineConfig, EngineError, HookContext, HookRegistry, RunResult,
};
use strata_storage::MemoryStore;
use tokio_util::sync::CancellationToken;

fn shop() -> Vec<strata_core::Goal> {
    vec![
        goal("db", json!({"size": 1})),
        depends_on(goal("app", json!({"image": "v1"})), &["db"]),
    ]
}

#[tokio::test]
async fn first_deploy_creates_everything_in_order() {
    let h = Harness::new();
    let run = h.deploy(shop()).await;

    let summary = run.summary();
    assert_eq!(summary.result, RunResult::Succeeded);
    assert_eq!(summary.count(ChangeKind::Create), 2);
    assert_eq!(h.provider.calls_of("create"), vec!["create db", "create app"]);

    let snapshot = h.snapshot().unwrap();
    assert_eq!(h.names(), vec!["db", "app"]);
    assert_eq!(snapshot.resources[0].id.as_deref(), Some("db-1"));
    assert!(snapshot.pending_operations.is_empty());
    assert!(snapshot.manifest.time.is_some());

    let json = run.json();
    assert_eq!(json.first().unwrap()["type"], "prelude");
    assert_eq!(json.last().unwrap()["type"], "summary");
    let sequences: Vec<u64> = run.events.iter().map(|e| e.sequence).collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn unchanged_redeploy_makes_no_calls_and_no_writes() {
    let h = Harness::new();
    h.deploy(shop()).await;
    let saves = h.store.save_count();
    h.provider.clear_calls();

    let run = h.deploy(shop()).await;

    assert_eq!(run.summary().count(ChangeKind::Same), 2);
    assert!(!run.summary().has_changes());
    assert!(h.provider.calls().is_empty());
    assert_eq!(h.store.save_count(), saves);
}

#[tokio::test]
async fn changed_input_updates_in_place() {
    let h = Harness::new();
    h.deploy(shop()).await;
    h.provider.clear_calls();

    let run = h
        .deploy(vec![
            goal("db", json!({"size": 2})),
            depends_on(goal("app", json!({"image": "v1"})), &["db"]),
        ])
        .await;

    assert_eq!(run.summary().count(ChangeKind::Update), 1);
    assert_eq!(run.summary().count(ChangeKind::Same), 1);
    assert_eq!(h.provider.calls_of("update"), vec!["update db"]);
    let snapshot = h.snapshot().unwrap();
    assert_eq!(snapshot.resources[0].inputs["size"], PropertyValue::from(2_i64));
    assert_eq!(snapshot.resources[0].id.as_deref(), Some("db-1"));
}

#[tokio::test]
async fn protected_resource_blocks_the_whole_run() {
    let h = Harness::new();
    let mut db = goal("db", json!({"size": 1}));
    db.protect = true;
    h.deploy(vec![db, goal("cache", json!({}))]).await;
    let saves = h.store.save_count();
    h.provider.clear_calls();

    let run = h.deploy(vec![goal("cache", json!({}))]).await;

    match &run.result {
        Err(EngineError::Protected { urns }) => assert_eq!(urns, &vec![urn("db")]),
        other => panic!("expected protection error, got {other:?}"),
    }
    assert_eq!(h.store.save_count(), saves);
    assert!(h.provider.calls_of("delete").is_empty());
    let last = run.json().pop().unwrap();
    assert_eq!(last["type"], "summary");
    assert_eq!(last["result"], "failed");
}

#[tokio::test]
async fn replace_on_changes_with_delete_before_replace() {
    let h = Harness::new();
    let db = |engine: &str| {
        let mut g = goal("db", json!({"engine": engine, "name": "main"}));
        g.replace_on_changes = vec!["engine".into()];
        g.delete_before_replace = Some(true);
        g
    };
    h.deploy(vec![db("14")]).await;
    h.provider.clear_calls();

    let run = h.deploy(vec![db("15")]).await;

    assert_eq!(run.summary().count(ChangeKind::Replace), 1);
    assert_eq!(
        h.provider.calls(),
        vec!["check db", "diff db", "delete db", "create db"]
    );
    let snapshot = h.snapshot().unwrap();
    assert_eq!(snapshot.resources.len(), 1);
    assert_eq!(snapshot.resources[0].id.as_deref(), Some("db-2"));
    assert!(!snapshot.resources[0].delete);
}

#[tokio::test]
async fn dependents_of_a_delete_first_replacement_are_deleted_first_too() {
    let h = Harness::new();
    let stack = |engine: &str| {
        let mut db = goal("db", json!({"engine": engine}));
        db.replace_on_changes = vec!["engine".into()];
        db.delete_before_replace = Some(true);
        let mut app = depends_on(goal("app", json!({"engine": engine})), &["db"]);
        app.replace_on_changes = vec!["engine".into()];
        vec![db, app]
    };
    h.deploy(stack("14")).await;
    h.provider.clear_calls();

    let run = h.deploy(stack("15")).await;

    let summary = run.summary();
    assert_eq!(summary.result, RunResult::Succeeded);
    assert_eq!(summary.count(ChangeKind::Replace), 2);
    let mutations: Vec<String> = h
        .provider
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("create ") || c.starts_with("delete "))
        .collect();
    assert_eq!(
        mutations,
        vec!["delete app", "delete db", "create db", "create app"]
    );
    let snapshot = h.snapshot().unwrap();
    assert_eq!(h.names(), vec!["db", "app"]);
    assert!(snapshot.resources.iter().all(|r| !r.delete));
}

#[tokio::test]
async fn provider_replacement_creates_before_deleting() {
    let h = Harness::new();
    h.provider.replace_on("engine", false);
    h.deploy(vec![goal("db", json!({"engine": "14"}))]).await;
    let saves_before = h.store.save_count();
    h.provider.clear_calls();

    let run = h.deploy(vec![goal("db", json!({"engine": "15"}))]).await;

    assert_eq!(run.summary().count(ChangeKind::Replace), 1);
    assert_eq!(h.provider.calls_of("create"), vec!["create db"]);
    assert_eq!(h.provider.calls_of("delete"), vec!["delete db"]);
    let calls = h.provider.calls();
    let create = calls.iter().position(|c| c == "create db").unwrap();
    let delete = calls.iter().position(|c| c == "delete db").unwrap();
    assert!(create < delete);

    // In between, the old resource was kept and flagged for deletion.
    let history = h.store.history();
    assert!(history[saves_before..].iter().any(|s| {
        s.resources.len() == 2 && !s.resources[0].delete && s.resources[1].delete
    }));
    assert_eq!(h.names(), vec!["db"]);
}

#[tokio::test]
async fn ignored_changes_do_not_produce_updates() {
    let h = Harness::new();
    let db = |owner: &str| {
        let mut g = goal("db", json!({"size": 1, "tags": {"owner": owner}}));
        g.ignore_changes = vec!["tags.owner".into()];
        g
    };
    h.deploy(vec![db("ops")]).await;
    h.provider.clear_calls();

    let run = h.deploy(vec![db("someone-else")]).await;

    assert_eq!(run.summary().count(ChangeKind::Same), 1);
    assert!(h.provider.calls().is_empty());
}

#[tokio::test]
async fn failure_skips_dependents_but_not_siblings() {
    let h = Harness::new();
    h.provider.fail_create("db");
    let mut goals = shop();
    goals.push(goal("cache", json!({})));

    let run = h.deploy(goals).await;

    let summary = run.summary();
    assert_eq!(summary.result, RunResult::Failed);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.count(ChangeKind::Create), 1);
    assert_eq!(run.post_status("db").as_deref(), Some("failed"));
    assert_eq!(run.post_status("app").as_deref(), Some("skipped"));
    assert_eq!(run.post_status("cache").as_deref(), Some("succeeded"));
    assert_eq!(h.names(), vec!["cache"]);
}

#[tokio::test]
async fn partially_created_resource_is_recorded_and_repaired() {
    let h = Harness::new();
    h.provider.partial_create("db");

    let run = h.deploy(vec![goal("db", json!({"size": 1}))]).await;
    assert_eq!(run.summary().failed, 1);
    let snapshot = h.snapshot().unwrap();
    assert_eq!(snapshot.resources[0].id.as_deref(), Some("db-1"));
    assert!(!snapshot.resources[0].init_errors.is_empty());

    h.provider.clear_calls();
    let run = h.deploy(vec![goal("db", json!({"size": 1}))]).await;
    assert_eq!(run.summary().count(ChangeKind::Update), 1);
    assert_eq!(h.provider.calls_of("update"), vec!["update db"]);
    assert!(h.snapshot().unwrap().resources[0].init_errors.is_empty());
}

#[tokio::test]
async fn check_failures_abort_before_any_change() {
    let h = Harness::new();
    h.provider.reject("db");

    let run = h.deploy(shop()).await;

    match &run.result {
        Err(EngineError::CheckFailed { urn: failed, failures }) => {
            assert_eq!(failed, &urn("db"));
            assert_eq!(failures, &vec!["size: must be positive".to_string()]);
        }
        other => panic!("expected check failure, got {other:?}"),
    }
    assert_eq!(h.store.save_count(), 0);
    assert!(h.provider.calls_of("create").is_empty());
}

#[tokio::test]
async fn preview_plans_without_side_effects() {
    let h = Harness::new();

    let run = h.preview(shop()).await;

    assert_eq!(run.summary().count(ChangeKind::Create), 2);
    assert_eq!(h.store.save_count(), 0);
    assert!(h.provider.calls_of("create").is_empty());
    let pre: Vec<_> = run
        .json()
        .into_iter()
        .filter(|e| e["type"] == "resource_pre")
        .collect();
    assert_eq!(pre.len(), 2);
    assert!(pre.iter().all(|e| e["preview"] == true));
}

#[tokio::test]
async fn destroy_deletes_dependents_first() {
    let h = Harness::new();
    h.deploy(shop()).await;
    h.provider.clear_calls();

    let run = h.destroy().await;

    assert_eq!(run.summary().count(ChangeKind::Delete), 2);
    assert_eq!(h.provider.calls_of("delete"), vec!["delete app", "delete db"]);
    assert!(h.snapshot().unwrap().resources.is_empty());
    assert!(h.provider.live().is_empty());
}

#[tokio::test]
async fn retained_resources_are_only_forgotten() {
    let h = Harness::new();
    let mut db = goal("db", json!({"size": 1}));
    db.retain_on_delete = true;
    h.deploy(vec![db]).await;
    h.provider.clear_calls();

    let run = h.deploy(Vec::new()).await;

    assert_eq!(run.summary().count(ChangeKind::Delete), 1);
    assert!(h.provider.calls_of("delete").is_empty());
    assert!(h.names().is_empty());
    assert_eq!(h.provider.live().len(), 1);
    let pre = run
        .json()
        .into_iter()
        .find(|e| e["type"] == "resource_pre")
        .unwrap();
    assert_eq!(pre["step"]["retain"], true);
}

#[tokio::test]
async fn deleted_with_skips_the_provider_delete() {
    let h = Harness::new();
    let mut object = goal("object", json!({"key": "index.html"}));
    object.deleted_with = Some(urn("bucket"));
    h.deploy(vec![goal("bucket", json!({})), object]).await;
    h.provider.clear_calls();

    let run = h.destroy().await;

    assert_eq!(run.summary().count(ChangeKind::Delete), 2);
    assert_eq!(h.provider.calls_of("delete"), vec!["delete bucket"]);
    assert!(h.names().is_empty());
}

#[tokio::test]
async fn secrets_never_reach_events_in_clear() {
    let h = Harness::new();
    let mut db = goal("db", json!({"user": "admin"}));
    db.properties.insert(
        "password".into(),
        PropertyValue::secret(PropertyValue::string("hunter2")),
    );
    db.additional_secret_outputs = vec!["arn".into()];

    let run = h.deploy(vec![db]).await;

    let text = serde_json::to_string(&run.json()).unwrap();
    assert!(!text.contains("hunter2"));
    assert!(!text.contains("arn:test:db"));
    let snapshot = h.snapshot().unwrap();
    let outputs = &snapshot.resources[0].outputs;
    assert!(outputs["password"].is_secret());
    assert!(outputs["arn"].is_secret());
    assert!(!outputs["user"].is_secret());
}

#[tokio::test]
async fn outputs_of_new_dependencies_are_resolved_at_execution() {
    let h = Harness::new();
    let mut app = depends_on(goal("app", json!({})), &["db"]);
    app.properties.insert(
        "db_arn".into(),
        PropertyValue::Output(OutputReference {
            urn: urn("db"),
            property: "arn".into(),
        }),
    );

    h.deploy(vec![goal("db", json!({"size": 1})), app]).await;

    let snapshot = h.snapshot().unwrap();
    assert_eq!(
        snapshot.resources[1].inputs["db_arn"],
        PropertyValue::string("arn:test:db:db-1")
    );
}

#[tokio::test]
async fn alias_carries_state_over_to_a_new_name() {
    let h = Harness::new();
    h.deploy(vec![goal("old-name", json!({"size": 1}))]).await;
    h.provider.clear_calls();

    let mut renamed = goal("new-name", json!({"size": 1}));
    renamed.aliases = vec![urn("old-name")];
    let run = h.deploy(vec![renamed]).await;

    assert_eq!(run.summary().count(ChangeKind::Same), 1);
    assert!(h.provider.calls().is_empty());
    assert_eq!(h.names(), vec!["new-name"]);
}

#[tokio::test]
async fn hooks_run_around_operations() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut hooks = HookRegistry::new();
    {
        let log = log.clone();
        hooks.register("audit", move |ctx: HookContext| {
            let log = log.clone();
            async move {
                log.lock()
                    .unwrap()
                    .push(format!("{:?} {}", ctx.hook_type, ctx.urn.name()));
                Ok::<(), String>(())
            }
        });
    }
    hooks.register("deny", |_ctx: HookContext| async {
        Err::<(), String>("not allowed".to_string())
    });
    let h = Harness::new().hooks(hooks);

    let mut a = goal("a", json!({}));
    a.hooks.insert(HookType::BeforeCreate, vec!["audit".into()]);
    a.hooks.insert(HookType::AfterCreate, vec!["deny".into()]);
    let mut b = goal("b", json!({}));
    b.hooks.insert(HookType::BeforeCreate, vec!["deny".into()]);

    let run = h.deploy(vec![a, b]).await;

    assert_eq!(*log.lock().unwrap(), vec!["BeforeCreate a".to_string()]);
    assert_eq!(run.post_status("a").as_deref(), Some("succeeded"));
    assert_eq!(run.post_status("b").as_deref(), Some("failed"));
    assert_eq!(h.provider.calls_of("create"), vec!["create a"]);
    assert!(
        run.diagnostics("warning")
            .iter()
            .any(|m| m.contains("not allowed"))
    );
}

#[tokio::test]
async fn unknown_hook_is_rejected_up_front() {
    let h = Harness::new();
    let mut a = goal("a", json!({}));
    a.hooks.insert(HookType::BeforeCreate, vec!["missing".into()]);

    let run = h.deploy(vec![a]).await;

    assert!(matches!(run.result, Err(EngineError::UnknownHook { .. })));
    assert_eq!(h.store.save_count(), 0);
}

#[tokio::test]
async fn persistence_failure_halts_before_touching_providers() {
    let h = Harness::new();
    h.store.fail_saves(true);

    let run = h.deploy(shop()).await;

    assert!(matches!(run.result, Err(EngineError::Storage(_))));
    assert!(h.provider.calls_of("create").is_empty());
}

#[tokio::test]
async fn cancellation_records_in_flight_work_and_skips_the_rest() {
    let h = Harness::new();
    h.provider.slow("db", Duration::from_millis(200));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let run = h.deploy_with(shop(), &cancel).await;

    let summary = run.summary();
    assert!(summary.cancelled);
    assert_eq!(summary.result, RunResult::Failed);
    assert_eq!(run.post_status("db").as_deref(), Some("failed"));
    assert_eq!(run.post_status("app").as_deref(), Some("skipped"));
    assert_eq!(h.provider.calls_of("create"), vec!["create db"]);
    assert_eq!(h.names(), vec!["db"]);
}

#[tokio::test]
async fn parallelism_of_one_still_completes() {
    let store = Arc::new(MemoryStore::new());
    let config = EngineConfig {
        parallelism: 1,
        ..EngineConfig::default()
    };
    let h = Harness::build(store, FakeProvider::new(), config);
    let goals: Vec<_> = (0..5)
        .map(|n| goal(&format!("r{n}"), json!({"n": n})))
        .collect();

    let run = h.deploy(goals).await;

    assert_eq!(run.summary().count(ChangeKind::Create), 5);
    assert_eq!(
        h.provider.calls_of("create"),
        vec!["create r0", "create r1", "create r2", "create r3", "create r4"]
    );
    assert_eq!(h.provider.peak_in_flight(), 1);
}

#[tokio::test]
async fn interrupted_operations_are_reported_and_cleared() {
    let mut prior = Snapshot::default();
    prior.pending_operations.push(PendingOperation {
        urn: urn("db"),
        op: OperationType::Creating,
        id: None,
        started: jiff::Timestamp::now(),
    });
    let h = Harness::with_store(MemoryStore::with_snapshot(&prior).unwrap());

    let run = h.deploy(Vec::new()).await;

    assert_eq!(run.summary().result, RunResult::Succeeded);
    assert!(
        run.diagnostics("warning")
            .iter()
            .any(|m| m.contains("interrupted"))
    );
    assert!(h.snapshot().unwrap().pending_operations.is_empty());
}

#[tokio::test]
async fn refresh_picks_up_drift_and_drops_vanished_resources() {
    let h = Harness::new();
    h.deploy(vec![
        goal("db", json!({"size": 1})),
        goal("cache", json!({})),
    ])
    .await;
    let snapshot = h.snapshot().unwrap();
    let db_id = snapshot.resources[0].id.clone().unwrap();
    let cache_id = snapshot.resources[1].id.clone().unwrap();
    h.provider.vanish(&cache_id);
    h.provider.drift(&db_id, props(json!({"size": 3})));

    let run = h.refresh().await;

    assert_eq!(run.summary().count(ChangeKind::Read), 2);
    assert_eq!(h.names(), vec!["db"]);
    assert_eq!(
        h.snapshot().unwrap().resources[0].outputs["size"],
        PropertyValue::from(3_i64)
    );
}

#[tokio::test(start_paused = true)]
async fn timed_out_create_stays_pending_for_the_next_run() {
    let h = Harness::new();
    h.provider.slow("db", Duration::from_secs(3));
    let mut db = goal("db", json!({"size": 1}));
    db.custom_timeouts = CustomTimeouts {
        create: Some(1),
        ..CustomTimeouts::default()
    };

    let run = h.deploy(vec![db]).await;

    assert_eq!(run.summary().result, RunResult::Failed);
    assert_eq!(run.post_status("db").as_deref(), Some("failed"));
    let snapshot = h.snapshot().unwrap();
    assert!(snapshot.resources.is_empty());
    assert_eq!(snapshot.pending_operations.len(), 1);
    assert_eq!(snapshot.pending_operations[0].urn, urn("db"));
    assert_eq!(snapshot.pending_operations[0].op, OperationType::Creating);

    let next = h.deploy(Vec::new()).await;

    assert!(
        next.diagnostics("warning")
            .iter()
            .any(|m| m.contains("interrupted"))
    );
    assert!(h.snapshot().unwrap().pending_operations.is_empty());
}

#[tokio::test]
async fn independent_creates_run_concurrently_up_to_the_limit() {
    let store = Arc::new(MemoryStore::new());
    let config = EngineConfig {
        parallelism: 3,
        ..EngineConfig::default()
    };
    let h = Harness::build(store, FakeProvider::new(), config);
    let goals: Vec<_> = (0..8)
        .map(|n| goal(&format!("r{n}"), json!({"n": n})))
        .collect();
    for n in 0..8 {
        h.provider.slow(&format!("r{n}"), Duration::from_millis(40));
    }

    let run = h.deploy(goals).await;

    assert_eq!(run.summary().count(ChangeKind::Create), 8);
    let peak = h.provider.peak_in_flight();
    assert!(peak > 1, "creates never overlapped");
    assert!(peak <= 3, "{peak} creates ran at once with a limit of 3");
}
