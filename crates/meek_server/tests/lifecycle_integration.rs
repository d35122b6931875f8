//! End-to-end lifecycle tests: the HTTP surface and the broker-side
//! handlers driving the full control plane over in-memory stores and a
//! recording bus.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use meek_core::memory::MemoryStores;
use meek_core::ports::{ModelStore, StatusCache, StreamProber, SubTaskStore, TaskStore};
use meek_core::proto::USER_STOP_MARKER;
use meek_core::types::{NodeStatus, SubTaskStatus};
use meek_server::router::build_router;
use meek_server::state::{AppState, ControlConfig, StorePorts};

struct AlwaysOnlineProber;

#[async_trait]
impl StreamProber for AlwaysOnlineProber {
    async fn probe(&self, _url: &str) -> bool {
        true
    }
}

struct Harness {
    app: Router,
    state: Arc<AppState>,
    stores: MemoryStores,
}

fn harness() -> Harness {
    let stores = MemoryStores::new();
    let cfg = ControlConfig::default();
    let message_queue = AppState::message_queue_for(&cfg);
    let state = AppState::build(
        StorePorts {
            tasks: stores.tasks(),
            subtasks: stores.subtasks(),
            nodes: stores.nodes(),
            streams: stores.streams(),
            models: stores.models(),
            cache: stores.cache(),
            results: stores.results(),
        },
        stores.bus(),
        message_queue,
        Arc::new(AlwaysOnlineProber),
        None,
        cfg,
    );
    let app = build_router(Arc::clone(&state));
    Harness { app, state, stores }
}

async fn post(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::post(path)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn get(app: &Router, path: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::get(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

/// Feed a broker message through the same router the queue workers use.
async fn bus_message(state: &AppState, topic: &str, payload: Value) {
    state.message_router.dispatch(topic, &payload).await;
}

async fn connect_node(state: &AppState, mac: &str, max_tasks: i32) {
    bus_message(
        state,
        "meek/connection",
        json!({
            "status": "online",
            "mac_address": mac,
            "client_id": format!("client-{mac}"),
            "service_type": "analysis",
            "timestamp": 1_700_000_000,
            "metadata": {
                "max_tasks": max_tasks,
                "ip": "10.0.0.9",
                "hostname": format!("edge-{mac}"),
                "resources": {"cpu": 10.0, "memory": 20.0}
            }
        }),
    )
    .await;
}

async fn seed_model_and_stream(h: &Harness) -> (i64, i64) {
    let model = h
        .stores
        .models()
        .upsert_by_code(meek_core::types::NewModel {
            code: "yolo-v8".into(),
            name: "yolo v8".into(),
            version: Some("1.0".into()),
            class_count: 80,
            classes: json!({"0": "person"}),
        })
        .await
        .unwrap();
    let (status, stream) = post(
        &h.app,
        "/streams/create",
        json!({"name": "gate-cam", "url": "rtsp://gate-cam/main"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    (model.id, stream["stream_id"].as_i64().unwrap())
}

async fn create_stream_task(h: &Harness, model_id: i64, stream_id: i64) -> i64 {
    let (status, body) = post(
        &h.app,
        "/tasks/create",
        json!({
            "name": "T1",
            "analysis_type": 3,
            "model_ids": [model_id],
            "stream_ids": [stream_id],
            "config": {},
            "save_result": false,
            "save_images": false,
            "analysis_interval": 1
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "create failed: {body}");
    body["task_id"].as_i64().unwrap()
}

#[tokio::test]
async fn test_happy_path_dispatch_and_acceptance() {
    let h = harness();
    connect_node(&h.state, "AA:01", 4).await;
    let (model_id, stream_id) = seed_model_and_stream(&h).await;
    let task_id = create_stream_task(&h, model_id, stream_id).await;

    let (status, body) = post(&h.app, "/tasks/start", json!({"task_id": task_id})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["dispatched"], 1);
    assert_eq!(body["status"], 1);

    // Exactly one start command, addressed to node AA:01, carrying the
    // stringified subtask id as the worker-side id.
    let published = h.stores.published().await;
    let start = published
        .iter()
        .find(|(t, _)| t == "meek/AA:01/request_setting")
        .expect("no start command published");
    assert_eq!(start.1["data"]["cmd_type"], "start_task");
    let sub = &h.stores.subtasks().list_for_task(task_id).await.unwrap()[0];
    assert_eq!(start.1["data"]["subtask_id"], sub.id.to_string());
    assert_eq!(start.1["data"]["source"]["type"], "stream");
    assert_eq!(
        start.1["data"]["result_config"]["callback_topic"],
        "meek/AA:01/result"
    );

    // Node replies success on the confirmation topic.
    let uuid = start.1["message_uuid"].as_str().unwrap();
    bus_message(
        &h.state,
        "meek/device_config_reply",
        json!({
            "message_uuid": uuid,
            "status": "success",
            "response_type": "cmd_reply",
            "mac_address": "AA:01",
            "data": {"cmd_type": "start_task", "task_id": task_id.to_string(),
                     "subtask_id": sub.id.to_string()}
        }),
    )
    .await;

    let (_, status_body) = post(&h.app, "/tasks/status", json!({"task_id": task_id})).await;
    assert_eq!(status_body["status"], 1);
    assert_eq!(status_body["active"], 1);
    assert_eq!(status_body["total"], 1);
}

#[tokio::test]
async fn test_subtask_completion_releases_node() {
    let h = harness();
    connect_node(&h.state, "AA:01", 4).await;
    let (model_id, stream_id) = seed_model_and_stream(&h).await;
    let task_id = create_stream_task(&h, model_id, stream_id).await;
    post(&h.app, "/tasks/start", json!({"task_id": task_id})).await;
    h.state.status.flush().await.unwrap();
    let sub = &h.stores.subtasks().list_for_task(task_id).await.unwrap()[0];

    bus_message(
        &h.state,
        "meek/AA:01/result",
        json!({
            "task_id": task_id.to_string(),
            "subtask_id": sub.id.to_string(),
            "status": "completed",
            "status_code": 200,
            "timestamp": 1_700_000_100
        }),
    )
    .await;

    let (_, body) = post(&h.app, "/tasks/status", json!({"task_id": task_id})).await;
    assert_eq!(body["status"], 3);
    assert_eq!(body["active"], 0);

    let sub = h.stores.subtasks().get(sub.id).await.unwrap().unwrap();
    assert!(sub.completed_at.is_some());

    let node = h.state.registry.get_by_mac("AA:01").await.unwrap().unwrap();
    assert_eq!(node.stream_task_count, 0);
}

#[tokio::test]
async fn test_node_death_migrates_to_spare_node() {
    let h = harness();
    connect_node(&h.state, "AA:01", 4).await;
    let (model_id, stream_id) = seed_model_and_stream(&h).await;
    let task_id = create_stream_task(&h, model_id, stream_id).await;
    post(&h.app, "/tasks/start", json!({"task_id": task_id})).await;
    h.state.status.flush().await.unwrap();

    connect_node(&h.state, "BB:02", 4).await;
    // Ungraceful drop: the broker delivers AA:01's last will.
    bus_message(
        &h.state,
        "meek/connection",
        json!({"status": "offline", "mac_address": "AA:01", "client_id": "client-AA:01"}),
    )
    .await;

    h.state.health.run_cycle().await.unwrap();

    let published = h.stores.published().await;
    let migrated = published
        .iter()
        .find(|(t, _)| t == "meek/BB:02/request_setting")
        .expect("no start command republished to BB:02");
    assert_eq!(migrated.1["data"]["cmd_type"], "start_task");

    let sub = &h.stores.subtasks().list_for_task(task_id).await.unwrap()[0];
    let node_b = h.state.registry.get_by_mac("BB:02").await.unwrap().unwrap();
    assert_eq!(sub.node_id, Some(node_b.id));
    assert_eq!(sub.status, SubTaskStatus::Running);
    assert_eq!(node_b.stream_task_count, 1);

    let node_a = h.state.registry.get_by_mac("AA:01").await.unwrap().unwrap();
    assert_eq!(node_a.status, NodeStatus::Offline);
    assert_eq!(node_a.stream_task_count, 0);
}

#[tokio::test]
async fn test_node_death_without_spare_resets_to_pending() {
    let h = harness();
    connect_node(&h.state, "AA:01", 4).await;
    let (model_id, stream_id) = seed_model_and_stream(&h).await;
    let task_id = create_stream_task(&h, model_id, stream_id).await;
    post(&h.app, "/tasks/start", json!({"task_id": task_id})).await;
    h.state.status.flush().await.unwrap();

    bus_message(
        &h.state,
        "meek/connection",
        json!({"status": "offline", "mac_address": "AA:01", "client_id": "client-AA:01"}),
    )
    .await;
    h.state.health.run_cycle().await.unwrap();

    let sub = &h.stores.subtasks().list_for_task(task_id).await.unwrap()[0];
    assert_eq!(sub.status, SubTaskStatus::Pending);
    assert!(sub.node_id.is_none());
    assert!(sub.analysis_id.is_none());
    assert!(sub
        .error_message
        .as_deref()
        .unwrap()
        .contains("awaiting reassignment"));

    let (_, body) = post(&h.app, "/tasks/status", json!({"task_id": task_id})).await;
    assert_eq!(body["status"], 0);
    assert_eq!(body["active"], 0);
}

#[tokio::test]
async fn test_user_stop_wins_over_migration() {
    let h = harness();
    connect_node(&h.state, "AA:01", 4).await;
    connect_node(&h.state, "BB:02", 4).await;
    let (model_id, stream_id) = seed_model_and_stream(&h).await;
    let task_id = create_stream_task(&h, model_id, stream_id).await;
    post(&h.app, "/tasks/start", json!({"task_id": task_id})).await;
    h.state.status.flush().await.unwrap();

    let (status, body) = post(&h.app, "/tasks/stop", json!({"task_id": task_id})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], 2);
    h.state.status.flush().await.unwrap();

    let row = h.stores.tasks().get(task_id).await.unwrap().unwrap();
    assert_eq!(row.error_message.as_deref(), Some(USER_STOP_MARKER));

    // AA:01 dies afterwards; the health cycle must leave the stopped
    // subtask alone.
    bus_message(
        &h.state,
        "meek/connection",
        json!({"status": "offline", "mac_address": "AA:01", "client_id": "client-AA:01"}),
    )
    .await;
    let before = h.stores.published().await.len();
    h.state.health.run_cycle().await.unwrap();

    let sub = &h.stores.subtasks().list_for_task(task_id).await.unwrap()[0];
    assert_eq!(sub.status, SubTaskStatus::Stopped);
    assert!(h
        .stores
        .published()
        .await
        .iter()
        .skip(before)
        .all(|(t, _)| !t.contains("BB:02")));
}

#[tokio::test]
async fn test_stop_with_broker_down_still_stops_in_database() {
    let h = harness();
    connect_node(&h.state, "AA:01", 4).await;
    let (model_id, stream_id) = seed_model_and_stream(&h).await;
    let task_id = create_stream_task(&h, model_id, stream_id).await;
    post(&h.app, "/tasks/start", json!({"task_id": task_id})).await;
    h.state.status.flush().await.unwrap();

    h.stores.set_bus_connected(false);
    let (status, body) = post(&h.app, "/tasks/stop", json!({"task_id": task_id})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], 2);

    let row = h.stores.tasks().get(task_id).await.unwrap().unwrap();
    assert_eq!(row.status, SubTaskStatus::Stopped);
}

#[tokio::test]
async fn test_node_rejection_requeues_with_backoff() {
    let h = harness();
    connect_node(&h.state, "AA:01", 4).await;
    let (model_id, stream_id) = seed_model_and_stream(&h).await;
    let task_id = create_stream_task(&h, model_id, stream_id).await;
    post(&h.app, "/tasks/start", json!({"task_id": task_id})).await;

    let published = h.stores.published().await;
    let start = published.last().unwrap();
    let uuid = start.1["message_uuid"].as_str().unwrap();
    let sub_id = h.stores.subtasks().list_for_task(task_id).await.unwrap()[0].id;

    let before = chrono::Utc::now();
    bus_message(
        &h.state,
        "meek/device_config_reply",
        json!({
            "message_uuid": uuid,
            "status": "error",
            "mac_address": "AA:01",
            "data": {"cmd_type": "start_task", "task_id": task_id.to_string(),
                     "subtask_id": sub_id.to_string(), "message": "model not loaded",
                     "error_code": "ERR_002"}
        }),
    )
    .await;

    let sub = h.stores.subtasks().get(sub_id).await.unwrap().unwrap();
    assert_eq!(sub.status, SubTaskStatus::Pending);
    assert_eq!(sub.retry_count, 1);

    // Node capacity was handed back on rejection.
    let node = h.state.registry.get_by_mac("AA:01").await.unwrap().unwrap();
    assert_eq!(node.stream_task_count, 0);

    let entries = h.state.retry_queue.snapshot();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].retry_count, 1);
    let delta = (entries[0].next_retry_at - before).num_milliseconds();
    assert!((4_000..=7_000).contains(&delta), "first retry should wait ~5s, got {delta}ms");
}

#[tokio::test]
async fn test_duplicate_result_message_is_ignored() {
    let h = harness();
    connect_node(&h.state, "AA:01", 4).await;
    let (model_id, stream_id) = seed_model_and_stream(&h).await;
    let task_id = create_stream_task(&h, model_id, stream_id).await;
    post(&h.app, "/tasks/start", json!({"task_id": task_id})).await;
    h.state.status.flush().await.unwrap();
    let sub_id = h.stores.subtasks().list_for_task(task_id).await.unwrap()[0].id;

    let payload = json!({
        "message_id": "result-778",
        "task_id": task_id.to_string(),
        "subtask_id": sub_id.to_string(),
        "status": "completed",
        "status_code": 200
    });
    bus_message(&h.state, "meek/AA:01/result", payload.clone()).await;
    bus_message(&h.state, "meek/AA:01/result", payload).await;

    let (_, body) = post(&h.app, "/tasks/status", json!({"task_id": task_id})).await;
    assert_eq!(body["counters"]["3"], 1);

    let node = h.state.registry.get_by_mac("AA:01").await.unwrap().unwrap();
    // A double decrement would have clamped at zero anyway; the dedup
    // cache keeps the second message from running handlers at all.
    assert_eq!(node.stream_task_count, 0);
}

#[tokio::test]
async fn test_callback_endpoint_ingests_results() {
    let h = harness();
    connect_node(&h.state, "AA:01", 4).await;
    let (model_id, stream_id) = seed_model_and_stream(&h).await;
    let task_id = create_stream_task(&h, model_id, stream_id).await;
    post(&h.app, "/tasks/start", json!({"task_id": task_id})).await;
    h.state.status.flush().await.unwrap();
    let sub_id = h.stores.subtasks().list_for_task(task_id).await.unwrap()[0].id;

    let (status, body) = post(
        &h.app,
        "/callback",
        json!({
            "task_id": task_id.to_string(),
            "subtask_id": sub_id.to_string(),
            "status": "completed",
            "status_code": 200
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let (_, body) = post(&h.app, "/tasks/status", json!({"task_id": task_id})).await;
    assert_eq!(body["status"], 3);
}

#[tokio::test]
async fn test_full_lifecycle_leaves_no_trace_after_delete() {
    let h = harness();
    connect_node(&h.state, "AA:01", 4).await;
    let (model_id, stream_id) = seed_model_and_stream(&h).await;
    let task_id = create_stream_task(&h, model_id, stream_id).await;

    post(&h.app, "/tasks/start", json!({"task_id": task_id})).await;
    post(&h.app, "/tasks/stop", json!({"task_id": task_id})).await;
    let (status, body) = post(&h.app, "/tasks/delete", json!({"task_id": task_id})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    assert!(h.stores.tasks().get(task_id).await.unwrap().is_none());
    assert!(h.stores.subtasks().list_for_task(task_id).await.unwrap().is_empty());
    assert!(h.stores.cache().get_counters(task_id).await.unwrap().is_none());
    assert_eq!(h.state.retry_queue.len(), 0);

    let (status, _) = post(&h.app, "/tasks/status", json!({"task_id": task_id})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_running_task_is_conflict() {
    let h = harness();
    connect_node(&h.state, "AA:01", 4).await;
    let (model_id, stream_id) = seed_model_and_stream(&h).await;
    let task_id = create_stream_task(&h, model_id, stream_id).await;
    post(&h.app, "/tasks/start", json!({"task_id": task_id})).await;
    h.state.status.flush().await.unwrap();

    let (status, body) = post(&h.app, "/tasks/delete", json!({"task_id": task_id})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("running"));
}

#[tokio::test]
async fn test_create_with_bad_input_is_rejected() {
    let h = harness();
    let (model_id, _) = seed_model_and_stream(&h).await;

    // Unknown analysis type.
    let (status, _) = post(
        &h.app,
        "/tasks/create",
        json!({"name": "x", "analysis_type": 9, "model_ids": [model_id]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Image task without urls.
    let (status, _) = post(
        &h.app,
        "/tasks/create",
        json!({"name": "x", "analysis_type": 1, "model_ids": [model_id]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Unknown model.
    let (status, _) = post(
        &h.app,
        "/tasks/create",
        json!({"name": "x", "analysis_type": 1, "model_ids": [999],
               "image_urls": ["http://x/a.jpg"]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stream_fanout_counts_models_times_streams() {
    let h = harness();
    let (m1, s1) = seed_model_and_stream(&h).await;
    let m2 = h
        .stores
        .models()
        .upsert_by_code(meek_core::types::NewModel {
            code: "yolo-seg".into(),
            name: "yolo seg".into(),
            version: None,
            class_count: 80,
            classes: json!({}),
        })
        .await
        .unwrap()
        .id;
    let (_, s2) = post(
        &h.app,
        "/streams/create",
        json!({"name": "door-cam", "url": "rtsp://door-cam/main"}),
    )
    .await;
    let s2 = s2["stream_id"].as_i64().unwrap();

    let (status, body) = post(
        &h.app,
        "/tasks/create",
        json!({
            "name": "grid",
            "analysis_type": 3,
            "model_ids": [m1, m2],
            "stream_ids": [s1, s2],
            "config": {}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let task_id = body["task_id"].as_i64().unwrap();

    let (_, body) = post(&h.app, "/tasks/status", json!({"task_id": task_id})).await;
    assert_eq!(body["total"], 4);
    assert_eq!(body["counters"]["0"], 4);
}

#[tokio::test]
async fn test_node_endpoints_expose_registry() {
    let h = harness();
    connect_node(&h.state, "AA:01", 4).await;

    let (status, body) = get(&h.app, "/nodes").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nodes"].as_array().unwrap().len(), 1);
    assert_eq!(body["nodes"][0]["mac_address"], "AA:01");

    let id = body["nodes"][0]["node_id"].as_i64().unwrap();
    let (status, body) = get(&h.app, &format!("/nodes/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["max_tasks"], 4);

    let (status, _) = get(&h.app, "/nodes/999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_node_command_and_broadcast() {
    let h = harness();
    connect_node(&h.state, "AA:01", 4).await;
    let id = h.state.registry.get_by_mac("AA:01").await.unwrap().unwrap().id;

    let (status, body) = post(
        &h.app,
        &format!("/nodes/{id}/command"),
        json!({"cmd_type": "sync_time"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message_uuid"].as_str().unwrap().len() == 16);

    let published = h.stores.published().await;
    let cmd = published.last().unwrap();
    assert_eq!(cmd.0, "meek/AA:01/request_setting");
    assert_eq!(cmd.1["request_type"], "node_cmd");
    assert_eq!(cmd.1["data"]["cmd_type"], "sync_time");

    let (status, _) = post(
        &h.app,
        &format!("/nodes/{id}/command"),
        json!({"cmd_type": "reboot"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(
        &h.app,
        "/system/broadcast",
        json!({"message": {"notice": "maintenance at 02:00"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let published = h.stores.published().await;
    assert_eq!(published.last().unwrap().0, "meek/system/broadcast");
}

#[tokio::test]
async fn test_health_endpoint_reports_bus_state() {
    let h = harness();
    let (status, body) = get(&h.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["bus_connected"], true);

    h.stores.set_bus_connected(false);
    let (_, body) = get(&h.app, "/health").await;
    assert_eq!(body["bus_connected"], false);
}
