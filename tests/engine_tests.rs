use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{routing::get, routing::post, routing::put, Json, Router};
use serde_json::{json, Value};

use forms_ingestion_service::clients::KizeoClient;
use forms_ingestion_service::lock::{LockStore, MemoryLockStore, LOCK_IDLE};
use forms_ingestion_service::models::{IngestionError, MetadataStatus, RunConfig, RunStatus};
use forms_ingestion_service::storage::{ConfigStore, MemoryConfigStore};
use forms_ingestion_service::sync::{EngineOptions, IngestionEngine};
use forms_ingestion_service::warehouse::testing::MemoryWarehouse;
use forms_ingestion_service::warehouse::{DedupWaitOptions, WarehouseConfig, WarehouseGateway};

/// In-process stand-in for the forms platform API.
struct StubState {
    unread: Mutex<Value>,
    all: Value,
    details: HashMap<String, Value>,
    detail_calls: AtomicUsize,
    mark_read_bodies: Mutex<Vec<Vec<String>>>,
    lists: Vec<(String, String)>,
    list_items: Mutex<HashMap<String, Vec<String>>>,
    list_puts: Mutex<Vec<(String, Vec<String>)>>,
}

impl StubState {
    fn new(unread: Value, details: &[(&str, Value)]) -> Arc<Self> {
        Self::new_with_all(unread, json!({"data": []}), details)
    }

    fn new_with_all(unread: Value, all: Value, details: &[(&str, Value)]) -> Arc<Self> {
        Arc::new(Self {
            unread: Mutex::new(unread),
            all,
            details: details
                .iter()
                .map(|(id, payload)| (id.to_string(), payload.clone()))
                .collect(),
            detail_calls: AtomicUsize::new(0),
            mark_read_bodies: Mutex::new(Vec::new()),
            lists: Vec::new(),
            list_items: Mutex::new(HashMap::new()),
            list_puts: Mutex::new(Vec::new()),
        })
    }
}

async fn unread_route(State(state): State<Arc<StubState>>) -> Json<Value> {
    Json(state.unread.lock().unwrap().clone())
}

async fn all_route(State(state): State<Arc<StubState>>) -> Json<Value> {
    Json(state.all.clone())
}

async fn detail_route(
    State(state): State<Arc<StubState>>,
    Path((_form, id)): Path<(String, String)>,
) -> impl IntoResponse {
    state.detail_calls.fetch_add(1, Ordering::SeqCst);
    match state.details.get(&id) {
        Some(payload) => (StatusCode::OK, Json(payload.clone())),
        None => (StatusCode::NOT_FOUND, Json(json!({"status": "error"}))),
    }
}

async fn mark_read_route(
    State(state): State<Arc<StubState>>,
    Path((_form, _action)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let ids: Vec<String> = body
        .get("data_ids")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    state.mark_read_bodies.lock().unwrap().push(ids);
    // Consumed entries leave the unread queue.
    *state.unread.lock().unwrap() = json!({"data": []});
    Json(json!({"status": "ok"}))
}

async fn lists_route(State(state): State<Arc<StubState>>) -> Json<Value> {
    let lists: Vec<Value> = state
        .lists
        .iter()
        .map(|(id, name)| json!({"id": id, "name": name}))
        .collect();
    Json(json!({"lists": lists}))
}

async fn list_detail_route(
    State(state): State<Arc<StubState>>,
    Path(id): Path<String>,
) -> Json<Value> {
    let items = state
        .list_items
        .lock()
        .unwrap()
        .get(&id)
        .cloned()
        .unwrap_or_default();
    let name = state
        .lists
        .iter()
        .find(|(list_id, _)| list_id == &id)
        .map(|(_, name)| name.clone())
        .unwrap_or_default();
    Json(json!({"list": {"id": id, "name": name, "items": items}}))
}

async fn list_put_route(
    State(state): State<Arc<StubState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let items: Vec<String> = body
        .get("items")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    state
        .list_items
        .lock()
        .unwrap()
        .insert(id.clone(), items.clone());
    state.list_puts.lock().unwrap().push((id, items));
    Json(json!({"status": "ok"}))
}

async fn spawn_stub(state: Arc<StubState>) -> String {
    let app = Router::new()
        .route("/forms/{form}/data/unread/{action}/{limit}", get(unread_route))
        .route("/forms/{form}/data/all", get(all_route))
        .route("/forms/{form}/data/{id}", get(detail_route))
        .route("/forms/{form}/markasreadbyaction/{action}", post(mark_read_route))
        .route("/lists", get(lists_route))
        .route("/lists/{id}", get(list_detail_route).put(list_put_route))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{}", addr)
}

fn forms_client(base_url: &str) -> Arc<KizeoClient> {
    Arc::new(KizeoClient::new(
        base_url.to_string(),
        "test-token".to_string(),
        5_000,
        "forms-ingestion-service/tests",
        0,
        10,
    ))
}

fn warehouse() -> Arc<MemoryWarehouse> {
    Arc::new(MemoryWarehouse::new(WarehouseConfig {
        project_id: "proj".into(),
        dataset_id: "forms".into(),
        location: None,
    }))
}

fn engine_options() -> EngineOptions {
    EngineOptions {
        mark_read_chunk: 50,
        fetch_parallelism: 2,
        dedup_enabled: false,
        dedup_wait: DedupWaitOptions::default(),
    }
}

fn base_config() -> RunConfig {
    let mut config = RunConfig::new("sheet1", "123", "warehouse");
    config.form_name = "Journal".into();
    config
}

fn record_001_detail() -> Value {
    json!({
        "data": {
            "id": "record-001",
            "form_unique_id": "u-001",
            "user_id": "42",
            "answer_time": "2024-03-01 08:30:00",
            "update_time": "2024-03-02 09:00:00",
            "fields": {
                "temperature_air": {"type": "number", "value": 18.5},
                "commentaires": {"type": "text", "value": "RAS"}
            }
        }
    })
}

#[tokio::test]
async fn single_record_end_to_end() {
    let stub = StubState::new(
        json!({"data": [{"_id": "record-001"}]}),
        &[("record-001", record_001_detail())],
    );
    let base = spawn_stub(stub.clone()).await;

    let store = Arc::new(MemoryConfigStore::with_config(base_config()));
    let locks = Arc::new(MemoryLockStore::new());
    let client = warehouse();
    let engine = IngestionEngine::new(forms_client(&base), store.clone(), locks.clone())
        .with_gateway(WarehouseGateway::new(client.clone()))
        .with_options(engine_options());

    let outcome = engine.run("sheet1").await.unwrap();

    assert_eq!(outcome.status, RunStatus::Ingested);
    assert_eq!(outcome.row_count, 1);
    assert_eq!(outcome.latest_entry_id.as_deref(), Some("record-001"));

    // Exactly one detail fetch, one mark-as-read call with the right id.
    assert_eq!(stub.detail_calls.load(Ordering::SeqCst), 1);
    let marked = stub.mark_read_bodies.lock().unwrap().clone();
    assert_eq!(marked, vec![vec!["record-001".to_string()]]);

    // One raw row and one parent row with the flattened values.
    assert_eq!(client.row_count("123__journal_raw"), 1);
    assert_eq!(client.row_count("123__journal"), 1);
    let parent = &client.rows("123__journal")[0];
    assert_eq!(parent["temperature_air"], json!(18.5));
    assert_eq!(parent["commentaires"], json!("RAS"));
    assert_eq!(parent["form_unique_id"], json!("u-001"));

    // Lock restored, cursor persisted.
    assert_eq!(locks.state("sheet1").await.unwrap(), LOCK_IDLE);
    let config = store.read_config("sheet1").await.unwrap().unwrap();
    assert_eq!(config.last_entry_id.as_deref(), Some("record-001"));
    assert_eq!(config.last_row_count, Some(1));
    assert_eq!(config.table_name, "123__journal");

    // Dictionary was appended for the dynamic columns.
    assert!(store
        .dictionary_entries()
        .iter()
        .any(|e| e.field_slug == "temperature_air"));
}

#[tokio::test]
async fn rerun_with_same_record_is_idempotent() {
    let stub = StubState::new(
        json!({"data": [{"_id": "record-001"}]}),
        &[("record-001", record_001_detail())],
    );
    let base = spawn_stub(stub.clone()).await;

    let store = Arc::new(MemoryConfigStore::with_config(base_config()));
    let locks = Arc::new(MemoryLockStore::new());
    let client = warehouse();
    let engine = IngestionEngine::new(forms_client(&base), store.clone(), locks.clone())
        .with_gateway(WarehouseGateway::new(client.clone()))
        .with_options(engine_options());

    engine.run("sheet1").await.unwrap();
    // Pretend mark-as-read was lost: the entry re-delivers.
    *stub.unread.lock().unwrap() = json!({"data": [{"_id": "record-001"}]});
    engine.run("sheet1").await.unwrap();

    // The insert id keyed on form|entry|update_time deduplicates redelivery.
    assert_eq!(client.row_count("123__journal"), 1);
}

#[tokio::test]
async fn lock_is_released_when_the_insert_fails() {
    let stub = StubState::new(
        json!({"data": [{"_id": "record-001"}]}),
        &[("record-001", record_001_detail())],
    );
    let base = spawn_stub(stub.clone()).await;

    let store = Arc::new(MemoryConfigStore::with_config(base_config()));
    let locks = Arc::new(MemoryLockStore::new());
    let client = warehouse();
    client.poison_inserts();
    let engine = IngestionEngine::new(forms_client(&base), store.clone(), locks.clone())
        .with_gateway(WarehouseGateway::new(client.clone()))
        .with_options(engine_options());

    let err = engine.run("sheet1").await.unwrap_err();
    assert!(matches!(err, IngestionError::Warehouse(_)));

    assert_eq!(locks.state("sheet1").await.unwrap(), LOCK_IDLE);
    // The failure is audited.
    let reports = store.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status, RunStatus::Error);
    assert!(reports[0].error.is_some());
    // Nothing was marked as read: the batch re-delivers next run.
    assert!(stub.mark_read_bodies.lock().unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_run_is_rejected_without_side_effects() {
    let stub = StubState::new(
        json!({"data": [{"_id": "record-001"}]}),
        &[("record-001", record_001_detail())],
    );
    let base = spawn_stub(stub.clone()).await;

    let store = Arc::new(MemoryConfigStore::with_config(base_config()));
    let locks = Arc::new(MemoryLockStore::new());
    locks.try_acquire("sheet1").await.unwrap();

    let engine = IngestionEngine::new(forms_client(&base), store.clone(), locks.clone())
        .with_gateway(WarehouseGateway::new(warehouse()))
        .with_options(engine_options());

    let err = engine.run("sheet1").await.unwrap_err();
    assert!(matches!(err, IngestionError::RunInProgress(_)));
    assert_eq!(stub.detail_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_unread_with_previous_run_is_no_data() {
    let stub = StubState::new(json!({"data": []}), &[]);
    let base = spawn_stub(stub.clone()).await;

    let mut config = base_config();
    config.last_entry_id = Some("record-000".into());
    let store = Arc::new(MemoryConfigStore::with_config(config));
    let locks = Arc::new(MemoryLockStore::new());
    let client = warehouse();
    let engine = IngestionEngine::new(forms_client(&base), store.clone(), locks.clone())
        .with_gateway(WarehouseGateway::new(client.clone()))
        .with_options(engine_options());

    let outcome = engine.run("sheet1").await.unwrap();
    assert_eq!(outcome.status, RunStatus::NoData);
    assert_eq!(outcome.metadata_status, MetadataStatus::Skipped);
    assert!(client.table_ids().is_empty());
    assert_eq!(locks.state("sheet1").await.unwrap(), LOCK_IDLE);
}

#[tokio::test]
async fn first_run_bootstraps_from_full_history() {
    // An empty unread set on a never-initialized configuration falls back
    // to /data/all exactly once.
    let stub = StubState::new_with_all(
        json!({"data": []}),
        json!({"data": [{"_id": "record-009"}]}),
        &[("record-009", record_009_detail())],
    );
    let base = spawn_stub(stub.clone()).await;

    let store = Arc::new(MemoryConfigStore::with_config(base_config()));
    let locks = Arc::new(MemoryLockStore::new());
    let client = warehouse();
    let engine = IngestionEngine::new(forms_client(&base), store.clone(), locks.clone())
        .with_gateway(WarehouseGateway::new(client.clone()))
        .with_options(engine_options());

    let outcome = engine.run("sheet1").await.unwrap();
    assert_eq!(outcome.status, RunStatus::Ingested);
    assert_eq!(outcome.row_count, 1);
    assert_eq!(client.row_count("123__journal"), 1);
}

fn record_009_detail() -> Value {
    json!({
        "data": {
            "id": "record-009",
            "answer_time": "2023-01-10 07:00:00",
            "fields": {
                "temperature_air": {"type": "number", "value": "7,5"}
            }
        }
    })
}

#[tokio::test]
async fn external_lists_sync_once_the_queue_is_drained() {
    let stub = Arc::new(StubState {
        unread: Mutex::new(json!({"data": [{"_id": "record-001"}]})),
        all: json!({"data": []}),
        details: [("record-001".to_string(), record_001_detail())]
            .into_iter()
            .collect(),
        detail_calls: AtomicUsize::new(0),
        mark_read_bodies: Mutex::new(Vec::new()),
        lists: vec![("9".to_string(), "Sites actifs || 123".to_string())],
        list_items: Mutex::new(
            [(
                "9".to_string(),
                vec![
                    "Site|temperature_air:temperature_air".to_string(),
                    "Usine A|0:temperature_air".to_string(),
                ],
            )]
            .into_iter()
            .collect(),
        ),
        list_puts: Mutex::new(Vec::new()),
    });
    let base = spawn_stub(stub.clone()).await;

    let mut config = base_config();
    config.sync_lists = true;
    let store = Arc::new(MemoryConfigStore::with_config(config));
    let locks = Arc::new(MemoryLockStore::new());
    let engine = IngestionEngine::new(forms_client(&base), store.clone(), locks.clone())
        .with_gateway(WarehouseGateway::new(warehouse()))
        .with_options(engine_options());

    let outcome = engine.run("sheet1").await.unwrap();

    assert!(matches!(outcome.metadata_status, MetadataStatus::Ok(_)));
    let puts = stub.list_puts.lock().unwrap().clone();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].1[1], "Usine A|18.5:temperature_air");
}

#[tokio::test]
async fn disabled_warehouse_target_skips_all_writes() {
    let stub = StubState::new(
        json!({"data": [{"_id": "record-001"}]}),
        &[("record-001", record_001_detail())],
    );
    let base = spawn_stub(stub.clone()).await;

    let mut config = base_config();
    config.ingest_enabled = false;
    let store = Arc::new(MemoryConfigStore::with_config(config));
    let locks = Arc::new(MemoryLockStore::new());
    let client = warehouse();
    let engine = IngestionEngine::new(forms_client(&base), store.clone(), locks.clone())
        .with_gateway(WarehouseGateway::new(client.clone()))
        .with_options(engine_options());

    let outcome = engine.run("sheet1").await.unwrap();
    assert_eq!(outcome.status, RunStatus::Ingested);
    assert!(client.table_ids().is_empty());
    // Consumption still happens: the entries were processed.
    assert_eq!(
        stub.mark_read_bodies.lock().unwrap().clone(),
        vec![vec!["record-001".to_string()]]
    );
}

#[tokio::test]
async fn int_column_widens_to_string_across_runs() {
    let first = json!({
        "data": {
            "id": "record-101",
            "answer_time": "2024-04-01 10:00:00",
            "update_time": "2024-04-01 10:00:00",
            "fields": {"quantite": {"type": "integer", "value": 12}}
        }
    });
    let second = json!({
        "data": {
            "id": "record-102",
            "answer_time": "2024-04-02 10:00:00",
            "update_time": "2024-04-02 10:00:00",
            "fields": {"quantite": {"type": "text", "value": ["a", "b"]}}
        }
    });
    let stub = StubState::new(
        json!({"data": [{"_id": "record-101"}]}),
        &[("record-101", first), ("record-102", second)],
    );
    let base = spawn_stub(stub.clone()).await;

    let store = Arc::new(MemoryConfigStore::with_config(base_config()));
    let locks = Arc::new(MemoryLockStore::new());
    let client = warehouse();
    let engine = IngestionEngine::new(forms_client(&base), store.clone(), locks.clone())
        .with_gateway(WarehouseGateway::new(client.clone()))
        .with_options(engine_options());

    engine.run("sheet1").await.unwrap();
    *stub.unread.lock().unwrap() = json!({"data": [{"_id": "record-102"}]});
    engine.run("sheet1").await.unwrap();

    let rows = client.rows("123__journal");
    assert_eq!(rows.len(), 2);
    // The first row kept its integer; the conflicting row was coerced to the
    // widened STRING column in the same call that altered the schema.
    assert_eq!(rows[0]["quantite"], json!(12));
    assert_eq!(rows[1]["quantite"], json!("a,b"));
}

#[tokio::test]
async fn repeating_groups_land_in_sub_tables() {
    let detail = json!({
        "data": {
            "id": "record-007",
            "form_unique_id": "u-007",
            "answer_time": "2024-05-01 06:00:00",
            "update_time": "2024-05-01 06:30:00",
            "fields": {
                "mesures": {"type": "subform", "value": [
                    {"fields": {"valeur": {"value": "17,5"}}},
                    {"fields": {"valeur": {"value": "18"}}}
                ]}
            }
        }
    });
    let stub = StubState::new(json!({"data": [{"_id": "record-007"}]}), &[("record-007", detail)]);
    let base = spawn_stub(stub.clone()).await;

    let store = Arc::new(MemoryConfigStore::with_config(base_config()));
    let locks = Arc::new(MemoryLockStore::new());
    let client = warehouse();
    let engine = IngestionEngine::new(forms_client(&base), store.clone(), locks.clone())
        .with_gateway(WarehouseGateway::new(client.clone()))
        .with_options(engine_options());

    engine.run("sheet1").await.unwrap();

    assert_eq!(client.row_count("123__journal__mesures"), 2);
    let parent = &client.rows("123__journal")[0];
    assert_eq!(parent["table_mesures"], json!("123__journal__mesures"));
    assert_eq!(parent["table_mesures_row_count"], json!(2));
    let sub = client.rows("123__journal__mesures");
    assert_eq!(sub[0]["parent_entry_id"], json!("record-007"));
    assert_eq!(sub[0]["valeur"], json!("17,5"));
}
