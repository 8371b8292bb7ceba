//! End-to-end dispatch over a real in-memory SQLite backend: envelope
//! shape, policy gate, statement guard, and catalog filtering.

use std::sync::Arc;

use rmcp::model::CallToolResult;
use serde_json::{json, Value};

use polystored::audit::AuditLogger;
use polystored::backend::sqlite::SqliteBackend;
use polystored::backend::DatabaseBackend;
use polystored::catalog::Catalog;
use polystored::policy::PolicyMode;
use polystored::server::PolystoreEngine;

fn engine(policy: PolicyMode) -> (PolystoreEngine, tempfile::TempDir) {
    let backend = SqliteBackend::open_in_memory().unwrap();
    let backend: Arc<dyn DatabaseBackend> = Arc::new(backend);
    let catalog = Arc::new(Catalog::build(Arc::clone(&backend)).unwrap());
    let dir = tempfile::tempdir().unwrap();
    let audit = Arc::new(AuditLogger::new(
        dir.path().join("audit.log").to_string_lossy().to_string(),
    ));
    (PolystoreEngine::new(backend, catalog, policy, audit), dir)
}

fn envelope_text(result: &CallToolResult) -> String {
    result
        .content
        .first()
        .and_then(|c| c.as_text())
        .map(|t| t.text.clone())
        .unwrap_or_default()
}

fn envelope_json(result: &CallToolResult) -> Value {
    serde_json::from_str(&envelope_text(result)).unwrap()
}

async fn seed(engine: &PolystoreEngine) {
    let result = engine
        .dispatch(
            "execute",
            json!({"statement": "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)"}),
        )
        .await;
    assert_ne!(result.is_error, Some(true), "{}", envelope_text(&result));
    let result = engine
        .dispatch(
            "execute",
            json!({"statement": "INSERT INTO users (name) VALUES ('ada'), ('grace')"}),
        )
        .await;
    assert_ne!(result.is_error, Some(true), "{}", envelope_text(&result));
}

#[tokio::test]
async fn query_returns_rows_in_the_success_envelope() {
    let (engine, _dir) = engine(PolicyMode::ReadWrite);
    seed(&engine).await;

    let result = engine
        .dispatch(
            "query",
            json!({"statement": "SELECT name FROM users ORDER BY name"}),
        )
        .await;
    assert_ne!(result.is_error, Some(true));
    let body = envelope_json(&result);
    assert_eq!(body["row_count"], 2);
    assert_eq!(body["rows"][0]["name"], "ada");
    assert_eq!(body["rows"][1]["name"], "grace");
}

#[tokio::test]
async fn read_only_mode_blocks_writes_and_leaves_data_untouched() {
    // Two engines over the same database: one seeds, one is gated.
    let backend: Arc<dyn DatabaseBackend> = Arc::new(SqliteBackend::open_in_memory().unwrap());
    let catalog = Arc::new(Catalog::build(Arc::clone(&backend)).unwrap());
    let audit = Arc::new(AuditLogger::new("ignore.log"));
    let writer = PolystoreEngine::new(
        Arc::clone(&backend),
        Arc::clone(&catalog),
        PolicyMode::ReadWrite,
        Arc::clone(&audit),
    );
    seed(&writer).await;
    let read_only = PolystoreEngine::new(backend, catalog, PolicyMode::ReadOnly, audit);

    let denied = read_only
        .dispatch("execute", json!({"statement": "DELETE FROM users"}))
        .await;
    assert_eq!(denied.is_error, Some(true));
    assert_eq!(
        envelope_text(&denied),
        "Error: write operations are disabled: server is running in read-only mode"
    );

    let check = read_only
        .dispatch("query", json!({"statement": "SELECT count(*) AS n FROM users"}))
        .await;
    let body = envelope_json(&check);
    assert_eq!(body["rows"][0]["n"], 2);
}

#[tokio::test]
async fn query_refuses_mutations_even_in_read_write_mode() {
    let (engine, _dir) = engine(PolicyMode::ReadWrite);
    seed(&engine).await;

    let result = engine
        .dispatch("query", json!({"statement": "DELETE FROM users"}))
        .await;
    assert_eq!(result.is_error, Some(true));
    assert!(envelope_text(&result).contains("not a read-only query"));

    let check = engine
        .dispatch("query", json!({"statement": "SELECT count(*) AS n FROM users"}))
        .await;
    assert_eq!(envelope_json(&check)["rows"][0]["n"], 2);
}

#[tokio::test]
async fn chained_statements_are_rejected() {
    let (engine, _dir) = engine(PolicyMode::ReadOnly);
    let result = engine
        .dispatch(
            "query",
            json!({"statement": "SELECT 1; DROP TABLE users"}),
        )
        .await;
    assert_eq!(result.is_error, Some(true));
}

#[tokio::test]
async fn introspection_works_under_read_only() {
    let (engine, _dir) = engine(PolicyMode::ReadWrite);
    seed(&engine).await;

    let tables = engine.dispatch("list_tables", json!({})).await;
    assert_eq!(envelope_json(&tables), json!(["users"]));

    let described = engine
        .dispatch("describe_table", json!({"table": "users"}))
        .await;
    let body = envelope_json(&described);
    assert_eq!(body["table"], "users");
    let columns = body["columns"].as_array().unwrap();
    assert_eq!(columns.len(), 2);
    assert_eq!(columns[0]["name"], "id");
    assert_eq!(columns[0]["primary_key"], true);
}

#[tokio::test]
async fn explain_accepts_multibyte_comment_prefixes() {
    let (engine, _dir) = engine(PolicyMode::ReadWrite);
    seed(&engine).await;

    // The statement opens with multibyte text inside a comment; the
    // caller must still get a well-formed envelope back.
    let result = engine
        .dispatch(
            "explain_query",
            json!({"statement": "/*ééé*/SELECT name FROM users"}),
        )
        .await;
    assert_ne!(result.is_error, Some(true), "{}", envelope_text(&result));
    assert!(envelope_json(&result)["row_count"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn unknown_operation_yields_an_error_envelope() {
    let (engine, _dir) = engine(PolicyMode::ReadOnly);
    let result = engine.dispatch("native_get", json!({"key": "k"})).await;
    assert_eq!(result.is_error, Some(true));
    assert!(envelope_text(&result).starts_with("Error: unknown operation"));
}

#[tokio::test]
async fn tool_listing_is_stable_and_relational() {
    let (engine, _dir) = engine(PolicyMode::ReadOnly);
    let names: Vec<&str> = engine.catalog().iter().map(|op| op.name).collect();
    assert!(names.contains(&"query"));
    assert!(names.contains(&"execute"));
    assert!(names.contains(&"explain_query"));
    assert!(!names.iter().any(|n| n.starts_with("native_")));

    let again: Vec<&str> = engine.catalog().iter().map(|op| op.name).collect();
    assert_eq!(names, again);
}

#[tokio::test]
async fn audit_log_records_denials() {
    let (engine, dir) = engine(PolicyMode::ReadOnly);
    let _ = engine
        .dispatch("execute", json!({"statement": "DELETE FROM users"}))
        .await;

    let contents = std::fs::read_to_string(dir.path().join("audit.log")).unwrap();
    let line: Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
    assert_eq!(line["operation"], "execute");
    assert_eq!(line["decision"], "denied");
    assert_eq!(line["outcome"], "error");
}
