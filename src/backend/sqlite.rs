//! SQLite adapter. The driver is synchronous, so every call runs on the
//! blocking pool over a shared connection.

use std::sync::{Arc, Mutex};

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

use super::{statement_tag, BackendKind, DatabaseBackend};
use crate::error::BackendError;

pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open(path: &str) -> Result<Self, BackendError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(BackendError::driver)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, BackendError> {
        Self::open(":memory:")
    }

    async fn call<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        F: FnOnce(&Connection) -> Result<T, BackendError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| BackendError::driver("sqlite connection mutex poisoned"))?;
            f(&guard)
        })
        .await
        .map_err(|e| BackendError::driver(format!("sqlite task failed: {e}")))?
    }
}

/// Double-quote an identifier so it can be spliced into PRAGMA-style
/// statements that cannot take bind parameters.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool, BackendError> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
    .map_err(BackendError::driver)
}

fn cell_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => json!(String::from_utf8_lossy(t)),
        ValueRef::Blob(b) => json!(format!("<{} bytes>", b.len())),
    }
}

fn run_select(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Value, BackendError> {
    let mut stmt = conn.prepare(sql).map_err(BackendError::driver)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query(params).map_err(BackendError::driver)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(BackendError::driver)? {
        let mut obj = Map::new();
        for (i, col) in columns.iter().enumerate() {
            let cell = row.get_ref(i).map_err(BackendError::driver)?;
            obj.insert(col.clone(), cell_to_json(cell));
        }
        out.push(Value::Object(obj));
    }
    Ok(json!({ "columns": columns, "rows": out, "row_count": out.len() }))
}

fn select_names(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<String>, BackendError> {
    let mut stmt = conn.prepare(sql).map_err(BackendError::driver)?;
    let names = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .map_err(BackendError::driver)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(BackendError::driver)?;
    Ok(names)
}

#[async_trait::async_trait]
impl DatabaseBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn query(&self, statement: &str) -> Result<Value, BackendError> {
        let statement = statement.to_string();
        self.call(move |conn| run_select(conn, &statement, &[]))
            .await
    }

    async fn execute(&self, statement: &str) -> Result<Value, BackendError> {
        let statement = statement.to_string();
        self.call(move |conn| {
            let affected = conn.execute(&statement, []).map_err(BackendError::driver)?;
            Ok(json!({
                "operation": statement_tag(&statement),
                "rows_affected": affected,
            }))
        })
        .await
    }

    async fn list_entities(&self, scope: Option<&str>) -> Result<Value, BackendError> {
        let schema = scope.unwrap_or("main").to_string();
        self.call(move |conn| {
            let sql = format!(
                "SELECT name FROM {}.sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                quote_ident(&schema)
            );
            Ok(json!(select_names(conn, &sql, &[])?))
        })
        .await
    }

    async fn describe_entity(
        &self,
        name: &str,
        _scope: Option<&str>,
    ) -> Result<Value, BackendError> {
        let name = name.to_string();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name, type, \"notnull\", dflt_value, pk \
                     FROM pragma_table_info(?1)",
                )
                .map_err(BackendError::driver)?;
            let columns = stmt
                .query_map([&name], |row| {
                    Ok(json!({
                        "name": row.get::<_, String>(0)?,
                        "type": row.get::<_, String>(1)?,
                        "nullable": row.get::<_, i64>(2)? == 0,
                        "default": row.get::<_, Option<String>>(3)?,
                        "primary_key": row.get::<_, i64>(4)? != 0,
                    }))
                })
                .map_err(BackendError::driver)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(BackendError::driver)?;
            Ok(json!({ "table": name, "columns": columns }))
        })
        .await
    }

    async fn list_scopes(&self) -> Result<Value, BackendError> {
        self.call(|conn| {
            let names = select_names(conn, "SELECT name FROM pragma_database_list ORDER BY name", &[])?;
            Ok(json!(names))
        })
        .await
    }

    async fn explain(&self, statement: &str) -> Result<Value, BackendError> {
        let sql = format!("EXPLAIN QUERY PLAN {statement}");
        self.call(move |conn| run_select(conn, &sql, &[])).await
    }

    async fn list_indexes(&self, name: &str, _scope: Option<&str>) -> Result<Value, BackendError> {
        let name = name.to_string();
        self.call(move |conn| {
            run_select(
                conn,
                "SELECT name, \"unique\" AS is_unique, origin, partial \
                 FROM pragma_index_list(?1)",
                &[&name],
            )
        })
        .await
    }

    async fn list_foreign_keys(
        &self,
        name: &str,
        _scope: Option<&str>,
    ) -> Result<Value, BackendError> {
        let name = name.to_string();
        self.call(move |conn| {
            run_select(
                conn,
                "SELECT \"table\" AS referenced_table, \"from\" AS column_name, \
                        \"to\" AS referenced_column, on_update, on_delete \
                 FROM pragma_foreign_key_list(?1)",
                &[&name],
            )
        })
        .await
    }

    async fn entity_size(&self, name: &str, _scope: Option<&str>) -> Result<Value, BackendError> {
        let name = name.to_string();
        self.call(move |conn| {
            if !table_exists(conn, &name)? {
                return Ok(json!({
                    "table": name,
                    "row_count": Value::Null,
                    "database_bytes": Value::Null,
                }));
            }
            let count_sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&name));
            let row_count: i64 = conn
                .query_row(&count_sql, [], |row| row.get(0))
                .map_err(BackendError::driver)?;
            let database_bytes: i64 = conn
                .query_row(
                    "SELECT (SELECT * FROM pragma_page_count()) * \
                            (SELECT * FROM pragma_page_size())",
                    [],
                    |row| row.get(0),
                )
                .map_err(BackendError::driver)?;
            Ok(json!({
                "table": name,
                "row_count": row_count,
                "database_bytes": database_bytes,
            }))
        })
        .await
    }

    async fn list_views(&self, scope: Option<&str>) -> Result<Value, BackendError> {
        let schema = scope.unwrap_or("main").to_string();
        self.call(move |conn| {
            let sql = format!(
                "SELECT name FROM {}.sqlite_master WHERE type = 'view' ORDER BY name",
                quote_ident(&schema)
            );
            Ok(json!(select_names(conn, &sql, &[])?))
        })
        .await
    }

    async fn describe_view(&self, name: &str, _scope: Option<&str>) -> Result<Value, BackendError> {
        let name = name.to_string();
        self.call(move |conn| {
            let definition: Option<String> = conn
                .query_row(
                    "SELECT sql FROM sqlite_master WHERE type = 'view' AND name = ?1",
                    [&name],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(BackendError::driver(other)),
                })?
                .flatten();
            Ok(json!({ "view": name, "definition": definition }))
        })
        .await
    }

    async fn search_entities(
        &self,
        pattern: &str,
        _scope: Option<&str>,
    ) -> Result<Value, BackendError> {
        let like = format!("%{pattern}%");
        self.call(move |conn| {
            let names = select_names(
                conn,
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name LIKE ?1 \
                 ORDER BY name",
                &[&like],
            )?;
            Ok(json!(names))
        })
        .await
    }

    async fn entity_stats(&self, name: &str, _scope: Option<&str>) -> Result<Value, BackendError> {
        let name = name.to_string();
        self.call(move |conn| {
            if !table_exists(conn, &name)? {
                return Ok(json!({
                    "table": name,
                    "row_count": Value::Null,
                    "column_count": Value::Null,
                }));
            }
            let count_sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&name));
            let row_count: i64 = conn
                .query_row(&count_sql, [], |row| row.get(0))
                .map_err(BackendError::driver)?;
            let column_count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM pragma_table_info(?1)",
                    [&name],
                    |row| row.get(0),
                )
                .map_err(BackendError::driver)?;
            Ok(json!({
                "table": name,
                "row_count": row_count,
                "column_count": column_count,
            }))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> SqliteBackend {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .await
            .unwrap();
        backend
            .execute("INSERT INTO users (name) VALUES ('ada'), ('grace')")
            .await
            .unwrap();
        backend
            .execute("CREATE VIEW named_users AS SELECT name FROM users")
            .await
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn query_returns_rows_and_columns() {
        let backend = seeded().await;
        let result = backend.query("SELECT id, name FROM users ORDER BY id").await.unwrap();
        assert_eq!(result["row_count"], 2);
        assert_eq!(result["rows"][0]["name"], "ada");
        assert_eq!(result["columns"], serde_json::json!(["id", "name"]));
    }

    #[tokio::test]
    async fn execute_reports_affected_rows() {
        let backend = seeded().await;
        let result = backend.execute("DELETE FROM users WHERE name = 'ada'").await.unwrap();
        assert_eq!(result["operation"], "DELETE");
        assert_eq!(result["rows_affected"], 1);
    }

    #[tokio::test]
    async fn list_and_describe() {
        let backend = seeded().await;
        let tables = backend.list_entities(None).await.unwrap();
        assert_eq!(tables, serde_json::json!(["users"]));

        let schema = backend.describe_entity("users", None).await.unwrap();
        let columns = schema["columns"].as_array().unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[1]["name"], "name");
        assert_eq!(columns[1]["nullable"], false);
    }

    #[tokio::test]
    async fn describe_missing_table_is_empty_not_an_error() {
        let backend = seeded().await;
        let schema = backend.describe_entity("nope", None).await.unwrap();
        assert_eq!(schema["columns"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn views_and_search() {
        let backend = seeded().await;
        let views = backend.list_views(None).await.unwrap();
        assert_eq!(views, serde_json::json!(["named_users"]));

        let def = backend.describe_view("named_users", None).await.unwrap();
        assert!(def["definition"].as_str().unwrap().contains("SELECT name"));

        let hits = backend.search_entities("use", None).await.unwrap();
        assert_eq!(hits, serde_json::json!(["users"]));
        let misses = backend.search_entities("zzz", None).await.unwrap();
        assert_eq!(misses, serde_json::json!([]));
    }

    #[tokio::test]
    async fn stats_size_and_plan() {
        let backend = seeded().await;
        let stats = backend.entity_stats("users", None).await.unwrap();
        assert_eq!(stats["row_count"], 2);
        assert_eq!(stats["column_count"], 2);

        let size = backend.entity_size("users", None).await.unwrap();
        assert!(size["database_bytes"].as_i64().unwrap() > 0);

        let plan = backend.explain("SELECT * FROM users").await.unwrap();
        assert!(plan["row_count"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn stats_and_size_for_missing_table_are_null_not_an_error() {
        let backend = seeded().await;
        let stats = backend.entity_stats("nope", None).await.unwrap();
        assert_eq!(stats["row_count"], serde_json::Value::Null);
        assert_eq!(stats["column_count"], serde_json::Value::Null);

        let size = backend.entity_size("nope", None).await.unwrap();
        assert_eq!(size["database_bytes"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn foreign_keys_empty_without_references() {
        let backend = seeded().await;
        let fks = backend.list_foreign_keys("users", None).await.unwrap();
        assert_eq!(fks["row_count"], 0);
    }
}
