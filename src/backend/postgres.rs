//! PostgreSQL adapter. Ad-hoc retrievals go through the simple-query
//! protocol (text-mode rows); introspection uses parameterized queries
//! against the catalogs.

use serde_json::{json, Map, Value};
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

use super::{statement_tag, BackendKind, DatabaseBackend};
use crate::error::BackendError;

pub struct PostgresBackend {
    client: Client,
}

impl PostgresBackend {
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let (client, connection) = tokio_postgres::connect(url, NoTls)
            .await
            .map_err(BackendError::driver)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("postgres connection terminated: {e}");
            }
        });
        Ok(Self { client })
    }

    fn default_schema(scope: Option<&str>) -> &str {
        scope.unwrap_or("public")
    }

    async fn names(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<String>, BackendError> {
        let rows = self
            .client
            .query(sql, params)
            .await
            .map_err(BackendError::driver)?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }
}

fn simple_rows_to_json(messages: Vec<SimpleQueryMessage>) -> Value {
    let mut columns: Vec<String> = Vec::new();
    let mut rows = Vec::new();
    for message in messages {
        if let SimpleQueryMessage::Row(row) = message {
            if columns.is_empty() {
                columns = row.columns().iter().map(|c| c.name().to_string()).collect();
            }
            let mut obj = Map::new();
            for (i, col) in row.columns().iter().enumerate() {
                let cell = row
                    .get(i)
                    .map(|v| Value::String(v.to_string()))
                    .unwrap_or(Value::Null);
                obj.insert(col.name().to_string(), cell);
            }
            rows.push(Value::Object(obj));
        }
    }
    json!({ "columns": columns, "rows": rows, "row_count": rows.len() })
}

#[async_trait::async_trait]
impl DatabaseBackend for PostgresBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn query(&self, statement: &str) -> Result<Value, BackendError> {
        let messages = self
            .client
            .simple_query(statement)
            .await
            .map_err(BackendError::driver)?;
        Ok(simple_rows_to_json(messages))
    }

    async fn execute(&self, statement: &str) -> Result<Value, BackendError> {
        let affected = self
            .client
            .execute(statement, &[])
            .await
            .map_err(BackendError::driver)?;
        Ok(json!({
            "operation": statement_tag(statement),
            "rows_affected": affected,
        }))
    }

    async fn list_entities(&self, scope: Option<&str>) -> Result<Value, BackendError> {
        let schema = Self::default_schema(scope);
        let names = self
            .names(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE' \
                 ORDER BY table_name",
                &[&schema],
            )
            .await?;
        Ok(json!(names))
    }

    async fn describe_entity(
        &self,
        name: &str,
        scope: Option<&str>,
    ) -> Result<Value, BackendError> {
        let schema = Self::default_schema(scope);
        let rows = self
            .client
            .query(
                "SELECT column_name, data_type, is_nullable, column_default \
                 FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 \
                 ORDER BY ordinal_position",
                &[&schema, &name],
            )
            .await
            .map_err(BackendError::driver)?;
        let columns: Vec<Value> = rows
            .iter()
            .map(|row| {
                json!({
                    "name": row.get::<_, String>(0),
                    "type": row.get::<_, String>(1),
                    "nullable": row.get::<_, String>(2) == "YES",
                    "default": row.get::<_, Option<String>>(3),
                })
            })
            .collect();
        Ok(json!({ "table": name, "schema": schema, "columns": columns }))
    }

    async fn list_scopes(&self) -> Result<Value, BackendError> {
        let names = self
            .names(
                "SELECT schema_name FROM information_schema.schemata ORDER BY schema_name",
                &[],
            )
            .await?;
        Ok(json!(names))
    }

    async fn explain(&self, statement: &str) -> Result<Value, BackendError> {
        let sql = super::explain_sql(statement);
        let messages = self
            .client
            .simple_query(&sql)
            .await
            .map_err(BackendError::driver)?;
        Ok(simple_rows_to_json(messages))
    }

    async fn list_indexes(&self, name: &str, scope: Option<&str>) -> Result<Value, BackendError> {
        let schema = Self::default_schema(scope);
        let rows = self
            .client
            .query(
                "SELECT indexname, indexdef FROM pg_indexes \
                 WHERE schemaname = $1 AND tablename = $2 ORDER BY indexname",
                &[&schema, &name],
            )
            .await
            .map_err(BackendError::driver)?;
        let indexes: Vec<Value> = rows
            .iter()
            .map(|row| {
                json!({
                    "name": row.get::<_, String>(0),
                    "definition": row.get::<_, String>(1),
                })
            })
            .collect();
        Ok(json!(indexes))
    }

    async fn list_foreign_keys(
        &self,
        name: &str,
        scope: Option<&str>,
    ) -> Result<Value, BackendError> {
        let schema = Self::default_schema(scope);
        let rows = self
            .client
            .query(
                "SELECT tc.constraint_name, kcu.column_name, \
                        ccu.table_name, ccu.column_name \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON tc.constraint_name = kcu.constraint_name \
                  AND tc.table_schema = kcu.table_schema \
                 JOIN information_schema.constraint_column_usage ccu \
                   ON tc.constraint_name = ccu.constraint_name \
                  AND tc.table_schema = ccu.table_schema \
                 WHERE tc.constraint_type = 'FOREIGN KEY' \
                   AND tc.table_schema = $1 AND tc.table_name = $2 \
                 ORDER BY tc.constraint_name",
                &[&schema, &name],
            )
            .await
            .map_err(BackendError::driver)?;
        let keys: Vec<Value> = rows
            .iter()
            .map(|row| {
                json!({
                    "name": row.get::<_, String>(0),
                    "column": row.get::<_, String>(1),
                    "referenced_table": row.get::<_, String>(2),
                    "referenced_column": row.get::<_, String>(3),
                })
            })
            .collect();
        Ok(json!(keys))
    }

    async fn entity_size(&self, name: &str, scope: Option<&str>) -> Result<Value, BackendError> {
        let schema = Self::default_schema(scope);
        // to_regclass returns NULL for a missing relation instead of erroring
        let row = self
            .client
            .query_one(
                "SELECT pg_total_relation_size(to_regclass(format('%I.%I', $1::text, $2::text))), \
                        pg_size_pretty(pg_total_relation_size(to_regclass(format('%I.%I', $1::text, $2::text))))",
                &[&schema, &name],
            )
            .await
            .map_err(BackendError::driver)?;
        Ok(json!({
            "table": name,
            "schema": schema,
            "bytes": row.get::<_, Option<i64>>(0),
            "pretty": row.get::<_, Option<String>>(1),
        }))
    }

    async fn list_views(&self, scope: Option<&str>) -> Result<Value, BackendError> {
        let schema = Self::default_schema(scope);
        let names = self
            .names(
                "SELECT table_name FROM information_schema.views \
                 WHERE table_schema = $1 ORDER BY table_name",
                &[&schema],
            )
            .await?;
        Ok(json!(names))
    }

    async fn describe_view(&self, name: &str, scope: Option<&str>) -> Result<Value, BackendError> {
        let schema = Self::default_schema(scope);
        let row = self
            .client
            .query_opt(
                "SELECT view_definition FROM information_schema.views \
                 WHERE table_schema = $1 AND table_name = $2",
                &[&schema, &name],
            )
            .await
            .map_err(BackendError::driver)?;
        let definition = row.and_then(|r| r.get::<_, Option<String>>(0));
        Ok(json!({ "view": name, "schema": schema, "definition": definition }))
    }

    async fn search_entities(
        &self,
        pattern: &str,
        scope: Option<&str>,
    ) -> Result<Value, BackendError> {
        let schema = Self::default_schema(scope);
        let like = format!("%{pattern}%");
        let names = self
            .names(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_name ILIKE $2 \
                 ORDER BY table_name",
                &[&schema, &like],
            )
            .await?;
        Ok(json!(names))
    }

    async fn entity_stats(&self, name: &str, scope: Option<&str>) -> Result<Value, BackendError> {
        let schema = Self::default_schema(scope);
        let row = self
            .client
            .query_opt(
                "SELECT c.reltuples::bigint, c.relpages::bigint \
                 FROM pg_class c \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relname = $2",
                &[&schema, &name],
            )
            .await
            .map_err(BackendError::driver)?;
        match row {
            Some(row) => Ok(json!({
                "table": name,
                "schema": schema,
                "estimated_rows": row.get::<_, i64>(0),
                "pages": row.get::<_, i64>(1),
            })),
            None => Ok(json!({ "table": name, "schema": schema, "estimated_rows": Value::Null })),
        }
    }
}
