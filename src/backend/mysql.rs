//! MySQL adapter over a `mysql_async` pool. Schema scope defaults to the
//! connection's current database via COALESCE(?, DATABASE()).

use mysql_async::prelude::Queryable;
use mysql_async::{Opts, Pool, Row, Value as SqlValue};
use serde_json::{json, Map, Value};

use super::{statement_tag, BackendKind, DatabaseBackend};
use crate::error::BackendError;

pub struct MySqlBackend {
    pool: Pool,
}

impl MySqlBackend {
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let opts = Opts::from_url(url).map_err(BackendError::driver)?;
        let pool = Pool::new(opts);
        // Fail at startup, not on the first invocation.
        pool.get_conn().await.map_err(BackendError::driver)?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<mysql_async::Conn, BackendError> {
        self.pool.get_conn().await.map_err(BackendError::driver)
    }

    async fn names(
        &self,
        sql: &str,
        params: impl Into<mysql_async::Params> + Send,
    ) -> Result<Vec<String>, BackendError> {
        let mut conn = self.conn().await?;
        conn.exec(sql, params).await.map_err(BackendError::driver)
    }
}

fn sql_value_to_json(value: SqlValue) -> Value {
    match value {
        SqlValue::NULL => Value::Null,
        SqlValue::Bytes(bytes) => json!(String::from_utf8_lossy(&bytes)),
        SqlValue::Int(i) => json!(i),
        SqlValue::UInt(u) => json!(u),
        SqlValue::Float(f) => json!(f),
        SqlValue::Double(d) => json!(d),
        SqlValue::Date(y, mo, d, h, mi, s, _us) => {
            json!(format!("{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}:{s:02}"))
        }
        SqlValue::Time(neg, days, h, m, s, _us) => {
            let sign = if neg { "-" } else { "" };
            json!(format!("{sign}{:02}:{m:02}:{s:02}", u32::from(h) + days * 24))
        }
    }
}

fn rows_to_json(rows: Vec<Row>) -> Value {
    let columns: Vec<String> = rows
        .first()
        .map(|row| {
            row.columns_ref()
                .iter()
                .map(|c| c.name_str().to_string())
                .collect()
        })
        .unwrap_or_default();
    let out: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            let mut obj = Map::new();
            for (name, value) in columns.iter().zip(row.unwrap()) {
                obj.insert(name.clone(), sql_value_to_json(value));
            }
            Value::Object(obj)
        })
        .collect();
    json!({ "columns": columns, "rows": out, "row_count": out.len() })
}

#[async_trait::async_trait]
impl DatabaseBackend for MySqlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::MySql
    }

    async fn query(&self, statement: &str) -> Result<Value, BackendError> {
        let mut conn = self.conn().await?;
        let mut result = conn
            .query_iter(statement)
            .await
            .map_err(BackendError::driver)?;
        let rows: Vec<Row> = result.collect().await.map_err(BackendError::driver)?;
        Ok(rows_to_json(rows))
    }

    async fn execute(&self, statement: &str) -> Result<Value, BackendError> {
        let mut conn = self.conn().await?;
        let result = conn
            .query_iter(statement)
            .await
            .map_err(BackendError::driver)?;
        let affected = result.affected_rows();
        drop(result);
        Ok(json!({
            "operation": statement_tag(statement),
            "rows_affected": affected,
        }))
    }

    async fn list_entities(&self, scope: Option<&str>) -> Result<Value, BackendError> {
        let names = self
            .names(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = COALESCE(?, DATABASE()) AND table_type = 'BASE TABLE' \
                 ORDER BY table_name",
                (scope.map(str::to_string),),
            )
            .await?;
        Ok(json!(names))
    }

    async fn describe_entity(
        &self,
        name: &str,
        scope: Option<&str>,
    ) -> Result<Value, BackendError> {
        let mut conn = self.conn().await?;
        let rows: Vec<(String, String, String, Option<String>, String)> = conn
            .exec(
                "SELECT column_name, data_type, is_nullable, column_default, column_key \
                 FROM information_schema.columns \
                 WHERE table_schema = COALESCE(?, DATABASE()) AND table_name = ? \
                 ORDER BY ordinal_position",
                (scope.map(str::to_string), name.to_string()),
            )
            .await
            .map_err(BackendError::driver)?;
        let columns: Vec<Value> = rows
            .into_iter()
            .map(|(name, ty, nullable, default, key)| {
                json!({
                    "name": name,
                    "type": ty,
                    "nullable": nullable == "YES",
                    "default": default,
                    "primary_key": key == "PRI",
                })
            })
            .collect();
        Ok(json!({ "table": name, "columns": columns }))
    }

    async fn list_scopes(&self) -> Result<Value, BackendError> {
        let names = self
            .names(
                "SELECT schema_name FROM information_schema.schemata ORDER BY schema_name",
                (),
            )
            .await?;
        Ok(json!(names))
    }

    async fn explain(&self, statement: &str) -> Result<Value, BackendError> {
        let sql = super::explain_sql(statement);
        let mut conn = self.conn().await?;
        let mut result = conn.query_iter(sql).await.map_err(BackendError::driver)?;
        let rows: Vec<Row> = result.collect().await.map_err(BackendError::driver)?;
        Ok(rows_to_json(rows))
    }

    async fn list_indexes(&self, name: &str, scope: Option<&str>) -> Result<Value, BackendError> {
        let mut conn = self.conn().await?;
        let rows: Vec<(String, String, i64)> = conn
            .exec(
                "SELECT index_name, column_name, non_unique \
                 FROM information_schema.statistics \
                 WHERE table_schema = COALESCE(?, DATABASE()) AND table_name = ? \
                 ORDER BY index_name, seq_in_index",
                (scope.map(str::to_string), name.to_string()),
            )
            .await
            .map_err(BackendError::driver)?;
        let indexes: Vec<Value> = rows
            .into_iter()
            .map(|(index, column, non_unique)| {
                json!({ "name": index, "column": column, "unique": non_unique == 0 })
            })
            .collect();
        Ok(json!(indexes))
    }

    async fn list_foreign_keys(
        &self,
        name: &str,
        scope: Option<&str>,
    ) -> Result<Value, BackendError> {
        let mut conn = self.conn().await?;
        let rows: Vec<(String, String, String, String)> = conn
            .exec(
                "SELECT constraint_name, column_name, referenced_table_name, \
                        referenced_column_name \
                 FROM information_schema.key_column_usage \
                 WHERE table_schema = COALESCE(?, DATABASE()) AND table_name = ? \
                   AND referenced_table_name IS NOT NULL \
                 ORDER BY constraint_name",
                (scope.map(str::to_string), name.to_string()),
            )
            .await
            .map_err(BackendError::driver)?;
        let keys: Vec<Value> = rows
            .into_iter()
            .map(|(constraint, column, ref_table, ref_column)| {
                json!({
                    "name": constraint,
                    "column": column,
                    "referenced_table": ref_table,
                    "referenced_column": ref_column,
                })
            })
            .collect();
        Ok(json!(keys))
    }

    async fn entity_size(&self, name: &str, scope: Option<&str>) -> Result<Value, BackendError> {
        let mut conn = self.conn().await?;
        let row: Option<(Option<u64>, Option<u64>, Option<u64>)> = conn
            .exec_first(
                "SELECT data_length, index_length, table_rows \
                 FROM information_schema.tables \
                 WHERE table_schema = COALESCE(?, DATABASE()) AND table_name = ?",
                (scope.map(str::to_string), name.to_string()),
            )
            .await
            .map_err(BackendError::driver)?;
        match row {
            Some((data, index, rows)) => Ok(json!({
                "table": name,
                "data_bytes": data,
                "index_bytes": index,
                "estimated_rows": rows,
            })),
            None => Ok(json!({ "table": name, "data_bytes": Value::Null })),
        }
    }

    async fn list_views(&self, scope: Option<&str>) -> Result<Value, BackendError> {
        let names = self
            .names(
                "SELECT table_name FROM information_schema.views \
                 WHERE table_schema = COALESCE(?, DATABASE()) ORDER BY table_name",
                (scope.map(str::to_string),),
            )
            .await?;
        Ok(json!(names))
    }

    async fn describe_view(&self, name: &str, scope: Option<&str>) -> Result<Value, BackendError> {
        let mut conn = self.conn().await?;
        let definition: Option<String> = conn
            .exec_first(
                "SELECT view_definition FROM information_schema.views \
                 WHERE table_schema = COALESCE(?, DATABASE()) AND table_name = ?",
                (scope.map(str::to_string), name.to_string()),
            )
            .await
            .map_err(BackendError::driver)?;
        Ok(json!({ "view": name, "definition": definition }))
    }

    async fn search_entities(
        &self,
        pattern: &str,
        scope: Option<&str>,
    ) -> Result<Value, BackendError> {
        let names = self
            .names(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = COALESCE(?, DATABASE()) \
                   AND table_name LIKE CONCAT('%', ?, '%') \
                 ORDER BY table_name",
                (scope.map(str::to_string), pattern.to_string()),
            )
            .await?;
        Ok(json!(names))
    }

    async fn entity_stats(&self, name: &str, scope: Option<&str>) -> Result<Value, BackendError> {
        let mut conn = self.conn().await?;
        let row: Option<(Option<u64>, Option<u64>, Option<u64>)> = conn
            .exec_first(
                "SELECT table_rows, avg_row_length, data_length \
                 FROM information_schema.tables \
                 WHERE table_schema = COALESCE(?, DATABASE()) AND table_name = ?",
                (scope.map(str::to_string), name.to_string()),
            )
            .await
            .map_err(BackendError::driver)?;
        match row {
            Some((rows, avg, data)) => Ok(json!({
                "table": name,
                "estimated_rows": rows,
                "avg_row_bytes": avg,
                "data_bytes": data,
            })),
            None => Ok(json!({ "table": name, "estimated_rows": Value::Null })),
        }
    }
}
