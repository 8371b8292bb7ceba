//! Redis adapter. Keys play the role of entities; the native registry
//! carries the point operations (get/set/delete/keys/ttl/expire) that
//! have no generic counterpart.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::{json, Value};

use super::{BackendKind, DatabaseBackend};
use crate::catalog::{self, Applies, OperationDef, ParamSpec};
use crate::error::BackendError;

/// Upper bound on keys returned by a single enumeration.
const SCAN_LIMIT: usize = 1000;

pub struct RedisBackend {
    manager: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(url).map_err(BackendError::driver)?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(BackendError::driver)?;
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Cursor-based key enumeration, capped at [`SCAN_LIMIT`].
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        let mut conn = self.conn();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(BackendError::driver)?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 || keys.len() >= SCAN_LIMIT {
                break;
            }
        }
        keys.truncate(SCAN_LIMIT);
        keys.sort();
        Ok(keys)
    }

    async fn key_type(&self, key: &str) -> Result<String, BackendError> {
        let mut conn = self.conn();
        redis::cmd("TYPE")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(BackendError::driver)
    }

    async fn key_length(&self, key: &str, ty: &str) -> Result<Option<i64>, BackendError> {
        let mut conn = self.conn();
        let len: Option<i64> = match ty {
            "string" => conn.strlen(key).await.map_err(BackendError::driver)?,
            "list" => conn.llen(key).await.map_err(BackendError::driver)?,
            "hash" => conn.hlen(key).await.map_err(BackendError::driver)?,
            "set" => conn.scard(key).await.map_err(BackendError::driver)?,
            "zset" => conn.zcard(key).await.map_err(BackendError::driver)?,
            _ => None,
        };
        Ok(len)
    }

    async fn get_value(&self, key: &str) -> Result<Value, BackendError> {
        let mut conn = self.conn();
        let value: Option<String> = conn.get(key).await.map_err(BackendError::driver)?;
        Ok(json!({ "key": key, "value": value }))
    }

    async fn set_value(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: Option<i64>,
    ) -> Result<Value, BackendError> {
        let mut conn = self.conn();
        match ttl_seconds {
            Some(secs) if secs > 0 => {
                let _: () = conn
                    .set_ex(key, value, secs as u64)
                    .await
                    .map_err(BackendError::driver)?;
            }
            _ => {
                let _: () = conn.set(key, value).await.map_err(BackendError::driver)?;
            }
        }
        Ok(json!({ "key": key, "stored": true, "ttl_seconds": ttl_seconds }))
    }

    async fn delete_key(&self, key: &str) -> Result<Value, BackendError> {
        let mut conn = self.conn();
        let removed: i64 = conn.del(key).await.map_err(BackendError::driver)?;
        Ok(json!({ "key": key, "removed": removed }))
    }

    async fn ttl_of(&self, key: &str) -> Result<Value, BackendError> {
        let mut conn = self.conn();
        // -1: no expiry, -2: no such key
        let ttl: i64 = conn.ttl(key).await.map_err(BackendError::driver)?;
        Ok(json!({ "key": key, "ttl_seconds": ttl }))
    }

    async fn expire_key(&self, key: &str, seconds: i64) -> Result<Value, BackendError> {
        let mut conn = self.conn();
        let applied: bool = conn
            .expire(key, seconds)
            .await
            .map_err(BackendError::driver)?;
        Ok(json!({ "key": key, "ttl_seconds": seconds, "applied": applied }))
    }
}

/// Database names out of an `INFO keyspace` payload (`db0:keys=3,...`).
fn keyspace_databases(info: &str) -> Vec<String> {
    info.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.starts_with("db") {
                line.split(':').next().map(str::to_string)
            } else {
                None
            }
        })
        .collect()
}

fn contains_pattern(fragment: &str) -> String {
    if fragment.is_empty() {
        "*".to_string()
    } else {
        format!("*{fragment}*")
    }
}

#[async_trait::async_trait]
impl DatabaseBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn query(&self, _statement: &str) -> Result<Value, BackendError> {
        Err(BackendError::unsupported("redis does not accept SQL"))
    }

    async fn execute(&self, _statement: &str) -> Result<Value, BackendError> {
        Err(BackendError::unsupported("redis does not accept SQL"))
    }

    async fn list_entities(&self, scope: Option<&str>) -> Result<Value, BackendError> {
        let keys = self.scan_keys(scope.unwrap_or("*")).await?;
        Ok(json!(keys))
    }

    async fn describe_entity(
        &self,
        name: &str,
        _scope: Option<&str>,
    ) -> Result<Value, BackendError> {
        let ty = self.key_type(name).await?;
        if ty == "none" {
            return Ok(json!({ "key": name, "exists": false }));
        }
        let length = self.key_length(name, &ty).await?;
        let mut conn = self.conn();
        let ttl: i64 = conn.ttl(name).await.map_err(BackendError::driver)?;
        Ok(json!({
            "key": name,
            "exists": true,
            "type": ty,
            "length": length,
            "ttl_seconds": ttl,
        }))
    }

    async fn list_scopes(&self) -> Result<Value, BackendError> {
        let mut conn = self.conn();
        let info: String = redis::cmd("INFO")
            .arg("keyspace")
            .query_async(&mut conn)
            .await
            .map_err(BackendError::driver)?;
        Ok(json!(keyspace_databases(&info)))
    }

    async fn explain(&self, _statement: &str) -> Result<Value, BackendError> {
        Err(BackendError::unsupported("redis does not accept SQL"))
    }

    async fn list_indexes(&self, _name: &str, _scope: Option<&str>) -> Result<Value, BackendError> {
        Ok(json!([]))
    }

    async fn list_foreign_keys(
        &self,
        _name: &str,
        _scope: Option<&str>,
    ) -> Result<Value, BackendError> {
        Ok(json!([]))
    }

    async fn entity_size(&self, name: &str, _scope: Option<&str>) -> Result<Value, BackendError> {
        let mut conn = self.conn();
        let bytes: Option<i64> = redis::cmd("MEMORY")
            .arg("USAGE")
            .arg(name)
            .query_async(&mut conn)
            .await
            .map_err(BackendError::driver)?;
        Ok(json!({ "key": name, "bytes": bytes }))
    }

    async fn list_views(&self, _scope: Option<&str>) -> Result<Value, BackendError> {
        Ok(json!([]))
    }

    async fn describe_view(
        &self,
        name: &str,
        _scope: Option<&str>,
    ) -> Result<Value, BackendError> {
        Ok(json!({ "view": name, "definition": Value::Null }))
    }

    async fn search_entities(
        &self,
        pattern: &str,
        _scope: Option<&str>,
    ) -> Result<Value, BackendError> {
        let keys = self.scan_keys(&contains_pattern(pattern)).await?;
        Ok(json!(keys))
    }

    async fn entity_stats(&self, name: &str, _scope: Option<&str>) -> Result<Value, BackendError> {
        let ty = self.key_type(name).await?;
        if ty == "none" {
            return Ok(json!({ "key": name, "exists": false }));
        }
        let length = self.key_length(name, &ty).await?;
        Ok(json!({ "key": name, "exists": true, "type": ty, "length": length }))
    }

    fn native_operations(self: Arc<Self>) -> Vec<OperationDef> {
        let only = Applies::Only(BackendKind::Redis);
        let get = Arc::clone(&self);
        let set = Arc::clone(&self);
        let delete = Arc::clone(&self);
        let keys = Arc::clone(&self);
        let ttl = Arc::clone(&self);
        let expire = Arc::clone(&self);
        vec![
            OperationDef {
                name: "native_get",
                description: "Read the string value stored at a key",
                mutating: false,
                applies: only,
                params: vec![ParamSpec::required("key", "string", "Key to read")],
                prepare: Box::new(move |_, args| {
                    let me = Arc::clone(&get);
                    let key = catalog::require_str(&args, "key")?;
                    Ok(Box::pin(async move { me.get_value(&key).await }))
                }),
            },
            OperationDef {
                name: "native_set",
                description: "Store a string value at a key, optionally with a TTL",
                mutating: true,
                applies: only,
                params: vec![
                    ParamSpec::required("key", "string", "Key to write"),
                    ParamSpec::required("value", "string", "Value to store"),
                    ParamSpec::optional("ttl_seconds", "integer", "Expiry in seconds"),
                ],
                prepare: Box::new(move |_, args| {
                    let me = Arc::clone(&set);
                    let key = catalog::require_str(&args, "key")?;
                    let value = catalog::require_str(&args, "value")?;
                    let ttl = catalog::optional_i64(&args, "ttl_seconds");
                    Ok(Box::pin(
                        async move { me.set_value(&key, &value, ttl).await },
                    ))
                }),
            },
            OperationDef {
                name: "native_delete",
                description: "Remove a key",
                mutating: true,
                applies: only,
                params: vec![ParamSpec::required("key", "string", "Key to remove")],
                prepare: Box::new(move |_, args| {
                    let me = Arc::clone(&delete);
                    let key = catalog::require_str(&args, "key")?;
                    Ok(Box::pin(async move { me.delete_key(&key).await }))
                }),
            },
            OperationDef {
                name: "native_keys",
                description: "List keys matching a glob pattern",
                mutating: false,
                applies: only,
                params: vec![ParamSpec::required(
                    "pattern",
                    "string",
                    "Glob pattern, e.g. user:*",
                )],
                prepare: Box::new(move |_, args| {
                    let me = Arc::clone(&keys);
                    let pattern = catalog::require_str(&args, "pattern")?;
                    Ok(Box::pin(async move {
                        let found = me.scan_keys(&pattern).await?;
                        Ok(json!(found))
                    }))
                }),
            },
            OperationDef {
                name: "native_ttl",
                description: "Report the remaining time-to-live of a key",
                mutating: false,
                applies: only,
                params: vec![ParamSpec::required("key", "string", "Key to inspect")],
                prepare: Box::new(move |_, args| {
                    let me = Arc::clone(&ttl);
                    let key = catalog::require_str(&args, "key")?;
                    Ok(Box::pin(async move { me.ttl_of(&key).await }))
                }),
            },
            OperationDef {
                name: "native_expire",
                description: "Set the time-to-live of a key",
                mutating: true,
                applies: only,
                params: vec![
                    ParamSpec::required("key", "string", "Key to expire"),
                    ParamSpec::required("seconds", "integer", "Seconds until expiry"),
                ],
                prepare: Box::new(move |_, args| {
                    let me = Arc::clone(&expire);
                    let key = catalog::require_str(&args, "key")?;
                    let seconds = catalog::require_i64(&args, "seconds")?;
                    Ok(Box::pin(async move { me.expire_key(&key, seconds).await }))
                }),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyspace_parse_picks_db_lines() {
        let info = "# Keyspace\r\ndb0:keys=12,expires=0,avg_ttl=0\r\ndb3:keys=1,expires=1,avg_ttl=5\r\n";
        assert_eq!(keyspace_databases(info), vec!["db0", "db3"]);
    }

    #[test]
    fn keyspace_parse_handles_empty_server() {
        assert_eq!(keyspace_databases("# Keyspace\r\n"), Vec::<String>::new());
    }

    #[test]
    fn search_pattern_wraps_fragment() {
        assert_eq!(contains_pattern("sess"), "*sess*");
        assert_eq!(contains_pattern(""), "*");
    }
}
