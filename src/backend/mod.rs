//! The backend capability interface and its adapter implementations.
//!
//! Every backend family implements [`DatabaseBackend`]: a fixed set of
//! introspection operations plus a registry of backend-native operations
//! (the escape hatch). The dispatcher only ever sees the trait object;
//! the concrete adapter is chosen once at startup from [`BackendKind`].

pub mod ldap;
pub mod mongo;
pub mod mysql;
pub mod postgres;
pub mod redis;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::catalog::OperationDef;
use crate::config::Config;
use crate::error::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Postgres,
    MySql,
    Sqlite,
    Redis,
    MongoDb,
    Ldap,
}

impl BackendKind {
    pub const ALL: [BackendKind; 6] = [
        BackendKind::Postgres,
        BackendKind::MySql,
        BackendKind::Sqlite,
        BackendKind::Redis,
        BackendKind::MongoDb,
        BackendKind::Ldap,
    ];

    /// Relational kinds speak SQL and get the `query`/`execute`/
    /// `explain_query` operations.
    pub fn is_relational(self) -> bool {
        matches!(
            self,
            BackendKind::Postgres | BackendKind::MySql | BackendKind::Sqlite
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Postgres => "postgres",
            BackendKind::MySql => "mysql",
            BackendKind::Sqlite => "sqlite",
            BackendKind::Redis => "redis",
            BackendKind::MongoDb => "mongodb",
            BackendKind::Ldap => "ldap",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The contract every adapter satisfies, independent of native vocabulary.
///
/// Optional introspection refinements (indexes, foreign keys, views, size,
/// stats, search) return empty results on backends lacking the concept;
/// only conceptually inapplicable operations fail with
/// [`BackendError::Unsupported`]. Driver failures surface verbatim as
/// [`BackendError::Driver`] and are never retried here.
#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    /// The kind this adapter was constructed for (a stored tag).
    fn kind(&self) -> BackendKind;

    /// Execute a non-mutating retrieval statement.
    async fn query(&self, statement: &str) -> Result<Value, BackendError>;

    /// Execute a potentially mutating statement; returns an effect summary
    /// with an operation tag and affected count.
    async fn execute(&self, statement: &str) -> Result<Value, BackendError>;

    /// Enumerate top-level addressable containers (tables, collections,
    /// keys, directory entries) within an optional scope.
    async fn list_entities(&self, scope: Option<&str>) -> Result<Value, BackendError>;

    /// Structured schema of one entity; backends without a schema concept
    /// return a best-effort structural sample. A missing name yields an
    /// empty structure, never a raw driver error.
    async fn describe_entity(&self, name: &str, scope: Option<&str>)
        -> Result<Value, BackendError>;

    /// Enumerate namespaces; empty for backends without the concept.
    async fn list_scopes(&self) -> Result<Value, BackendError>;

    async fn explain(&self, statement: &str) -> Result<Value, BackendError>;

    async fn list_indexes(&self, name: &str, scope: Option<&str>) -> Result<Value, BackendError>;

    async fn list_foreign_keys(
        &self,
        name: &str,
        scope: Option<&str>,
    ) -> Result<Value, BackendError>;

    async fn entity_size(&self, name: &str, scope: Option<&str>) -> Result<Value, BackendError>;

    async fn list_views(&self, scope: Option<&str>) -> Result<Value, BackendError>;

    async fn describe_view(&self, name: &str, scope: Option<&str>)
        -> Result<Value, BackendError>;

    async fn search_entities(
        &self,
        pattern: &str,
        scope: Option<&str>,
    ) -> Result<Value, BackendError>;

    async fn entity_stats(&self, name: &str, scope: Option<&str>) -> Result<Value, BackendError>;

    /// The backend-native operation registry. Handlers capture the concrete
    /// adapter, so dispatch never needs downcasting.
    fn native_operations(self: Arc<Self>) -> Vec<OperationDef> {
        Vec::new()
    }
}

/// Construct the adapter for the configured kind. Connection failures here
/// are fatal startup errors.
pub async fn connect(config: &Config) -> Result<Arc<dyn DatabaseBackend>, BackendError> {
    let backend: Arc<dyn DatabaseBackend> = match config.backend {
        BackendKind::Sqlite => Arc::new(sqlite::SqliteBackend::open(&config.connection)?),
        BackendKind::Postgres => {
            Arc::new(postgres::PostgresBackend::connect(&config.connection).await?)
        }
        BackendKind::MySql => Arc::new(mysql::MySqlBackend::connect(&config.connection).await?),
        BackendKind::Redis => Arc::new(redis::RedisBackend::connect(&config.connection).await?),
        BackendKind::MongoDb => Arc::new(
            mongo::MongoBackend::connect(&config.connection, config.mongo_database.as_deref())
                .await?,
        ),
        BackendKind::Ldap => Arc::new(
            ldap::LdapBackend::connect(
                &config.connection,
                config.ldap_bind_dn.as_deref(),
                config.ldap_bind_password.as_deref(),
                config.ldap_base_dn.as_deref(),
            )
            .await?,
        ),
    };
    Ok(backend)
}

/// First keyword of a statement, uppercased, for effect summaries.
pub(crate) fn statement_tag(statement: &str) -> String {
    statement
        .split_whitespace()
        .next()
        .unwrap_or("UNKNOWN")
        .to_ascii_uppercase()
}

/// Wrap a statement in EXPLAIN unless it already carries one. The prefix
/// check must not slice mid-character: statements may open with multibyte
/// text inside a comment.
pub(crate) fn explain_sql(statement: &str) -> String {
    let already = statement
        .trim_start()
        .get(..7)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("explain"));
    if already {
        statement.to_string()
    } else {
        format!("EXPLAIN {statement}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_tag_is_the_first_keyword() {
        assert_eq!(statement_tag("delete from t"), "DELETE");
        assert_eq!(statement_tag("  UPDATE t SET x = 1"), "UPDATE");
        assert_eq!(statement_tag(""), "UNKNOWN");
    }

    #[test]
    fn explain_sql_wraps_plain_statements() {
        assert_eq!(explain_sql("SELECT 1"), "EXPLAIN SELECT 1");
        assert_eq!(explain_sql("  explain select 1"), "  explain select 1");
        assert_eq!(explain_sql("EXPLAIN ANALYZE SELECT 1"), "EXPLAIN ANALYZE SELECT 1");
    }

    #[test]
    fn explain_sql_survives_multibyte_openings() {
        // A multibyte comment puts a char boundary inside the first
        // seven bytes; the prefix check must not panic on it.
        assert_eq!(explain_sql("/*ééé*/SELECT 1"), "EXPLAIN /*ééé*/SELECT 1");
        assert_eq!(explain_sql("émoji"), "EXPLAIN émoji");
    }
}

#[cfg(test)]
pub(crate) mod spy {
    //! A recording backend for dispatcher and catalog tests.

    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::{BackendKind, DatabaseBackend};
    use crate::catalog::{self, Applies, OperationDef, ParamSpec};
    use crate::error::BackendError;

    pub struct SpyBackend {
        kind: BackendKind,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl SpyBackend {
        pub fn new(kind: BackendKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                calls: Arc::new(Mutex::new(Vec::new())),
            })
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn note(&self, call: &str) -> Result<Value, BackendError> {
            self.calls.lock().unwrap().push(call.to_string());
            Ok(json!({ "spy": call }))
        }
    }

    #[async_trait]
    impl DatabaseBackend for SpyBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        async fn query(&self, _statement: &str) -> Result<Value, BackendError> {
            self.note("query")
        }

        async fn execute(&self, _statement: &str) -> Result<Value, BackendError> {
            self.note("execute")
        }

        async fn list_entities(&self, _scope: Option<&str>) -> Result<Value, BackendError> {
            self.note("list_entities")
        }

        async fn describe_entity(
            &self,
            _name: &str,
            _scope: Option<&str>,
        ) -> Result<Value, BackendError> {
            self.note("describe_entity")
        }

        async fn list_scopes(&self) -> Result<Value, BackendError> {
            self.note("list_scopes")
        }

        async fn explain(&self, _statement: &str) -> Result<Value, BackendError> {
            self.note("explain")
        }

        async fn list_indexes(
            &self,
            _name: &str,
            _scope: Option<&str>,
        ) -> Result<Value, BackendError> {
            self.note("list_indexes")
        }

        async fn list_foreign_keys(
            &self,
            _name: &str,
            _scope: Option<&str>,
        ) -> Result<Value, BackendError> {
            self.note("list_foreign_keys")
        }

        async fn entity_size(
            &self,
            _name: &str,
            _scope: Option<&str>,
        ) -> Result<Value, BackendError> {
            self.note("entity_size")
        }

        async fn list_views(&self, _scope: Option<&str>) -> Result<Value, BackendError> {
            self.note("list_views")
        }

        async fn describe_view(
            &self,
            _name: &str,
            _scope: Option<&str>,
        ) -> Result<Value, BackendError> {
            self.note("describe_view")
        }

        async fn search_entities(
            &self,
            _pattern: &str,
            _scope: Option<&str>,
        ) -> Result<Value, BackendError> {
            self.note("search_entities")
        }

        async fn entity_stats(
            &self,
            _name: &str,
            _scope: Option<&str>,
        ) -> Result<Value, BackendError> {
            self.note("entity_stats")
        }

        fn native_operations(self: Arc<Self>) -> Vec<OperationDef> {
            if self.kind != BackendKind::Redis {
                return Vec::new();
            }
            let get = Arc::clone(&self);
            let set = Arc::clone(&self);
            vec![
                OperationDef {
                    name: "native_get",
                    description: "spy get",
                    mutating: false,
                    applies: Applies::Only(BackendKind::Redis),
                    params: vec![ParamSpec::required("key", "string", "key to read")],
                    prepare: Box::new(move |_, args| {
                        let me = Arc::clone(&get);
                        let _key = catalog::require_str(&args, "key")?;
                        Ok(Box::pin(async move { me.note("native_get") }))
                    }),
                },
                OperationDef {
                    name: "native_set",
                    description: "spy set",
                    mutating: true,
                    applies: Applies::Only(BackendKind::Redis),
                    params: vec![
                        ParamSpec::required("key", "string", "key to write"),
                        ParamSpec::required("value", "string", "value to store"),
                    ],
                    prepare: Box::new(move |_, args| {
                        let me = Arc::clone(&set);
                        let _key = catalog::require_str(&args, "key")?;
                        let _value = catalog::require_str(&args, "value")?;
                        Ok(Box::pin(async move { me.note("native_set") }))
                    }),
                },
            ]
        }
    }
}
