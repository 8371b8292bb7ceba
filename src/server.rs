//! The command router: one engine per process, dispatching invocations
//! against the active backend through the operation registry.

use rmcp::{
    handler::server::ServerHandler,
    model::*,
    service::{RequestContext, RoleServer},
    ErrorData as McpError,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::audit::{AuditLogger, AuditRecord};
use crate::backend::DatabaseBackend;
use crate::catalog::Catalog;
use crate::error::ToolError;
use crate::policy::{self, PolicyMode};

/// The MCP server handler. Holds no mutable state of its own — concurrent
/// invocations interleave as independent units of work; the adapter is
/// responsible for its own internal concurrency safety.
#[derive(Clone)]
pub struct PolystoreEngine {
    backend: Arc<dyn DatabaseBackend>,
    catalog: Arc<Catalog>,
    policy: PolicyMode,
    audit: Arc<AuditLogger>,
}

impl PolystoreEngine {
    pub fn new(
        backend: Arc<dyn DatabaseBackend>,
        catalog: Arc<Catalog>,
        policy: PolicyMode,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            backend,
            catalog,
            policy,
            audit,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Run one invocation through the pipeline and wrap the outcome in the
    /// response envelope. Errors never escape as protocol failures; the
    /// caller always gets exactly one well-formed result.
    pub async fn dispatch(&self, operation: &str, arguments: Value) -> CallToolResult {
        let start = Instant::now();
        let outcome = self.run(operation, &arguments).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(payload) => {
                self.audit
                    .record(AuditRecord::now(
                        operation,
                        &arguments,
                        "allowed",
                        "success",
                        duration_ms,
                    ))
                    .await;
                let text = serde_json::to_string(&payload).unwrap_or_default();
                CallToolResult::success(vec![Content::text(text)])
            }
            Err(err) => {
                let decision = if matches!(err, ToolError::PolicyViolation) {
                    "denied"
                } else {
                    "allowed"
                };
                self.audit
                    .record(AuditRecord::now(
                        operation,
                        &arguments,
                        decision,
                        "error",
                        duration_ms,
                    ))
                    .await;
                tracing::debug!(operation, error = %err, "invocation failed");
                CallToolResult::error(vec![Content::text(format!("Error: {err}"))])
            }
        }
    }

    /// Received → Validated → Authorized → Executed. Backend I/O happens
    /// only when the prepared future is awaited, after the policy gate.
    async fn run(&self, operation: &str, arguments: &Value) -> Result<Value, ToolError> {
        let op = self
            .catalog
            .get(operation)
            .ok_or_else(|| ToolError::UnknownOperation(operation.to_string()))?;
        op.check_args(arguments)?;
        let prepared = (op.prepare)(Arc::clone(&self.backend), arguments.clone())?;
        policy::check_allowed(self.policy, op)?;
        prepared.await.map_err(ToolError::from)
    }
}

#[allow(clippy::manual_async_fn)]
impl ServerHandler for PolystoreEngine {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "polystored".to_string(),
                title: Some("polystored data backend server".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "polystored exposes the active {} backend through a fixed tool \
                 catalog: generic retrieval and introspection operations plus \
                 backend-native ones. The server is {}.",
                self.catalog.kind(),
                self.policy
            )),
            ..Default::default()
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        async {
            Ok(ListToolsResult {
                tools: self.catalog.tools(),
                next_cursor: None,
                meta: None,
            })
        }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        async move {
            let arguments = match request.arguments {
                Some(map) => Value::Object(map),
                None => serde_json::json!({}),
            };
            Ok(self.dispatch(&request.name, arguments).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spy::SpyBackend;
    use crate::backend::BackendKind;
    use serde_json::json;

    fn engine(kind: BackendKind, policy: PolicyMode) -> (PolystoreEngine, Arc<SpyBackend>) {
        let spy = SpyBackend::new(kind);
        let backend: Arc<dyn DatabaseBackend> = spy.clone();
        let catalog = Arc::new(Catalog::build(Arc::clone(&backend)).unwrap());
        let audit = Arc::new(AuditLogger::new("ignore.log"));
        (
            PolystoreEngine::new(backend, catalog, policy, audit),
            spy,
        )
    }

    fn envelope_text(result: &CallToolResult) -> String {
        result
            .content
            .first()
            .and_then(|c| c.as_text())
            .map(|t| t.text.clone())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn unknown_operation_never_reaches_the_backend() {
        let (engine, spy) = engine(BackendKind::Sqlite, PolicyMode::ReadOnly);
        let result = engine.dispatch("native_flush", json!({})).await;
        assert_eq!(result.is_error, Some(true));
        assert!(envelope_text(&result).starts_with("Error: unknown operation"));
        assert!(spy.calls().is_empty());
    }

    #[tokio::test]
    async fn operation_for_another_kind_is_unknown() {
        // native_set exists for the key-value backend only; a relational
        // caller must not learn that.
        let (engine, spy) = engine(BackendKind::Sqlite, PolicyMode::ReadWrite);
        let result = engine
            .dispatch("native_set", json!({"key": "k", "value": "v"}))
            .await;
        assert!(envelope_text(&result).starts_with("Error: unknown operation"));
        assert!(spy.calls().is_empty());
    }

    #[tokio::test]
    async fn mutating_operation_is_blocked_read_only_without_backend_call() {
        let (engine, spy) = engine(BackendKind::Sqlite, PolicyMode::ReadOnly);
        let result = engine
            .dispatch("execute", json!({"statement": "DELETE FROM t"}))
            .await;
        assert_eq!(result.is_error, Some(true));
        assert_eq!(
            envelope_text(&result),
            "Error: write operations are disabled: server is running in read-only mode"
        );
        assert!(spy.calls().is_empty());
    }

    #[tokio::test]
    async fn mutating_operation_runs_under_read_write() {
        let (engine, spy) = engine(BackendKind::Sqlite, PolicyMode::ReadWrite);
        let result = engine
            .dispatch("execute", json!({"statement": "DELETE FROM t"}))
            .await;
        assert_ne!(result.is_error, Some(true));
        assert_eq!(spy.calls(), vec!["execute".to_string()]);
    }

    #[tokio::test]
    async fn non_mutating_operation_reaches_backend_under_read_only() {
        let (engine, spy) = engine(BackendKind::Sqlite, PolicyMode::ReadOnly);
        let result = engine.dispatch("list_tables", json!({})).await;
        assert_ne!(result.is_error, Some(true));
        assert_eq!(spy.calls(), vec!["list_entities".to_string()]);
    }

    #[tokio::test]
    async fn query_rejects_mutating_statement_before_backend() {
        let (engine, spy) = engine(BackendKind::Sqlite, PolicyMode::ReadWrite);
        let result = engine
            .dispatch("query", json!({"statement": "DROP TABLE t"}))
            .await;
        assert_eq!(result.is_error, Some(true));
        assert!(envelope_text(&result).contains("not a read-only query"));
        assert!(spy.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_required_argument_is_rejected() {
        let (engine, spy) = engine(BackendKind::Sqlite, PolicyMode::ReadOnly);
        let result = engine.dispatch("describe_table", json!({})).await;
        assert!(envelope_text(&result).starts_with("Error: invalid arguments"));
        assert!(spy.calls().is_empty());
    }

    #[tokio::test]
    async fn native_mutating_operation_honors_the_gate() {
        let (engine, spy) = engine(BackendKind::Redis, PolicyMode::ReadOnly);
        let denied = engine
            .dispatch("native_set", json!({"key": "k", "value": "v"}))
            .await;
        assert_eq!(denied.is_error, Some(true));
        assert!(spy.calls().is_empty());

        let (engine, spy) = self::engine(BackendKind::Redis, PolicyMode::ReadWrite);
        let ok = engine
            .dispatch("native_set", json!({"key": "k", "value": "v"}))
            .await;
        assert_ne!(ok.is_error, Some(true));
        assert_eq!(spy.calls(), vec!["native_set".to_string()]);

        let read = engine.dispatch("native_get", json!({"key": "k"})).await;
        assert_ne!(read.is_error, Some(true));
        assert_eq!(
            spy.calls(),
            vec!["native_set".to_string(), "native_get".to_string()]
        );
    }

    #[tokio::test]
    async fn success_envelope_is_json_text() {
        let (engine, _spy) = engine(BackendKind::Sqlite, PolicyMode::ReadOnly);
        let result = engine.dispatch("list_schemas", json!({})).await;
        let text = envelope_text(&result);
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, json!({"spy": "list_scopes"}));
    }
}
