//! The operation registry and per-backend tool catalog.
//!
//! Operations are declared once — a generic set shared by every backend
//! plus a native set contributed by the active adapter — and assembled
//! into an immutable, ordered [`Catalog`] at startup. Dispatch is a map
//! lookup, so per-invocation cost does not grow with the registry.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use crate::backend::{BackendKind, DatabaseBackend};
use crate::error::{BackendError, ConfigError, ToolError};
use crate::sqlguard;

/// Future produced by a prepared handler; awaiting it performs the
/// backend I/O.
pub type PrepareFuture = BoxFuture<'static, Result<Value, BackendError>>;

/// A handler in two phases: the synchronous part parses and classifies
/// the arguments (the Validated state), the returned future executes the
/// backend call. The policy gate runs between the two.
pub type PrepareFn =
    Box<dyn Fn(Arc<dyn DatabaseBackend>, Value) -> Result<PrepareFuture, ToolError> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: &'static str,
    pub required: bool,
    pub description: &'static str,
}

impl ParamSpec {
    pub const fn required(name: &'static str, ty: &'static str, description: &'static str) -> Self {
        Self {
            name,
            ty,
            required: true,
            description,
        }
    }

    pub const fn optional(name: &'static str, ty: &'static str, description: &'static str) -> Self {
        Self {
            name,
            ty,
            required: false,
            description,
        }
    }
}

/// Which backend kinds an operation is visible on.
#[derive(Debug, Clone, Copy)]
pub enum Applies {
    Any,
    Relational,
    Only(BackendKind),
}

impl Applies {
    pub fn includes(&self, kind: BackendKind) -> bool {
        match self {
            Applies::Any => true,
            Applies::Relational => kind.is_relational(),
            Applies::Only(k) => *k == kind,
        }
    }
}

pub struct OperationDef {
    pub name: &'static str,
    pub description: &'static str,
    pub mutating: bool,
    pub applies: Applies,
    pub params: Vec<ParamSpec>,
    pub prepare: PrepareFn,
}

impl OperationDef {
    /// JSON Schema for the declared parameter shape.
    pub fn input_schema(&self) -> Map<String, Value> {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for p in &self.params {
            properties.insert(
                p.name.to_string(),
                json!({ "type": p.ty, "description": p.description }),
            );
            if p.required {
                required.push(Value::String(p.name.to_string()));
            }
        }
        let mut schema = Map::new();
        schema.insert("type".to_string(), json!("object"));
        schema.insert("properties".to_string(), Value::Object(properties));
        if !required.is_empty() {
            schema.insert("required".to_string(), Value::Array(required));
        }
        schema
    }

    /// Check the arguments against the declared shape: required parameters
    /// must be present, and present parameters must have the declared type.
    pub fn check_args(&self, args: &Value) -> Result<(), ToolError> {
        let map = match args {
            Value::Object(map) => map,
            Value::Null => {
                if let Some(missing) = self.params.iter().find(|p| p.required) {
                    return Err(ToolError::InvalidArguments(format!(
                        "missing required parameter '{}'",
                        missing.name
                    )));
                }
                return Ok(());
            }
            _ => {
                return Err(ToolError::InvalidArguments(
                    "arguments must be an object".to_string(),
                ))
            }
        };
        for p in &self.params {
            match map.get(p.name) {
                None | Some(Value::Null) => {
                    if p.required {
                        return Err(ToolError::InvalidArguments(format!(
                            "missing required parameter '{}'",
                            p.name
                        )));
                    }
                }
                Some(value) => {
                    let ok = match p.ty {
                        "string" => value.is_string(),
                        "integer" => value.is_i64() || value.is_u64(),
                        "number" => value.is_number(),
                        "boolean" => value.is_boolean(),
                        "object" => value.is_object(),
                        "array" => value.is_array(),
                        _ => true,
                    };
                    if !ok {
                        return Err(ToolError::InvalidArguments(format!(
                            "parameter '{}' must be a {}",
                            p.name, p.ty
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

// ── Argument extraction helpers used by prepare closures ──────────────

pub fn require_str(args: &Value, key: &str) -> Result<String, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing required parameter '{key}'")))
}

pub fn optional_str(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(str::to_string)
}

pub fn require_i64(args: &Value, key: &str) -> Result<i64, ToolError> {
    args.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing required parameter '{key}'")))
}

pub fn optional_i64(args: &Value, key: &str) -> Option<i64> {
    args.get(key).and_then(Value::as_i64)
}

pub fn optional_bool(args: &Value, key: &str) -> Option<bool> {
    args.get(key).and_then(Value::as_bool)
}

pub fn require_object(args: &Value, key: &str) -> Result<Value, ToolError> {
    match args.get(key) {
        Some(v @ Value::Object(_)) => Ok(v.clone()),
        _ => Err(ToolError::InvalidArguments(format!(
            "missing required object parameter '{key}'"
        ))),
    }
}

pub fn optional_object(args: &Value, key: &str) -> Option<Value> {
    match args.get(key) {
        Some(v @ Value::Object(_)) => Some(v.clone()),
        _ => None,
    }
}

pub fn require_array(args: &Value, key: &str) -> Result<Vec<Value>, ToolError> {
    args.get(key)
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| ToolError::InvalidArguments(format!(
            "missing required array parameter '{key}'"
        )))
}

// ── Generic operation registry ────────────────────────────────────────

const SCOPE_PARAM: ParamSpec = ParamSpec::optional(
    "schema",
    "string",
    "Schema or namespace (defaults to the backend's default schema)",
);

/// The generic operation set, in catalog order.
pub fn generic_operations() -> Vec<OperationDef> {
    vec![
        OperationDef {
            name: "query",
            description: "Execute a read-only SQL statement and return the matching rows",
            mutating: false,
            applies: Applies::Relational,
            params: vec![ParamSpec::required(
                "statement",
                "string",
                "SQL statement; must be a pure retrieval (SELECT, WITH, EXPLAIN, ...)",
            )],
            prepare: Box::new(|backend, args| {
                let stmt = require_str(&args, "statement")?;
                sqlguard::ensure_retrieval(&stmt)?;
                Ok(Box::pin(async move { backend.query(&stmt).await }))
            }),
        },
        OperationDef {
            name: "execute",
            description: "Execute a mutating SQL statement and return an effect summary",
            mutating: true,
            applies: Applies::Relational,
            params: vec![ParamSpec::required(
                "statement",
                "string",
                "SQL statement (INSERT, UPDATE, DELETE, DDL, ...)",
            )],
            prepare: Box::new(|backend, args| {
                let stmt = require_str(&args, "statement")?;
                Ok(Box::pin(async move { backend.execute(&stmt).await }))
            }),
        },
        OperationDef {
            name: "list_tables",
            description: "List tables, collections, keys, or directory entries",
            mutating: false,
            applies: Applies::Any,
            params: vec![SCOPE_PARAM],
            prepare: Box::new(|backend, args| {
                let scope = optional_str(&args, "schema");
                Ok(Box::pin(async move {
                    backend.list_entities(scope.as_deref()).await
                }))
            }),
        },
        OperationDef {
            name: "describe_table",
            description: "Describe the structure of a table, collection, key, or entry",
            mutating: false,
            applies: Applies::Any,
            params: vec![
                ParamSpec::required("table", "string", "Entity name to describe"),
                SCOPE_PARAM,
            ],
            prepare: Box::new(|backend, args| {
                let name = require_str(&args, "table")?;
                let scope = optional_str(&args, "schema");
                Ok(Box::pin(async move {
                    backend.describe_entity(&name, scope.as_deref()).await
                }))
            }),
        },
        OperationDef {
            name: "list_schemas",
            description: "List schemas or databases; empty for backends without namespaces",
            mutating: false,
            applies: Applies::Any,
            params: Vec::new(),
            prepare: Box::new(|backend, _args| {
                Ok(Box::pin(async move { backend.list_scopes().await }))
            }),
        },
        OperationDef {
            name: "explain_query",
            description: "Show the execution plan for a read-only SQL statement",
            mutating: false,
            applies: Applies::Relational,
            params: vec![ParamSpec::required(
                "statement",
                "string",
                "SQL statement to explain; must be a pure retrieval",
            )],
            prepare: Box::new(|backend, args| {
                let stmt = require_str(&args, "statement")?;
                sqlguard::ensure_retrieval(&stmt)?;
                Ok(Box::pin(async move { backend.explain(&stmt).await }))
            }),
        },
        OperationDef {
            name: "get_indexes",
            description: "List indexes of an entity; empty where indexes do not apply",
            mutating: false,
            applies: Applies::Any,
            params: vec![
                ParamSpec::required("table", "string", "Entity name"),
                SCOPE_PARAM,
            ],
            prepare: Box::new(|backend, args| {
                let name = require_str(&args, "table")?;
                let scope = optional_str(&args, "schema");
                Ok(Box::pin(async move {
                    backend.list_indexes(&name, scope.as_deref()).await
                }))
            }),
        },
        OperationDef {
            name: "get_foreign_keys",
            description: "List foreign keys of a table; empty where the concept is absent",
            mutating: false,
            applies: Applies::Any,
            params: vec![
                ParamSpec::required("table", "string", "Entity name"),
                SCOPE_PARAM,
            ],
            prepare: Box::new(|backend, args| {
                let name = require_str(&args, "table")?;
                let scope = optional_str(&args, "schema");
                Ok(Box::pin(async move {
                    backend.list_foreign_keys(&name, scope.as_deref()).await
                }))
            }),
        },
        OperationDef {
            name: "get_table_size",
            description: "Report the storage footprint of an entity",
            mutating: false,
            applies: Applies::Any,
            params: vec![
                ParamSpec::required("table", "string", "Entity name"),
                SCOPE_PARAM,
            ],
            prepare: Box::new(|backend, args| {
                let name = require_str(&args, "table")?;
                let scope = optional_str(&args, "schema");
                Ok(Box::pin(async move {
                    backend.entity_size(&name, scope.as_deref()).await
                }))
            }),
        },
        OperationDef {
            name: "list_views",
            description: "List views; empty where views do not apply",
            mutating: false,
            applies: Applies::Any,
            params: vec![SCOPE_PARAM],
            prepare: Box::new(|backend, args| {
                let scope = optional_str(&args, "schema");
                Ok(Box::pin(async move {
                    backend.list_views(scope.as_deref()).await
                }))
            }),
        },
        OperationDef {
            name: "describe_view",
            description: "Show the definition of a view",
            mutating: false,
            applies: Applies::Any,
            params: vec![
                ParamSpec::required("view", "string", "View name"),
                SCOPE_PARAM,
            ],
            prepare: Box::new(|backend, args| {
                let name = require_str(&args, "view")?;
                let scope = optional_str(&args, "schema");
                Ok(Box::pin(async move {
                    backend.describe_view(&name, scope.as_deref()).await
                }))
            }),
        },
        OperationDef {
            name: "search_tables",
            description: "Find entities whose name contains a substring",
            mutating: false,
            applies: Applies::Any,
            params: vec![
                ParamSpec::required("pattern", "string", "Substring to match against names"),
                SCOPE_PARAM,
            ],
            prepare: Box::new(|backend, args| {
                let pattern = require_str(&args, "pattern")?;
                let scope = optional_str(&args, "schema");
                Ok(Box::pin(async move {
                    backend.search_entities(&pattern, scope.as_deref()).await
                }))
            }),
        },
        OperationDef {
            name: "get_table_stats",
            description: "Report row counts and related statistics for an entity",
            mutating: false,
            applies: Applies::Any,
            params: vec![
                ParamSpec::required("table", "string", "Entity name"),
                SCOPE_PARAM,
            ],
            prepare: Box::new(|backend, args| {
                let name = require_str(&args, "table")?;
                let scope = optional_str(&args, "schema");
                Ok(Box::pin(async move {
                    backend.entity_stats(&name, scope.as_deref()).await
                }))
            }),
        },
    ]
}

// ── Catalog ───────────────────────────────────────────────────────────

/// The ordered operation set visible for the active backend kind.
/// Built once at startup; listing it is deterministic and idempotent.
pub struct Catalog {
    kind: BackendKind,
    ops: Vec<OperationDef>,
    index: HashMap<&'static str, usize>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("kind", &self.kind)
            .field(
                "ops",
                &self.ops.iter().map(|op| op.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Catalog {
    /// Assemble the catalog for the adapter's kind: generic registry plus
    /// the adapter's native registry, filtered by applicability.
    pub fn build(backend: Arc<dyn DatabaseBackend>) -> Result<Self, ConfigError> {
        let kind = backend.kind();
        let mut ops = generic_operations();
        ops.extend(backend.native_operations());
        Self::assemble(kind, ops)
    }

    fn assemble(kind: BackendKind, mut ops: Vec<OperationDef>) -> Result<Self, ConfigError> {
        ops.retain(|op| op.applies.includes(kind));
        let mut index = HashMap::with_capacity(ops.len());
        for (i, op) in ops.iter().enumerate() {
            if index.insert(op.name, i).is_some() {
                return Err(ConfigError::DuplicateOperation(op.name.to_string()));
            }
        }
        Ok(Self { kind, ops, index })
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Look up a dispatchable operation. An operation registered for a
    /// different kind was filtered out at build time, so to the caller it
    /// is indistinguishable from one that never existed.
    pub fn get(&self, name: &str) -> Option<&OperationDef> {
        self.index.get(name).map(|&i| &self.ops[i])
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperationDef> {
        self.ops.iter()
    }

    /// The MCP tool listing, in catalog order.
    pub fn tools(&self) -> Vec<rmcp::model::Tool> {
        self.ops
            .iter()
            .map(|op| {
                rmcp::model::Tool::new(
                    op.name,
                    op.description,
                    Arc::new(op.input_schema()),
                )
            })
            .collect()
    }
}
