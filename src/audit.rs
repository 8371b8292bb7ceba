use std::fs::OpenOptions;
use std::io::Write;

use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// One JSON line per tool invocation: what was called, whether the policy
/// gate let it through, and how it went.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub operation: String,
    pub arguments: Value,
    pub decision: &'static str,
    pub outcome: &'static str,
    pub duration_ms: u64,
}

impl AuditRecord {
    pub fn now(
        operation: &str,
        arguments: &Value,
        decision: &'static str,
        outcome: &'static str,
        duration_ms: u64,
    ) -> Self {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            timestamp,
            operation: operation.to_string(),
            arguments: arguments.clone(),
            decision,
            outcome,
            duration_ms,
        }
    }
}

/// Append-only audit sink. Write failures are logged and swallowed; the
/// audit trail never fails a tool call.
#[derive(Clone)]
pub struct AuditLogger {
    path: String,
}

impl AuditLogger {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub async fn record(&self, record: AuditRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("audit record serialization failed: {e}");
                return;
            }
        };
        let path = self.path.clone();
        let write = tokio::task::spawn_blocking(move || append_line(&path, &line));
        if let Err(e) = write.await {
            tracing::error!("audit write task panicked: {e}");
        }
    }
}

fn append_line(path: &str, line: &str) {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(mut file) => {
            if let Err(e) = writeln!(file, "{line}") {
                tracing::warn!("audit log write failed: {e}");
            }
        }
        Err(e) => {
            tracing::warn!("audit log open failed ({path}): {e}");
        }
    }
}
