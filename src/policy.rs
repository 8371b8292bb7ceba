use crate::catalog::OperationDef;
use crate::error::ToolError;

/// Values of the read-only override that switch the server into
/// read-write mode, compared case-insensitively. Anything else — including
/// an unset or empty variable — leaves the server read-only.
pub const FALSE_TOKENS: &[&str] = &["false", "0", "no", "off"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMode {
    ReadOnly,
    ReadWrite,
}

impl PolicyMode {
    pub fn is_read_only(self) -> bool {
        self == PolicyMode::ReadOnly
    }
}

impl std::fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyMode::ReadOnly => write!(f, "read-only"),
            PolicyMode::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// Resolve the policy mode from the raw override value.
///
/// Fail-safe: only an exact false token enables writes.
pub fn resolve(raw: Option<&str>) -> PolicyMode {
    match raw {
        Some(value) if FALSE_TOKENS.contains(&value.trim().to_ascii_lowercase().as_str()) => {
            PolicyMode::ReadWrite
        }
        _ => PolicyMode::ReadOnly,
    }
}

/// The policy gate: rejects mutating operations under read-only mode.
/// Called after validation and before any backend I/O.
pub fn check_allowed(mode: PolicyMode, op: &OperationDef) -> Result<(), ToolError> {
    if mode.is_read_only() && op.mutating {
        return Err(ToolError::PolicyViolation);
    }
    Ok(())
}
