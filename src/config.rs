//! Environment configuration. Everything is resolved once at startup into
//! an immutable `Config`; resolution failures are fatal.

use crate::backend::BackendKind;
use crate::error::ConfigError;
use crate::policy::{self, PolicyMode};

/// Default paths for the audit log, production first.
const DEFAULT_AUDIT_LOG: &str = "/var/log/polystored/audit.log";
const DEV_AUDIT_LOG: &str = "audit.log";

const DEFAULT_BIND: &str = "127.0.0.1:8970";

#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendKind,
    pub connection: String,
    pub policy: PolicyMode,
    pub bind: String,
    pub audit_log: String,
    pub mongo_database: Option<String>,
    pub ldap_bind_dn: Option<String>,
    pub ldap_bind_password: Option<String>,
    pub ldap_base_dn: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve the configuration through a lookup closure so tests never
    /// touch the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw = lookup("POLYSTORE_BACKEND").ok_or(ConfigError::MissingBackend)?;
        let backend = parse_backend(&raw)?;

        let key = connection_key(backend);
        let connection = lookup(key)
            .or_else(|| lookup("DATABASE_URL"))
            .ok_or(ConfigError::MissingConnection { key })?;

        let policy = policy::resolve(lookup("POLYSTORE_READ_ONLY").as_deref());
        let bind = lookup("POLYSTORE_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let audit_log = lookup("POLYSTORE_AUDIT_LOG").unwrap_or_else(default_audit_path);

        Ok(Self {
            backend,
            connection,
            policy,
            bind,
            audit_log,
            mongo_database: lookup("MONGODB_DATABASE"),
            ldap_bind_dn: lookup("LDAP_BIND_DN"),
            ldap_bind_password: lookup("LDAP_BIND_PASSWORD"),
            ldap_base_dn: lookup("LDAP_BASE_DN"),
        })
    }
}

/// The recognized backend selection tokens.
pub fn parse_backend(token: &str) -> Result<BackendKind, ConfigError> {
    match token.trim().to_ascii_lowercase().as_str() {
        "postgres" | "postgresql" => Ok(BackendKind::Postgres),
        "mysql" | "mariadb" => Ok(BackendKind::MySql),
        "sqlite" | "sqlite3" => Ok(BackendKind::Sqlite),
        "redis" => Ok(BackendKind::Redis),
        "mongodb" | "mongo" => Ok(BackendKind::MongoDb),
        "ldap" => Ok(BackendKind::Ldap),
        other => Err(ConfigError::UnknownBackend(other.to_string())),
    }
}

/// Per-backend connection key; each falls back to DATABASE_URL.
pub fn connection_key(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Postgres => "POSTGRES_URL",
        BackendKind::MySql => "MYSQL_URL",
        BackendKind::Sqlite => "SQLITE_PATH",
        BackendKind::Redis => "REDIS_URL",
        BackendKind::MongoDb => "MONGODB_URL",
        BackendKind::Ldap => "LDAP_URL",
    }
}

fn default_audit_path() -> String {
    let production = std::path::Path::new(DEFAULT_AUDIT_LOG);
    if production.parent().is_some_and(|p| p.exists()) {
        DEFAULT_AUDIT_LOG.to_string()
    } else {
        DEV_AUDIT_LOG.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars = env(pairs);
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn backend_tokens_map_to_kinds() {
        assert_eq!(parse_backend("postgres").unwrap(), BackendKind::Postgres);
        assert_eq!(parse_backend("PostgreSQL").unwrap(), BackendKind::Postgres);
        assert_eq!(parse_backend("mariadb").unwrap(), BackendKind::MySql);
        assert_eq!(parse_backend("sqlite3").unwrap(), BackendKind::Sqlite);
        assert_eq!(parse_backend("mongo").unwrap(), BackendKind::MongoDb);
        assert!(matches!(
            parse_backend("oracle"),
            Err(ConfigError::UnknownBackend(_))
        ));
    }

    #[test]
    fn missing_backend_is_fatal() {
        assert!(matches!(load(&[]), Err(ConfigError::MissingBackend)));
    }

    #[test]
    fn backend_specific_key_wins_over_database_url() {
        let config = load(&[
            ("POLYSTORE_BACKEND", "redis"),
            ("REDIS_URL", "redis://cache:6379"),
            ("DATABASE_URL", "redis://fallback:6379"),
        ])
        .unwrap();
        assert_eq!(config.connection, "redis://cache:6379");
    }

    #[test]
    fn database_url_is_the_fallback() {
        let config = load(&[
            ("POLYSTORE_BACKEND", "postgres"),
            ("DATABASE_URL", "postgres://db/app"),
        ])
        .unwrap();
        assert_eq!(config.connection, "postgres://db/app");
    }

    #[test]
    fn missing_connection_names_the_expected_key() {
        let err = load(&[("POLYSTORE_BACKEND", "mysql")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingConnection { key: "MYSQL_URL" }
        ));
    }

    #[test]
    fn policy_defaults_to_read_only() {
        let config = load(&[
            ("POLYSTORE_BACKEND", "sqlite"),
            ("SQLITE_PATH", ":memory:"),
        ])
        .unwrap();
        assert_eq!(config.policy, PolicyMode::ReadOnly);

        let config = load(&[
            ("POLYSTORE_BACKEND", "sqlite"),
            ("SQLITE_PATH", ":memory:"),
            ("POLYSTORE_READ_ONLY", "false"),
        ])
        .unwrap();
        assert_eq!(config.policy, PolicyMode::ReadWrite);
    }
}
