//! LDAP adapter. Directory entries play the role of entities and the
//! base DN is the default scope. The native registry carries raw
//! directory operations (search/add/modify/remove).

use std::collections::HashSet;
use std::sync::Arc;

use ldap3::{ldap_escape, Ldap, LdapConnAsync, Mod, Scope, SearchEntry};
use serde_json::{json, Map, Value};

use super::{BackendKind, DatabaseBackend};
use crate::catalog::{self, Applies, OperationDef, ParamSpec};
use crate::error::{BackendError, ToolError};

/// LDAP resultCode for noSuchObject.
const NO_SUCH_OBJECT: u32 = 32;

pub struct LdapBackend {
    ldap: Ldap,
    base_dn: String,
    naming_contexts: Vec<String>,
}

impl LdapBackend {
    pub async fn connect(
        url: &str,
        bind_dn: Option<&str>,
        bind_password: Option<&str>,
        base_dn: Option<&str>,
    ) -> Result<Self, BackendError> {
        let (conn, mut ldap) = LdapConnAsync::new(url).await.map_err(BackendError::driver)?;
        ldap3::drive!(conn);
        if let (Some(dn), Some(password)) = (bind_dn, bind_password) {
            ldap.simple_bind(dn, password)
                .await
                .map_err(BackendError::driver)?
                .success()
                .map_err(BackendError::driver)?;
        }
        let naming_contexts = root_naming_contexts(&mut ldap).await?;
        let base_dn = match base_dn {
            Some(dn) => dn.to_string(),
            None => naming_contexts.first().cloned().ok_or_else(|| {
                BackendError::driver(
                    "server advertises no naming context and LDAP_BASE_DN is unset",
                )
            })?,
        };
        Ok(Self {
            ldap,
            base_dn,
            naming_contexts,
        })
    }

    fn handle(&self) -> Ldap {
        self.ldap.clone()
    }

    async fn search_json(
        &self,
        base: &str,
        scope: Scope,
        filter: &str,
        attrs: Vec<String>,
    ) -> Result<Value, BackendError> {
        let mut ldap = self.handle();
        let (entries, _) = ldap
            .search(base, scope, filter, attrs)
            .await
            .map_err(BackendError::driver)?
            .success()
            .map_err(BackendError::driver)?;
        let entries: Vec<Value> = entries
            .into_iter()
            .map(|entry| entry_to_json(SearchEntry::construct(entry)))
            .collect();
        Ok(json!({ "entries": entries, "count": entries.len() }))
    }

    async fn child_dns(&self, base: &str) -> Result<Vec<String>, BackendError> {
        let mut ldap = self.handle();
        let result = ldap
            .search(base, Scope::OneLevel, "(objectClass=*)", vec!["1.1"])
            .await
            .map_err(BackendError::driver)?;
        if result.1.rc == NO_SUCH_OBJECT {
            return Ok(Vec::new());
        }
        let (entries, _) = result.success().map_err(BackendError::driver)?;
        let mut dns: Vec<String> = entries
            .into_iter()
            .map(|entry| SearchEntry::construct(entry).dn)
            .collect();
        dns.sort();
        Ok(dns)
    }
}

async fn root_naming_contexts(ldap: &mut Ldap) -> Result<Vec<String>, BackendError> {
    let (entries, _) = ldap
        .search("", Scope::Base, "(objectClass=*)", vec!["namingContexts"])
        .await
        .map_err(BackendError::driver)?
        .success()
        .map_err(BackendError::driver)?;
    Ok(entries
        .into_iter()
        .next()
        .map(SearchEntry::construct)
        .and_then(|entry| entry.attrs.get("namingContexts").cloned())
        .unwrap_or_default())
}

fn entry_to_json(entry: SearchEntry) -> Value {
    let mut attrs = Map::new();
    for (name, values) in entry.attrs {
        attrs.insert(name, json!(values));
    }
    json!({ "dn": entry.dn, "attributes": attrs })
}

fn parse_scope(name: Option<&str>) -> Result<Scope, ToolError> {
    match name {
        None | Some("sub") | Some("subtree") => Ok(Scope::Subtree),
        Some("one") | Some("onelevel") => Ok(Scope::OneLevel),
        Some("base") => Ok(Scope::Base),
        Some(other) => Err(ToolError::InvalidArguments(format!(
            "scope must be base, one, or sub, not '{other}'"
        ))),
    }
}

/// Substring filter over the common naming attributes.
fn name_filter(fragment: &str) -> String {
    let escaped = ldap_escape(fragment);
    format!("(|(cn=*{escaped}*)(ou=*{escaped}*)(uid=*{escaped}*))")
}

/// Attribute payload for add/modify: each value is a string or an array
/// of strings.
fn attribute_sets(attributes: &Value) -> Result<Vec<(String, HashSet<String>)>, ToolError> {
    let map = attributes.as_object().ok_or_else(|| {
        ToolError::InvalidArguments("attributes must be an object".to_string())
    })?;
    let mut sets = Vec::with_capacity(map.len());
    for (name, value) in map {
        let values: HashSet<String> = match value {
            Value::String(s) => [s.clone()].into(),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        ToolError::InvalidArguments(format!(
                            "attribute '{name}' values must be strings"
                        ))
                    })
                })
                .collect::<Result<_, _>>()?,
            _ => {
                return Err(ToolError::InvalidArguments(format!(
                    "attribute '{name}' must be a string or an array of strings"
                )))
            }
        };
        sets.push((name.clone(), values));
    }
    Ok(sets)
}

#[async_trait::async_trait]
impl DatabaseBackend for LdapBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ldap
    }

    async fn query(&self, _statement: &str) -> Result<Value, BackendError> {
        Err(BackendError::unsupported("ldap does not accept SQL"))
    }

    async fn execute(&self, _statement: &str) -> Result<Value, BackendError> {
        Err(BackendError::unsupported("ldap does not accept SQL"))
    }

    async fn list_entities(&self, scope: Option<&str>) -> Result<Value, BackendError> {
        let base = scope.unwrap_or(&self.base_dn);
        Ok(json!(self.child_dns(base).await?))
    }

    async fn describe_entity(
        &self,
        name: &str,
        _scope: Option<&str>,
    ) -> Result<Value, BackendError> {
        let mut ldap = self.handle();
        let result = ldap
            .search(name, Scope::Base, "(objectClass=*)", vec!["*"])
            .await
            .map_err(BackendError::driver)?;
        if result.1.rc == NO_SUCH_OBJECT {
            return Ok(json!({ "dn": name, "exists": false }));
        }
        let (entries, _) = result.success().map_err(BackendError::driver)?;
        match entries.into_iter().next() {
            Some(entry) => {
                let mut body = entry_to_json(SearchEntry::construct(entry));
                if let Some(obj) = body.as_object_mut() {
                    obj.insert("exists".to_string(), json!(true));
                }
                Ok(body)
            }
            None => Ok(json!({ "dn": name, "exists": false })),
        }
    }

    async fn list_scopes(&self) -> Result<Value, BackendError> {
        Ok(json!(self.naming_contexts))
    }

    async fn explain(&self, _statement: &str) -> Result<Value, BackendError> {
        Err(BackendError::unsupported("ldap does not accept SQL"))
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
        let children = self.child_dns(name).await?;
        Ok(json!({ "dn": name, "children": children.len() }))
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
        scope: Option<&str>,
    ) -> Result<Value, BackendError> {
        let base = scope.unwrap_or(&self.base_dn);
        self.search_json(base, Scope::Subtree, &name_filter(pattern), vec!["1.1".into()])
            .await
    }

    async fn entity_stats(&self, name: &str, _scope: Option<&str>) -> Result<Value, BackendError> {
        let mut ldap = self.handle();
        let result = ldap
            .search(name, Scope::Base, "(objectClass=*)", vec!["*"])
            .await
            .map_err(BackendError::driver)?;
        if result.1.rc == NO_SUCH_OBJECT {
            return Ok(json!({ "dn": name, "exists": false }));
        }
        let (entries, _) = result.success().map_err(BackendError::driver)?;
        let attributes = entries
            .into_iter()
            .next()
            .map(|entry| SearchEntry::construct(entry).attrs.len())
            .unwrap_or(0);
        let children = self.child_dns(name).await?;
        Ok(json!({
            "dn": name,
            "exists": true,
            "attributes": attributes,
            "children": children.len(),
        }))
    }

    fn native_operations(self: Arc<Self>) -> Vec<OperationDef> {
        let only = Applies::Only(BackendKind::Ldap);
        let search = Arc::clone(&self);
        let add = Arc::clone(&self);
        let modify = Arc::clone(&self);
        let remove = Arc::clone(&self);
        vec![
            OperationDef {
                name: "native_search",
                description: "Run a raw LDAP search with an arbitrary filter",
                mutating: false,
                applies: only,
                params: vec![
                    ParamSpec::required("filter", "string", "LDAP filter, e.g. (uid=ada)"),
                    ParamSpec::optional("base", "string", "Search base (defaults to the base DN)"),
                    ParamSpec::optional("scope", "string", "base, one, or sub (default sub)"),
                    ParamSpec::optional("attributes", "array", "Attributes to return (default all)"),
                ],
                prepare: Box::new(move |_, args| {
                    let me = Arc::clone(&search);
                    let filter = catalog::require_str(&args, "filter")?;
                    let base = catalog::optional_str(&args, "base");
                    let scope = parse_scope(
                        catalog::optional_str(&args, "scope").as_deref(),
                    )?;
                    let attrs: Vec<String> = match args.get("attributes").and_then(Value::as_array)
                    {
                        Some(items) => items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect(),
                        None => vec!["*".to_string()],
                    };
                    Ok(Box::pin(async move {
                        let base = base.as_deref().unwrap_or(&me.base_dn);
                        me.search_json(base, scope, &filter, attrs).await
                    }))
                }),
            },
            OperationDef {
                name: "native_add",
                description: "Add a directory entry",
                mutating: true,
                applies: only,
                params: vec![
                    ParamSpec::required("dn", "string", "Distinguished name of the new entry"),
                    ParamSpec::required(
                        "attributes",
                        "object",
                        "Attribute map; values are strings or arrays of strings",
                    ),
                ],
                prepare: Box::new(move |_, args| {
                    let me = Arc::clone(&add);
                    let dn = catalog::require_str(&args, "dn")?;
                    let attributes = catalog::require_object(&args, "attributes")?;
                    let sets = attribute_sets(&attributes)?;
                    Ok(Box::pin(async move {
                        let mut ldap = me.handle();
                        ldap.add(&dn, sets)
                            .await
                            .map_err(BackendError::driver)?
                            .success()
                            .map_err(BackendError::driver)?;
                        Ok(json!({ "dn": dn, "added": true }))
                    }))
                }),
            },
            OperationDef {
                name: "native_modify",
                description: "Replace attributes of a directory entry",
                mutating: true,
                applies: only,
                params: vec![
                    ParamSpec::required("dn", "string", "Entry to modify"),
                    ParamSpec::required(
                        "replace",
                        "object",
                        "Attributes to replace; values are strings or arrays of strings",
                    ),
                ],
                prepare: Box::new(move |_, args| {
                    let me = Arc::clone(&modify);
                    let dn = catalog::require_str(&args, "dn")?;
                    let replace = catalog::require_object(&args, "replace")?;
                    let mods: Vec<Mod<String>> = attribute_sets(&replace)?
                        .into_iter()
                        .map(|(name, values)| Mod::Replace(name, values))
                        .collect();
                    Ok(Box::pin(async move {
                        let mut ldap = me.handle();
                        ldap.modify(&dn, mods)
                            .await
                            .map_err(BackendError::driver)?
                            .success()
                            .map_err(BackendError::driver)?;
                        Ok(json!({ "dn": dn, "modified": true }))
                    }))
                }),
            },
            OperationDef {
                name: "native_remove",
                description: "Delete a directory entry",
                mutating: true,
                applies: only,
                params: vec![ParamSpec::required("dn", "string", "Entry to delete")],
                prepare: Box::new(move |_, args| {
                    let me = Arc::clone(&remove);
                    let dn = catalog::require_str(&args, "dn")?;
                    Ok(Box::pin(async move {
                        let mut ldap = me.handle();
                        ldap.delete(&dn)
                            .await
                            .map_err(BackendError::driver)?
                            .success()
                            .map_err(BackendError::driver)?;
                        Ok(json!({ "dn": dn, "removed": true }))
                    }))
                }),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_names_parse() {
        assert!(matches!(parse_scope(None), Ok(Scope::Subtree)));
        assert!(matches!(parse_scope(Some("one")), Ok(Scope::OneLevel)));
        assert!(matches!(parse_scope(Some("base")), Ok(Scope::Base)));
        assert!(parse_scope(Some("tree")).is_err());
    }

    #[test]
    fn name_filter_escapes_special_characters() {
        let filter = name_filter("a*b");
        assert!(!filter.contains("a*b"));
        assert!(filter.starts_with("(|(cn=*"));
    }

    #[test]
    fn attribute_sets_accept_strings_and_arrays() {
        let sets = attribute_sets(&json!({
            "cn": "ada",
            "objectClass": ["top", "person"],
        }))
        .unwrap();
        assert_eq!(sets.len(), 2);
        let (_, classes) = sets.iter().find(|(n, _)| n == "objectClass").unwrap();
        assert_eq!(classes.len(), 2);
    }

    #[test]
    fn attribute_sets_reject_non_string_values() {
        assert!(attribute_sets(&json!({ "uidNumber": 1000 })).is_err());
    }
}
