//! MongoDB adapter. Collections play the role of entities; schemas are
//! approximated by sampling a document. The native registry carries the
//! document operations (find/count/aggregate/insert/update/remove).

use std::sync::Arc;

use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::results::CollectionType;
use mongodb::{Client, Database};
use serde_json::{json, Value};

use super::{BackendKind, DatabaseBackend};
use crate::catalog::{self, Applies, OperationDef, ParamSpec};
use crate::error::BackendError;

/// Default cap for `native_find` result sets.
const DEFAULT_FIND_LIMIT: i64 = 100;

pub struct MongoBackend {
    client: Client,
    database: Database,
}

impl MongoBackend {
    pub async fn connect(url: &str, database: Option<&str>) -> Result<Self, BackendError> {
        let client = Client::with_uri_str(url)
            .await
            .map_err(BackendError::driver)?;
        let database = match database {
            Some(name) => client.database(name),
            None => client.default_database().ok_or_else(|| {
                BackendError::driver(
                    "no database in the connection string and MONGODB_DATABASE is unset",
                )
            })?,
        };
        // Round-trip to catch bad addresses at startup.
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(BackendError::driver)?;
        Ok(Self { client, database })
    }

    fn scoped(&self, scope: Option<&str>) -> Database {
        match scope {
            Some(name) => self.client.database(name),
            None => self.database.clone(),
        }
    }

    async fn collection_names(&self, scope: Option<&str>) -> Result<Vec<String>, BackendError> {
        let mut names = self
            .scoped(scope)
            .list_collection_names()
            .await
            .map_err(BackendError::driver)?;
        names.sort();
        Ok(names)
    }

    async fn find_docs(
        &self,
        collection: &str,
        filter: Document,
        limit: i64,
    ) -> Result<Value, BackendError> {
        let cursor = self
            .database
            .collection::<Document>(collection)
            .find(filter)
            .limit(limit)
            .await
            .map_err(BackendError::driver)?;
        let docs: Vec<Document> = cursor.try_collect().await.map_err(BackendError::driver)?;
        let rows: Vec<Value> = docs.into_iter().map(document_to_json).collect();
        Ok(json!({ "documents": rows, "count": rows.len() }))
    }
}

fn document_to_json(doc: Document) -> Value {
    Bson::Document(doc).into_relaxed_extjson()
}

/// Parse a JSON object into a BSON document for filters and payloads.
fn json_to_document(value: &Value) -> Result<Document, BackendError> {
    mongodb::bson::to_document(value).map_err(BackendError::driver)
}

/// Plain field maps become `$set` payloads; documents already using
/// update operators pass through untouched.
fn as_update_document(update: Document) -> Document {
    if update.keys().any(|k| k.starts_with('$')) {
        update
    } else {
        doc! { "$set": update }
    }
}

#[async_trait::async_trait]
impl DatabaseBackend for MongoBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::MongoDb
    }

    async fn query(&self, _statement: &str) -> Result<Value, BackendError> {
        Err(BackendError::unsupported("mongodb does not accept SQL"))
    }

    async fn execute(&self, _statement: &str) -> Result<Value, BackendError> {
        Err(BackendError::unsupported("mongodb does not accept SQL"))
    }

    async fn list_entities(&self, scope: Option<&str>) -> Result<Value, BackendError> {
        Ok(json!(self.collection_names(scope).await?))
    }

    async fn describe_entity(
        &self,
        name: &str,
        scope: Option<&str>,
    ) -> Result<Value, BackendError> {
        let sample = self
            .scoped(scope)
            .collection::<Document>(name)
            .find_one(doc! {})
            .await
            .map_err(BackendError::driver)?;
        let fields: Vec<Value> = match &sample {
            Some(doc) => doc
                .iter()
                .map(|(key, value)| {
                    json!({ "name": key, "type": format!("{:?}", value.element_type()) })
                })
                .collect(),
            None => Vec::new(),
        };
        Ok(json!({
            "collection": name,
            "sampled": sample.is_some(),
            "fields": fields,
        }))
    }

    async fn list_scopes(&self) -> Result<Value, BackendError> {
        let mut names = self
            .client
            .list_database_names()
            .await
            .map_err(BackendError::driver)?;
        names.sort();
        Ok(json!(names))
    }

    async fn explain(&self, _statement: &str) -> Result<Value, BackendError> {
        Err(BackendError::unsupported("mongodb does not accept SQL"))
    }

    async fn list_indexes(&self, name: &str, scope: Option<&str>) -> Result<Value, BackendError> {
        let cursor = self
            .scoped(scope)
            .collection::<Document>(name)
            .list_indexes()
            .await
            .map_err(BackendError::driver)?;
        let models: Vec<_> = cursor.try_collect().await.map_err(BackendError::driver)?;
        let indexes: Vec<Value> = models
            .into_iter()
            .map(|model| {
                let name = model.options.as_ref().and_then(|o| o.name.clone());
                json!({
                    "name": name,
                    "keys": document_to_json(model.keys),
                })
            })
            .collect();
        Ok(json!(indexes))
    }

    async fn list_foreign_keys(
        &self,
        _name: &str,
        _scope: Option<&str>,
    ) -> Result<Value, BackendError> {
        Ok(json!([]))
    }

    async fn entity_size(&self, name: &str, scope: Option<&str>) -> Result<Value, BackendError> {
        let db = self.scoped(scope);
        let names = db
            .list_collection_names()
            .await
            .map_err(BackendError::driver)?;
        if !names.iter().any(|n| n == name) {
            return Ok(json!({ "collection": name, "bytes": Value::Null }));
        }
        let stats = db
            .run_command(doc! { "collStats": name })
            .await
            .map_err(BackendError::driver)?;
        let stats = document_to_json(stats);
        Ok(json!({
            "collection": name,
            "bytes": stats.get("size").cloned().unwrap_or(Value::Null),
            "storage_bytes": stats.get("storageSize").cloned().unwrap_or(Value::Null),
            "documents": stats.get("count").cloned().unwrap_or(Value::Null),
        }))
    }

    async fn list_views(&self, scope: Option<&str>) -> Result<Value, BackendError> {
        let cursor = self
            .scoped(scope)
            .list_collections()
            .await
            .map_err(BackendError::driver)?;
        let specs: Vec<_> = cursor.try_collect().await.map_err(BackendError::driver)?;
        let mut views: Vec<String> = specs
            .into_iter()
            .filter(|spec| spec.collection_type == CollectionType::View)
            .map(|spec| spec.name)
            .collect();
        views.sort();
        Ok(json!(views))
    }

    async fn describe_view(&self, name: &str, scope: Option<&str>)
        -> Result<Value, BackendError> {
        let cursor = self
            .scoped(scope)
            .list_collections()
            .await
            .map_err(BackendError::driver)?;
        let specs: Vec<_> = cursor.try_collect().await.map_err(BackendError::driver)?;
        let spec = specs
            .into_iter()
            .find(|s| s.name == name && s.collection_type == CollectionType::View);
        match spec {
            Some(spec) => {
                let pipeline: Vec<Value> = spec
                    .options
                    .pipeline
                    .unwrap_or_default()
                    .into_iter()
                    .map(document_to_json)
                    .collect();
                Ok(json!({
                    "view": name,
                    "view_on": spec.options.view_on,
                    "pipeline": pipeline,
                }))
            }
            None => Ok(json!({ "view": name, "definition": Value::Null })),
        }
    }

    async fn search_entities(
        &self,
        pattern: &str,
        scope: Option<&str>,
    ) -> Result<Value, BackendError> {
        let needle = pattern.to_lowercase();
        let names: Vec<String> = self
            .collection_names(scope)
            .await?
            .into_iter()
            .filter(|n| n.to_lowercase().contains(&needle))
            .collect();
        Ok(json!(names))
    }

    async fn entity_stats(&self, name: &str, scope: Option<&str>) -> Result<Value, BackendError> {
        let db = self.scoped(scope);
        let count = db
            .collection::<Document>(name)
            .estimated_document_count()
            .await
            .map_err(BackendError::driver)?;
        Ok(json!({ "collection": name, "estimated_documents": count }))
    }

    fn native_operations(self: Arc<Self>) -> Vec<OperationDef> {
        let only = Applies::Only(BackendKind::MongoDb);
        let find = Arc::clone(&self);
        let count = Arc::clone(&self);
        let aggregate = Arc::clone(&self);
        let insert = Arc::clone(&self);
        let update = Arc::clone(&self);
        let remove = Arc::clone(&self);
        vec![
            OperationDef {
                name: "native_find",
                description: "Find documents in a collection matching a filter",
                mutating: false,
                applies: only,
                params: vec![
                    ParamSpec::required("collection", "string", "Collection to search"),
                    ParamSpec::optional("filter", "object", "Query filter (defaults to all)"),
                    ParamSpec::optional("limit", "integer", "Maximum documents to return"),
                ],
                prepare: Box::new(move |_, args| {
                    let me = Arc::clone(&find);
                    let collection = catalog::require_str(&args, "collection")?;
                    let filter = catalog::optional_object(&args, "filter");
                    let limit = catalog::optional_i64(&args, "limit").unwrap_or(DEFAULT_FIND_LIMIT);
                    Ok(Box::pin(async move {
                        let filter = match filter {
                            Some(v) => json_to_document(&v)?,
                            None => doc! {},
                        };
                        me.find_docs(&collection, filter, limit).await
                    }))
                }),
            },
            OperationDef {
                name: "native_count",
                description: "Count documents in a collection matching a filter",
                mutating: false,
                applies: only,
                params: vec![
                    ParamSpec::required("collection", "string", "Collection to count"),
                    ParamSpec::optional("filter", "object", "Query filter (defaults to all)"),
                ],
                prepare: Box::new(move |_, args| {
                    let me = Arc::clone(&count);
                    let collection = catalog::require_str(&args, "collection")?;
                    let filter = catalog::optional_object(&args, "filter");
                    Ok(Box::pin(async move {
                        let filter = match filter {
                            Some(v) => json_to_document(&v)?,
                            None => doc! {},
                        };
                        let n = me
                            .database
                            .collection::<Document>(&collection)
                            .count_documents(filter)
                            .await
                            .map_err(BackendError::driver)?;
                        Ok(json!({ "collection": collection, "count": n }))
                    }))
                }),
            },
            OperationDef {
                name: "native_aggregate",
                description: "Run an aggregation pipeline against a collection",
                mutating: false,
                applies: only,
                params: vec![
                    ParamSpec::required("collection", "string", "Collection to aggregate"),
                    ParamSpec::required("pipeline", "array", "Aggregation pipeline stages"),
                ],
                prepare: Box::new(move |_, args| {
                    let me = Arc::clone(&aggregate);
                    let collection = catalog::require_str(&args, "collection")?;
                    let stages = catalog::require_array(&args, "pipeline")?;
                    Ok(Box::pin(async move {
                        let pipeline: Vec<Document> = stages
                            .iter()
                            .map(json_to_document)
                            .collect::<Result<_, _>>()?;
                        let cursor = me
                            .database
                            .collection::<Document>(&collection)
                            .aggregate(pipeline)
                            .await
                            .map_err(BackendError::driver)?;
                        let docs: Vec<Document> =
                            cursor.try_collect().await.map_err(BackendError::driver)?;
                        let rows: Vec<Value> = docs.into_iter().map(document_to_json).collect();
                        Ok(json!({ "documents": rows, "count": rows.len() }))
                    }))
                }),
            },
            OperationDef {
                name: "native_insert",
                description: "Insert one document into a collection",
                mutating: true,
                applies: only,
                params: vec![
                    ParamSpec::required("collection", "string", "Target collection"),
                    ParamSpec::required("document", "object", "Document to insert"),
                ],
                prepare: Box::new(move |_, args| {
                    let me = Arc::clone(&insert);
                    let collection = catalog::require_str(&args, "collection")?;
                    let document = catalog::require_object(&args, "document")?;
                    Ok(Box::pin(async move {
                        let document = json_to_document(&document)?;
                        let result = me
                            .database
                            .collection::<Document>(&collection)
                            .insert_one(document)
                            .await
                            .map_err(BackendError::driver)?;
                        Ok(json!({
                            "collection": collection,
                            "inserted_id": result.inserted_id.into_relaxed_extjson(),
                        }))
                    }))
                }),
            },
            OperationDef {
                name: "native_update",
                description: "Update documents matching a filter",
                mutating: true,
                applies: only,
                params: vec![
                    ParamSpec::required("collection", "string", "Target collection"),
                    ParamSpec::required("filter", "object", "Documents to match"),
                    ParamSpec::required(
                        "update",
                        "object",
                        "Update operators, or a field map applied as $set",
                    ),
                ],
                prepare: Box::new(move |_, args| {
                    let me = Arc::clone(&update);
                    let collection = catalog::require_str(&args, "collection")?;
                    let filter = catalog::require_object(&args, "filter")?;
                    let change = catalog::require_object(&args, "update")?;
                    Ok(Box::pin(async move {
                        let filter = json_to_document(&filter)?;
                        let change = as_update_document(json_to_document(&change)?);
                        let result = me
                            .database
                            .collection::<Document>(&collection)
                            .update_many(filter, change)
                            .await
                            .map_err(BackendError::driver)?;
                        Ok(json!({
                            "collection": collection,
                            "matched": result.matched_count,
                            "modified": result.modified_count,
                        }))
                    }))
                }),
            },
            OperationDef {
                name: "native_remove",
                description: "Delete documents matching a filter",
                mutating: true,
                applies: only,
                params: vec![
                    ParamSpec::required("collection", "string", "Target collection"),
                    ParamSpec::required("filter", "object", "Documents to delete"),
                ],
                prepare: Box::new(move |_, args| {
                    let me = Arc::clone(&remove);
                    let collection = catalog::require_str(&args, "collection")?;
                    let filter = catalog::require_object(&args, "filter")?;
                    Ok(Box::pin(async move {
                        let filter = json_to_document(&filter)?;
                        let result = me
                            .database
                            .collection::<Document>(&collection)
                            .delete_many(filter)
                            .await
                            .map_err(BackendError::driver)?;
                        Ok(json!({
                            "collection": collection,
                            "deleted": result.deleted_count,
                        }))
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
    fn field_maps_are_wrapped_in_set() {
        let wrapped = as_update_document(doc! { "name": "ada" });
        assert!(wrapped.contains_key("$set"));
    }

    #[test]
    fn operator_documents_pass_through() {
        let update = as_update_document(doc! { "$inc": { "visits": 1 } });
        assert!(update.contains_key("$inc"));
        assert!(!update.contains_key("$set"));
    }

    #[test]
    fn json_filters_convert_to_bson() {
        let filter = json_to_document(&json!({ "age": { "$gt": 21 } })).unwrap();
        assert!(filter.contains_key("age"));
    }
}
