//! Generic read / append / merge-update / delete over a [`CollectionStore`].
//!
//! Each request loads the whole array, mutates it in memory and writes it
//! back. Records are addressed according to [`Resource::identity`]:
//! positional resources by their index at request time, feature toggles by
//! their `id` field.

use axum::{
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::error::ApiError;
use crate::store::{CollectionStore, Identity, Resource, StoreError};

/// Successful outcome of a CRUD call.
#[derive(Debug, PartialEq)]
pub enum Reply {
    Records(Vec<Value>),
    Created(String),
    Done(String),
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        match self {
            Reply::Records(records) => Json(Value::Array(records)).into_response(),
            Reply::Created(message) => {
                (StatusCode::CREATED, Json(json!({ "message": message }))).into_response()
            }
            Reply::Done(message) => Json(json!({ "message": message })).into_response(),
        }
    }
}

/// Methods routed for a resource, on the collection path or on the
/// `/:id` member path.
pub fn allowed_methods(resource: Resource, member: bool) -> &'static [&'static str] {
    let (collection, members): (&'static [&'static str], &'static [&'static str]) =
        match resource {
            Resource::Articles => (&["GET", "POST"], &[]),
            Resource::RssFeeds => (&["GET", "POST"], &["DELETE"]),
            Resource::Services | Resource::SpecialOffers => (&["GET", "POST"], &["PUT", "DELETE"]),
            Resource::FeatureToggles => (&["GET"], &["PUT"]),
        };
    if member {
        members
    } else {
        collection
    }
}

/// HEAD is allowed wherever GET is.
pub fn is_allowed(resource: Resource, method: &Method, member: bool) -> bool {
    let method = if method == Method::HEAD {
        &Method::GET
    } else {
        method
    };
    allowed_methods(resource, member).contains(&method.as_str())
}

/// Dispatch one request. `id` is the raw `:id` path segment, if any.
///
/// Callers enforce the per-resource matrix with [`is_allowed`] first; this
/// only rejects methods that have no operation on the given path shape.
pub async fn handle(
    store: &dyn CollectionStore,
    resource: Resource,
    method: &Method,
    id: Option<&str>,
    body: Value,
) -> Result<Reply, ApiError> {
    match (method.as_str(), id) {
        ("GET" | "HEAD", None) => list(store, resource).await.map(Reply::Records),
        ("POST", None) => create(store, resource, body).await,
        ("PUT", Some(id)) => update(store, resource, id, &body).await,
        ("DELETE", Some(id)) => remove(store, resource, id).await,
        _ => Err(ApiError::MethodNotAllowed),
    }
}

pub async fn list(store: &dyn CollectionStore, resource: Resource) -> Result<Vec<Value>, ApiError> {
    store
        .load(resource)
        .await
        .map_err(|e| storage_error(resource, "read", e))
}

/// Append `record` as-is. No shape validation and no identity assignment.
pub async fn create(
    store: &dyn CollectionStore,
    resource: Resource,
    record: Value,
) -> Result<Reply, ApiError> {
    let mut records = store
        .load(resource)
        .await
        .map_err(|e| storage_error(resource, "create", e))?;
    records.push(record);
    store
        .save(resource, &records)
        .await
        .map_err(|e| storage_error(resource, "create", e))?;

    info!("Appended {} record #{}", resource, records.len() - 1);
    Ok(Reply::Created(format!("{} created successfully", resource.label())))
}

/// Shallow-merge `patch` onto every record matching `id`.
///
/// A miss still rewrites the array unchanged and still reports success.
pub async fn update(
    store: &dyn CollectionStore,
    resource: Resource,
    id: &str,
    patch: &Value,
) -> Result<Reply, ApiError> {
    let mut records = store
        .load(resource)
        .await
        .map_err(|e| storage_error(resource, "update", e))?;

    let identity = resource.identity();
    let mut matched = 0usize;
    for (index, record) in records.iter_mut().enumerate() {
        if matches_identity(identity, index, record, id) {
            shallow_merge(record, patch);
            matched += 1;
        }
    }
    if matched == 0 {
        warn!("No {} record matches '{}'; update is a no-op", resource, id);
    }

    store
        .save(resource, &records)
        .await
        .map_err(|e| storage_error(resource, "update", e))?;

    Ok(Reply::Done(format!("{} updated successfully", resource.label())))
}

/// Keep every record that does not match `id`.
pub async fn remove(store: &dyn CollectionStore, resource: Resource, id: &str) -> Result<Reply, ApiError> {
    let records = store
        .load(resource)
        .await
        .map_err(|e| storage_error(resource, "delete", e))?;

    let identity = resource.identity();
    let before = records.len();
    let kept: Vec<Value> = records
        .into_iter()
        .enumerate()
        .filter(|(index, record)| !matches_identity(identity, *index, record, id))
        .map(|(_, record)| record)
        .collect();
    if kept.len() == before {
        warn!("No {} record matches '{}'; delete is a no-op", resource, id);
    }

    store
        .save(resource, &kept)
        .await
        .map_err(|e| storage_error(resource, "delete", e))?;

    Ok(Reply::Done(format!("{} deleted successfully", resource.label())))
}

/// Does the record at `index` answer to the path identifier `id`?
///
/// A positional identifier that is not a non-negative integer matches
/// nothing. Field identity only matches string values.
pub fn matches_identity(identity: Identity, index: usize, record: &Value, id: &str) -> bool {
    match identity {
        Identity::Position => id.parse::<usize>().map_or(false, |wanted| wanted == index),
        Identity::Field(field) => record.get(field).and_then(Value::as_str) == Some(id),
    }
}

/// Copy every top-level field of `patch` onto `target`.
///
/// A non-object target is replaced by an object patch; a non-object patch is
/// ignored.
pub fn shallow_merge(target: &mut Value, patch: &Value) {
    let Value::Object(fields) = patch else {
        return;
    };
    match target {
        Value::Object(existing) => {
            for (key, value) in fields {
                existing.insert(key.clone(), value.clone());
            }
        }
        other => *other = patch.clone(),
    }
}

fn storage_error(resource: Resource, verb: &str, err: StoreError) -> ApiError {
    error!("Failed to {} {}: {}", verb, resource, err);
    ApiError::Storage {
        message: format!("Failed to {} {}", verb, resource.plural()),
    }
}
