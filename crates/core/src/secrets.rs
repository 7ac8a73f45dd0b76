//! Secret references inside step inputs.
//!
//! Plans never carry secret values; they carry references of the form
//! `{"type": "secret", "path": "infra/db/password"}`. The store fetch happens
//! just before the adapter call; this module only knows how to find the
//! references in a nested structure and substitute fetched values in a
//! throwaway copy that lives for the duration of one step.

use std::collections::{BTreeMap, BTreeSet};

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SecretRefError {
    #[error("secret reference at `{location}` is missing a `path`")]
    MissingPath { location: String },
    #[error("no value fetched for secret path `{path}`")]
    Unresolved { path: String },
}

/// Returns the referenced path when `value` is a secret reference object.
pub fn as_secret_ref(value: &serde_json::Value) -> Option<&str> {
    let object = value.as_object()?;
    if object.get("type").and_then(|t| t.as_str()) != Some("secret") {
        return None;
    }
    object.get("path").and_then(|path| path.as_str())
}

fn is_secret_marker(value: &serde_json::Value) -> bool {
    value
        .as_object()
        .map(|object| object.get("type").and_then(|t| t.as_str()) == Some("secret"))
        .unwrap_or(false)
}

/// Collect every secret path referenced anywhere in `value`.
pub fn collect_refs(value: &serde_json::Value) -> Result<BTreeSet<String>, SecretRefError> {
    let mut paths = BTreeSet::new();
    walk(value, "$", &mut paths)?;
    Ok(paths)
}

fn walk(
    value: &serde_json::Value,
    location: &str,
    paths: &mut BTreeSet<String>,
) -> Result<(), SecretRefError> {
    if is_secret_marker(value) {
        let path = as_secret_ref(value)
            .ok_or_else(|| SecretRefError::MissingPath { location: location.to_string() })?;
        paths.insert(path.to_string());
        return Ok(());
    }

    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                walk(child, &format!("{location}.{key}"), paths)?;
            }
        }
        serde_json::Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                walk(child, &format!("{location}[{index}]"), paths)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Substitute fetched secret values into a copy of `value`. The returned
/// structure carries raw values and must not outlive the adapter call it
/// feeds.
pub fn materialise(
    value: &serde_json::Value,
    fetched: &BTreeMap<String, SecretString>,
) -> Result<serde_json::Value, SecretRefError> {
    if is_secret_marker(value) {
        let path = as_secret_ref(value)
            .ok_or_else(|| SecretRefError::MissingPath { location: "$".to_string() })?;
        let secret = fetched
            .get(path)
            .ok_or_else(|| SecretRefError::Unresolved { path: path.to_string() })?;
        return Ok(serde_json::Value::String(secret.expose_secret().to_string()));
    }

    match value {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, child) in map {
                out.insert(key.clone(), materialise(child, fetched)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for child in items {
                out.push(materialise(child, fetched)?);
            }
            Ok(serde_json::Value::Array(out))
        }
        scalar => Ok(scalar.clone()),
    }
}
