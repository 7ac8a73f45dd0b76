//! Deduplication key derivation.
//!
//! The key is a SHA-256 over the canonical form of the plan snapshot plus the
//! submitting tenant and actor. Canonical form sorts object keys and strips
//! whitespace, so the same logical plan always hashes identically no matter
//! how the caller serialised it.

use sha2::{Digest, Sha256};

use crate::domain::context::{ActorId, TenantId};

/// Render a JSON value in canonical form: object keys sorted, compact
/// separators, no insignificant whitespace.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Derive the deduplication key for a plan submitted by `(tenant, actor)`.
pub fn derive_key(
    plan_snapshot: &serde_json::Value,
    tenant_id: &TenantId,
    actor_id: &ActorId,
) -> String {
    let canonical = canonical_json(plan_snapshot);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.update(b"\n");
    hasher.update(tenant_id.0.as_bytes());
    hasher.update(b"\n");
    hasher.update(actor_id.0.as_bytes());
    format!("{:x}", hasher.finalize())
}
