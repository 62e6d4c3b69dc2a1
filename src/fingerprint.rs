//! Content fingerprints for configuration documents.
//!
//! A fingerprint is the first 8 bytes of the SHA-256 of a canonical
//! serialization, hex encoded. It is stamped on the pod template of every
//! workload that mounts the fingerprinted configuration, so a content change
//! becomes a template change and the platform rolls the pods.
//!
//! Canonical form sorts object keys at every depth. Two documents that differ
//! only in key order therefore always share a fingerprint, whatever map type
//! produced them.

use std::fmt::Write;

use aws_lc_rs::digest::{digest, SHA256};
use serde::Serialize;
use serde_json::Value;

use crate::{Error, Result};

/// Pod-template annotation carrying the digest of the mounted configuration
pub const CONFIG_DIGEST_ANNOTATION: &str = "flowmesh.dev/config-digest";

/// Object annotation carrying the digest of the fields requested on the last write
pub const APPLIED_DIGEST_ANNOTATION: &str = "flowmesh.dev/applied-digest";

/// Fingerprint raw bytes.
///
/// Callers hashing structured documents should go through
/// [`fingerprint_value`] so the input is canonical first.
pub fn fingerprint(blob: &[u8]) -> String {
    let hash = digest(&SHA256, blob);
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Serialize a JSON value with object keys sorted at every depth
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // string escaping cannot fail
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Fingerprint the canonical form of a JSON value
pub fn fingerprint_value(value: &Value) -> String {
    fingerprint(canonical_json(value).as_bytes())
}

/// Render any serializable document as canonical JSON, the ConfigMap payload
/// form. Consumers are stamped with the fingerprint of the ConfigMap data.
pub fn canonical_document<T: Serialize>(doc: &T) -> Result<String> {
    let value = serde_json::to_value(doc)?;
    Ok(canonical_json(&value))
}

/// Stamp `digest` on the pod template of a workload body.
///
/// `body` is the non-metadata part of a Deployment or DaemonSet (what a
/// `DynamicObject` keeps in `data`). Fails when there is no pod template.
pub fn stamp_pod_template(body: &mut Value, digest: &str) -> Result<()> {
    let template = body
        .pointer_mut("/spec/template")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| Error::build("fingerprint", "resource has no pod template to stamp"))?;

    let metadata = template
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));
    let metadata = metadata
        .as_object_mut()
        .ok_or_else(|| Error::build("fingerprint", "pod template metadata is not an object"))?;
    let annotations = metadata
        .entry("annotations")
        .or_insert_with(|| Value::Object(Default::default()));
    let annotations = annotations
        .as_object_mut()
        .ok_or_else(|| Error::build("fingerprint", "pod template annotations is not an object"))?;

    annotations.insert(
        CONFIG_DIGEST_ANNOTATION.to_string(),
        Value::String(digest.to_string()),
    );
    Ok(())
}

/// Read back a stamped digest
pub fn stamped_digest(body: &Value) -> Option<&str> {
    body.pointer("/spec/template/metadata/annotations")
        .and_then(|a| a.get(CONFIG_DIGEST_ANNOTATION))
        .and_then(Value::as_str)
}
