//! Per-kind merge policy
//!
//! A policy lists the JSON pointers (relative to the object body, i.e. the
//! `DynamicObject::data` part) the operator owns, how each one is merged and
//! compared, and which pointers inside owned subtrees always keep their live
//! value. Metadata is handled the same way for every kind: labels and
//! annotations are merged into the live maps, owner references are added by
//! uid, and everything else comes from live.
//!
//! `Subset` comparison tolerates server defaults but cannot tell a defaulted
//! key from one the descriptor stopped requesting. Kinds with `Subset` fields
//! therefore carry a digest of the requested fields, and a digest mismatch
//! counts as a change.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use serde_json::Value;

use crate::fingerprint::{fingerprint_value, APPLIED_DIGEST_ANNOTATION};
use crate::resource::ResourceKind;

/// How an owned field is merged and compared
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compare {
    /// Replace; unchanged iff equal
    Exact,
    /// Replace; unchanged iff the merged value is contained in live
    Subset,
    /// Grow only: add missing keys and array members, keep live scalars
    Additive,
}

/// One owned JSON pointer
#[derive(Clone, Copy, Debug)]
pub struct OwnedField {
    /// Pointer into the object body
    pub pointer: &'static str,
    /// Merge and compare mode
    pub compare: Compare,
}

const fn owned(pointer: &'static str, compare: Compare) -> OwnedField {
    OwnedField { pointer, compare }
}

/// Merge policy of one kind
#[derive(Debug)]
pub struct MergePolicy {
    /// Fields the operator is responsible for
    pub owned: &'static [OwnedField],
    /// Pointers always restored from live after the owned overwrite
    pub preserved: &'static [&'static str],
}

impl MergePolicy {
    /// Additive kinds never lose anything on update
    pub fn is_additive(&self) -> bool {
        self.owned.iter().all(|f| f.compare == Compare::Additive)
    }

    fn subset_fields(&self) -> impl Iterator<Item = &OwnedField> {
        self.owned.iter().filter(|f| f.compare == Compare::Subset)
    }
}

/// Digest of the `Subset` fields `desired` requests; `None` for kinds without any
pub fn applied_digest(policy: &MergePolicy, desired: &DynamicObject) -> Option<String> {
    let mut fields = policy.subset_fields().peekable();
    fields.peek()?;
    let requested: serde_json::Map<String, Value> = fields
        .filter_map(|f| {
            let value = desired.data.pointer(f.pointer)?;
            Some((f.pointer.to_string(), value.clone()))
        })
        .collect();
    Some(fingerprint_value(&Value::Object(requested)))
}

/// Stamp the applied digest on an object about to be created
pub fn stamp_applied(policy: &MergePolicy, object: &mut DynamicObject) {
    if let Some(digest) = applied_digest(policy, object) {
        object
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(APPLIED_DIGEST_ANNOTATION.to_string(), digest);
    }
}

static NAMESPACE: MergePolicy = MergePolicy {
    owned: &[],
    preserved: &[],
};

static SERVICE_ACCOUNT: MergePolicy = MergePolicy {
    owned: &[owned("/imagePullSecrets", Compare::Additive)],
    preserved: &[],
};

static CLUSTER_ROLE: MergePolicy = MergePolicy {
    owned: &[owned("/rules", Compare::Additive)],
    preserved: &[],
};

// roleRef is immutable server-side, growing it only fills a missing one
static CLUSTER_ROLE_BINDING: MergePolicy = MergePolicy {
    owned: &[
        owned("/roleRef", Compare::Additive),
        owned("/subjects", Compare::Additive),
    ],
    preserved: &[],
};

static CONFIG_MAP: MergePolicy = MergePolicy {
    owned: &[
        owned("/data", Compare::Exact),
        owned("/binaryData", Compare::Exact),
    ],
    preserved: &[],
};

static SERVICE: MergePolicy = MergePolicy {
    owned: &[owned("/spec", Compare::Subset)],
    preserved: &[
        "/spec/clusterIP",
        "/spec/clusterIPs",
        "/spec/ipFamilies",
        "/spec/ipFamilyPolicy",
        "/spec/healthCheckNodePort",
    ],
};

static DEPLOYMENT: MergePolicy = MergePolicy {
    owned: &[
        owned("/spec/replicas", Compare::Exact),
        owned("/spec/selector", Compare::Subset),
        owned("/spec/template", Compare::Subset),
    ],
    preserved: &[],
};

static DAEMON_SET: MergePolicy = MergePolicy {
    owned: &[
        owned("/spec/selector", Compare::Subset),
        owned("/spec/template", Compare::Subset),
        owned("/spec/updateStrategy", Compare::Subset),
    ],
    preserved: &[],
};

static HORIZONTAL_POD_AUTOSCALER: MergePolicy = MergePolicy {
    owned: &[owned("/spec", Compare::Subset)],
    preserved: &[],
};

static NETWORK_POLICY: MergePolicy = MergePolicy {
    owned: &[owned("/spec", Compare::Subset)],
    preserved: &[],
};

/// Policy of a kind
pub fn policy_for(kind: ResourceKind) -> &'static MergePolicy {
    match kind {
        ResourceKind::Namespace => &NAMESPACE,
        ResourceKind::ServiceAccount => &SERVICE_ACCOUNT,
        ResourceKind::ClusterRole => &CLUSTER_ROLE,
        ResourceKind::ClusterRoleBinding => &CLUSTER_ROLE_BINDING,
        ResourceKind::ConfigMap => &CONFIG_MAP,
        ResourceKind::Service => &SERVICE,
        ResourceKind::Deployment => &DEPLOYMENT,
        ResourceKind::DaemonSet => &DAEMON_SET,
        ResourceKind::HorizontalPodAutoscaler => &HORIZONTAL_POD_AUTOSCALER,
        ResourceKind::NetworkPolicy => &NETWORK_POLICY,
    }
}

/// Result of merging a descriptor into a live object
#[derive(Debug)]
pub struct Merged {
    /// Object to send on update, carrying live's resourceVersion
    pub object: DynamicObject,
    /// Whether `object` differs from live under the policy
    pub changed: bool,
}

/// Merge `desired` into `live` and decide whether a write is needed
pub fn merge(policy: &MergePolicy, desired: &DynamicObject, live: &DynamicObject) -> Merged {
    let mut merged = live.clone();
    let mut changed = false;

    for field in policy.owned {
        let Some(want) = desired.data.pointer(field.pointer) else {
            // not requested, live value stays
            continue;
        };
        let have = live.data.pointer(field.pointer);

        let value = match field.compare {
            Compare::Exact | Compare::Subset => {
                let mut value = want.clone();
                restore_preserved(&mut value, field.pointer, policy.preserved, &live.data);
                value
            }
            Compare::Additive => match have {
                Some(have) => grow(have, want),
                None => want.clone(),
            },
        };

        let same = match (field.compare, have) {
            (_, None) => is_empty(&value),
            (Compare::Subset, Some(have)) => contains(have, &value),
            (_, Some(have)) => *have == value,
        };
        changed |= !same;
        set_pointer(&mut merged.data, field.pointer, value);
    }

    if let Some(digest) = applied_digest(policy, desired) {
        let last = live
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(APPLIED_DIGEST_ANNOTATION));
        // a dropped key is contained in live, only the digest shows it
        changed |= last != Some(&digest);
        merged
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(APPLIED_DIGEST_ANNOTATION.to_string(), digest);
    }

    changed |= merge_string_map(&mut merged.metadata.labels, &desired.metadata.labels);
    changed |= merge_string_map(
        &mut merged.metadata.annotations,
        &desired.metadata.annotations,
    );

    if let Some(wanted) = &desired.metadata.owner_references {
        let refs = merged.metadata.owner_references.get_or_insert_with(Vec::new);
        for owner in wanted {
            if !refs.iter().any(|r| r.uid == owner.uid) {
                refs.push(owner.clone());
                changed = true;
            }
        }
    }

    Merged {
        object: merged,
        changed,
    }
}

fn restore_preserved(value: &mut Value, base: &str, preserved: &[&str], live: &Value) {
    for pointer in preserved {
        let Some(rest) = pointer.strip_prefix(base) else {
            continue;
        };
        if !rest.is_empty() && !rest.starts_with('/') {
            continue;
        }
        if let Some(kept) = live.pointer(pointer) {
            set_pointer(value, rest, kept.clone());
        }
    }
}

/// Desired keys win; keys only present in live survive
fn merge_string_map(
    target: &mut Option<BTreeMap<String, String>>,
    desired: &Option<BTreeMap<String, String>>,
) -> bool {
    let Some(desired) = desired else {
        return false;
    };
    let map = target.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (k, v) in desired {
        if map.get(k) != Some(v) {
            map.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed
}

/// True if every field of `want` is present with the same value in `have`.
///
/// Objects may carry extra keys in `have` (server defaults). Arrays must have
/// the same length and match element-wise. Empty values in `want` match a
/// missing key.
pub fn contains(have: &Value, want: &Value) -> bool {
    match (have, want) {
        (Value::Object(have), Value::Object(want)) => want.iter().all(|(k, w)| match have.get(k) {
            Some(h) => contains(h, w),
            None => is_empty(w),
        }),
        (Value::Array(have), Value::Array(want)) => {
            have.len() == want.len() && have.iter().zip(want).all(|(h, w)| contains(h, w))
        }
        _ => have == want,
    }
}

/// Union of `have` and `want` that never drops or replaces anything in `have`
pub fn grow(have: &Value, want: &Value) -> Value {
    match (have, want) {
        (Value::Object(have_map), Value::Object(want_map)) => {
            let mut out = have_map.clone();
            for (k, w) in want_map {
                let next = match have_map.get(k) {
                    Some(h) => grow(h, w),
                    None => w.clone(),
                };
                out.insert(k.clone(), next);
            }
            Value::Object(out)
        }
        (Value::Array(have_items), Value::Array(want_items)) => {
            let mut out = have_items.clone();
            for w in want_items {
                if !have_items.iter().any(|h| contains(h, w)) {
                    out.push(w.clone());
                }
            }
            Value::Array(out)
        }
        _ => have.clone(),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Set `value` at `pointer`, creating intermediate objects
fn set_pointer(root: &mut Value, pointer: &str, value: Value) {
    let tokens: Vec<String> = if pointer.is_empty() {
        Vec::new()
    } else {
        pointer
            .trim_start_matches('/')
            .split('/')
            .map(|t| t.replace("~1", "/").replace("~0", "~"))
            .collect()
    };
    set_path(root, &tokens, value);
}

fn set_path(node: &mut Value, tokens: &[String], value: Value) {
    let Some((first, rest)) = tokens.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Default::default());
    }
    if let Value::Object(map) = node {
        let child = map.entry(first.clone()).or_insert(Value::Null);
        set_path(child, rest, value);
    }
}
