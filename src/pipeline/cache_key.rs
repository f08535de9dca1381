/// Cache key generation for resolved steps
///
/// The key is derived from:
/// - Descriptor id
/// - Resolved parameter values, sorted by name and normalized to strings
///
/// The descriptor body is not part of the key. It is tracked as a separate
/// fingerprint stored in the entry, and an edited definition overwrites its
/// own entry on the next successful run.
use serde_json::json;
use sha2::{Digest, Sha256};

use super::descriptor::{Params, StepDescriptor};

/// Compute the cache key for a step id and its parameters
///
/// Format: "step-{hex_hash}" where hex_hash is the first 16 characters of SHA256
/// over a canonical JSON document. `BTreeMap` keeps the parameter order stable.
pub fn compute_cache_key(step_id: &str, params: &Params) -> String {
    let canonical = json!({
        "id": step_id,
        "params": params,
    });

    let hash = hex::encode(Sha256::digest(canonical.to_string().as_bytes()));

    format!("step-{}", &hash[..16])
}

/// Fingerprint of everything in a descriptor that affects what it does
pub fn descriptor_fingerprint(descriptor: &StepDescriptor) -> String {
    let mut hasher = Sha256::new();

    hasher.update(b"command\0");
    hasher.update(descriptor.command().as_bytes());

    for (name, value) in descriptor.env() {
        hasher.update(b"\0env\0");
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }

    for output in descriptor.outputs() {
        hasher.update(b"\0output\0");
        hasher.update(output.as_bytes());
    }

    if let Some(marker) = descriptor.expect() {
        hasher.update(b"\0expect\0");
        hasher.update(marker.to_string().as_bytes());
    }

    for param in descriptor.required_params() {
        hasher.update(b"\0param\0");
        hasher.update(param.as_bytes());
    }

    hex::encode(hasher.finalize())
}
