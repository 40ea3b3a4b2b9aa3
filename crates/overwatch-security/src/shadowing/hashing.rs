//! Canonical tool fingerprinting.
//!
//! Two tool definitions hash identically iff they have the same name, the
//! same description bytes, and schemas equal up to mapping-key order. The
//! canonical form sorts mapping keys lexicographically at every nesting level
//! and leaves arrays in order, so the hash is stable across implementations
//! that agree on that form.

use sha2::{Digest, Sha256};

use overwatch_types::records::ToolDescriptor;

/// The three digests derived from a tool definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintHashes {
    /// SHA-256 of the canonical schema serialization, lowercase hex.
    pub schema_hash: String,
    /// SHA-256 of the description bytes, lowercase hex.
    pub description_hash: String,
    /// SHA-256 of `name ":" schema_hash ":" description_hash`, lowercase hex.
    pub combined_hash: String,
}

/// Serialize a JSON value with mapping keys sorted at every nesting level.
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
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json handles string escaping; a key always serializes.
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            out.push_str(&serde_json::to_string(scalar).unwrap_or_default());
        }
    }
}

/// SHA-256 of `data`, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute the fingerprint hashes for a tool definition.
pub fn fingerprint(tool: &ToolDescriptor) -> FingerprintHashes {
    let schema_hash = sha256_hex(canonical_json(&tool.input_schema).as_bytes());
    let description_hash = sha256_hex(tool.description.as_deref().unwrap_or("").as_bytes());
    let combined_hash = sha256_hex(
        format!("{}:{}:{}", tool.name, schema_hash, description_hash).as_bytes(),
    );
    FingerprintHashes {
        schema_hash,
        description_hash,
        combined_hash,
    }
}
