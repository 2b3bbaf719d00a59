//! Deterministic cache keys for remote operations
//!
//! A key is `{operation}:{scope}:{digest}` where `scope` is either the public
//! sentinel or a digest of the caller identity, and `digest` covers the canonical
//! encoding of the arguments. Canonical means object keys are sorted at every
//! depth, so `{"a":1,"b":2}` and `{"b":2,"a":1}` always produce the same key.
//! Keys must stay stable across processes because the durable tier outlives them.

use crate::cache::types::CacheKey;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Scope used for anonymous callers and identity-independent operations
pub const PUBLIC_SCOPE: &str = "public";

/// Hex characters of the argument digest kept in the key
const ARGS_DIGEST_LEN: usize = 32;

/// Hex characters of the identity digest kept in the key
const IDENTITY_DIGEST_LEN: usize = 16;

/// Builds cache keys from (operation, identity, arguments)
#[derive(Debug, Clone, Default)]
pub struct CacheKeyBuilder {
    /// Mixed into identity digests so scopes differ between deployments
    identity_salt: String,
}

impl CacheKeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Salt identity digests with a deployment-specific value
    pub fn with_identity_salt(salt: impl Into<String>) -> Self {
        Self {
            identity_salt: salt.into(),
        }
    }

    /// Build the key for one call
    ///
    /// `identity` is `None` for anonymous callers and for operations whose result
    /// does not depend on who asks.
    pub fn build(&self, operation: &str, identity: Option<&str>, args: &Value) -> CacheKey {
        let scope = match identity {
            Some(id) if !id.is_empty() => self.identity_scope(id),
            _ => PUBLIC_SCOPE.to_string(),
        };

        let canonical = canonicalize(args);
        let digest = hex::encode(Sha256::digest(canonical.as_bytes()));

        CacheKey::from_parts(format!(
            "{}:{}:{}",
            operation,
            scope,
            &digest[..ARGS_DIGEST_LEN]
        ))
    }

    /// Prefix shared by every key of an operation
    pub fn operation_prefix(operation: &str) -> String {
        format!("{}:", operation)
    }

    fn identity_scope(&self, identity: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.identity_salt.as_bytes());
        hasher.update([0u8]);
        hasher.update(identity.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("u-{}", &digest[..IDENTITY_DIGEST_LEN])
    }
}

/// Encode a JSON value with object keys sorted at every depth
pub fn canonicalize(value: &Value) -> String {
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
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[test]
    fn test_canonical_sorts_nested_keys() {
        let value = json!({"b": {"z": 1, "a": [ {"y": true, "x": null} ]}, "a": "s"});
        assert_eq!(
            canonicalize(&value),
            r#"{"a":"s","b":{"a":[{"x":null,"y":true}],"z":1}}"#
        );
    }

    #[test]
    fn test_key_independent_of_insertion_order() {
        let mut first = Map::new();
        first.insert("specialty".to_string(), json!("cardiology"));
        first.insert("city".to_string(), json!("Lyon"));

        let mut second = Map::new();
        second.insert("city".to_string(), json!("Lyon"));
        second.insert("specialty".to_string(), json!("cardiology"));

        let builder = CacheKeyBuilder::new();
        assert_eq!(
            builder.build("findDoctors", None, &Value::Object(first)),
            builder.build("findDoctors", None, &Value::Object(second))
        );
    }

    #[test]
    fn test_key_layout() {
        let key = CacheKeyBuilder::new().build("findDoctors", None, &json!({}));
        let parts: Vec<&str> = key.as_str().split(':').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "findDoctors");
        assert_eq!(parts[1], PUBLIC_SCOPE);
        assert_eq!(parts[2].len(), ARGS_DIGEST_LEN);
        assert!(key.starts_with(&CacheKeyBuilder::operation_prefix("findDoctors")));
    }

    #[test]
    fn test_identities_never_share_keys() {
        let builder = CacheKeyBuilder::new();
        let args = json!({"appointmentId": 7});

        let alice = builder.build("getAppointment", Some("alice"), &args);
        let bob = builder.build("getAppointment", Some("bob"), &args);
        let anonymous = builder.build("getAppointment", None, &args);

        assert_ne!(alice, bob);
        assert_ne!(alice, anonymous);
        assert!(!alice.as_str().contains("alice"));
    }

    #[test]
    fn test_empty_identity_is_public() {
        let builder = CacheKeyBuilder::new();
        let args = json!([1, 2]);
        assert_eq!(
            builder.build("op", Some(""), &args),
            builder.build("op", None, &args)
        );
    }

    #[test]
    fn test_salt_changes_identity_scope() {
        let args = json!({});
        let plain = CacheKeyBuilder::new().build("op", Some("alice"), &args);
        let salted = CacheKeyBuilder::with_identity_salt("eu-1").build("op", Some("alice"), &args);
        assert_ne!(plain, salted);
    }

    #[test]
    fn test_different_args_differ() {
        let builder = CacheKeyBuilder::new();
        assert_ne!(
            builder.build("op", None, &json!({"page": 1})),
            builder.build("op", None, &json!({"page": 2}))
        );
    }
}
