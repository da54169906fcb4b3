//! Deterministic request fingerprints for the response cache.
//!
//! A fingerprint is the SHA-256 of a canonical JSON rendering of
//! `{model, mode, request}` where object keys are sorted at every depth.
//! Caller identity, session id and timestamps live in [`CallContext`] and
//! never reach the hash.
//!
//! [`CallContext`]: crate::request::CallContext

use crate::request::{CompletionRequest, EmbeddingRequest, RequestMode};
use crate::types::ModelName;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fmt::Write as _;

/// Hex-encoded SHA-256 of normalized request content
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    /// Fingerprint a completion request for a logical model
    ///
    /// # Errors
    /// Returns an error if the request cannot be rendered as JSON
    pub fn for_completion(model: &ModelName, request: &CompletionRequest) -> Result<Self, serde_json::Error> {
        Self::compute(model, RequestMode::Generate, serde_json::to_value(request)?)
    }

    /// Fingerprint an embedding request for a logical model
    ///
    /// # Errors
    /// Returns an error if the request cannot be rendered as JSON
    pub fn for_embedding(model: &ModelName, request: &EmbeddingRequest) -> Result<Self, serde_json::Error> {
        Self::compute(model, RequestMode::Embed, serde_json::to_value(request)?)
    }

    fn compute(model: &ModelName, mode: RequestMode, request: Value) -> Result<Self, serde_json::Error> {
        let envelope = serde_json::json!({
            "model": model.as_str(),
            "mode": mode,
            "request": request,
        });
        let mut canonical = String::new();
        write_canonical(&envelope, &mut canonical);

        let digest = Sha256::digest(canonical.as_bytes());
        let mut hex = String::with_capacity(64);
        for byte in digest.iter() {
            let _ = write!(hex, "{byte:02x}");
        }
        Ok(Self(hex))
    }

    /// Hex digest
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
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
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        leaf => out.push_str(&leaf.to_string()),
    }
}
