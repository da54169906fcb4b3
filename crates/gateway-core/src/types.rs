//! Validated domain types (newtypes) for the gateway call surface.
//!
//! Scalars that arrive from callers or configuration are wrapped so an
//! out-of-range value is rejected once, at the boundary, instead of being
//! forwarded to a backend.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use thiserror::Error;

/// Validation error for domain types
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// A sampling parameter outside its accepted range
    #[error("Invalid {field} {value}: expected {range}")]
    OutOfRange {
        /// Request field
        field: &'static str,
        /// Rejected value
        value: f64,
        /// Accepted range, in interval notation
        range: &'static str,
    },

    /// Logical model name validation failed
    #[error("Invalid model name: {reason}")]
    InvalidModelName {
        /// Reason for validation failure
        reason: String,
    },

    /// Backend identifier validation failed
    #[error("Invalid backend id: {reason}")]
    InvalidBackendId {
        /// Reason for validation failure
        reason: String,
    },

    /// Caller identifier validation failed
    #[error("Invalid caller id: {reason}")]
    InvalidCallerId {
        /// Reason for validation failure
        reason: String,
    },

    /// API key validation failed
    #[error("Invalid api_key: {reason}")]
    InvalidApiKey {
        /// Reason for validation failure
        reason: String,
    },

    /// A required collection was empty
    #[error("{field} must not be empty")]
    Empty {
        /// Field that was empty
        field: &'static str,
    },
}

impl ValidationError {
    /// Name of the request field the error refers to
    #[must_use]
    pub fn field(&self) -> &'static str {
        match self {
            Self::OutOfRange { field, .. } | Self::Empty { field } => field,
            Self::InvalidModelName { .. } => "model",
            Self::InvalidBackendId { .. } => "backend_id",
            Self::InvalidCallerId { .. } => "caller",
            Self::InvalidApiKey { .. } => "api_key",
        }
    }
}

/// Conversions shared by the sampling-parameter newtypes. Each type
/// provides `accepts(raw) -> bool`; everything else goes through `new`.
macro_rules! sampling_param {
    ($name:ident, $raw:ty, $field:literal, $range:literal) => {
        impl $name {
            #[doc = concat!("Validate a ", $field, " value in ", $range)]
            ///
            /// # Errors
            /// Returns `ValidationError::OutOfRange` for any other value
            pub fn new(value: $raw) -> Result<Self, ValidationError> {
                if Self::accepts(value) {
                    Ok(Self::wrap(value))
                } else {
                    Err(ValidationError::OutOfRange {
                        field: $field,
                        value: f64::from(value),
                        range: $range,
                    })
                }
            }
        }

        impl TryFrom<$raw> for $name {
            type Error = ValidationError;

            fn try_from(value: $raw) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for $raw {
            fn from(param: $name) -> Self {
                param.value()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.value())
            }
        }
    };
}

/// Sampling temperature
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct Temperature(f32);

sampling_param!(Temperature, f32, "temperature", "[0, 2]");

impl Temperature {
    /// Applied when a caller does not choose one
    pub const DEFAULT: f32 = 0.7;

    fn accepts(value: f32) -> bool {
        (0.0..=2.0).contains(&value)
    }

    fn wrap(value: f32) -> Self {
        Self(value)
    }

    /// Inner value
    #[must_use]
    pub fn value(&self) -> f32 {
        self.0
    }
}

impl Default for Temperature {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

/// Completion token budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct MaxTokens(NonZeroU32);

sampling_param!(MaxTokens, u32, "max_tokens", "[1, 128000]");

impl MaxTokens {
    /// Largest budget any backend is asked for
    pub const LIMIT: u32 = 128_000;
    /// Applied when a caller does not choose one
    pub const DEFAULT: u32 = 2000;

    fn accepts(value: u32) -> bool {
        (1..=Self::LIMIT).contains(&value)
    }

    fn wrap(value: u32) -> Self {
        Self(NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN))
    }

    /// Inner value
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0.get()
    }
}

impl Default for MaxTokens {
    fn default() -> Self {
        Self::wrap(Self::DEFAULT)
    }
}

/// Nucleus sampling mass
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct TopP(f32);

sampling_param!(TopP, f32, "top_p", "(0, 1]");

impl TopP {
    fn accepts(value: f32) -> bool {
        value > 0.0 && value <= 1.0
    }

    fn wrap(value: f32) -> Self {
        Self(value)
    }

    /// Inner value
    #[must_use]
    pub fn value(&self) -> f32 {
        self.0
    }
}

/// Implements the string-newtype boilerplate shared by identifier types.
macro_rules! string_newtype {
    ($name:ident, $variant:ident, $label:literal, $max:expr) => {
        impl $name {
            /// Maximum length of the identifier
            pub const MAX_LENGTH: usize = $max;

            /// Create a new identifier with validation
            ///
            /// # Errors
            /// Returns a validation error if the value is empty or too long
            pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(ValidationError::$variant {
                        reason: concat!($label, " cannot be empty").to_string(),
                    });
                }
                if value.len() > Self::MAX_LENGTH {
                    return Err(ValidationError::$variant {
                        reason: format!(
                            concat!($label, " exceeds maximum length of {}"),
                            Self::MAX_LENGTH
                        ),
                    });
                }
                Ok(Self(value))
            }

            /// Get the inner value as a string slice
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = ValidationError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

/// Caller-facing logical model name (non-empty, max 256 chars)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelName(String);

string_newtype!(ModelName, InvalidModelName, "model name", 256);

/// Identifier of one backend descriptor (non-empty, max 128 chars)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackendId(String);

string_newtype!(BackendId, InvalidBackendId, "backend id", 128);

/// Identity of the application component issuing a call
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CallerId(String);

string_newtype!(CallerId, InvalidCallerId, "caller id", 128);

impl CallerId {
    /// Caller used when none is supplied
    #[must_use]
    pub fn anonymous() -> Self {
        Self("anonymous".to_string())
    }
}

impl Default for CallerId {
    fn default() -> Self {
        Self::anonymous()
    }
}

/// API key (sensitive, never logged)
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Create a new API key
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidApiKey` if the key is empty
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ValidationError::InvalidApiKey {
                reason: "api_key cannot be empty".to_string(),
            });
        }
        Ok(Self(SecretString::new(value)))
    }

    /// Expose the secret value (use sparingly)
    #[must_use]
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey([REDACTED])")
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<'de> Deserialize<'de> for ApiKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for ApiKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("[REDACTED]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_ranges() {
        for ok in [0.0, 0.7, 2.0] {
            assert!(Temperature::new(ok).is_ok(), "{ok}");
        }
        for bad in [-0.1, 2.1, f32::NAN] {
            assert!(Temperature::new(bad).is_err(), "{bad}");
        }
        assert!(TopP::new(1.0).is_ok());
        assert!(TopP::new(0.0).is_err());
        assert!(MaxTokens::new(MaxTokens::LIMIT).is_ok());
        assert!(MaxTokens::new(0).is_err());
        assert!(MaxTokens::new(MaxTokens::LIMIT + 1).is_err());
    }

    #[test]
    fn test_out_of_range_names_field() {
        let err = TopP::new(1.5).unwrap_err();
        assert_eq!(err.field(), "top_p");
        assert_eq!(err.to_string(), "Invalid top_p 1.5: expected (0, 1]");

        let err: Result<Temperature, _> = serde_json::from_str("3.0");
        assert!(err.is_err());
    }

    #[test]
    fn test_defaults() {
        assert!((Temperature::default().value() - 0.7).abs() < f32::EPSILON);
        assert_eq!(MaxTokens::default().value(), MaxTokens::DEFAULT);
        assert_eq!(u32::from(MaxTokens::default()), 2000);
    }

    #[test]
    fn test_identifiers() {
        assert!(ModelName::new("chat-default").is_ok());
        assert!(ModelName::new("   ").is_err());
        assert!(BackendId::new("b".repeat(129)).is_err());
        let err = CallerId::new("").unwrap_err();
        assert_eq!(err.field(), "caller");
        assert_eq!(CallerId::default().as_str(), "anonymous");
    }

    #[test]
    fn test_model_name_deserialize_rejects_empty() {
        let parsed: Result<ModelName, _> = serde_json::from_str("\"\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_api_key_redacted() {
        let key = ApiKey::new("sk-secret-key").expect("valid key");
        assert!(!format!("{key} {key:?}").contains("sk-secret"));
        assert_eq!(key.expose_secret(), "sk-secret-key");
        assert!(ApiKey::new("").is_err());
    }
}
