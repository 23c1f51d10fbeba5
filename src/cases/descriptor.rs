//! # Test-case descriptors and their command-line-safe token form.
//!
//! A [`TestCaseDescriptor`] is what discovery hands to execution: enough to
//! identify, display and re-run a single case. To move a case across the
//! process boundary it is turned into a compact token:
//!
//! ```text
//! <version>:<base64url(json)>
//! 1:eyJ1bmlxdWVJZCI6ImMxIiwiZGlzcGxheU5hbWUiOiJhZGRzIn0
//! ```
//!
//! The token uses only `[0-9A-Za-z_:-]`, so it survives shells and response
//! files without quoting.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

const TOKEN_VERSION: u32 = 1;

/// Identity and metadata of one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseDescriptor {
    /// Stable identifier, unique within an assembly.
    pub unique_id: String,
    /// Name shown to users.
    pub display_name: String,
    /// Declaring class, if the framework has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Test method name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,
    /// Trait name → values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub traits: BTreeMap<String, Vec<String>>,
    /// Static skip reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Data arguments for theory-style cases.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<serde_json::Value>,
}

impl TestCaseDescriptor {
    /// Creates a descriptor with only the required fields.
    pub fn new(unique_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            unique_id: unique_id.into(),
            display_name: display_name.into(),
            class_name: None,
            method_name: None,
            traits: BTreeMap::new(),
            skip_reason: None,
            arguments: Vec::new(),
        }
    }

    /// Sets class and method names.
    #[must_use]
    pub fn with_method(mut self, class: impl Into<String>, method: impl Into<String>) -> Self {
        self.class_name = Some(class.into());
        self.method_name = Some(method.into());
        self
    }

    /// Adds one trait value.
    #[must_use]
    pub fn with_trait(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.traits.entry(name.into()).or_default().push(value.into());
        self
    }

    /// Marks the case as statically skipped.
    #[must_use]
    pub fn with_skip(mut self, reason: impl Into<String>) -> Self {
        self.skip_reason = Some(reason.into());
        self
    }

    /// Appends a data argument.
    pub fn with_argument(mut self, value: impl Serialize) -> Result<Self, RunnerError> {
        let value = serde_json::to_value(value).map_err(|e| RunnerError::Deserialize {
            reason: format!("argument is not serializable: {e}"),
        })?;
        self.arguments.push(value);
        Ok(self)
    }

    /// Encodes the descriptor as a command-line-safe token.
    pub fn serialize(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        format!("{TOKEN_VERSION}:{}", URL_SAFE_NO_PAD.encode(json))
    }

    /// Decodes a token produced by [`serialize`](Self::serialize).
    pub fn deserialize(token: &str) -> Result<Self, RunnerError> {
        let (version, payload) = token
            .trim()
            .split_once(':')
            .ok_or_else(|| bad_token("missing version prefix"))?;
        match version.parse::<u32>() {
            Ok(TOKEN_VERSION) => {}
            Ok(other) => return Err(bad_token(format!("unsupported version {other}"))),
            Err(_) => return Err(bad_token(format!("invalid version '{version}'"))),
        }
        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| bad_token(format!("invalid base64: {e}")))?;
        serde_json::from_slice(&json).map_err(|e| bad_token(format!("invalid payload: {e}")))
    }
}

fn bad_token(reason: impl std::fmt::Display) -> RunnerError {
    RunnerError::Deserialize {
        reason: format!("test case token: {reason}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_command_line_safe_and_decodes() {
        let case = TestCaseDescriptor::new("c1", "adds numbers (a: 1, b: \"two\")")
            .with_method("math.Calculator", "adds")
            .with_trait("category", "fast")
            .with_argument(1)
            .unwrap()
            .with_argument("two")
            .unwrap();
        let token = case.serialize();

        assert!(token.starts_with("1:"));
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':'))
        );
        assert_eq!(TestCaseDescriptor::deserialize(&token).unwrap(), case);
    }

    #[test]
    fn rejects_malformed_tokens() {
        for token in ["", "abc", "2:e30", "x:e30", "1:!!!", "1:bm90IGpzb24"] {
            let err = TestCaseDescriptor::deserialize(token).unwrap_err();
            assert_eq!(err.as_label(), "runner_deserialize", "token {token:?}");
        }
    }
}
