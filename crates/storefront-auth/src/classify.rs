//! Detection of server-side credential rejection
//!
//! Storefront-style APIs report a dead token inside the body rather than (or
//! as well as) through the status code:
//!
//! ```json
//! {"status": false, "error": "Access token is not valid"}
//! ```
//!
//! The flag key and message keys vary by vendor, so both are configurable
//! through `RejectionShape`.

use serde::Deserialize;
use serde_json::Value;

use crate::constants::{
    DEFAULT_REJECTION_FLAG_KEY, DEFAULT_REJECTION_MESSAGE_KEYS, GENERIC_FAILURE_MESSAGE,
};

/// Outcome of inspecting an authorized response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialVerdict {
    /// No rejection signal
    StillValid,
    /// The server asserts the credential is no longer valid
    Rejected(String),
}

/// Where the rejection signal lives in a response body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RejectionShape {
    /// Key of the boolean success flag; `false` means rejected
    #[serde(default = "default_flag_key")]
    pub flag_key: String,
    /// Keys checked in order for the message
    #[serde(default = "default_message_keys")]
    pub message_keys: Vec<String>,
}

fn default_flag_key() -> String {
    DEFAULT_REJECTION_FLAG_KEY.to_owned()
}

fn default_message_keys() -> Vec<String> {
    DEFAULT_REJECTION_MESSAGE_KEYS
        .iter()
        .map(|k| (*k).to_owned())
        .collect()
}

impl Default for RejectionShape {
    fn default() -> Self {
        Self {
            flag_key: default_flag_key(),
            message_keys: default_message_keys(),
        }
    }
}

impl RejectionShape {
    /// If `body` carries the rejection flag set to `false`, return the
    /// rejection message (server-supplied, else generic).
    pub fn rejection(&self, body: &Value) -> Option<String> {
        let flag = body.as_object()?.get(&self.flag_key)?;
        if flag.as_bool() != Some(false) {
            return None;
        }
        Some(self.message(body).unwrap_or_else(|| GENERIC_FAILURE_MESSAGE.to_owned()))
    }

    /// First usable message from the OAuth `error_description`, then the
    /// configured keys, then the OAuth `error` code.
    pub fn message(&self, body: &Value) -> Option<String> {
        let obj = body.as_object()?;
        std::iter::once("error_description")
            .chain(self.message_keys.iter().map(String::as_str))
            .chain(["error"])
            .filter_map(|key| obj.get(key))
            .find_map(render_message)
    }

    /// Classify a completed authorized response.
    ///
    /// A body with the flag set to `false` is `Rejected` regardless of status.
    /// A 401 is `Rejected` even without a recognizable body. Everything else
    /// is `StillValid`: other failures say nothing about the credential.
    pub fn classify(&self, status: u16, body: &str) -> CredentialVerdict {
        let parsed = serde_json::from_str::<Value>(body).ok();
        if let Some(message) = parsed.as_ref().and_then(|v| self.rejection(v)) {
            return CredentialVerdict::Rejected(message);
        }
        if status == 401 {
            let message = parsed
                .as_ref()
                .and_then(|v| self.message(v))
                .unwrap_or_else(|| "access token rejected (401)".to_owned());
            return CredentialVerdict::Rejected(message);
        }
        CredentialVerdict::StillValid
    }
}

/// Strings verbatim, arrays of strings joined, other non-null JSON compact.
fn render_message(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(render_message).collect();
            (!parts.is_empty()).then(|| parts.join("; "))
        }
        Value::Bool(_) => None,
        other => Some(other.to_string()),
    }
}
