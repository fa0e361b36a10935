//! Check record emitted to stdout as NDJSON.
//!
//! One JSON object per line: ts, value, then the outcome (duplicate or forgotten) or error.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CheckRecord {
    pub ts: String, // RFC 3339, UTC
    pub value: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forgotten: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckRecord {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            value,
            duplicate: None,
            forgotten: None,
            error: None,
        }
    }

    pub fn with_ts(mut self, ts: impl Into<String>) -> Self {
        self.ts = ts.into();
        self
    }

    /// Fill duplicate or error from a check outcome.
    pub fn with_outcome(mut self, outcome: &crate::Result<bool>) -> Self {
        match outcome {
            Ok(duplicate) => self.duplicate = Some(*duplicate),
            Err(e) => self.error = Some(e.to_string()),
        }
        self
    }

    /// Fill forgotten or error from an eviction outcome.
    pub fn with_forget_outcome(mut self, outcome: &crate::Result<bool>) -> Self {
        match outcome {
            Ok(removed) => self.forgotten = Some(*removed),
            Err(e) => self.error = Some(e.to_string()),
        }
        self
    }

    /// Serialize to one NDJSON line (no trailing newline; caller adds).
    pub fn to_ndjson_line(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).map_err(anyhow::Error::from)
    }
}
