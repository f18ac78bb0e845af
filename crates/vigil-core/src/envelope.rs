// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire envelopes for check dispatch and result ingestion.
//!
//! Dispatch envelopes are built strictly (we own the producer side); result
//! envelopes are decoded tolerantly because they arrive from external
//! workers of varying quality. Decoding is split in two stages: raw bytes to
//! a JSON object (malformed-message errors), then object to a validated
//! [`ResultEnvelope`] (domain-validation errors). A message that fails
//! either stage can never succeed on redelivery.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Wire protocol version stamped on every dispatch envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// Outcome status reported by a check worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Probe succeeded.
    Pass,
    /// Probe succeeded but crossed a warning threshold.
    Warn,
    /// Probe failed its assertion.
    Fail,
    /// Probe could not be executed at all.
    Error,
}

impl RunStatus {
    /// Parse a status string case-insensitively.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "pass" => Some(Self::Pass),
            "warn" => Some(Self::Warn),
            "fail" => Some(Self::Fail),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Canonical lowercase form, as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warn => "warn",
            Self::Fail => "fail",
            Self::Error => "error",
        }
    }

    /// Whether this status counts toward an incident failure streak.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail | Self::Error)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check-run request published to the request queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEnvelope {
    /// Protocol version, fixed at [`PROTOCOL_VERSION`].
    pub version: u32,
    /// Fresh v4 UUID identifying this dispatch, echoed back by workers.
    pub correlation_id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Check being executed.
    pub check_id: Uuid,
    /// Probe kind the worker should run.
    #[serde(rename = "type")]
    pub check_type: String,
    /// Check config with any per-dispatch overrides deep-merged in.
    pub config: Value,
    /// Worker-side execution deadline in seconds.
    pub timeout_sec: u64,
    /// Queue the worker should publish its result to.
    pub reply_to: String,
    /// Publish timestamp (UTC).
    pub sent_at: DateTime<Utc>,
}

/// Validated check result, decoded from a result-queue message.
#[derive(Debug, Clone)]
pub struct ResultEnvelope {
    /// Correlation id from the body, or the AMQP property fallback.
    pub correlation_id: String,
    /// Owning project.
    pub project_id: Uuid,
    /// Check this result belongs to.
    pub check_id: Uuid,
    /// Reported outcome.
    pub status: RunStatus,
    /// Completion time (UTC); absent means "use now", an unparsable value
    /// rejects the envelope.
    pub finished_at: Option<DateTime<Utc>>,
    /// Probe latency, non-negative; invalid values are discarded.
    pub latency_ms: Option<i64>,
    /// HTTP status, from `http_status_code` or legacy `http_status`.
    pub http_status_code: Option<i32>,
    /// Worker-reported error text, if any.
    pub error_message: Option<String>,
    /// The full raw result object, retained verbatim for storage.
    pub payload: Value,
}

/// Decode a raw message body into a JSON object.
///
/// Undecodable bytes are replaced rather than rejected; the payload itself
/// must parse as JSON and have an object at the top level.
pub fn parse_result_body(raw: &[u8]) -> Result<Map<String, Value>> {
    let text = String::from_utf8_lossy(raw);
    let value: Value = serde_json::from_str(&text)
        .map_err(|e| Error::MalformedMessage(format!("body is not valid JSON: {e}")))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::MalformedMessage(format!(
            "body is not a JSON object (got {})",
            json_type_name(&other)
        ))),
    }
}

impl ResultEnvelope {
    /// Validate a decoded result object.
    ///
    /// `fallback_correlation_id` is the broker message's own correlation-id
    /// property; it is used when the body carries none, and the winning id
    /// is written back into the retained payload so stored payloads and
    /// dedup keys always agree.
    pub fn from_object(
        mut map: Map<String, Value>,
        fallback_correlation_id: Option<&str>,
    ) -> Result<Self> {
        let correlation_id = map
            .get("correlation_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| fallback_correlation_id.map(str::to_string))
            .ok_or(Error::MissingField("correlation_id"))?;
        map.insert(
            "correlation_id".to_string(),
            Value::String(correlation_id.clone()),
        );

        let project_id = required_uuid(&map, "project_id")?;
        let check_id = required_uuid(&map, "check_id")?;

        let status_raw = map
            .get("status")
            .and_then(Value::as_str)
            .ok_or(Error::MissingField("status"))?;
        let status = RunStatus::parse(status_raw)
            .ok_or_else(|| Error::InvalidStatus(status_raw.to_string()))?;

        let finished_at = match map.get("finished_at") {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) if raw.is_empty() => None,
            Some(Value::String(raw)) => {
                Some(parse_timestamp(raw).ok_or_else(|| Error::InvalidField {
                    field: "finished_at",
                    message: format!("not a timestamp: {raw}"),
                })?)
            }
            Some(other) => {
                return Err(Error::InvalidField {
                    field: "finished_at",
                    message: format!("expected string, got {}", json_type_name(other)),
                });
            }
        };

        let latency_ms = map
            .get("latency_ms")
            .and_then(Value::as_i64)
            .filter(|v| *v >= 0);

        let http_status_code = ["http_status_code", "http_status"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_i64))
            .and_then(|v| i32::try_from(v).ok());

        let error_message = map
            .get("error_message")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            correlation_id,
            project_id,
            check_id,
            status,
            finished_at,
            latency_ms,
            http_status_code,
            error_message,
            payload: Value::Object(map),
        })
    }
}

/// Derive a run's start time from its completion time and reported latency.
pub fn derive_started_at(finished_at: DateTime<Utc>, latency_ms: Option<i64>) -> DateTime<Utc> {
    match latency_ms {
        Some(ms) if ms >= 0 => finished_at - chrono::Duration::milliseconds(ms),
        _ => finished_at,
    }
}

/// Recursively merge `overrides` into `base`.
///
/// Matching nested objects merge key-by-key; any other override value
/// (scalar, array, or type mismatch) replaces the base value. Keys present
/// on only one side pass through. Neither input is mutated.
pub fn deep_merge(base: &Value, overrides: &Value) -> Value {
    match (base, overrides) {
        (Value::Object(a), Value::Object(b)) => {
            let mut merged = a.clone();
            for (key, value) in b {
                let entry = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), entry);
            }
            Value::Object(merged)
        }
        (_, other) => other.clone(),
    }
}

const SENSITIVE_KEY_MARKERS: [&str; 5] = ["password", "secret", "token", "authorization", "key"];

/// Produce a copy of `value` safe for logging.
///
/// Values under keys whose name contains a sensitive marker (case
/// insensitive) are replaced with `"***"` at any nesting depth.
pub fn mask_secrets(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| {
                    let lowered = key.to_ascii_lowercase();
                    if SENSITIVE_KEY_MARKERS.iter().any(|m| lowered.contains(m)) {
                        (key.clone(), Value::String("***".to_string()))
                    } else {
                        (key.clone(), mask_secrets(inner))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(mask_secrets).collect()),
        other => other.clone(),
    }
}

fn required_uuid(map: &Map<String, Value>, field: &'static str) -> Result<Uuid> {
    let raw = map
        .get(field)
        .and_then(Value::as_str)
        .ok_or(Error::MissingField(field))?;
    Uuid::parse_str(raw).map_err(|_| Error::InvalidField {
        field,
        message: format!("not a UUID: {raw}"),
    })
}

/// Parse an ISO-8601 timestamp, assuming UTC when no zone is present.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("test fixture must be an object"),
        }
    }

    fn base_result() -> Value {
        json!({
            "correlation_id": "corr-1",
            "project_id": "8f7e0ad9-3f88-4c6a-b55a-61e8c1e3c9d1",
            "check_id": "2a9b6a47-5a8c-4f0e-bd8f-0d43c3a9a611",
            "status": "pass",
        })
    }

    #[test]
    fn test_status_parse_case_insensitive() {
        assert_eq!(RunStatus::parse("PASS"), Some(RunStatus::Pass));
        assert_eq!(RunStatus::parse("Fail"), Some(RunStatus::Fail));
        assert_eq!(RunStatus::parse("warn"), Some(RunStatus::Warn));
        assert_eq!(RunStatus::parse("unknown"), None);
    }

    #[test]
    fn test_parse_body_rejects_non_object() {
        assert!(matches!(
            parse_result_body(b"[1, 2, 3]"),
            Err(Error::MalformedMessage(_))
        ));
        assert!(matches!(
            parse_result_body(b"not json at all"),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_parse_body_tolerates_invalid_utf8() {
        // Invalid bytes inside a string are replaced, not fatal
        let raw = b"{\"status\": \"pass\xff\"}".to_vec();
        let map = parse_result_body(&raw).unwrap();
        assert!(map.contains_key("status"));
    }

    #[test]
    fn test_correlation_id_falls_back_to_property() {
        let mut map = object(base_result());
        map.remove("correlation_id");
        let envelope = ResultEnvelope::from_object(map, Some("prop-corr")).unwrap();
        assert_eq!(envelope.correlation_id, "prop-corr");
        // Written back into the retained payload
        assert_eq!(
            envelope.payload.get("correlation_id").and_then(Value::as_str),
            Some("prop-corr")
        );
    }

    #[test]
    fn test_missing_correlation_id_rejected() {
        let mut map = object(base_result());
        map.remove("correlation_id");
        assert!(matches!(
            ResultEnvelope::from_object(map, None),
            Err(Error::MissingField("correlation_id"))
        ));
    }

    #[test]
    fn test_invalid_status_rejected() {
        let mut map = object(base_result());
        map.insert("status".into(), json!("unknown"));
        assert!(matches!(
            ResultEnvelope::from_object(map, None),
            Err(Error::InvalidStatus(_))
        ));
    }

    #[test]
    fn test_http_status_legacy_field_and_tolerance() {
        let mut map = object(base_result());
        map.insert("http_status".into(), json!(502));
        let envelope = ResultEnvelope::from_object(map, None).unwrap();
        assert_eq!(envelope.http_status_code, Some(502));

        let mut map = object(base_result());
        map.insert("http_status_code".into(), json!("200"));
        let envelope = ResultEnvelope::from_object(map, None).unwrap();
        assert_eq!(envelope.http_status_code, None);
    }

    #[test]
    fn test_negative_latency_discarded() {
        let mut map = object(base_result());
        map.insert("latency_ms".into(), json!(-5));
        let envelope = ResultEnvelope::from_object(map, None).unwrap();
        assert_eq!(envelope.latency_ms, None);
    }

    #[test]
    fn test_finished_at_formats() {
        for raw in [
            "2024-01-01T00:01:00Z",
            "2024-01-01T00:01:00+00:00",
            "2024-01-01T00:01:00",
            "2024-01-01 00:01:00",
        ] {
            let mut map = object(base_result());
            map.insert("finished_at".into(), json!(raw));
            let envelope = ResultEnvelope::from_object(map, None).unwrap();
            let finished = envelope.finished_at.unwrap();
            assert_eq!(finished.to_rfc3339(), "2024-01-01T00:01:00+00:00", "{raw}");
        }
    }

    #[test]
    fn test_unparsable_finished_at_rejected() {
        for bad in [json!("yesterday-ish"), json!(1700000000)] {
            let mut map = object(base_result());
            map.insert("finished_at".into(), bad);
            assert!(matches!(
                ResultEnvelope::from_object(map, None),
                Err(Error::InvalidField {
                    field: "finished_at",
                    ..
                })
            ));
        }
    }

    #[test]
    fn test_absent_finished_at_defaults_later() {
        // No finished_at, or an empty one, defers to processing time
        let envelope = ResultEnvelope::from_object(object(base_result()), None).unwrap();
        assert_eq!(envelope.finished_at, None);

        let mut map = object(base_result());
        map.insert("finished_at".into(), json!(""));
        let envelope = ResultEnvelope::from_object(map, None).unwrap();
        assert_eq!(envelope.finished_at, None);
    }

    #[test]
    fn test_derive_started_at_from_latency() {
        let finished = DateTime::parse_from_rfc3339("2024-01-01T00:01:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let started = derive_started_at(finished, Some(5000));
        assert_eq!(started.to_rfc3339(), "2024-01-01T00:00:55+00:00");
        assert_eq!(derive_started_at(finished, None), finished);
    }

    #[test]
    fn test_deep_merge_nested_objects() {
        let base = json!({"a": {"x": 1, "y": 2}});
        let overrides = json!({"a": {"y": 9, "z": 3}});
        let merged = deep_merge(&base, &overrides);
        assert_eq!(merged, json!({"a": {"x": 1, "y": 9, "z": 3}}));
    }

    #[test]
    fn test_deep_merge_scalar_replaces() {
        let base = json!({"a": {"x": 1}, "b": [1, 2]});
        let overrides = json!({"a": 5, "b": [3]});
        let merged = deep_merge(&base, &overrides);
        assert_eq!(merged, json!({"a": 5, "b": [3]}));
    }

    #[test]
    fn test_mask_secrets_recurses() {
        let config = json!({
            "url": "https://example.com",
            "auth": {"api_token": "s3cret", "user": "monitor"},
            "Password": "hunter2",
        });
        let masked = mask_secrets(&config);
        assert_eq!(masked["auth"]["api_token"], json!("***"));
        assert_eq!(masked["Password"], json!("***"));
        assert_eq!(masked["auth"]["user"], json!("monitor"));
        assert_eq!(masked["url"], json!("https://example.com"));
    }

    #[test]
    fn test_dispatch_envelope_wire_shape() {
        let envelope = DispatchEnvelope {
            version: PROTOCOL_VERSION,
            correlation_id: Uuid::nil(),
            project_id: Uuid::nil(),
            check_id: Uuid::nil(),
            check_type: "http".to_string(),
            config: json!({"url": "https://example.com"}),
            timeout_sec: 10,
            reply_to: "vigil.checks.results".to_string(),
            sent_at: Utc::now(),
        };
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["version"], json!(1));
        assert_eq!(wire["type"], json!("http"));
        assert!(wire.get("check_type").is_none());
    }
}
