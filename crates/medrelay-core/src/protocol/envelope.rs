//! Business envelope (JSON payload of `JsonRequest` / `JsonResponse`).
//!
//! Requests carry `action` plus an optional client-supplied `uuid`; every other
//! field is kept verbatim in `fields` for the handler to interpret. Responses
//! echo the request id back as `request_uuid`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{RelayError, Result};

/// Inbound business request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub action: String,
    /// Correlation id. Optional on the wire, always present after the router
    /// has accepted the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Request {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            uuid: None,
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| RelayError::BadRequest(format!("invalid request envelope: {e}")))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| RelayError::BadRequest(format!("invalid request envelope: {e}")))
    }

    /// Correlation id, treating an empty string as absent.
    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref().filter(|u| !u.is_empty())
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// String field, empty when absent.
    pub fn string(&self, key: &str) -> String {
        self.str_field(key).unwrap_or_default().to_string()
    }

    /// Integer field; numeric strings are accepted too.
    pub fn i64_field(&self, key: &str) -> Option<i64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Outbound business response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Mirrors the handled action, e.g. `poll_events_response`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_uuid: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub fn ok(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            request_uuid: None,
            success: true,
            data: Some(data),
            error: None,
            message: None,
        }
    }

    pub fn fail(kind: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            request_uuid: None,
            success: false,
            data: None,
            error: Some(error.into()),
            message: None,
        }
    }

    /// Failure response for an action no handler is registered for.
    pub fn unknown_action(action: &str) -> Self {
        Self::fail("unknown_response", format!("Unknown action: {action}"))
    }

    /// Response kind for a given action (`<action>_response`).
    pub fn kind_for(action: &str) -> String {
        format!("{action}_response")
    }

    pub fn correlated(mut self, request_uuid: impl Into<String>) -> Self {
        self.request_uuid = Some(request_uuid.into());
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Read the correlation id of a raw response payload.
pub fn request_uuid_of(payload: &Value) -> Option<&str> {
    payload
        .get("request_uuid")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn request_keeps_unknown_fields() {
        let req = Request::from_value(json!({
            "action": "poll_events",
            "user": "alice",
            "cursor": "10",
        }))
        .unwrap();
        assert_eq!(req.action, "poll_events");
        assert!(req.uuid().is_none());
        assert_eq!(req.str_field("user"), Some("alice"));
        assert_eq!(req.i64_field("cursor"), Some(10));

        let v = req.to_value();
        assert_eq!(v["user"], "alice");
        assert!(v.get("uuid").is_none());
    }

    #[test]
    fn empty_uuid_is_absent() {
        let req = Request::from_value(json!({"action": "echo", "uuid": ""})).unwrap();
        assert!(req.uuid().is_none());
    }

    #[test]
    fn missing_action_is_bad_request() {
        let err = Request::from_value(json!({"uuid": "u1"})).unwrap_err();
        assert_eq!(err.client_code().as_str(), "BAD_REQUEST");
    }

    #[test]
    fn response_shape() {
        let v = Response::ok("echo_response", json!({"a": 1}))
            .correlated("u-1")
            .to_value();
        assert_eq!(v["type"], "echo_response");
        assert_eq!(v["request_uuid"], "u-1");
        assert_eq!(v["success"], true);
        assert!(v.get("error").is_none());
        assert_eq!(request_uuid_of(&v), Some("u-1"));

        let v = Response::unknown_action("nope").to_value();
        assert_eq!(v["success"], false);
        assert_eq!(v["error"], "Unknown action: nope");
        assert_eq!(request_uuid_of(&v), None);
    }
}
