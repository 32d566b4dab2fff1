//! Wire records exchanged with the worker process.
//!
//! Outbound requests are flat JSON objects: the envelope fields
//! `correlationId` and `action` sit next to the action's own parameters.
//! Inbound records are either a response addressed by `correlationId` or the
//! unaddressed startup signal.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ipc::error::IpcError;

/// Envelope field carrying the correlation id.
pub const CORRELATION_ID: &str = "correlationId";

/// Legacy spelling of the correlation id still emitted by older workers.
pub const LEGACY_REQUEST_ID: &str = "requestId";

/// Envelope field carrying the action name.
pub const ACTION: &str = "action";

/// Readiness handshake emitted once by the worker after initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupSignal {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
}

impl StartupSignal {
    pub fn ready() -> Self {
        Self {
            kind: "startup".to_string(),
            status: "ready".to_string(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.kind == "startup" && self.status == "ready"
    }
}

/// A classified inbound record.
#[derive(Debug)]
pub enum Inbound {
    /// `{"type":"startup","status":"ready"}`
    Startup,
    /// A response addressed to a pending request.
    Response {
        correlation_id: String,
        outcome: Result<Value, IpcError>,
    },
    /// Well-formed JSON that is neither a response nor the startup signal.
    Unaddressed(Value),
}

impl Inbound {
    /// Classify a parsed record.
    pub fn classify(value: Value) -> Self {
        let Value::Object(mut map) = value else {
            return Inbound::Unaddressed(value);
        };

        if map.get("type").and_then(Value::as_str) == Some("startup") {
            if map.get("status").and_then(Value::as_str) == Some("ready") {
                return Inbound::Startup;
            }
            return Inbound::Unaddressed(Value::Object(map));
        }

        let correlation_id = [CORRELATION_ID, LEGACY_REQUEST_ID]
            .iter()
            .find_map(|key| match map.get(*key) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            });

        let Some(correlation_id) = correlation_id else {
            return Inbound::Unaddressed(Value::Object(map));
        };

        let outcome = response_outcome(&mut map);
        Inbound::Response {
            correlation_id,
            outcome,
        }
    }
}

/// Extract result or error from a response record.
///
/// An `error` field wins over `result`. `success: false` without an error
/// message still counts as a worker failure.
fn response_outcome(map: &mut Map<String, Value>) -> Result<Value, IpcError> {
    match map.remove("error") {
        Some(Value::Null) | None => {}
        Some(Value::String(message)) => return Err(IpcError::Worker(message)),
        Some(Value::Object(err)) => {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(err.clone()).to_string());
            return Err(IpcError::Worker(message));
        }
        Some(other) => return Err(IpcError::Worker(other.to_string())),
    }

    if map.get("success").and_then(Value::as_bool) == Some(false) {
        return Err(IpcError::Worker("Worker reported failure".to_string()));
    }

    map.remove("result")
        .ok_or_else(|| IpcError::Protocol("Response missing both result and error".to_string()))
}

/// Serialize a request as a single newline-terminated record.
///
/// `params` must be a JSON object (or null for no parameters). Parameters
/// named like the envelope fields are overwritten by them.
pub fn encode_request(correlation_id: &str, action: &str, params: Value) -> Result<String, IpcError> {
    let mut record = match params {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(IpcError::InvalidParams(format!(
                "expected a JSON object, got {}",
                json_type_name(&other)
            )))
        }
    };

    record.insert(
        CORRELATION_ID.to_string(),
        Value::String(correlation_id.to_string()),
    );
    record.insert(ACTION.to_string(), Value::String(action.to_string()));

    let mut line = serde_json::to_string(&Value::Object(record))
        .map_err(|e| IpcError::Protocol(format!("Failed to serialize request: {}", e)))?;
    line.push('\n');
    Ok(line)
}

/// Serialize a worker-side response as a single newline-terminated record.
pub fn encode_response(correlation_id: &str, outcome: Result<Value, String>) -> String {
    let record = match outcome {
        Ok(result) => serde_json::json!({ CORRELATION_ID: correlation_id, "result": result }),
        Err(message) => serde_json::json!({ CORRELATION_ID: correlation_id, "error": message }),
    };
    format!("{}\n", record)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_encode_request_flattens_params() {
        let line = encode_request("abc", "echo", json!({"x": 1})).expect("encode");
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: Value = serde_json::from_str(line.trim_end()).expect("valid JSON");
        assert_eq!(value, json!({"correlationId": "abc", "action": "echo", "x": 1}));
    }

    #[test]
    fn test_encode_request_envelope_fields_win() {
        let line = encode_request("abc", "echo", json!({"action": "spoof", "correlationId": "x"}))
            .expect("encode");
        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["action"], "echo");
        assert_eq!(value["correlationId"], "abc");
    }

    #[test]
    fn test_encode_request_null_params() {
        let line = encode_request("abc", "get_system_status", Value::Null).expect("encode");
        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value, json!({"correlationId": "abc", "action": "get_system_status"}));
    }

    #[test]
    fn test_encode_request_rejects_non_object() {
        let err = encode_request("abc", "echo", json!([1, 2])).unwrap_err();
        assert!(matches!(err, IpcError::InvalidParams(_)));
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn test_classify_startup() {
        let inbound = Inbound::classify(json!({"type": "startup", "status": "ready"}));
        assert!(matches!(inbound, Inbound::Startup));

        let not_ready = Inbound::classify(json!({"type": "startup", "status": "loading"}));
        assert!(matches!(not_ready, Inbound::Unaddressed(_)));
    }

    #[test]
    fn test_classify_success_response() {
        match Inbound::classify(json!({"correlationId": "id-1", "result": {"x": 1}})) {
            Inbound::Response {
                correlation_id,
                outcome,
            } => {
                assert_eq!(correlation_id, "id-1");
                assert_eq!(outcome.expect("success"), json!({"x": 1}));
            }
            other => panic!("Expected Response, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_error_response() {
        match Inbound::classify(json!({"correlationId": "id-2", "error": "Unknown action: x"})) {
            Inbound::Response { outcome, .. } => {
                let err = outcome.unwrap_err();
                assert!(err.is_worker_error());
                assert_eq!(err.to_string(), "Worker error: Unknown action: x");
            }
            other => panic!("Expected Response, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_error_object_and_success_flag() {
        match Inbound::classify(json!({"correlationId": "a", "error": {"message": "bad"}})) {
            Inbound::Response { outcome, .. } => {
                assert_eq!(outcome.unwrap_err().to_string(), "Worker error: bad")
            }
            other => panic!("Expected Response, got {:?}", other),
        }

        match Inbound::classify(json!({"correlationId": "b", "success": false})) {
            Inbound::Response { outcome, .. } => assert!(outcome.unwrap_err().is_worker_error()),
            other => panic!("Expected Response, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_legacy_request_id() {
        match Inbound::classify(json!({"requestId": "legacy", "success": true, "result": 5})) {
            Inbound::Response {
                correlation_id,
                outcome,
            } => {
                assert_eq!(correlation_id, "legacy");
                assert_eq!(outcome.unwrap(), json!(5));
            }
            other => panic!("Expected Response, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_missing_result_is_protocol_error() {
        match Inbound::classify(json!({"correlationId": "c"})) {
            Inbound::Response { outcome, .. } => {
                assert!(matches!(outcome, Err(IpcError::Protocol(_))))
            }
            other => panic!("Expected Response, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_unaddressed() {
        assert!(matches!(
            Inbound::classify(json!({"log": "warming up"})),
            Inbound::Unaddressed(_)
        ));
        assert!(matches!(Inbound::classify(json!(42)), Inbound::Unaddressed(_)));
    }

    #[test]
    fn test_encode_response_shapes() {
        let ok = encode_response("r1", Ok(json!({"x": 1})));
        let value: Value = serde_json::from_str(ok.trim_end()).unwrap();
        assert_eq!(value, json!({"correlationId": "r1", "result": {"x": 1}}));

        let err = encode_response("r2", Err("nope".to_string()));
        let value: Value = serde_json::from_str(err.trim_end()).unwrap();
        assert_eq!(value, json!({"correlationId": "r2", "error": "nope"}));
    }

    #[test]
    fn test_startup_signal_serialization() {
        let text = serde_json::to_string(&StartupSignal::ready()).unwrap();
        assert_eq!(text, r#"{"type":"startup","status":"ready"}"#);
        let parsed: StartupSignal = serde_json::from_str(&text).unwrap();
        assert!(parsed.is_ready());
    }
}
