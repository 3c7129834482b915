//! JSON-RPC 2.0 envelope for the POST endpoints.
//!
//! Transport faults (bad auth, oversized body) are HTTP-level; everything
//! else — including expected races like cancelling a finished turn — comes
//! back as a JSON-RPC result or error with the caller's request ID echoed.

use serde::Deserialize;
use serde_json::{Value, json};

// Standard JSON-RPC 2.0 error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
/// Server-defined: the turn ended with a cancellation instead of content.
pub const TURN_CANCELLED: i64 = -32000;

/// An incoming JSON-RPC call.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn is_supported_version(&self) -> bool {
        matches!(self.jsonrpc.as_deref(), Some("2.0"))
    }
}

/// Successful response envelope.
pub fn ok(id: Option<Value>, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.unwrap_or(Value::Null),
        "result": result,
    })
}

/// Error response envelope.
pub fn err(id: Option<Value>, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.unwrap_or(Value::Null),
        "error": { "code": code, "message": message.into() },
    })
}

// ── Method params ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SendParams {
    pub content: String,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CancelParams {
    pub request_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmParams {
    pub confirm_id: String,
    pub decision: String,
}

/// `offset`/`limit` arrive as signed values so out-of-range inputs fail
/// validation with a readable message instead of a type error.
#[derive(Debug, Deserialize)]
pub struct GetMessagesParams {
    pub offset: i64,
    pub limit: i64,
}

impl GetMessagesParams {
    pub const MAX_LIMIT: i64 = 2000;

    /// Returns `(offset, limit)` or a human-readable complaint.
    pub fn validate(&self) -> Result<(u64, u64), String> {
        if self.offset < 0 {
            return Err("offset must be >= 0".into());
        }
        if self.limit < 1 || self.limit > Self::MAX_LIMIT {
            return Err(format!("limit must be in 1..={}", Self::MAX_LIMIT));
        }
        Ok((self.offset as u64, self.limit as u64))
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct CreateAgentParams {
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DestroyAgentParams {
    pub agent_id: String,
}

/// Deserialize `params` into a typed struct, mapping failures to a
/// human-readable invalid-params message.
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, String> {
    serde_json::from_value(params).map_err(|e| format!("invalid params: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_with_params() {
        let raw = r#"{"jsonrpc":"2.0","id":7,"method":"send","params":{"content":"hi"}}"#;
        let req: RpcRequest = serde_json::from_str(raw).unwrap();
        assert!(req.is_supported_version());
        assert_eq!(req.method, "send");
        assert_eq!(req.id, Some(json!(7)));

        let params: SendParams = parse_params(req.params).unwrap();
        assert_eq!(params.content, "hi");
        assert!(params.request_id.is_none());
    }

    #[test]
    fn missing_version_is_unsupported() {
        let raw = r#"{"id":1,"method":"send"}"#;
        let req: RpcRequest = serde_json::from_str(raw).unwrap();
        assert!(!req.is_supported_version());
    }

    #[test]
    fn ok_envelope_echoes_id() {
        let resp = ok(Some(json!("abc")), json!({"x": 1}));
        assert_eq!(resp["jsonrpc"], "2.0");
        assert_eq!(resp["id"], "abc");
        assert_eq!(resp["result"]["x"], 1);
    }

    #[test]
    fn err_envelope_carries_code_and_null_id() {
        let resp = err(None, METHOD_NOT_FOUND, "no such method");
        assert_eq!(resp["id"], Value::Null);
        assert_eq!(resp["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(resp["error"]["message"], "no such method");
    }

    #[test]
    fn get_messages_validation_bounds() {
        let ok_params = GetMessagesParams {
            offset: 0,
            limit: 2000,
        };
        assert_eq!(ok_params.validate().unwrap(), (0, 2000));

        assert!(
            GetMessagesParams {
                offset: -1,
                limit: 10
            }
            .validate()
            .is_err()
        );
        assert!(
            GetMessagesParams {
                offset: 0,
                limit: 0
            }
            .validate()
            .is_err()
        );
        assert!(
            GetMessagesParams {
                offset: 0,
                limit: 2001
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn parse_params_reports_missing_fields() {
        let result: Result<CancelParams, String> = parse_params(json!({}));
        let msg = result.unwrap_err();
        assert!(msg.contains("invalid params"));
    }
}
