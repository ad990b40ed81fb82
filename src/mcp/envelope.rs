//! JSON-RPC 2.0 envelope helpers.

use rmcp::model::ErrorData;
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";

pub fn success(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

pub fn failure(id: Value, error: ErrorData) -> Value {
    let mut body = json!({
        "code": error.code.0,
        "message": error.message,
    });
    if let Some(data) = error.data {
        body["data"] = data;
    }

    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::ErrorCode;

    #[test]
    fn failure_omits_missing_data() {
        let value = failure(json!(3), ErrorData::new(ErrorCode::METHOD_NOT_FOUND, "nope", None));
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 3);
        assert_eq!(value["error"]["code"], -32601);
        assert!(value["error"].get("data").is_none());
    }

    #[test]
    fn failure_keeps_structured_data() {
        let value = failure(
            Value::Null,
            ErrorData::new(ErrorCode::INVALID_PARAMS, "bad", Some(json!({"field": "query"}))),
        );
        assert!(value["id"].is_null());
        assert_eq!(value["error"]["data"]["field"], "query");
    }
}
