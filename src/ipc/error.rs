use serde_json::json;

use crate::access::AccessDenied;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Access denials map to a stable code per axis so the UI can distinguish
/// "wrong class" from "wrong subject" without parsing messages.
pub fn denied(id: &str, denial: AccessDenied) -> serde_json::Value {
    err(id, denial.code(), denial.message(), None)
}
