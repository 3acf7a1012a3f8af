use anyhow::{Context, Result};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequestFrame {
    pub id: String,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Req,
    Resp,
    Event,
    Unknown,
}

pub fn parse_frame_text(text: &str) -> Result<Value> {
    let frame: Value = serde_json::from_str(text).context("frame is not valid JSON")?;
    if !frame.is_object() {
        anyhow::bail!("frame must be a JSON object");
    }
    Ok(frame)
}

pub fn frame_kind(frame: &Value) -> FrameKind {
    match frame.get("type").and_then(Value::as_str) {
        Some("req") => FrameKind::Req,
        Some("res") => FrameKind::Resp,
        Some("event") => FrameKind::Event,
        _ => FrameKind::Unknown,
    }
}

/// Extracts a request frame. `id` may be a string or a number; `params`
/// defaults to an empty object.
pub fn parse_rpc_request(frame: &Value) -> Option<RpcRequestFrame> {
    if frame_kind(frame) != FrameKind::Req {
        return None;
    }
    let id = match frame.get("id")? {
        Value::String(id) => id.trim().to_owned(),
        Value::Number(id) => id.to_string(),
        _ => return None,
    };
    if id.is_empty() {
        return None;
    }
    let method = frame
        .get("method")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|method| !method.is_empty())?
        .to_owned();
    let params = frame.get("params").cloned().unwrap_or_else(|| json!({}));
    Some(RpcRequestFrame { id, method, params })
}

pub fn rpc_success_response_frame(id: &str, payload: Value) -> Value {
    json!({
        "type": "res",
        "id": id,
        "ok": true,
        "payload": payload
    })
}

pub fn rpc_error_response_frame(
    id: &str,
    code: &str,
    message: &str,
    details: Option<Value>,
) -> Value {
    let mut error = json!({
        "code": code,
        "message": message
    });
    if let Some(details) = details {
        error["details"] = details;
    }
    json!({
        "type": "res",
        "id": id,
        "ok": false,
        "error": error
    })
}

pub fn event_frame(event: &str, payload: Value) -> Value {
    json!({
        "type": "event",
        "event": event,
        "payload": payload
    })
}
