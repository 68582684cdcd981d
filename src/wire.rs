//! Map raw relay JSON to typed inbound frames.
//!
//! Supports both current payload-wrapped frames (`{"type": ..., "payload":
//! {...}}`) and older flat frames carrying their fields at top level. Frames
//! that cannot be routed yield `None` and are dropped by the connection layer
//! with a debug log, never an error back to the relay.

use serde_json::Value;

use crate::protocol::{Attachment, RelayInbound};

pub fn map_ws_frame(value: &Value) -> Option<RelayInbound> {
    let frame_type = value.get("type")?.as_str()?;
    match frame_type {
        "message" => map_message(value),
        "cancel" => map_cancel(value),
        "rtc_signal_relay" => map_signal(value),
        _ => None,
    }
}

fn map_message(value: &Value) -> Option<RelayInbound> {
    let session_id = field_str(value, "session_id")?;
    let request_id = field_str(value, "request_id")?;
    let content = field_str(value, "content").unwrap_or_default();
    let attachments = field(value, "attachments")
        .and_then(|raw| serde_json::from_value::<Vec<Attachment>>(raw.clone()).ok())
        .unwrap_or_default();
    let client_id = field_str(value, "client_id");
    let with_files = field(value, "with_files")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Some(RelayInbound::Message {
        session_id,
        request_id,
        content,
        attachments,
        client_id,
        with_files,
    })
}

fn map_cancel(value: &Value) -> Option<RelayInbound> {
    Some(RelayInbound::Cancel {
        session_id: field_str(value, "session_id")?,
        request_id: field_str(value, "request_id")?,
    })
}

fn map_signal(value: &Value) -> Option<RelayInbound> {
    // The signal carries its own "payload" field, so resolve the wrapper
    // first instead of falling back key by key.
    let body = match value.get("payload") {
        Some(wrapper) if wrapper.get("transfer_id").is_some() => wrapper,
        _ => value,
    };
    Some(RelayInbound::RtcSignalRelay {
        transfer_id: body.get("transfer_id")?.as_str()?.to_string(),
        from_agent_id: body.get("from_agent_id")?.as_str()?.to_string(),
        signal_type: body.get("signal_type")?.as_str()?.to_string(),
        payload: body.get("payload").cloned().unwrap_or(Value::Null),
    })
}

/// Look a field up at top level first, then inside the "payload" wrapper.
fn field<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    if let Some(found) = value.get(key) {
        return Some(found);
    }
    value.get("payload")?.get(key)
}

fn field_str(value: &Value, key: &str) -> Option<String> {
    field(value, key)?.as_str().map(str::to_string)
}
