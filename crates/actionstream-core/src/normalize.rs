//! Decoding of wire frames into canonical [`Event`]s.
//!
//! Frames come from more than one producer and not all of them agree on names:
//! the discriminator may be `type` or `observation_type`, output text may sit in
//! `line` or `data`, and some producers nest their payload under a `data`
//! object. Everything is folded into one shape here, with one decode function
//! per variant and [`EventKind::Unknown`] as the fallback.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::{
    action::ActionId,
    error::ProtocolError,
    event::{Event, EventKind, ResultStatus, StreamKind},
};

type Fields = Map<String, Value>;

/// Canonical variant a wire discriminator maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireType {
    Start,
    Output,
    Result,
    Error,
    State,
    Unknown,
}

impl WireType {
    fn classify(name: &str) -> Self {
        match name {
            "start" | "CmdStartObservation" | "IPythonStartObservation" => Self::Start,
            "output_chunk" | "output" | "stream" | "CmdOutputObservationPart"
            | "IPythonOutputObservationPart" => Self::Output,
            // `end` is accepted as a spelling of `result`.
            "result" | "end" | "CmdEndObservation" | "IPythonResultObservation" => Self::Result,
            "error" | "ErrorObservation" => Self::Error,
            "state" | "AgentStateObservation" => Self::State,
            _ => Self::Unknown,
        }
    }
}

/// Decode one text frame.
///
/// # Errors
/// Returns [`ProtocolError`] if the frame is not a JSON object or a known
/// field carries a value of the wrong type.
pub fn decode_frame(frame: &str) -> Result<Event, ProtocolError> {
    let value: Value = serde_json::from_str(frame)?;
    decode_value(value)
}

/// Decode an already-parsed frame.
///
/// # Errors
/// See [`decode_frame`].
pub fn decode_value(value: Value) -> Result<Event, ProtocolError> {
    let Value::Object(mut fields) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    let raw_type = match optional_string(&fields, "type")? {
        Some(t) => Some(t),
        None => optional_string(&fields, "observation_type")?,
    };
    let action_id = optional_string(&fields, "action_id")?
        .filter(|id| !id.is_empty())
        .map(ActionId::from);
    let timestamp = fields
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);

    let wire_type = raw_type.as_deref().map_or(WireType::Unknown, WireType::classify);
    let kind = match wire_type {
        WireType::Start => {
            lift_nested_data(&mut fields, |_| true);
            decode_start(&fields)?
        }
        WireType::Output => {
            lift_nested_data(&mut fields, |nested| {
                nested.contains_key("line") || nested.contains_key("stream")
            });
            decode_output(&fields)?
        }
        WireType::Result => {
            lift_nested_data(&mut fields, |_| true);
            decode_result(&fields)?
        }
        WireType::Error => {
            lift_nested_data(&mut fields, |_| true);
            decode_error(&fields)?
        }
        WireType::State => decode_state(&fields)?,
        WireType::Unknown => EventKind::Unknown {
            original_type: raw_type.unwrap_or_else(|| "unknown".to_string()),
        },
    };

    Ok(Event {
        action_id,
        timestamp,
        kind,
    })
}

fn decode_start(fields: &Fields) -> Result<EventKind, ProtocolError> {
    let pid = optional_int(fields, "pid")?.and_then(|p| u32::try_from(p).ok());
    Ok(EventKind::Start {
        command: optional_string(fields, "command")?,
        code: optional_string(fields, "code")?,
        pid,
    })
}

fn decode_output(fields: &Fields) -> Result<EventKind, ProtocolError> {
    let stream = optional_string(fields, "stream")?
        .map_or(StreamKind::Stdout, |s| StreamKind::from_wire(&s));
    let data = match fields.get("data") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => optional_string(fields, "line")?.unwrap_or_default(),
        // rich display payloads stay as compact JSON text
        Some(other) => other.to_string(),
    };
    Ok(EventKind::OutputChunk { stream, data })
}

fn decode_result(fields: &Fields) -> Result<EventKind, ProtocolError> {
    let exit_code = optional_int(fields, "exit_code")?;
    let error_name = non_empty(optional_string(fields, "error_name")?)
        .or(non_empty(optional_string(fields, "ename")?));
    let error_value = non_empty(optional_string(fields, "error_value")?)
        .or(non_empty(optional_string(fields, "evalue")?))
        .or(non_empty(optional_string(fields, "error")?));
    let traceback = string_list(fields, "traceback")?;

    let explicit = optional_string(fields, "status")?.and_then(|s| match s.as_str() {
        "ok" | "success" => Some(ResultStatus::Ok),
        "error" | "failed" | "failure" => Some(ResultStatus::Error),
        _ => None,
    });
    let status = explicit.unwrap_or_else(|| match exit_code {
        Some(code) => ResultStatus::from_exit_code(code),
        None if error_name.is_some() || error_value.is_some() => ResultStatus::Error,
        None => ResultStatus::Ok,
    });

    Ok(EventKind::Result {
        status,
        exit_code,
        error_name,
        error_value,
        traceback,
    })
}

fn decode_error(fields: &Fields) -> Result<EventKind, ProtocolError> {
    let message = non_empty(optional_string(fields, "message")?)
        .or(non_empty(optional_string(fields, "error")?))
        .unwrap_or_else(|| "unknown error".to_string());
    Ok(EventKind::Error {
        message,
        details: optional_string(fields, "details")?,
    })
}

fn decode_state(fields: &Fields) -> Result<EventKind, ProtocolError> {
    let details = fields
        .get("state_details")
        .or_else(|| fields.get("details"))
        .filter(|v| !v.is_null())
        .cloned();
    Ok(EventKind::State {
        message: optional_string(fields, "message")?.unwrap_or_default(),
        details,
    })
}

/// Move keys of a nested `data` object to the top level without overwriting.
fn lift_nested_data(fields: &mut Fields, accept: impl Fn(&Fields) -> bool) {
    let Some(Value::Object(nested)) = fields.get("data") else {
        return;
    };
    if !accept(nested) {
        return;
    }
    if let Some(Value::Object(nested)) = fields.remove("data") {
        for (key, value) in nested {
            fields.entry(key).or_insert(value);
        }
    }
}

fn optional_string(fields: &Fields, field: &'static str) -> Result<Option<String>, ProtocolError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(_) => Err(ProtocolError::BadField { field }),
    }
}

fn optional_int(fields: &Fields, field: &'static str) -> Result<Option<i64>, ProtocolError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or(ProtocolError::BadField { field }),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ProtocolError::BadField { field }),
        Some(_) => Err(ProtocolError::BadField { field }),
    }
}

fn string_list(fields: &Fields, field: &'static str) -> Result<Vec<String>, ProtocolError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                _ => Err(ProtocolError::BadField { field }),
            })
            .collect(),
        Some(_) => Err(ProtocolError::BadField { field }),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    // naive ISO-8601, taken as UTC
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
