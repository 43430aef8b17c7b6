//! Positional JSON-array framing — no tagged objects, every frame is
//! `[command, ...args]`.

use crate::event::{Event, Filter};
use serde_json::Value;

#[derive(Debug, Clone)]
pub enum ClientFrame {
    Event(Event),
    Req { sub_id: String, filters: Vec<Filter> },
    Close { sub_id: String },
    Auth(Event),
}

#[derive(Debug, Clone)]
pub enum ServerFrame {
    Ok { event_id: String, accepted: bool, reason: String },
    Event { sub_id: String, event: Event },
    Eose { sub_id: String },
    Closed { sub_id: String, reason: String },
    Notice { message: String },
    Auth { challenge: String },
}

impl ServerFrame {
    pub fn to_json(&self) -> Value {
        match self {
            ServerFrame::Ok { event_id, accepted, reason } => {
                Value::Array(vec![
                    Value::String("OK".into()),
                    Value::String(event_id.clone()),
                    Value::Bool(*accepted),
                    Value::String(reason.clone()),
                ])
            }
            ServerFrame::Event { sub_id, event } => Value::Array(vec![
                Value::String("EVENT".into()),
                Value::String(sub_id.clone()),
                serde_json::to_value(event).unwrap_or(Value::Null),
            ]),
            ServerFrame::Eose { sub_id } => {
                Value::Array(vec![Value::String("EOSE".into()), Value::String(sub_id.clone())])
            }
            ServerFrame::Closed { sub_id, reason } => Value::Array(vec![
                Value::String("CLOSED".into()),
                Value::String(sub_id.clone()),
                Value::String(reason.clone()),
            ]),
            ServerFrame::Notice { message } => {
                Value::Array(vec![Value::String("NOTICE".into()), Value::String(message.clone())])
            }
            ServerFrame::Auth { challenge } => {
                Value::Array(vec![Value::String("AUTH".into()), Value::String(challenge.clone())])
            }
        }
    }

    pub fn to_text(&self) -> String {
        self.to_json().to_string()
    }

    pub fn notice(message: impl Into<String>) -> Self {
        ServerFrame::Notice { message: message.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameParseError {
    NotAnArray,
    EmptyArray,
    UnknownCommand(String),
    BadArity,
    BadPayload(String),
}

impl FrameParseError {
    pub fn notice_text(&self) -> String {
        match self {
            FrameParseError::NotAnArray => "Malformed frame: expected a JSON array".to_string(),
            FrameParseError::EmptyArray => "Malformed frame: empty array".to_string(),
            FrameParseError::UnknownCommand(tag) => format!("Unknown command: {tag}"),
            FrameParseError::BadArity => "Malformed frame: wrong number of elements".to_string(),
            FrameParseError::BadPayload(detail) => format!("Malformed frame: {detail}"),
        }
    }
}

/// Parses one inbound text frame into a [`ClientFrame`]. Any failure here is
/// reported as a single `NOTICE` by the caller; the connection stays open.
pub fn parse_client_frame(text: &str) -> Result<ClientFrame, FrameParseError> {
    let value: Value = serde_json::from_str(text).map_err(|e| FrameParseError::BadPayload(e.to_string()))?;
    let items = value.as_array().ok_or(FrameParseError::NotAnArray)?;
    let tag = items.first().and_then(Value::as_str).ok_or(FrameParseError::EmptyArray)?;

    match tag {
        "EVENT" => {
            let event_value = items.get(1).ok_or(FrameParseError::BadArity)?;
            let event: Event = serde_json::from_value(event_value.clone())
                .map_err(|e| FrameParseError::BadPayload(e.to_string()))?;
            Ok(ClientFrame::Event(event))
        }
        "REQ" => {
            let sub_id = items
                .get(1)
                .and_then(Value::as_str)
                .ok_or(FrameParseError::BadArity)?
                .to_string();
            if items.len() < 3 {
                return Err(FrameParseError::BadArity);
            }
            let mut filters = Vec::with_capacity(items.len() - 2);
            for raw in &items[2..] {
                let filter: Filter =
                    serde_json::from_value(raw.clone()).map_err(|e| FrameParseError::BadPayload(e.to_string()))?;
                filters.push(filter);
            }
            Ok(ClientFrame::Req { sub_id, filters })
        }
        "CLOSE" => {
            let sub_id = items
                .get(1)
                .and_then(Value::as_str)
                .ok_or(FrameParseError::BadArity)?
                .to_string();
            Ok(ClientFrame::Close { sub_id })
        }
        "AUTH" => {
            let event_value = items.get(1).ok_or(FrameParseError::BadArity)?;
            let event: Event = serde_json::from_value(event_value.clone())
                .map_err(|e| FrameParseError::BadPayload(e.to_string()))?;
            Ok(ClientFrame::Auth(event))
        }
        other => Err(FrameParseError::UnknownCommand(other.to_string())),
    }
}
