//! Line-delimited JSON codec.
//!
//! One record per line:
//! `{"type": "<VariantName>", "payload": {...fields, "sender", "timestamp", "chain"}}`.

use serde_json::{Map, Value};

use crate::chain::Chain;
use crate::error::{ProtocolError, Result};
use crate::event::{Event, EventBody, EventKind};

/// Encode an event as a single newline-terminated record.
pub fn encode(event: &Event) -> Result<String> {
    let mut line = encode_line(event)?;
    line.push('\n');
    Ok(line)
}

/// Encode an event without the trailing newline, for framed writers that add it.
pub fn encode_line(event: &Event) -> Result<String> {
    let kind = event.kind();
    if kind.is_local_only() {
        return Err(ProtocolError::LocalOnly(kind.as_str().to_string()));
    }

    let mut record = serde_json::to_value(&event.body)?;
    let payload = record
        .get_mut("payload")
        .and_then(Value::as_object_mut)
        .ok_or(ProtocolError::MissingField("payload"))?;
    payload.insert("sender".to_string(), Value::String(event.sender.clone()));
    payload.insert(
        "timestamp".to_string(),
        Value::String(event.timestamp.clone()),
    );
    payload.insert("chain".to_string(), serde_json::to_value(event.chain)?);

    Ok(serde_json::to_string(&record)?)
}

/// Decode one record (with or without its trailing newline).
pub fn decode(line: &str) -> Result<Event> {
    let mut record: Value = serde_json::from_str(line.trim_end())?;

    let name = record
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField("type"))?
        .to_string();
    let kind = EventKind::from_wire(&name).ok_or_else(|| ProtocolError::UnknownType(name.clone()))?;
    if kind.is_local_only() {
        return Err(ProtocolError::LocalOnly(name));
    }

    let payload = record
        .get_mut("payload")
        .and_then(Value::as_object_mut)
        .ok_or(ProtocolError::MissingField("payload"))?;
    let chain: Chain = serde_json::from_value(take(payload, "chain")?)?;
    let sender = take_string(payload, "sender")?;
    let timestamp = take_string(payload, "timestamp")?;

    let body: EventBody = serde_json::from_value(record)?;
    Ok(Event {
        sender,
        timestamp,
        chain,
        body,
    })
}

fn take(payload: &mut Map<String, Value>, field: &'static str) -> Result<Value> {
    payload
        .remove(field)
        .ok_or(ProtocolError::MissingField(field))
}

fn take_string(payload: &mut Map<String, Value>, field: &'static str) -> Result<String> {
    match take(payload, field)? {
        Value::String(s) => Ok(s),
        _ => Err(ProtocolError::MissingField(field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Invocation, LogLevel};
    use crate::ops::TaskFn;

    fn event(body: EventBody) -> Event {
        Event::new("tester", Chain::new(4, 2), body)
    }

    fn wire_bodies() -> Vec<EventBody> {
        vec![
            EventBody::log(LogLevel::Warning, "disk almost full"),
            EventBody::Shutdown {
                emergency: true,
                reason: "critical".to_string(),
            },
            EventBody::Restart {
                reason: "User request.".to_string(),
            },
            EventBody::command("fs", "list", vec!["/tmp".to_string()]),
            EventBody::CommandExecuted {
                invocation: Invocation {
                    module: "core".to_string(),
                    command: "get".to_string(),
                    args: vec!["user".to_string()],
                },
                success: true,
                output: "Unknown".to_string(),
            },
            EventBody::task("fs", "read_file", vec!["a.txt".to_string(), "3".to_string()]),
            EventBody::TaskRegistered {
                namespace: "fs".to_string(),
                task: "read_file".to_string(),
                arg_spec: vec!["path".to_string(), "lines".to_string()],
                info: "Read the first lines of a file".to_string(),
            },
            EventBody::TaskCompletion {
                namespace: "fs".to_string(),
                task: "read_file".to_string(),
                args: vec!["a.txt".to_string()],
                success: false,
                output: "Error: missing".to_string(),
            },
            EventBody::ClientActivation {
                message: "welcome".to_string(),
            },
            EventBody::error("nope"),
            EventBody::UserInput {
                message: "hello".to_string(),
            },
            EventBody::Response {
                message: "hi there".to_string(),
            },
        ]
    }

    #[test]
    fn test_round_trip_every_wire_variant() {
        for body in wire_bodies() {
            let original = event(body);
            let line = encode(&original).unwrap();
            assert!(line.ends_with('\n'));
            assert_eq!(line.matches('\n').count(), 1);
            assert_eq!(decode(&line).unwrap(), original);
        }
    }

    #[test]
    fn test_record_shape() {
        let line = encode(&event(EventBody::error("nope"))).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "ErrorEvent");
        assert_eq!(value["payload"]["message"], "nope");
        assert_eq!(value["payload"]["sender"], "tester");
        assert_eq!(value["payload"]["chain"]["context"], 4);
        assert_eq!(value["payload"]["chain"]["flow"], 2);
    }

    #[test]
    fn test_encode_rejects_register_events() {
        let register = event(EventBody::TaskRegister {
            namespace: "fs".to_string(),
            task: "read_file".to_string(),
            arg_spec: vec![],
            info: String::new(),
            handler: TaskFn::new(|_, _| Ok(String::new())),
        });
        assert!(matches!(encode(&register), Err(ProtocolError::LocalOnly(_))));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode("not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(
            decode(r#"{"type":"MysteryEvent","payload":{}}"#),
            Err(ProtocolError::UnknownType(name)) if name == "MysteryEvent"
        ));
        assert!(matches!(
            decode(r#"{"type":"CommandRegisterEvent","payload":{}}"#),
            Err(ProtocolError::LocalOnly(_))
        ));
        assert!(matches!(
            decode(r#"{"type":"ErrorEvent","payload":{"message":"x","sender":"a","timestamp":"t"}}"#),
            Err(ProtocolError::MissingField("chain"))
        ));
        assert!(matches!(
            decode(r#"{"payload":{}}"#),
            Err(ProtocolError::MissingField("type"))
        ));
    }

    #[test]
    fn test_decode_missing_body_field() {
        let line = r#"{"type":"ErrorEvent","payload":{"sender":"a","timestamp":"t","chain":{"context":1,"flow":0}}}"#;
        assert!(matches!(decode(line), Err(ProtocolError::Json(_))));
    }
}
