//! Server push command vocabulary.
//!
//! A long-poll response body is a JSON object. `sequence` and `heartbeat` are
//! envelope fields; every other recognised top-level key is one command and
//! is dispatched exactly once. Unknown keys are ignored.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{RelayError, RelayResult};

/// Dispatch order for commands found in one response. Configuration lands
/// before notifications so delivery sees the new settings.
const COMMAND_ORDER: [&str; 5] = ["configuration", "browser", "back-off", "notifications", "noop"];
const ENVELOPE_FIELDS: [&str; 2] = ["sequence", "heartbeat"];

#[derive(Debug, Clone, PartialEq)]
pub struct PushResponse {
    pub sequence: Option<u64>,
    pub heartbeat: Option<Heartbeat>,
    pub commands: Vec<PushCommand>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub timestamp: u64,
    pub interval: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushCommand {
    Noop,
    Notifications(Vec<NotificationEnvelope>),
    Configuration(ServerConfiguration),
    Browser { id: String },
    BackOff { delay: Duration },
}

impl PushCommand {
    pub fn name(&self) -> &'static str {
        match self {
            PushCommand::Noop => "noop",
            PushCommand::Notifications(_) => "notifications",
            PushCommand::Configuration(_) => "configuration",
            PushCommand::Browser { .. } => "browser",
            PushCommand::BackOff { .. } => "back-off",
        }
    }
}

/// Target ids plus an opaque payload, as pushed by the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NotificationEnvelope {
    #[serde(rename = "push-ids")]
    pub target_ids: BTreeSet<String>,
    #[serde(default, deserialize_with = "payload_text")]
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfiguration {
    pub heartbeat_interval_ms: Option<u64>,
    pub network_retry_factors: Option<Vec<f64>>,
    pub network_delay_ms: Option<u64>,
    pub server_retry_delays_ms: Option<Vec<u64>>,
    pub response_timeout_handler: Option<ResponseTimeoutHandler>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResponseTimeoutHandler {
    pub retries: u32,
}

#[derive(Debug, Deserialize)]
struct RawHeartbeat {
    timestamp: u64,
    #[serde(default)]
    interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawBrowser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RawBackOff {
    #[serde(rename = "delayMs")]
    delay_ms: u64,
}

/// Non-string payloads are kept as their JSON text.
fn payload_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}

pub fn parse_response(body: &str) -> RelayResult<PushResponse> {
    let value: Value = serde_json::from_str(body)
        .map_err(|err| RelayError::Protocol(format!("body is not json: {err}")))?;
    let Value::Object(map) = value else {
        return Err(RelayError::Protocol("body must be a json object".into()));
    };

    let sequence = match map.get("sequence") {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            value
                .as_u64()
                .ok_or_else(|| RelayError::Protocol("sequence must be an integer".into()))?,
        ),
    };
    let heartbeat = match map.get("heartbeat") {
        None | Some(Value::Null) => None,
        Some(value) => {
            let raw: RawHeartbeat = serde_json::from_value(value.clone())
                .map_err(|err| RelayError::Protocol(format!("invalid heartbeat: {err}")))?;
            Some(Heartbeat {
                timestamp: raw.timestamp,
                interval: raw.interval.map(Duration::from_millis),
            })
        }
    };

    let commands = COMMAND_ORDER
        .iter()
        .filter_map(|name| map.get(*name).map(|value| (*name, value)))
        .filter_map(|(name, value)| match parse_command(name, value) {
            Ok(command) => Some(command),
            Err(err) => {
                warn!(target: "push.connection", command = name, error = %err, "skipping malformed command");
                None
            }
        })
        .collect();

    log_ignored_keys(&map);

    Ok(PushResponse {
        sequence,
        heartbeat,
        commands,
    })
}

fn parse_command(name: &str, value: &Value) -> Result<PushCommand, serde_json::Error> {
    Ok(match name {
        "configuration" => PushCommand::Configuration(serde_json::from_value(value.clone())?),
        "browser" => {
            let raw: RawBrowser = serde_json::from_value(value.clone())?;
            PushCommand::Browser { id: raw.id }
        }
        "back-off" => {
            let raw: RawBackOff = serde_json::from_value(value.clone())?;
            PushCommand::BackOff {
                delay: Duration::from_millis(raw.delay_ms),
            }
        }
        "notifications" => PushCommand::Notifications(serde_json::from_value(value.clone())?),
        _ => PushCommand::Noop,
    })
}

fn log_ignored_keys(map: &Map<String, Value>) {
    for key in map.keys() {
        let known = COMMAND_ORDER.contains(&key.as_str()) || ENVELOPE_FIELDS.contains(&key.as_str());
        if !known {
            debug!(target: "push.connection", key = %key, "ignoring unrecognised response key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_envelope_and_commands_in_dispatch_order() {
        let body = r#"{
            "sequence": 42,
            "heartbeat": {"timestamp": 1700000000000, "interval": 20000},
            "notifications": [
                {"push-ids": ["a", "b"], "payload": "hello"},
                {"push-ids": ["c"], "payload": {"kind": "json"}},
                {"push-ids": ["d"]}
            ],
            "configuration": {"response_timeout_handler": {"retries": 5}},
            "browser": {"id": "browser-1"},
            "mystery": true
        }"#;
        let parsed = parse_response(body).expect("valid response");
        assert_eq!(parsed.sequence, Some(42));
        assert_eq!(
            parsed.heartbeat,
            Some(Heartbeat {
                timestamp: 1_700_000_000_000,
                interval: Some(Duration::from_millis(20_000)),
            })
        );
        let names: Vec<_> = parsed.commands.iter().map(PushCommand::name).collect();
        assert_eq!(names, ["configuration", "browser", "notifications"]);

        let PushCommand::Notifications(envelopes) = &parsed.commands[2] else {
            panic!("expected notifications");
        };
        assert_eq!(envelopes[0].payload.as_deref(), Some("hello"));
        assert_eq!(envelopes[1].payload.as_deref(), Some(r#"{"kind":"json"}"#));
        assert_eq!(envelopes[2].payload, None);
        assert!(envelopes[0].target_ids.contains("b"));
    }

    #[test]
    fn back_off_and_noop() {
        let parsed = parse_response(r#"{"back-off": {"delayMs": 1500}, "noop": {}}"#).unwrap();
        assert_eq!(
            parsed.commands,
            vec![
                PushCommand::BackOff {
                    delay: Duration::from_millis(1_500)
                },
                PushCommand::Noop,
            ]
        );
    }

    #[test]
    fn malformed_command_is_skipped() {
        let parsed = parse_response(r#"{"browser": {"nope": 1}, "noop": null}"#).unwrap();
        assert_eq!(parsed.commands, vec![PushCommand::Noop]);
    }

    #[test]
    fn rejects_non_object_bodies() {
        assert!(matches!(
            parse_response("[1,2]"),
            Err(RelayError::Protocol(_))
        ));
        assert!(matches!(
            parse_response("not json"),
            Err(RelayError::Protocol(_))
        ));
    }
}
