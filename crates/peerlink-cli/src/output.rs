//! JSON line output on stdout
//!
//! Logs go to stderr, so stdout carries nothing but one JSON object per line.

use std::io::Write;

use serde_json::{json, Value};

use peerlink_core::{AppEvent, ConnectionState};

use crate::error::Result;

/// Render an event, tagged with the emitting node when there are several
pub fn event_line(node: Option<&str>, event: &AppEvent) -> Result<String> {
    let mut value = serde_json::to_value(event)?;
    if let (Some(node), Value::Object(fields)) = (node, &mut value) {
        fields.insert("node".to_string(), Value::String(node.to_string()));
    }
    Ok(value.to_string())
}

pub fn state_line(state: &ConnectionState) -> Result<String> {
    let mut value = serde_json::to_value(state)?;
    if let Value::Object(fields) = &mut value {
        fields.insert("event".to_string(), Value::String("state".to_string()));
    }
    Ok(value.to_string())
}

/// Reply to a line the session could not act on
pub fn rejected_line(line: &str, reason: &str) -> String {
    json!({ "event": "commandRejected", "line": line, "reason": reason }).to_string()
}

pub fn print_line(line: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::PeerId;

    #[test]
    fn test_event_line_tags_node() {
        let event = AppEvent::PeerLost {
            peer_id: PeerId::new(3),
        };
        let line = event_line(Some("Bob"), &event).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value, json!({ "event": "peerLost", "peerId": 3, "node": "Bob" }));

        let untagged: Value = serde_json::from_str(&event_line(None, &event).unwrap()).unwrap();
        assert!(untagged.get("node").is_none());
    }

    #[test]
    fn test_state_line() {
        let value: Value =
            serde_json::from_str(&state_line(&ConnectionState::Advertising).unwrap()).unwrap();
        assert_eq!(value, json!({ "event": "state", "state": "advertising" }));
    }
}
