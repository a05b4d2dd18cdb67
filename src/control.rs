//! Control messages from the hosting page.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};

use crate::worker::WorkerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate the waiting worker now
  SkipWaiting,
  /// Ask for the active cache version
  GetVersion,
}

impl ControlMessage {
  /// Parse a message of the form `{"type": "SKIP_WAITING"}`.
  pub fn parse(raw: &str) -> Result<Self> {
    serde_json::from_str(raw).map_err(|e| eyre!("Invalid control message {}: {}", raw, e))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
  /// Worker is active; lists namespaces deleted by the activation
  Activated { removed: Vec<String> },
  Version { version: String },
  /// Skip-waiting noted; activation follows once install completes
  Deferred { state: WorkerState },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_opcodes() {
    assert_eq!(
      ControlMessage::parse(r#"{"type":"SKIP_WAITING"}"#).unwrap(),
      ControlMessage::SkipWaiting
    );
    assert_eq!(
      ControlMessage::parse(r#"{"type":"GET_VERSION"}"#).unwrap(),
      ControlMessage::GetVersion
    );
  }

  #[test]
  fn test_unknown_opcode_is_error() {
    assert!(ControlMessage::parse(r#"{"type":"CLEAR_ALL"}"#).is_err());
    assert!(ControlMessage::parse("SKIP_WAITING").is_err());
  }

  #[test]
  fn test_reply_shape() {
    let reply = ControlReply::Version {
      version: "parking-static-v1".to_string(),
    };
    assert_eq!(
      serde_json::to_value(&reply).unwrap(),
      serde_json::json!({"type": "version", "version": "parking-static-v1"})
    );
  }
}
