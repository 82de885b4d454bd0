//! Client → Server messages

use serde::{Deserialize, Serialize};

/// Messages sent from a client to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Text typed by the user, forwarded to the backend's stdin
    TextInput { content: String },
    ClearConversation,

    // Lifecycle triggers
    SetupComplete,
    StartBackend,
    RestartBackend,
    StopBackend,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_input() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"text_input","content":"what time is it"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::TextInput {
                content: "what time is it".into()
            }
        );
    }

    #[test]
    fn parses_clear_conversation_without_payload() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"clear_conversation"}"#).unwrap();
        assert_eq!(msg, ClientMessage::ClearConversation);
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"launch_rockets"}"#).is_err());
    }
}
