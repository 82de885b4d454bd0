//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Messages sent from the relay to every connected client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Backend streams
    BackendOutput {
        text: String,
    },
    BackendError {
        text: String,
    },

    // Lifecycle
    ServerReady,
    BackendStatus {
        snapshot: SupervisorSnapshot,
    },
    BackendExited {
        code: Option<i32>,
        crashed: bool,
    },
    SetupRequired,
    ConversationCleared,

    // Errors
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}
