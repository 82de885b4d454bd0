//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

/// Lifecycle state of the supervised backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the supervisor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorSnapshot {
    pub state: SupervisorState,
    /// OS process id of the live backend, if any
    pub pid: Option<u32>,
    /// Identifier of the current (or most recent) backend run
    pub run_id: Option<String>,
    /// A restart is waiting for the current run to exit
    pub restart_pending: bool,
    pub last_exit_code: Option<i32>,
}

/// Who authored a chat line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Speaker {
    Ultra,
    User,
}

impl Speaker {
    /// The prefix the backend prints in front of a line from this speaker.
    pub fn prefix(&self) -> &'static str {
        match self {
            Speaker::Ultra => "Ultra:",
            Speaker::User => "User:",
        }
    }
}

/// Icon category shown next to a status line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IconKind {
    // Named statuses
    Microphone,
    Prompt,
    Loading,
    Processing,

    // Actions
    Calculator,
    Weather,
    Clock,
    Memory,
    Search,
    Playback,
    Volume,
    SpeechGeneration,
    SpeechPlayback,
    TimeoutWarning,
    Generic,
}

impl IconKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IconKind::Microphone => "microphone",
            IconKind::Prompt => "prompt",
            IconKind::Loading => "loading",
            IconKind::Processing => "processing",
            IconKind::Calculator => "calculator",
            IconKind::Weather => "weather",
            IconKind::Clock => "clock",
            IconKind::Memory => "memory",
            IconKind::Search => "search",
            IconKind::Playback => "playback",
            IconKind::Volume => "volume",
            IconKind::SpeechGeneration => "speech_generation",
            IconKind::SpeechPlayback => "speech_playback",
            IconKind::TimeoutWarning => "timeout_warning",
            IconKind::Generic => "generic",
        }
    }
}

/// A typed UI event derived from backend text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClassifiedEvent {
    StatusUpdate { label: String, icon: IconKind },
    ChatLine { speaker: Speaker, text: String },
    ErrorEvent { message: String },
}

impl ClassifiedEvent {
    pub fn status(label: impl Into<String>, icon: IconKind) -> Self {
        ClassifiedEvent::StatusUpdate {
            label: label.into(),
            icon,
        }
    }

    pub fn chat(speaker: Speaker, text: impl Into<String>) -> Self {
        ClassifiedEvent::ChatLine {
            speaker,
            text: text.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ClassifiedEvent::ErrorEvent {
            message: message.into(),
        }
    }
}
