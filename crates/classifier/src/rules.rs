//! Ordered first-match rules for a single backend message.
//!
//! No IO, no state: `classify(message)` is a pure function.

use ultra_protocol::{ClassifiedEvent, IconKind, Speaker};

/// Marker the backend's stderr contains when the upstream API is out of credits.
pub const RATE_LIMIT_MARKER: &str = "openai.RateLimitError";
pub const RATE_LIMIT_MESSAGE: &str = "Error Detected: No more OpenAI Credits";
pub const GENERIC_ERROR_MESSAGE: &str = "Error Detected: Please Restart Ultra";

/// A fixed phrase the backend prints when it changes what it is doing.
pub(crate) struct NamedStatus {
    pub phrase: &'static str,
    pub label: &'static str,
    pub icon: IconKind,
}

/// Checked before anything else, in this order.
pub(crate) const NAMED_STATUSES: &[NamedStatus] = &[
    NamedStatus {
        phrase: "Listening for 'Alt+I'",
        label: "Listening for 'Alt+I'",
        icon: IconKind::Microphone,
    },
    NamedStatus {
        phrase: "Listening for prompt...",
        label: "Listening for Prompt",
        icon: IconKind::Prompt,
    },
    NamedStatus {
        phrase: "Loading...",
        label: "Loading",
        icon: IconKind::Loading,
    },
    NamedStatus {
        phrase: "Getting mic ready...",
        label: "Preparing Microphone",
        icon: IconKind::Loading,
    },
    NamedStatus {
        phrase: "[Processing request...]",
        label: "Processing Request",
        icon: IconKind::Processing,
    },
];

const ACTION_PREFIX: &str = "[Ultra is ";

/// Leading words of an action description → icon. First match wins.
pub(crate) const ACTION_ICONS: &[(&str, IconKind)] = &[
    ("calculating", IconKind::Calculator),
    ("finding the current weather", IconKind::Weather),
    ("finding the current time", IconKind::Clock),
    ("retrieving his memory", IconKind::Memory),
    ("searching for", IconKind::Search),
    ("updating Spotify playback", IconKind::Playback),
    ("changing Spotify volume", IconKind::Playback),
    ("setting system volume", IconKind::Volume),
    ("generating speech", IconKind::SpeechGeneration),
    ("speaking a response", IconKind::SpeechPlayback),
    ("taking longer than expected", IconKind::TimeoutWarning),
];

/// Classify one trimmed message. Unstructured text yields `None`.
pub fn classify(message: &str) -> Option<ClassifiedEvent> {
    if let Some(status) = NAMED_STATUSES
        .iter()
        .find(|status| message.contains(status.phrase))
    {
        return Some(ClassifiedEvent::status(status.label, status.icon));
    }

    for speaker in [Speaker::Ultra, Speaker::User] {
        if let Some(rest) = message.strip_prefix(speaker.prefix()) {
            return Some(ClassifiedEvent::chat(speaker, rest.trim()));
        }
    }

    action_event(message)
}

/// `[Ultra is <verb phrase>]` → status with a capitalised label.
fn action_event(message: &str) -> Option<ClassifiedEvent> {
    let rest = message.strip_prefix(ACTION_PREFIX)?;
    // The tag must close on the line it opened on; the phrase runs to the last `]` there.
    let line = rest.split(&['\n', '\r'][..]).next().unwrap_or(rest);
    let action = &line[..line.rfind(']')?];
    if action.is_empty() {
        return None;
    }
    Some(ClassifiedEvent::status(
        capitalize(action),
        icon_for_action(action),
    ))
}

/// Map an action description to its icon category.
pub fn icon_for_action(action: &str) -> IconKind {
    ACTION_ICONS
        .iter()
        .find(|(prefix, _)| action.starts_with(prefix))
        .map(|(_, icon)| *icon)
        .unwrap_or(IconKind::Generic)
}

/// User-facing text for a chunk of backend stderr.
pub fn error_message_for(stderr: &str) -> &'static str {
    if stderr.contains(RATE_LIMIT_MARKER) {
        RATE_LIMIT_MESSAGE
    } else {
        GENERIC_ERROR_MESSAGE
    }
}

/// Stderr never goes through the message rules; every chunk is an error.
pub fn classify_stderr(stderr: &str) -> ClassifiedEvent {
    ClassifiedEvent::error(error_message_for(stderr))
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
