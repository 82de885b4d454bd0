//! Terminal rendering for `ultra watch` and `ultra status`.

use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use console::style;

use ultra_classifier::{classify_stderr, Classifier};
use ultra_protocol::{ClassifiedEvent, ServerMessage, Speaker, SupervisorSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Status,
    Chat,
    Error,
    Lifecycle,
    Raw,
}

/// One printable line, before styling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub kind: LineKind,
    pub label: String,
    pub text: String,
}

impl Line {
    fn new(kind: LineKind, label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            text: text.into(),
        }
    }

    fn lifecycle(text: impl Into<String>) -> Self {
        Self::new(LineKind::Lifecycle, "shell", text)
    }

    pub fn styled(&self) -> String {
        let label = format!("[{}]", self.label);
        let label = match self.kind {
            LineKind::Status => style(label).cyan(),
            LineKind::Chat => style(label).green().bold(),
            LineKind::Error => style(label).red().bold(),
            LineKind::Lifecycle | LineKind::Raw => style(label).dim(),
        };
        format!("{label} {}", self.text)
    }
}

impl From<ClassifiedEvent> for Line {
    fn from(event: ClassifiedEvent) -> Self {
        match event {
            ClassifiedEvent::StatusUpdate { label, icon } => {
                Line::new(LineKind::Status, icon.as_str(), label)
            }
            ClassifiedEvent::ChatLine { speaker, text } => {
                let who = match speaker {
                    Speaker::Ultra => "ultra",
                    Speaker::User => "user",
                };
                Line::new(LineKind::Chat, who, text)
            }
            ClassifiedEvent::ErrorEvent { message } => Line::new(LineKind::Error, "error", message),
        }
    }
}

/// Turns the shell's event stream into lines the way the desktop UI would show them.
pub struct WatchRenderer {
    classifier: Classifier,
    raw: bool,
}

impl WatchRenderer {
    pub fn new(raw: bool) -> Self {
        Self {
            classifier: Classifier::new(),
            raw,
        }
    }

    pub fn handle(&mut self, msg: ServerMessage) -> Vec<Line> {
        match msg {
            ServerMessage::BackendOutput { text } if self.raw => {
                vec![Line::new(LineKind::Raw, "stdout", text.trim_end())]
            }
            ServerMessage::BackendOutput { text } => {
                self.classifier.feed(&text).map(Line::from).collect()
            }
            ServerMessage::BackendError { text } if self.raw => {
                vec![Line::new(LineKind::Raw, "stderr", text.trim_end())]
            }
            ServerMessage::BackendError { text } => vec![classify_stderr(&text).into()],
            ServerMessage::BackendExited { code, crashed } => {
                let mut lines: Vec<Line> =
                    self.classifier.finish().into_iter().map(Line::from).collect();
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                let what = if crashed { "crashed" } else { "exited" };
                lines.push(Line::lifecycle(format!("backend {what} ({code})")));
                lines
            }
            ServerMessage::BackendStatus { snapshot } => {
                let pid = snapshot
                    .pid
                    .map(|pid| format!(" pid {pid}"))
                    .unwrap_or_default();
                vec![Line::lifecycle(format!("backend {}{pid}", snapshot.state))]
            }
            ServerMessage::ServerReady => vec![Line::lifecycle("connected")],
            ServerMessage::SetupRequired => vec![Line::lifecycle(
                "setup required: add your API keys, then run `ultra setup-complete`",
            )],
            ServerMessage::ConversationCleared => vec![Line::lifecycle("conversation cleared")],
            ServerMessage::Error { code, message } => vec![Line::new(LineKind::Error, code, message)],
        }
    }
}

pub fn snapshot_table(snapshot: &SupervisorSnapshot) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["State", "PID", "Run", "Restart pending", "Last exit"]);
    table.add_row(vec![
        snapshot.state.to_string(),
        snapshot
            .pid
            .map_or_else(|| "-".to_string(), |pid| pid.to_string()),
        snapshot.run_id.clone().unwrap_or_else(|| "-".to_string()),
        if snapshot.restart_pending { "yes" } else { "no" }.to_string(),
        snapshot
            .last_exit_code
            .map_or_else(|| "-".to_string(), |code| code.to_string()),
    ]);
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use ultra_protocol::SupervisorState;

    fn output(text: &str) -> ServerMessage {
        ServerMessage::BackendOutput { text: text.into() }
    }

    #[test]
    fn classified_lines_follow_chunks() {
        let mut renderer = WatchRenderer::new(false);
        assert!(renderer.handle(output("[Ultra is calcul")).is_empty());
        assert_eq!(
            renderer.handle(output("ating 2+2]\nUltra: 4")),
            vec![Line::new(LineKind::Status, "calculator", "Calculating 2+2")]
        );

        let lines = renderer.handle(ServerMessage::BackendExited {
            code: Some(0),
            crashed: false,
        });
        assert_eq!(
            lines,
            vec![
                Line::new(LineKind::Chat, "ultra", "4"),
                Line::lifecycle("backend exited (0)"),
            ]
        );
    }

    #[test]
    fn stderr_becomes_user_facing_error() {
        let mut renderer = WatchRenderer::new(false);
        assert_eq!(
            renderer.handle(ServerMessage::BackendError {
                text: "openai.RateLimitError: quota".into()
            }),
            vec![Line::new(
                LineKind::Error,
                "error",
                "Error Detected: No more OpenAI Credits"
            )]
        );
    }

    #[test]
    fn raw_mode_skips_classification() {
        let mut renderer = WatchRenderer::new(true);
        assert_eq!(
            renderer.handle(output("Messages before API call:\n")),
            vec![Line::new(LineKind::Raw, "stdout", "Messages before API call:")]
        );
    }

    #[test]
    fn crash_and_status_lines() {
        let mut renderer = WatchRenderer::new(false);
        assert_eq!(
            renderer.handle(ServerMessage::BackendExited {
                code: None,
                crashed: true
            }),
            vec![Line::lifecycle("backend crashed (signal)")]
        );
        assert_eq!(
            renderer.handle(ServerMessage::BackendStatus {
                snapshot: SupervisorSnapshot {
                    state: SupervisorState::Running,
                    pid: Some(42),
                    ..Default::default()
                }
            }),
            vec![Line::lifecycle("backend running pid 42")]
        );
    }

    #[test]
    fn snapshot_table_lists_every_field() {
        let rendered = snapshot_table(&SupervisorSnapshot {
            state: SupervisorState::Stopping,
            pid: Some(7),
            run_id: Some("run-1".into()),
            restart_pending: true,
            last_exit_code: None,
        })
        .to_string();
        for needle in ["stopping", "7", "run-1", "yes"] {
            assert!(rendered.contains(needle), "missing {needle} in\n{rendered}");
        }
    }
}
