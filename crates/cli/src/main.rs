//! Ultra CLI
//!
//! Terminal companion for `ultra-shell`: follow the assistant's output as
//! classified events, type to it, and drive the backend's lifecycle.

mod client;
mod render;

use anyhow::bail;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;

use ultra_protocol::{ClientMessage, ServerMessage, SupervisorState};

use crate::client::{send_message, ShellClient, Trigger};
use crate::render::{snapshot_table, WatchRenderer};

#[derive(Debug, Parser)]
#[command(name = "ultra", version, about = "Watch and drive the Ultra assistant shell")]
struct Cli {
    /// Shell address (host:port)
    #[arg(long, global = true, env = "ULTRA_SERVER", default_value = "127.0.0.1:3000")]
    server: String,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Follow backend output as status, chat and error lines
    Watch {
        /// Print backend output unclassified
        #[arg(long)]
        raw: bool,
    },
    /// Type a line to the assistant
    Send {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Clear the conversation in every connected UI
    Clear,
    /// Show the backend's lifecycle state
    Status,
    /// Start the backend
    Start,
    /// Restart the backend
    Restart,
    /// Stop the backend
    Stop,
    /// Mark first-run setup as done and start the backend
    SetupComplete,
    /// Generate shell completions
    Completions { shell: Shell },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = ShellClient::new(&cli.server);

    match cli.command {
        Command::Watch { raw } => watch(&client, raw).await,
        Command::Send { text } => send(&client, text.join(" ")).await,
        Command::Clear => {
            let mut socket = client.connect().await?;
            send_message(&mut socket, &ClientMessage::ClearConversation).await?;
            socket.close(None).await?;
            Ok(())
        }
        Command::Status => {
            let snapshot = client.snapshot().await?;
            print_snapshot(&snapshot, cli.json)
        }
        Command::Start => run_trigger(&client, Trigger::Start, cli.json).await,
        Command::Restart => run_trigger(&client, Trigger::Restart, cli.json).await,
        Command::Stop => run_trigger(&client, Trigger::Stop, cli.json).await,
        Command::SetupComplete => run_trigger(&client, Trigger::SetupComplete, cli.json).await,
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "ultra", &mut std::io::stdout());
            Ok(())
        }
    }
}

async fn watch(client: &ShellClient, raw: bool) -> anyhow::Result<()> {
    let mut socket = client.connect().await?;
    let mut renderer = WatchRenderer::new(raw);

    loop {
        let frame = tokio::select! {
            frame = socket.next() => frame,
            _ = tokio::signal::ctrl_c() => break,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => {
                eprintln!("{}", console::style("connection closed by ultra-shell").dim());
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };

        match serde_json::from_str::<ServerMessage>(&text) {
            Ok(msg) => {
                for line in renderer.handle(msg) {
                    println!("{}", line.styled());
                }
            }
            Err(e) => eprintln!("ignoring unrecognised event: {e}"),
        }
    }

    Ok(())
}

async fn send(client: &ShellClient, text: String) -> anyhow::Result<()> {
    let snapshot = client.snapshot().await?;
    if snapshot.state != SupervisorState::Running {
        bail!("backend is {}, start it with `ultra start`", snapshot.state);
    }

    let mut socket = client.connect().await?;
    send_message(&mut socket, &ClientMessage::TextInput { content: text }).await?;
    socket.close(None).await?;
    Ok(())
}

async fn run_trigger(client: &ShellClient, trigger: Trigger, json: bool) -> anyhow::Result<()> {
    let snapshot = client.trigger(trigger).await?;
    print_snapshot(&snapshot, json)
}

fn print_snapshot(snapshot: &ultra_protocol::SupervisorSnapshot, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
    } else {
        println!("{}", snapshot_table(snapshot));
    }
    Ok(())
}
