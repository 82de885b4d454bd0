//! Ultra Shell
//!
//! Runs the Ultra assistant backend as a supervised child process and relays
//! its output to UI clients over WebSocket.

mod config;
mod logging;
mod paths;
mod readiness;
mod relay;
mod routes;
mod state;
mod supervisor;
#[cfg(test)]
mod test_support;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use crate::config::{ShellArgs, ShellConfig};
use crate::paths::DataPaths;
use crate::relay::RelayChannel;
use crate::state::AppState;
use crate::supervisor::SupervisorHandle;

/// Extra time on top of the grace period before shutdown gives up waiting.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ShellArgs::parse();
    let paths = DataPaths::resolve(args.data_dir.as_deref());
    paths.ensure_dirs()?;
    let logging = logging::init_logging(&paths.log_dir())?;
    let config = ShellConfig::from_args(&args)?;

    info!(
        component = "shell",
        event = "shell.starting",
        shell_run_id = %logging.run_id,
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %paths.root().display(),
        backend = %config.supervisor.launch.display_command(),
        "Starting Ultra shell"
    );

    let relay = Arc::new(RelayChannel::new());
    let supervisor = SupervisorHandle::spawn(config.supervisor.clone(), relay.clone());
    let setup_pending = readiness::setup_pending(&config.credentials_path);
    let state = Arc::new(AppState::new(
        relay.clone(),
        supervisor.clone(),
        setup_pending,
    ));

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    info!(
        component = "shell",
        event = "shell.listening",
        addr = %config.addr,
        "Listening"
    );
    relay.mark_ready();

    if setup_pending {
        info!(
            component = "shell",
            event = "shell.autostart.deferred",
            credentials = %config.credentials_path.display(),
            "Setup required, backend will start after setup completes"
        );
    } else if !config.autostart {
        info!(
            component = "shell",
            event = "shell.autostart.disabled",
            "Autostart disabled"
        );
    } else if let Err(e) = supervisor.start().await {
        warn!(
            component = "shell",
            event = "shell.autostart.failed",
            error = %e,
            "Backend did not start"
        );
    }

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(
        component = "shell",
        event = "shell.stopping",
        "Shutting down, stopping backend"
    );
    if !supervisor
        .shutdown(config.supervisor.grace_period + SHUTDOWN_SLACK)
        .await
    {
        warn!(
            component = "shell",
            event = "shell.stop.timeout",
            "Backend still running at shutdown"
        );
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(
                component = "shell",
                event = "shell.signal.failed",
                error = %e,
                "Could not listen for ctrl-c"
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
