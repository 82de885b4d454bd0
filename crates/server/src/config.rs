//! Command line and environment configuration for `ultra-shell`.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use ultra_backend::LaunchSpec;

use crate::supervisor::SupervisorConfig;

#[derive(Debug, Parser)]
#[command(
    name = "ultra-shell",
    version,
    about = "Supervises the Ultra backend and relays its output to UI clients"
)]
pub struct ShellArgs {
    /// Address to listen on
    #[arg(long, env = "ULTRA_BIND", default_value = "127.0.0.1")]
    pub bind: IpAddr,

    /// Port for the WebSocket and HTTP endpoints
    #[arg(long, env = "ULTRA_PORT", default_value_t = 3000)]
    pub port: u16,

    /// Data directory (logs); defaults to ~/.ultra
    #[arg(long, env = "ULTRA_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Python interpreter used to run the backend
    #[arg(long, env = "ULTRA_PYTHON")]
    pub python: Option<PathBuf>,

    /// Backend entry script, relative to the backend directory
    #[arg(long, env = "ULTRA_BACKEND_SCRIPT", default_value = "main.py")]
    pub script: PathBuf,

    /// Working directory for the backend; defaults to the current directory
    #[arg(long, env = "ULTRA_BACKEND_DIR")]
    pub backend_dir: Option<PathBuf>,

    /// Credentials file checked before autostart; defaults to <backend-dir>/apikey.py
    #[arg(long, env = "ULTRA_CREDENTIALS")]
    pub credentials: Option<PathBuf>,

    /// Milliseconds to wait after SIGTERM before killing the backend
    #[arg(long, env = "ULTRA_GRACE_MS", default_value_t = 5000)]
    pub grace_ms: u64,

    /// Do not start the backend when the shell starts
    #[arg(long)]
    pub no_autostart: bool,
}

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub addr: SocketAddr,
    pub supervisor: SupervisorConfig,
    pub credentials_path: PathBuf,
    pub autostart: bool,
}

impl ShellConfig {
    pub fn from_args(args: &ShellArgs) -> anyhow::Result<Self> {
        let backend_dir = match &args.backend_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        let script = if args.script.is_absolute() {
            args.script.clone()
        } else {
            backend_dir.join(&args.script)
        };
        let python = args.python.clone().unwrap_or_else(default_python);

        let launch = LaunchSpec::new(python, ["-u".to_string(), script.display().to_string()])
            .current_dir(&backend_dir);

        Ok(Self {
            addr: SocketAddr::new(args.bind, args.port),
            supervisor: SupervisorConfig::new(launch)
                .with_grace_period(Duration::from_millis(args.grace_ms)),
            credentials_path: args
                .credentials
                .clone()
                .unwrap_or_else(|| backend_dir.join("apikey.py")),
            autostart: !args.no_autostart,
        })
    }
}

/// `python` on Windows, `python3` everywhere else.
pub fn default_python() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("python")
    } else {
        PathBuf::from("python3")
    }
}
