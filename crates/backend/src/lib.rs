//! Ultra Backend
//!
//! Owns the OS side of the supervised backend: spawning the child process,
//! pumping its stdout/stderr as raw chunks, feeding its stdin and delivering
//! termination signals. Knows nothing about the relay or classification.

pub mod decode;
pub mod process;

pub use decode::Utf8ChunkDecoder;
pub use process::{
    spawn, ExitInfo, LaunchSpec, OutputStream, ProcessEvent, ProcessEvents, ProcessHandle,
};
use thiserror::Error;

/// Errors that can occur while driving the backend process
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Backend process is not running")]
    NotRunning,

    #[error("Backend stdin queue is full")]
    InputFull,

    #[error("Child process has no {0} pipe")]
    MissingPipe(&'static str),
}
