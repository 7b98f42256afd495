//! Errors raised while bringing up a transcoder child.
//!
//! Configuration errors live next to the loader in [`crate::config`].

use std::path::PathBuf;
use thiserror::Error;

/// Failure to get a child process running for an item.
///
/// Never fatal inside the play loop: the loop logs it, backs off and moves
/// on to the next item.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("transcoder binary not found: {0}")]
    BinaryNotFound(PathBuf),

    #[error("diagnostic pipe unavailable")]
    PipeUnavailable,

    #[error("failed to start process: {0}")]
    Start(#[source] std::io::Error),
}

impl SpawnError {
    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            SpawnError::BinaryNotFound(_) => "spawn_binary_not_found",
            SpawnError::PipeUnavailable => "spawn_pipe_unavailable",
            SpawnError::Start(_) => "spawn_start_failed",
        }
    }
}

impl From<std::io::Error> for SpawnError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            // tokio reports a missing program as NotFound from spawn().
            return SpawnError::BinaryNotFound(PathBuf::new());
        }
        SpawnError::Start(e)
    }
}
