// ABOUTME: Error types for the subvisor-core crate.
// ABOUTME: Structured errors for supervisor operations, scaffolding, and wire parsing.

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by [`ProcessSupervisor`](crate::ProcessSupervisor) operations.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The id is not in the registry.
    #[error("unknown subprocess: {0}")]
    UnknownSubprocess(String),

    /// The executable could not be launched. The subprocess is left in ERROR.
    #[error("failed to spawn '{id}': {message}")]
    SpawnFailed { id: String, message: String },
}

/// Errors produced while generating a placeholder worker.
#[derive(Error, Debug)]
pub enum ScaffoldError {
    /// Scaffolding is turned off and the executable is missing.
    #[error("executable not found: {}", .0.display())]
    Disabled(PathBuf),

    /// Writing the placeholder failed.
    #[error("failed to write placeholder {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Reasons a stdout line is not a recognized wire record.
#[derive(Error, Debug)]
pub enum WireError {
    /// The line is not a JSON object.
    #[error("not a json object: {0}")]
    NotJson(String),

    /// The object has no `kind` discriminant.
    #[error("missing record kind")]
    MissingKind,

    /// The `kind` is not one the monitor understands.
    #[error("unrecognized record kind: {0}")]
    UnknownKind(String),

    /// The `kind` is known but the payload does not match its shape.
    #[error("malformed {kind} record: {reason}")]
    Malformed { kind: &'static str, reason: String },
}
