//! 快照层错误。

use mcm_core::{FailureClass, McmError, codes};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("filesystem operation on {path} failed: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {status}: {stderr}")]
    Tool {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("no valid snapshot to restore")]
    Missing,

    #[error("advisory flag update failed: {source}")]
    Flag {
        #[source]
        source: mcm_core::McmError,
    },

    #[error("timed out waiting for in-flight snapshot/restore operations to clear")]
    WaitTimeout,
}

impl From<SnapshotError> for McmError {
    fn from(err: SnapshotError) -> Self {
        let (code, class) = match &err {
            SnapshotError::Missing => (codes::SNAPSHOT_MISSING, FailureClass::Fatal),
            SnapshotError::WaitTimeout => (codes::SNAPSHOT_PENDING, FailureClass::Transient),
            SnapshotError::Flag { .. } => (codes::COORD_SESSION_LOST, FailureClass::SessionLost),
            SnapshotError::Io { .. } => (codes::SNAPSHOT_IO, FailureClass::Subprocess),
            SnapshotError::Spawn { .. } | SnapshotError::Tool { .. } => {
                (codes::SNAPSHOT_TOOL, FailureClass::Subprocess)
            }
        };
        McmError::new(code, class, err.to_string()).with_cause(err)
    }
}
