/// Error taxonomy for backup and restore runs
///
/// Each variant corresponds to one class of failure the orchestrators can hit.
/// Subprocess exit statuses are carried along so the process can exit with the
/// same status as the command that failed.

use std::process::ExitStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    /// A dependent service or file is missing. Never retried.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The export subprocess failed; no partial dump is kept.
    #[error("database dump failed: {message}")]
    Dump { message: String, status: Option<i32> },

    /// Compression or filesystem failure while building or reading an archive.
    #[error("archive error: {message}")]
    Archive {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Credential exchange with the object-storage provider failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Upload to the delivery target failed. The archive stays on disk.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Extraction or replay failed during restore.
    #[error("restore failed: {message}")]
    Restore {
        message: String,
        status: Option<i32>,
        /// Captured stderr of the replay, surfaced verbatim.
        log: Option<String>,
        /// The database volume has already been reset.
        degraded: bool,
    },
}

pub type Result<T> = std::result::Result<T, BackupError>;

impl BackupError {
    pub fn archive(message: impl Into<String>, source: std::io::Error) -> Self {
        BackupError::Archive {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn dump_status(message: impl Into<String>, status: ExitStatus) -> Self {
        BackupError::Dump {
            message: message.into(),
            status: status.code(),
        }
    }

    pub fn restore(message: impl Into<String>, degraded: bool) -> Self {
        BackupError::Restore {
            message: message.into(),
            status: None,
            log: None,
            degraded,
        }
    }

    /// Process exit code for this failure.
    ///
    /// A failing subprocess's own status wins when it is known and non-zero.
    pub fn exit_code(&self) -> u8 {
        let subprocess = match self {
            BackupError::Dump { status, .. } | BackupError::Restore { status, .. } => *status,
            _ => None,
        };

        if let Some(code) = subprocess.filter(|c| *c != 0) {
            return code.clamp(1, 255) as u8;
        }

        match self {
            BackupError::Precondition(_) => 3,
            BackupError::Dump { .. } => 4,
            BackupError::Archive { .. } => 5,
            BackupError::Auth(_) => 6,
            BackupError::Delivery(_) => 7,
            BackupError::Restore { .. } => 8,
        }
    }

    /// Whether the database was left reset but not repopulated
    pub fn is_degraded(&self) -> bool {
        matches!(self, BackupError::Restore { degraded: true, .. })
    }
}

/// Render an error with its source chain on one line
pub fn describe(error: &BackupError) -> String {
    let mut text = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
