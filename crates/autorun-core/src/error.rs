use std::path::PathBuf;

use thiserror::Error;

pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("no submission archive found in {search_dir} (pass an explicit .zip path)")]
    ArchiveNotFound { search_dir: PathBuf },

    #[error("failed to extract {archive}: {detail}")]
    ArchiveExtractFailed { archive: PathBuf, detail: String },

    #[error("no directory under {root} contains both {entry_point} and {manifest}")]
    ServiceNotFound {
        root: PathBuf,
        entry_point: String,
        manifest: String,
    },

    #[error("failed to create runtime environment at {path}: {detail}")]
    EnvironmentCreateFailed { path: PathBuf, detail: String },

    #[error("dependency install from {manifest} failed ({status}):\n{output}")]
    DependencyInstallFailed {
        manifest: PathBuf,
        status: String,
        output: String,
    },

    #[error("failed to launch {entry_point}: {detail}")]
    LaunchFailed { entry_point: PathBuf, detail: String },

    #[error("service at {url} not healthy after {waited_ms}ms: {detail}\n--- process log tail ---\n{log_tail}")]
    HealthCheckTimeout {
        url: String,
        waited_ms: u64,
        detail: String,
        log_tail: String,
    },

    #[error("turn {index} failed: {reason}")]
    InteractionFailed { index: usize, reason: String },

    #[error("session artifact unavailable at {path}: {reason}")]
    ArtifactUnavailable { path: PathBuf, reason: String },

    #[error("shutdown of pid {pid} failed: {detail}")]
    ShutdownFailed { pid: u32, detail: String },

    #[error("interrupted during {phase}")]
    Interrupted { phase: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Recoverable errors are folded into the report as data; everything
    /// else aborts the run after cleanup.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InteractionFailed { .. }
                | Self::ArtifactUnavailable { .. }
                | Self::ShutdownFailed { .. }
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::ArchiveNotFound { .. } => "archive_not_found",
            Self::ArchiveExtractFailed { .. } => "archive_extract_failed",
            Self::ServiceNotFound { .. } => "service_not_found",
            Self::EnvironmentCreateFailed { .. } => "environment_create_failed",
            Self::DependencyInstallFailed { .. } => "dependency_install_failed",
            Self::LaunchFailed { .. } => "launch_failed",
            Self::HealthCheckTimeout { .. } => "health_check_timeout",
            Self::InteractionFailed { .. } => "interaction_failed",
            Self::ArtifactUnavailable { .. } => "artifact_unavailable",
            Self::ShutdownFailed { .. } => "shutdown_failed",
            Self::Interrupted { .. } => "interrupted",
            Self::Config(_) => "invalid_config",
            Self::Io { .. } => "io_error",
            Self::Json(_) => "json_error",
        }
    }
}

pub trait IoResultExt<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> HarnessResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> HarnessResult<T> {
        self.map_err(|source| HarnessError::io(context(), source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_turn_artifact_and_shutdown_errors_are_recoverable() {
        assert!(HarnessError::InteractionFailed {
            index: 3,
            reason: "timeout".to_string()
        }
        .is_recoverable());
        assert!(HarnessError::ArtifactUnavailable {
            path: PathBuf::from("output/session_x.json"),
            reason: "missing".to_string()
        }
        .is_recoverable());
        assert!(HarnessError::ShutdownFailed {
            pid: 1,
            detail: "eperm".to_string()
        }
        .is_recoverable());
        assert!(!HarnessError::HealthCheckTimeout {
            url: "http://127.0.0.1:5000/health".to_string(),
            waited_ms: 10,
            detail: "refused".to_string(),
            log_tail: String::new(),
        }
        .is_recoverable());
        assert!(!HarnessError::Interrupted {
            phase: "batch".to_string()
        }
        .is_recoverable());
    }

    #[test]
    fn dependency_failure_message_carries_installer_output() {
        let err = HarnessError::DependencyInstallFailed {
            manifest: PathBuf::from("backend/requirements.txt"),
            status: "exit 1".to_string(),
            output: "No matching distribution found for flask==99".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("requirements.txt"), "{}", msg);
        assert!(msg.contains("No matching distribution"), "{}", msg);
        assert_eq!(err.code(), "dependency_install_failed");
    }
}
