use std::path::PathBuf;

use thiserror::Error;

use crate::process::TerminationSignal;

pub type Result<T> = std::result::Result<T, BuildError>;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("dependency reconciliation failed for {slug}: {message}")]
    Dependency { slug: String, message: String },

    #[error(
        "external command failed: {command} ({})",
        .exit_code.map_or_else(|| "no exit code".to_string(), |code| format!("exit={code}"))
    )]
    Process {
        command: String,
        exit_code: Option<i32>,
    },

    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("external command timed out: {command} ({seconds}s)")]
    Timeout { command: String, seconds: u64 },

    #[error("external command terminated by {signal}: {command}")]
    Signal {
        command: String,
        signal: TerminationSignal,
    },

    #[error("build cancelled before completion: {slug}")]
    Cancelled { slug: String },

    #[error("invalid settings file {path}: {message}")]
    Settings { path: PathBuf, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn dependency(slug: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dependency {
            slug: slug.into(),
            message: message.into(),
        }
    }

    /// Process exit code the CLI reports for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration { .. } | Self::Settings { .. } => 2,
            Self::Timeout { .. } => 124,
            Self::Signal { .. } | Self::Cancelled { .. } => 130,
            _ => 1,
        }
    }

    /// Terminal build status this error maps to in a batch report.
    #[must_use]
    pub fn status(&self) -> BuildStatus {
        match self {
            Self::Timeout { .. } => BuildStatus::TimedOut,
            Self::Signal { .. } => BuildStatus::Signaled,
            Self::Cancelled { .. } => BuildStatus::Cancelled,
            Self::Configuration { .. } | Self::Settings { .. } => BuildStatus::Misconfigured,
            _ => BuildStatus::Failed,
        }
    }
}

/// Terminal state of one build invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Every expected artifact was already on disk; nothing ran.
    AlreadyBuilt,
    Succeeded,
    Failed,
    TimedOut,
    Signaled,
    Cancelled,
    Misconfigured,
}

impl BuildStatus {
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::AlreadyBuilt | Self::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_error_message_includes_exit_code() {
        let error = BuildError::Process {
            command: "bash".to_string(),
            exit_code: Some(3),
        };
        assert_eq!(error.to_string(), "external command failed: bash (exit=3)");
        assert_eq!(error.exit_code(), 1);
        assert_eq!(error.status(), BuildStatus::Failed);
    }

    #[test]
    fn killed_process_reports_missing_exit_code() {
        let error = BuildError::Process {
            command: "bash".to_string(),
            exit_code: None,
        };
        assert!(error.to_string().ends_with("(no exit code)"));
    }

    #[test]
    fn signal_and_timeout_map_to_conventional_exit_codes() {
        let signal = BuildError::Signal {
            command: "bash".to_string(),
            signal: TerminationSignal::Interrupt,
        };
        let timeout = BuildError::Timeout {
            command: "bash".to_string(),
            seconds: 60,
        };
        assert_eq!(signal.exit_code(), 130);
        assert_eq!(signal.status(), BuildStatus::Signaled);
        assert_eq!(timeout.exit_code(), 124);
        assert_eq!(timeout.status(), BuildStatus::TimedOut);
    }

    #[test]
    fn configuration_errors_are_reported_as_misconfigured() {
        let error = BuildError::configuration("no artifacts");
        assert_eq!(error.exit_code(), 2);
        assert_eq!(error.status(), BuildStatus::Misconfigured);
        assert!(!error.status().is_success());
    }
}
