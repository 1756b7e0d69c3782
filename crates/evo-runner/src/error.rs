use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RunnerError>;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("config file not found: {}", .0.display())]
    ConfigMissing(PathBuf),
    #[error("field {field} missing in {}", .path.display())]
    FieldMissing { field: &'static str, path: PathBuf },
    #[error("no such settings directory: {}", .0.display())]
    NoSuchCategory(PathBuf),
    #[error("settings definition not found: {}", .0.display())]
    SettingsMissing(PathBuf),
    #[error("cannot read fitness log {}: {reason}", .path.display())]
    MissingFitnessLog { path: PathBuf, reason: String },
    #[error("cannot read population log: {}", .0.display())]
    PopulationLogMissing(PathBuf),
    #[error(
        "population size {target} must exceed the number of constituents ({constituents})"
    )]
    PopulationTooSmall { target: usize, constituents: usize },
    #[error("aggregated population holds {got} records, expected at least {expected}")]
    PopulationUnderflow { expected: usize, got: usize },
    #[error("trial group {0} has no members")]
    EmptyGroup(String),
    #[error("host {host} unreachable: {reason}")]
    HostUnreachable { host: String, reason: String },
    #[error("process failed with exit code {0}")]
    ProcessFailed(i32),
    #[error("could not find evolution binary {}", .0.display())]
    BinaryMissing(PathBuf),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid placeholder template {}: {reason}", .path.display())]
    InvalidTemplate { path: PathBuf, reason: String },
    #[error("invalid settings file {}: {source}", .path.display())]
    Settings {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Errors that abort the operation depending on them instead of being
    /// logged and skipped by the enclosing batch loop.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            RunnerError::PopulationTooSmall { .. }
                | RunnerError::NoSuchCategory(_)
                | RunnerError::BinaryMissing(_)
        )
    }

    /// Stable machine readable code used by the CLI's json output.
    pub fn code(&self) -> &'static str {
        match self {
            RunnerError::ConfigMissing(_) => "config_missing",
            RunnerError::FieldMissing { .. } => "field_missing",
            RunnerError::NoSuchCategory(_) => "no_such_category",
            RunnerError::SettingsMissing(_) => "settings_missing",
            RunnerError::MissingFitnessLog { .. } => "missing_fitness_log",
            RunnerError::PopulationLogMissing(_) => "population_log_missing",
            RunnerError::PopulationTooSmall { .. } => "population_too_small",
            RunnerError::PopulationUnderflow { .. } => "population_underflow",
            RunnerError::EmptyGroup(_) => "empty_group",
            RunnerError::HostUnreachable { .. } => "host_unreachable",
            RunnerError::ProcessFailed(_) => "process_failed",
            RunnerError::BinaryMissing(_) => "binary_missing",
            RunnerError::Transport(_) => "transport_error",
            RunnerError::InvalidTemplate { .. } => "invalid_template",
            RunnerError::Settings { .. } => "invalid_settings",
            RunnerError::Io(_) => "io_error",
        }
    }
}
