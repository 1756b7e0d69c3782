//! Experiment config files.
//!
//! The evolution binary writes a loose `KEY = value` text file per
//! experiment. Parsing is tolerant: unknown keys are ignored, absent or
//! unparsable values come back as `None` together with a warning, and the
//! readers below degrade to documented defaults instead of failing a scan.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::Serialize;

use crate::error::{Result, RunnerError};

pub const STATUS: &str = "STATUS";
pub const MAX_TRIALS: &str = "MAX_TRIALS";
pub const ROBOT: &str = "ROBOT";
pub const SYMMETRIC_CONTROLLER: &str = "SYMMETRIC_CONTROLLER";
pub const RANDOM_INIT: &str = "RANDOM_INIT";
pub const POPULATION_SIZE: &str = "POPULATION_SIZE";

const POPULATION_SIZE_ALIASES: &[&str] = &[POPULATION_SIZE, "PopulationSize"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    NotStarted,
    Running,
    Completed,
}

impl Status {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Status::NotStarted),
            1 => Some(Status::Running),
            2 => Some(Status::Completed),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Status::NotStarted => 0,
            Status::Running => 1,
            Status::Completed => 2,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::NotStarted => "not started",
            Status::Running => "running",
            Status::Completed => "completed",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExperimentConfig {
    pub status: Option<Status>,
    pub max_trials: Option<u64>,
    pub robot_id: Option<i64>,
    pub symmetric_controller: Option<bool>,
    pub random_init_seed: Option<i64>,
    pub population_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldProblem {
    Missing,
    Unparsable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldWarning {
    pub field: &'static str,
    pub problem: FieldProblem,
}

impl fmt::Display for FieldWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.problem {
            FieldProblem::Missing => write!(f, "no {} entry", self.field),
            FieldProblem::Unparsable(raw) => {
                write!(f, "unparsable {} entry: {:?}", self.field, raw)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedConfig {
    pub config: ExperimentConfig,
    pub warnings: Vec<FieldWarning>,
}

impl ParsedConfig {
    pub fn warning_for(&self, field: &str) -> Option<&FieldWarning> {
        self.warnings.iter().find(|w| w.field == field)
    }
}

struct FieldScan<'a> {
    raw: Vec<(&'a str, &'a str)>,
    warnings: Vec<FieldWarning>,
}

impl<'a> FieldScan<'a> {
    fn new(text: &'a str) -> Self {
        let mut raw: Vec<(&'a str, &'a str)> = Vec::new();
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() || raw.iter().any(|(k, _)| *k == key) {
                continue;
            }
            raw.push((key, value.trim()));
        }
        Self {
            raw,
            warnings: Vec::new(),
        }
    }

    fn get<T>(
        &mut self,
        field: &'static str,
        aliases: &[&str],
        parse: fn(&str) -> Option<T>,
    ) -> Option<T> {
        let value = aliases
            .iter()
            .find_map(|name| self.raw.iter().find(|(k, _)| k == name).map(|(_, v)| *v));
        let problem = match value {
            None => FieldProblem::Missing,
            Some(v) => match parse(v) {
                Some(parsed) => return Some(parsed),
                None => FieldProblem::Unparsable(v.to_string()),
            },
        };
        self.warnings.push(FieldWarning { field, problem });
        None
    }
}

/// Parses config (or settings definition) text.
///
/// The first occurrence of a key wins, matching a first-match regex scan.
pub fn parse(text: &str) -> ParsedConfig {
    let mut scan = FieldScan::new(text);
    let config = ExperimentConfig {
        status: scan.get(STATUS, &[STATUS], parse_status),
        max_trials: scan.get(MAX_TRIALS, &[MAX_TRIALS], leading_int::<u64>),
        robot_id: scan.get(ROBOT, &[ROBOT], leading_int::<i64>),
        symmetric_controller: scan.get(
            SYMMETRIC_CONTROLLER,
            &[SYMMETRIC_CONTROLLER],
            parse_yes_no,
        ),
        random_init_seed: scan.get(RANDOM_INIT, &[RANDOM_INIT], leading_int::<i64>),
        population_size: scan.get(POPULATION_SIZE, POPULATION_SIZE_ALIASES, leading_int::<usize>),
    };
    ParsedConfig {
        config,
        warnings: scan.warnings,
    }
}

fn leading_int<T: std::str::FromStr>(value: &str) -> Option<T> {
    value.split_whitespace().next()?.parse().ok()
}

fn parse_status(value: &str) -> Option<Status> {
    leading_int::<i64>(value).and_then(Status::from_code)
}

fn parse_yes_no(value: &str) -> Option<bool> {
    match value.split_whitespace().next()? {
        "YES" | "yes" | "1" | "true" => Some(true),
        "NO" | "no" | "0" | "false" => Some(false),
        _ => None,
    }
}

/// Reads and parses the config file at `path`.
pub fn load(path: &Path) -> Result<ParsedConfig> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(parse(&text)),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(RunnerError::ConfigMissing(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

fn warn_missing(path: &Path, parsed: &ParsedConfig, field: &'static str) {
    if let Some(w) = parsed.warning_for(field) {
        let err = RunnerError::FieldMissing {
            field,
            path: path.to_path_buf(),
        };
        tracing::warn!(config = %path.display(), detail = %w, "{}", err);
    }
}

/// Status of the experiment owning `path`; a missing or invalid field
/// degrades to [`Status::NotStarted`].
pub fn read_status(path: &Path) -> Result<Status> {
    let parsed = load(path)?;
    warn_missing(path, &parsed, STATUS);
    Ok(parsed.config.status.unwrap_or_default())
}

/// `MAX_TRIALS`, or `0` with a warning. Callers guard the division.
pub fn read_max_trials(path: &Path) -> Result<u64> {
    let parsed = load(path)?;
    warn_missing(path, &parsed, MAX_TRIALS);
    Ok(parsed.config.max_trials.unwrap_or(0))
}

/// Declared population size of a settings definition, `0` when absent.
pub fn read_population_size(path: &Path) -> Result<usize> {
    let parsed = match load(path) {
        Err(RunnerError::ConfigMissing(p)) => return Err(RunnerError::SettingsMissing(p)),
        other => other?,
    };
    warn_missing(path, &parsed, POPULATION_SIZE);
    Ok(parsed.config.population_size.unwrap_or(0))
}

/// Number of newline-terminated records in `log`; a missing file counts 0.
pub fn read_count(log: &Path) -> Result<u64> {
    match fs::read(log) {
        Ok(bytes) => Ok(bytes.iter().filter(|b| **b == b'\n').count() as u64),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Integer completion percentage; `max_trials == 0` is treated as 1.
pub fn completion_percent(current: u64, max_trials: u64) -> u64 {
    current * 100 / max_trials.max(1)
}
