//! Parameter sweeps: one trial per point of a population-size by
//! mutation-rate grid, each run against a settings definition whose `{}`
//! placeholders are filled with the point's values.
//!
//! The last progress line of every trial is collected into a results file as
//! `{population size} {mutation rate} {line}`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::dispatch::{BatchObserver, BatchReport, Dispatcher, JobOutcome, JobReport};
use crate::error::{Result, RunnerError};
use crate::process::CommandRunner;
use crate::store::ExperimentStore;

pub const DEFAULT_RESULTS_FILE: &str = "results.log";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SweepPoint {
    pub population_size: u64,
    pub mutation_rate: f64,
}

impl SweepPoint {
    fn values(&self) -> [String; 2] {
        [
            self.population_size.to_string(),
            format_float(self.mutation_rate),
        ]
    }
}

/// Population sizes spaced linearly (truncated to integers) and mutation
/// rates spaced logarithmically, `steps` values each.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepGrid {
    pub population: (u64, u64),
    pub rate_exponents: (f64, f64),
    pub steps: usize,
}

impl Default for SweepGrid {
    fn default() -> Self {
        Self {
            population: (5, 50),
            rate_exponents: (-3.0, 0.0),
            steps: 10,
        }
    }
}

impl SweepGrid {
    pub fn population_sizes(&self) -> Vec<u64> {
        let (start, stop) = self.population;
        linspace(start as f64, stop as f64, self.steps)
            .into_iter()
            .map(|v| v as u64)
            .collect()
    }

    pub fn mutation_rates(&self) -> Vec<f64> {
        let (start, stop) = self.rate_exponents;
        linspace(start, stop, self.steps)
            .into_iter()
            .map(|e| 10f64.powf(e))
            .collect()
    }

    /// Population size varies slowest.
    pub fn points(&self) -> Vec<SweepPoint> {
        let rates = self.mutation_rates();
        self.population_sizes()
            .into_iter()
            .flat_map(|population_size| {
                rates.iter().map(move |&mutation_rate| SweepPoint {
                    population_size,
                    mutation_rate,
                })
            })
            .collect()
    }
}

fn linspace(start: f64, stop: f64, steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (steps - 1) as f64;
            let mut values: Vec<f64> = (0..steps).map(|i| start + step * i as f64).collect();
            values[steps - 1] = stop;
            values
        }
    }
}

/// Shortest round-trip form, always with a fractional part (`1.0`, `0.001`).
fn format_float(value: f64) -> String {
    let text = value.to_string();
    if value.is_finite() && !text.contains('.') {
        format!("{}.0", text)
    } else {
        text
    }
}

/// Replaces `{}` (sequentially) and `{N}` (by index) with `values`; `{{` and
/// `}}` stand for literal braces.
pub fn fill_placeholders(path: &Path, template: &str, values: &[String]) -> Result<String> {
    let invalid = |reason: String| RunnerError::InvalidTemplate {
        path: path.to_path_buf(),
        reason,
    };
    let mut out = String::with_capacity(template.len());
    let mut next = 0;
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => return Err(invalid("single '}' encountered".to_string())),
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => field.push(c),
                        None => return Err(invalid("unterminated '{'".to_string())),
                    }
                }
                let index = if field.is_empty() {
                    next += 1;
                    next - 1
                } else {
                    field
                        .parse::<usize>()
                        .map_err(|_| invalid(format!("unsupported field {{{}}}", field)))?
                };
                let value = values
                    .get(index)
                    .ok_or_else(|| invalid(format!("no value for placeholder {}", index)))?;
                out.push_str(value);
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

/// `{settings file}.tmp`, next to the definition it was filled from.
pub fn filled_settings_path(settings_file: &Path) -> PathBuf {
    let mut name = settings_file.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Last line of `path`, `None` when the file is missing or empty.
fn last_line(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text.lines().last().map(str::to_string)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepRequest {
    pub robot: String,
    pub behavior: String,
    pub grid: SweepGrid,
    pub start_port: u16,
    pub dry_run: bool,
    pub results_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    #[serde(flatten)]
    pub batch: BatchReport,
    pub results: Vec<String>,
}

pub struct ParameterSweep<'d, S, R> {
    dispatcher: &'d Dispatcher<S, R>,
}

impl<'d, S: ExperimentStore, R: CommandRunner> ParameterSweep<'d, S, R> {
    pub fn new(dispatcher: &'d Dispatcher<S, R>) -> Self {
        Self { dispatcher }
    }

    /// Runs trial `i` for the `i`-th grid point. Already conducted points are
    /// skipped but still contribute their result line. A dry run fills the
    /// template without writing it and leaves the results file alone.
    pub fn run(
        &self,
        request: &SweepRequest,
        observer: &mut dyn BatchObserver,
    ) -> Result<SweepReport> {
        let settings = self.dispatcher.settings();
        let store = self.dispatcher.store();
        let settings_file = settings.settings_file(&request.robot, &request.behavior);
        let template = match fs::read_to_string(&settings_file) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(RunnerError::SettingsMissing(settings_file))
            }
            Err(err) => return Err(err.into()),
        };
        let filled_file = filled_settings_path(&settings_file);

        let mut ports = self.dispatcher.port_allocator(request.start_port);
        let mut report = SweepReport::default();
        for (index, point) in request.grid.points().iter().enumerate() {
            if self.dispatcher.cancel_token().is_cancelled() {
                tracing::warn!(robot = %request.robot, "sweep interrupted");
                report.batch.cancelled = true;
                break;
            }
            let exp = self
                .dispatcher
                .experiment(&request.robot, &request.behavior, index as u32);
            let port = ports.allocate();
            let values = point.values();
            let filled = fill_placeholders(&settings_file, &template, &values)?;
            tracing::info!(
                experiment = %exp,
                population_size = point.population_size,
                mutation_rate = point.mutation_rate,
                "sweep point"
            );
            observer.started(&exp.name(), port);
            let settings_used = if request.dry_run {
                settings_file.as_path()
            } else {
                store.write_text(&filled_file, &filled)?;
                filled_file.as_path()
            };
            let job = match self
                .dispatcher
                .conduct_with(&exp, settings_used, port, request.dry_run)
            {
                Ok(job) => job,
                Err(err) if err.is_structural() => return Err(err),
                Err(err) => {
                    tracing::error!(experiment = %exp, "{}", err);
                    JobReport {
                        experiment: exp.name(),
                        port,
                        outcome: JobOutcome::Error {
                            code: err.code().to_string(),
                            message: err.to_string(),
                        },
                    }
                }
            };
            observer.finished(&job);
            report.batch.reports.push(job);
            if request.dry_run {
                continue;
            }

            match last_line(&exp.file(&settings.files.progress_log))? {
                Some(line) => {
                    report
                        .results
                        .push(format!("{} {} {}", values[0], values[1], line));
                    let mut body = report.results.join("\n");
                    body.push('\n');
                    store.write_text(&request.results_path, &body)?;
                }
                None => tracing::warn!(experiment = %exp, "no progress recorded, no result line"),
            }
        }
        report.batch.next_port = ports.peek();
        Ok(report)
    }
}
