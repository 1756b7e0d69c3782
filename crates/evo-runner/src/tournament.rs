//! Tournaments: derived experiments seeded from the populations of several
//! completed sibling trials.
//!
//! Unlike plain trials, a tournament is rebuilt whenever one of its
//! constituents has been modified after it (mtime comparison), and skipped
//! otherwise.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config;
use crate::dispatch::{BatchObserver, BatchReport, Dispatcher, Job, JobOutcome, JobReport};
use crate::error::{Result, RunnerError};
use crate::experiment::TournamentRef;
use crate::process::CommandRunner;
use crate::store::ExperimentStore;

/// True when `tournament_dir` is absent or any constituent directory was
/// modified strictly after it.
pub fn is_stale<S: ExperimentStore>(
    store: &S,
    tournament_dir: &Path,
    constituent_dirs: &[PathBuf],
) -> Result<bool> {
    if !store.is_materialized(tournament_dir) {
        return Ok(true);
    }
    let built = store.modified_at(tournament_dir)?;
    for dir in constituent_dirs {
        if store.modified_at(dir)? > built {
            tracing::debug!(constituent = %dir.display(), "newer than tournament");
            return Ok(true);
        }
    }
    Ok(false)
}

/// Concatenates the leading `ceil(target / n)` records of every constituent
/// log, in order, and keeps the first `target`.
///
/// Early constituents are favoured when `target` is not a multiple of `n`.
pub fn build_population<S: ExperimentStore>(
    store: &S,
    constituent_logs: &[PathBuf],
    target_size: usize,
) -> Result<Vec<String>> {
    let constituents = constituent_logs.len();
    if target_size <= constituents {
        return Err(RunnerError::PopulationTooSmall {
            target: target_size,
            constituents,
        });
    }
    let lines_per_source = target_size.div_ceil(constituents);
    let mut population = Vec::with_capacity(lines_per_source * constituents);
    for log in constituent_logs {
        let head = match store.read_head(log, lines_per_source) {
            Err(RunnerError::Io(err)) if err.kind() == ErrorKind::NotFound => {
                return Err(RunnerError::PopulationLogMissing(log.clone()))
            }
            other => other?,
        };
        population.extend(head);
    }
    if population.len() < target_size {
        return Err(RunnerError::PopulationUnderflow {
            expected: target_size,
            got: population.len(),
        });
    }
    population.truncate(target_size);
    Ok(population)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TournamentRequest {
    pub robot: String,
    pub behavior: String,
    pub constituents: Vec<u32>,
    pub port: u16,
    pub dry_run: bool,
}

pub struct TournamentAggregator<'d, S, R> {
    dispatcher: &'d Dispatcher<S, R>,
}

impl<'d, S: ExperimentStore, R: CommandRunner> TournamentAggregator<'d, S, R> {
    pub fn new(dispatcher: &'d Dispatcher<S, R>) -> Self {
        Self { dispatcher }
    }

    pub fn run_tournament(&self, request: &TournamentRequest) -> Result<JobReport> {
        let settings = self.dispatcher.settings();
        let store = self.dispatcher.store();
        let tournament =
            TournamentRef::new(&settings.data_root, &request.robot, &request.behavior);
        let report = |outcome| JobReport {
            experiment: tournament.name(),
            port: request.port,
            outcome,
        };

        let settings_file =
            settings.tournament_settings_file(&request.robot, &request.behavior);
        if !settings_file.is_file() {
            return Err(RunnerError::SettingsMissing(settings_file));
        }

        let constituent_dirs: Vec<PathBuf> = request
            .constituents
            .iter()
            .map(|&index| tournament.constituent(index).dir())
            .collect();
        let dir = tournament.dir();
        let exists = store.is_materialized(&dir);
        if exists && !is_stale(store, &dir, &constituent_dirs)? {
            tracing::info!(tournament = %tournament, "up to date, skipping");
            return Ok(report(JobOutcome::UpToDate));
        }

        let target_size = config::read_population_size(&settings_file)?;
        let logs: Vec<PathBuf> = constituent_dirs
            .iter()
            .map(|d| d.join(&settings.files.population_log))
            .collect();
        let population = build_population(store, &logs, target_size)?;
        tracing::info!(
            tournament = %tournament,
            constituents = logs.len(),
            records = population.len(),
            "population aggregated"
        );

        let job = Job {
            name: tournament.name(),
            invocation: self
                .dispatcher
                .invocation(&tournament.name(), &settings_file, request.port),
            port: request.port,
            output_dir: dir.clone(),
        };
        if request.dry_run {
            return Ok(report(JobOutcome::DryRun {
                command: job.invocation.command_line(),
            }));
        }

        self.dispatcher.runner().preflight(&job.invocation)?;
        if exists {
            let removed = store.clear_files(&dir)?;
            tracing::info!(tournament = %tournament, removed, "stale, rebuilding");
        }
        store.ensure_dir(&dir)?;
        store.write_lines(&dir.join(&settings.files.population_log), &population)?;
        let outcome = self.dispatcher.execute(&job)?;
        Ok(report(outcome))
    }

    /// One tournament per behavior. Per-tournament failures are reported and
    /// the batch moves on; only a missing binary stops it.
    pub fn run_tournaments(
        &self,
        robot: &str,
        behaviors: &[String],
        constituents: &[u32],
        start_port: u16,
        dry_run: bool,
        observer: &mut dyn BatchObserver,
    ) -> Result<BatchReport> {
        let mut ports = self.dispatcher.port_allocator(start_port);
        let mut batch = BatchReport::default();
        for behavior in behaviors {
            if self.dispatcher.cancel_token().is_cancelled() {
                tracing::warn!(robot, "tournament batch interrupted");
                batch.cancelled = true;
                break;
            }
            let request = TournamentRequest {
                robot: robot.to_string(),
                behavior: behavior.clone(),
                constituents: constituents.to_vec(),
                port: ports.allocate(),
                dry_run,
            };
            let name = TournamentRef::new("", robot, behavior.as_str()).name();
            observer.started(&name, request.port);
            let report = match self.run_tournament(&request) {
                Ok(report) => report,
                Err(err @ RunnerError::BinaryMissing(_)) => return Err(err),
                Err(err) => {
                    tracing::error!(tournament = %name, "{}", err);
                    JobReport {
                        experiment: name,
                        port: request.port,
                        outcome: JobOutcome::Error {
                            code: err.code().to_string(),
                            message: err.to_string(),
                        },
                    }
                }
            };
            observer.finished(&report);
            batch.reports.push(report);
        }
        batch.next_port = ports.peek();
        Ok(batch)
    }
}
