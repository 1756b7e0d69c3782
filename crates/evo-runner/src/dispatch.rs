//! Running single trials of the simulation binary.
//!
//! A trial runs at most once per identity: if its directory exists it is
//! skipped, whatever state the previous run left behind.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::cancel::CancelToken;
use crate::catalog::{self, TrialTemplate};
use crate::error::{Result, RunnerError};
use crate::experiment::ExperimentRef;
use crate::ports::PortAllocator;
use crate::process::{strip_ansi, CommandRunner, Invocation, LocalRunner};
use crate::settings::RunnerSettings;
use crate::store::{ExperimentStore, FsStore};

/// One unit of work: a command, its port and the directory its output lands in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub name: String,
    pub invocation: Invocation,
    pub port: u16,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The experiment directory already existed.
    Skipped,
    /// A derived experiment is newer than all of its inputs.
    UpToDate,
    /// Nothing was run; the command is kept for inspection.
    DryRun { command: String },
    Succeeded { exit_code: i32 },
    Failed { exit_code: i32 },
    /// The job could not be run at all.
    Error { code: String, message: String },
}

impl JobOutcome {
    fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            JobOutcome::Succeeded { exit_code }
        } else {
            JobOutcome::Failed { exit_code }
        }
    }

    fn from_error(err: &RunnerError) -> Self {
        JobOutcome::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobOutcome::Failed { .. } | JobOutcome::Error { .. })
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Skipped => f.write_str("DONE. SKIPPED."),
            JobOutcome::UpToDate => f.write_str("SKIPPED."),
            JobOutcome::DryRun { command } => f.write_str(command),
            JobOutcome::Succeeded { .. } => f.write_str("OK."),
            JobOutcome::Failed { exit_code } => write!(f, "FAILED. Code {}", exit_code),
            JobOutcome::Error { message, .. } => write!(f, "FAILED. {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub experiment: String,
    pub port: u16,
    #[serde(flatten)]
    pub outcome: JobOutcome,
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = match self.outcome {
            JobOutcome::Skipped | JobOutcome::UpToDate => '+',
            _ => '>',
        };
        write!(f, " {} {} {}", marker, self.experiment, self.outcome)
    }
}

/// Result of a sequential batch; `next_port` chains into the next batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub reports: Vec<JobReport>,
    pub next_port: u16,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn failures(&self) -> usize {
        self.reports.iter().filter(|r| r.outcome.is_failure()).count()
    }
}

/// Hooks for live progress output while a batch runs.
pub trait BatchObserver {
    fn started(&mut self, _experiment: &str, _port: u16) {}
    fn finished(&mut self, _report: &JobReport) {}
}

impl BatchObserver for () {}

pub struct Dispatcher<S = FsStore, R = LocalRunner> {
    settings: RunnerSettings,
    store: S,
    runner: R,
    cancel: CancelToken,
}

impl Dispatcher {
    pub fn new(settings: RunnerSettings) -> Self {
        Self::with_parts(settings, FsStore, LocalRunner)
    }
}

impl<S: ExperimentStore, R: CommandRunner> Dispatcher<S, R> {
    pub fn with_parts(settings: RunnerSettings, store: S, runner: R) -> Self {
        Self {
            settings,
            store,
            runner,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn experiment(&self, robot: &str, behavior: &str, trial_index: u32) -> ExperimentRef {
        ExperimentRef::new(&self.settings.data_root, robot, behavior, trial_index)
    }

    pub fn port_allocator(&self, start: u16) -> PortAllocator {
        PortAllocator::with_reserved(start, self.settings.reserved_ports.iter().copied())
    }

    fn niced(&self, args: Vec<String>) -> Invocation {
        let mut full = vec![
            "-n".to_string(),
            self.settings.nice.to_string(),
            self.settings.binary.to_string_lossy().into_owned(),
        ];
        full.extend(args);
        Invocation {
            binary: self.settings.binary.clone(),
            program: "nice".to_string(),
            args: full,
            working_dir: None,
        }
    }

    /// `nice -n {nice} {binary} -n {name} -s {settings} -p {port} -b`
    pub fn invocation(&self, name: &str, settings_file: &Path, port: u16) -> Invocation {
        self.niced(vec![
            "-n".to_string(),
            name.to_string(),
            "-s".to_string(),
            settings_file.to_string_lossy().into_owned(),
            "-p".to_string(),
            port.to_string(),
            "-b".to_string(),
        ])
    }

    pub fn job_for(&self, exp: &ExperimentRef, port: u16) -> Job {
        let settings_file = self.settings.settings_file(&exp.robot, &exp.behavior);
        self.job_with(exp, &settings_file, port)
    }

    fn job_with(&self, exp: &ExperimentRef, settings_file: &Path, port: u16) -> Job {
        Job {
            name: exp.name(),
            invocation: self.invocation(&exp.name(), settings_file, port),
            port,
            output_dir: exp.dir(),
        }
    }

    /// Runs one trial unless its directory already exists.
    pub fn conduct(&self, exp: &ExperimentRef, port: u16, dry_run: bool) -> Result<JobReport> {
        let settings_file = self.settings.settings_file(&exp.robot, &exp.behavior);
        self.conduct_with(exp, &settings_file, port, dry_run)
    }

    /// [`conduct`](Self::conduct) with an explicit settings definition.
    pub fn conduct_with(
        &self,
        exp: &ExperimentRef,
        settings_file: &Path,
        port: u16,
        dry_run: bool,
    ) -> Result<JobReport> {
        let job = self.job_with(exp, settings_file, port);
        if self.store.is_materialized(&job.output_dir) {
            tracing::info!(experiment = %job.name, "already conducted, skipping");
            return Ok(self.report(&job, JobOutcome::Skipped));
        }
        if dry_run {
            let command = job.invocation.command_line();
            tracing::info!(experiment = %job.name, port, "dry run: {}", command);
            return Ok(self.report(&job, JobOutcome::DryRun { command }));
        }
        self.store.ensure_dir(&exp.category_dir())?;
        let outcome = self.execute(&job)?;
        Ok(self.report(&job, outcome))
    }

    /// Runs `job` unconditionally and stores its stripped output streams as
    /// sidecar files in `job.output_dir`.
    pub fn execute(&self, job: &Job) -> Result<JobOutcome> {
        tracing::info!(
            experiment = %job.name,
            port = job.port,
            command = %job.invocation.command_line(),
            "launching"
        );
        let output = self.runner.run(&job.invocation)?;
        if self.store.is_materialized(&job.output_dir) {
            let files = &self.settings.files;
            self.store
                .write_text(&job.output_dir.join(&files.stdout), &strip_ansi(&output.stdout))?;
            self.store
                .write_text(&job.output_dir.join(&files.stderr), &strip_ansi(&output.stderr))?;
        } else {
            tracing::warn!(
                experiment = %job.name,
                exit_code = output.exit_code,
                "binary did not create {}, output discarded",
                job.output_dir.display()
            );
        }
        if output.exit_code != 0 {
            tracing::warn!(experiment = %job.name, "{}", RunnerError::ProcessFailed(output.exit_code));
        }
        Ok(JobOutcome::from_exit_code(output.exit_code))
    }

    fn report(&self, job: &Job, outcome: JobOutcome) -> JobReport {
        JobReport {
            experiment: job.name.clone(),
            port: job.port,
            outcome,
        }
    }

    /// One trial per behavior, sequentially. The port advances after every
    /// item whether it ran, failed or was skipped.
    pub fn conduct_all(
        &self,
        robot: &str,
        behaviors: &[String],
        start_port: u16,
        trial_index: u32,
        dry_run: bool,
        observer: &mut dyn BatchObserver,
    ) -> Result<BatchReport> {
        let mut ports = self.port_allocator(start_port);
        let mut batch = BatchReport::default();
        for behavior in behaviors {
            if self.cancel.is_cancelled() {
                tracing::warn!(robot, trial_index, "batch interrupted");
                batch.cancelled = true;
                break;
            }
            let exp = self.experiment(robot, behavior, trial_index);
            let port = ports.allocate();
            observer.started(&exp.name(), port);
            let report = match self.conduct(&exp, port, dry_run) {
                Ok(report) => report,
                Err(err) if err.is_structural() => return Err(err),
                Err(err) => {
                    tracing::error!(experiment = %exp, "{}", err);
                    JobReport {
                        experiment: exp.name(),
                        port,
                        outcome: JobOutcome::from_error(&err),
                    }
                }
            };
            observer.finished(&report);
            batch.reports.push(report);
        }
        batch.next_port = ports.peek();
        Ok(batch)
    }

    /// [`conduct_all`](Self::conduct_all) for trial indices `0..trials`,
    /// chaining ports from one round into the next.
    pub fn conduct_trials(
        &self,
        robot: &str,
        behaviors: &[String],
        start_port: u16,
        trials: u32,
        dry_run: bool,
        observer: &mut dyn BatchObserver,
    ) -> Result<BatchReport> {
        let mut total = BatchReport {
            next_port: start_port,
            ..BatchReport::default()
        };
        for trial_index in 0..trials {
            let round = self.conduct_all(
                robot,
                behaviors,
                total.next_port,
                trial_index,
                dry_run,
                observer,
            )?;
            total.reports.extend(round.reports);
            total.next_port = round.next_port;
            if round.cancelled {
                total.cancelled = true;
                break;
            }
        }
        Ok(total)
    }

    /// Replays a finished experiment in watch mode, logging sensorimotor
    /// data to `{dir}/{record_log}`.
    pub fn record(&self, name: &str, dir: &Path, port: u16, dry_run: bool) -> Result<JobReport> {
        let outfile = dir.join(&self.settings.files.record_log);
        let invocation = self.niced(vec![
            "--watch".to_string(),
            name.to_string(),
            "--port".to_string(),
            port.to_string(),
            "--blind".to_string(),
            "--enable_logging".to_string(),
            "--outfile".to_string(),
            outfile.to_string_lossy().into_owned(),
        ]);
        let job = Job {
            name: name.to_string(),
            invocation,
            port,
            output_dir: dir.to_path_buf(),
        };
        let outcome = if dry_run {
            JobOutcome::DryRun {
                command: job.invocation.command_line(),
            }
        } else {
            self.execute(&job)?
        };
        Ok(self.report(&job, outcome))
    }

    /// `{binary} -w {name} -p {port}`, opening the viewer on a finished
    /// experiment. Not niced; it runs in the foreground.
    pub fn watch_invocation(&self, name: &str, port: u16) -> Invocation {
        Invocation {
            binary: self.settings.binary.clone(),
            program: self.settings.binary.to_string_lossy().into_owned(),
            args: vec![
                "-w".to_string(),
                name.to_string(),
                "-p".to_string(),
                port.to_string(),
            ],
            working_dir: None,
        }
    }

    /// Shows `name` in the viewer and blocks until it is closed.
    pub fn watch(&self, name: &str, port: u16, dry_run: bool) -> Result<JobReport> {
        let invocation = self.watch_invocation(name, port);
        let outcome = if dry_run {
            JobOutcome::DryRun {
                command: invocation.command_line(),
            }
        } else {
            tracing::info!(experiment = name, port, "watching");
            JobOutcome::from_exit_code(self.runner.run_attached(&invocation)?)
        };
        Ok(JobReport {
            experiment: name.to_string(),
            port,
            outcome,
        })
    }

    /// Records the best trial of every behavior group of `robot`.
    pub fn record_best(
        &self,
        robot: &str,
        start_port: u16,
        dry_run: bool,
        observer: &mut dyn BatchObserver,
    ) -> Result<BatchReport> {
        let category = self.settings.category_dir(robot);
        if !category.is_dir() {
            return Err(RunnerError::NoSuchCategory(category));
        }
        let experiments = catalog::list_materialized(&category, &self.settings.files.config);
        let groups = catalog::group_by_behavior(&experiments);
        let mut ports = self.port_allocator(start_port);
        let mut batch = BatchReport::default();
        for (template, indices) in &groups {
            if self.cancel.is_cancelled() {
                batch.cancelled = true;
                break;
            }
            let port = ports.allocate();
            let report = match self.record_group(template, indices, port, dry_run, observer) {
                Ok(report) => report,
                Err(err) if err.is_structural() => return Err(err),
                Err(err) => {
                    tracing::error!(group = %template, "{}", err);
                    JobReport {
                        experiment: template.to_string(),
                        port,
                        outcome: JobOutcome::from_error(&err),
                    }
                }
            };
            observer.finished(&report);
            batch.reports.push(report);
        }
        batch.next_port = ports.peek();
        Ok(batch)
    }

    fn record_group(
        &self,
        template: &TrialTemplate,
        indices: &[u32],
        port: u16,
        dry_run: bool,
        observer: &mut dyn BatchObserver,
    ) -> Result<JobReport> {
        let ranking =
            catalog::select_best_median_worst(template, indices, &self.settings.files.fitness_log)?;
        let dir = template.path_for(ranking.best);
        let name = dir
            .strip_prefix(&self.settings.data_root)
            .unwrap_or(&dir)
            .to_string_lossy()
            .into_owned();
        observer.started(&name, port);
        self.record(&name, &dir, port, dry_run)
    }
}
