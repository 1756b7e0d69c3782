use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use evo_runner::sweep::DEFAULT_RESULTS_FILE;
use evo_runner::{
    catalog, status, BatchObserver, BatchReport, CancelToken, ClusterDistributor, ClusterReport,
    CommandRunner, Dispatcher, ExperimentStore, JobReport, ParameterSweep, RunnerError,
    RunnerSettings, SshTransport, SweepGrid, SweepRequest, TournamentAggregator,
    DEFAULT_SETTINGS_FILE,
};

#[derive(Parser)]
#[command(name = "evo", version = "0.3.0", about = "Evolution experiment orchestrator")]
struct Cli {
    /// Orchestrator settings (YAML); defaults apply when the file is absent.
    #[arg(long, global = true, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,
    #[arg(long, global = true)]
    binary: Option<PathBuf>,
    /// -v for progress logs, -vv for debug.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every behavior of a robot, trial indices 0..number.
    Conduct {
        #[arg(short, long)]
        robot: String,
        #[arg(short, long, default_value_t = 1)]
        number: u32,
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        dry: bool,
        /// Skip the interactive confirmation.
        #[arg(short, long)]
        yes: bool,
        #[arg(long)]
        json: bool,
    },
    /// Rebuild stale tournaments from trials 0..trials.
    Tournament {
        #[arg(short, long)]
        robot: String,
        #[arg(short, long)]
        trials: u32,
        /// Restrict to these behaviors; all tournament definitions otherwise.
        #[arg(short, long)]
        behavior: Vec<String>,
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        dry: bool,
        #[arg(short, long)]
        yes: bool,
        #[arg(long)]
        json: bool,
    },
    Status {
        #[arg(short, long)]
        filter: Option<String>,
        #[arg(short, long)]
        path: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List completed experiments.
    List {
        #[arg(short, long)]
        filter: Option<String>,
        #[arg(short, long)]
        path: Option<PathBuf>,
        /// Include experiments that are still running.
        #[arg(long)]
        incomplete: bool,
        #[arg(long)]
        json: bool,
    },
    /// Number completed experiments and open the chosen ones in the viewer.
    Watch {
        #[arg(short, long)]
        filter: Option<String>,
        #[arg(short, long)]
        path: Option<PathBuf>,
        /// Offer experiments that are still running too.
        #[arg(short, long)]
        incomplete: bool,
        /// Port of experiment 0; experiment `i` is watched on `port + i`.
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        dry: bool,
    },
    /// Run one trial per point of a population size by mutation rate grid.
    Sweep {
        #[arg(short, long)]
        robot: String,
        /// Settings definition holding `{}` placeholders for the two values.
        #[arg(short, long)]
        behavior: String,
        /// Values per axis.
        #[arg(short, long, default_value_t = 10)]
        number: usize,
        #[arg(long, default_value_t = 5)]
        pop_min: u64,
        #[arg(long, default_value_t = 50)]
        pop_max: u64,
        /// Mutation rates run from 10^rate_exp_min to 10^rate_exp_max.
        #[arg(long, default_value_t = -3.0, allow_hyphen_values = true)]
        rate_exp_min: f64,
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        rate_exp_max: f64,
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long, default_value = DEFAULT_RESULTS_FILE)]
        results: PathBuf,
        #[arg(long)]
        dry: bool,
        #[arg(short, long)]
        yes: bool,
        #[arg(long)]
        json: bool,
    },
    /// Rank the trials of every behavior group by fitness.
    Groups {
        #[arg(short, long)]
        robot: String,
        #[arg(long)]
        json: bool,
    },
    /// Replay the best trial of every group with data logging enabled.
    Record {
        #[arg(short, long)]
        robot: String,
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        dry: bool,
        #[arg(long)]
        json: bool,
    },
    /// Start detached runs on the configured hosts.
    Distribute {
        #[arg(short, long)]
        robot: String,
        #[arg(short, long)]
        number: u32,
        #[arg(short, long)]
        yes: bool,
        #[arg(long)]
        json: bool,
    },
    /// Count running simulations on the configured hosts.
    Survey {
        /// Kill orchestrator, simulator and binary processes instead.
        #[arg(long)]
        kill: bool,
        #[arg(short, long)]
        yes: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = match load_settings(&cli) {
        Ok(settings) => run_command(cli.command, settings, install_interrupt_handler()),
        Err(err) => Err(err),
    };
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<RunnerError>()
                    .map_or("command_failed", RunnerError::code);
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load_settings(cli: &Cli) -> Result<RunnerSettings> {
    let mut settings = RunnerSettings::load(&cli.config)
        .with_context(|| format!("failed to load settings from {}", cli.config.display()))?;
    if let Some(root) = &cli.data_root {
        settings.data_root = root.clone();
    }
    if let Some(binary) = &cli.binary {
        settings.binary = binary.clone();
    }
    Ok(settings)
}

/// First Ctrl-C stops batches at the next item boundary. Jobs already running
/// receive the signal from the terminal themselves.
fn install_interrupt_handler() -> CancelToken {
    let cancel = CancelToken::new();
    let handle = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        eprintln!("interrupted, stopping after the current item");
        handle.cancel();
    }) {
        tracing::warn!("failed to install interrupt handler: {}", err);
    }
    cancel
}

fn run_command(
    command: Commands,
    settings: RunnerSettings,
    cancel: CancelToken,
) -> Result<Option<Value>> {
    match command {
        Commands::Conduct {
            robot,
            number,
            port,
            dry,
            yes,
            json,
        } => {
            let dispatcher = Dispatcher::new(settings).with_cancel(cancel);
            let behaviors = catalog::list_available(dispatcher.settings(), &robot)?;
            let start_port = port.unwrap_or(dispatcher.settings().port_start);
            if !json {
                println!("robot: {}", robot);
                println!("behaviors: {}", behaviors.join(" "));
                println!("trials: {}", number);
                println!("start_port: {}", start_port);
            }
            let dry_run = confirmed_dry_run(dry, yes)?;
            let batch = dispatcher.conduct_trials(
                &robot,
                &behaviors,
                start_port,
                number,
                dry_run,
                &mut Progress { quiet: json },
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "conduct",
                    "robot": robot,
                    "dry_run": dry_run,
                    "batch": serde_json::to_value(&batch)?
                })));
            }
            print_batch_summary(&batch);
        }
        Commands::Tournament {
            robot,
            trials,
            behavior,
            port,
            dry,
            yes,
            json,
        } => {
            let dispatcher = Dispatcher::new(settings).with_cancel(cancel);
            let behaviors = if behavior.is_empty() {
                catalog::list_tournament_definitions(dispatcher.settings(), &robot)?
            } else {
                behavior
            };
            let constituents: Vec<u32> = (0..trials).collect();
            let start_port = port.unwrap_or(dispatcher.settings().port_start);
            if !json {
                println!("robot: {}", robot);
                println!("tournaments: {}", behaviors.join(" "));
                println!("constituents: {}", trials);
                println!("start_port: {}", start_port);
            }
            let dry_run = confirmed_dry_run(dry, yes)?;
            let aggregator = TournamentAggregator::new(&dispatcher);
            let batch = aggregator.run_tournaments(
                &robot,
                &behaviors,
                &constituents,
                start_port,
                dry_run,
                &mut Progress { quiet: json },
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "tournament",
                    "robot": robot,
                    "dry_run": dry_run,
                    "batch": serde_json::to_value(&batch)?
                })));
            }
            print_batch_summary(&batch);
        }
        Commands::Status { filter, path, json } => {
            let root = path.unwrap_or_else(|| settings.data_root.clone());
            if !root.is_dir() {
                bail!("no such data directory: {}", root.display());
            }
            let rows = status::status_report(&root, &settings.files, filter.as_deref());
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "root": root.display().to_string(),
                    "experiments": serde_json::to_value(&rows)?
                })));
            }
            for row in &rows {
                println!("{}", row);
            }
        }
        Commands::List {
            filter,
            path,
            incomplete,
            json,
        } => {
            let root = path.unwrap_or_else(|| settings.data_root.clone());
            if !root.is_dir() {
                bail!("no such data directory: {}", root.display());
            }
            let names = status::selectable(&root, &settings.files, filter.as_deref(), incomplete);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "list",
                    "root": root.display().to_string(),
                    "experiments": names
                })));
            }
            for name in &names {
                println!("{}", name);
            }
        }
        Commands::Watch {
            filter,
            path,
            incomplete,
            port,
            dry,
        } => {
            let root = path.unwrap_or_else(|| settings.data_root.clone());
            if !root.is_dir() {
                bail!("no such data directory: {}", root.display());
            }
            let names = status::selectable(&root, &settings.files, filter.as_deref(), incomplete);
            let dispatcher = Dispatcher::new(settings);
            let start_port = port.unwrap_or(dispatcher.settings().port_start);
            let stdin = io::stdin();
            watch_loop(
                &dispatcher,
                &names,
                start_port,
                dry,
                stdin.lock(),
                &mut io::stdout(),
            )?;
        }
        Commands::Sweep {
            robot,
            behavior,
            number,
            pop_min,
            pop_max,
            rate_exp_min,
            rate_exp_max,
            port,
            results,
            dry,
            yes,
            json,
        } => {
            let dispatcher = Dispatcher::new(settings).with_cancel(cancel);
            let grid = SweepGrid {
                population: (pop_min, pop_max),
                rate_exponents: (rate_exp_min, rate_exp_max),
                steps: number,
            };
            let start_port = port.unwrap_or(dispatcher.settings().port_start);
            if !json {
                println!("robot: {}", robot);
                println!("behavior: {}", behavior);
                println!("binary: {}", dispatcher.settings().binary.display());
                println!("points: {}", grid.points().len());
                println!("start_port: {}", start_port);
                println!("results: {}", results.display());
            }
            let dry_run = confirmed_dry_run(dry, yes)?;
            let request = SweepRequest {
                robot: robot.clone(),
                behavior,
                grid,
                start_port,
                dry_run,
                results_path: results,
            };
            let report =
                ParameterSweep::new(&dispatcher).run(&request, &mut Progress { quiet: json })?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "sweep",
                    "robot": robot,
                    "dry_run": dry_run,
                    "sweep": serde_json::to_value(&report)?
                })));
            }
            print_batch_summary(&report.batch);
            println!("result_lines: {}", report.results.len());
        }
        Commands::Groups { robot, json } => {
            let category = settings.category_dir(&robot);
            if !category.is_dir() {
                return Err(RunnerError::NoSuchCategory(category).into());
            }
            let experiments = catalog::list_materialized(&category, &settings.files.config);
            let mut entries = Vec::new();
            for (template, indices) in &catalog::group_by_behavior(&experiments) {
                let group = template.to_string();
                match catalog::select_best_median_worst(
                    template,
                    indices,
                    &settings.files.fitness_log,
                ) {
                    Ok(ranking) => {
                        if !json {
                            println!(
                                "{} trials: {} best: {} median: {} worst: {}",
                                group,
                                join_indices(indices),
                                ranking.best,
                                ranking.median,
                                ranking.worst
                            );
                        }
                        entries.push(json!({
                            "group": group,
                            "trials": indices,
                            "ranking": serde_json::to_value(&ranking)?
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(group = %group, "{}", err);
                        if !json {
                            println!("{} FAILED. {}", group, err);
                        }
                        entries.push(json!({
                            "group": group,
                            "trials": indices,
                            "error": { "code": err.code(), "message": err.to_string() }
                        }));
                    }
                }
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "groups",
                    "robot": robot,
                    "groups": entries
                })));
            }
        }
        Commands::Record {
            robot,
            port,
            dry,
            json,
        } => {
            let dispatcher = Dispatcher::new(settings).with_cancel(cancel);
            let start_port = port.unwrap_or(dispatcher.settings().port_start);
            let batch =
                dispatcher.record_best(&robot, start_port, dry, &mut Progress { quiet: json })?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "record",
                    "robot": robot,
                    "dry_run": dry,
                    "batch": serde_json::to_value(&batch)?
                })));
            }
            print_batch_summary(&batch);
        }
        Commands::Distribute {
            robot,
            number,
            yes,
            json,
        } => {
            if settings.hosts.is_empty() {
                bail!("no hosts configured");
            }
            let command = settings.launch_command(&robot, number);
            if !json {
                println!("robot: {}", robot);
                println!("number: {}", number);
                println!("hosts: {}", settings.hosts.len());
                println!("command: {}", command);
            }
            if !yes && !confirm_start()? {
                return aborted("distribute", json);
            }
            let report = cluster_distributor(&settings, cancel).launch(
                &settings.hosts,
                &command,
                settings.remote.instances_per_host,
                settings.pacing(),
            );
            return cluster_output("distribute", &report, json);
        }
        Commands::Survey { kill, yes, json } => {
            if settings.hosts.is_empty() {
                bail!("no hosts configured");
            }
            let distributor = cluster_distributor(&settings, cancel);
            if kill {
                if !yes && !confirm_start()? {
                    return aborted("survey", json);
                }
                let report = distributor.terminate(&settings.hosts, &settings.remote.process_names);
                return cluster_output("survey", &report, json);
            }
            let report = distributor.survey(&settings.hosts);
            if !json {
                for host in &report.hosts {
                    println!("{}", host);
                }
                println!("simulators: {}", report.total_simulators());
                return Ok(None);
            }
            return cluster_output("survey", &report, json);
        }
    }
    Ok(None)
}

/// Prints one status line per finished job.
struct Progress {
    quiet: bool,
}

impl BatchObserver for Progress {
    fn finished(&mut self, report: &JobReport) {
        if !self.quiet {
            println!("{}", report);
        }
    }
}

/// Unconfirmed batches only print what they would run.
fn confirmed_dry_run(dry: bool, yes: bool) -> Result<bool> {
    if dry || yes {
        return Ok(dry);
    }
    if confirm_start()? {
        Ok(false)
    } else {
        eprintln!("not confirmed, dry run only");
        Ok(true)
    }
}

fn confirm_start() -> Result<bool> {
    eprint!("type 'start' to begin: ");
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim() == "start")
}

fn aborted(command: &str, json: bool) -> Result<Option<Value>> {
    if json {
        return Ok(Some(json!({ "ok": true, "command": command, "aborted": true })));
    }
    println!("Aborted.");
    Ok(None)
}

/// Prompts for experiment numbers until an empty line (or end of input) and
/// watches each chosen experiment in the foreground. Returns how many were
/// watched.
fn watch_loop<S: ExperimentStore, R: CommandRunner>(
    dispatcher: &Dispatcher<S, R>,
    names: &[String],
    start_port: u16,
    dry_run: bool,
    mut input: impl BufRead,
    out: &mut impl Write,
) -> Result<usize> {
    show_numbered(names, out)?;
    let mut watched = 0;
    loop {
        write!(out, "(press Enter to exit)\nWhich experiment shall I show to you? : ")?;
        out.flush()?;
        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            break;
        }
        let answer = line.trim();
        if answer.is_empty() {
            break;
        }
        match answer.parse::<usize>() {
            Ok(index) if index < names.len() => {
                let port = u16::try_from(index)
                    .ok()
                    .and_then(|offset| start_port.checked_add(offset))
                    .with_context(|| format!("no port for experiment {}", index))?;
                match dispatcher.watch(&names[index], port, dry_run) {
                    Ok(report) => writeln!(out, "{}", report)?,
                    Err(err) if err.is_structural() => return Err(err.into()),
                    Err(err) => writeln!(out, " > {} FAILED. {}", names[index], err)?,
                }
                watched += 1;
            }
            _ => {}
        }
        show_numbered(names, out)?;
    }
    writeln!(out, "____\nDONE.")?;
    Ok(watched)
}

fn show_numbered(names: &[String], out: &mut dyn Write) -> io::Result<()> {
    for (index, name) in names.iter().enumerate() {
        writeln!(out, "{:3} {}", index, name)?;
    }
    Ok(())
}

fn cluster_distributor(
    settings: &RunnerSettings,
    cancel: CancelToken,
) -> ClusterDistributor<SshTransport> {
    let transport = SshTransport::new(
        settings.remote.ssh_program.clone(),
        settings.remote.user.clone(),
    );
    ClusterDistributor::new(transport, settings.connect_timeout()).with_cancel(cancel)
}

fn cluster_output(command: &str, report: &ClusterReport, json: bool) -> Result<Option<Value>> {
    if json {
        return Ok(Some(json!({
            "ok": true,
            "command": command,
            "report": serde_json::to_value(report)?
        })));
    }
    for host in &report.hosts {
        println!("{}", host);
    }
    if report.cancelled {
        println!("interrupted: true");
    }
    println!("unreachable: {}", report.unreachable());
    Ok(None)
}

fn print_batch_summary(batch: &BatchReport) {
    if batch.cancelled {
        println!("interrupted: true");
    }
    println!("jobs: {}", batch.reports.len());
    println!("failures: {}", batch.failures());
    println!("next_port: {}", batch.next_port);
}

fn join_indices(indices: &[u32]) -> String {
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Conduct { json, .. }
        | Commands::Tournament { json, .. }
        | Commands::Status { json, .. }
        | Commands::List { json, .. }
        | Commands::Groups { json, .. }
        | Commands::Record { json, .. }
        | Commands::Distribute { json, .. }
        | Commands::Survey { json, .. }
        | Commands::Sweep { json, .. } => *json,
        Commands::Watch { .. } => false,
    }
}
