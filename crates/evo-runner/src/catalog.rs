//! Enumerating settings definitions and materialized experiments, and
//! ranking sibling trials by fitness.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::config::{self, Status};
use crate::error::{Result, RunnerError};
use crate::experiment::{split_trial_prefix, ExperimentRef};
use crate::settings::RunnerSettings;

/// Behavior names with a settings definition under `{settings_root}/{robot}`.
pub fn list_available(settings: &RunnerSettings, robot: &str) -> Result<Vec<String>> {
    definitions_in(&settings.settings_dir(robot), &settings.settings_ext)
}

/// Behavior names with a tournament definition under
/// `{settings_root}/{robot}/tournament`.
pub fn list_tournament_definitions(settings: &RunnerSettings, robot: &str) -> Result<Vec<String>> {
    definitions_in(&settings.settings_dir(robot).join("tournament"), &settings.settings_ext)
}

fn definitions_in(dir: &Path, ext: &str) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Err(RunnerError::NoSuchCategory(dir.to_path_buf()));
    }
    let suffix = format!(".{}", ext);
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if let Some(behavior) = name.strip_suffix(&suffix) {
            if !behavior.is_empty() {
                names.push(behavior.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaterializedExperiment {
    pub path: PathBuf,
    pub dir_name: String,
    /// Nesting below the scanned root, 1 for direct children.
    pub depth: usize,
    pub config_path: PathBuf,
    pub reference: Option<ExperimentRef>,
}

impl MaterializedExperiment {
    pub fn status(&self) -> Result<Status> {
        config::read_status(&self.config_path)
    }

    /// Path relative to the scanned root, e.g. `gretchen/0_gretchen_walk`.
    pub fn relative_to(&self, root: &Path) -> PathBuf {
        self.path
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| self.path.clone())
    }
}

/// Recursively collects every directory holding a `config_name` file.
///
/// Experiment directories are not descended into; anything else is treated
/// as a grouping folder. Unreadable directories contribute nothing.
pub fn list_materialized(base: &Path, config_name: &str) -> Vec<MaterializedExperiment> {
    let mut found = Vec::new();
    let mut walker = WalkDir::new(base)
        .min_depth(1)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(root = %base.display(), "error while scanning folders: {}", err);
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let config_path = entry.path().join(config_name);
        if !config_path.is_file() {
            continue;
        }
        found.push(MaterializedExperiment {
            path: entry.path().to_path_buf(),
            dir_name: entry.file_name().to_string_lossy().into_owned(),
            depth: entry.depth(),
            config_path,
            reference: ExperimentRef::from_dir(entry.path()),
        });
        walker.skip_current_dir();
    }
    found
}

/// Keeps experiments whose status is one of `wanted`; unreadable configs are
/// logged and dropped.
pub fn filter_by_status(
    experiments: Vec<MaterializedExperiment>,
    wanted: &[Status],
) -> Vec<MaterializedExperiment> {
    experiments
        .into_iter()
        .filter(|exp| match exp.status() {
            Ok(status) => wanted.contains(&status),
            Err(err) => {
                tracing::warn!(experiment = %exp.path.display(), "{}", err);
                false
            }
        })
        .collect()
}

/// Sibling trials differing only in their leading index: `{parent}/{}_{suffix}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TrialTemplate {
    pub parent: PathBuf,
    pub suffix: String,
}

impl TrialTemplate {
    pub fn path_for(&self, trial_index: u32) -> PathBuf {
        self.parent.join(format!("{}_{}", trial_index, self.suffix))
    }
}

impl fmt::Display for TrialTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{{}}_{}", self.parent.display(), self.suffix)
    }
}

/// Groups experiments by template, keeping trial indices in scan order.
/// Directories not named `{index}_{name}` are skipped.
pub fn group_by_behavior(
    experiments: &[MaterializedExperiment],
) -> BTreeMap<TrialTemplate, Vec<u32>> {
    let mut groups: BTreeMap<TrialTemplate, Vec<u32>> = BTreeMap::new();
    for exp in experiments {
        let Some((index, suffix)) = split_trial_prefix(&exp.dir_name) else {
            continue;
        };
        let Some(parent) = exp.path.parent() else {
            continue;
        };
        let key = TrialTemplate {
            parent: parent.to_path_buf(),
            suffix: suffix.to_string(),
        };
        groups.entry(key).or_default().push(index);
    }
    groups
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ranking {
    pub best: u32,
    pub median: u32,
    pub worst: u32,
    /// `(trial index, fitness sum)` sorted by descending sum.
    pub ranked: Vec<(u32, f64)>,
}

/// Ranks trials by the sum of their fitness log.
///
/// `median` is taken at position `n/2 - 1` of the descending order, wrapping
/// to the last entry when that is negative (`n == 1`). For odd `n` this is
/// not the statistical median; existing result tables depend on it.
pub fn select_best_median_worst(
    template: &TrialTemplate,
    indices: &[u32],
    fitness_log: &str,
) -> Result<Ranking> {
    if indices.is_empty() {
        return Err(RunnerError::EmptyGroup(template.to_string()));
    }
    let mut ranked = Vec::with_capacity(indices.len());
    for &index in indices {
        let path = template.path_for(index).join(fitness_log);
        let sum = fitness_sum(&path)?;
        tracing::debug!(trial = index, fitness = sum, "read {}", path.display());
        ranked.push((index, sum));
    }
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    let n = ranked.len();
    let median_pos = match (n / 2).checked_sub(1) {
        Some(pos) => pos,
        None => n - 1,
    };
    Ok(Ranking {
        best: ranked[0].0,
        median: ranked[median_pos].0,
        worst: ranked[n - 1].0,
        ranked,
    })
}

/// Sum of the first column of a fitness log, one value per line.
pub fn fitness_sum(path: &Path) -> Result<f64> {
    let text = fs::read_to_string(path).map_err(|e| RunnerError::MissingFitnessLog {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut sum = 0.0;
    for (lineno, line) in text.lines().enumerate() {
        let Some(token) = line.split_whitespace().next() else {
            continue;
        };
        let value: f64 = token.parse().map_err(|_| RunnerError::MissingFitnessLog {
            path: path.to_path_buf(),
            reason: format!("line {}: not a number: {:?}", lineno + 1, token),
        })?;
        sum += value;
    }
    Ok(sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_experiment(root: &Path, rel: &str, config: &str) -> PathBuf {
        let dir = root.join(rel);
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("evolution.conf"), config).expect("write config");
        dir
    }

    fn write_fitness(dir: &Path, values: &[f64]) {
        let body: String = values.iter().map(|v| format!("{}\n", v)).collect();
        fs::write(dir.join("fitness.log"), body).expect("write fitness");
    }

    #[test]
    fn list_available_strips_extension_and_sorts() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let settings = RunnerSettings {
            settings_root: tmp.path().to_path_buf(),
            ..RunnerSettings::default()
        };
        let dir = tmp.path().join("gretchen");
        fs::create_dir_all(dir.join("tournament")).expect("mkdir");
        fs::write(dir.join("walk.setting"), "").expect("write");
        fs::write(dir.join("crawl.setting"), "").expect("write");
        fs::write(dir.join("notes.txt"), "").expect("write");

        assert_eq!(
            list_available(&settings, "gretchen").expect("list"),
            vec!["crawl".to_string(), "walk".to_string()]
        );
        let err = list_available(&settings, "nobody").expect_err("missing category");
        assert!(matches!(err, RunnerError::NoSuchCategory(_)));

        fs::write(dir.join("tournament").join("walk.setting"), "").expect("write");
        assert_eq!(
            list_tournament_definitions(&settings, "gretchen").expect("list"),
            vec!["walk".to_string()]
        );
    }

    #[test]
    fn list_materialized_recurses_through_grouping_folders() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        make_experiment(root, "gretchen/0_gretchen_walk", "STATUS = 2\n");
        make_experiment(root, "gretchen/1_gretchen_walk", "STATUS = 1\n");
        make_experiment(root, "archive/2016/old/0_fred_crawl", "STATUS = 0\n");
        // nested inside an experiment: never visited
        make_experiment(root, "gretchen/1_gretchen_walk/inner", "STATUS = 2\n");
        fs::create_dir_all(root.join("empty/group")).expect("mkdir");

        let found = list_materialized(root, "evolution.conf");
        let rels: Vec<PathBuf> = found.iter().map(|e| e.relative_to(root)).collect();
        assert_eq!(
            rels,
            vec![
                PathBuf::from("archive/2016/old/0_fred_crawl"),
                PathBuf::from("gretchen/0_gretchen_walk"),
                PathBuf::from("gretchen/1_gretchen_walk"),
            ]
        );
        assert_eq!(found[0].depth, 4);
        assert_eq!(
            found[1].reference.as_ref().map(|r| r.behavior.as_str()),
            Some("walk")
        );
    }

    #[test]
    fn list_materialized_of_missing_root_is_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(list_materialized(&tmp.path().join("absent"), "evolution.conf").is_empty());
    }

    #[test]
    fn filter_by_status_selects_completed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        make_experiment(root, "r/0_r_a", "STATUS = 2\n");
        make_experiment(root, "r/1_r_a", "STATUS = 1\n");
        make_experiment(root, "r/2_r_a", "MAX_TRIALS = 3\n");
        let all = list_materialized(root, "evolution.conf");

        let done = filter_by_status(all.clone(), &[Status::Completed]);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].dir_name, "0_r_a");

        let some = filter_by_status(all, &[Status::Completed, Status::Running]);
        assert_eq!(some.len(), 2);
    }

    #[test]
    fn group_by_behavior_replaces_leading_index() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        for rel in [
            "r/0_r_walk",
            "r/1_r_walk",
            "r/0_r_crawl",
            "r/notes_r_walk",
            "r/T_r_walk",
        ] {
            make_experiment(root, rel, "STATUS = 2\n");
        }
        let groups = group_by_behavior(&list_materialized(root, "evolution.conf"));
        assert_eq!(groups.len(), 2);
        let walk = TrialTemplate {
            parent: root.join("r"),
            suffix: "r_walk".to_string(),
        };
        assert_eq!(groups.get(&walk), Some(&vec![0, 1]));
        assert_eq!(walk.path_for(7), root.join("r").join("7_r_walk"));
        assert!(walk.to_string().ends_with("/r/{}_r_walk"));
    }

    #[test]
    fn ranking_reproduces_median_position() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        let sums = [(0u32, 10.0), (1, 30.0), (2, 20.0)];
        for (idx, sum) in sums {
            let dir = make_experiment(root, &format!("r/{}_r_walk", idx), "STATUS = 2\n");
            write_fitness(&dir, &[sum / 2.0, sum / 2.0]);
        }
        let template = TrialTemplate {
            parent: root.join("r"),
            suffix: "r_walk".to_string(),
        };
        let ranking =
            select_best_median_worst(&template, &[0, 1, 2], "fitness.log").expect("ranking");
        assert_eq!(ranking.best, 1);
        assert_eq!(ranking.worst, 0);
        assert_eq!(ranking.median, 1);
        assert_eq!(
            ranking.ranked.iter().map(|r| r.0).collect::<Vec<_>>(),
            vec![1, 2, 0]
        );
    }

    #[test]
    fn ranking_median_for_even_and_single_groups() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        for (idx, sum) in [(0u32, 1.0), (1, 4.0), (2, 3.0), (3, 2.0)] {
            let dir = make_experiment(root, &format!("r/{}_r_b", idx), "");
            write_fitness(&dir, &[sum]);
        }
        let template = TrialTemplate {
            parent: root.join("r"),
            suffix: "r_b".to_string(),
        };
        let four = select_best_median_worst(&template, &[0, 1, 2, 3], "fitness.log")
            .expect("ranking");
        // descending: 1, 2, 3, 0 -> position 1
        assert_eq!((four.best, four.median, four.worst), (1, 2, 0));

        let one = select_best_median_worst(&template, &[3], "fitness.log").expect("ranking");
        assert_eq!((one.best, one.median, one.worst), (3, 3, 3));
    }

    #[test]
    fn ranking_fails_on_missing_fitness_log() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        let dir = make_experiment(root, "r/0_r_b", "");
        write_fitness(&dir, &[1.0]);
        make_experiment(root, "r/1_r_b", "");
        let template = TrialTemplate {
            parent: root.join("r"),
            suffix: "r_b".to_string(),
        };
        let err = select_best_median_worst(&template, &[0, 1], "fitness.log")
            .expect_err("missing log");
        assert!(matches!(err, RunnerError::MissingFitnessLog { .. }));
        let err = select_best_median_worst(&template, &[], "fitness.log").expect_err("empty");
        assert!(matches!(err, RunnerError::EmptyGroup(_)));
    }

    #[test]
    fn fitness_sum_reads_first_column() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let log = tmp.path().join("fitness.log");
        fs::write(&log, "1.5 0.2\n2.5 9\n\n-1\n").expect("write");
        assert_eq!(fitness_sum(&log).expect("sum"), 3.0);
        fs::write(&log, "1.5\nnan-ish\n").expect("write");
        assert!(fitness_sum(&log).is_err());
    }
}
