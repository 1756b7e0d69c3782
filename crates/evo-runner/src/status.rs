use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::catalog::{self, MaterializedExperiment};
use crate::config::{self, Status};
use crate::error::Result;
use crate::settings::FileNames;

/// Progress of one materialized experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRow {
    pub name: String,
    pub percent: u64,
    pub current: u64,
    pub max_trials: u64,
    pub status: Status,
    pub last_modified: Option<DateTime<Utc>>,
}

impl StatusRow {
    /// Exactly 100%; a progress log longer than `MAX_TRIALS` is not "OK.".
    pub fn is_complete(&self) -> bool {
        self.percent == 100
    }

    fn from_experiment(
        root: &Path,
        exp: &MaterializedExperiment,
        files: &FileNames,
    ) -> Result<Self> {
        let max_trials = config::read_max_trials(&exp.config_path)?;
        let status = config::read_status(&exp.config_path)?;
        let progress_log = exp.path.join(&files.progress_log);
        let current = config::read_count(&progress_log)?;
        let last_modified = std::fs::metadata(&progress_log)
            .or_else(|_| std::fs::metadata(&exp.path))
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        Ok(Self {
            name: exp.relative_to(root).to_string_lossy().into_owned(),
            percent: config::completion_percent(current, max_trials),
            current,
            max_trials,
            status,
            last_modified,
        })
    }
}

impl fmt::Display for StatusRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:32} {:3}% ({:6}/{:6}) {}",
            self.name, self.percent, self.current, self.max_trials, self.status
        )?;
        if self.is_complete() {
            f.write_str(" OK.")?;
        }
        Ok(())
    }
}

/// One row per experiment under `root` whose directory name contains
/// `filter`. Experiments with unreadable configs are logged and left out.
pub fn status_report(root: &Path, files: &FileNames, filter: Option<&str>) -> Vec<StatusRow> {
    catalog::list_materialized(root, &files.config)
        .iter()
        .filter(|exp| filter.map_or(true, |f| exp.dir_name.contains(f)))
        .filter_map(|exp| match StatusRow::from_experiment(root, exp, files) {
            Ok(row) => Some(row),
            Err(err) => {
                tracing::warn!(experiment = %exp.path.display(), "{}", err);
                None
            }
        })
        .collect()
}

/// Names (relative to `root`) of the experiments `list` and `watch` offer:
/// completed ones, plus running ones with `include_running`, whose directory
/// name contains `filter`.
pub fn selectable(
    root: &Path,
    files: &FileNames,
    filter: Option<&str>,
    include_running: bool,
) -> Vec<String> {
    let found = catalog::list_materialized(root, &files.config)
        .into_iter()
        .filter(|exp| filter.map_or(true, |f| exp.dir_name.contains(f)))
        .collect();
    catalog::filter_by_status(found, wanted_statuses(include_running))
        .iter()
        .map(|exp| exp.relative_to(root).to_string_lossy().into_owned())
        .collect()
}

/// Which statuses `list` admits: completed only, or anything started.
pub fn wanted_statuses(include_running: bool) -> &'static [Status] {
    if include_running {
        &[Status::Running, Status::Completed]
    } else {
        &[Status::Completed]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn experiment(root: &Path, rel: &str, conf: &str, progress_lines: usize) {
        let dir = root.join(rel);
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("evolution.conf"), conf).expect("conf");
        if progress_lines > 0 {
            fs::write(dir.join("evolution.log"), "gen\n".repeat(progress_lines)).expect("log");
        }
    }

    #[test]
    fn report_shows_percent_and_ok_tag() {
        let tmp = tempfile::tempdir().expect("tempdir");
        experiment(tmp.path(), "r/0_r_walk", "STATUS = 2\nMAX_TRIALS = 4\n", 4);
        experiment(tmp.path(), "r/1_r_walk", "STATUS = 1\nMAX_TRIALS = 4\n", 1);

        let rows = status_report(tmp.path(), &FileNames::default(), None);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "r/0_r_walk");
        assert_eq!(rows[0].percent, 100);
        assert!(rows[0]
            .to_string()
            .ends_with("100% (     4/     4) completed OK."));
        assert!(rows[1].to_string().ends_with(" 25% (     1/     4) running"));
        assert_eq!(rows[1].percent, 25);
        assert_eq!(rows[1].status, Status::Running);
        assert!(rows[1].last_modified.is_some());
    }

    #[test]
    fn zero_max_trials_does_not_divide_by_zero() {
        let tmp = tempfile::tempdir().expect("tempdir");
        experiment(tmp.path(), "r/0_r_walk", "STATUS = 0\n", 0);
        let rows = status_report(tmp.path(), &FileNames::default(), None);
        assert_eq!(rows[0].max_trials, 0);
        assert_eq!(rows[0].current, 0);
        assert_eq!(rows[0].percent, 0);
    }

    #[test]
    fn overshooting_progress_is_not_ok() {
        let tmp = tempfile::tempdir().expect("tempdir");
        experiment(tmp.path(), "r/0_r_walk", "STATUS = 2\nMAX_TRIALS = 4\n", 5);
        let rows = status_report(tmp.path(), &FileNames::default(), None);
        assert_eq!(rows[0].percent, 125);
        assert!(!rows[0].is_complete());
        assert!(rows[0].to_string().ends_with("125% (     5/     4) completed"));
    }

    #[test]
    fn selectable_filters_by_status_and_name() {
        let tmp = tempfile::tempdir().expect("tempdir");
        experiment(tmp.path(), "r/0_r_walk", "STATUS = 2\n", 0);
        experiment(tmp.path(), "r/1_r_walk", "STATUS = 1\n", 0);
        experiment(tmp.path(), "r/0_r_crawl", "STATUS = 2\n", 0);
        experiment(tmp.path(), "r/2_r_walk", "STATUS = 0\n", 0);
        let files = FileNames::default();

        assert_eq!(
            selectable(tmp.path(), &files, Some("walk"), false),
            vec!["r/0_r_walk"]
        );
        assert_eq!(
            selectable(tmp.path(), &files, Some("walk"), true),
            vec!["r/0_r_walk", "r/1_r_walk"]
        );
        assert_eq!(selectable(tmp.path(), &files, None, false).len(), 2);
    }

    #[test]
    fn filter_matches_directory_names() {
        let tmp = tempfile::tempdir().expect("tempdir");
        experiment(tmp.path(), "r/0_r_walk", "MAX_TRIALS = 1\n", 0);
        experiment(tmp.path(), "r/0_r_crawl", "MAX_TRIALS = 1\n", 0);
        let rows = status_report(tmp.path(), &FileNames::default(), Some("crawl"));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "r/0_r_crawl");
    }
}
