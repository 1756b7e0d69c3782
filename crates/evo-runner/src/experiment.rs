use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Identity of one trial: `{base}/{robot}/{trial}_{robot}_{behavior}/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ExperimentRef {
    pub robot: String,
    pub behavior: String,
    pub trial_index: u32,
    pub base_path: PathBuf,
}

impl ExperimentRef {
    pub fn new(
        base_path: impl Into<PathBuf>,
        robot: impl Into<String>,
        behavior: impl Into<String>,
        trial_index: u32,
    ) -> Self {
        Self {
            robot: robot.into(),
            behavior: behavior.into(),
            trial_index,
            base_path: base_path.into(),
        }
    }

    /// Canonical directory name, `{trial}_{robot}_{behavior}`.
    pub fn dir_name(&self) -> String {
        format!("{}_{}_{}", self.trial_index, self.robot, self.behavior)
    }

    /// Experiment name handed to the binary, relative to the data root.
    pub fn name(&self) -> String {
        format!("{}/{}", self.robot, self.dir_name())
    }

    pub fn category_dir(&self) -> PathBuf {
        self.base_path.join(&self.robot)
    }

    pub fn dir(&self) -> PathBuf {
        self.category_dir().join(self.dir_name())
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir().join(name)
    }

    pub fn with_trial(&self, trial_index: u32) -> Self {
        Self {
            trial_index,
            ..self.clone()
        }
    }

    /// Recovers a reference from a materialized directory laid out as
    /// `{base}/{robot}/{trial}_{robot}_{behavior}`.
    pub fn from_dir(dir: &Path) -> Option<Self> {
        let dir_name = dir.file_name()?.to_str()?;
        let category = dir.parent()?;
        let robot = category.file_name()?.to_str()?;
        let base = category.parent()?;
        let (index, rest) = split_trial_prefix(dir_name)?;
        let behavior = rest.strip_prefix(robot)?.strip_prefix('_')?;
        if behavior.is_empty() {
            return None;
        }
        Some(Self::new(base, robot, behavior, index))
    }
}

impl fmt::Display for ExperimentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A tournament lives at `{base}/{robot}/tournament/T_{robot}_{behavior}/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TournamentRef {
    pub robot: String,
    pub behavior: String,
    pub base_path: PathBuf,
}

impl TournamentRef {
    pub fn new(
        base_path: impl Into<PathBuf>,
        robot: impl Into<String>,
        behavior: impl Into<String>,
    ) -> Self {
        Self {
            robot: robot.into(),
            behavior: behavior.into(),
            base_path: base_path.into(),
        }
    }

    pub fn dir_name(&self) -> String {
        format!("T_{}_{}", self.robot, self.behavior)
    }

    pub fn name(&self) -> String {
        format!("{}/tournament/{}", self.robot, self.dir_name())
    }

    pub fn dir(&self) -> PathBuf {
        self.base_path.join(self.name())
    }

    /// The sibling trial `index` feeding this tournament.
    pub fn constituent(&self, trial_index: u32) -> ExperimentRef {
        ExperimentRef::new(&self.base_path, &self.robot, &self.behavior, trial_index)
    }
}

impl fmt::Display for TournamentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Splits `{digits}_{rest}` into the numeric trial index and `rest`.
pub fn split_trial_prefix(dir_name: &str) -> Option<(u32, &str)> {
    let (digits, rest) = dir_name.split_once('_')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) || rest.is_empty() {
        return None;
    }
    Some((digits.parse().ok()?, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_names_follow_layout() {
        let exp = ExperimentRef::new("/data/exp", "gretchen", "walk_fw", 3);
        assert_eq!(exp.dir_name(), "3_gretchen_walk_fw");
        assert_eq!(exp.name(), "gretchen/3_gretchen_walk_fw");
        assert_eq!(exp.dir(), PathBuf::from("/data/exp/gretchen/3_gretchen_walk_fw"));
        assert_eq!(exp.with_trial(0).dir_name(), "0_gretchen_walk_fw");
    }

    #[test]
    fn tournament_names_follow_layout() {
        let t = TournamentRef::new("/data/exp", "gretchen", "walk");
        assert_eq!(t.name(), "gretchen/tournament/T_gretchen_walk");
        assert_eq!(
            t.constituent(2).dir(),
            PathBuf::from("/data/exp/gretchen/2_gretchen_walk")
        );
    }

    #[test]
    fn from_dir_recovers_underscored_robot_names() {
        let exp = ExperimentRef::new("/data/exp", "_scrtst", "rock_fast", 12);
        let parsed = ExperimentRef::from_dir(&exp.dir()).expect("parsable");
        assert_eq!(parsed, exp);
    }

    #[test]
    fn from_dir_rejects_foreign_names() {
        assert!(ExperimentRef::from_dir(Path::new("/data/exp/gretchen/notes")).is_none());
        assert!(ExperimentRef::from_dir(Path::new("/data/exp/gretchen/1_other_walk")).is_none());
        assert!(ExperimentRef::from_dir(Path::new("/data/exp/gretchen/1_gretchen_")).is_none());
    }

    #[test]
    fn split_trial_prefix_requires_digits() {
        assert_eq!(split_trial_prefix("12_a_b"), Some((12, "a_b")));
        assert_eq!(split_trial_prefix("x12_a"), None);
        assert_eq!(split_trial_prefix("12"), None);
        assert_eq!(split_trial_prefix("_a"), None);
        assert_eq!(split_trial_prefix("7_"), None);
    }
}
