//! Orchestrator settings, loaded from a YAML file next to the binary.
//!
//! Every field has a default so an absent file (or an absent key) yields the
//! layout the evolution tooling has always assumed.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cluster::Host;
use crate::error::{Result, RunnerError};

pub const DEFAULT_SETTINGS_FILE: &str = "evo.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    pub binary: PathBuf,
    pub data_root: PathBuf,
    pub settings_root: PathBuf,
    pub settings_ext: String,
    pub nice: i32,
    pub port_start: u16,
    /// Ports the allocator steps over (each hit costs one extra increment).
    pub reserved_ports: Vec<u16>,
    pub files: FileNames,
    pub remote: RemoteSettings,
    pub hosts: Vec<Host>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("./bin/Release/evolution"),
            data_root: PathBuf::from("../data/exp"),
            settings_root: PathBuf::from("./settings"),
            settings_ext: "setting".to_string(),
            nice: 19,
            port_start: 8000,
            reserved_ports: Vec::new(),
            files: FileNames::default(),
            remote: RemoteSettings::default(),
            hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileNames {
    pub config: String,
    pub progress_log: String,
    pub fitness_log: String,
    pub population_log: String,
    pub stdout: String,
    pub stderr: String,
    pub record_log: String,
}

impl Default for FileNames {
    fn default() -> Self {
        Self {
            config: "evolution.conf".to_string(),
            progress_log: "evolution.log".to_string(),
            fitness_log: "fitness.log".to_string(),
            population_log: "population.log".to_string(),
            stdout: "stdout.txt".to_string(),
            stderr: "stderr.txt".to_string(),
            record_log: "data.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub ssh_program: String,
    pub user: Option<String>,
    pub connect_timeout_secs: u64,
    pub pacing_secs: u64,
    pub instances_per_host: u32,
    pub workdir: String,
    /// Placeholders: `{workdir}`, `{robot}`, `{number}`.
    pub launch_template: String,
    pub process_names: Vec<String>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            user: None,
            connect_timeout_secs: 10,
            pacing_secs: 3,
            instances_per_host: 1,
            workdir: "work/diss/evolution".to_string(),
            launch_template:
                "cd {workdir} && nohup evo conduct -r {robot} -n {number} --yes </dev/null >/dev/null 2>&1 &"
                    .to_string(),
            process_names: vec![
                "evo".to_string(),
                "simloid".to_string(),
                "evolution".to_string(),
            ],
        }
    }
}

impl RunnerSettings {
    /// Loads settings from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "settings file absent, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        Self::from_yaml(&raw).map_err(|source| RunnerError::Settings {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(raw: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    pub fn settings_dir(&self, robot: &str) -> PathBuf {
        self.settings_root.join(robot)
    }

    pub fn settings_file(&self, robot: &str, behavior: &str) -> PathBuf {
        self.settings_dir(robot)
            .join(format!("{}.{}", behavior, self.settings_ext))
    }

    pub fn tournament_settings_file(&self, robot: &str, behavior: &str) -> PathBuf {
        self.settings_dir(robot)
            .join("tournament")
            .join(format!("{}.{}", behavior, self.settings_ext))
    }

    pub fn category_dir(&self, robot: &str) -> PathBuf {
        self.data_root.join(robot)
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.remote.connect_timeout_secs)
    }

    pub fn pacing(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.remote.pacing_secs)
    }

    /// Renders the remote launch command for `robot` repeated `number` times.
    pub fn launch_command(&self, robot: &str, number: u32) -> String {
        self.remote
            .launch_template
            .replace("{workdir}", &self.remote.workdir)
            .replace("{robot}", robot)
            .replace("{number}", &number.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_yields_defaults() {
        let settings = RunnerSettings::from_yaml("").expect("empty yaml");
        assert_eq!(settings, RunnerSettings::default());
        assert_eq!(settings.port_start, 8000);
        assert_eq!(settings.files.config, "evolution.conf");
    }

    #[test]
    fn partial_yaml_keeps_remaining_defaults() {
        let raw = "\
data_root: /srv/exp
reserved_ports: [8010]
remote:
  pacing_secs: 0
hosts:
  - name: gruenau5
    domain_suffix: .example.org
    weight: 120
";
        let settings = RunnerSettings::from_yaml(raw).expect("valid yaml");
        assert_eq!(settings.data_root, PathBuf::from("/srv/exp"));
        assert_eq!(settings.reserved_ports, vec![8010]);
        assert_eq!(settings.remote.pacing_secs, 0);
        assert_eq!(settings.remote.connect_timeout_secs, 10);
        assert_eq!(settings.nice, 19);
        assert_eq!(settings.hosts.len(), 1);
        assert_eq!(settings.hosts[0].address(), "gruenau5.example.org");
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = RunnerSettings::load(&dir.path().join("absent.yaml")).expect("defaults");
        assert_eq!(settings, RunnerSettings::default());
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("evo.yaml");
        fs::write(&path, "port_start: [not, a, port]\n").expect("write");
        let err = RunnerSettings::load(&path).expect_err("must fail");
        assert_eq!(err.code(), "invalid_settings");
        assert!(err.to_string().contains("evo.yaml"), "{}", err);
    }

    #[test]
    fn settings_paths_follow_layout() {
        let settings = RunnerSettings::default();
        assert_eq!(
            settings.settings_file("gretchen", "walk"),
            PathBuf::from("./settings/gretchen/walk.setting")
        );
        assert_eq!(
            settings.tournament_settings_file("gretchen", "walk"),
            PathBuf::from("./settings/gretchen/tournament/walk.setting")
        );
    }

    #[test]
    fn launch_command_fills_placeholders() {
        let settings = RunnerSettings::default();
        let cmd = settings.launch_command("gretchen", 4);
        assert!(cmd.starts_with("cd work/diss/evolution && nohup evo conduct -r gretchen -n 4"));
    }
}
