//! State accessor over the shared data directory.
//!
//! All cross-process coordination goes through the filesystem: a directory's
//! presence marks an experiment as run, its mtime drives tournament staleness.
//! Both guarantees are advisory. Two orchestrators racing on the same
//! experiment can both launch it; nothing here is linearizable.

use std::fs;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::Path;
use std::time::SystemTime;

use chrono::Utc;

use crate::error::Result;

pub trait ExperimentStore {
    /// Presence of the directory is the "has run at least once" signal.
    fn is_materialized(&self, dir: &Path) -> bool;

    fn modified_at(&self, dir: &Path) -> Result<SystemTime>;

    fn ensure_dir(&self, dir: &Path) -> Result<()>;

    /// Up to `limit` leading records of a line-oriented log.
    fn read_head(&self, path: &Path, limit: usize) -> Result<Vec<String>>;

    fn write_lines(&self, path: &Path, lines: &[String]) -> Result<()>;

    fn write_text(&self, path: &Path, text: &str) -> Result<()>;

    /// Removes the regular files directly inside `dir`, leaving
    /// subdirectories and their contents alone. Returns the number removed.
    fn clear_files(&self, dir: &Path) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsStore;

impl ExperimentStore for FsStore {
    fn is_materialized(&self, dir: &Path) -> bool {
        dir.is_dir()
    }

    fn modified_at(&self, dir: &Path) -> Result<SystemTime> {
        Ok(fs::metadata(dir)?.modified()?)
    }

    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        ensure_dir(dir)
    }

    fn read_head(&self, path: &Path, limit: usize) -> Result<Vec<String>> {
        let file = fs::File::open(path)?;
        let mut out = Vec::with_capacity(limit);
        for line in BufReader::new(file).lines().take(limit) {
            out.push(line?);
        }
        Ok(out)
    }

    fn write_lines(&self, path: &Path, lines: &[String]) -> Result<()> {
        let mut bytes = Vec::new();
        for line in lines {
            bytes.extend_from_slice(line.as_bytes());
            bytes.push(b'\n');
        }
        atomic_write_bytes(path, &bytes)
    }

    fn write_text(&self, path: &Path, text: &str) -> Result<()> {
        atomic_write_bytes(path, text.as_bytes())
    }

    fn clear_files(&self, dir: &Path) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_head_stops_at_limit_and_tolerates_short_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("population.log");
        fs::write(&log, "a 1\nb 2\nc 3\n").expect("write");
        let store = FsStore;
        assert_eq!(store.read_head(&log, 2).expect("head"), vec!["a 1", "b 2"]);
        assert_eq!(store.read_head(&log, 10).expect("head").len(), 3);
        assert!(store.read_head(&dir.path().join("absent"), 1).is_err());
    }

    #[test]
    fn write_lines_terminates_every_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("nested").join("population.log");
        FsStore
            .write_lines(&log, &["x".to_string(), "y z".to_string()])
            .expect("write");
        assert_eq!(fs::read_to_string(&log).expect("read"), "x\ny z\n");
    }

    #[test]
    fn clear_files_is_shallow() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        fs::write(root.join("population.log"), "x\n").expect("write");
        fs::write(root.join("stdout.txt"), "").expect("write");
        fs::create_dir(root.join("frames")).expect("mkdir");
        fs::write(root.join("frames").join("0001.png"), "png").expect("write");

        let removed = FsStore.clear_files(root).expect("clear");
        assert_eq!(removed, 2);
        assert!(!root.join("population.log").exists());
        assert!(root.join("frames").join("0001.png").exists());
    }

    #[test]
    fn materialized_means_directory_present() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exp = dir.path().join("0_r_b");
        assert!(!FsStore.is_materialized(&exp));
        FsStore.ensure_dir(&exp).expect("mkdir");
        FsStore.ensure_dir(&exp).expect("idempotent");
        assert!(FsStore.is_materialized(&exp));
    }
}
