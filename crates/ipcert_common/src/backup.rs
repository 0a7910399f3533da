//! Backup Manager
//!
//! Snapshots live under `<backup root>/<type>/<type>-<YYYYmmdd-HHMMSS-ffffff>`.
//! A snapshot is a plain file copy for single files and a directory tree for
//! directories (symlinks are preserved, so certbot's `live/` links survive).
//! Config, certificate and manual snapshots are rotated to `max_backups`;
//! emergency snapshots are never rotated.

use std::fmt;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{NaiveDateTime, Utc};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{IpcertError, Result};
use crate::report::RunReport;

/// Timestamp portion of a snapshot name
const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S-%6f";
const STAMP_LEN: usize = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupKind {
    Config,
    Certificate,
    Manual,
    Emergency,
}

impl BackupKind {
    pub const ALL: [BackupKind; 4] = [
        BackupKind::Config,
        BackupKind::Certificate,
        BackupKind::Manual,
        BackupKind::Emergency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Config => "config",
            BackupKind::Certificate => "certificate",
            BackupKind::Manual => "manual",
            BackupKind::Emergency => "emergency",
        }
    }

    /// Emergency snapshots are kept until removed by hand
    pub fn is_rotated(&self) -> bool {
        !matches!(self, BackupKind::Emergency)
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "config" => Ok(BackupKind::Config),
            "certificate" | "cert" => Ok(BackupKind::Certificate),
            "manual" => Ok(BackupKind::Manual),
            "emergency" => Ok(BackupKind::Emergency),
            other => Err(format!("unknown backup type: {}", other)),
        }
    }
}

/// One snapshot on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub kind: BackupKind,
    pub name: String,
    pub path: PathBuf,
    /// When the source was snapshotted (UTC, from the name)
    pub taken_at: NaiveDateTime,
}

impl BackupRecord {
    fn from_entry(kind: BackupKind, path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_string();
        let stamp = name.strip_prefix(kind.as_str())?.strip_prefix('-')?;
        let stamp = stamp.get(..STAMP_LEN)?;
        let taken_at = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
        Some(Self {
            kind,
            name,
            path,
            taken_at,
        })
    }

    pub fn is_dir(&self) -> bool {
        self.path.is_dir()
    }
}

/// Creates, rotates and restores snapshots
#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
    max_backups: usize,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>, max_backups: usize) -> Self {
        Self {
            root: root.into(),
            max_backups: max_backups.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kind_dir(&self, kind: BackupKind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    /// Pick a fresh snapshot path for `kind`
    fn next_path(&self, kind: BackupKind) -> PathBuf {
        let dir = self.kind_dir(kind);
        let base = format!("{}-{}", kind, Utc::now().format(STAMP_FORMAT));
        let mut candidate = dir.join(&base);
        let mut n = 1;
        while candidate.exists() {
            candidate = dir.join(format!("{}-{}", base, n));
            n += 1;
        }
        candidate
    }

    /// Copy `source` into a new snapshot, then rotate that type
    pub fn backup(&self, source: &Path, kind: BackupKind) -> Result<BackupRecord> {
        if !source.exists() {
            return Err(IpcertError::io(
                source,
                std::io::Error::new(std::io::ErrorKind::NotFound, "backup source missing"),
            ));
        }

        let dir = self.kind_dir(kind);
        fs::create_dir_all(&dir).map_err(|e| IpcertError::io(&dir, e))?;

        let target = self.next_path(kind);
        copy_any(source, &target)?;

        let record = BackupRecord::from_entry(kind, target.clone()).ok_or_else(|| {
            IpcertError::io(
                &target,
                std::io::Error::new(std::io::ErrorKind::InvalidData, "unparseable backup name"),
            )
        })?;
        info!(target: "audit", "backup created: {} from {}", record.name, source.display());

        if kind.is_rotated() {
            self.rotate(kind)?;
        }
        Ok(record)
    }

    /// Backup that never fails the caller; problems land in the report
    pub fn backup_best_effort(
        &self,
        source: &Path,
        kind: BackupKind,
        report: &mut RunReport,
    ) -> Option<BackupRecord> {
        match self.backup(source, kind) {
            Ok(record) => Some(record),
            Err(e) => {
                report.warn(format!("{} backup of {} failed: {}", kind, source.display(), e));
                None
            }
        }
    }

    /// Snapshot several labelled sources into one emergency folder.
    ///
    /// Missing sources are skipped; copy errors are recorded but do not stop
    /// the remaining sources from being saved.
    pub fn snapshot_emergency(
        &self,
        sources: &[(&str, &Path)],
        report: &mut RunReport,
    ) -> Result<BackupRecord> {
        let dir = self.kind_dir(BackupKind::Emergency);
        fs::create_dir_all(&dir).map_err(|e| IpcertError::io(&dir, e))?;

        let folder = self.next_path(BackupKind::Emergency);
        fs::create_dir(&folder).map_err(|e| IpcertError::io(&folder, e))?;

        for (label, source) in sources {
            if !source.exists() {
                debug!("emergency snapshot: {} missing, skipped", source.display());
                continue;
            }
            if let Err(e) = copy_any(source, &folder.join(label)) {
                report.warn(format!("emergency snapshot of {} incomplete: {}", label, e));
            }
        }

        info!(target: "audit", "emergency snapshot created at {}", folder.display());
        BackupRecord::from_entry(BackupKind::Emergency, folder.clone()).ok_or_else(|| {
            IpcertError::io(
                &folder,
                std::io::Error::new(std::io::ErrorKind::InvalidData, "unparseable backup name"),
            )
        })
    }

    /// Snapshots of `kind`, newest first
    pub fn list(&self, kind: BackupKind) -> Result<Vec<BackupRecord>> {
        let dir = self.kind_dir(kind);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records: Vec<BackupRecord> = fs::read_dir(&dir)
            .map_err(|e| IpcertError::io(&dir, e))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| BackupRecord::from_entry(kind, entry.path()))
            .collect();
        records.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(records)
    }

    pub fn latest(&self, kind: BackupKind) -> Result<Option<BackupRecord>> {
        Ok(self.list(kind)?.into_iter().next())
    }

    /// Delete everything past `max_backups`, oldest first
    pub fn rotate(&self, kind: BackupKind) -> Result<usize> {
        let records = self.list(kind)?;
        let mut removed = 0;
        for record in records.iter().skip(self.max_backups) {
            let result = if record.is_dir() {
                fs::remove_dir_all(&record.path)
            } else {
                fs::remove_file(&record.path)
            };
            match result {
                Ok(()) => {
                    debug!("rotated out {}", record.name);
                    removed += 1;
                }
                Err(e) => warn!("Could not remove old backup {}: {}", record.name, e),
            }
        }
        Ok(removed)
    }

    /// Restore `name` (or the newest snapshot) of `kind` over `target`
    pub fn restore(
        &self,
        kind: BackupKind,
        name: Option<&str>,
        target: &Path,
    ) -> Result<BackupRecord> {
        let records = self.list(kind)?;
        let record = match name {
            Some(name) => records.into_iter().find(|r| r.name == name),
            None => records.into_iter().next(),
        }
        .ok_or(IpcertError::NoBackupFound(kind))?;

        if record.is_dir() {
            copy_any(&record.path, target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| IpcertError::io(parent, e))?;
            }
            // Copy next to the target then rename so a crash never leaves half a file
            let staging = target.with_extension("restore.tmp");
            fs::copy(&record.path, &staging).map_err(|e| IpcertError::io(&staging, e))?;
            fs::rename(&staging, target).map_err(|e| IpcertError::io(target, e))?;
        }

        info!(target: "audit", "restored {} backup {} to {}", kind, record.name, target.display());
        Ok(record)
    }
}

/// Copy a file, symlink or directory tree to `target`
fn copy_any(source: &Path, target: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(source).map_err(|e| IpcertError::io(source, e))?;
    if !meta.is_dir() {
        return copy_entry(source, target, &meta);
    }

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| source.to_path_buf());
            IpcertError::io(path, std::io::Error::other(e.to_string()))
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| IpcertError::io(entry.path(), std::io::Error::other(e.to_string())))?;
        let dest = target.join(relative);
        let meta = entry
            .path()
            .symlink_metadata()
            .map_err(|e| IpcertError::io(entry.path(), e))?;

        if meta.is_dir() {
            fs::create_dir_all(&dest).map_err(|e| IpcertError::io(&dest, e))?;
        } else {
            copy_entry(entry.path(), &dest, &meta)?;
        }
    }
    Ok(())
}

fn copy_entry(source: &Path, dest: &Path, meta: &fs::Metadata) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| IpcertError::io(parent, e))?;
    }
    if meta.file_type().is_symlink() {
        let link = fs::read_link(source).map_err(|e| IpcertError::io(source, e))?;
        if dest.symlink_metadata().is_ok() {
            fs::remove_file(dest).map_err(|e| IpcertError::io(dest, e))?;
        }
        symlink(&link, dest).map_err(|e| IpcertError::io(dest, e))?;
    } else {
        fs::copy(source, dest).map_err(|e| IpcertError::io(dest, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(max: usize) -> (TempDir, BackupManager, PathBuf) {
        let temp = TempDir::new().unwrap();
        let manager = BackupManager::new(temp.path().join("backups"), max);
        let source = temp.path().join("config.toml");
        fs::write(&source, "v0").unwrap();
        (temp, manager, source)
    }

    #[test]
    fn test_rotation_keeps_newest() {
        let (_temp, manager, source) = setup(3);
        let mut names = Vec::new();
        for i in 0..4 {
            fs::write(&source, format!("v{}", i)).unwrap();
            names.push(manager.backup(&source, BackupKind::Config).unwrap().name);
        }

        let left: Vec<String> = manager
            .list(BackupKind::Config)
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(left.len(), 3);
        assert!(!left.contains(&names[0]));
        assert_eq!(left[0], names[3]);
    }

    #[test]
    fn test_restore_latest_and_named() {
        let (temp, manager, source) = setup(10);
        let first = manager.backup(&source, BackupKind::Config).unwrap();
        fs::write(&source, "v1").unwrap();
        manager.backup(&source, BackupKind::Config).unwrap();

        let target = temp.path().join("restored.toml");
        manager.restore(BackupKind::Config, None, &target).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "v1");

        manager
            .restore(BackupKind::Config, Some(&first.name), &target)
            .unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "v0");
    }

    #[test]
    fn test_restore_without_backups() {
        let (temp, manager, _source) = setup(10);
        let err = manager
            .restore(BackupKind::Manual, None, &temp.path().join("x"))
            .unwrap_err();
        assert!(matches!(err, IpcertError::NoBackupFound(BackupKind::Manual)));
    }

    #[test]
    fn test_directory_backup_preserves_symlinks() {
        let (temp, manager, _source) = setup(10);
        let certs = temp.path().join("letsencrypt");
        fs::create_dir_all(certs.join("archive/203.0.113.9")).unwrap();
        fs::create_dir_all(certs.join("live/203.0.113.9")).unwrap();
        fs::write(certs.join("archive/203.0.113.9/cert1.pem"), "PEM").unwrap();
        symlink(
            "../../archive/203.0.113.9/cert1.pem",
            certs.join("live/203.0.113.9/cert.pem"),
        )
        .unwrap();

        let record = manager.backup(&certs, BackupKind::Certificate).unwrap();
        let link = record.path.join("live/203.0.113.9/cert.pem");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(link).unwrap(), "PEM");
    }

    #[test]
    fn test_emergency_snapshot_is_not_rotated() {
        let (temp, manager, source) = setup(1);
        let logs = temp.path().join("logs");
        fs::create_dir_all(&logs).unwrap();
        fs::write(logs.join("ipcert.log"), "line").unwrap();

        let mut report = RunReport::new();
        for _ in 0..3 {
            manager
                .snapshot_emergency(
                    &[
                        ("config.toml", source.as_path()),
                        ("logs", logs.as_path()),
                        ("letsencrypt", temp.path().join("absent").as_path()),
                    ],
                    &mut report,
                )
                .unwrap();
        }
        let snapshots = manager.list(BackupKind::Emergency).unwrap();
        assert_eq!(snapshots.len(), 3);
        assert!(snapshots[0].path.join("logs/ipcert.log").exists());
        assert!(report.is_clean());
    }

    #[test]
    fn test_names_are_stamped_in_utc() {
        let (_temp, manager, source) = setup(10);
        let record = manager.backup(&source, BackupKind::Manual).unwrap();
        let skew = Utc::now().naive_utc() - record.taken_at;
        assert!(skew.num_seconds().abs() < 60, "stamp {} is not UTC", record.taken_at);
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("cert".parse::<BackupKind>().unwrap(), BackupKind::Certificate);
        assert!("weekly".parse::<BackupKind>().is_err());
    }
}
