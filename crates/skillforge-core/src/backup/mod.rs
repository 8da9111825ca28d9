//! Backup/restore manager
//!
//! Snapshots the live SQLite file with `VACUUM INTO`, gzips it into a
//! per-day directory, applies per-kind retention and restores artifacts by
//! atomic rename.
//!
//! Layout: `<root>/<YYYY-MM-DD>/<YYYY-MM-DD_HH-MM>_<INC|FULL>.sqlite.gz`

use chrono::{Local, NaiveDateTime};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{Connection, OpenFlags};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::types::{BackupKind, BackupRecord, RetentionPolicy};

static ARTIFACT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}_\d{2}-\d{2})_(INC|FULL)\.sqlite\.gz$")
        .expect("artifact pattern is valid")
});

const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Timestamp format embedded in artifact names
pub const STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M";
const DAY_FORMAT: &str = "%Y-%m-%d";

/// File name for an artifact of `kind` taken at `stamp`
pub fn artifact_name(kind: BackupKind, stamp: &str) -> String {
    format!("{}_{}.sqlite.gz", stamp, kind.as_str())
}

/// Split an artifact file name into (timestamp, kind)
pub fn parse_artifact_name(name: &str) -> Option<(String, BackupKind)> {
    let caps = ARTIFACT_RE.captures(name)?;
    let kind = BackupKind::from_str(&caps[2])?;
    Some((caps[1].to_string(), kind))
}

/// A deletion that rotation could not perform
#[derive(Debug, Clone)]
pub struct RotationFailure {
    pub path: PathBuf,
    pub error: String,
}

/// What one rotation pass did
#[derive(Debug, Clone, Default)]
pub struct RotationReport {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<RotationFailure>,
}

/// Backup manager for a single database file
#[derive(Debug, Clone)]
pub struct BackupManager {
    db_path: PathBuf,
    root: PathBuf,
    policy: RetentionPolicy,
}

impl BackupManager {
    pub fn new(db_path: impl Into<PathBuf>, root: impl Into<PathBuf>, policy: RetentionPolicy) -> Self {
        Self {
            db_path: db_path.into(),
            root: root.into(),
            policy,
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Take a backup now
    pub fn backup(&self, kind: BackupKind) -> Result<BackupRecord> {
        self.backup_at(kind, Local::now().naive_local())
    }

    /// Take a backup stamped with `now`.
    ///
    /// A backup of the same kind in the same minute replaces the earlier one.
    pub fn backup_at(&self, kind: BackupKind, now: NaiveDateTime) -> Result<BackupRecord> {
        if !self.db_path.is_file() {
            return Err(CoreError::MissingDatabase(self.db_path.clone()));
        }

        let stamp = now.format(STAMP_FORMAT).to_string();
        let day_dir = self.root.join(now.format(DAY_FORMAT).to_string());
        fs::create_dir_all(&day_dir)?;

        let target = day_dir.join(artifact_name(kind, &stamp));
        let size_bytes = match self.write_artifact(&day_dir, &target) {
            Ok(size) => size,
            Err(e) => {
                remove_dir_if_empty(&day_dir);
                return Err(e);
            }
        };

        let record = BackupRecord {
            kind,
            file: target,
            timestamp: stamp,
            size_bytes,
        };
        info!(
            kind = %kind,
            file = %record.file.display(),
            size = record.size_bytes,
            "Backup created"
        );

        let report = self.rotate();
        if !report.failures.is_empty() {
            warn!(failures = report.failures.len(), "Backup rotation incomplete");
        }
        Ok(record)
    }

    /// Snapshot into a scratch dir, gzip into a partial file, rename into
    /// place. Scratch and partial files are removed on every path.
    fn write_artifact(&self, day_dir: &Path, target: &Path) -> Result<u64> {
        let scratch = tempfile::Builder::new()
            .prefix(".snapshot-")
            .tempdir_in(day_dir)?;
        let raw = scratch.path().join("snapshot.sqlite");
        snapshot_to(&self.db_path, &raw)?;

        let mut partial = tempfile::Builder::new()
            .prefix(".partial-")
            .suffix(".gz")
            .tempfile_in(day_dir)?;
        {
            let mut input = BufReader::new(File::open(&raw)?);
            let mut encoder = GzEncoder::new(partial.as_file_mut(), Compression::best());
            io::copy(&mut input, &mut encoder)?;
            encoder.finish()?;
        }
        partial.as_file().sync_all()?;

        let size = partial.as_file().metadata()?.len();
        if size == 0 {
            return Err(CoreError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "compressed snapshot is empty",
            )));
        }
        partial.persist(target).map_err(|e| CoreError::Io(e.error))?;
        debug!(raw = %raw.display(), "Snapshot compressed");
        Ok(size)
    }

    /// All backups, newest first, optionally restricted to one kind
    pub fn list(&self, kind: Option<BackupKind>) -> Result<Vec<BackupRecord>> {
        let days = match fs::read_dir(&self.root) {
            Ok(days) => days,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for day in days.flatten() {
            let dir = day.path();
            if !dir.is_dir() {
                continue;
            }
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Skipping unreadable backup directory");
                    continue;
                }
            };
            for entry in entries.flatten() {
                if !entry.file_type().is_ok_and(|t| t.is_file()) {
                    continue;
                }
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else {
                    continue;
                };
                let Some((timestamp, found)) = parse_artifact_name(name) else {
                    continue;
                };
                if kind.is_some_and(|k| k != found) {
                    continue;
                }
                let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
                records.push(BackupRecord {
                    kind: found,
                    file: entry.path(),
                    timestamp,
                    size_bytes,
                });
            }
        }

        records.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.kind.as_str().cmp(b.kind.as_str()))
        });
        Ok(records)
    }

    /// Enforce the retention policy. Never fails: each deletion is attempted
    /// independently and failures are logged and reported.
    pub fn rotate(&self) -> RotationReport {
        let mut report = RotationReport::default();

        for kind in BackupKind::ALL {
            let records = match self.list(Some(kind)) {
                Ok(records) => records,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Rotation could not list backups");
                    report.failures.push(RotationFailure {
                        path: self.root.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let keep = self.policy.keep_for(kind);
            for record in records.into_iter().skip(keep) {
                match fs::remove_file(&record.file) {
                    Ok(()) => {
                        debug!(file = %record.file.display(), "Rotated backup removed");
                        if let Some(dir) = record.file.parent() {
                            remove_dir_if_empty(dir);
                        }
                        report.removed.push(record.file);
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(file = %record.file.display(), error = %e, "Failed to remove rotated backup");
                        report.failures.push(RotationFailure {
                            path: record.file,
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        if !report.removed.is_empty() {
            info!(removed = report.removed.len(), "Backups rotated");
        }
        report
    }

    /// Replace the live database with the content of `file`.
    ///
    /// The artifact is decompressed next to the database, validated, and
    /// renamed over it. Until the rename the live file is untouched. Callers
    /// must make sure no connection is open on the database.
    pub fn restore(&self, file: &Path) -> Result<()> {
        let is_artifact = file
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_artifact_name)
            .is_some();
        if !is_artifact {
            return Err(CoreError::InvalidArtifact(file.to_path_buf()));
        }
        let input = File::open(file)?;

        let db_dir = match self.db_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut staged = tempfile::Builder::new()
            .prefix(".restore-")
            .suffix(".sqlite")
            .tempfile_in(db_dir)?;

        let mut decoder = GzDecoder::new(BufReader::new(input));
        io::copy(&mut decoder, staged.as_file_mut()).map_err(|e| decode_error(file, e))?;
        staged.as_file().sync_all()?;

        verify_sqlite(staged.path())?;

        // Staged files are created 0600; keep the live file's mode
        if let Ok(meta) = fs::metadata(&self.db_path) {
            fs::set_permissions(staged.path(), meta.permissions())?;
        }

        staged
            .persist(&self.db_path)
            .map_err(|e| CoreError::Io(e.error))?;

        for suffix in ["-wal", "-shm"] {
            let mut side = self.db_path.clone().into_os_string();
            side.push(suffix);
            let side = PathBuf::from(side);
            match fs::remove_file(&side) {
                Ok(()) => debug!(file = %side.display(), "Removed stale side file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(file = %side.display(), error = %e, "Failed to remove stale side file"),
            }
        }

        info!(file = %file.display(), db = %self.db_path.display(), "Database restored");
        Ok(())
    }
}

/// Consistent copy of a live database. `VACUUM INTO` reads inside a single
/// transaction, so concurrent writers are neither blocked nor observed
/// half-way.
fn snapshot_to(db_path: &Path, out: &Path) -> Result<()> {
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.execute("VACUUM INTO ?1", [out.to_string_lossy().into_owned()])?;
    conn.close().map_err(|(_, e)| CoreError::Sqlite(e))?;
    Ok(())
}

fn verify_sqlite(path: &Path) -> Result<()> {
    let mut header = [0u8; 16];
    let mut f = File::open(path)?;
    if f.read_exact(&mut header).is_err() || &header != SQLITE_MAGIC {
        return Err(CoreError::CorruptBackup(
            "decompressed content is not a SQLite database".to_string(),
        ));
    }
    drop(f);

    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let check: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|e| CoreError::CorruptBackup(e.to_string()))?;
    conn.close().map_err(|(_, e)| CoreError::Sqlite(e))?;
    if check != "ok" {
        return Err(CoreError::CorruptBackup(check));
    }
    Ok(())
}

fn decode_error(file: &Path, e: io::Error) -> CoreError {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            CoreError::CorruptBackup(format!("{}: {}", file.display(), e))
        }
        _ => CoreError::Io(e),
    }
}

fn remove_dir_if_empty(dir: &Path) {
    let is_empty = match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => return,
    };
    if is_empty {
        match fs::remove_dir(dir) {
            Ok(()) => debug!(dir = %dir.display(), "Removed empty backup directory"),
            Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to remove empty backup directory"),
        }
    }
}
