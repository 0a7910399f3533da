//! Logging setup
//!
//! Four append-only files under /var/log/ipcert, all written by one
//! `tracing` layer:
//!
//! - `ipcert.log`  every event
//! - `error.log`   ERROR events
//! - `audit.log`   events with target `audit`
//! - `renewal.log` events with target `renewal`
//!
//! Line format: `[timestamp] [level] [pid] message`
//!
//! Files over 10 MiB are renamed to `<name>.<YYYYmmdd-HHMMSS>` before the
//! next write; rotated files past the retention window are pruned at startup.

use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use chrono::Local;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogConfig;

pub const GENERAL_LOG: &str = "ipcert.log";
pub const ERROR_LOG: &str = "error.log";
pub const AUDIT_LOG: &str = "audit.log";
pub const RENEWAL_LOG: &str = "renewal.log";

pub const ALL_LOGS: [&str; 4] = [GENERAL_LOG, ERROR_LOG, AUDIT_LOG, RENEWAL_LOG];

/// Rotation threshold
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

pub const AUDIT_TARGET: &str = "audit";
pub const RENEWAL_TARGET: &str = "renewal";

/// Format one log line (without trailing newline)
pub fn format_line(level: &Level, pid: u32, message: &str) -> String {
    format!(
        "[{}] [{}] [{}] {}",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        level,
        pid,
        message
    )
}

/// Files an event belongs in
fn destinations(level: &Level, target: &str) -> Vec<&'static str> {
    let mut files = vec![GENERAL_LOG];
    if *level == Level::ERROR {
        files.push(ERROR_LOG);
    }
    match target {
        AUDIT_TARGET => files.push(AUDIT_LOG),
        RENEWAL_TARGET => files.push(RENEWAL_LOG),
        _ => {}
    }
    files
}

/// Collects the `message` field plus any extra key=value fields
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Layer writing the four ipcert log files
pub struct FileLogLayer {
    dir: PathBuf,
    max_bytes: u64,
    write_lock: Mutex<()>,
}

impl FileLogLayer {
    /// Create the log directory and check it is writable
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(GENERAL_LOG))?;
        Ok(Self {
            dir,
            max_bytes: MAX_LOG_BYTES,
            write_lock: Mutex::new(()),
        })
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    fn append(&self, name: &str, line: &str) -> io::Result<()> {
        let path = self.dir.join(name);
        rotate_if_needed(&path, self.max_bytes)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", line)?;
        file.flush()
    }
}

impl<S: Subscriber> Layer<S> for FileLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let message = format!("{}{}", visitor.message, visitor.fields);
        let line = format_line(meta.level(), process::id(), &message);

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        for name in destinations(meta.level(), meta.target()) {
            // Logging must never take the process down
            let _ = self.append(name, &line);
        }
    }
}

/// Rename `path` aside when it has grown past `max_bytes`
fn rotate_if_needed(path: &Path, max_bytes: u64) -> io::Result<()> {
    let Ok(meta) = fs::metadata(path) else {
        return Ok(());
    };
    if meta.len() <= max_bytes {
        return Ok(());
    }
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    let mut rotated = PathBuf::from(format!("{}.{}", path.display(), stamp));
    let mut n = 1;
    while rotated.exists() {
        rotated = PathBuf::from(format!("{}.{}.{}", path.display(), stamp, n));
        n += 1;
    }
    fs::rename(path, rotated)
}

/// Delete rotated log files older than `retention_days`
pub fn prune_rotated(dir: &Path, retention_days: u64) -> io::Result<usize> {
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(retention_days.saturating_mul(86_400)))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    for entry in fs::read_dir(dir)?.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        let is_rotated = ALL_LOGS
            .iter()
            .any(|base| name.starts_with(base) && name.len() > base.len());
        if !is_rotated {
            continue;
        }
        let modified = entry.metadata().and_then(|m| m.modified());
        if matches!(modified, Ok(t) if t <= cutoff) && fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Install the global subscriber.
///
/// File logging is skipped (not an error) when the log directory is not
/// writable, which is the normal case for read-only commands run as a user.
/// Terminal output stays with the CLI unless `debug` is set.
pub fn init(config: &LogConfig, log_dir: &Path, debug: bool) {
    let level = if debug { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_env("IPCERT_LOG").unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = match FileLogLayer::open(log_dir) {
        Ok(layer) => {
            let _ = prune_rotated(log_dir, config.retention_days);
            Some(layer)
        }
        Err(_) => None,
    };

    let stderr_layer = debug.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(true)
            .with_filter(LevelFilter::DEBUG)
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing::{error, info, warn};

    fn read(dir: &Path, name: &str) -> String {
        fs::read_to_string(dir.join(name)).unwrap_or_default()
    }

    #[test]
    fn test_line_format() {
        let line = format_line(&Level::WARN, 42, "disk low");
        assert!(line.starts_with('['));
        assert!(line.ends_with("] [WARN] [42] disk low"));
    }

    #[test]
    fn test_events_are_routed() {
        let temp = TempDir::new().unwrap();
        let layer = FileLogLayer::open(temp.path()).unwrap();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            info!("plain event");
            error!("something broke");
            info!(target: "audit", "config saved");
            warn!(target: "renewal", "nothing due");
        });

        let general = read(temp.path(), GENERAL_LOG);
        assert_eq!(general.lines().count(), 4);
        assert!(read(temp.path(), ERROR_LOG).contains("[ERROR]"));
        assert!(read(temp.path(), AUDIT_LOG).contains("config saved"));
        assert!(!read(temp.path(), AUDIT_LOG).contains("plain event"));
        assert!(read(temp.path(), RENEWAL_LOG).contains("nothing due"));
    }

    #[test]
    fn test_extra_fields_are_kept() {
        let temp = TempDir::new().unwrap();
        let layer = FileLogLayer::open(temp.path()).unwrap();
        tracing::subscriber::with_default(tracing_subscriber::registry().with(layer), || {
            info!(attempt = 2, "installing packages");
        });
        assert!(read(temp.path(), GENERAL_LOG).contains("installing packages attempt=2"));
    }

    #[test]
    fn test_rotation() {
        let temp = TempDir::new().unwrap();
        let layer = FileLogLayer::open(temp.path()).unwrap().with_max_bytes(10);
        tracing::subscriber::with_default(tracing_subscriber::registry().with(layer), || {
            info!("first line is long enough to rotate");
            info!("second");
        });

        let rotated: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.starts_with("ipcert.log.")
            })
            .collect();
        assert_eq!(rotated.len(), 1);
        assert!(read(temp.path(), GENERAL_LOG).contains("second"));
    }

    #[test]
    fn test_prune_keeps_live_logs() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(GENERAL_LOG), "live").unwrap();
        fs::write(temp.path().join("ipcert.log.20200101-000000"), "old").unwrap();

        // Zero-day retention removes every rotated file
        let removed = prune_rotated(temp.path(), 0).unwrap();
        assert_eq!(removed, 1);
        assert!(temp.path().join(GENERAL_LOG).exists());
    }
}
