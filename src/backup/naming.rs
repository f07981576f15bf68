// cacti/src/backup/naming.rs
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use std::path::Path;

/// Timestamp-based names for snapshot artifacts.
///
/// Names carry millisecond precision, so two artifacts of the same kind created
/// within the same millisecond would collide. Different kinds never do since the
/// extension differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotFileNamer {
    taken_at: DateTime<Utc>,
}

impl SnapshotFileNamer {
    pub fn at(taken_at: DateTime<Utc>) -> Self {
        Self { taken_at }
    }

    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    /// Namer for a save reported as unix seconds by the service itself.
    pub fn from_unix_seconds(seconds: i64) -> Option<Self> {
        Utc.timestamp_opt(seconds, 0).single().map(Self::at)
    }

    /// ISO-8601 UTC with milliseconds, e.g. `2024-05-01T12:00:00.000Z`.
    pub fn timestamp(&self) -> String {
        self.taken_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Compressed single-file dump.
    pub fn archive_file(&self) -> String {
        format!("{}.archive.gz", self.timestamp())
    }

    /// Snapshot copied out of a key-value store.
    pub fn rdb_file(&self) -> String {
        format!("{}.dump.rdb", self.timestamp())
    }

    /// Intermediate directory for a dump that gets packaged afterwards.
    pub fn dump_directory(&self) -> String {
        self.timestamp()
    }
}

/// Archive name for a packaged directory.
pub fn tarball_name(directory: &Path) -> String {
    let base = directory
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    format!("{}.tar.gz", base)
}
