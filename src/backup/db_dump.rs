// cacti/src/backup/db_dump.rs
use std::path::{Path, PathBuf};
use tracing::info;

use crate::backup::command::{split_flags, CommandRunner, Invocation};
use crate::config::OutputShape;
use crate::errors::{BackupError, ProducerStep, Result};

const DUMP_PROGRAM: &str = "mongodump";

/// Produces a document-database snapshot with a single blocking `mongodump` run.
pub struct SyncSnapshotProducer<'a> {
    runner: &'a dyn CommandRunner,
    flags: &'a str,
    shape: OutputShape,
}

impl<'a> SyncSnapshotProducer<'a> {
    pub fn new(runner: &'a dyn CommandRunner, flags: &'a str, shape: OutputShape) -> Self {
        Self {
            runner,
            flags,
            shape,
        }
    }

    pub fn dump_command(&self, destination: &Path) -> Invocation {
        let cmd = Invocation::new(DUMP_PROGRAM).args(split_flags(self.flags));
        match self.shape {
            OutputShape::SingleFile => cmd
                .arg(format!("--archive={}", destination.display()))
                .arg("--gzip"),
            OutputShape::DirectoryTree => cmd.arg(format!("--out={}", destination.display())),
        }
    }

    /// Dumps to `destination` and returns it once the command has exited successfully.
    ///
    /// Anything the command left behind on failure stays on disk for inspection.
    pub async fn produce(&self, destination: &Path) -> Result<PathBuf> {
        let cmd = self.dump_command(destination);
        info!(destination = %destination.display(), "dumping database with {}", DUMP_PROGRAM);

        let output = self
            .runner
            .run(&cmd)
            .await
            .map_err(|e| BackupError::producer(ProducerStep::Dump, format!("{:#}", e)))?;

        if !output.success {
            return Err(BackupError::producer(
                ProducerStep::Dump,
                format!("{} failed with {}", DUMP_PROGRAM, output.describe()),
            ));
        }
        let produced = tokio::fs::try_exists(destination).await.map_err(|e| {
            BackupError::producer(
                ProducerStep::Dump,
                format!("cannot inspect {}: {}", destination.display(), e),
            )
        })?;
        if !produced {
            return Err(BackupError::producer(
                ProducerStep::Dump,
                format!(
                    "{} exited successfully but {} does not exist",
                    DUMP_PROGRAM,
                    destination.display()
                ),
            ));
        }

        info!(destination = %destination.display(), "✓ database dump complete");
        Ok(destination.to_path_buf())
    }
}
