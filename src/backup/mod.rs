mod logic;
pub(crate) mod archive;
pub(crate) mod command;
pub(crate) mod db_dump;
pub(crate) mod kv_snapshot;
pub(crate) mod naming;
pub(crate) mod s3_upload;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::BackupSettings;
use command::SystemCommandRunner;
use s3_upload::S3ObjectStore;

use logic::{BackupOrchestrator, BackupReport};

/// Public entry point for the backup process.
///
/// Runs the requested tasks (all configured ones when `tasks` is `None`) against
/// the real external tools and S3, returning every task's outcome.
pub async fn run_backup_flow(
    settings: Arc<BackupSettings>,
    tasks: Option<&[String]>,
    cancel: &CancellationToken,
) -> BackupReport {
    let store = S3ObjectStore::from_config(&settings.storage);
    let orchestrator = BackupOrchestrator::new(settings, SystemCommandRunner, store);
    orchestrator.run(tasks, cancel).await
}
