// cacti/src/backup/logic.rs
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::backup::archive::package_directory;
use crate::backup::command::CommandRunner;
use crate::backup::db_dump::SyncSnapshotProducer;
use crate::backup::kv_snapshot::AsyncSnapshotProducer;
use crate::backup::naming::SnapshotFileNamer;
use crate::backup::s3_upload::{ObjectStore, UploadReceipt, UploadStage};
use crate::config::{BackupSettings, OutputShape, ProducerConfig, TaskConfig};
use crate::errors::{BackupError, PipelineStage, TaskFailure};

pub type TaskResult = std::result::Result<UploadReceipt, TaskFailure>;

#[derive(Debug)]
pub struct TaskOutcome {
    pub task: String,
    pub result: TaskResult,
}

/// Every requested task's terminal outcome, in request order.
#[derive(Debug, Default)]
pub struct BackupReport {
    pub outcomes: Vec<TaskOutcome>,
}

impl BackupReport {
    #[cfg(test)]
    pub fn get(&self, task: &str) -> Option<&TaskResult> {
        self.outcomes
            .iter()
            .find(|o| o.task == task)
            .map(|o| &o.result)
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskFailure> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().err())
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }
}

/// Runs produce → package → upload for each task, all tasks concurrently.
///
/// Tasks share nothing but the read-only settings. A failing task never cancels
/// or delays the others; `run` returns once every task reached a terminal state.
pub struct BackupOrchestrator<R, S> {
    settings: Arc<BackupSettings>,
    runner: R,
    store: S,
}

impl<R, S> BackupOrchestrator<R, S>
where
    R: CommandRunner,
    S: ObjectStore,
{
    pub fn new(settings: Arc<BackupSettings>, runner: R, store: S) -> Self {
        Self {
            settings,
            runner,
            store,
        }
    }

    /// Runs the requested tasks, or every configured task when `requested` is `None`.
    ///
    /// Repeated names are run once. Unknown names get a failed outcome of their own.
    pub async fn run(&self, requested: Option<&[String]>, cancel: &CancellationToken) -> BackupReport {
        let mut names: Vec<String> = Vec::new();
        match requested {
            Some(requested) => {
                for name in requested {
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
            }
            None => names = self.settings.task_names(),
        }
        info!(tasks = ?names, "starting backup run");

        let pipelines = names.into_iter().map(|name| {
            let span = info_span!("backup_task", task = %name);
            async move {
                let result = self.run_task(&name, cancel).await;
                match &result {
                    Ok(receipt) => info!(location = %receipt.location, "task finished"),
                    Err(failure) => error!(stage = %failure.stage, error = %failure.error, "task failed"),
                }
                TaskOutcome { task: name, result }
            }
            .instrument(span)
        });

        BackupReport {
            outcomes: join_all(pipelines).await,
        }
    }

    async fn run_task(&self, name: &str, cancel: &CancellationToken) -> TaskResult {
        let fail = move |stage: PipelineStage| {
            move |error: BackupError| TaskFailure {
                task: name.to_string(),
                stage,
                error,
            }
        };

        let task = self.preflight(name).await.map_err(fail(PipelineStage::Preflight))?;

        let artifact = self
            .produce(task, cancel)
            .await
            .map_err(fail(PipelineStage::Produce))?;

        let artifact = match task.producer.output_shape() {
            OutputShape::SingleFile => artifact,
            OutputShape::DirectoryTree => package_directory(&artifact, &self.settings.temp_dir)
                .await
                .map_err(fail(PipelineStage::Package))?,
        };

        UploadStage::new(&self.settings.storage, &self.settings.directory, &self.store)
            .upload(&task.directory, &artifact)
            .await
            .map_err(fail(PipelineStage::Upload))
    }

    /// Fails a task before its producer runs if it could never be uploaded.
    async fn preflight(&self, name: &str) -> Result<&TaskConfig, BackupError> {
        let task = self
            .settings
            .task(name)
            .ok_or_else(|| BackupError::ConfigInvalid(format!("unknown task `{}`", name)))?;
        self.settings.storage.upload_target()?;
        tokio::fs::create_dir_all(&self.settings.temp_dir)
            .await
            .map_err(|e| {
                BackupError::ConfigInvalid(format!(
                    "temp directory {} is not usable: {}",
                    self.settings.temp_dir.display(),
                    e
                ))
            })?;
        Ok(task)
    }

    async fn produce(&self, task: &TaskConfig, cancel: &CancellationToken) -> Result<PathBuf, BackupError> {
        let temp_dir = &self.settings.temp_dir;
        match &task.producer {
            ProducerConfig::Dump { flags, shape } => {
                let namer = SnapshotFileNamer::now();
                let destination = match shape {
                    OutputShape::SingleFile => temp_dir.join(namer.archive_file()),
                    OutputShape::DirectoryTree => temp_dir.join(namer.dump_directory()),
                };
                SyncSnapshotProducer::new(&self.runner, flags, *shape)
                    .produce(&destination)
                    .await
            }
            ProducerConfig::BackgroundSave { flags, conf_path } => {
                AsyncSnapshotProducer::new(
                    &self.runner,
                    flags,
                    conf_path,
                    temp_dir,
                    self.settings.poll,
                    cancel,
                )
                .produce()
                .await
            }
        }
    }
}
