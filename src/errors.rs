use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Step of a snapshot producer that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerStep {
    Dump,
    ReadStatus,
    TriggerSave,
    CopySnapshot,
}

impl fmt::Display for ProducerStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProducerStep::Dump => "dump",
            ProducerStep::ReadStatus => "read last save",
            ProducerStep::TriggerSave => "trigger background save",
            ProducerStep::CopySnapshot => "copy snapshot",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    #[error("Failed to parse service configuration {}: {reason}", path.display())]
    ConfigParseFailed { path: PathBuf, reason: String },

    #[error("Snapshot producer failed to {step}: {detail}")]
    ProducerFailed { step: ProducerStep, detail: String },

    #[error("Failed to package {}: {detail}", path.display())]
    PackagingFailed { path: PathBuf, detail: String },

    #[error("Upload of {} to key {key} failed: {detail}", file.display())]
    UploadFailed {
        file: PathBuf,
        key: String,
        detail: String,
    },

    #[error("No new save observed after {attempts} polls ({waited:?})")]
    PollTimeout { attempts: u32, waited: Duration },

    #[error("Operation cancelled")]
    Cancelled,
}

impl BackupError {
    pub(crate) fn producer(step: ProducerStep, detail: impl Into<String>) -> Self {
        BackupError::ProducerFailed {
            step,
            detail: detail.into(),
        }
    }
}

/// Stage of a task pipeline at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Preflight,
    Produce,
    Package,
    Upload,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Preflight => "preflight",
            PipelineStage::Produce => "produce",
            PipelineStage::Package => "package",
            PipelineStage::Upload => "upload",
        };
        f.write_str(name)
    }
}

/// A task's terminal failure, tagged with the task and the stage that failed.
#[derive(Error, Debug)]
#[error("task `{task}` failed at {stage} stage: {error}")]
pub struct TaskFailure {
    pub task: String,
    pub stage: PipelineStage,
    #[source]
    pub error: BackupError,
}

pub type Result<T> = std::result::Result<T, BackupError>;
