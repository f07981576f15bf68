// cacti/src/config/mod.rs
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{info, warn};

use crate::errors::BackupError;

pub const MONGO_TASK: &str = "mongo";
pub const REDIS_TASK: &str = "redis";

const DEFAULT_DIRECTORY: &str = "cacti";
const DEFAULT_MONGO_DIRECTORY: &str = "mongo";
const DEFAULT_REDIS_DIRECTORY: &str = "redis";
const DEFAULT_POLL_INTERVAL_MS: u64 = 300;
const DEFAULT_POLL_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_REGION: &str = "us-east-1";

// mongodump flags the tool adds itself; accepting them from config would fight the producer.
static DISALLOWED_DUMP_FLAGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\s)(?:(--archive|--gzip|--out)(?:=|\s|$)|(-o))")
        .expect("disallowed flag pattern is valid")
});

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonOutputShape {
    File,
    Directory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonMongoTask {
    pub directory: Option<String>,
    pub flags: Option<String>,
    pub output: Option<JsonOutputShape>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRedisTask {
    pub directory: Option<String>,
    pub flags: Option<String>,
    pub conf_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonTasks {
    pub mongo: Option<JsonMongoTask>,
    pub redis: Option<JsonRedisTask>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub temp_dir: Option<PathBuf>,
    pub poll_interval_ms: Option<u64>,
    pub poll_timeout_secs: Option<u64>,
    pub tasks: Option<JsonTasks>,
}

// Application's internal configuration structs

/// Shape of what a producer leaves on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    /// Already a single compressed file; uploaded as is.
    SingleFile,
    /// A directory tree that must be packaged before upload.
    DirectoryTree,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerConfig {
    /// Blocking dump command (mongodump).
    Dump { flags: String, shape: OutputShape },
    /// Fire-and-forget save that has to be polled for completion (redis BGSAVE).
    BackgroundSave { flags: String, conf_path: PathBuf },
}

impl ProducerConfig {
    pub fn output_shape(&self) -> OutputShape {
        match self {
            ProducerConfig::Dump { shape, .. } => *shape,
            ProducerConfig::BackgroundSave { .. } => OutputShape::SingleFile,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskConfig {
    pub name: String,
    /// Storage sub-prefix under the base directory, without slashes at either end.
    pub directory: String,
    pub producer: ProducerConfig,
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket_name: Option<String>,
    pub region: String,
    pub endpoint_url: Option<String>,
    pub credentials: Credentials,
}

/// Bucket and keys that passed the upload-time checks.
#[derive(Debug, Clone, Copy)]
pub struct UploadTarget<'a> {
    pub bucket_name: &'a str,
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
}

impl StorageConfig {
    /// Checks the values only needed once something is about to be uploaded.
    pub fn upload_target(&self) -> Result<UploadTarget<'_>, BackupError> {
        let bucket_name = self
            .bucket_name
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| BackupError::ConfigInvalid("S3 bucket name `bucket_name` is required".into()))?;
        let access_key_id = self
            .credentials
            .access_key_id
            .as_deref()
            .ok_or_else(|| BackupError::ConfigInvalid("AWS access key ID was missing".into()))?;
        let secret_access_key = self
            .credentials
            .secret_access_key
            .as_deref()
            .ok_or_else(|| BackupError::ConfigInvalid("AWS secret access key was missing".into()))?;
        Ok(UploadTarget {
            bucket_name,
            access_key_id,
            secret_access_key,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

/// Fully resolved configuration handed to the backup orchestrator. Read-only once built.
#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub storage: StorageConfig,
    /// Normalized base key prefix: never starts with `/`, ends with `/` unless empty.
    pub directory: String,
    pub temp_dir: PathBuf,
    pub poll: PollConfig,
    pub tasks: Vec<TaskConfig>,
}

impl BackupSettings {
    /// Loads config.json (if present) and resolves it against the process environment.
    pub fn load(config_path: &Path) -> Result<Self> {
        let raw = load_from_json(config_path)?;
        let settings = resolve_backup_settings(&raw, |key| std::env::var(key).ok())
            .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;
        Ok(settings)
    }

    pub fn task(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.name.clone()).collect()
    }
}

pub fn load_from_json(config_path: &Path) -> Result<RawJsonConfig> {
    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "config file not found, using defaults and environment"
        );
        return Ok(RawJsonConfig::default());
    }
    let config_content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
    let raw: RawJsonConfig = serde_json::from_str(&config_content).with_context(|| {
        format!(
            "Failed to parse JSON from config file at {}",
            config_path.display()
        )
    })?;
    Ok(raw)
}

/// Resolves the raw config into [`BackupSettings`], using `env` for the documented fallbacks.
pub fn resolve_backup_settings<F>(raw: &RawJsonConfig, env: F) -> Result<BackupSettings, BackupError>
where
    F: Fn(&str) -> Option<String>,
{
    let s3 = raw.s3_storage.clone().unwrap_or_default();
    let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

    let storage = StorageConfig {
        bucket_name: non_empty(s3.bucket_name).or_else(|| non_empty(env("CACTI_AWS_BUCKET"))),
        region: non_empty(s3.region)
            .or_else(|| non_empty(env("AWS_REGION")))
            .unwrap_or_else(|| DEFAULT_REGION.to_string()),
        endpoint_url: non_empty(s3.endpoint_url),
        credentials: Credentials {
            access_key_id: non_empty(s3.access_key_id).or_else(|| non_empty(env("AWS_ACCESS_KEY_ID"))),
            secret_access_key: non_empty(s3.secret_access_key)
                .or_else(|| non_empty(env("AWS_SECRET_ACCESS_KEY"))),
        },
    };
    if storage.bucket_name.is_none() {
        warn!("no S3 bucket configured; uploads will fail until `bucket_name` or CACTI_AWS_BUCKET is set");
    }

    let directory = normalize_directory(s3.folder_prefix.as_deref().unwrap_or(DEFAULT_DIRECTORY));

    let interval_ms = raw.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    if interval_ms == 0 {
        return Err(BackupError::ConfigInvalid(
            "poll_interval_ms must be greater than zero".into(),
        ));
    }
    let timeout_secs = raw.poll_timeout_secs.unwrap_or(DEFAULT_POLL_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(BackupError::ConfigInvalid(
            "poll_timeout_secs must be greater than zero".into(),
        ));
    }
    let max_attempts = (timeout_secs.saturating_mul(1000)).div_ceil(interval_ms).max(1);
    let poll = PollConfig {
        interval: Duration::from_millis(interval_ms),
        max_attempts: u32::try_from(max_attempts).unwrap_or(u32::MAX),
    };

    // No `tasks` section means every known service is backed up.
    let tasks_raw = raw.tasks.clone().unwrap_or_else(|| JsonTasks {
        mongo: Some(JsonMongoTask::default()),
        redis: Some(JsonRedisTask::default()),
    });

    let mut tasks = Vec::new();
    if let Some(mongo) = tasks_raw.mongo {
        let flags = match mongo.flags {
            Some(flags) => flags,
            None => env("DATABASE_NAME")
                .filter(|db| !db.trim().is_empty())
                .map(|db| format!("--db={}", db.trim()))
                .unwrap_or_default(),
        };
        validate_dump_flags(&flags)?;
        let shape = match mongo.output.unwrap_or(JsonOutputShape::File) {
            JsonOutputShape::File => OutputShape::SingleFile,
            JsonOutputShape::Directory => OutputShape::DirectoryTree,
        };
        tasks.push(TaskConfig {
            name: MONGO_TASK.to_string(),
            directory: task_directory(MONGO_TASK, mongo.directory.as_deref(), DEFAULT_MONGO_DIRECTORY)?,
            producer: ProducerConfig::Dump { flags, shape },
        });
    }
    if let Some(redis) = tasks_raw.redis {
        tasks.push(TaskConfig {
            name: REDIS_TASK.to_string(),
            directory: task_directory(REDIS_TASK, redis.directory.as_deref(), DEFAULT_REDIS_DIRECTORY)?,
            producer: ProducerConfig::BackgroundSave {
                flags: redis.flags.unwrap_or_default(),
                conf_path: redis.conf_path.unwrap_or_else(default_redis_conf_path),
            },
        });
    }

    Ok(BackupSettings {
        storage,
        directory,
        temp_dir: raw.temp_dir.clone().unwrap_or_else(std::env::temp_dir),
        poll,
        tasks,
    })
}

/// Strips leading slashes and ensures a single trailing slash. Idempotent.
pub fn normalize_directory(directory: &str) -> String {
    let mut normalized = directory.trim_start_matches('/').to_string();
    if normalized.is_empty() {
        return normalized;
    }
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    normalized
}

/// Rejects mongodump flags that control output location or compression.
pub fn validate_dump_flags(flags: &str) -> Result<(), BackupError> {
    if let Some(caps) = DISALLOWED_DUMP_FLAGS.captures(flags) {
        let flag = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        let reason = match flag {
            "--gzip" => "gzip flag is automatically added, please remove it",
            "--archive" => "archive flag is automatically added, please remove it",
            _ => "output flag is disabled, please remove it",
        };
        return Err(BackupError::ConfigInvalid(format!(
            "mongo flags `{}`: {}",
            flags, reason
        )));
    }
    Ok(())
}

fn task_directory(task: &str, configured: Option<&str>, default: &str) -> Result<String, BackupError> {
    let directory = configured.unwrap_or(default).trim_matches('/');
    if directory.is_empty() {
        return Err(BackupError::ConfigInvalid(format!(
            "storage directory for task `{}` cannot be empty",
            task
        )));
    }
    Ok(directory.to_string())
}

fn default_redis_conf_path() -> PathBuf {
    if std::env::consts::OS == "macos" {
        PathBuf::from("/usr/local/etc/redis.conf")
    } else {
        PathBuf::from("/etc/redis/redis.conf")
    }
}
