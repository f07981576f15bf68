// cacti/src/backup/kv_snapshot.rs
//! Key-value store snapshots taken through a background save.
//!
//! Redis only offers `BGSAVE`, which returns immediately. Completion is detected
//! by polling `LASTSAVE` until it reports a timestamp strictly newer than the one
//! read right before the save was triggered. An equal value means no new save yet;
//! an older value (clock went backwards, flaky probe) is never taken as completion.
//! Once the save lands, the file redis wrote (located through its own `redis.conf`)
//! is copied into the temp directory under a name derived from that timestamp.

use std::path::{Path, PathBuf};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backup::command::{split_flags, CommandOutput, CommandRunner, Invocation};
use crate::backup::naming::SnapshotFileNamer;
use crate::config::PollConfig;
use crate::errors::{BackupError, ProducerStep, Result};

const CLI_PROGRAM: &str = "redis-cli";
const DIR_KEY: &str = "dir";
const FILE_NAME_KEY: &str = "dbfilename";

/// Where the service writes its snapshot, as declared in its configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdbLocation {
    pub dir: PathBuf,
    pub file_name: String,
}

impl RdbLocation {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }
}

/// Scans redis.conf style text for the `dir` and `dbfilename` directives.
///
/// Blank lines and `#` comments are skipped, values may be double-quoted, and a
/// later directive overrides an earlier one. A relative `dir` is rejected: redis
/// resolves it against its own working directory, which is not visible from here.
pub fn parse_service_conf(text: &str) -> std::result::Result<RdbLocation, String> {
    let mut dir = None;
    let mut file_name = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        let value = unquote(value);
        if key.eq_ignore_ascii_case(DIR_KEY) {
            dir = Some(value.to_string());
        } else if key.eq_ignore_ascii_case(FILE_NAME_KEY) {
            file_name = Some(value.to_string());
        }
    }

    match (dir, file_name) {
        (Some(dir), Some(file_name)) => {
            let dir = PathBuf::from(dir);
            if dir.is_relative() {
                return Err(format!(
                    "`{}` {} is relative to the redis working directory; use an absolute path",
                    DIR_KEY,
                    dir.display()
                ));
            }
            Ok(RdbLocation { dir, file_name })
        }
        (None, _) => Err(format!("`{}` directive not found", DIR_KEY)),
        (_, None) => Err(format!("`{}` directive not found", FILE_NAME_KEY)),
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

pub async fn read_service_conf(conf_path: &Path) -> Result<RdbLocation> {
    let text = tokio::fs::read_to_string(conf_path)
        .await
        .map_err(|e| BackupError::ConfigParseFailed {
            path: conf_path.to_path_buf(),
            reason: format!("unreadable: {}", e),
        })?;
    parse_service_conf(&text).map_err(|reason| BackupError::ConfigParseFailed {
        path: conf_path.to_path_buf(),
        reason,
    })
}

/// Reads the unix timestamp out of a `LASTSAVE` reply such as `(integer) 1714564800`.
pub fn parse_lastsave(stdout: &str) -> Result<i64> {
    let digits: String = stdout.chars().filter(char::is_ascii_digit).collect();
    digits.parse::<i64>().map_err(|_| {
        BackupError::producer(
            ProducerStep::ReadStatus,
            format!("unexpected LASTSAVE reply: {:?}", stdout.trim()),
        )
    })
}

/// A completed save seen by the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveObserved {
    pub last_save: i64,
    pub polls: u32,
}

pub struct AsyncSnapshotProducer<'a> {
    runner: &'a dyn CommandRunner,
    flags: &'a str,
    conf_path: &'a Path,
    temp_dir: &'a Path,
    poll: PollConfig,
    cancel: &'a CancellationToken,
}

impl<'a> AsyncSnapshotProducer<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        flags: &'a str,
        conf_path: &'a Path,
        temp_dir: &'a Path,
        poll: PollConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            runner,
            flags,
            conf_path,
            temp_dir,
            poll,
            cancel,
        }
    }

    fn cli(&self, command: &str) -> Invocation {
        Invocation::new(CLI_PROGRAM)
            .args(split_flags(self.flags))
            .arg(command)
    }

    async fn call(&self, command: &str, step: ProducerStep) -> Result<CommandOutput> {
        let output = self
            .runner
            .run(&self.cli(command))
            .await
            .map_err(|e| BackupError::producer(step, format!("{:#}", e)))?;
        let reply = output.stdout.trim_start();
        if !output.success || reply.starts_with("ERR") || reply.starts_with("(error)") {
            return Err(BackupError::producer(
                step,
                format!("{} {} failed with {}", CLI_PROGRAM, command, output.describe()),
            ));
        }
        Ok(output)
    }

    pub async fn last_save(&self) -> Result<i64> {
        let output = self.call("LASTSAVE", ProducerStep::ReadStatus).await?;
        parse_lastsave(&output.stdout)
    }

    pub async fn trigger_save(&self) -> Result<()> {
        let output = self.call("BGSAVE", ProducerStep::TriggerSave).await?;
        debug!(reply = %output.stdout.trim(), "background save triggered");
        Ok(())
    }

    /// Polls until `LASTSAVE` moves strictly past `before`.
    pub async fn wait_for_new_save(&self, before: i64) -> Result<SaveObserved> {
        let started = Instant::now();
        for polls in 1..=self.poll.max_attempts {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(BackupError::Cancelled),
                _ = tokio::time::sleep(self.poll.interval) => {}
            }

            let observed = self.last_save().await?;
            if observed > before {
                return Ok(SaveObserved {
                    last_save: observed,
                    polls,
                });
            }
            if observed < before {
                warn!(observed, before, "LASTSAVE went backwards, still waiting for the new save");
            } else {
                debug!(polls, "background save still in progress");
            }
        }
        Err(BackupError::PollTimeout {
            attempts: self.poll.max_attempts,
            waited: started.elapsed(),
        })
    }

    /// Triggers a background save, waits for it, and copies the result into the temp directory.
    pub async fn produce(&self) -> Result<PathBuf> {
        let location = read_service_conf(self.conf_path).await?;
        let before = self.last_save().await?;

        if self.cancel.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        info!(last_save = before, "triggering background save");
        self.trigger_save().await?;

        let observed = self.wait_for_new_save(before).await?;
        info!(
            last_save = observed.last_save,
            polls = observed.polls,
            "✓ background save completed"
        );

        let namer = SnapshotFileNamer::from_unix_seconds(observed.last_save).ok_or_else(|| {
            BackupError::producer(
                ProducerStep::ReadStatus,
                format!("LASTSAVE {} is not a valid timestamp", observed.last_save),
            )
        })?;
        let source = location.path();
        let destination = self.temp_dir.join(namer.rdb_file());
        tokio::fs::copy(&source, &destination).await.map_err(|e| {
            BackupError::producer(
                ProducerStep::CopySnapshot,
                format!(
                    "failed to copy {} to {}: {}",
                    source.display(),
                    destination.display(),
                    e
                ),
            )
        })?;

        Ok(destination)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fake redis-cli answering LASTSAVE from a script; the last value repeats once the script runs out.
    pub(crate) struct ScriptedRedis {
        lastsave: Mutex<VecDeque<i64>>,
        current: Mutex<i64>,
        pub bgsave_calls: Mutex<u32>,
        pub lastsave_calls: Mutex<u32>,
        pub bgsave_reply: String,
    }

    impl ScriptedRedis {
        pub(crate) fn new(script: &[i64]) -> Self {
            Self {
                lastsave: Mutex::new(script.iter().copied().collect()),
                current: Mutex::new(0),
                bgsave_calls: Mutex::new(0),
                lastsave_calls: Mutex::new(0),
                bgsave_reply: "Background saving started".into(),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRedis {
        async fn run(&self, command: &Invocation) -> anyhow::Result<CommandOutput> {
            anyhow::ensure!(command.program == "redis-cli", "unexpected program {}", command.program);
            let stdout = match command.args.last().map(String::as_str) {
                Some("LASTSAVE") => {
                    *self.lastsave_calls.lock().unwrap() += 1;
                    let mut current = self.current.lock().unwrap();
                    if let Some(next) = self.lastsave.lock().unwrap().pop_front() {
                        *current = next;
                    }
                    format!("(integer) {}\n", *current)
                }
                Some("BGSAVE") => {
                    *self.bgsave_calls.lock().unwrap() += 1;
                    format!("{}\n", self.bgsave_reply)
                }
                other => anyhow::bail!("unexpected redis command {:?}", other),
            };
            Ok(CommandOutput {
                success: true,
                code: Some(0),
                stdout,
                stderr: String::new(),
            })
        }
    }

    fn fast_poll(max_attempts: u32) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(1),
            max_attempts,
        }
    }

    /// Writes a redis.conf pointing at `data_dir/dump.rdb` and creates that file.
    pub(crate) fn write_redis_fixture(root: &Path) -> anyhow::Result<PathBuf> {
        let data_dir = root.join("data");
        std::fs::create_dir_all(&data_dir)?;
        std::fs::write(data_dir.join("dump.rdb"), b"REDIS0011")?;
        let conf_path = root.join("redis.conf");
        std::fs::write(
            &conf_path,
            format!(
                "# generated\nport 6379\ndbfilename dump.rdb\ndir {}\n",
                data_dir.display()
            ),
        )?;
        Ok(conf_path)
    }

    #[test]
    fn test_parse_service_conf_extracts_dir_and_filename() {
        let conf = "bind 127.0.0.1\n\ndir /data/redis\ndbfilename dump.rdb\nappendonly no\n";
        let location = parse_service_conf(conf).unwrap();
        assert_eq!(location.dir, PathBuf::from("/data/redis"));
        assert_eq!(location.file_name, "dump.rdb");
        assert_eq!(location.path(), PathBuf::from("/data/redis/dump.rdb"));
    }

    #[test]
    fn test_parse_service_conf_skips_comments_and_handles_quotes() {
        let conf = "# dir /commented/out\n  dbfilename \"snap.rdb\"\n\tdir   \"/var/lib/redis\"  \n";
        let location = parse_service_conf(conf).unwrap();
        assert_eq!(location.dir, PathBuf::from("/var/lib/redis"));
        assert_eq!(location.file_name, "snap.rdb");
    }

    #[test]
    fn test_parse_service_conf_last_directive_wins() {
        let conf = "dir /first\ndbfilename a.rdb\ndir /second\n";
        assert_eq!(parse_service_conf(conf).unwrap().dir, PathBuf::from("/second"));
    }

    #[test]
    fn test_parse_service_conf_missing_keys() {
        assert!(parse_service_conf("dbfilename dump.rdb\n").unwrap_err().contains("dir"));
        assert!(parse_service_conf("dir /data\n").unwrap_err().contains("dbfilename"));
        assert!(parse_service_conf("dir\ndbfilename\n").is_err());
    }

    #[test]
    fn test_parse_service_conf_rejects_relative_dir() {
        let err = parse_service_conf("dir ./\ndbfilename dump.rdb\n").unwrap_err();
        assert!(err.contains("relative"));
        assert!(parse_service_conf("dir data\ndbfilename dump.rdb\n").is_err());
    }

    #[tokio::test]
    async fn test_relative_dir_in_conf_file_is_parse_failure() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let conf_path = root.path().join("redis.conf");
        std::fs::write(&conf_path, "dir ./\ndbfilename dump.rdb\n")?;
        let err = read_service_conf(&conf_path).await.unwrap_err();
        match err {
            BackupError::ConfigParseFailed { path, reason } => {
                assert_eq!(path, conf_path);
                assert!(reason.contains("relative"));
            }
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_unreadable_conf_is_parse_failure() {
        let err = read_service_conf(Path::new("/nonexistent/redis.conf"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::ConfigParseFailed { .. }));
    }

    #[test]
    fn test_parse_lastsave() {
        assert_eq!(parse_lastsave("(integer) 1714564800\n").unwrap(), 1_714_564_800);
        assert_eq!(parse_lastsave("1714564800").unwrap(), 1_714_564_800);
        assert!(matches!(
            parse_lastsave("Could not connect to Redis"),
            Err(BackupError::ProducerFailed {
                step: ProducerStep::ReadStatus,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_poll_accepts_only_strictly_newer_save() -> anyhow::Result<()> {
        let runner = ScriptedRedis::new(&[100, 100, 100, 150]);
        let cancel = CancellationToken::new();
        let producer = AsyncSnapshotProducer::new(
            &runner,
            "",
            Path::new("unused"),
            Path::new("unused"),
            fast_poll(10),
            &cancel,
        );

        let before = producer.last_save().await?;
        assert_eq!(before, 100);
        let observed = producer.wait_for_new_save(before).await?;
        assert_eq!(observed, SaveObserved { last_save: 150, polls: 3 });
        Ok(())
    }

    #[tokio::test]
    async fn test_poll_ignores_clock_going_backwards() -> anyhow::Result<()> {
        let runner = ScriptedRedis::new(&[90, 100, 101]);
        let cancel = CancellationToken::new();
        let producer = AsyncSnapshotProducer::new(
            &runner,
            "",
            Path::new("unused"),
            Path::new("unused"),
            fast_poll(10),
            &cancel,
        );
        let observed = producer.wait_for_new_save(100).await?;
        assert_eq!(observed.last_save, 101);
        assert_eq!(observed.polls, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_poll_times_out() {
        let runner = ScriptedRedis::new(&[100]);
        let cancel = CancellationToken::new();
        let producer = AsyncSnapshotProducer::new(
            &runner,
            "",
            Path::new("unused"),
            Path::new("unused"),
            fast_poll(4),
            &cancel,
        );
        let err = producer.wait_for_new_save(100).await.unwrap_err();
        assert!(matches!(err, BackupError::PollTimeout { attempts: 4, .. }));
        assert_eq!(*runner.lastsave_calls.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_poll_stops_when_cancelled() {
        let runner = ScriptedRedis::new(&[100]);
        let cancel = CancellationToken::new();
        let producer = AsyncSnapshotProducer::new(
            &runner,
            "",
            Path::new("unused"),
            Path::new("unused"),
            PollConfig {
                interval: Duration::from_secs(3600),
                max_attempts: u32::MAX,
            },
            &cancel,
        );
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let err = producer.wait_for_new_save(100).await.unwrap_err();
        assert!(matches!(err, BackupError::Cancelled));
    }

    #[tokio::test]
    async fn test_produce_copies_snapshot_named_after_save() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let conf_path = write_redis_fixture(root.path())?;
        let temp_dir = root.path().join("tmp");
        std::fs::create_dir_all(&temp_dir)?;

        let runner = ScriptedRedis::new(&[100, 100, 150]);
        let cancel = CancellationToken::new();
        let producer = AsyncSnapshotProducer::new(
            &runner,
            "-h cache",
            &conf_path,
            &temp_dir,
            fast_poll(10),
            &cancel,
        );

        let produced = producer.produce().await?;
        assert_eq!(produced, temp_dir.join("1970-01-01T00:02:30.000Z.dump.rdb"));
        assert_eq!(std::fs::read(&produced)?, b"REDIS0011");
        // Source snapshot belongs to redis and is left alone.
        assert!(root.path().join("data").join("dump.rdb").is_file());
        assert_eq!(*runner.bgsave_calls.lock().unwrap(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_bgsave_is_trigger_failure() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let conf_path = write_redis_fixture(root.path())?;
        let mut runner = ScriptedRedis::new(&[100]);
        runner.bgsave_reply = "ERR Background save already in progress".into();
        let cancel = CancellationToken::new();
        let producer = AsyncSnapshotProducer::new(
            &runner,
            "",
            &conf_path,
            root.path(),
            fast_poll(10),
            &cancel,
        );

        let err = producer.produce().await.unwrap_err();
        assert!(matches!(
            err,
            BackupError::ProducerFailed {
                step: ProducerStep::TriggerSave,
                ..
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_snapshot_file_is_copy_failure() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let conf_path = write_redis_fixture(root.path())?;
        std::fs::remove_file(root.path().join("data").join("dump.rdb"))?;
        let runner = ScriptedRedis::new(&[100, 101]);
        let cancel = CancellationToken::new();
        let producer = AsyncSnapshotProducer::new(
            &runner,
            "",
            &conf_path,
            root.path(),
            fast_poll(10),
            &cancel,
        );

        let err = producer.produce().await.unwrap_err();
        assert!(matches!(
            err,
            BackupError::ProducerFailed {
                step: ProducerStep::CopySnapshot,
                ..
            }
        ));
        Ok(())
    }

    /// redis-cli that cannot reach the server.
    struct UnreachableRedis {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for UnreachableRedis {
        async fn run(&self, command: &Invocation) -> anyhow::Result<CommandOutput> {
            self.calls
                .lock()
                .unwrap()
                .push(command.args.last().cloned().unwrap_or_default());
            Ok(CommandOutput {
                success: false,
                code: Some(1),
                stdout: String::new(),
                stderr: "Could not connect to Redis at 127.0.0.1:6379: Connection refused".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_failing_status_command_stops_before_save() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let conf_path = write_redis_fixture(root.path())?;
        let runner = UnreachableRedis {
            calls: Mutex::new(Vec::new()),
        };
        let cancel = CancellationToken::new();
        let producer = AsyncSnapshotProducer::new(
            &runner,
            "",
            &conf_path,
            root.path(),
            fast_poll(10),
            &cancel,
        );

        let err = producer.produce().await.unwrap_err();
        match err {
            BackupError::ProducerFailed { step, detail } => {
                assert_eq!(step, ProducerStep::ReadStatus);
                assert!(detail.contains("exit code 1"));
                assert!(detail.contains("Connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*runner.calls.lock().unwrap(), vec!["LASTSAVE".to_string()]);
        Ok(())
    }
}
