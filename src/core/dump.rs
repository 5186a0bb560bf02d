/// Database dump engine
///
/// Runs `pg_dumpall` inside the database container and streams its stdout
/// through a level-9 gzip encoder straight into the staging directory. The
/// export and the compressor are two stages of one pipeline; both outcomes are
/// reported so a failing export cannot hide behind a successful compressor.
/// Restore runs the same pipeline backwards: gunzip feeding `psql`.

use chrono::NaiveDateTime;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use tracing::{debug, info, warn};

use crate::core::docker::ServiceRuntime;
use crate::core::error::{BackupError, Result};
use crate::utils::{DUMP_PREFIX, DUMP_SUFFIX, STAMP_FORMAT};

/// Outcome of both stages of the dump pipeline
#[derive(Debug)]
pub struct PipelineOutcome {
    /// Exit status of the export process
    pub producer: ExitStatus,
    /// Compressed bytes written, or the compressor's I/O failure
    pub compressed: io::Result<u64>,
    /// Captured stderr of the export process
    pub stderr: String,
}

impl PipelineOutcome {
    pub fn succeeded(&self) -> bool {
        self.producer.success() && self.compressed.is_ok()
    }
}

pub fn dump_file_name(stamp: &NaiveDateTime) -> String {
    format!("{}{}{}", DUMP_PREFIX, stamp.format(STAMP_FORMAT), DUMP_SUFFIX)
}

/// Spawn `producer` and gzip its stdout into `output`.
///
/// Only an error spawning the producer or creating the output file is returned
/// as `Err`; everything after that is described by the outcome.
pub fn run_dump_pipeline(mut producer: Command, output: &Path) -> io::Result<PipelineOutcome> {
    let file = File::create(output)?;

    let mut child = producer
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "producer stdout not captured"))?;

    // Drained on its own thread so a chatty producer cannot block on a full stderr pipe
    let stderr_reader = child.stderr.take().map(|mut stderr| {
        std::thread::spawn(move || {
            let mut captured = String::new();
            let _ = stderr.read_to_string(&mut captured);
            captured
        })
    });

    let compressed = compress_stream(&mut stdout, file);
    drop(stdout);

    if compressed.is_err() {
        // The compressor gave up; make sure the producer does not linger
        let _ = child.kill();
    }

    let producer_status = child.wait()?;
    let stderr = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    Ok(PipelineOutcome {
        producer: producer_status,
        compressed,
        stderr,
    })
}

fn compress_stream<R: Read>(input: &mut R, file: File) -> io::Result<u64> {
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::best());
    io::copy(input, &mut encoder)?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    file.metadata().map(|m| m.len())
}

/// Outcome of feeding a compressed dump into the replay command
#[derive(Debug)]
pub struct ReplayOutcome {
    /// Exit status of the replay process
    pub consumer: ExitStatus,
    /// Uncompressed bytes fed, or the decompressor's I/O failure
    pub fed: io::Result<u64>,
}

impl ReplayOutcome {
    pub fn succeeded(&self) -> bool {
        self.consumer.success() && self.fed.is_ok()
    }
}

/// Gunzip `dump` into the stdin of `consumer`, sending its stderr to `log`.
pub fn run_replay_pipeline(mut consumer: Command, dump: &Path, log: &Path) -> io::Result<ReplayOutcome> {
    let input = File::open(dump)?;
    let log_file = File::create(log)?;

    let mut child = consumer
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log_file))
        .spawn()?;

    let fed = match child.stdin.take() {
        Some(mut stdin) => io::copy(&mut GzDecoder::new(input), &mut stdin),
        None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "replay stdin not captured")),
    };
    // stdin is closed here so the consumer sees end of input

    if fed.is_err() {
        let _ = child.kill();
    }
    let consumer_status = child.wait()?;

    Ok(ReplayOutcome {
        consumer: consumer_status,
        fed,
    })
}

/// Produce a compressed dump of the whole database instance in `staging_dir`.
///
/// The caller has already checked that the database container is running.
pub async fn dump_database(runtime: &dyn ServiceRuntime, staging_dir: &Path, stamp: &NaiveDateTime) -> Result<PathBuf> {
    let output = staging_dir.join(dump_file_name(stamp));
    let command = runtime.dump_command();
    debug!(program = ?command.get_program(), output = %output.display(), "starting dump pipeline");

    let target = output.clone();
    let outcome = tokio::task::spawn_blocking(move || run_dump_pipeline(command, &target))
        .await
        .map_err(|e| BackupError::Dump {
            message: format!("dump task aborted: {}", e),
            status: None,
        })?
        .map_err(|e| {
            let _ = std::fs::remove_file(&output);
            BackupError::Dump {
                message: format!("failed to start export: {}", e),
                status: None,
            }
        })?;

    // The export's own status decides; the compressor finishing cleanly on a
    // truncated stream says nothing about the dump.
    if !outcome.producer.success() {
        remove_partial(&output);
        let stderr = outcome.stderr.trim();
        return Err(BackupError::dump_status(
            if stderr.is_empty() {
                format!("pg_dumpall exited with {}", outcome.producer)
            } else {
                format!("pg_dumpall exited with {}: {}", outcome.producer, stderr)
            },
            outcome.producer,
        ));
    }

    match outcome.compressed {
        Ok(bytes) => {
            info!(bytes, path = %output.display(), "database dump written");
            Ok(output)
        }
        Err(e) => {
            remove_partial(&output);
            Err(BackupError::archive("compressing database dump", e))
        }
    }
}

fn remove_partial(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove partial dump");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::docker::MockServiceRuntime;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    fn stamp() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2025-01-02_03_04_05", STAMP_FORMAT).unwrap()
    }

    fn read_gz(path: &Path) -> String {
        let mut text = String::new();
        GzDecoder::new(File::open(path).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        text
    }

    #[test]
    fn test_pipeline_compresses_producer_output() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.sql.gz");

        let outcome = run_dump_pipeline(sh("printf 'SELECT 1;\\n'"), &output).unwrap();

        assert!(outcome.succeeded());
        assert_eq!(read_gz(&output), "SELECT 1;\n");
    }

    #[test]
    fn test_pipeline_reports_producer_status_not_compressor() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.sql.gz");

        let outcome = run_dump_pipeline(sh("printf 'partial'; echo boom >&2; exit 3"), &output).unwrap();

        assert!(outcome.compressed.is_ok());
        assert_eq!(outcome.producer.code(), Some(3));
        assert_eq!(outcome.stderr.trim(), "boom");
        assert!(!outcome.succeeded());
    }

    #[test]
    fn test_replay_pipeline_feeds_decompressed_sql() {
        let dir = TempDir::new().unwrap();
        let dump = dir.path().join("dump.sql.gz");
        let replayed = dir.path().join("replayed.sql");
        let log = dir.path().join("replay.log");
        run_dump_pipeline(sh("printf 'INSERT INTO t VALUES (1);\\n'"), &dump).unwrap();

        let outcome = run_replay_pipeline(
            sh(&format!("cat > '{}'; echo NOTICE >&2", replayed.display())),
            &dump,
            &log,
        )
        .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(std::fs::read_to_string(&replayed).unwrap(), "INSERT INTO t VALUES (1);\n");
        assert_eq!(std::fs::read_to_string(&log).unwrap().trim(), "NOTICE");
    }

    #[test]
    fn test_replay_pipeline_reports_consumer_status() {
        let dir = TempDir::new().unwrap();
        let dump = dir.path().join("dump.sql.gz");
        let log = dir.path().join("replay.log");
        run_dump_pipeline(sh("printf 'BROKEN;'"), &dump).unwrap();

        let outcome = run_replay_pipeline(
            sh("cat >/dev/null; echo 'ERROR:  syntax error' >&2; exit 3"),
            &dump,
            &log,
        )
        .unwrap();

        assert!(!outcome.succeeded());
        assert_eq!(outcome.consumer.code(), Some(3));
        assert!(std::fs::read_to_string(&log).unwrap().contains("syntax error"));
    }

    #[test]
    fn test_dump_file_name() {
        assert_eq!(dump_file_name(&stamp()), "dump_2025-01-02_03_04_05.sql.gz");
    }

    #[tokio::test]
    async fn test_failed_export_leaves_no_dump() {
        let dir = TempDir::new().unwrap();

        let mut runtime = MockServiceRuntime::new();
        runtime
            .expect_dump_command()
            .returning(|| sh("printf 'CREATE TABLE'; exit 5"));

        let err = dump_database(&runtime, dir.path(), &stamp()).await.unwrap_err();

        assert_eq!(err.exit_code(), 5);
        assert!(!dir.path().join(dump_file_name(&stamp())).exists());
    }

    #[tokio::test]
    async fn test_successful_dump() {
        let dir = TempDir::new().unwrap();

        // Container state is the orchestrator's check, not repeated here
        let mut runtime = MockServiceRuntime::new();
        runtime.expect_container_state().never();
        runtime
            .expect_dump_command()
            .returning(|| sh("printf 'CREATE TABLE users (id int);\\n'"));

        let path = dump_database(&runtime, dir.path(), &stamp()).await.unwrap();

        assert_eq!(path, dir.path().join("dump_2025-01-02_03_04_05.sql.gz"));
        assert_eq!(read_gz(&path), "CREATE TABLE users (id int);\n");
    }
}
