/// Restore orchestrator
///
/// `SelectArchive → Confirm → Teardown → Extract → RestartDbOnly → ReplayDump
/// → StartAll → Done`. Nothing destructive happens before the operator answers
/// yes at the confirmation prompt. From Teardown on, the database volume is
/// gone, so every later failure is reported as leaving the panel degraded.

use anyhow::Context;
use chrono::NaiveDateTime;
use colored::Colorize;
use std::fmt;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::core::archive::{extract_archive, list_archives, verify_archive, ArchiveEntry};
use crate::core::config::Config;
use crate::core::docker::ServiceRuntime;
use crate::core::dump::run_replay_pipeline;
use crate::core::error::{describe, BackupError};
use crate::core::telegram::Notifier;
use crate::utils::progress::Step;
use crate::utils::{
    escape_markdown_v2, format_bytes, is_affirmative, prompt_line, tail_excerpt, BOT_EXCERPT_CHARS,
    DB_READY_POLL_INTERVAL_SECS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RestoreStage {
    SelectArchive,
    Confirm,
    Teardown,
    Extract,
    RestartDbOnly,
    ReplayDump,
    StartAll,
    Done,
}

impl RestoreStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStage::SelectArchive => "selecting archive",
            RestoreStage::Confirm => "confirming",
            RestoreStage::Teardown => "stopping services",
            RestoreStage::Extract => "extracting archive",
            RestoreStage::RestartDbOnly => "starting database",
            RestoreStage::ReplayDump => "replaying dump",
            RestoreStage::StartAll => "starting services",
            RestoreStage::Done => "done",
        }
    }

    /// Whether the database volume has been removed by the time this stage runs
    fn is_destructive(&self) -> bool {
        *self >= RestoreStage::Teardown
    }
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("restore failed while {stage}: {error}")]
pub struct RestoreFailure {
    pub stage: RestoreStage,
    #[source]
    pub error: BackupError,
}

impl RestoreFailure {
    pub fn exit_code(&self) -> u8 {
        self.error.exit_code()
    }
}

#[derive(Debug)]
pub struct RestoreReport {
    pub archive: PathBuf,
    pub stamp: NaiveDateTime,
    pub app_version: Option<String>,
    pub aux_restored: Vec<PathBuf>,
}

#[derive(Debug)]
pub enum RestoreOutcome {
    /// The operator backed out; nothing was touched
    Cancelled,
    Restored(RestoreReport),
}

/// Source of operator answers
pub trait Prompter: Send {
    fn ask(&mut self, prompt: &str) -> anyhow::Result<String>;

    fn say(&mut self, line: &str);
}

/// Prompter over any reader/writer pair, normally stdin and stdout
pub struct StdioPrompter<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead + Send, W: Write + Send> StdioPrompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead + Send, W: Write + Send> Prompter for StdioPrompter<R, W> {
    fn ask(&mut self, prompt: &str) -> anyhow::Result<String> {
        prompt_line(&mut self.input, &mut self.output, prompt)
    }

    fn say(&mut self, line: &str) {
        let _ = writeln!(self.output, "{}", line);
    }
}

pub struct RestoreOrchestrator<'a> {
    config: &'a Config,
    runtime: &'a dyn ServiceRuntime,
    notifier: Arc<dyn Notifier>,
    prompter: &'a mut dyn Prompter,
    archive_name: Option<String>,
    poll_interval: Duration,
    stage: RestoreStage,
}

impl<'a> RestoreOrchestrator<'a> {
    pub fn new(
        config: &'a Config,
        runtime: &'a dyn ServiceRuntime,
        notifier: Arc<dyn Notifier>,
        prompter: &'a mut dyn Prompter,
    ) -> Self {
        Self {
            config,
            runtime,
            notifier,
            prompter,
            archive_name: None,
            poll_interval: Duration::from_secs(DB_READY_POLL_INTERVAL_SECS),
            stage: RestoreStage::SelectArchive,
        }
    }

    /// Restore this archive instead of asking which one
    pub fn with_archive(mut self, name: Option<String>) -> Self {
        self.archive_name = name;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub async fn run(mut self) -> Result<RestoreOutcome, RestoreFailure> {
        let config = self.config;

        // SelectArchive
        let selected = match self.select_archive() {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(RestoreOutcome::Cancelled),
            Err(error) => return Err(self.fail(error).await),
        };
        let contents = match verify_archive(&selected.path) {
            Ok(contents) => contents,
            Err(error) => return Err(self.fail(error).await),
        };
        debug!(dump = %contents.dump, aux = ?contents.aux, "archive verified");

        // Confirm
        self.enter(RestoreStage::Confirm);
        self.prompter.say(&format!(
            "{} This stops every Remnawave service and deletes volume {}.\n  \
             The database will be replaced with {}.",
            "⚠".yellow(),
            config.db_volume,
            selected.file_name
        ));
        let answer = match self.prompter.ask("Continue with restore? (y/N): ") {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "no answer, treating as no");
                String::new()
            }
        };
        if !is_affirmative(&answer) {
            info!("restore cancelled at confirmation");
            self.prompter.say("Restore cancelled. Nothing was changed.");
            return Ok(RestoreOutcome::Cancelled);
        }

        // Teardown
        self.enter(RestoreStage::Teardown);
        let step = Step::start("Stopping services");
        if let Err(e) = self.runtime.compose_down().await {
            step.fail();
            return Err(self.fail(BackupError::restore(format!("{:#}", e), false)).await);
        }
        if let Err(e) = self.runtime.remove_volume(&config.db_volume).await {
            step.fail();
            return Err(self.fail(BackupError::restore(format!("{:#}", e), false)).await);
        }
        step.done();

        // Extract
        self.enter(RestoreStage::Extract);
        let extracted = match extract_archive(&selected.path, &config.scratch_dir()) {
            Ok(extracted) => extracted,
            Err(e) => return Err(self.fail(BackupError::restore(describe(&e), true)).await),
        };
        let aux_restored = match restore_aux_files(&extracted.aux, &config.remnawave_dir) {
            Ok(restored) => restored,
            Err(e) => return Err(self.fail(BackupError::restore(format!("{:#}", e), true)).await),
        };

        // RestartDbOnly
        self.enter(RestoreStage::RestartDbOnly);
        let step = Step::start("Starting database");
        if let Err(e) = self.runtime.compose_up(&[config.db_container.clone()]).await {
            step.fail();
            return Err(self.fail(BackupError::restore(format!("{:#}", e), true)).await);
        }
        if let Err(error) = self.wait_for_db().await {
            step.fail();
            return Err(self.fail(error).await);
        }
        step.done();

        // ReplayDump
        self.enter(RestoreStage::ReplayDump);
        let step = Step::start("Replaying dump");
        let log_path = extracted.dir().join("restore.log");
        let command = self.runtime.replay_command();
        let dump = extracted.dump.clone();
        let log = log_path.clone();
        let outcome = match tokio::task::spawn_blocking(move || run_replay_pipeline(command, &dump, &log)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                step.fail();
                let error = BackupError::restore(format!("failed to start replay: {}", e), true);
                return Err(self.fail(error).await);
            }
            Err(e) => {
                step.fail();
                let error = BackupError::restore(format!("replay task aborted: {}", e), true);
                return Err(self.fail(error).await);
            }
        };

        if !outcome.succeeded() {
            step.fail();
            let log = std::fs::read_to_string(&log_path).unwrap_or_default();
            let message = match &outcome.fed {
                _ if !outcome.consumer.success() => format!("psql exited with {}", outcome.consumer),
                Err(e) => format!("reading dump: {}", e),
                Ok(_) => "replay failed".to_string(),
            };
            let error = BackupError::Restore {
                message,
                status: outcome.consumer.code().filter(|c| *c != 0),
                log: Some(log),
                degraded: true,
            };
            return Err(self.fail(error).await);
        }
        step.done();

        // StartAll
        self.enter(RestoreStage::StartAll);
        let step = Step::start("Starting all services");
        if let Err(e) = self.runtime.compose_up(&[]).await {
            step.fail();
            return Err(self.fail(BackupError::restore(format!("{:#}", e), false)).await);
        }
        step.done();

        if let Err(e) = extracted.close() {
            warn!(error = %e, "could not remove extraction directory");
        }

        self.enter(RestoreStage::Done);
        let app_version = self.runtime.app_version().await;
        self.notify(&success_message(app_version.as_deref(), &selected)).await;
        info!(archive = %selected.path.display(), "restore finished");

        Ok(RestoreOutcome::Restored(RestoreReport {
            archive: selected.path,
            stamp: selected.stamp,
            app_version,
            aux_restored,
        }))
    }

    fn enter(&mut self, stage: RestoreStage) {
        debug!(from = %self.stage, to = %stage, "restore stage");
        self.stage = stage;
    }

    fn select_archive(&mut self) -> Result<Option<ArchiveEntry>, BackupError> {
        let archives = list_archives(&self.config.backup_dir);
        if archives.is_empty() {
            return Err(BackupError::Precondition(format!(
                "no archives found in {}",
                self.config.backup_dir.display()
            )));
        }

        if let Some(name) = &self.archive_name {
            return archives
                .into_iter()
                .find(|entry| &entry.file_name == name)
                .map(Some)
                .ok_or_else(|| BackupError::Precondition(format!("archive {} not found", name)));
        }

        self.prompter.say("Available archives (newest first):");
        for (index, entry) in archives.iter().enumerate() {
            self.prompter.say(&format!(
                "  {}. {}  {:>10}",
                index + 1,
                entry.file_name,
                format_bytes(entry.size)
            ));
        }

        let answer = self
            .prompter
            .ask(&format!("Select archive [1-{}], 0 to cancel: ", archives.len()))
            .map_err(|e| BackupError::Precondition(format!("{:#}", e)))?;

        match answer.parse::<usize>() {
            Ok(n) if (1..=archives.len()).contains(&n) => Ok(archives.into_iter().nth(n - 1)),
            Ok(0) | Err(_) if answer.is_empty() || answer == "0" => Ok(None),
            _ => {
                self.prompter.say("Invalid selection. Nothing was changed.");
                Ok(None)
            }
        }
    }

    /// Poll readiness at a fixed cadence until the configured bound
    async fn wait_for_db(&self) -> Result<(), BackupError> {
        let deadline = Instant::now() + self.config.db_ready_timeout;
        loop {
            match self.runtime.is_db_ready().await {
                Ok(true) => return Ok(()),
                Ok(false) => debug!("database not ready yet"),
                Err(e) => debug!(error = %format!("{:#}", e), "readiness probe failed"),
            }
            if Instant::now() >= deadline {
                return Err(BackupError::restore(
                    format!(
                        "database not ready after {}",
                        humantime::format_duration(self.config.db_ready_timeout)
                    ),
                    true,
                ));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn notify(&self, text: &str) {
        if !self.notifier.is_configured() {
            return;
        }
        if let Err(e) = self.notifier.send_message(text).await {
            warn!(error = %e, "restore notification not sent");
        }
    }

    async fn fail(&self, error: BackupError) -> RestoreFailure {
        error!(
            stage = %self.stage,
            error = %describe(&error),
            destructive = self.stage.is_destructive(),
            degraded = error.is_degraded(),
            "restore failed"
        );
        self.notify(&failure_message(self.stage, &error)).await;
        RestoreFailure {
            stage: self.stage,
            error,
        }
    }
}

/// Copy extracted env files into the Remnawave directory, keeping `.bak` copies
pub fn restore_aux_files(extracted: &[PathBuf], remnawave_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut restored = Vec::new();
    for source in extracted {
        let Some(name) = source.file_name() else { continue };
        let target = remnawave_dir.join(name);

        if target.exists() {
            let mut backup = target.clone().into_os_string();
            backup.push(".bak");
            std::fs::copy(&target, &backup)
                .with_context(|| format!("Failed to keep a copy of {}", target.display()))?;
        }
        std::fs::copy(source, &target)
            .with_context(|| format!("Failed to restore {}", target.display()))?;

        info!(file = %target.display(), "auxiliary file restored");
        restored.push(target);
    }
    Ok(restored)
}

fn success_message(version: Option<&str>, archive: &ArchiveEntry) -> String {
    format!(
        "✅ {}\n*{}*\n🌊 *{}* {}\n📅 *{}* {}\n📁 *{}* {}",
        escape_markdown_v2("#restore_success"),
        escape_markdown_v2("Restore completed"),
        escape_markdown_v2("Remnawave:"),
        escape_markdown_v2(version.unwrap_or("unknown")),
        escape_markdown_v2("Backup date:"),
        escape_markdown_v2(&archive.stamp.format("%Y-%m-%d %H:%M:%S").to_string()),
        escape_markdown_v2("Archive:"),
        escape_markdown_v2(&archive.file_name),
    )
}

/// Operator message for a failed stage. Error text and log keep only their tails.
fn failure_message(stage: RestoreStage, error: &BackupError) -> String {
    let mut text = format!(
        "❌ {}\n*{}*\n🔧 *{}* {}\n⚠️ *{}* {}",
        escape_markdown_v2("#restore_error"),
        escape_markdown_v2("Restore failed"),
        escape_markdown_v2("Stage:"),
        escape_markdown_v2(stage.as_str()),
        escape_markdown_v2("Error:"),
        escape_markdown_v2(&tail_excerpt(&describe(error), BOT_EXCERPT_CHARS)),
    );
    if error.is_degraded() {
        text.push_str(&format!(
            "\n‼️ *{}*",
            escape_markdown_v2("The database volume was reset and is empty or partial.")
        ));
    }
    if let BackupError::Restore { log: Some(log), .. } = error {
        let log = log.trim();
        if !log.is_empty() {
            text.push_str(&format!("\n{}", escape_markdown_v2(&tail_excerpt(log, BOT_EXCERPT_CHARS))));
        }
    }
    text
}
