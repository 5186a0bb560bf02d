/// Backup orchestrator
///
/// One run walks `Idle → Dumping → Archiving → Cleaning → Delivering →
/// Notifying → Sweeping → Done`. A failure before delivery is terminal and is
/// reported through the bot channel. A delivery failure is not: the archive is
/// kept, the operator is told, and the run still sweeps old archives.

use chrono::{Local, NaiveDateTime};
use reqwest::Client;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::core::archive::{allocate_stamp, build_archive, collect_aux_files};
use crate::core::config::Config;
use crate::core::delivery::{deliver, DeliveryReceipt};
use crate::core::docker::ServiceRuntime;
use crate::core::dump::dump_database;
use crate::core::error::{describe, BackupError};
use crate::core::retention;
use crate::core::telegram::Notifier;
use crate::core::updater::{spawn_background_check, UpdateChecker};
use crate::utils::progress::Step;
use crate::utils::{escape_markdown_v2, format_bytes, tail_excerpt, BOT_EXCERPT_CHARS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStage {
    Idle,
    Dumping,
    Archiving,
    Cleaning,
    Delivering,
    Notifying,
    Sweeping,
    Done,
}

impl BackupStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStage::Idle => "checking preconditions",
            BackupStage::Dumping => "dumping database",
            BackupStage::Archiving => "building archive",
            BackupStage::Cleaning => "cleaning up",
            BackupStage::Delivering => "delivering archive",
            BackupStage::Notifying => "notifying",
            BackupStage::Sweeping => "sweeping old archives",
            BackupStage::Done => "done",
        }
    }
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a backup run
#[derive(Debug, Error)]
#[error("backup failed while {stage}: {error}")]
pub struct BackupFailure {
    pub stage: BackupStage,
    #[source]
    pub error: BackupError,
}

impl BackupFailure {
    pub fn exit_code(&self) -> u8 {
        self.error.exit_code()
    }
}

#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered(DeliveryReceipt),
    Failed(BackupError),
}

/// Summary of a run that produced an archive
#[derive(Debug)]
pub struct BackupReport {
    pub archive: PathBuf,
    pub size: u64,
    pub stamp: NaiveDateTime,
    pub app_version: Option<String>,
    pub delivery: DeliveryOutcome,
    pub swept: usize,
}

impl BackupReport {
    /// Zero unless delivery failed
    pub fn exit_code(&self) -> u8 {
        match &self.delivery {
            DeliveryOutcome::Delivered(_) => 0,
            DeliveryOutcome::Failed(e) => e.exit_code(),
        }
    }
}

/// Caption sent with (or after) a delivered archive. Every value is escaped.
pub fn success_caption(version: Option<&str>, stamp: &NaiveDateTime, size: u64, destination: &str) -> String {
    format!(
        "💾 {}\n✅ *{}*\n🌊 *{}* {}\n📅 *{}* {}\n📦 *{}* {}\n☁️ *{}* {}",
        escape_markdown_v2("#backup_success"),
        escape_markdown_v2("Backup created successfully"),
        escape_markdown_v2("Remnawave:"),
        escape_markdown_v2(version.unwrap_or("unknown")),
        escape_markdown_v2("Date:"),
        escape_markdown_v2(&stamp.format("%Y-%m-%d %H:%M:%S").to_string()),
        escape_markdown_v2("Size:"),
        escape_markdown_v2(&format_bytes(size)),
        escape_markdown_v2("Destination:"),
        escape_markdown_v2(destination),
    )
}

/// Operator message for a failed stage. Long error text keeps only its tail.
pub fn failure_message(stage: BackupStage, error: &BackupError, archive: Option<&PathBuf>) -> String {
    let mut text = format!(
        "❌ {}\n*{}*\n🔧 *{}* {}\n⚠️ *{}* {}",
        escape_markdown_v2("#backup_error"),
        escape_markdown_v2("Backup failed"),
        escape_markdown_v2("Stage:"),
        escape_markdown_v2(stage.as_str()),
        escape_markdown_v2("Error:"),
        escape_markdown_v2(&tail_excerpt(&describe(error), BOT_EXCERPT_CHARS)),
    );
    if let Some(path) = archive {
        text.push_str(&format!(
            "\n📁 *{}* {}",
            escape_markdown_v2("Archive kept at:"),
            escape_markdown_v2(&path.display().to_string()),
        ));
    }
    text
}

pub struct BackupOrchestrator<'a> {
    config: &'a Config,
    runtime: &'a dyn ServiceRuntime,
    notifier: Arc<dyn Notifier>,
    client: Client,
    update_checker: Option<UpdateChecker>,
    stage: BackupStage,
}

impl<'a> BackupOrchestrator<'a> {
    pub fn new(
        config: &'a Config,
        runtime: &'a dyn ServiceRuntime,
        notifier: Arc<dyn Notifier>,
        client: Client,
    ) -> Self {
        Self {
            config,
            runtime,
            notifier,
            client,
            update_checker: None,
            stage: BackupStage::Idle,
        }
    }

    /// Run a background release check once the archive is handled
    pub fn with_update_checker(mut self, checker: UpdateChecker) -> Self {
        self.update_checker = Some(checker);
        self
    }

    pub async fn run(self) -> Result<BackupReport, BackupFailure> {
        self.run_at(Local::now().naive_local()).await
    }

    /// Run with `now` as the wall-clock time used for naming
    pub async fn run_at(mut self, now: NaiveDateTime) -> Result<BackupReport, BackupFailure> {
        let config = self.config;

        // Idle
        self.enter(BackupStage::Idle);
        let state = match self.runtime.container_state(&config.db_container).await {
            Ok(state) => state,
            Err(e) => {
                let error = BackupError::Precondition(format!("cannot inspect {}: {:#}", config.db_container, e));
                return Err(self.fail(error).await);
            }
        };
        if !state.is_running() {
            let error = BackupError::Precondition(format!(
                "database container {} is {}",
                config.db_container,
                state.as_str()
            ));
            return Err(self.fail(error).await);
        }

        if let Err(e) = std::fs::create_dir_all(&config.backup_dir) {
            let error = BackupError::archive(format!("creating {}", config.backup_dir.display()), e);
            return Err(self.fail(error).await);
        }
        let staging = match tempfile::Builder::new()
            .prefix(".rw-staging-")
            .tempdir_in(config.scratch_dir())
        {
            Ok(dir) => dir,
            Err(e) => return Err(self.fail(BackupError::archive("creating staging directory", e)).await),
        };
        let stamp = allocate_stamp(&config.backup_dir, now);

        // Dumping
        self.enter(BackupStage::Dumping);
        let step = Step::start("Dumping database");
        let dump = match dump_database(self.runtime, staging.path(), &stamp).await {
            Ok(dump) => {
                step.done();
                dump
            }
            Err(error) => {
                step.fail();
                self.cleanup(staging);
                return Err(self.fail(error).await);
            }
        };
        let app_version = self.runtime.app_version().await;
        debug!(version = ?app_version, "application version at backup time");

        // Archiving
        self.enter(BackupStage::Archiving);
        let aux = collect_aux_files(&config.aux_file_paths());
        let built = build_archive(&dump, &aux, staging.path(), &config.backup_dir, &stamp);

        // Cleaning runs whether or not the archive was built
        self.enter(BackupStage::Cleaning);
        self.cleanup(staging);
        let archive = match built {
            Ok(archive) => archive,
            Err(error) => {
                self.stage = BackupStage::Archiving;
                return Err(self.fail(error).await);
            }
        };
        let size = std::fs::metadata(&archive).map(|m| m.len()).unwrap_or(0);
        println!("✓ Archive created: {} ({})", archive.display(), format_bytes(size));

        // Delivering
        self.enter(BackupStage::Delivering);
        let caption = success_caption(app_version.as_deref(), &stamp, size, config.target.label());
        let step = Step::start(format!("Sending archive to {}", config.target.label()));
        let delivery = match deliver(
            &config.target,
            &archive,
            &caption,
            self.notifier.as_ref(),
            &self.client,
            &config.endpoints,
        )
        .await
        {
            Ok(receipt) => {
                step.done();
                DeliveryOutcome::Delivered(receipt)
            }
            Err(error) => {
                step.fail();
                error!(error = %describe(&error), archive = %archive.display(), "delivery failed, archive kept");
                DeliveryOutcome::Failed(error)
            }
        };

        // Notifying
        self.enter(BackupStage::Notifying);
        if let DeliveryOutcome::Failed(error) = &delivery {
            self.notify(&failure_message(BackupStage::Delivering, error, Some(&archive)))
                .await;
        }
        if let Some(checker) = self.update_checker.take() {
            // Detached and never joined. The process exits soon after the
            // sweep, and shutting down the runtime drops the task, so a check
            // that is still waiting on the network is lost. A cache hit or a
            // fast response usually completes first.
            let _ = spawn_background_check(checker, Arc::clone(&self.notifier));
        }

        // Sweeping
        self.enter(BackupStage::Sweeping);
        let swept = if config.retention_days == 0 {
            warn!("RETENTION_DAYS is 0, retention sweep disabled");
            0
        } else {
            retention::sweep(&config.backup_dir, config.retention_days)
        };

        self.enter(BackupStage::Done);
        info!(archive = %archive.display(), size, swept, "backup run finished");

        Ok(BackupReport {
            archive,
            size,
            stamp,
            app_version,
            delivery,
            swept,
        })
    }

    fn enter(&mut self, stage: BackupStage) {
        debug!(from = %self.stage, to = %stage, "backup stage");
        self.stage = stage;
    }

    fn cleanup(&self, staging: TempDir) {
        let path = staging.path().to_path_buf();
        if let Err(e) = staging.close() {
            warn!(dir = %path.display(), error = %e, "could not remove staging directory");
        }
    }

    async fn notify(&self, text: &str) {
        if !self.notifier.is_configured() {
            warn!("no bot configured, operator not notified");
            return;
        }
        if let Err(e) = self.notifier.send_message(text).await {
            warn!(error = %e, "failure notification not sent");
        }
    }

    async fn fail(&self, error: BackupError) -> BackupFailure {
        error!(stage = %self.stage, error = %describe(&error), "backup failed");
        self.notify(&failure_message(self.stage, &error, None)).await;
        BackupFailure {
            stage: self.stage,
            error,
        }
    }
}
