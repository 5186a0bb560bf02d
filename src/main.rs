use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::io::{self, BufReader};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use remnawave_backup::cli::{menu_choice, Cli, Commands};
use remnawave_backup::core::backup::{failure_message, BackupStage};
use remnawave_backup::core::error::describe;
use remnawave_backup::core::restore::RestoreStage;
use remnawave_backup::core::uninstall::{uninstall, RemovalPlan};
use remnawave_backup::core::updater::{cache_path_for, UpdateChecker, CURRENT_VERSION};
use remnawave_backup::core::{
    BackupError, BackupOrchestrator, Config, DeliveryOutcome, DockerRuntime, Notifier,
    RestoreOrchestrator, RestoreOutcome, StdioPrompter, TelegramNotifier,
};
use remnawave_backup::utils::{format_bytes, format_duration, is_affirmative, prompt_line, GITHUB_API_URL, REPO_URL};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let command = match cli.command {
        Some(command) => command,
        None => match run_menu() {
            Ok(Some(command)) => command,
            Ok(None) => return ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{} {:#}", "✗".red(), e);
                return ExitCode::from(1);
            }
        },
    };

    let result = match command {
        Commands::Backup => handle_backup(&cli.config).await,
        Commands::Restore { archive } => handle_restore(&cli.config, archive).await,
        Commands::Update { check } => handle_update(&cli.config, check).await,
        Commands::Remove { keep_backups } => handle_remove(&cli.config, keep_backups).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", "✗".red(), e);
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run_menu() -> Result<Option<Commands>> {
    println!("{}", format!("Remnawave backup & restore v{}", CURRENT_VERSION).bold());
    println!();
    println!("  1. Create backup");
    println!("  2. Restore from backup");
    println!("  3. Update rw-backup");
    println!("  4. Remove rw-backup");
    println!("  0. Exit");
    println!();

    let mut input = io::stdin().lock();
    let mut output = io::stdout();
    loop {
        let answer = prompt_line(&mut input, &mut output, "Select option: ")?;
        match menu_choice(&answer) {
            Some(choice) => return Ok(choice),
            None => println!("{} Unknown option '{}'", "✗".red(), answer),
        }
    }
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(format!("rw-backup/{}", CURRENT_VERSION))
        .build()
        .context("Failed to build HTTP client")
}

async fn handle_backup(config_path: &Path) -> Result<u8> {
    let config = Config::load(config_path)?;
    if config.was_degraded() {
        println!(
            "{} Google Drive credentials incomplete, switched delivery to Telegram",
            "⚠".yellow()
        );
    }

    let client = http_client()?;
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::from_config(&config, client.clone()));

    let runtime = match DockerRuntime::new(&config) {
        Ok(runtime) => runtime,
        Err(e) => {
            let error = BackupError::Precondition(format!("{:#}", e));
            eprintln!("{} Backup failed while {}: {}", "✗".red(), BackupStage::Idle, describe(&error));
            if notifier.is_configured() {
                if let Err(e) = notifier
                    .send_message(&failure_message(BackupStage::Idle, &error, None))
                    .await
                {
                    warn!(error = %e, "failure notification not sent");
                }
            } else {
                warn!("no bot configured, operator not notified");
            }
            return Ok(error.exit_code());
        }
    };

    println!("Starting backup of {}", config.db_container.cyan());
    let started = Instant::now();

    let mut orchestrator = BackupOrchestrator::new(&config, &runtime, notifier, client);
    match UpdateChecker::for_config(&config) {
        Ok(checker) => orchestrator = orchestrator.with_update_checker(checker),
        Err(e) => debug!(error = %format!("{:#}", e), "update check disabled"),
    }

    match orchestrator.run().await {
        Ok(report) => {
            match &report.delivery {
                DeliveryOutcome::Delivered(receipt) => {
                    println!("{} Archive delivered to {}", "✓".green(), receipt.destination);
                    if let Some(id) = &receipt.remote_id {
                        println!("  File id: {}", id);
                    }
                }
                DeliveryOutcome::Failed(error) => {
                    eprintln!("{} Delivery failed: {}", "✗".red(), describe(error));
                    eprintln!("  Archive kept at {}", report.archive.display());
                }
            }
            if report.swept > 0 {
                println!(
                    "{} Removed {} archive(s) older than {} days",
                    "✓".green(),
                    report.swept,
                    config.retention_days
                );
            }
            println!(
                "{} Backup finished in {}: {} ({})",
                "✓".green(),
                format_duration(started.elapsed().as_secs()),
                report.archive.display(),
                format_bytes(report.size)
            );
            Ok(report.exit_code())
        }
        Err(failure) => {
            eprintln!(
                "{} Backup failed while {}: {}",
                "✗".red(),
                failure.stage,
                describe(&failure.error)
            );
            Ok(failure.exit_code())
        }
    }
}

async fn handle_restore(config_path: &Path, archive: Option<String>) -> Result<u8> {
    let config = Config::load(config_path)?;
    let runtime = match DockerRuntime::new(&config) {
        Ok(runtime) => runtime,
        Err(e) => {
            let error = BackupError::Precondition(format!("{:#}", e));
            eprintln!("{} Restore failed while {}: {}", "✗".red(), RestoreStage::SelectArchive, describe(&error));
            return Ok(error.exit_code());
        }
    };

    let client = http_client()?;
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::from_config(&config, client));
    let mut prompter = StdioPrompter::new(BufReader::new(io::stdin()), io::stdout());
    let started = Instant::now();

    let outcome = RestoreOrchestrator::new(&config, &runtime, notifier, &mut prompter)
        .with_archive(archive)
        .run()
        .await;

    match outcome {
        Ok(RestoreOutcome::Cancelled) => Ok(0),
        Ok(RestoreOutcome::Restored(report)) => {
            println!(
                "{} Restored {} in {} (Remnawave {})",
                "✓".green(),
                report.archive.display(),
                format_duration(started.elapsed().as_secs()),
                report.app_version.as_deref().unwrap_or("unknown")
            );
            for path in &report.aux_restored {
                println!("  restored {}", path.display());
            }
            Ok(0)
        }
        Err(failure) => {
            eprintln!(
                "{} Restore failed while {}: {}",
                "✗".red(),
                failure.stage,
                describe(&failure.error)
            );
            if let BackupError::Restore { log: Some(log), .. } = &failure.error {
                if !log.trim().is_empty() {
                    eprintln!("{}", "--- replay log ---".dimmed());
                    eprintln!("{}", log.trim_end());
                    eprintln!("{}", "------------------".dimmed());
                }
            }
            if failure.error.is_degraded() {
                eprintln!();
                eprintln!(
                    "{}",
                    "!!! The database volume was reset. The panel database is empty or partial. !!!"
                        .red()
                        .bold()
                );
                eprintln!("    Fix the cause above and run 'rw-backup restore' again.");
            }
            Ok(failure.exit_code())
        }
    }
}

async fn handle_update(config_path: &Path, check_only: bool) -> Result<u8> {
    // The cache lives next to the archives; without a config there is no cache
    let cache = Config::load(config_path).ok().map(|c| cache_path_for(&c));
    let checker = UpdateChecker::new(GITHUB_API_URL, cache)?;

    println!("Checking for updates...");
    let info = checker.check(true).await?;
    let latest = info.latest_version.clone().unwrap_or_default();

    if !info.update_available {
        println!("{} rw-backup {} is up to date", "✓".green(), CURRENT_VERSION);
        return Ok(0);
    }

    println!("{} Update available: {} → {}", "⚠".yellow(), CURRENT_VERSION, latest);
    if check_only {
        println!(
            "  {}",
            info.release_url
                .clone()
                .unwrap_or_else(|| format!("{}/releases", REPO_URL))
        );
        println!("  Run 'rw-backup update' to install it.");
        return Ok(0);
    }

    let exe = checker.apply_update(&info).await?;
    println!("{} Updated {} to {}", "✓".green(), exe.display(), latest);
    Ok(0)
}

async fn handle_remove(config_path: &Path, keep_backups: bool) -> Result<u8> {
    let config = Config::load(config_path)
        .or_else(|_| Config::parse(config_path.to_path_buf(), ""))?;
    let plan = RemovalPlan::for_config(&config, keep_backups);

    println!("{} This removes:", "⚠".yellow());
    println!("  - cron entries running rw-backup");
    println!("  - {} (if it is a symlink)", plan.symlink.display());
    println!("  - {}", plan.install_dir.display());
    if keep_backups {
        println!("  Archives in {} are kept.", plan.backup_dir.display());
    } else {
        println!("  - {} (all archives)", plan.backup_dir.display());
    }

    let mut input = io::stdin().lock();
    let answer = prompt_line(&mut input, &mut io::stdout(), "Type 'yes' to continue: ")?;
    if !is_affirmative(&answer) {
        println!("Removal cancelled.");
        return Ok(0);
    }

    let report = uninstall(&plan)?;
    if report.cron_lines_removed > 0 {
        println!("{} Removed {} cron entr(ies)", "✓".green(), report.cron_lines_removed);
    }
    if report.symlink_removed {
        println!("{} Removed {}", "✓".green(), plan.symlink.display());
    }
    for path in &report.removed_paths {
        println!("{} Removed {}", "✓".green(), path.display());
    }
    println!("{} rw-backup has been removed", "✓".green());
    Ok(0)
}
