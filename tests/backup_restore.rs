//! Backup followed by restore against a file-backed stand-in for the database

use anyhow::Result;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use remnawave_backup::core::archive::{extract_archive, list_archives};
use remnawave_backup::core::telegram::TelegramError;
use remnawave_backup::core::{
    BackupOrchestrator, Config, DeliveryOutcome, Notifier, RestoreOrchestrator, RestoreOutcome,
    ServiceRuntime, StdioPrompter,
};
use remnawave_backup::utils::ContainerState;

const TABLE_SQL: &str = "CREATE TABLE users (id integer PRIMARY KEY, name text);\n\
                         INSERT INTO users VALUES (1, 'alice');\n\
                         INSERT INTO users VALUES (2, 'bob');\n";

/// The "database" is a single SQL file; removing the volume deletes it
struct FileDatabase {
    data: PathBuf,
    running: AtomicBool,
}

impl FileDatabase {
    fn sh(script: &str, path: &Path) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script, "sh"]).arg(path);
        cmd
    }
}

#[async_trait]
impl ServiceRuntime for FileDatabase {
    async fn container_state(&self, _container: &str) -> Result<ContainerState> {
        Ok(if self.running.load(Ordering::SeqCst) {
            ContainerState::Running
        } else {
            ContainerState::Missing
        })
    }

    async fn is_db_ready(&self) -> Result<bool> {
        Ok(self.running.load(Ordering::SeqCst))
    }

    async fn compose_down(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn compose_up(&self, _services: &[String]) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_volume(&self, _volume: &str) -> Result<()> {
        fs::remove_file(&self.data)?;
        Ok(())
    }

    async fn app_version(&self) -> Option<String> {
        Some("2.1.3".to_string())
    }

    fn dump_command(&self) -> Command {
        Self::sh("cat \"$1\"", &self.data)
    }

    fn replay_command(&self) -> Command {
        Self::sh("cat > \"$1\"", &self.data)
    }
}

#[derive(Default)]
struct RecordingNotifier {
    documents: Mutex<Vec<(PathBuf, String)>>,
    messages: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn is_configured(&self) -> bool {
        true
    }

    async fn send_message(&self, text: &str) -> Result<(), TelegramError> {
        self.messages.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn send_document(&self, path: &Path, caption: &str) -> Result<(), TelegramError> {
        self.documents
            .lock()
            .unwrap()
            .push((path.to_path_buf(), caption.to_string()));
        Ok(())
    }
}

#[tokio::test]
async fn test_backup_then_restore_round_trips_table() {
    let root = TempDir::new().unwrap();
    let backup_dir = root.path().join("backup");
    let remnawave_dir = root.path().join("remnawave");
    fs::create_dir_all(&remnawave_dir).unwrap();
    fs::write(remnawave_dir.join(".env"), "JWT_AUTH_SECRET=abc\n").unwrap();
    fs::write(remnawave_dir.join(".env-node"), "APP_PORT=2222\n").unwrap();

    let config = Config::parse(
        root.path().join("config.env"),
        &format!(
            "BOT_TOKEN=1:x\nCHAT_ID=42\nBACKUP_DIR={}\nREMNAWAVE_DIR={}\n",
            backup_dir.display(),
            remnawave_dir.display()
        ),
    )
    .unwrap();

    let database = FileDatabase {
        data: root.path().join("volume.sql"),
        running: AtomicBool::new(true),
    };
    fs::write(&database.data, TABLE_SQL).unwrap();

    // Backup
    let notifier = Arc::new(RecordingNotifier::default());
    let report = BackupOrchestrator::new(&config, &database, notifier.clone(), reqwest::Client::new())
        .run()
        .await
        .unwrap();

    assert!(matches!(report.delivery, DeliveryOutcome::Delivered(_)));
    assert_eq!(report.exit_code(), 0);
    let archives = list_archives(&backup_dir);
    assert_eq!(archives.len(), 1);
    assert_eq!(fs::read_dir(&backup_dir).unwrap().count(), 1);

    {
        let documents = notifier.documents.lock().unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].0, report.archive);
        assert!(documents[0].1.contains("2\\.1\\.3"));
    }

    // The archived dump is the table's SQL
    let scratch = TempDir::new().unwrap();
    let extracted = extract_archive(&report.archive, scratch.path()).unwrap();
    let mut dumped = String::new();
    GzDecoder::new(fs::File::open(&extracted.dump).unwrap())
        .read_to_string(&mut dumped)
        .unwrap();
    assert!(dumped.contains("CREATE TABLE users"));
    assert_eq!(dumped, TABLE_SQL);
    assert_eq!(extracted.aux.len(), 2);
    drop(extracted);

    // Local edits after the backup are rolled back by the restore
    fs::write(&database.data, "DROP TABLE users;\n").unwrap();
    fs::write(remnawave_dir.join(".env"), "JWT_AUTH_SECRET=changed\n").unwrap();

    let mut prompter = StdioPrompter::new(Cursor::new(b"1\nY\n".to_vec()), Vec::new());
    let outcome = RestoreOrchestrator::new(&config, &database, notifier.clone(), &mut prompter)
        .run()
        .await
        .unwrap();

    assert!(matches!(outcome, RestoreOutcome::Restored(_)));
    assert_eq!(fs::read_to_string(&database.data).unwrap(), TABLE_SQL);
    assert_eq!(
        fs::read_to_string(remnawave_dir.join(".env")).unwrap(),
        "JWT_AUTH_SECRET=abc\n"
    );
    assert!(database.running.load(Ordering::SeqCst));
    assert!(report.archive.exists());
    assert!(notifier
        .messages
        .lock()
        .unwrap()
        .iter()
        .any(|m| m.contains("restore\\_success")));
}
