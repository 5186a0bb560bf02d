pub mod archive;
pub mod backup;
pub mod config;
pub mod delivery;
pub mod docker;
pub mod dump;
pub mod error;
pub mod gdrive;
pub mod restore;
pub mod retention;
pub mod telegram;
pub mod uninstall;
pub mod updater;

#[cfg(test)]
pub(crate) mod test_support;

pub use backup::{BackupOrchestrator, BackupReport, DeliveryOutcome};
pub use config::Config;
pub use docker::{DockerRuntime, ServiceRuntime};
pub use error::BackupError;
pub use restore::{RestoreOrchestrator, RestoreOutcome, StdioPrompter};
pub use telegram::{Notifier, TelegramNotifier};
