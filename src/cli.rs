/// CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::utils::DEFAULT_CONFIG_PATH;

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser, Debug)]
#[command(name = "rw-backup")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Path to config.env
    #[arg(long, global = true, env = "RW_BACKUP_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Dump the database, archive it and deliver the archive
    Backup,

    /// Restore the database from a local archive
    Restore {
        /// Archive file name to restore instead of choosing interactively
        #[arg(long)]
        archive: Option<String>,
    },

    /// Update rw-backup to the latest release
    Update {
        /// Only report whether an update is available
        #[arg(long)]
        check: bool,
    },

    /// Uninstall rw-backup from this host
    Remove {
        /// Keep the archive directory
        #[arg(long)]
        keep_backups: bool,
    },
}

/// Entries of the interactive menu shown when no subcommand is given
pub fn menu_choice(input: &str) -> Option<Option<Commands>> {
    match input.trim() {
        "1" => Some(Some(Commands::Backup)),
        "2" => Some(Some(Commands::Restore { archive: None })),
        "3" => Some(Some(Commands::Update { check: false })),
        "4" => Some(Some(Commands::Remove { keep_backups: false })),
        "0" | "" => Some(None),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["rw-backup", "--config", "/tmp/c.env", "restore", "--archive", "a.tar.gz"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/c.env"));
        assert_eq!(
            cli.command,
            Some(Commands::Restore {
                archive: Some("a.tar.gz".into())
            })
        );

        let cli = Cli::try_parse_from(["rw-backup", "remove", "--keep-backups"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Remove { keep_backups: true }));
    }

    #[test]
    fn test_menu_choice() {
        assert_eq!(menu_choice("1"), Some(Some(Commands::Backup)));
        assert_eq!(menu_choice(" 3 "), Some(Some(Commands::Update { check: false })));
        assert_eq!(menu_choice("0"), Some(None));
        assert_eq!(menu_choice("9"), None);
    }
}
