/// Installation layout, container names and remote endpoints
///
/// Defaults match a stock Remnawave panel deployed with docker compose under
/// /opt/remnawave. Every path and name here can be overridden in config.env.

/// Installation directory of the tool itself
pub const INSTALL_DIR: &str = "/opt/rw-backup-restore";

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/opt/rw-backup-restore/config.env";

/// Default archive directory
pub const DEFAULT_BACKUP_DIR: &str = "/opt/rw-backup-restore/backup";

/// Symlink placed on PATH by the installer
pub const SYMLINK_PATH: &str = "/usr/local/bin/rw-backup";

/// Remnawave compose project directory
pub const DEFAULT_REMNAWAVE_DIR: &str = "/opt/remnawave";

/// Database service/container name in the compose project
pub const DEFAULT_DB_CONTAINER: &str = "remnawave-db";

/// Panel container, used to read the application version
pub const DEFAULT_APP_CONTAINER: &str = "remnawave";

/// Persistent volume holding the Postgres data directory
pub const DEFAULT_DB_VOLUME: &str = "remnawave-db-data";

pub const DEFAULT_DB_USER: &str = "postgres";

/// Archives older than this many days are swept
pub const DEFAULT_RETENTION_DAYS: u64 = 7;

/// Upper bound for waiting on the database after a restart
pub const DEFAULT_DB_READY_TIMEOUT: &str = "60s";

/// Poll cadence while waiting for the database
pub const DB_READY_POLL_INTERVAL_SECS: u64 = 2;

/// Auxiliary files copied from the Remnawave directory into every archive
pub const AUX_FILES: &[&str] = &[".env-node", ".env"];

pub const ARCHIVE_PREFIX: &str = "remnawave_backup_";
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";
pub const DUMP_PREFIX: &str = "dump_";
pub const DUMP_SUFFIX: &str = ".sql.gz";

/// Timestamp layout embedded in archive and dump names
pub const STAMP_FORMAT: &str = "%Y-%m-%d_%H_%M_%S";

pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files?uploadType=multipart";

pub const GITHUB_API_URL: &str = "https://api.github.com/repos/distillium/remnawave-backup-restore/releases/latest";
pub const REPO_URL: &str = "https://github.com/distillium/remnawave-backup-restore";

/// How long a cached release lookup stays fresh
pub const UPDATE_CHECK_TTL_SECS: i64 = 6 * 60 * 60;

/// Longest message text the Bot API accepts
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Longest piece of error text or log quoted in a bot message, before escaping
pub const BOT_EXCERPT_CHARS: usize = 900;

/// Characters Telegram MarkdownV2 treats as markup
pub const MARKDOWN_V2_SPECIAL: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];
