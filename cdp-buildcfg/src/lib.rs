//! Exports configuration data from the build system and the small set of
//! filesystem paths every other crate in the workspace agrees on.

pub const CDP_PKG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION_MAJOR"),
    ".",
    env!("CARGO_PKG_VERSION_MINOR"),
);
pub const CDP_PKG_RELEASE: &str = env!("CARGO_PKG_VERSION_PATCH");

/// The configured configuration directory.
pub const CONFIGDIR: &str = "/etc/cdp-backup";

/// Unix system user used by the server daemon.
pub const BACKUP_USER_NAME: &str = "backup";
/// Unix system group used by the server daemon.
pub const BACKUP_GROUP_NAME: &str = "backup";

#[macro_export]
macro_rules! CDP_RUN_DIR_M {
    () => {
        "/run/cdp-backup"
    };
}

#[macro_export]
macro_rules! CDP_STATE_DIR_M {
    () => {
        "/var/lib/cdp-backup"
    };
}

#[macro_export]
macro_rules! CDP_LOG_DIR_M {
    () => {
        "/var/log/cdp-backup"
    };
}

/// namespaced directory for persistent client/server state
pub const CDP_STATE_DIR: &str = CDP_STATE_DIR_M!();
/// namespaced directory for in-memory (tmpfs) run state
pub const CDP_RUN_DIR: &str = CDP_RUN_DIR_M!();
/// namespaced directory for log files
pub const CDP_LOG_DIR: &str = CDP_LOG_DIR_M!();

/// Default local-cache database filename, relative to `cache-directory`.
pub const DEFAULT_CACHE_DB_NAME: &str = "cache.db3";

/// Default hash-shard depth for the server object store.
pub const DEFAULT_DIR_LEVEL: usize = 2;

/// Default reconnect interval, in seconds, for the client Reconnector.
pub const DEFAULT_RECONNECT_INTERVAL: u64 = 300;

/// The file-size threshold (bytes) separating the small-file and big-file
/// send paths.
pub const BIG_FILE_THRESHOLD: u64 = 128 * 1024 * 1024;

/// Return a human-readable `name/version` string, used for the `/Version.json`
/// endpoint and the CLIs' `--version` output.
pub fn version_text() -> String {
    format!("cdp-backup/{CDP_PKG_VERSION}.{CDP_PKG_RELEASE}")
}
