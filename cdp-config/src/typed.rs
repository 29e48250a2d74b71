use cdp_buildcfg::{DEFAULT_CACHE_DB_NAME, DEFAULT_DIR_LEVEL, DEFAULT_RECONNECT_INTERVAL};

use crate::Config;

#[derive(Clone, Debug, Default)]
pub struct AllConfig {
    pub debug_mode: bool,
}

impl AllConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            debug_mode: cfg.get_bool("All", "debug-mode").unwrap_or(false),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub blocksize: usize,
    pub adaptive: bool,
    pub buffersize: usize,
    pub no_scan: bool,
    pub directory_list: Vec<String>,
    pub exclude_list: Vec<String>,
    pub cache_directory: String,
    pub cache_db_name: String,
    pub server_ip: String,
    pub server_port: u16,
    pub reconnect_interval: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            blocksize: 16384,
            adaptive: true,
            buffersize: 65536,
            no_scan: false,
            directory_list: Vec::new(),
            exclude_list: Vec::new(),
            cache_directory: "/var/lib/cdp-backup".to_string(),
            cache_db_name: DEFAULT_CACHE_DB_NAME.to_string(),
            server_ip: "127.0.0.1".to_string(),
            server_port: 8007,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

impl ClientConfig {
    pub fn from_config(cfg: &Config) -> Self {
        let default = Self::default();
        Self {
            blocksize: cfg
                .get_int("Client", "blocksize")
                .map(|v| v as usize)
                .unwrap_or(default.blocksize),
            adaptive: cfg.get_bool("Client", "adaptive").unwrap_or(default.adaptive),
            buffersize: cfg
                .get_int("Client", "buffersize")
                .map(|v| v as usize)
                .unwrap_or(default.buffersize),
            no_scan: cfg.get_bool("Client", "no-scan").unwrap_or(default.no_scan),
            directory_list: {
                let list = cfg.get_list("Client", "directory-list");
                if list.is_empty() {
                    default.directory_list
                } else {
                    list
                }
            },
            exclude_list: cfg.get_list("Client", "exclude-list"),
            cache_directory: cfg
                .get_str("Client", "cache-directory")
                .map(|s| s.to_string())
                .unwrap_or(default.cache_directory),
            cache_db_name: cfg
                .get_str("Client", "cache-db-name")
                .map(|s| s.to_string())
                .unwrap_or(default.cache_db_name),
            server_ip: cfg
                .get_str("Client", "server-ip")
                .map(|s| s.to_string())
                .unwrap_or(default.server_ip),
            server_port: cfg
                .get_int("Client", "server-port")
                .map(|v| v as u16)
                .unwrap_or(default.server_port),
            reconnect_interval: cfg
                .get_int("Client", "reconnect-interval")
                .map(|v| v as u64)
                .unwrap_or(default.reconnect_interval),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub server_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { server_port: 8007 }
    }
}

impl ServerConfig {
    pub fn from_config(cfg: &Config) -> Self {
        let default = Self::default();
        Self {
            server_port: cfg
                .get_int("Server", "server-port")
                .map(|v| v as u16)
                .unwrap_or(default.server_port),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FileBackendConfig {
    pub file_directory: String,
    pub dir_level: usize,
}

impl Default for FileBackendConfig {
    fn default() -> Self {
        Self {
            file_directory: "/var/lib/cdp-backup/store".to_string(),
            dir_level: DEFAULT_DIR_LEVEL,
        }
    }
}

impl FileBackendConfig {
    pub fn from_config(cfg: &Config) -> Self {
        let default = Self::default();
        let dir_level = cfg
            .get_int("File_Backend", "dir-level")
            .map(|v| v.clamp(1, 5) as usize)
            .unwrap_or(default.dir_level);
        Self {
            file_directory: cfg
                .get_str("File_Backend", "file-directory")
                .map(|s| s.to_string())
                .unwrap_or(default.file_directory),
            dir_level,
        }
    }
}
