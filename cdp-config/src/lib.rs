//! Loader for the `[All]` / `[Client]` / `[Server]` / `[File_Backend]`
//! key/value configuration file (§6.4).
//!
//! Unlike a strict schema validator, an unknown key within a known section
//! is logged as a warning and ignored rather than treated as fatal, so that
//! a config file written for a newer release still loads.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Error};

mod typed;
pub use typed::{AllConfig, ClientConfig, FileBackendConfig, ServerConfig};

const KNOWN_SECTIONS: &[&str] = &["All", "Client", "Server", "File_Backend"];

const KNOWN_KEYS: &[(&str, &[&str])] = &[
    ("All", &["debug-mode"]),
    (
        "Client",
        &[
            "blocksize",
            "adaptive",
            "buffersize",
            "no-scan",
            "directory-list",
            "exclude-list",
            "cache-directory",
            "cache-db-name",
            "server-ip",
            "server-port",
            "reconnect-interval",
        ],
    ),
    ("Server", &["server-port"]),
    ("File_Backend", &["file-directory", "dir-level"]),
];

/// A parsed configuration file: an ordered map of section name to its
/// key/value pairs, in the order keys were first seen.
#[derive(Clone, Debug, Default)]
pub struct Config {
    sections: HashMap<String, HashMap<String, String>>,
}

impl Config {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current: Option<String> = None;

        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') {
                let name = line
                    .strip_prefix('[')
                    .and_then(|s| s.strip_suffix(']'))
                    .map(|s| s.trim().to_string())
                    .with_context(|| format!("malformed section header at line {lineno}"))?;
                if !KNOWN_SECTIONS.contains(&name.as_str()) {
                    log::warn!("ignoring unknown config section [{name}]");
                }
                sections.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .with_context(|| format!("expected 'key = value' at line {lineno}: {line:?}"))?;
            let key = key.trim().to_string();
            let value = value.trim().trim_matches('"').to_string();

            let section = current
                .clone()
                .with_context(|| format!("key {key:?} outside of any section at line {lineno}"))?;

            if let Some((_, keys)) = KNOWN_KEYS.iter().find(|(s, _)| *s == section) {
                if !keys.contains(&key.as_str()) {
                    log::warn!("ignoring unknown key {key:?} in section [{section}]");
                }
            }

            sections.entry(section).or_default().insert(key, value);
        }

        Ok(Config { sections })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {path:?}"))?;
        Self::parse(&text)
    }

    pub fn get_str(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(|s| s.as_str())
    }

    pub fn get_bool(&self, section: &str, key: &str) -> Option<bool> {
        match self.get_str(section, key)? {
            "true" | "yes" | "1" | "on" => Some(true),
            "false" | "no" | "0" | "off" => Some(false),
            other => {
                log::warn!("invalid bool value {other:?} for [{section}] {key}");
                None
            }
        }
    }

    pub fn get_int(&self, section: &str, key: &str) -> Option<i64> {
        let raw = self.get_str(section, key)?;
        match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("invalid integer value {raw:?} for [{section}] {key}");
                None
            }
        }
    }

    pub fn get_list(&self, section: &str, key: &str) -> Vec<String> {
        match self.get_str(section, key) {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_types() {
        let text = "\
[All]
debug-mode = true

[Client]
blocksize = 16384
adaptive = yes
directory-list = /home, /etc
server-ip = 127.0.0.1
server-port = 8007
";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.get_bool("All", "debug-mode"), Some(true));
        assert_eq!(cfg.get_int("Client", "blocksize"), Some(16384));
        assert_eq!(cfg.get_bool("Client", "adaptive"), Some(true));
        assert_eq!(
            cfg.get_list("Client", "directory-list"),
            vec!["/home".to_string(), "/etc".to_string()]
        );
        assert_eq!(cfg.get_str("Client", "server-ip"), Some("127.0.0.1"));
    }

    #[test]
    fn unknown_section_and_key_are_tolerated() {
        let text = "\
[Bogus]
whatever = 1

[Client]
not-a-real-key = 5
blocksize = 512
";
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.get_int("Client", "blocksize"), Some(512));
    }
}
