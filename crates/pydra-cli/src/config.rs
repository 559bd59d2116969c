//! Master configuration.
//!
//! Loaded the way `bot_config.rs` loads its settings: a `toml` file parsed
//! into a [`Config`] with `serde`, `dotenvy`-sourced environment variables
//! layered on top, and sensible defaults for everything so a missing file
//! or key never prevents startup. Covers the enumerated configuration keys
//! from spec.md §6.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// `HOST`/`PORT`/`CONTROLLER_PORT`/... from spec.md §6, plus the bits of
/// ambient config (log level) every binary in this corpus exposes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind host shared by the Node listener and the Controller interface.
    pub host: String,
    /// `PORT`: the Master's Node-listen port.
    pub port: u16,
    /// `CONTROLLER_PORT`: the Controller HTTP interface's port.
    pub controller_port: u16,
    /// `WORKER_PORT`: the Node→Worker port. Unused by the Master itself —
    /// carried for parity with the full deployment's configuration surface.
    pub worker_port: u16,
    /// `RUNTIME_FILES_DIR`: root for the key file and the SQLite database.
    pub runtime_files_dir: PathBuf,
    /// `TASKS_DIR`: user-facing task package directory. Package discovery
    /// from disk is out of scope; carried for configuration parity.
    pub tasks_dir: PathBuf,
    /// `TASKS_DIR_INTERNAL`: hash-versioned package cache directory.
    pub tasks_dir_internal: PathBuf,
    /// `TASK_SYNC_CACHE`: optional tar cache path, or `None`.
    pub task_sync_cache: Option<PathBuf>,
    /// `MULTICAST_ALL`: auto-enroll discovered Nodes. ZeroConf discovery
    /// itself is out of scope; this flag is carried through unused.
    pub multicast_all: bool,
    /// `LOG_LEVEL` / `RUST_LOG`-style filter directive.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9090,
            controller_port: 8080,
            worker_port: 9091,
            runtime_files_dir: PathBuf::from("./run"),
            tasks_dir: PathBuf::from("./tasks"),
            tasks_dir_internal: PathBuf::from("./run/tasks_internal"),
            task_sync_cache: None,
            multicast_all: false,
            log_level: "info".into(),
        }
    }
}

impl Config {
    /// Load `path` if it exists (missing file is not an error — defaults
    /// apply), then layer environment variable overrides named after each
    /// field (e.g. `PYDRA_PORT`, `PYDRA_CONTROLLER_PORT`).
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PYDRA_HOST") {
            self.host = v;
        }
        if let Some(v) = std::env::var("PYDRA_PORT").ok().and_then(|v| v.parse().ok()) {
            self.port = v;
        }
        if let Some(v) = std::env::var("PYDRA_CONTROLLER_PORT").ok().and_then(|v| v.parse().ok()) {
            self.controller_port = v;
        }
        if let Some(v) = std::env::var("PYDRA_WORKER_PORT").ok().and_then(|v| v.parse().ok()) {
            self.worker_port = v;
        }
        if let Ok(v) = std::env::var("PYDRA_RUNTIME_FILES_DIR") {
            self.runtime_files_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PYDRA_TASKS_DIR") {
            self.tasks_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PYDRA_TASKS_DIR_INTERNAL") {
            self.tasks_dir_internal = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PYDRA_TASK_SYNC_CACHE") {
            self.task_sync_cache = Some(PathBuf::from(v));
        }
        if let Some(v) = std::env::var("PYDRA_MULTICAST_ALL").ok().and_then(|v| v.parse().ok()) {
            self.multicast_all = v;
        }
        if let Ok(v) = std::env::var("LOG_LEVEL").or_else(|_| std::env::var("RUST_LOG")) {
            self.log_level = v;
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.runtime_files_dir.join("pydra.sqlite3")
    }

    pub fn master_key_path(&self) -> PathBuf {
        self.runtime_files_dir.join("master.key")
    }

    pub fn node_listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn controller_addr(&self) -> (String, u16) {
        (self.host.clone(), self.controller_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load("/nonexistent/pydra.toml").unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.controller_port, 8080);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pydra.toml");
        std::fs::write(&path, "port = 7000\ncontroller_port = 7001\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.controller_port, 7001);
    }
}
