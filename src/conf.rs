//! Process-wide configuration record.
//!
//! A single [`Config`] is installed with [`set`] before [`crate::run`] (or
//! any module init) and read through [`get`] everywhere else. When nothing
//! is installed, [`get`] serves a sentinel default; the record is never
//! mutated after startup.

use std::path::PathBuf;
use std::sync::OnceLock;

use serde::Deserialize;

/// Static configuration for a server process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stack-trace buffer length for captured panics. Zero disables stack
    /// capture; panics are then reported by payload only.
    pub len_stack_buf: usize,

    /// Log filter directive (`tracing` EnvFilter syntax), e.g. `"debug"` or
    /// `"volley=debug,info"`.
    pub log_level: String,
    /// Log file path. `None` logs to stderr.
    pub log_path: Option<PathBuf>,

    /// Debug console port; zero leaves the console disabled.
    pub console_port: u16,
    /// Debug console prompt.
    pub console_prompt: String,
    /// Profile output path.
    pub profile_path: Option<PathBuf>,

    /// Cluster listen address.
    pub listen_addr: String,
    /// Cluster peer addresses.
    pub conn_addrs: Vec<String>,
    /// Default send-queue length for cluster connections.
    pub pending_write_num: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            len_stack_buf: 4096,
            log_level: "info".to_string(),
            log_path: None,
            console_port: 0,
            console_prompt: "volley# ".to_string(),
            profile_path: None,
            listen_addr: String::new(),
            conn_addrs: Vec::new(),
            pending_write_num: 0,
        }
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Install the process configuration. Must happen before `init`; a second
/// call is a fatal programmer error.
pub fn set(config: Config) {
    if CONFIG.set(config).is_err() {
        panic!("configuration already installed");
    }
}

/// The installed configuration, or the sentinel default.
pub fn get() -> &'static Config {
    static DEFAULT: OnceLock<Config> = OnceLock::new();
    CONFIG
        .get()
        .unwrap_or_else(|| DEFAULT.get_or_init(Config::default))
}

/// Stack-trace buffer length for panic capture.
pub fn len_stack_buf() -> usize {
    get().len_stack_buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sentinel() {
        let cfg = get();
        assert_eq!(cfg.console_prompt, "volley# ");
        assert!(cfg.log_path.is_none());
    }

    #[test]
    fn test_deserialize_partial() {
        let cfg: Config = serde_json::from_str(r#"{"log_level": "debug"}"#).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.len_stack_buf, 4096);
    }
}
