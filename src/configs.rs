use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TetherConfig {
    /// Control socket path. No socket is opened when unset.
    pub socket: Option<PathBuf>,
    #[serde(default = "default_log")]
    pub log: String,
    /// Start the backend as soon as the supervisor is up.
    #[serde(default = "default_true")]
    pub autostart: bool,
    #[serde(default)]
    pub backend: ProcessConfig,
}

/// How to launch and reach the backend. Never mutated after the supervisor
/// is built.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ProcessConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Executable (usually an interpreter) used to run the backend.
    #[serde(default = "default_runtime")]
    pub runtime: PathBuf,
    /// Entry script passed as the first argument to `runtime`.
    #[serde(default)]
    pub script: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Extra environment for the backend, applied after the bind variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(with = "humantime_serde", default = "default_max_startup_wait")]
    pub max_startup_wait: Duration,
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_five_seconds")]
    pub probe_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_five_seconds")]
    pub health_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_five_seconds")]
    pub grace_period: Duration,
    /// Bytes of backend output kept for the `logs` command.
    #[serde(default = "default_output_cache_size")]
    pub output_cache_size: usize,
}

impl ProcessConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url(), path)
        } else {
            format!("{}/{}", self.base_url(), path)
        }
    }
}

fn default_log() -> String {
    "info".into()
}

fn default_true() -> bool {
    true
}

fn default_output_cache_size() -> usize {
    64 * 1024
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8765
}

fn default_runtime() -> PathBuf {
    "python3".into()
}

fn default_health_path() -> String {
    "/health".into()
}

fn default_max_startup_wait() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_five_seconds() -> Duration {
    Duration::from_secs(5)
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            socket: Default::default(),
            log: default_log(),
            autostart: default_true(),
            backend: Default::default(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            runtime: default_runtime(),
            script: None,
            args: Vec::new(),
            working_directory: None,
            env: HashMap::new(),
            health_path: default_health_path(),
            max_startup_wait: default_max_startup_wait(),
            poll_interval: default_poll_interval(),
            probe_timeout: default_five_seconds(),
            health_interval: default_five_seconds(),
            grace_period: default_five_seconds(),
            output_cache_size: default_output_cache_size(),
        }
    }
}
