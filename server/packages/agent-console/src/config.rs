use std::path::PathBuf;
use std::time::Duration;

/// Polling policy for tailing CLI session logs.
#[derive(Debug, Clone)]
pub struct LogMonitorConfig {
    pub poll_interval: Duration,
    pub subagent_scan_interval: Duration,
    /// No growth in the main or any sub-agent log for this long ends the watch.
    pub inactivity_timeout: Duration,
    pub tail_probe_bytes: u64,
}

impl Default for LogMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            subagent_scan_interval: Duration::from_secs(5),
            inactivity_timeout: Duration::from_secs(120),
            tail_probe_bytes: 4096,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    /// Where the `claude` CLI keeps its per-project session logs.
    pub projects_dir: PathBuf,
    pub max_turns: Option<u32>,
    pub log_monitor: LogMonitorConfig,
}

impl ServiceConfig {
    pub fn new(data_dir: PathBuf, projects_dir: PathBuf) -> Self {
        Self {
            data_dir,
            projects_dir,
            max_turns: None,
            log_monitor: LogMonitorConfig::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::new(default_data_dir(), default_projects_dir())
    }
}

pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("AGENT_CONSOLE_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|dir| dir.join("agent-console"))
        .unwrap_or_else(|| PathBuf::from(".").join(".agent-console"))
}

pub fn default_projects_dir() -> PathBuf {
    dirs::home_dir()
        .map(|dir| dir.join(".claude").join("projects"))
        .unwrap_or_else(|| PathBuf::from(".").join(".claude").join("projects"))
}
