//! Bridge configuration.
//!
//! Resolution order:
//!
//! 1. `CURAVOX_BRIDGE_CONFIG` environment variable (path to a JSON file)
//! 2. `<config dir>/curavox/bridge.json` (XDG on Linux, Library on macOS)
//! 3. Built-in defaults
//!
//! Individual environment variables are applied on top of whichever of the
//! above was used.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ipc::DEFAULT_MAX_LINE_BYTES;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "CURAVOX_BRIDGE_CONFIG";

const PROGRAM_ENV: &str = "CURAVOX_WORKER_PROGRAM";
const ARGS_ENV: &str = "CURAVOX_WORKER_ARGS";
const REQUEST_TIMEOUT_ENV: &str = "CURAVOX_REQUEST_TIMEOUT_MS";
const RESTART_DELAY_ENV: &str = "CURAVOX_RESTART_DELAY_MS";

/// What happens to in-flight requests when the worker exits unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashPolicy {
    /// Leave them pending; each fails at its own deadline.
    #[default]
    AwaitTimeout,
    /// Fail them immediately with `IpcError::WorkerCrashed`.
    FailFast,
}

/// Worker command line, timing constants, and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Executable to launch.
    pub program: String,
    /// Arguments selecting the worker's long-running mode.
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Extra environment for the worker process.
    pub env: HashMap<String, String>,
    /// Delay before respawning after an unexpected exit.
    pub restart_delay_ms: u64,
    /// Per-request deadline.
    pub request_timeout_ms: u64,
    pub crash_policy: CrashPolicy,
    /// Give up after this many consecutive restarts. `None` retries forever.
    pub max_restarts: Option<u32>,
    /// Upper bound on requests awaiting a response.
    pub max_in_flight: usize,
    pub max_line_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec![
                "-u".to_string(),
                "ai_ml_engine/medical_ai_core.py".to_string(),
                "--mode".to_string(),
                "daemon".to_string(),
            ],
            working_dir: None,
            env: HashMap::new(),
            restart_delay_ms: 3_000,
            request_timeout_ms: 60_000,
            crash_policy: CrashPolicy::AwaitTimeout,
            max_restarts: None,
            max_in_flight: 256,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl BridgeConfig {
    /// Config for an arbitrary worker command with default timings.
    pub fn for_command<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_crash_policy(mut self, policy: CrashPolicy) -> Self {
        self.crash_policy = policy;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Load configuration following the documented resolution order.
    pub fn load() -> Result<Self> {
        let mut config = match find_config_path() {
            Some(path) => {
                tracing::info!("Loading bridge config from {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid bridge config in {}", path.display()))
    }

    /// Apply environment-style overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(program) = lookup(PROGRAM_ENV) {
            self.program = program;
        }
        if let Some(args) = lookup(ARGS_ENV) {
            self.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(value) = lookup(REQUEST_TIMEOUT_ENV) {
            self.request_timeout_ms = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid {} value: {}", REQUEST_TIMEOUT_ENV, value))?;
        }
        if let Some(value) = lookup(RESTART_DELAY_ENV) {
            self.restart_delay_ms = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid {} value: {}", RESTART_DELAY_ENV, value))?;
        }
        Ok(())
    }
}

/// Find the config file path from environment or the platform config dir.
fn find_config_path() -> Option<PathBuf> {
    // 1. Environment variable (highest priority)
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return Some(PathBuf::from(path));
    }

    // 2. Platform config directory
    let candidate = dirs::config_dir()?.join("curavox").join("bridge.json");
    candidate.exists().then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_match_reference_timings() {
        let config = BridgeConfig::default();
        assert_eq!(config.restart_delay(), Duration::from_secs(3));
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.crash_policy, CrashPolicy::AwaitTimeout);
        assert_eq!(config.max_restarts, None);
        assert!(config.args.windows(2).any(|w| w == ["--mode", "daemon"]));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: BridgeConfig = serde_json::from_str(
            r#"{"program": "/opt/worker", "request_timeout_ms": 500, "crash_policy": "fail_fast"}"#,
        )
        .expect("valid config");

        assert_eq!(config.program, "/opt/worker");
        assert_eq!(config.request_timeout(), Duration::from_millis(500));
        assert_eq!(config.crash_policy, CrashPolicy::FailFast);
        assert_eq!(config.restart_delay_ms, 3_000);
        assert_eq!(config.max_in_flight, 256);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BridgeConfig::default();
        config
            .apply_overrides(|key| match key {
                "CURAVOX_WORKER_PROGRAM" => Some("node".to_string()),
                "CURAVOX_WORKER_ARGS" => Some("worker.js  --mode daemon".to_string()),
                "CURAVOX_REQUEST_TIMEOUT_MS" => Some(" 1500 ".to_string()),
                _ => None,
            })
            .expect("overrides apply");

        assert_eq!(config.program, "node");
        assert_eq!(config.args, vec!["worker.js", "--mode", "daemon"]);
        assert_eq!(config.request_timeout(), Duration::from_millis(1500));
        assert_eq!(config.restart_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_override_is_an_error() {
        let mut config = BridgeConfig::default();
        let err = config
            .apply_overrides(|key| (key == "CURAVOX_RESTART_DELAY_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("CURAVOX_RESTART_DELAY_MS"));
    }

    #[test]
    fn test_from_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("curavox-bridge-{}.json", std::process::id()));
        let config = BridgeConfig::for_command("worker", ["--mode", "daemon"])
            .with_restart_delay(Duration::from_millis(250));
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = BridgeConfig::from_file(&path).expect("load");
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_from_file_missing() {
        let err = BridgeConfig::from_file(Path::new("/nonexistent/curavox/bridge.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
