/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_ROOT_PATH: &str = "MaternalHealthSystem";
const DEFAULT_SUBSCRIPTION_BUFFER: usize = 256;

/// How a subscription behaves after its store connection drops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumePolicy {
    /// Delay before the first resume attempt
    pub initial_backoff: Duration,

    /// Upper bound for the delay between attempts
    pub max_backoff: Duration,

    /// Consecutive failed resumes before the subscriber is told it is degraded
    pub degraded_after: u32,
}

impl Default for ResumePolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            degraded_after: 5,
        }
    }
}

/// Messaging core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for the persistent store (in-memory store when absent)
    pub data_dir: Option<PathBuf>,

    /// Path prefix under which conversations and messages live
    pub root_path: String,

    /// Capacity of each subscriber's delivery channel
    pub subscription_buffer: usize,

    /// Resume behavior for live subscriptions
    pub resume: ResumePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            root_path: DEFAULT_ROOT_PATH.to_string(),
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
            resume: ResumePolicy::default(),
        }
    }
}

impl Config {
    /// Create config from command line arguments, then apply `CARELINK_*` env overrides
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::parse_args(args)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Flags only; no environment, no validation
    fn parse_args(args: &[String]) -> Result<Self> {
        let mut config = Config::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--data-dir" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--data-dir requires a path argument".to_string())
                    })?;
                    config.data_dir = Some(PathBuf::from(path));
                    i += 2;
                }
                "--root" => {
                    let root = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--root requires a path argument".to_string())
                    })?;
                    config.root_path = root.clone();
                    i += 2;
                }
                "--buffer" => {
                    let n = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--buffer requires a size argument".to_string())
                    })?;
                    config.subscription_buffer = n.parse::<usize>().map_err(|_| {
                        ChatError::Config("--buffer must be a positive number".to_string())
                    })?;
                    i += 2;
                }
                "--degraded-after" => {
                    let n = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--degraded-after requires a count argument".to_string())
                    })?;
                    config.resume.degraded_after = n.parse::<u32>().map_err(|_| {
                        ChatError::Config("--degraded-after must be a number".to_string())
                    })?;
                    i += 2;
                }
                other => {
                    return Err(ChatError::Config(format!(
                        "Unknown argument: {}. Usage: {} [--data-dir <path>] [--root <path>] [--buffer <n>] [--degraded-after <n>]",
                        other,
                        args.first().map(|s| s.as_str()).unwrap_or("carelink")
                    )));
                }
            }
        }

        Ok(config)
    }

    /// Env overrides (nice for scripts). `lookup` resolves a variable name.
    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("CARELINK_DATA_DIR").filter(|d| !d.is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(root) = lookup("CARELINK_ROOT").filter(|r| !r.is_empty()) {
            self.root_path = root;
        }
    }

    /// Reject values the core cannot run with
    pub fn validate(&self) -> Result<()> {
        let root = self.root_path.trim_matches('/');
        if root.is_empty() {
            return Err(ChatError::Config("root path must not be empty".to_string()));
        }
        if self.subscription_buffer == 0 {
            return Err(ChatError::Config(
                "subscription buffer must be at least 1".to_string(),
            ));
        }
        if self.resume.initial_backoff > self.resume.max_backoff {
            return Err(ChatError::Config(
                "initial backoff exceeds max backoff".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse_args(&args(&["carelink"])).unwrap();
        assert_eq!(config.subscription_buffer, DEFAULT_SUBSCRIPTION_BUFFER);
        assert_eq!(config.resume.degraded_after, 5);
    }

    #[test]
    fn test_flags() {
        let config = Config::parse_args(&args(&[
            "carelink",
            "--root",
            "Clinic",
            "--buffer",
            "8",
            "--degraded-after",
            "2",
        ]))
        .unwrap();
        assert_eq!(config.root_path, "Clinic");
        assert_eq!(config.subscription_buffer, 8);
        assert_eq!(config.resume.degraded_after, 2);
    }

    #[test]
    fn test_env_overrides_flags() {
        let mut config = Config::parse_args(&args(&["carelink", "--root", "Clinic"])).unwrap();
        config.apply_env(|key| match key {
            "CARELINK_ROOT" => Some("Override".to_string()),
            "CARELINK_DATA_DIR" => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.root_path, "Override");
        assert!(config.data_dir.is_none());

        config.apply_env(|key| (key == "CARELINK_DATA_DIR").then(|| "/var/carelink".to_string()));
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/carelink")));
        assert_eq!(config.root_path, "Override");
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            Config::from_args(&args(&["carelink", "--buffer", "0"])),
            Err(ChatError::Config(_))
        ));
        assert!(matches!(
            Config::from_args(&args(&["carelink", "--buffer"])),
            Err(ChatError::Config(_))
        ));
        assert!(matches!(
            Config::from_args(&args(&["carelink", "--bogus"])),
            Err(ChatError::Config(_))
        ));
    }
}
