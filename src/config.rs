//! Configuration types for apitape

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::matcher::Matcher;
use crate::recording::{DEFAULT_DRAIN_TIMEOUT_MS, DEFAULT_MAX_IN_FLIGHT};
use crate::{RecorderError, Result};

/// Default include pattern: anything under an `/api/` path segment
pub const DEFAULT_INCLUDE_PATTERNS: &[&str] = &["/api/"];

/// Default exclude patterns: static assets
pub const DEFAULT_EXCLUDE_PATTERNS: &[&str] = &[
    ".css", ".js", ".woff", ".woff2", ".ttf", ".ico", ".png", ".jpg", ".jpeg", ".gif", ".svg",
];

/// Default body size limit in characters
pub const DEFAULT_BODY_SIZE_LIMIT: usize = 10_000;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Traffic filter and body limits
    #[serde(default)]
    pub filter: FilterConfig,
    /// Browser capture source settings
    #[serde(default)]
    pub browser: BrowserConfig,
    /// Session lifecycle settings
    #[serde(default)]
    pub session: SessionConfig,
}

/// Filter configuration, snapshotted into every session record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Patterns evaluated against path+query; empty means "everything"
    #[serde(default = "default_include_patterns")]
    pub include_patterns: Vec<String>,
    /// Patterns evaluated against the full URL
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
    /// Maximum serialized body length before truncation, counted in
    /// Unicode characters rather than bytes
    #[serde(default = "default_body_size_limit")]
    pub body_size_limit: usize,
}

fn default_include_patterns() -> Vec<String> {
    DEFAULT_INCLUDE_PATTERNS.iter().map(ToString::to_string).collect()
}

fn default_exclude_patterns() -> Vec<String> {
    DEFAULT_EXCLUDE_PATTERNS.iter().map(ToString::to_string).collect()
}

fn default_body_size_limit() -> usize {
    DEFAULT_BODY_SIZE_LIMIT
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            include_patterns: default_include_patterns(),
            exclude_patterns: default_exclude_patterns(),
            body_size_limit: DEFAULT_BODY_SIZE_LIMIT,
        }
    }
}

/// Browser capture source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Chromium executable; searched on `PATH` when absent
    #[serde(default)]
    pub executable: Option<PathBuf>,
    /// Run without a visible window
    #[serde(default)]
    pub headless: bool,
    /// How long to wait for the DevTools endpoint to come up
    #[serde(default = "default_launch_timeout_ms")]
    pub launch_timeout_ms: u64,
    /// Extra command-line arguments passed to the browser
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_launch_timeout_ms() -> u64 {
    15_000
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: None,
            headless: false,
            launch_timeout_ms: default_launch_timeout_ms(),
            extra_args: Vec::new(),
        }
    }
}

/// Session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Scenario name; generated from the start time when absent
    #[serde(default)]
    pub scenario: Option<String>,
    /// Recording duration in seconds
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    /// Maximum number of exchanges processed concurrently
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Grace period for in-flight exchanges on stop
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Output file; generated from the scenario name when absent
    #[serde(default)]
    pub output: Option<PathBuf>,
}

fn default_duration_secs() -> u64 {
    60
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

fn default_drain_timeout_ms() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_MS
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scenario: None,
            duration_secs: default_duration_secs(),
            max_in_flight: default_max_in_flight(),
            drain_timeout_ms: default_drain_timeout_ms(),
            output: None,
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RecorderError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| RecorderError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        self.filter.validate()?;

        if self.session.duration_secs == 0 {
            return Err(RecorderError::ConfigError(
                "duration_secs must be > 0".to_string(),
            ));
        }

        if self.session.max_in_flight == 0 {
            return Err(RecorderError::ConfigError(
                "max_in_flight must be > 0".to_string(),
            ));
        }

        if let Some(scenario) = &self.session.scenario {
            if scenario.trim().is_empty() {
                return Err(RecorderError::ConfigError(
                    "scenario cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl FilterConfig {
    /// Validate patterns and limits
    ///
    /// # Errors
    ///
    /// Returns error if a pattern is empty, a wildcard does not compile, or
    /// the body limit is zero
    pub fn validate(&self) -> Result<()> {
        if self.body_size_limit == 0 {
            return Err(RecorderError::ConfigError(
                "body_size_limit must be > 0".to_string(),
            ));
        }

        for (i, pattern) in self
            .include_patterns
            .iter()
            .chain(&self.exclude_patterns)
            .enumerate()
        {
            if pattern.is_empty() {
                return Err(RecorderError::ConfigError(format!(
                    "Pattern {i}: cannot be empty"
                )));
            }
        }

        Matcher::new(&self.include_patterns, &self.exclude_patterns).map(|_| ())
    }
}
