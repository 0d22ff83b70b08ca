//! Sandbox configuration

use crate::error::ConfigError;
use crate::limits::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default wall-clock budget for one execution
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Sandbox settings, applied uniformly to every execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Hard wall-clock limit per execution
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// How long a fresh context may take to report ready
    #[serde(with = "humantime_serde")]
    pub load_timeout: Duration,

    /// Console cap; output beyond this is replaced by a truncation marker
    pub max_output_bytes: usize,

    pub worker: WorkerConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            load_timeout: Duration::from_secs(10),
            max_output_bytes: 64 * 1024,
            worker: WorkerConfig::default(),
        }
    }
}

/// How isolated contexts are spawned and what evaluates the code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable for out-of-process contexts (None = `sandpit-worker` on PATH)
    pub program: Option<PathBuf>,

    /// Extra arguments for the worker executable
    pub args: Vec<String>,

    /// Interpreter command; the submitted code is passed as the final argument
    pub interpreter: Vec<String>,

    /// Limits applied to every interpreter process
    pub limits: ResourceLimits,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            interpreter: vec!["/bin/sh".to_string(), "-c".to_string()],
            limits: ResourceLimits::default(),
        }
    }
}

impl SandboxConfig {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SandboxConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the execution timeout in milliseconds
    pub fn with_timeout_ms(mut self, millis: u64) -> Self {
        self.timeout = Duration::from_millis(millis);
        self
    }

    pub fn with_interpreter<I, S>(mut self, interpreter: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker.interpreter = interpreter.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid("timeout must be non-zero".into()));
        }
        if self.load_timeout.is_zero() {
            return Err(ConfigError::Invalid("load_timeout must be non-zero".into()));
        }
        if self.max_output_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_output_bytes must be non-zero".into(),
            ));
        }
        if self.worker.interpreter.is_empty() {
            return Err(ConfigError::Invalid(
                "worker.interpreter must name a program".into(),
            ));
        }
        self.worker
            .limits
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("worker.limits: {}", e)))
    }
}
