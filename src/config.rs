//! Service configuration.
//!
//! Read once at startup, either from the `FACTOR_SANDBOX_CONFIG` environment
//! variable (inline JSON) or from a JSON file given on the command line.
//! Every section is optional and falls back to the defaults below.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::registry::{
    ModuleHandle, DEFAULT_ALLOWED_MODULES, DEFAULT_BLOCKED_ATTRIBUTES, DEFAULT_BLOCKED_CALLS,
    DEFAULT_BLOCKED_MODULE_NAMES, DEFAULT_BUILTINS, DEFAULT_PRELOADED,
};

/// Environment variable holding inline JSON configuration.
pub const CONFIG_ENV: &str = "FACTOR_SANDBOX_CONFIG";

/// Top-level configuration for the sandbox service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Whitelist/blacklist tables.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Request bounds.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Output capture caps.
    #[serde(default)]
    pub output: OutputConfig,

    /// Static analysis thresholds.
    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    /// Interpreter and isolation settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Capability tables, see [`crate::registry::Registry`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub allowed_modules: Vec<String>,
    pub preloaded: Vec<ModuleHandle>,
    pub blocked_calls: Vec<String>,
    pub blocked_attributes: Vec<String>,
    pub blocked_module_names: Vec<String>,
    pub builtins: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            allowed_modules: to_strings(DEFAULT_ALLOWED_MODULES),
            preloaded: DEFAULT_PRELOADED
                .iter()
                .map(|(alias, module)| ModuleHandle::new(*alias, *module))
                .collect(),
            blocked_calls: to_strings(DEFAULT_BLOCKED_CALLS),
            blocked_attributes: to_strings(DEFAULT_BLOCKED_ATTRIBUTES),
            blocked_module_names: to_strings(DEFAULT_BLOCKED_MODULE_NAMES),
            builtins: to_strings(DEFAULT_BUILTINS),
        }
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// Inclusive bounds with a default, as reported by `get_limits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: u64,
    pub max: u64,
    pub default: u64,
}

impl Bounds {
    pub const fn contains(&self, value: u64) -> bool {
        value >= self.min && value <= self.max
    }

    fn check(&self, what: &str) -> Result<()> {
        anyhow::ensure!(self.min >= 1, "{what}: min must be at least 1");
        anyhow::ensure!(
            self.min <= self.default && self.default <= self.max,
            "{what}: expected min <= default <= max, got {} / {} / {}",
            self.min,
            self.default,
            self.max
        );
        Ok(())
    }
}

/// Hard bounds applied to every request.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub timeout_seconds: Bounds,
    pub memory_mb: Bounds,
    /// Maximum source length in characters.
    pub max_code_chars: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: Bounds {
                min: 1,
                max: 300,
                default: 30,
            },
            memory_mb: Bounds {
                min: 64,
                max: 2048,
                default: 512,
            },
            max_code_chars: 50_000,
        }
    }
}

/// Caps on captured output.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Per-stream cap for stdout and stderr, in bytes.
    pub max_stream_bytes: usize,
    /// Budget for the serialized locals snapshot, in bytes.
    pub max_locals_bytes: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_stream_bytes: 1024 * 1024,
            max_locals_bytes: 1024 * 1024,
        }
    }
}

/// Thresholds that downgrade a result to WARNING.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub max_nesting_depth: usize,
    pub max_cyclomatic_complexity: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_nesting_depth: 6,
            max_cyclomatic_complexity: 50,
        }
    }
}

/// Which isolation boundary runs the code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Separate process with OS resource ceilings.
    #[default]
    Process,
    /// Degraded: worker thread driving the child, wall-clock timeout only.
    Thread,
}

/// Interpreter and isolation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Python interpreter to launch.
    pub python: String,
    pub isolation: IsolationMode,
    /// Extra CPU seconds granted above the wall-clock timeout.
    pub cpu_grace_seconds: u64,
    /// Parent directory for per-execution scratch directories.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            python: "python3".into(),
            isolation: IsolationMode::default(),
            cpu_grace_seconds: 1,
            scratch_dir: None,
        }
    }
}

impl Config {
    /// Load from `path` if given, otherwise from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => Self::from_env(),
        }
    }

    /// Load from the `FACTOR_SANDBOX_CONFIG` environment variable.
    ///
    /// A missing variable yields the default configuration.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(json) => Self::from_json(&json).context("Failed to parse FACTOR_SANDBOX_CONFIG"),
            Err(std::env::VarError::NotPresent) => Ok(Self::default()),
            Err(e) => Err(e).context("FACTOR_SANDBOX_CONFIG is not valid unicode"),
        }
    }

    /// Load from a JSON file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make the service unsafe or unusable.
    pub fn validate(&self) -> Result<()> {
        self.limits.timeout_seconds.check("limits.timeout_seconds")?;
        self.limits.memory_mb.check("limits.memory_mb")?;
        anyhow::ensure!(
            self.limits.max_code_chars > 0,
            "limits.max_code_chars must be positive"
        );
        anyhow::ensure!(
            self.output.max_stream_bytes > 0,
            "output.max_stream_bytes must be positive"
        );
        anyhow::ensure!(
            !self.runtime.python.trim().is_empty(),
            "runtime.python must name an interpreter"
        );
        Ok(())
    }
}
