//! Request and result types of the public operations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{Bounds, LimitsConfig};
use crate::error::ErrorKind;

/// One sandboxed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    /// Wall-clock ceiling; the configured default when absent.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Memory ceiling; the configured default when absent.
    #[serde(default)]
    pub max_memory_mb: Option<u64>,
    /// Variables injected into the namespace.
    #[serde(default)]
    pub globals: Map<String, Value>,
    #[serde(default)]
    pub capture_locals: bool,
    /// Caller's audit identifier, only ever logged.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    #[must_use]
    pub fn max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = Some(mb);
        self
    }

    #[must_use]
    pub fn global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn capture_locals(mut self, capture: bool) -> Self {
        self.capture_locals = capture;
        self
    }

    #[must_use]
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Source length in characters, the unit `max_code_chars` is given in.
    pub fn code_chars(&self) -> usize {
        self.code.chars().count()
    }

    /// Check the request against the configured bounds and fill defaults.
    pub fn resolve(&self, limits: &LimitsConfig) -> Result<ResolvedLimits, RequestError> {
        let length = self.code_chars();
        if length == 0 {
            return Err(RequestError::EmptyCode);
        }
        if length > limits.max_code_chars {
            return Err(RequestError::CodeTooLong {
                length,
                max: limits.max_code_chars,
            });
        }

        let timeout_seconds = self
            .timeout_seconds
            .unwrap_or(limits.timeout_seconds.default);
        if !limits.timeout_seconds.contains(timeout_seconds) {
            return Err(RequestError::TimeoutOutOfRange {
                value: timeout_seconds,
                bounds: limits.timeout_seconds,
            });
        }

        let memory_mb = self.max_memory_mb.unwrap_or(limits.memory_mb.default);
        if !limits.memory_mb.contains(memory_mb) {
            return Err(RequestError::MemoryOutOfRange {
                value: memory_mb,
                bounds: limits.memory_mb,
            });
        }

        Ok(ResolvedLimits {
            timeout_seconds,
            memory_mb,
        })
    }
}

/// Limits a validated request runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLimits {
    pub timeout_seconds: u64,
    pub memory_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("code must not be empty")]
    EmptyCode,

    #[error("code is {length} characters long, the maximum is {max}")]
    CodeTooLong { length: usize, max: usize },

    #[error("timeout_seconds {value} is outside {}..={}", .bounds.min, .bounds.max)]
    TimeoutOutOfRange { value: u64, bounds: Bounds },

    #[error("max_memory_mb {value} is outside {}..={}", .bounds.min, .bounds.max)]
    MemoryOutOfRange { value: u64, bounds: Bounds },
}

/// Outcome of one run.
///
/// Exactly one of `success` and `error_type` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub execution_time_seconds: f64,
    pub memory_used_mb: Option<f64>,
    pub locals_dict: Option<Map<String, Value>>,
}

impl ExecutionResult {
    pub fn completed(stdout: String, stderr: String) -> Self {
        Self {
            success: true,
            stdout,
            stderr,
            error_type: None,
            error_message: None,
            execution_time_seconds: 0.0,
            memory_used_mb: None,
            locals_dict: None,
        }
    }

    pub fn failed(kind: &ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            error_type: Some(kind.as_str().to_string()),
            error_message: Some(message.into()),
            execution_time_seconds: 0.0,
            memory_used_mb: None,
            locals_dict: None,
        }
    }

    #[must_use]
    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    #[must_use]
    pub fn with_elapsed(mut self, seconds: f64) -> Self {
        self.execution_time_seconds = seconds;
        self
    }
}

/// Answer of `get_limits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimitsInfo {
    pub timeout: Bounds,
    pub memory_mb: Bounds,
}

impl From<&LimitsConfig> for LimitsInfo {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            timeout: limits.timeout_seconds,
            memory_mb: limits.memory_mb,
        }
    }
}
