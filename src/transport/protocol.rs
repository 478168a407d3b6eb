//! Parent ↔ child message types.
//!
//! Length-prefixed JSON protocol between the service and the interpreter
//! harness. Messages are framed as: [4-byte BE length][JSON payload]
//!
//! The parent writes one [`ChildRequest`]. The child answers with any number
//! of [`ChildMessage::Output`] frames followed by exactly one
//! [`ChildMessage::Report`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::namespace::ExecutionNamespace;

/// Sent from parent to child once, right after spawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRequest {
    pub code: String,
    pub namespace: ExecutionNamespace,
    pub capture_locals: bool,
    /// Per-stream cap the child stops forwarding at.
    pub max_stream_bytes: usize,
    /// Budget for the serialized locals snapshot.
    pub max_locals_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Sent from child to parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    /// A chunk written by user code to `sys.stdout` or `sys.stderr`.
    Output {
        stream: Stream,
        data: String,
        /// The child dropped output on this stream from here on.
        #[serde(default)]
        overflow: bool,
    },
    /// Final message; the child exits after sending it.
    Report(ChildReport),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildReport {
    pub outcome: ChildOutcome,
    #[serde(default)]
    pub locals: Option<Map<String, Value>>,
    /// Peak resident set size, as reported by the child.
    #[serde(default)]
    pub peak_rss_kb: Option<u64>,
    /// Preloaded modules that could not be imported.
    #[serde(default)]
    pub unavailable_modules: Vec<String>,
}

/// How user code ended, as seen from inside the child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChildOutcome {
    Completed,
    /// User code raised.
    Raised { exc_type: String, message: String },
    /// `compile()` rejected the source.
    SyntaxInvalid {
        #[serde(default)]
        line: Option<usize>,
        #[serde(default)]
        column: Option<usize>,
        message: String,
    },
    /// `MemoryError` escaped user code.
    MemoryExceeded { message: String },
    /// The harness could not set up the namespace.
    SetupFailed { message: String },
}
