//! factor-sandbox library
//!
//! Restricted execution of untrusted Python "custom factor" snippets:
//! - Capability registry: importable modules, blocked calls and attributes
//! - Static analyzer: rejects forbidden imports and calls before anything runs
//! - Restricted namespace and OS resource limits for the child interpreter
//! - Process and thread isolation boundaries with bounded output capture
//! - The [`Sandbox`] service and its MCP server surface

pub mod analyzer;
pub mod capture;
pub mod config;
pub mod error;
pub mod isolation;
pub mod limits;
pub mod mcp;
pub mod namespace;
pub mod registry;
pub mod request;
pub mod service;
pub mod transport;

pub use analyzer::{SafetyStatus, ValidationResult};
pub use config::Config;
pub use error::{ErrorKind, SandboxFault};
pub use request::{ExecutionRequest, ExecutionResult, LimitsInfo};
pub use service::Sandbox;
