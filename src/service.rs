//! The sandbox service.
//!
//! [`Sandbox`] ties the pieces together. A request is bounds-checked,
//! analyzed, given a restricted namespace and handed to the isolation
//! boundary; whatever the child did comes back as an [`ExecutionResult`].
//! Only a failure of the sandbox itself is returned as an `Err`.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, instrument, warn};

use crate::analyzer::{Analyzer, ValidationResult};
use crate::capture::sanitize_locals;
use crate::config::Config;
use crate::error::{ErrorKind, SandboxFault};
use crate::isolation::{self, IsolatedJob, IsolationBoundary, RawExecutionOutcome, Termination};
use crate::limits::ResourceCeilings;
use crate::namespace::{ExecutionNamespace, NamespaceBuilder};
use crate::registry::Registry;
use crate::request::{ExecutionRequest, ExecutionResult, LimitsInfo, ResolvedLimits};
use crate::transport::ChildRequest;

/// Validates and runs untrusted factor code.
///
/// Cheap to clone; clones share the read-only registry and the boundary.
/// Requests are independent and may run concurrently.
#[derive(Clone)]
pub struct Sandbox {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    registry: Arc<Registry>,
    analyzer: Analyzer,
    boundary: Arc<dyn IsolationBoundary>,
}

impl Sandbox {
    /// Create a sandbox using the boundary the configuration asks for.
    pub fn new(config: Config) -> Self {
        let boundary = isolation::select(&config.runtime);
        Self::with_boundary(config, boundary)
    }

    pub fn with_boundary(config: Config, boundary: Arc<dyn IsolationBoundary>) -> Self {
        let registry = Arc::new(Registry::from_config(&config.registry));
        let analyzer = Analyzer::new(Arc::clone(&registry), config.analyzer.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                analyzer,
                boundary,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Name of the isolation boundary in use.
    pub fn boundary_name(&self) -> &'static str {
        self.inner.boundary.name()
    }

    /// Statically analyze `code` without running it.
    pub fn validate(&self, code: &str) -> ValidationResult {
        self.inner.analyzer.analyze(code)
    }

    /// The bounds `execute` accepts.
    pub fn get_limits(&self) -> LimitsInfo {
        LimitsInfo::from(&self.inner.config.limits)
    }

    /// Run a request to completion.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxFault> {
        self.execute_until(request, std::future::pending::<()>()).await
    }

    /// Run a request until it finishes or `cancel` resolves.
    ///
    /// Cancellation kills the child exactly like the deadline does.
    #[instrument(
        name = "execute",
        skip_all,
        fields(
            correlation_id = request.correlation_id.as_deref().unwrap_or("-"),
            code_chars = request.code_chars(),
        )
    )]
    pub async fn execute_until<F>(
        &self,
        request: &ExecutionRequest,
        cancel: F,
    ) -> Result<ExecutionResult, SandboxFault>
    where
        F: Future<Output = ()> + Send,
    {
        let started = Instant::now();
        debug!(state = "RECEIVED", "Execution requested");

        let limits = match request.resolve(&self.inner.config.limits) {
            Ok(limits) => limits,
            Err(e) => {
                warn!(target: "security", state = "REJECTED", error = %e, "Invalid request");
                return Ok(ExecutionResult::failed(&ErrorKind::InvalidRequest, e.to_string())
                    .with_elapsed(elapsed(started)));
            }
        };

        debug!(state = "VALIDATING", "Analyzing code");
        let validation = self.validate(&request.code);
        if let Some(rejection) = rejection(&validation) {
            let (kind, message) = rejection;
            warn!(
                target: "security",
                state = "REJECTED",
                error_type = kind.as_str(),
                dangerous_calls = ?validation.dangerous_calls,
                forbidden_imports = ?validation.forbidden_imports,
                "{message}"
            );
            return Ok(ExecutionResult::failed(&kind, message).with_elapsed(elapsed(started)));
        }
        if !validation.issues.is_empty() {
            debug!(warnings = validation.issues.len(), "Analyzer reported warnings");
        }
        debug!(state = "VALIDATED", "Code passed analysis");

        let namespace = NamespaceBuilder::new(&self.inner.registry).build(&request.globals);
        let output = &self.inner.config.output;
        let job = IsolatedJob {
            request: ChildRequest {
                code: request.code.clone(),
                namespace,
                capture_locals: request.capture_locals,
                max_stream_bytes: output.max_stream_bytes,
                max_locals_bytes: output.max_locals_bytes,
            },
            timeout: Duration::from_secs(limits.timeout_seconds),
            ceilings: ResourceCeilings {
                memory_mb: limits.memory_mb,
                cpu_seconds: limits.timeout_seconds + self.inner.config.runtime.cpu_grace_seconds,
            },
        };

        debug!(
            state = "RUNNING",
            boundary = self.boundary_name(),
            timeout_seconds = limits.timeout_seconds,
            memory_mb = limits.memory_mb,
            "Starting isolated run"
        );
        let run = self.inner.boundary.run_isolated(&job);
        tokio::pin!(run);
        tokio::pin!(cancel);

        let raw = tokio::select! {
            outcome = &mut run => match outcome {
                Ok(raw) => raw,
                Err(fault) => {
                    error!(error = %fault, "Sandbox fault");
                    return Err(fault);
                }
            },
            () = &mut cancel => {
                debug!(state = "CANCELLED", "Execution cancelled by caller");
                return Ok(ExecutionResult::failed(&ErrorKind::Cancelled, "execution cancelled by caller")
                    .with_elapsed(elapsed(started)));
            }
        };

        if !raw.unavailable_modules.is_empty() {
            warn!(modules = ?raw.unavailable_modules, "Preloaded modules are missing from the interpreter");
        }

        let result = conclude(raw, &job.request.namespace, request.capture_locals, limits)
            .with_elapsed(elapsed(started));
        debug!(
            state = final_state(&result),
            error_type = result.error_type.as_deref().unwrap_or("-"),
            elapsed = result.execution_time_seconds,
            "Execution finished"
        );
        Ok(result)
    }
}

/// The error kind and message that block execution, if any.
fn rejection(validation: &ValidationResult) -> Option<(ErrorKind, String)> {
    if validation.is_safe {
        return None;
    }
    let kind = if validation.is_syntax_error() {
        ErrorKind::SyntaxInvalid
    } else {
        ErrorKind::SecurityError
    };
    let message = validation.first_blocking_issue().map_or_else(
        || "code was rejected by static analysis".to_string(),
        |issue| format!("line {}: {}", issue.line, issue.message),
    );
    Some((kind, message))
}

/// Turn what the boundary observed into the caller's result.
fn conclude(
    raw: RawExecutionOutcome,
    namespace: &ExecutionNamespace,
    capture_locals: bool,
    limits: ResolvedLimits,
) -> ExecutionResult {
    let RawExecutionOutcome {
        stdout,
        stderr,
        locals_snapshot,
        termination,
        peak_memory_kb,
        ..
    } = raw;

    let mut result = match termination {
        Termination::Completed => {
            let mut result = ExecutionResult::completed(stdout, stderr);
            if capture_locals {
                result.locals_dict = Some(sanitize_locals(locals_snapshot.unwrap_or_default(), namespace));
            }
            result
        }
        Termination::Raised { exc_type, message } => {
            ExecutionResult::failed(&ErrorKind::User(exc_type), message).with_output(stdout, stderr)
        }
        Termination::SyntaxInvalid { line, message, .. } => {
            let message = match line {
                Some(line) => format!("line {line}: syntax error: {message}"),
                None => format!("syntax error: {message}"),
            };
            ExecutionResult::failed(&ErrorKind::SyntaxInvalid, message).with_output(stdout, stderr)
        }
        Termination::TimedOut => ExecutionResult::failed(
            &ErrorKind::TimeoutError,
            format!(
                "execution exceeded the {} second time limit",
                limits.timeout_seconds
            ),
        )
        .with_output(stdout, stderr),
        Termination::CpuLimit => ExecutionResult::failed(
            &ErrorKind::TimeoutError,
            "execution exceeded its CPU time limit",
        )
        .with_output(stdout, stderr),
        Termination::MemoryExceeded(detail) => ExecutionResult::failed(
            &ErrorKind::MemoryLimitError,
            format!(
                "execution exceeded the {} MB memory limit: {detail}",
                limits.memory_mb
            ),
        )
        .with_output(stdout, stderr),
        Termination::Crashed(detail) => {
            ExecutionResult::failed(&ErrorKind::ProcessCrashed, detail).with_output(stdout, stderr)
        }
    };

    result.memory_used_mb = peak_memory_kb.map(kb_to_mb);
    result
}

#[allow(clippy::cast_precision_loss)]
fn kb_to_mb(kb: u64) -> f64 {
    kb as f64 / 1024.0
}

fn final_state(result: &ExecutionResult) -> &'static str {
    match result.error_type.as_deref() {
        None => "COMPLETED",
        Some("TimeoutError") => "TIMED_OUT",
        Some("MemoryLimitError") => "MEMORY_EXCEEDED",
        Some(_) => "FAILED",
    }
}

fn elapsed(started: Instant) -> f64 {
    started.elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    type Respond = fn(&IsolatedJob) -> Result<RawExecutionOutcome, SandboxFault>;

    struct MockBoundary {
        calls: AtomicUsize,
        last_job: Mutex<Option<IsolatedJob>>,
        respond: Respond,
        delay: Option<Duration>,
    }

    impl MockBoundary {
        fn new(respond: Respond) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                last_job: Mutex::new(None),
                respond,
                delay: None,
            })
        }

        fn slow() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                last_job: Mutex::new(None),
                respond: |_| Ok(outcome(Termination::Completed)),
                delay: Some(Duration::from_secs(60)),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IsolationBoundary for MockBoundary {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn run_isolated(&self, job: &IsolatedJob) -> Result<RawExecutionOutcome, SandboxFault> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_job.lock().unwrap() = Some(job.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.respond)(job)
        }
    }

    fn outcome(termination: Termination) -> RawExecutionOutcome {
        RawExecutionOutcome {
            stdout: String::new(),
            stderr: String::new(),
            locals_snapshot: None,
            termination,
            peak_memory_kb: Some(30_720),
            unavailable_modules: vec![],
        }
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn sandbox(mock: &Arc<MockBoundary>) -> Sandbox {
        Sandbox::with_boundary(Config::default(), mock.clone())
    }

    #[tokio::test]
    async fn forbidden_import_never_spawns() {
        let mock = MockBoundary::new(|_| Ok(outcome(Termination::Completed)));
        let result = sandbox(&mock)
            .execute(&ExecutionRequest::new("import os\nos.system('ls')"))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("SecurityError"));
        assert!(result.error_message.unwrap().contains("'os'"));
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn syntax_error_never_spawns() {
        let mock = MockBoundary::new(|_| Ok(outcome(Termination::Completed)));
        let result = sandbox(&mock)
            .execute(&ExecutionRequest::new("def f(:\n    pass"))
            .await
            .unwrap();

        assert_eq!(result.error_type.as_deref(), Some("SyntaxInvalid"));
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn out_of_bounds_request_is_invalid() {
        let mock = MockBoundary::new(|_| Ok(outcome(Termination::Completed)));
        let sandbox = sandbox(&mock);

        for request in [
            ExecutionRequest::new("print(1)").timeout_seconds(0),
            ExecutionRequest::new("print(1)").max_memory_mb(4096),
            ExecutionRequest::new(""),
            // Out-of-bounds wins over dangerous code: the analyzer never runs
            ExecutionRequest::new("import os").timeout_seconds(301),
        ] {
            let result = sandbox.execute(&request).await.unwrap();
            assert_eq!(result.error_type.as_deref(), Some("InvalidRequest"));
        }
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn completed_run_with_locals() {
        let mock = MockBoundary::new(|_| {
            let mut raw = outcome(Termination::Completed);
            raw.stdout = "2\n".into();
            raw.locals_snapshot = Some(object(json!({"x": 2, "np": "<module>", "window": 20})));
            Ok(raw)
        });
        let request = ExecutionRequest::new("x = 1 + 1\nprint(x)")
            .capture_locals(true)
            .global("window", json!(20));
        let result = sandbox(&mock).execute(&request).await.unwrap();

        assert!(result.success);
        assert_eq!(result.stdout, "2\n");
        assert_eq!(result.error_type, None);
        assert_eq!(result.locals_dict, Some(object(json!({"x": 2, "window": 20}))));
        assert_eq!(result.memory_used_mb, Some(30.0));
        assert!(result.execution_time_seconds >= 0.0);
    }

    #[tokio::test]
    async fn locals_omitted_unless_requested() {
        let mock = MockBoundary::new(|_| {
            let mut raw = outcome(Termination::Completed);
            raw.locals_snapshot = Some(object(json!({"x": 2})));
            Ok(raw)
        });
        let result = sandbox(&mock)
            .execute(&ExecutionRequest::new("x = 2"))
            .await
            .unwrap();
        assert!(result.locals_dict.is_none());
    }

    #[tokio::test]
    async fn job_carries_limits_and_namespace() {
        let mock = MockBoundary::new(|_| Ok(outcome(Termination::Completed)));
        let request = ExecutionRequest::new("print(lookback)")
            .timeout_seconds(10)
            .max_memory_mb(256)
            .global("lookback", json!(5))
            .global("__builtins__", json!({}));
        sandbox(&mock).execute(&request).await.unwrap();

        let job = mock.last_job.lock().unwrap().clone().unwrap();
        assert_eq!(job.timeout, Duration::from_secs(10));
        assert_eq!(job.ceilings.memory_mb, 256);
        assert_eq!(job.ceilings.cpu_seconds, 11);
        assert_eq!(job.request.namespace.globals.get("lookback"), Some(&json!(5)));
        assert!(!job.request.namespace.globals.contains_key("__builtins__"));
    }

    #[tokio::test]
    async fn user_exception_is_data() {
        let mock = MockBoundary::new(|_| {
            let mut raw = outcome(Termination::Raised {
                exc_type: "ZeroDivisionError".into(),
                message: "division by zero".into(),
            });
            raw.stderr = "Traceback (most recent call last):\nZeroDivisionError: division by zero\n".into();
            Ok(raw)
        });
        let result = sandbox(&mock)
            .execute(&ExecutionRequest::new("result = 1/0"))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("ZeroDivisionError"));
        assert_eq!(result.error_message.as_deref(), Some("division by zero"));
        assert!(result.stderr.contains("Traceback"));
    }

    #[tokio::test]
    async fn limits_map_to_error_kinds() {
        let cases: [(Respond, &str); 4] = [
            (|_| Ok(outcome(Termination::TimedOut)), "TimeoutError"),
            (|_| Ok(outcome(Termination::CpuLimit)), "TimeoutError"),
            (
                |_| Ok(outcome(Termination::MemoryExceeded("killed by the operating system".into()))),
                "MemoryLimitError",
            ),
            (
                |_| Ok(outcome(Termination::Crashed("child terminated by SIGSEGV".into()))),
                "ProcessCrashed",
            ),
        ];
        for (respond, expected) in cases {
            let mock = MockBoundary::new(respond);
            let result = sandbox(&mock)
                .execute(&ExecutionRequest::new("x = 1"))
                .await
                .unwrap();
            assert_eq!(result.error_type.as_deref(), Some(expected));
            assert!(!result.success);
        }
    }

    #[tokio::test]
    async fn timeout_keeps_partial_output() {
        let mock = MockBoundary::new(|_| {
            let mut raw = outcome(Termination::TimedOut);
            raw.stdout = "tick\ntick\n".into();
            Ok(raw)
        });
        let result = sandbox(&mock)
            .execute(&ExecutionRequest::new("while True: pass").timeout_seconds(2))
            .await
            .unwrap();
        assert_eq!(result.stdout, "tick\ntick\n");
        assert_eq!(
            result.error_message.as_deref(),
            Some("execution exceeded the 2 second time limit")
        );
    }

    #[tokio::test]
    async fn child_syntax_error_reports_line() {
        let mock = MockBoundary::new(|_| {
            Ok(outcome(Termination::SyntaxInvalid {
                line: Some(3),
                column: Some(4),
                message: "invalid syntax".into(),
            }))
        });
        let result = sandbox(&mock)
            .execute(&ExecutionRequest::new("x = 1"))
            .await
            .unwrap();
        assert_eq!(result.error_type.as_deref(), Some("SyntaxInvalid"));
        assert_eq!(
            result.error_message.as_deref(),
            Some("line 3: syntax error: invalid syntax")
        );
    }

    #[tokio::test]
    async fn fault_propagates() {
        let mock = MockBoundary::new(|_| Err(SandboxFault::Protocol("malformed frame".into())));
        let err = sandbox(&mock)
            .execute(&ExecutionRequest::new("x = 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxFault::Protocol(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_the_run() {
        let mock = MockBoundary::slow();
        let started = Instant::now();
        let result = sandbox(&mock)
            .execute_until(&ExecutionRequest::new("x = 1"), std::future::ready(()))
            .await
            .unwrap();
        assert_eq!(result.error_type.as_deref(), Some("Cancelled"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn validate_is_deterministic() {
        let mock = MockBoundary::new(|_| Ok(outcome(Termination::Completed)));
        let sandbox = sandbox(&mock);
        let code = "import pandas as pd\nframe = pd.read_csv('x.csv')\n";
        let first = sandbox.validate(code);
        assert_eq!(first, sandbox.validate(code));
        assert!(!first.is_safe);
        assert_eq!(mock.calls(), 0);
    }

    #[test]
    fn limits_reflect_config() {
        let mock = MockBoundary::new(|_| Ok(outcome(Termination::Completed)));
        let limits = sandbox(&mock).get_limits();
        assert_eq!((limits.timeout.min, limits.timeout.max, limits.timeout.default), (1, 300, 30));
        assert_eq!(
            (limits.memory_mb.min, limits.memory_mb.max, limits.memory_mb.default),
            (64, 2048, 512)
        );
    }
}
