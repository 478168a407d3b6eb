//! End-to-end runs against a real interpreter.
//!
//! Every test returns early when no `python3` is on the PATH.

use std::time::{Duration, Instant};

use factor_sandbox::capture::TRUNCATION_MARKER;
use factor_sandbox::config::{IsolationMode, OutputConfig, RegistryConfig, RuntimeConfig};
use factor_sandbox::{Config, ExecutionRequest, Sandbox};
use serde_json::json;

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success())
}

fn sandbox_with(config: Config) -> Option<Sandbox> {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return None;
    }
    Some(Sandbox::new(config))
}

fn sandbox(isolation: IsolationMode) -> Option<Sandbox> {
    sandbox_with(Config {
        runtime: RuntimeConfig {
            isolation,
            ..RuntimeConfig::default()
        },
        ..Config::default()
    })
}

#[tokio::test]
async fn prints_hello() {
    let Some(sandbox) = sandbox(IsolationMode::Process) else {
        return;
    };
    let result = sandbox
        .execute(&ExecutionRequest::new("print('hello')"))
        .await
        .unwrap();

    assert!(result.success, "{result:?}");
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.stderr, "");
    assert_eq!(result.error_type, None);
}

#[tokio::test]
async fn forbidden_module_is_rejected() {
    let Some(sandbox) = sandbox(IsolationMode::Process) else {
        return;
    };
    let code = "import os\nos.system('ls')";

    let validation = sandbox.validate(code);
    assert!(!validation.is_safe);
    assert_eq!(
        serde_json::to_value(validation.status).unwrap(),
        json!("DANGEROUS")
    );

    let started = Instant::now();
    let result = sandbox.execute(&ExecutionRequest::new(code)).await.unwrap();
    assert_eq!(result.error_type.as_deref(), Some("SecurityError"));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn infinite_loop_times_out() {
    let Some(sandbox) = sandbox(IsolationMode::Process) else {
        return;
    };
    let started = Instant::now();
    let result = sandbox
        .execute(&ExecutionRequest::new("while True: pass").timeout_seconds(2))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(!result.success);
    assert_eq!(result.error_type.as_deref(), Some("TimeoutError"));
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
}

#[tokio::test]
async fn output_survives_timeout() {
    let Some(sandbox) = sandbox(IsolationMode::Process) else {
        return;
    };
    let result = sandbox
        .execute(&ExecutionRequest::new("print('tick')\nwhile True: pass").timeout_seconds(2))
        .await
        .unwrap();

    assert_eq!(result.error_type.as_deref(), Some("TimeoutError"));
    assert_eq!(result.stdout, "tick\n");
}

#[cfg(unix)]
#[tokio::test]
async fn huge_allocation_hits_memory_limit() {
    let Some(sandbox) = sandbox(IsolationMode::Process) else {
        return;
    };
    let result = sandbox
        .execute(
            &ExecutionRequest::new("x = [0]*10**9")
                .max_memory_mb(64)
                .timeout_seconds(20),
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.error_type.as_deref(), Some("MemoryLimitError"), "{result:?}");
    assert!(result.execution_time_seconds < 20.0);
}

#[tokio::test]
async fn user_exception_carries_traceback() {
    let Some(sandbox) = sandbox(IsolationMode::Process) else {
        return;
    };
    let result = sandbox
        .execute(&ExecutionRequest::new("result = 1/0"))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.error_type.as_deref(), Some("ZeroDivisionError"));
    assert_eq!(result.error_message.as_deref(), Some("division by zero"));
    assert!(result.stderr.contains("Traceback"));
    assert!(result.stderr.contains("ZeroDivisionError"));
}

#[tokio::test]
async fn captures_locals() {
    let Some(sandbox) = sandbox(IsolationMode::Process) else {
        return;
    };
    let result = sandbox
        .execute(&ExecutionRequest::new("x = 1 + 1\nprint(x)").capture_locals(true))
        .await
        .unwrap();

    assert!(result.success, "{result:?}");
    assert_eq!(result.stdout, "2\n");
    let locals = result.locals_dict.unwrap();
    assert_eq!(serde_json::Value::Object(locals), json!({"x": 2}));
}

#[tokio::test]
async fn globals_are_injected() {
    let Some(sandbox) = sandbox(IsolationMode::Process) else {
        return;
    };
    let request = ExecutionRequest::new("print(window * 2)").global("window", json!(21));
    let result = sandbox.execute(&request).await.unwrap();
    assert_eq!(result.stdout, "42\n");
}

#[tokio::test]
async fn whitelisted_import_works() {
    let Some(sandbox) = sandbox(IsolationMode::Process) else {
        return;
    };
    let result = sandbox
        .execute(&ExecutionRequest::new("import math\nprint(math.sqrt(16))"))
        .await
        .unwrap();
    assert!(result.success, "{result:?}");
    assert_eq!(result.stdout, "4.0\n");
}

#[tokio::test]
async fn namespace_has_no_open() {
    let Some(sandbox) = sandbox(IsolationMode::Process) else {
        return;
    };
    // Not a call, so the analyzer lets it through; the namespace stops it.
    let result = sandbox
        .execute(&ExecutionRequest::new("reader = open"))
        .await
        .unwrap();
    assert_eq!(result.error_type.as_deref(), Some("NameError"));
}

#[tokio::test]
async fn thread_isolation_runs_and_times_out() {
    let Some(sandbox) = sandbox(IsolationMode::Thread) else {
        return;
    };
    assert_eq!(sandbox.boundary_name(), "thread");

    let result = sandbox
        .execute(&ExecutionRequest::new("print('hello')"))
        .await
        .unwrap();
    assert_eq!(result.stdout, "hello\n");

    let started = Instant::now();
    let result = sandbox
        .execute(&ExecutionRequest::new("while True: pass").timeout_seconds(1))
        .await
        .unwrap();
    assert_eq!(result.error_type.as_deref(), Some("TimeoutError"));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn concurrent_executions_are_independent() {
    let Some(sandbox) = sandbox(IsolationMode::Process) else {
        return;
    };
    let runs: Vec<_> = (0..4)
        .map(|i| {
            let sandbox = sandbox.clone();
            tokio::spawn(async move {
                let request = ExecutionRequest::new("print(n * n)").global("n", json!(i));
                sandbox.execute(&request).await.unwrap()
            })
        })
        .collect();
    for (i, run) in runs.into_iter().enumerate() {
        let result = run.await.unwrap();
        assert_eq!(result.stdout, format!("{}\n", i * i));
    }
}

#[tokio::test]
async fn private_module_aliases_are_rejected_before_running() {
    let Some(sandbox) = sandbox(IsolationMode::Process) else {
        return;
    };
    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("escaped");
    let escapes = [
        format!(
            "import typing\nprint(typing.sys.modules['os'].system('touch {}'))",
            marker.display()
        ),
        "import random\nprint(random._os.listdir('/')[:3])".to_string(),
        format!(
            "import collections\nm = collections._sys.modules['os']\nm.system('touch {}')",
            marker.display()
        ),
    ];
    for code in &escapes {
        assert!(!sandbox.validate(code).is_safe, "{code}");
        let result = sandbox.execute(&ExecutionRequest::new(code.as_str())).await.unwrap();
        assert_eq!(result.error_type.as_deref(), Some("SecurityError"), "{code}");
        assert_eq!(result.stdout, "");
    }
    assert!(!marker.exists());
}

#[tokio::test]
async fn module_views_hide_foreign_modules() {
    // With the name check switched off, the child alone has to hold the line.
    let Some(sandbox) = sandbox_with(Config {
        registry: RegistryConfig {
            blocked_module_names: Vec::new(),
            ..RegistryConfig::default()
        },
        ..Config::default()
    }) else {
        return;
    };
    let refused = [
        ("import typing\nhandle = typing.sys", "AttributeError"),
        ("import random\nhandle = random._os", "AttributeError"),
        ("from collections import _sys", "ImportError"),
        ("import math\nmath.pi = 3", "AttributeError"),
    ];
    for (code, error_type) in refused {
        assert!(sandbox.validate(code).is_safe, "{code}");
        let result = sandbox.execute(&ExecutionRequest::new(code)).await.unwrap();
        assert!(!result.success, "{code}");
        assert_eq!(result.error_type.as_deref(), Some(error_type), "{code}: {result:?}");
    }

    let result = sandbox
        .execute(&ExecutionRequest::new(
            "import collections.abc\nfrom math import floor\nprint(collections.abc.Mapping.__name__, floor(2.5))",
        ))
        .await
        .unwrap();
    assert!(result.success, "{result:?}");
    assert_eq!(result.stdout, "Mapping 2\n");
}

#[tokio::test]
async fn stream_cap_truncates_once() {
    let Some(sandbox) = sandbox_with(Config {
        output: OutputConfig {
            max_stream_bytes: 10,
            ..OutputConfig::default()
        },
        ..Config::default()
    }) else {
        return;
    };
    let result = sandbox
        .execute(&ExecutionRequest::new("for _ in range(5):\n    print('xxxxxxx')"))
        .await
        .unwrap();

    assert!(result.success, "{result:?}");
    assert_eq!(result.stdout, format!("xxxxxxx\nxx{TRUNCATION_MARKER}"));
    assert_eq!(result.stdout.matches(TRUNCATION_MARKER.trim_start()).count(), 1);
}

#[tokio::test]
async fn locals_snapshot_placeholders() {
    let Some(sandbox) = sandbox_with(Config {
        output: OutputConfig {
            max_locals_bytes: 20,
            ..OutputConfig::default()
        },
        ..Config::default()
    }) else {
        return;
    };
    let code = "class K:\n    pass\n\nk = K()\nbig = 'y' * 100\nsmall = 1";
    let result = sandbox
        .execute(&ExecutionRequest::new(code).capture_locals(true))
        .await
        .unwrap();

    assert!(result.success, "{result:?}");
    let locals = serde_json::Value::Object(result.locals_dict.unwrap());
    assert_eq!(
        locals,
        json!({
            "K": "<unserializable: type>",
            "k": "<unserializable: K>",
            "big": "<truncated: str>",
            "small": 1,
        })
    );
}
