//! factor-sandbox
//!
//! Runs user-authored Python factor code under a static whitelist check,
//! a restricted namespace and OS resource limits. Serves the sandbox over
//! MCP on stdio, or runs one-off validations and executions from the
//! command line. Configuration comes from `--config` or the
//! `FACTOR_SANDBOX_CONFIG` env var.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use factor_sandbox::{mcp, Config, ExecutionRequest, Sandbox};

#[derive(Parser, Debug)]
#[command(name = "factor-sandbox", version)]
#[command(about = "Restricted sandbox for user-authored Python factor code")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// JSON configuration file; overrides FACTOR_SANDBOX_CONFIG
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the sandbox as an MCP server
    Serve {
        /// Run in stdio mode (for MCP clients)
        #[arg(long)]
        stdio: bool,
    },
    /// Statically analyze a file ("-" for stdin) and print the report
    Validate { file: PathBuf },
    /// Validate and run a file ("-" for stdin) and print the result
    Run {
        file: PathBuf,

        /// Wall-clock limit in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Memory limit in MB
        #[arg(long)]
        memory_mb: Option<u64>,

        /// Include the variables the code defined
        #[arg(long)]
        locals: bool,

        /// JSON object of variables to inject
        #[arg(long)]
        globals: Option<String>,
    },
    /// Print the accepted timeout and memory bounds
    Limits,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol and reports)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    let sandbox = Sandbox::new(config);

    info!(
        isolation = sandbox.boundary_name(),
        python = %sandbox.config().runtime.python,
        "Loaded configuration"
    );

    match args.command {
        Command::Serve { stdio } => {
            if !stdio {
                anyhow::bail!("Only --stdio mode is currently supported");
            }
            mcp::serve_stdio(sandbox).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate { file } => {
            let code = read_source(&file)?;
            let result = sandbox.validate(&code);
            print_json(&result)?;
            Ok(exit_code(result.is_safe))
        }
        Command::Run {
            file,
            timeout,
            memory_mb,
            locals,
            globals,
        } => {
            let request = ExecutionRequest {
                code: read_source(&file)?,
                timeout_seconds: timeout,
                max_memory_mb: memory_mb,
                globals: parse_globals(globals.as_deref())?,
                capture_locals: locals,
                correlation_id: None,
            };
            let result = sandbox.execute(&request).await?;
            print_json(&result)?;
            Ok(exit_code(result.success))
        }
        Command::Limits => {
            print_json(&sandbox.get_limits())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn read_source(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut code = String::new();
        std::io::stdin()
            .read_to_string(&mut code)
            .context("Failed to read code from stdin")?;
        return Ok(code);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn parse_globals(json: Option<&str>) -> Result<Map<String, Value>> {
    let Some(json) = json else {
        return Ok(Map::new());
    };
    match serde_json::from_str(json).context("--globals is not valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("--globals must be a JSON object"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to encode result")?;
    println!("{json}");
    Ok(())
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
