use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use opexec_core::OperationDef;
use runner::{
    format_assigns, parse_assigns, read_output, resolve, OperationExecutor, RunDir, RunOptions,
    RunnerConfig,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const OPEXEC_DIR: &str = ".opexec";
const CONFIG_FILE: &str = "config.toml";

#[derive(Parser)]
#[command(name = "opexec")]
#[command(about = "Run operations with resolved parameters and captured output", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an operation and exit with its exit code
    Run {
        /// Operation definition (TOML)
        op_file: PathBuf,

        /// Parameter values as NAME=VALUE
        assigns: Vec<String>,

        /// Skip parameter validation
        #[arg(long)]
        force: bool,

        /// Don't mirror output to the terminal
        #[arg(short, long)]
        quiet: bool,

        /// Stop the operation after this many minutes
        #[arg(long, value_name = "MINUTES")]
        stop_after: Option<f64>,

        #[arg(long)]
        run_dir: Option<PathBuf>,

        /// Extra environment for the operation
        #[arg(long = "env", value_name = "NAME=VALUE")]
        env: Vec<String>,
    },
    /// Print resolved parameters without running anything
    Flags {
        op_file: PathBuf,

        assigns: Vec<String>,

        #[arg(long)]
        force: bool,
    },
    /// Print the captured output of a run
    Output {
        run_dir: PathBuf,

        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Run {
            op_file,
            assigns,
            force,
            quiet,
            stop_after,
            run_dir,
            env,
        } => {
            let mut options = RunOptions::default().with_force(force).with_quiet(quiet);
            if let Some(minutes) = stop_after {
                options = options.with_stop_after(minutes);
            }
            if let Some(dir) = run_dir {
                options = options.with_run_dir(dir);
            }
            for entry in &env {
                let (name, value) = parse_env(entry)?;
                options = options.with_env(name, value);
            }
            let code = run(&op_file, &assigns, options).await?;
            Ok(ExitCode::from(exit_status(code)))
        }
        Commands::Flags {
            op_file,
            assigns,
            force,
        } => {
            flags(&op_file, &assigns, force).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Output { run_dir, json } => {
            output(&run_dir, json).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(op_file: &Path, assigns: &[String], options: RunOptions) -> Result<i32> {
    let op = load_operation(op_file).await?;
    let user_values = parse_assigns(assigns, Some(op.parameters.as_slice()))?;

    let cwd = std::env::current_dir()?;
    let config = load_config(&cwd).await;
    let outcome = OperationExecutor::new(config)
        .run(&op, &user_values, options)
        .await
        .with_context(|| format!("Failed to run operation '{}'", op.name))?;

    if outcome.timed_out {
        eprintln!("Operation '{}' ran out of time", op.name);
    }
    eprintln!("Run directory: {}", outcome.run_dir.display());
    Ok(outcome.exit_code)
}

async fn flags(op_file: &Path, assigns: &[String], force: bool) -> Result<()> {
    let op = load_operation(op_file).await?;
    let user_values = parse_assigns(assigns, Some(op.parameters.as_slice()))?;
    let resolved = resolve(&op.parameters, &user_values, force)?;
    for line in format_assigns(&resolved) {
        println!("{}", line);
    }
    Ok(())
}

async fn output(run_dir: &Path, json: bool) -> Result<()> {
    let run_dir = RunDir::new(run_dir);
    let lines = read_output(&run_dir)
        .await
        .with_context(|| format!("Failed to read output in {}", run_dir.path().display()))?;

    for line in &lines {
        if json {
            println!("{}", serde_json::to_string(line)?);
        } else {
            println!("{} {} {}", line.time_ms, line.stream.as_str(), line.text);
        }
    }
    if let Some(pid) = run_dir.read_lock().await? {
        eprintln!("Run is still in progress (pid {})", pid);
    }
    Ok(())
}

async fn load_operation(path: &Path) -> Result<OperationDef> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut op: OperationDef = toml::from_str(&content)
        .with_context(|| format!("Invalid operation definition in {}", path.display()))?;
    if op.name.is_empty() {
        op.name = path
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("operation")
            .to_string();
    }
    Ok(op)
}

/// Project config overlaid with `OPEXEC_*` variables; an unreadable file
/// falls back to the defaults.
async fn load_config(cwd: &Path) -> RunnerConfig {
    let config_path = cwd.join(OPEXEC_DIR).join(CONFIG_FILE);
    let config = if config_path.exists() {
        match tokio::fs::read_to_string(&config_path).await {
            Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring invalid config {}: {}", config_path.display(), e);
                RunnerConfig::default()
            }),
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", config_path.display(), e);
                RunnerConfig::default()
            }
        }
    } else {
        RunnerConfig::default()
    };
    config.with_overrides(|name| std::env::var(name).ok())
}

fn parse_env(entry: &str) -> Result<(&str, &str)> {
    match entry.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name, value)),
        _ => bail!("Invalid --env '{}': expected NAME=VALUE", entry),
    }
}

/// Shell convention: signal deaths exit with 128 + the signal number.
fn exit_status(code: i32) -> u8 {
    if code < 0 {
        (128 + code.unsigned_abs()).min(255) as u8
    } else {
        (code & 0xff) as u8
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opexec=info,runner=info".into()),
        )
        .init();
}
