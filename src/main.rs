//! Tasksmith - scoped task runner for AI coding agents

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use tasksmith::config::{resolve, ConfigLoader, ParallelConfig};
use tasksmith::executor::{ConfigOverrides, ExecutorOptions};
use tasksmith::task::load_blocked_status;
use tasksmith::{
    detect_dependencies, partition_waves, ExecutorDependencies, ExecutorResult, ExecutorRunner,
    ParallelCoordinator, ParallelExecutionResult, RunStatus, TaskError, TaskExecutor, TaskScope,
    TaskSpec,
};

#[derive(Parser)]
#[command(name = "tasksmith")]
#[command(version)]
#[command(about = "Run scoped coding tasks through an AI agent", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one or more task files
    Run {
        /// Task markdown files, relative to the project
        #[arg(required = true)]
        tasks: Vec<PathBuf>,

        /// Continue tasks that stopped with a BLOCKED section
        #[arg(long)]
        resume: bool,

        /// Build the first prompt and stop without calling the agent
        #[arg(long)]
        dry_run: bool,

        /// Tasks in flight at once when running several
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Override execution.max_iterations
        #[arg(short, long)]
        max_iterations: Option<u32>,

        /// Config file to use instead of <project>/tasksmith.toml
        #[arg(long, env = "TASKSMITH_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Show dependency edges and waves for a set of tasks
    Deps {
        #[arg(required = true)]
        tasks: Vec<PathBuf>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show the BLOCKED section of a task
    Status { task: PathBuf },
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose {
        "tasksmith=debug,info"
    } else {
        "tasksmith=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn fail(error: &TaskError) -> ! {
    eprintln!("{} {}", "Error:".red().bold(), error);
    std::process::exit(error.exit_code());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());
    if !project_path.is_dir() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project_path.display()
        );
        std::process::exit(1);
    }

    match cli.command {
        Commands::Run {
            tasks,
            resume,
            dry_run,
            concurrency,
            max_iterations,
            config,
        } => {
            let mut loader = ConfigLoader::new();
            if let Some(path) = config {
                loader = loader.with_explicit_path(path);
            }
            let raw = loader.load(&project_path).unwrap_or_else(|e| fail(&e));

            let options = ExecutorOptions {
                resume,
                dry_run,
                overrides: ConfigOverrides {
                    max_iterations,
                    concurrency,
                },
            };
            let deps = ExecutorDependencies::real(&project_path);

            if let [task] = tasks.as_slice() {
                let result = TaskExecutor::new(&project_path, raw, deps)
                    .with_options(options)
                    .run(task)
                    .await;
                print_result(&result, dry_run);
                std::process::exit(result.exit_code);
            }

            let concurrency = concurrency.unwrap_or_else(|| {
                resolve(&raw, &|name: &str| std::env::var(name).ok())
                    .map(|r| r.config.parallel.concurrency)
                    .unwrap_or(ParallelConfig::default().concurrency)
            });
            let runner = ExecutorRunner::new(&project_path, raw, deps).with_options(options);
            let outcome = ParallelCoordinator::new(&project_path, Arc::new(runner))
                .with_concurrency(concurrency)
                .run(&tasks)
                .await
                .unwrap_or_else(|e| fail(&e));

            print_parallel(&outcome, dry_run);
            if !outcome.all_succeeded() {
                std::process::exit(1);
            }
        }

        Commands::Deps { tasks, json } => {
            let mut scopes = Vec::with_capacity(tasks.len());
            for task in &tasks {
                let spec = TaskSpec::load(&project_path.join(task))
                    .await
                    .unwrap_or_else(|e| fail(&e));
                scopes.push(TaskScope::new(task.clone(), spec.allowed));
            }
            let dependencies = detect_dependencies(&scopes);
            let waves = partition_waves(&tasks, &dependencies);

            if json {
                let report = serde_json::json!({
                    "dependencies": dependencies,
                    "waves": waves,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            println!("{}", "Dependencies".bold());
            if dependencies.is_empty() {
                println!("  {}", "none".dimmed());
            }
            for dep in &dependencies {
                println!(
                    "  {} -> {}  ({} ~ {})",
                    dep.task.display(),
                    dep.depends_on.display(),
                    dep.patterns.0.cyan(),
                    dep.patterns.1.cyan()
                );
            }
            println!("\n{}", "Waves".bold());
            for (n, wave) in waves.iter().enumerate() {
                let names: Vec<String> = wave.iter().map(|p| p.display().to_string()).collect();
                println!("  {}: {}", n + 1, names.join(", "));
            }
        }

        Commands::Status { task } => {
            let path = project_path.join(&task);
            let status = load_blocked_status(&path)
                .await
                .unwrap_or_else(|e| fail(&e));
            let Some(status) = status else {
                fail(&TaskError::NotBlocked { path });
            };

            println!("{} {}", "BLOCKED".yellow().bold(), task.display());
            println!("  Issue:      {}", status.blocking_issue);
            println!("  Iteration:  {}", status.previous_iteration);
            println!("  Started:    {}", status.started_at.to_rfc3339());
            println!("  Blocked:    {}", status.blocked_at.to_rfc3339());
            println!("  Resumed:    {} time(s)", status.resume_count());
            if !status.files_modified.is_empty() {
                println!("  Files:");
                for file in &status.files_modified {
                    println!("    - {}", file.display());
                }
            }
        }
    }

    Ok(())
}

fn status_label(result: &ExecutorResult, dry_run: bool) -> colored::ColoredString {
    match result.status {
        _ if dry_run && result.success => "DRY RUN".cyan().bold(),
        RunStatus::Completed => "COMPLETED".green().bold(),
        RunStatus::Blocked => "BLOCKED".yellow().bold(),
        _ => "FAILED".red().bold(),
    }
}

fn display_task(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn print_result(result: &ExecutorResult, dry_run: bool) {
    println!(
        "{} {} ({} iteration(s), {} file(s))",
        status_label(result, dry_run),
        display_task(&result.task_path),
        result.iterations,
        result.files_modified.len()
    );
    if let Some(ref reason) = result.blocked_reason {
        println!("  {} {}", "Reason:".yellow(), reason);
    }
    if let Some(ref error) = result.error {
        println!("  {} {}", "Error:".red(), error);
    }
    if let Some(ref final_path) = result.final_path {
        if *final_path != result.task_path {
            println!("  Moved to {}", final_path.display());
        }
    }
    if let Some(ref usage) = result.token_usage {
        println!("  Tokens: {} in / {} out", usage.input, usage.output);
    }
}

fn print_parallel(outcome: &ParallelExecutionResult, dry_run: bool) {
    for result in &outcome.results {
        print_result(result, dry_run);
    }
    for conflict in &outcome.conflicts {
        println!(
            "{} {} touched by {} and {}",
            "Conflict:".yellow().bold(),
            conflict.file.display(),
            display_task(&conflict.owner),
            display_task(&conflict.task)
        );
    }
    println!(
        "\n{} {}/{} succeeded, {} blocked, {} failed in {} wave(s), {} iteration(s), {:.1}s",
        "Summary:".bold(),
        outcome.succeeded,
        outcome.total,
        outcome.blocked,
        outcome.failed,
        outcome.waves.len(),
        outcome.total_iterations,
        outcome.duration_ms as f64 / 1000.0
    );
}
