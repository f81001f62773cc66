//! taskloop - local LLM-powered autonomous development workflow.
//!
//! Main entry point for the CLI binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use taskloop::client::OllamaClient;
use taskloop::display::Display;
use taskloop::engine::{create_loop_engine, LoopResult, LoopStatus};
use taskloop::health;
use taskloop_core::config::{self, Config};
use taskloop_core::phases::PhaseName;
use taskloop_core::session::{self, SessionError};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

/// Health checks use a short timeout and a single attempt for fast feedback.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "taskloop", about = "Local LLM-powered autonomous development workflow", version)]
struct Cli {
    /// Minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Skip the Ollama health check
    #[arg(long, global = true)]
    skip_check: bool,

    /// Project root directory (default: current directory)
    #[arg(short, long, global = true)]
    project: Option<PathBuf>,

    /// Show resolved configuration before running
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new session with a task
    Start {
        /// Task description
        task: String,
    },
    /// Resume an existing session
    Resume {
        /// Session ID to resume
        session_id: String,
        /// Additional input to provide
        #[arg(short, long)]
        input: Option<String>,
    },
    /// Show details of a session
    Show {
        /// Session ID to show
        session_id: String,
        /// Include conversation history and skill outputs
        #[arg(short, long)]
        verbose: bool,
    },
    /// List recent sessions
    List {
        /// Number of sessions to show
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
    /// Delete a session and its files
    Delete {
        /// Session ID to delete
        session_id: String,
    },
}

fn print_error(message: &str) {
    eprintln!("Error: {message}");
}

fn main() {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let code = runtime.block_on(run(cli));
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let config = match config::load() {
        Ok(config) => config,
        Err(e) => {
            print_error(&format!("Failed to load config: {e}"));
            return 1;
        }
    };

    if cli.debug {
        println!("Config file: {}", config::config_path().display());
        println!("Model: {}", config.model);
        println!("Ollama URL: {}", config.ollama_url);
        println!("Max iterations: {}", config.max_iterations);
        println!("Session dir: {}", config.session_dir.display());
        println!();
    }

    let project_root = cli
        .project
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    match cli.command {
        Command::Start { ref task } => cmd_start(&cli, &config, task, &project_root).await,
        Command::Resume {
            ref session_id,
            ref input,
        } => cmd_resume(&cli, &config, session_id, input.as_deref(), &project_root).await,
        Command::Show {
            ref session_id,
            verbose,
        } => cmd_show(&config, session_id, verbose),
        Command::List { limit } => cmd_list(&config, limit),
        Command::Delete { ref session_id } => cmd_delete(&cli, &config, session_id),
    }
}

/// Verify Ollama is up and the model is installed; prints the failure.
async fn preflight(config: &Config) -> bool {
    let probe = OllamaClient::new(&config.ollama_url, HEALTH_CHECK_TIMEOUT, 1);
    let report = health::check(&probe, &config.model).await;
    if !report.healthy {
        print_error(&report.message);
    }
    report.healthy
}

async fn cmd_start(cli: &Cli, config: &Config, task: &str, project_root: &std::path::Path) -> i32 {
    if !cli.skip_check && !preflight(config).await {
        return 1;
    }

    let session = match session::create(task, &config.session_dir) {
        Ok(session) => session,
        Err(e) => {
            print_error(&format!("Failed to create session: {e}"));
            return 1;
        }
    };

    let session_id = session.session_id.clone();
    let log_dir = session::session_dir(&config.session_dir, &session_id);
    let display = Display::new(cli.quiet, Some(log_dir));
    display.show_status(&format!("Created session: {session_id}"), false);
    display.start_session_log(&session_id);

    let client = OllamaClient::with_base_url(&config.ollama_url);
    let mut engine = create_loop_engine(
        client,
        config.clone(),
        display.clone(),
        session,
        PhaseName::Prd,
    );

    display.show_status(&format!("Starting task: {}", preview(task, 50)), false);

    let cancel = CancellationToken::new();
    let signal_guard = install_interrupt(&cancel);
    let result = engine.run(task, project_root, None, &cancel, None).await;
    signal_guard.abort();

    display.end_session_log(&session_id, result.status.as_str());
    handle_result(&result, &display)
}

async fn cmd_resume(
    cli: &Cli,
    config: &Config,
    session_id: &str,
    input: Option<&str>,
    project_root: &std::path::Path,
) -> i32 {
    let session = match session::load(session_id, &config.session_dir) {
        Ok(session) => session,
        Err(SessionError::NotFound(_)) => {
            print_error(&format!("Session not found: {session_id}"));
            return 1;
        }
        Err(e) => {
            print_error(&format!("Failed to load session: {e}"));
            return 1;
        }
    };

    let log_dir = session::session_dir(&config.session_dir, session_id);
    let display = Display::new(cli.quiet, Some(log_dir));
    display.show_status(&format!("Resuming session: {session_id}"), false);
    display.show_status(
        &format!("Task: {}", preview(&session.task_description, 50)),
        false,
    );

    if !cli.skip_check && !preflight(config).await {
        return 1;
    }

    display.start_session_log(session_id);

    let client = OllamaClient::with_base_url(&config.ollama_url);
    let mut engine = create_loop_engine(
        client,
        config.clone(),
        display.clone(),
        session,
        PhaseName::Prd,
    );

    let cancel = CancellationToken::new();
    let signal_guard = install_interrupt(&cancel);
    let result = engine
        .resume(project_root, input, None, &cancel, None)
        .await;
    signal_guard.abort();

    display.end_session_log(session_id, result.status.as_str());
    handle_result(&result, &display)
}

fn cmd_show(config: &Config, session_id: &str, verbose: bool) -> i32 {
    let session = match session::load(session_id, &config.session_dir) {
        Ok(session) => session,
        Err(SessionError::NotFound(_)) => {
            print_error(&format!("Session not found: {session_id}"));
            return 1;
        }
        Err(e) => {
            print_error(&format!("Failed to load session: {e}"));
            return 1;
        }
    };

    println!("\nSession: {}", session.session_id);
    println!("{}", "=".repeat(60));
    println!("Task: {}", session.task_description);
    println!("Phase: {}", session.current_phase);
    println!("Created: {}", session.created_at);
    println!("Updated: {}", session.updated_at);
    println!("Messages: {}", session.conversation_history.len());

    if verbose {
        println!("\n{:-^60}", "Conversation History");
        let history = &session.conversation_history;
        let tail = history.len().saturating_sub(10);
        for (i, msg) in history[tail..].iter().enumerate() {
            println!(
                "{}. [{}] {}",
                i + 1,
                msg.role.to_uppercase(),
                preview(&msg.content, 100)
            );
        }

        if !session.skill_outputs.is_empty() {
            println!("\n{:-^60}", "Skill Outputs");
            for (skill, output) in &session.skill_outputs {
                println!("- {skill}: {} chars", output.to_string().len());
            }
        }
    }

    0
}

fn cmd_list(config: &Config, limit: usize) -> i32 {
    let sessions = session::list(&config.session_dir);

    if sessions.is_empty() {
        println!("No sessions found.");
        return 0;
    }

    println!("\n{:<20} {:<15} {:<40} Created", "ID", "Phase", "Task");
    println!("{}", "-".repeat(90));

    for info in sessions.iter().take(limit) {
        let task = preview(&info.task_description, 40);
        let created: String = info.created_at.chars().take(16).collect();
        println!(
            "{:<20} {:<15} {:<40} {created}",
            info.session_id, info.current_phase, task
        );
    }

    println!("\nTotal: {} sessions", sessions.len());
    0
}

fn cmd_delete(cli: &Cli, config: &Config, session_id: &str) -> i32 {
    match session::delete(session_id, &config.session_dir) {
        Ok(()) => {
            Display::new(cli.quiet, None)
                .show_status(&format!("Deleted session: {session_id}"), false);
            0
        }
        Err(SessionError::NotFound(_)) => {
            print_error(&format!("Session not found: {session_id}"));
            1
        }
        Err(e) => {
            print_error(&format!("Failed to delete session: {e}"));
            1
        }
    }
}

/// Spawn a ctrl-c listener that cancels the token. The returned handle is
/// aborted once the run finishes so the handler never outlives the run.
fn install_interrupt(cancel: &CancellationToken) -> tokio::task::JoinHandle<()> {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received interrupt, stopping after current exchange");
            cancel.cancel();
        }
    })
}

/// Map a terminal loop result to its exit code.
fn handle_result(result: &LoopResult, display: &Display) -> i32 {
    match result.status {
        LoopStatus::Completed => {
            display.show_status(
                &format!("Task completed in {} iterations", result.iterations),
                false,
            );
            0
        }
        LoopStatus::Interrupted => {
            display.show_status("Session interrupted. State saved.", false);
            130
        }
        LoopStatus::NeedsInput => {
            display.show_status("Waiting for user input. Resume with: taskloop resume", false);
            println!("\nOutput:\n{}", result.output);
            0
        }
        LoopStatus::MaxIterations => {
            display.show_status(&result.reason, true);
            1
        }
        LoopStatus::Error => {
            display.show_status(&format!("Error: {}", result.error), true);
            1
        }
        LoopStatus::Running => 1,
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let head: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir) -> Config {
        Config {
            model: "test".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            max_iterations: 50,
            session_dir: tmp.path().to_path_buf(),
        }
    }

    #[test]
    fn show_renders_an_existing_session() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let mut session = session::create("inspect me", &config.session_dir).unwrap();
        session.add_message("user", "inspect me");
        session.set_skill_output("prd", serde_json::json!({"doc": "text"}));
        session::save(&session, &config.session_dir).unwrap();

        assert_eq!(cmd_show(&config, &session.session_id, false), 0);
        assert_eq!(cmd_show(&config, &session.session_id, true), 0);
    }

    #[test]
    fn show_fails_for_a_missing_session() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        assert_eq!(cmd_show(&config, "20240101-000000-dead", false), 1);
    }

    #[test]
    fn preview_truncates_on_char_boundaries() {
        assert_eq!(preview("short", 10), "short");
        let long = "x".repeat(60);
        let cut = preview(&long, 50);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), 50);
    }
}
