use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use events::{Event, EventBus};
use flowforge_core::{Blueprint, BuildOption, TodoList};
use orchestrator::{
    AnalyzerOrchestrator, DecisionPrompter, FixApproval, FixSummary, HttpAgentRuntime,
    Orchestrator, OrchestratorConfig, ReviewOutcome, RuntimeConfig, TaskOutcome,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const CONFIG_FILE: &str = "flowforge.toml";
const STORAGE_ENV: &str = "SESSION_STORAGE_PATH";
const RUNTIME_URL_ENV: &str = "FLOWFORGE_RUNTIME_URL";
const API_KEY_ENV: &str = "FLOWFORGE_API_KEY";

#[derive(Parser)]
#[command(name = "flowforge")]
#[command(about = "Gate-enforced multi-agent workflow builder", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./flowforge.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Agent runtime base URL
    #[arg(long, global = true)]
    runtime_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a workflow from a natural-language request
    Build {
        #[arg(required = true, num_args = 1..)]
        task: Vec<String>,

        /// Existing workflow to modify
        #[arg(long)]
        workflow: Option<String>,

        #[arg(long)]
        interactive: bool,
    },
    /// Audit an existing workflow, then optionally apply its urgent fixes
    Analyze {
        workflow_id: String,
        project_path: Option<PathBuf>,

        /// Ask whether to auto-fix, show manual steps, save or discard
        #[arg(long)]
        interactive: bool,

        /// Apply the P0/P1 recommendations without asking
        #[arg(long, conflicts_with = "interactive")]
        fix: bool,
    },
    /// Apply the pending P0/P1 fixes saved by an earlier analysis
    Fix { analysis_id: Uuid },
    /// Resume a session left in the active store
    Resume { session_id: Uuid },
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct FlowForgeConfig {
    orchestrator: OrchestratorSection,
    runtime: RuntimeConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct OrchestratorSection {
    storage_dir: PathBuf,
    max_qa_cycles: u32,
    agent_timeout_secs: u64,
    learnings_path: PathBuf,
    context_path: PathBuf,
    reports_dir: PathBuf,
    max_fix_attempts: u32,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            storage_dir: defaults.storage_dir,
            max_qa_cycles: defaults.max_qa_cycles,
            agent_timeout_secs: defaults.agent_timeout.as_secs(),
            learnings_path: defaults.learnings_path,
            context_path: defaults.context_path,
            reports_dir: defaults.reports_dir,
            max_fix_attempts: defaults.max_fix_attempts,
        }
    }
}

impl FlowForgeConfig {
    fn orchestrator_config(&self, interactive: bool) -> OrchestratorConfig {
        let section = &self.orchestrator;
        OrchestratorConfig::new(&section.storage_dir)
            .with_max_qa_cycles(section.max_qa_cycles)
            .with_agent_timeout(Duration::from_secs(section.agent_timeout_secs))
            .with_learnings_path(&section.learnings_path)
            .with_context_path(&section.context_path)
            .with_reports_dir(&section.reports_dir)
            .with_max_fix_attempts(section.max_fix_attempts)
            .with_interactive(interactive)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = load_config(cli.config.as_deref()).await?;
    apply_env_overrides(&mut config);
    if let Some(url) = cli.runtime_url {
        config.runtime.base_url = url;
    }

    let blocked = match cli.command {
        Commands::Build {
            task,
            workflow,
            interactive,
        } => build(&config, &task.join(" "), workflow, interactive).await?,
        Commands::Analyze {
            workflow_id,
            project_path,
            interactive,
            fix,
        } => analyze(&config, &workflow_id, project_path.as_deref(), interactive, fix).await?,
        Commands::Fix { analysis_id } => run_fixes(&config, analysis_id).await?,
        Commands::Resume { session_id } => resume(&config, session_id).await?,
    };

    if blocked {
        std::process::exit(1);
    }
    Ok(())
}

async fn build(
    config: &FlowForgeConfig,
    request: &str,
    workflow: Option<String>,
    interactive: bool,
) -> Result<bool> {
    let orchestrator_config = config.orchestrator_config(interactive);
    orchestrator_config.validate()?;

    let runtime = Arc::new(HttpAgentRuntime::new(config.runtime.clone()));
    let bus = EventBus::new();
    let printer = spawn_event_printer(&bus);

    let mut orchestrator = Orchestrator::with_event_bus(orchestrator_config, runtime, bus);
    if interactive {
        orchestrator = orchestrator.with_prompter(Arc::new(StdinPrompter));
    }

    println!("{} {}", "▶".cyan(), request.bold());
    let report = orchestrator
        .start(request, workflow)
        .await
        .context("Build flow failed")?;
    printer.abort();

    print_outcome(report.session_id, &report.outcome, &report.message);
    Ok(report.is_blocked())
}

async fn resume(config: &FlowForgeConfig, session_id: Uuid) -> Result<bool> {
    let runtime = Arc::new(HttpAgentRuntime::new(config.runtime.clone()));
    let bus = EventBus::new();
    let printer = spawn_event_printer(&bus);
    let orchestrator =
        Orchestrator::with_event_bus(config.orchestrator_config(false), runtime, bus);

    let report = orchestrator
        .resume(session_id)
        .await
        .with_context(|| format!("Failed to resume session {}", session_id))?;
    printer.abort();

    print_outcome(report.session_id, &report.outcome, &report.message);
    Ok(report.is_blocked())
}

fn analyzer(config: &FlowForgeConfig, bus: EventBus) -> Result<AnalyzerOrchestrator> {
    let orchestrator_config = config.orchestrator_config(false);
    orchestrator_config.validate()?;
    let runtime = Arc::new(HttpAgentRuntime::new(config.runtime.clone()));
    Ok(AnalyzerOrchestrator::with_event_bus(orchestrator_config, runtime, bus))
}

async fn analyze(
    config: &FlowForgeConfig,
    workflow_id: &str,
    project_path: Option<&Path>,
    interactive: bool,
    fix: bool,
) -> Result<bool> {
    let bus = EventBus::new();
    let printer = spawn_event_printer(&bus);
    let analyzer = analyzer(config, bus)?;

    println!("{} Analyzing workflow {}", "▶".cyan(), workflow_id.bold());
    let result = analyzer.analyze(workflow_id, project_path).await;

    if !result.success {
        printer.abort();
        eprintln!(
            "{} Analysis failed: {}",
            "✗".red(),
            result.error.as_deref().unwrap_or("unknown error")
        );
        return Ok(true);
    }

    println!();
    println!("{}", result.report);
    if let Some(path) = &result.report_path {
        println!();
        println!("{} Report written to {}", "✓".green(), path.display());
    }

    let outcome = if fix {
        let analysis_id = result.analysis_id.context("Analysis has no id")?;
        let summary = analyzer
            .apply_fixes(analysis_id)
            .await
            .context("Fix run failed")?;
        ReviewOutcome::Fixed(summary)
    } else if interactive {
        analyzer
            .review(&result, &StdinPrompter)
            .await
            .context("Review failed")?
    } else {
        ReviewOutcome::Saved(result.report_path.clone())
    };
    printer.abort();

    Ok(match outcome {
        ReviewOutcome::Fixed(summary) => print_fix_summary(&summary),
        ReviewOutcome::Manual(instructions) => {
            println!();
            println!("{}", instructions);
            false
        }
        ReviewOutcome::Saved(_) => false,
        ReviewOutcome::Discarded => {
            println!("{} Report and fix list deleted", "✓".green());
            false
        }
    })
}

async fn run_fixes(config: &FlowForgeConfig, analysis_id: Uuid) -> Result<bool> {
    let bus = EventBus::new();
    let printer = spawn_event_printer(&bus);
    let analyzer = analyzer(config, bus)?;

    println!("{} Applying fixes from analysis {}", "▶".cyan(), analysis_id);
    let summary = analyzer
        .apply_fixes(analysis_id)
        .await
        .with_context(|| format!("Failed to apply fixes from analysis {}", analysis_id))?;
    printer.abort();

    Ok(print_fix_summary(&summary))
}

/// Returns true when any task failed.
fn print_fix_summary(summary: &FixSummary) -> bool {
    println!();
    if summary.results.is_empty() {
        println!("No P0/P1 fixes pending.");
        return false;
    }
    for result in &summary.results {
        let mark = match (result.applied, result.validated) {
            (true, true) => "✓".green(),
            (true, false) => "~".yellow(),
            (false, _) => "✗".red(),
        };
        println!(
            "  {} {} ({} attempts) {}",
            mark,
            result.task_id,
            result.attempts,
            result.error.as_deref().unwrap_or_default()
        );
    }
    println!(
        "{} applied, {} failed",
        summary.applied().to_string().green(),
        summary.failed().to_string().red()
    );
    summary.failed() > 0
}

fn print_outcome(session_id: Uuid, outcome: &TaskOutcome, message: &str) {
    println!();
    match outcome {
        TaskOutcome::Conversational => println!("{}", message),
        TaskOutcome::Completed { resource_id } => {
            println!("{} {}", "✓".green().bold(), message.green());
            println!("  Workflow: {}", resource_id);
        }
        TaskOutcome::Blocked => {
            println!("{}", message);
            println!();
            println!("{} Session {} blocked", "✗".red().bold(), session_id);
        }
    }
}

fn spawn_event_printer(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => print_event(&envelope.event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event printer lagged by {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn print_event(event: &Event) {
    match event {
        Event::StageChanged { from, to, .. } => {
            println!("  {} {} → {}", "stage".dimmed(), from, to.to_string().cyan());
        }
        Event::CycleStarted { cycle, level, .. } => {
            println!("  {} {} ({})", "cycle".dimmed(), cycle, level.yellow());
        }
        Event::AgentInvoked {
            role,
            success,
            call_count,
            ..
        } => {
            let mark = if *success { "✓".green() } else { "✗".red() };
            println!("  {} {} {} ({} calls)", "agent".dimmed(), mark, role, call_count);
        }
        Event::GateViolated { gate, reason, .. } => {
            println!("  {} {} {}", "gate".dimmed(), gate.yellow(), reason);
        }
        Event::AnalysisStatusChanged { to, .. } => {
            println!("  {} {}", "analysis".dimmed(), to.to_string().cyan());
        }
        Event::FixTaskFinished {
            task_id,
            applied,
            attempts,
            ..
        } => {
            let mark = if *applied { "✓".green() } else { "✗".red() };
            println!("  {} {} {} ({} attempts)", "fix".dimmed(), mark, task_id, attempts);
        }
        Event::Error { message, .. } => {
            println!("  {} {}", "error".red(), message);
        }
        Event::SessionCreated { .. } | Event::SessionArchived { .. } => {}
    }
}

struct StdinPrompter;

impl StdinPrompter {
    async fn read_line(prompt: String) -> Option<String> {
        tokio::task::spawn_blocking(move || {
            print!("{}", prompt);
            std::io::stdout().flush().ok()?;
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).ok()?;
            Some(line.trim().to_string())
        })
        .await
        .ok()
        .flatten()
    }
}

#[async_trait]
impl DecisionPrompter for StdinPrompter {
    async fn choose_option(&self, options: &[BuildOption]) -> Option<usize> {
        println!();
        println!("{}", "Options:".bold());
        for (i, option) in options.iter().enumerate() {
            let marker = if option.recommended {
                " (recommended)".green().to_string()
            } else {
                String::new()
            };
            println!("  {}. {}{}", i + 1, option.name.bold(), marker);
            if !option.description.is_empty() {
                println!("     {}", option.description);
            }
        }
        let answer = Self::read_line(format!(
            "Choose [1-{}, enter for recommended]: ",
            options.len()
        ))
        .await?;
        answer.parse::<usize>().ok().and_then(|n| n.checked_sub(1))
    }

    async fn confirm_blueprint(&self, blueprint: &Blueprint) -> bool {
        println!();
        println!("{} {}", "Blueprint:".bold(), blueprint.name);
        for node in &blueprint.nodes {
            println!("  - {} ({})", node.name, node.node_type.dimmed());
        }
        match Self::read_line("Build this? [Y/n]: ".to_string()).await {
            Some(answer) => !answer.eq_ignore_ascii_case("n") && !answer.eq_ignore_ascii_case("no"),
            None => false,
        }
    }

    async fn approve_fixes(&self, todo: &TodoList, report_path: Option<&Path>) -> FixApproval {
        let urgent = todo.urgent_pending().len();
        println!();
        println!("{}", "Analysis complete".bold());
        println!("  {} recommendations, {} urgent (P0/P1)", todo.tasks.len(), urgent);
        if let Some(path) = report_path {
            println!("  Report: {}", path.display());
        }
        println!();
        println!("  [A] Apply the {} urgent fixes automatically", urgent);
        println!("  [M] Show manual fix instructions");
        println!("  [S] Save the report and exit");
        println!("  [Q] Quit and delete the report");
        match Self::read_line("Choice [A/M/S/Q]: ".to_string()).await {
            Some(answer) => FixApproval::parse(&answer),
            None => FixApproval::Save,
        }
    }
}

async fn load_config(explicit: Option<&Path>) -> Result<FlowForgeConfig> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => default_config_path(),
    };

    match path {
        Some(path) => {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let config = toml::from_str(&content)
                .with_context(|| format!("Invalid config {}", path.display()))?;
            tracing::info!("Loaded config from {}", path.display());
            Ok(config)
        }
        None => Ok(FlowForgeConfig::default()),
    }
}

fn default_config_path() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("flowforge").join(CONFIG_FILE))
        .filter(|path| path.exists())
}

fn apply_env_overrides(config: &mut FlowForgeConfig) {
    if let Ok(dir) = std::env::var(STORAGE_ENV) {
        config.orchestrator.storage_dir = PathBuf::from(dir);
    }
    if let Ok(url) = std::env::var(RUNTIME_URL_ENV) {
        config.runtime.base_url = url;
    }
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        config.runtime.api_key = Some(key);
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowforge=info,orchestrator=info".into()),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_match_orchestrator() {
        let config = FlowForgeConfig::default();
        let orchestrator = config.orchestrator_config(false);

        assert_eq!(orchestrator.max_qa_cycles, 7);
        assert_eq!(orchestrator.agent_timeout, Duration::from_secs(90));
        assert!(!orchestrator.interactive);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: FlowForgeConfig = toml::from_str(
            r#"
            [orchestrator]
            storage_dir = "/tmp/ff"
            max_qa_cycles = 3

            [runtime]
            base_url = "http://runtime:9000"
            "#,
        )
        .unwrap();

        assert_eq!(config.orchestrator.storage_dir, PathBuf::from("/tmp/ff"));
        assert_eq!(config.orchestrator.max_qa_cycles, 3);
        assert_eq!(config.orchestrator.agent_timeout_secs, 90);
        assert_eq!(config.runtime.base_url, "http://runtime:9000");
    }

    #[tokio::test]
    async fn test_load_explicit_config() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("custom.toml");
        std::fs::write(&path, "[orchestrator]\nmax_qa_cycles = 2\n").unwrap();

        let config = load_config(Some(&path)).await.unwrap();
        assert_eq!(config.orchestrator.max_qa_cycles, 2);
    }

    #[tokio::test]
    async fn test_missing_explicit_config_errors() {
        let result = load_config(Some(Path::new("/nonexistent/flowforge.toml"))).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parses_build() {
        let cli = Cli::try_parse_from([
            "flowforge",
            "build",
            "send",
            "a",
            "digest",
            "--workflow",
            "wf-1",
            "--runtime-url",
            "http://x",
        ])
        .unwrap();

        assert_eq!(cli.runtime_url.as_deref(), Some("http://x"));
        match cli.command {
            Commands::Build { task, workflow, interactive } => {
                assert_eq!(task.join(" "), "send a digest");
                assert_eq!(workflow.as_deref(), Some("wf-1"));
                assert!(!interactive);
            }
            _ => panic!("Expected Build command"),
        }
    }

    #[test]
    fn test_cli_parses_analyze_fix() {
        let cli =
            Cli::try_parse_from(["flowforge", "analyze", "wf-9", "./project", "--fix"]).unwrap();

        match cli.command {
            Commands::Analyze {
                workflow_id,
                project_path,
                interactive,
                fix,
            } => {
                assert_eq!(workflow_id, "wf-9");
                assert_eq!(project_path, Some(PathBuf::from("./project")));
                assert!(!interactive);
                assert!(fix);
            }
            _ => panic!("Expected Analyze command"),
        }
    }

    #[test]
    fn test_cli_rejects_fix_with_interactive() {
        let result =
            Cli::try_parse_from(["flowforge", "analyze", "wf-9", "--fix", "--interactive"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_parses_fix() {
        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from(["flowforge", "fix", &id.to_string()]).unwrap();

        match cli.command {
            Commands::Fix { analysis_id } => assert_eq!(analysis_id, id),
            _ => panic!("Expected Fix command"),
        }
    }

    #[test]
    fn test_fix_attempts_configurable() {
        let config: FlowForgeConfig =
            toml::from_str("[orchestrator]\nmax_fix_attempts = 5\n").unwrap();
        assert_eq!(config.orchestrator_config(false).max_fix_attempts, 5);
    }
}
