use anyhow::{Context as _, Result};
use clap::Parser;
use remotewiz::config::RuntimeConfig;
use remotewiz::project::{Project, ProjectRegistry};
use remotewiz::summarizer::PassthroughSummarizer;
use remotewiz::AppContext;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "remotewizd",
    about = "RemoteWiz execution engine — runs a coding agent against configured projects under a durable task queue",
    version
)]
struct Args {
    /// Data directory for the SQLite task/approval/audit store
    #[arg(long, env = "REMOTEWIZ_DATA_DIR", default_value = "./data")]
    data_dir: std::path::PathBuf,

    /// Root directory for validated upload references
    #[arg(long, env = "REMOTEWIZ_UPLOADS_DIR", default_value = "./data/uploads")]
    uploads_dir: std::path::PathBuf,

    /// JSON file describing the configured projects (array of
    /// {alias, path, token_budget, timeout_ms, skip_permissions, skip_permissions_reason})
    #[arg(long, env = "REMOTEWIZ_PROJECTS_FILE")]
    projects_file: std::path::PathBuf,

    /// Path to the Agent CLI binary this engine supervises
    #[arg(long, env = "REMOTEWIZ_AGENT_BINARY", default_value = "claude")]
    agent_binary: String,

    /// Environment variable name holding the Agent CLI's API key, passed
    /// through to the whitelisted subprocess environment
    #[arg(long, env = "REMOTEWIZ_API_KEY_ENV_VAR", default_value = "ANTHROPIC_API_KEY")]
    api_key_env_var: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "REMOTEWIZ_LOG", default_value = "info")]
    log: String,
}

/// Exactly the fields spec §9 "config-option envelopes" names for a
/// project entry; anything else in the file is a load-time error rather
/// than a silently ignored typo.
#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectSpec {
    alias: String,
    path: std::path::PathBuf,
    /// Free-text note for operators; not interpreted by the engine.
    #[serde(default)]
    #[allow(dead_code)]
    description: Option<String>,
    token_budget: Option<i64>,
    timeout_ms: Option<u64>,
    #[serde(default)]
    skip_permissions: bool,
    #[serde(default)]
    skip_permissions_reason: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_env_filter(&args.log).compact().init();

    info!(version = env!("CARGO_PKG_VERSION"), "remotewizd starting");

    let available = std::process::Command::new(&args.agent_binary)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok();
    if available {
        info!(binary = %args.agent_binary, "agent CLI found on PATH");
    } else {
        warn!(
            binary = %args.agent_binary,
            "agent CLI not found on PATH — every supervised run will fail at spawn time"
        );
    }

    let config = RuntimeConfig::from_env();
    let projects = load_projects(&args.projects_file, &config)
        .with_context(|| format!("loading projects from {}", args.projects_file.display()))?;
    info!(count = projects.all().count(), "projects loaded");

    let context = AppContext::new(config, &args.data_dir, &args.uploads_dir, projects).await?;
    let engine = context.build_engine(
        args.agent_binary,
        args.api_key_env_var,
        Arc::new(PassthroughSummarizer) as Arc<dyn remotewiz::summarizer::Summarizer>,
    );

    let shutdown = {
        let engine = engine.clone();
        async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received, stopping tick loop");
            engine.stop();
        }
    };

    tokio::select! {
        _ = engine.clone().run() => {}
        _ = shutdown => {}
    }

    Ok(())
}

fn load_projects(path: &std::path::Path, config: &RuntimeConfig) -> Result<ProjectRegistry> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading projects file {}", path.display()))?;
    let specs: Vec<ProjectSpec> = serde_json::from_str(&raw).context("parsing projects file as JSON")?;

    let mut projects = Vec::with_capacity(specs.len());
    for spec in specs {
        let project = Project::new(
            spec.alias,
            spec.path,
            spec.token_budget.unwrap_or(config.default_token_budget),
            spec.timeout_ms.unwrap_or(config.default_timeout_ms),
            spec.skip_permissions,
            spec.skip_permissions_reason,
        )?;
        projects.push(project);
    }
    Ok(ProjectRegistry::new(projects))
}
