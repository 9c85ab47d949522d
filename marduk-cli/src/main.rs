//! Command-line composition root.
//!
//! Owns every long-lived component (health monitor, memory factory,
//! coordinator, worker channel) and wires them together; library crates
//! never reach for globals.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use marduk_context::embedding::{EmbeddingProvider, HashingEmbedder, OpenAiEmbedder};
use marduk_coordinator::{AiCoordinator, LlmClient, OpenAiClient, QueryOptions, WorkerChannel};
use marduk_core::config::MardukConfig;
use marduk_core::health::HealthMonitor;
use marduk_memory::factory::MemoryFactory;
use marduk_memory::persist::PersistenceConfig;
use marduk_task::deferred::DeferredTaskHandler;
use marduk_task::deliberation::{DeliberationConfig, DeliberationCycle};
use marduk_task::manager::TaskManager;
use marduk_task::message::MemoryState;
use marduk_task::resource::ResourceMonitor;
use marduk_task::scheduler::TaskExecutor;

#[derive(Parser)]
#[command(name = "marduk", about = "Cognitive coordination core", version)]
struct Cli {
    /// TOML configuration file; environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the deterministic local embedder instead of the OpenAI one.
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator with the worker channel and periodic timers.
    Serve,
    /// Answer a single query and print the response as JSON.
    Query {
        text: String,
        #[arg(long)]
        temperature: Option<f64>,
    },
    /// Validate the persisted context cache.
    ValidateCache {
        /// Apply fixes and re-persist.
        #[arg(long)]
        fix: bool,
    },
    /// List context snapshots, newest first.
    Snapshots,
}

fn load_config(path: Option<&Path>) -> Result<MardukConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => MardukConfig::default(),
    };

    // The environment always wins; OPENAI_API_KEY is required.
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        config.openai.api_key = key;
    }
    if let Ok(model) = std::env::var("OPENAI_MODEL") {
        config.openai.model = model;
    }
    if let Ok(dir) = std::env::var("MARDUK_DATA_DIR") {
        config.memory.data_dir = dir;
    }
    if let Ok(level) = std::env::var("MARDUK_LOG_LEVEL") {
        config.logging.level = level;
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(config: &MardukConfig) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    let log_path = Path::new(&config.logging.file);
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
    {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        Err(_) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

/// Context state lives next to the memory root: `<root>/context`.
fn context_dir(config: &MardukConfig) -> PathBuf {
    let memory_root = Path::new(&config.memory.data_dir);
    memory_root
        .parent()
        .map_or_else(|| PathBuf::from("./data/context"), |p| p.join("context"))
}

async fn build_coordinator(
    config: &MardukConfig,
    offline: bool,
) -> Result<(Arc<AiCoordinator>, Arc<HealthMonitor>)> {
    let health = Arc::new(HealthMonitor::new());
    let memory = Arc::new(
        MemoryFactory::init(PersistenceConfig::new(&config.memory.data_dir), 1000).await?,
    );
    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(config.openai.clone()));
    let embedder: Arc<dyn EmbeddingProvider> = if offline {
        Arc::new(HashingEmbedder::default())
    } else {
        Arc::new(OpenAiEmbedder::new(config.openai.api_key.clone()))
    };

    let coordinator = Arc::new(AiCoordinator::new(
        config.ai.clone(),
        llm,
        embedder,
        memory,
        Arc::clone(&health),
        context_dir(config),
    ));
    coordinator.init().await?;
    Ok((coordinator, health))
}

async fn serve(config: MardukConfig, offline: bool) -> Result<()> {
    let (coordinator, health) = build_coordinator(&config, offline).await?;
    coordinator.start_periodic_tasks();
    health.start_background_tasks();

    let channel = Arc::new(WorkerChannel::new());
    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding worker channel to {address}"))?;
    info!(%address, "marduk serving");
    tokio::spawn(Arc::clone(&channel).serve(listener));

    // Deliberation loop: one cycle per minute, skipped until at least one
    // worker has registered.
    let cycle_channel = Arc::clone(&channel);
    let notes_path = context_dir(&config).join("self-notes.json");
    tokio::spawn(async move {
        let resources = Arc::new(ResourceMonitor::new());
        let mut manager = TaskManager::new(Arc::clone(&resources));
        let mut deferred = DeferredTaskHandler::new();
        let executor = TaskExecutor::new(Arc::clone(&resources), 5);
        let cycle = DeliberationCycle::new(DeliberationConfig::new(notes_path));
        let mut state = MemoryState::default();

        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            if cycle_channel.registered_subsystems().await.is_empty() {
                continue;
            }
            resources.sample_system_load();
            match cycle
                .run_cycle(
                    &mut manager,
                    &mut deferred,
                    &executor,
                    cycle_channel.as_ref(),
                    &state,
                )
                .await
            {
                Ok(report) => {
                    // A finished investigation satisfies its research topic,
                    // unblocking the study task on the next cycle.
                    if report.completed > 0 {
                        state
                            .completed_topics
                            .insert("research-completed:error-recovery".to_string());
                    }
                }
                Err(err) => warn!(%err, "deliberation cycle failed"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    health.shutdown();
    coordinator.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(&config)?;

    match cli.command {
        Command::Serve => serve(config, cli.offline).await?,
        Command::Query { text, temperature } => {
            let (coordinator, _health) = build_coordinator(&config, cli.offline).await?;
            let response = coordinator
                .process_query(
                    &text,
                    &QueryOptions {
                        temperature,
                        ..Default::default()
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            coordinator.shutdown().await?;
        }
        Command::ValidateCache { fix } => {
            let (coordinator, _health) = build_coordinator(&config, cli.offline).await?;
            let report = coordinator.validate_context_cache(fix).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            coordinator.shutdown().await?;
        }
        Command::Snapshots => {
            let (coordinator, _health) = build_coordinator(&config, cli.offline).await?;
            for slug in coordinator.list_context_snapshots().await {
                println!("{slug}");
            }
            coordinator.shutdown().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_dir_sits_next_to_memory_root() {
        let mut config = MardukConfig::default();
        config.memory.data_dir = "/srv/marduk/data/memory".to_string();
        assert_eq!(
            context_dir(&config),
            PathBuf::from("/srv/marduk/data/context")
        );
    }

    #[test]
    fn test_load_config_requires_api_key() {
        // Without OPENAI_API_KEY in the file or environment, validation
        // rejects the default config.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marduk.toml");
        std::fs::write(&path, "[openai]\napi_key = \"\"\n").unwrap();
        if std::env::var("OPENAI_API_KEY").is_err() {
            assert!(load_config(Some(&path)).is_err());
        }
    }

    #[test]
    fn test_load_config_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marduk.toml");
        std::fs::write(
            &path,
            "[openai]\napi_key = \"sk-file\"\nmodel = \"gpt-4-1106-preview\"\n\n[server]\nhost = \"0.0.0.0\"\nport = 9000\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9000);
        assert!(!config.openai.api_key.is_empty());
    }
}
