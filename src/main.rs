use anyhow::{Context, Result};
use colored::*;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use synapse::api_server::start_server;
use synapse::bus::broker::Broker;
use synapse::bus::transport::{TcpTransport, Transport};
use synapse::core::cortex::GeminiCortex;
use synapse::core::state::{AppState, Collaborators, SynapseConfig, SYNAPSE_DIR};
use synapse::io::telemetry::init_tracing;
use synapse::memory::{GraphStore, KnowledgeStore};
use synapse::rules::FileRuleEngine;
use synapse::workflow::{HttpWorkflowEngine, NoopWorkflowEngine, WorkflowEngine};

const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:5555";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::from_filename(".env").ok();
    let args: Vec<String> = env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        Some("init") => init_workspace(),
        Some("broker") => {
            let config = load_config()?;
            let addr = args
                .get(1)
                .cloned()
                .or(config.broker_addr)
                .unwrap_or_else(|| DEFAULT_BROKER_ADDR.to_string());
            run_broker(&addr).await
        }
        _ => serve().await,
    }
}

/// Installs the subscriber at the configured level before reporting anything
/// about the config itself.
fn load_config() -> Result<SynapseConfig> {
    let dir = Path::new(SYNAPSE_DIR);
    let found = SynapseConfig::read(dir)?;
    let missing = found.is_none();
    let config = SynapseConfig::resolve(found);
    init_tracing(&config.log_level);
    if missing {
        warn!(path = %SynapseConfig::config_path(dir).display(), "no config file, using defaults");
    }
    Ok(config)
}

async fn run_broker(addr: &str) -> Result<()> {
    let broker = Broker::bind(addr).await?;
    println!(
        "{} Bus broker relaying on {}",
        "🔀".cyan(),
        broker.local_addr()?.to_string().bold()
    );
    broker.run().await
}

async fn connect_transport(config: &SynapseConfig) -> Option<Arc<dyn Transport>> {
    let addr = config.broker_addr.as_deref()?;
    match TcpTransport::connect(addr).await {
        Ok(transport) => {
            info!(broker = addr, "connected to bus broker");
            Some(Arc::new(transport))
        }
        Err(e) => {
            warn!(broker = addr, error = %e, "bus broker unreachable, running in-process only");
            None
        }
    }
}

async fn serve() -> Result<()> {
    let config = load_config()?;

    fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;

    let store: Arc<dyn KnowledgeStore> = Arc::new(
        GraphStore::open(&config.store_dir()).context("Failed to open knowledge store")?,
    );
    let rules = Arc::new(FileRuleEngine::open(&config.rules_path()).await?);
    let model = Arc::new(GeminiCortex::new(&config)?);
    let workflows: Arc<dyn WorkflowEngine> = match config.workflow_url.as_deref() {
        Some(url) => Arc::new(HttpWorkflowEngine::new(url)),
        None => {
            warn!("no workflow_url configured, workflow events are dropped");
            Arc::new(NoopWorkflowEngine)
        }
    };
    let transport = connect_transport(&config).await;
    let wired = transport.is_some();

    let state = AppState::assemble(
        config,
        Collaborators {
            store,
            model,
            rules,
            workflows,
            transport,
        },
    );

    let _router = state.router.attach().await;
    let _receiver = state.bus.spawn_receiver();

    println!("{}", "🧠 Synapse online".green().bold());
    println!(
        "   - Project: {}",
        state.config.project_name.as_str().yellow()
    );
    println!(
        "   - Bus: {}",
        if wired {
            "in-process + broker".blue()
        } else {
            "in-process only".yellow()
        }
    );
    println!(
        "   - API: {}",
        format!("http://{}", state.config.bind_addr).cyan()
    );

    start_server(state).await
}

fn init_workspace() -> Result<()> {
    let dir = Path::new(SYNAPSE_DIR);
    if SynapseConfig::config_path(dir).exists() {
        println!("{}", "✅ Synapse is already set up in this workspace.".green());
        return Ok(());
    }
    let config = SynapseConfig::default();
    config.save(dir)?;
    fs::create_dir_all(config.projects_dir())?;

    let gitignore_path = Path::new(".gitignore");
    let mut gitignore = if gitignore_path.exists() {
        fs::read_to_string(gitignore_path)?
    } else {
        String::new()
    };
    if !gitignore.contains(SYNAPSE_DIR) {
        gitignore.push_str(&format!("\n# Synapse data\n{}/\n", SYNAPSE_DIR));
        fs::write(gitignore_path, gitignore)?;
    }
    println!(
        "{} Wrote {}",
        "🧬".green(),
        SynapseConfig::config_path(dir).display()
    );
    Ok(())
}
