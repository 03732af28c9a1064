mod config;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use sonic_core::persona::load_persona_bundle;
use sonic_core::runtime::RuntimeMode;
use sonic_provider::ProviderRegistry;
use sonic_schema::registry::AgentInfo;
use sonic_server::agent_state::AgentState;
use sonic_server::state::AppState;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{load_config, SonicConfig};

#[derive(Parser)]
#[command(name = "sonic", version, about = "Voice/text conversational gateway")]
struct Cli {
    #[arg(long, default_value = "~/.sonic", help = "Root directory (contains personas/, prompts/, workflows/, agents.d/)")]
    root: PathBuf,

    #[arg(long, help = "Config file path (default: {root}/config.yaml)")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Start the gateway HTTP/WebSocket server")]
    Serve {
        #[arg(long, help = "Overrides gateway.port from the config file")]
        port: Option<u16>,
    },
    #[command(about = "Load every persona and its workflows, reporting any errors")]
    Validate,
    #[command(about = "Load and validate the config file without starting anything")]
    CheckConfig,
    #[command(about = "Start one agent process, bound to a single persona and mode")]
    Agent {
        #[arg(long, help = "Persona id under personas/, e.g. banking")]
        persona: String,
        #[arg(long, default_value = "4100")]
        port: u16,
        #[arg(long, help = "Voice model websocket url, e.g. ws://127.0.0.1:9000/voice")]
        voice_url: Option<String>,
        #[arg(long, help = "Base url the Tool Client posts tool calls to")]
        tool_base_url: String,
        #[arg(long, default_value = "hybrid", help = "text-only | voice-only | hybrid")]
        mode: String,
    },
}

/// A statically configured agent entry (`agents.d/*.yaml`), loaded at
/// startup into the Agent Registry (C2). Agents don't self-register over
/// the wire; the gateway dials out to each one's `/session` endpoint
/// (§6.2), so it has to know the roster in advance.
#[derive(Debug, Deserialize)]
struct AgentEntry {
    agent_id: String,
    url: String,
    port: u16,
    #[serde(default)]
    capabilities: Vec<String>,
}

fn expand_tilde(path: PathBuf) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path
}

fn init_logging(root: &PathBuf) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = root.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "sonic.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(non_blocking))
        .init();

    Ok(guard)
}

fn load_agent_roster(root: &std::path::Path) -> Vec<AgentEntry> {
    let agents_dir = root.join("agents.d");
    let mut roster = Vec::new();
    let Ok(entries) = std::fs::read_dir(&agents_dir) else {
        return roster;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        match std::fs::read_to_string(&path).ok().and_then(|raw| serde_yaml::from_str(&raw).ok()) {
            Some(agent) => roster.push(agent),
            None => tracing::warn!(path = %path.display(), "skipping unreadable agent entry"),
        }
    }
    roster
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(|| cli.root.join("config.yaml"))
}

fn build_provider_registry(config: &SonicConfig) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    sonic_provider::register_builtin_providers(&mut registry);
    sonic_provider::register_from_configs(&mut registry, &config.providers)?;
    Ok(registry)
}

fn parse_runtime_mode(raw: &str) -> Result<RuntimeMode> {
    match raw {
        "text-only" => Ok(RuntimeMode::TextOnly),
        "voice-only" => Ok(RuntimeMode::VoiceOnly),
        "hybrid" => Ok(RuntimeMode::Hybrid),
        other => bail!("unknown mode {other:?}, expected text-only | voice-only | hybrid"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    cli.root = expand_tilde(cli.root);
    let _log_guard = init_logging(&cli.root)?;

    match &cli.command {
        Commands::Serve { port } => {
            let config = load_config(&config_path(&cli))?;
            let state = AppState::new(cli.root.clone());
            let roster = load_agent_roster(&cli.root);
            {
                let mut registry = state.registry.lock().await;
                for entry in roster {
                    let mut info = AgentInfo::new(entry.agent_id, entry.url, entry.port);
                    info.capabilities = entry.capabilities;
                    registry.register(info);
                }
            }
            let port = port.unwrap_or(config.gateway.port);
            let addr = format!("0.0.0.0:{port}");
            sonic_server::serve(state, &addr).await
        }
        Commands::Validate => {
            let personas_dir = cli.root.join("personas");
            let prompts_dir = cli.root.join("prompts");
            let workflows_dir = cli.root.join("workflows");
            let mut checked = 0usize;
            let entries = std::fs::read_dir(&personas_dir).with_context(|| format!("reading {}", personas_dir.display()))?;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(persona_id) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                load_persona_bundle(&personas_dir, &prompts_dir, &workflows_dir, persona_id)
                    .with_context(|| format!("persona {persona_id} failed to load"))?;
                checked += 1;
            }
            println!("{checked} personas loaded and validated.");
            Ok(())
        }
        Commands::CheckConfig => {
            let path = config_path(&cli);
            let config = load_config(&path)?;
            println!(
                "{} ok: gateway.port={} decision={}/{} providers={}",
                path.display(),
                config.gateway.port,
                config.decision.provider_id,
                config.decision.model_id,
                config.providers.len()
            );
            Ok(())
        }
        Commands::Agent {
            persona,
            port,
            voice_url,
            tool_base_url,
            mode,
        } => {
            let config = load_config(&config_path(&cli))?;
            let mode = parse_runtime_mode(mode)?;
            let personas_dir = cli.root.join("personas");
            let prompts_dir = cli.root.join("prompts");
            let workflows_dir = cli.root.join("workflows");
            let bundle = load_persona_bundle(&personas_dir, &prompts_dir, &workflows_dir, persona)
                .with_context(|| format!("persona {persona} failed to load"))?;

            let providers = build_provider_registry(&config)?;
            let state = AgentState::new(
                bundle,
                mode,
                voice_url.clone(),
                tool_base_url.clone(),
                providers,
                config.decision.provider_id.clone(),
                config.decision.model_id.clone(),
            )?;

            let addr = format!("0.0.0.0:{port}");
            sonic_server::serve_agent(state, &addr).await
        }
    }
}
