//! Conduit CLI: inspect and call MCP tool servers, or run a tool-using chat turn.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use conduit_api::{HttpChatBackend, WireFormat};
use conduit_config::{CliOverrides, ConduitConfig, Provider};
use conduit_core::{ModelSettings, Orchestrator, TurnEvent, TurnOutcome};
use conduit_mcp::{ServerRegistry, ServerStatus};
use conduit_types::{ChatMessage, ToolCallStatus};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "conduit", version, about = "MCP tool servers from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file to read instead of ~/.conduit/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Model to use
    #[arg(long, global = true)]
    model: Option<String>,

    /// LLM API base URL
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start every enabled server and report its status
    Servers,
    /// List the tools offered by connected servers
    Tools,
    /// Call a tool on the server that offers it
    Call {
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// Call on this server instead of the first one offering the tool
        #[arg(long)]
        server: Option<String>,
    },
    /// Send a prompt and let the model use the configured tools
    Ask { prompt: String },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let config = ConduitConfig::load(CliOverrides {
        config_file: cli.config,
        model: cli.model,
        base_url: cli.base_url,
    })
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    let registry = Arc::new(ServerRegistry::new(&config.mcp));
    let result = match cli.command {
        Command::Servers => servers(&registry).await,
        Command::Tools => tools(&registry).await,
        Command::Call { tool, args, server } => call(&registry, &tool, &args, server).await,
        Command::Ask { prompt } => ask(&config, &registry, prompt).await,
    };
    registry.stop_all().await;
    result
}

/// Start enabled servers, warning about any that fail.
async fn start_servers(registry: &ServerRegistry) {
    for (id, result) in registry.start_all_enabled().await {
        if let Err(e) = result {
            tracing::warn!("Server {id} failed to start: {e}");
        }
    }
}

async fn servers(registry: &ServerRegistry) -> Result<ExitCode> {
    start_servers(registry).await;
    let configs = registry.servers();
    if configs.is_empty() {
        eprintln!("No servers configured.");
        return Ok(ExitCode::SUCCESS);
    }

    let mut failed = false;
    for config in configs {
        let state = registry.state(&config.id).unwrap_or_default();
        let kind = match config.transport {
            conduit_mcp::TransportConfig::Stdio { .. } => "stdio",
            conduit_mcp::TransportConfig::Http { .. } => "http",
        };
        let detail = match (&state.status, &state.error) {
            (ServerStatus::Connected, _) => format!("{} tools", state.tools.len()),
            (_, Some(error)) => error.clone(),
            _ if !config.enabled => "disabled".to_string(),
            _ => String::new(),
        };
        failed |= state.status == ServerStatus::Error;
        println!(
            "{:<20} {:<6} {:<12} {detail}",
            config.display_name(),
            kind,
            state.status.to_string()
        );
    }
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

async fn tools(registry: &ServerRegistry) -> Result<ExitCode> {
    start_servers(registry).await;
    let tools = registry.all_tools();
    if tools.is_empty() {
        eprintln!("No tools available.");
    }
    for (server_id, tool) in tools {
        let description = tool.description.lines().next().unwrap_or_default();
        println!("{:<16} {:<24} {description}", server_id, tool.name);
    }
    Ok(ExitCode::SUCCESS)
}

async fn call(
    registry: &ServerRegistry,
    tool: &str,
    args: &str,
    server: Option<String>,
) -> Result<ExitCode> {
    let arguments: serde_json::Value =
        serde_json::from_str(args).context("--args must be valid JSON")?;
    if !arguments.is_object() {
        bail!("--args must be a JSON object");
    }

    start_servers(registry).await;
    let server_id = match server.or_else(|| registry.find_tool_server(tool)) {
        Some(id) => id,
        None => bail!("No connected server offers tool '{tool}'"),
    };

    let result = registry
        .call_tool(&server_id, tool, arguments)
        .await
        .with_context(|| format!("Calling {tool} on {server_id}"))?;

    let text = result.render_text();
    if result.is_error {
        eprintln!("{text}");
        return Ok(ExitCode::FAILURE);
    }
    println!("{text}");
    Ok(ExitCode::SUCCESS)
}

async fn ask(
    config: &ConduitConfig,
    registry: &Arc<ServerRegistry>,
    prompt: String,
) -> Result<ExitCode> {
    let api_key = config.require_api_key().map_err(|e| anyhow::anyhow!("{e}"))?;
    let format = match config.provider {
        Provider::OpenAi => WireFormat::OpenAi,
        Provider::Google => WireFormat::Google,
    };
    let backend = HttpChatBackend::new(format, &config.base_url, api_key)
        .context("Failed to create LLM backend")?;

    start_servers(registry).await;
    let orchestrator = Orchestrator::new(
        Arc::new(backend),
        Arc::clone(registry),
        ModelSettings {
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            top_p: config.top_p,
        },
    );

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut messages = vec![ChatMessage::user(prompt)];
    let outcome = orchestrator
        .run(&mut messages, cancel, print_event)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    Ok(match outcome {
        TurnOutcome::Completed | TurnOutcome::IterationLimit => ExitCode::SUCCESS,
        TurnOutcome::Aborted => ExitCode::from(130),
    })
}

fn print_event(event: TurnEvent) {
    let mut out = io::stdout();
    match event {
        TurnEvent::TextDelta(text) => {
            let _ = write!(out, "{text}");
            let _ = out.flush();
        }
        TurnEvent::ToolCallStatus(record) => match record.status {
            ToolCallStatus::Executing => eprintln!("  [tool: {}]", record.call.name),
            ToolCallStatus::Error => {
                let result = record.result.as_deref().unwrap_or_default();
                eprintln!(
                    "  [tool {} error: {}]",
                    record.call.name,
                    conduit_types::truncate_str(result, 200)
                );
            }
            ToolCallStatus::Success => eprintln!("  [tool {} done]", record.call.name),
            ToolCallStatus::Pending => {}
        },
        TurnEvent::Done => {
            let _ = writeln!(out);
        }
        TurnEvent::Aborted => eprintln!("\n[cancelled]"),
        TurnEvent::IterationLimitReached => {
            eprintln!("\n[stopped: the model kept requesting tools]");
        }
        TurnEvent::Error(e) => eprintln!("Error: {e}"),
    }
}
