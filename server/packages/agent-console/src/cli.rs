use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_console_runner::claude::ClaudeCliBackend;
use agent_console_runner::mock::{MockAgent, MockStep};
use agent_console_runner::AgentBackend;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{default_data_dir, default_projects_dir, LogMonitorConfig, ServiceConfig};
use crate::router::{build_router_with_state, shutdown_sessions, AppState};
use crate::service::SessionService;
use crate::store::FileChatStore;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2470;

#[derive(Parser, Debug)]
#[command(name = "agent-console", bin_name = "agent-console")]
#[command(about = "Web console for long-running coding agents", version)]
#[command(arg_required_else_help = true)]
pub struct AgentConsoleCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the agent console HTTP server.
    Server(ServerArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AgentKind {
    Claude,
    Mock,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Where chat records are kept. Defaults to the platform data dir.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// The claude CLI's per-project session log directory.
    #[arg(long)]
    projects_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = AgentKind::Claude)]
    agent: AgentKind,

    #[arg(long, default_value = "claude")]
    claude_bin: PathBuf,

    #[arg(long)]
    max_turns: Option<u32>,

    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,

    #[arg(long, default_value_t = 5000)]
    subagent_scan_ms: u64,

    #[arg(long, default_value_t = 120)]
    inactivity_timeout_secs: u64,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_agent_console() -> Result<(), CliError> {
    let cli = AgentConsoleCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
    }
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let config = service_config(server);
    let backend = build_backend(server);
    tracing::info!(
        agent = backend.name(),
        data_dir = %config.data_dir.display(),
        projects_dir = %config.projects_dir.display(),
        "starting agent console"
    );
    let store = Arc::new(FileChatStore::new(&config.data_dir));
    let service = SessionService::new(config, store, backend);
    let (mut router, state) = build_router_with_state(Arc::new(AppState::new(service)));

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                shutdown_sessions(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn service_config(server: &ServerArgs) -> ServiceConfig {
    let mut config = ServiceConfig::new(
        server.data_dir.clone().unwrap_or_else(default_data_dir),
        server
            .projects_dir
            .clone()
            .unwrap_or_else(default_projects_dir),
    );
    config.max_turns = server.max_turns;
    config.log_monitor = LogMonitorConfig {
        poll_interval: Duration::from_millis(server.poll_interval_ms.max(1)),
        subagent_scan_interval: Duration::from_millis(server.subagent_scan_ms.max(1)),
        inactivity_timeout: Duration::from_secs(server.inactivity_timeout_secs),
        ..LogMonitorConfig::default()
    };
    config
}

fn build_backend(server: &ServerArgs) -> Arc<dyn AgentBackend> {
    match server.agent {
        AgentKind::Claude => Arc::new(ClaudeCliBackend::new(server.claude_bin.clone())),
        AgentKind::Mock => Arc::new(demo_agent()),
    }
}

/// Offline agent for trying the console without the claude CLI.
fn demo_agent() -> MockAgent {
    MockAgent::new()
        .on_prompt(
            "list",
            vec![
                MockStep::Thinking("The user wants a directory listing.".to_string()),
                MockStep::text("Listing the folder."),
                MockStep::tool("LS", json!({ "path": "." }), json!("README.md\nsrc/")),
                MockStep::text("Two entries."),
            ],
        )
        .on_prompt(
            "write",
            vec![
                MockStep::tool(
                    "Write",
                    json!({ "file_path": "notes.txt", "content": "hello" }),
                    json!("File created"),
                ),
                MockStep::text("Done writing."),
            ],
        )
        .on_prompt(
            "wait",
            vec![MockStep::text("Waiting until stopped."), MockStep::WaitForCancel],
        )
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServerArgs {
        let cli = AgentConsoleCli::try_parse_from(args).expect("parse");
        match cli.command {
            Command::Server(server) => server,
        }
    }

    #[test]
    fn server_flags_feed_service_config() {
        let server = parse(&[
            "agent-console",
            "server",
            "--data-dir",
            "/tmp/console",
            "--projects-dir",
            "/tmp/projects",
            "--agent",
            "mock",
            "--max-turns",
            "8",
            "--poll-interval-ms",
            "250",
            "--inactivity-timeout-secs",
            "30",
        ]);
        assert_eq!(server.agent, AgentKind::Mock);
        let config = service_config(&server);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/console"));
        assert_eq!(config.projects_dir, PathBuf::from("/tmp/projects"));
        assert_eq!(config.max_turns, Some(8));
        assert_eq!(config.log_monitor.poll_interval, Duration::from_millis(250));
        assert_eq!(config.log_monitor.subagent_scan_interval, Duration::from_secs(5));
        assert_eq!(config.log_monitor.inactivity_timeout, Duration::from_secs(30));
        assert_eq!(build_backend(&server).name(), "mock");
    }

    #[test]
    fn rejects_malformed_cors_origin() {
        let server = parse(&["agent-console", "server", "-O", "not a\norigin"]);
        assert!(matches!(
            build_cors_layer(&server),
            Err(CliError::InvalidCorsOrigin(_))
        ));
    }
}
