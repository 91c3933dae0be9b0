use std::{collections::HashMap, path::PathBuf};

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use berth_agent::{AgentConfig, LoginClient, TunnelAgent};
use berth_protocol::frames::ExposedPort;

#[derive(Parser)]
#[command(name = "berth", about = "Berth — control plane for developer workspaces")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Path to berth.toml (overrides discovery).
    #[arg(long, global = true, env = "BERTH_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the control plane (default when no subcommand is given).
    Serve,
    /// Local tunnel agent commands.
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
}

#[derive(Subcommand)]
enum AgentCommands {
    /// Sign in via device code and print the agent token.
    Login {
        /// Control plane API base URL.
        #[arg(long, env = "BERTH_API_URL")]
        api_url: String,
    },
    /// Attach the local machine to a workspace and expose ports.
    Connect {
        /// Control plane API base URL.
        #[arg(long, env = "BERTH_API_URL")]
        api_url: String,
        /// WebSocket endpoint of the tunnel broker.
        #[arg(long, env = "BERTH_WS_URL")]
        ws_url: String,
        /// Agent token from `berth agent login`.
        #[arg(long, env = "BERTH_AGENT_TOKEN")]
        token: String,
        /// Workspace to attach to.
        #[arg(long)]
        workspace: String,
        /// Root service port on this machine.
        #[arg(long, default_value_t = 3000)]
        port: u16,
        /// Extra services as `name=port`, repeatable.
        #[arg(long = "expose", value_parser = parse_expose)]
        exposed: Vec<(String, u16)>,
    },
}

fn parse_expose(raw: &str) -> Result<(String, u16), String> {
    let (name, port) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=port, got '{raw}'"))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| format!("invalid port in '{raw}': {e}"))?;
    if name.is_empty() {
        return Err(format!("empty service name in '{raw}'"));
    }
    Ok((name.to_string(), port))
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("berth={level},tower_http=warn")));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let config = match &cli.config {
                Some(path) => berth_config::load_config(path)
                    .map_err(|e| anyhow::anyhow!("config error: {e}"))?,
                None => berth_config::discover_and_load(),
            };
            let state = berth_gateway::build_services(config).await?;
            berth_gateway::server::serve(state).await
        },
        Commands::Agent { command } => run_agent(command).await,
    }
}

async fn run_agent(command: AgentCommands) -> anyhow::Result<()> {
    match command {
        AgentCommands::Login { api_url } => {
            let client = LoginClient::new(api_url);
            let login = client.start().await?;
            println!("Visit your dashboard and enter code: {}", login.user_code);
            let token = client.poll_until_token(&login).await?;
            println!("{token}");
            Ok(())
        },
        AgentCommands::Connect {
            api_url,
            ws_url,
            token,
            workspace,
            port,
            exposed,
        } => {
            // Redeem the long-lived agent token for a fresh tunnel token.
            let client = LoginClient::new(api_url);
            let tunnel_token = client.mint_tunnel_token(&token, &workspace).await?;

            let mut exposed_ports: HashMap<String, ExposedPort> = HashMap::from([(
                "root".to_string(),
                ExposedPort {
                    port,
                    description: None,
                },
            )]);
            for (name, service_port) in exposed {
                exposed_ports.insert(name, ExposedPort {
                    port: service_port,
                    description: None,
                });
            }

            info!(workspace = %workspace, port, "starting tunnel agent");
            let agent = TunnelAgent::new(AgentConfig {
                ws_url: format!("{ws_url}?token={tunnel_token}"),
                token: tunnel_token,
                local_host: "127.0.0.1".into(),
                local_port: port,
                exposed_ports,
            });
            agent.run().await;
            Ok(())
        },
    }
}
