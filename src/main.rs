use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use servant_cluster::config::NodeConfig;
use servant_cluster::coordination::{self, Namespace};
use servant_cluster::error::HandlerError;
use servant_cluster::master::{AuthoritativeTickets, ConservativeAverageDispatch};
use servant_cluster::node::{Node, RunningNode};
use servant_cluster::proto::ticket_dispatcher_client::TicketDispatcherClient;
use servant_cluster::proto::{Empty, TicketsInfo};
use servant_cluster::servant::TicketHandler;
use servant_cluster::shutdown::install_shutdown_handler;
use servant_cluster::tickets::{load_ticket_file, Ticket, TicketRecord, TicketSet};

#[derive(Parser, Debug)]
#[command(name = "servant-cluster")]
#[command(version)]
#[command(about = "Elected-master ticket distribution across elastic servant pools")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run servant nodes sharing one coordination namespace
    Serve(ServeArgs),

    /// Inspect or assign a single servant's tickets over RPC
    Tickets {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: TicketCommands,
    },
}

// =============================================================================
// Serve Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Number of nodes to run in this process
    #[arg(long, default_value = "1")]
    nodes: usize,

    /// RPC port of the first node; node i listens on base_port + i. 0 picks free ports
    #[arg(long, default_value = "7000")]
    base_port: u16,

    /// Host other nodes use to reach this process
    #[arg(long, env = "SERVANT_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Coordination store endpoints, e.g. memory://local
    #[arg(
        long,
        env = "SERVANT_COORDINATION",
        value_delimiter = ',',
        default_value = "memory://local"
    )]
    coordination: Vec<String>,

    /// Coordination namespace prefix
    #[arg(long, env = "SERVANT_PREFIX", default_value = "/servant-cluster")]
    prefix: String,

    /// JSON file with the authoritative ticket list
    #[arg(long)]
    tickets: Option<PathBuf>,

    /// Maximum concurrent workers per node
    #[arg(long, default_value = "8")]
    max_workers: usize,

    /// Seconds between master dispatch cycles (0 uses 60)
    #[arg(long, default_value = "60")]
    master_interval_secs: u64,

    /// Milliseconds a worker waits between tickets (0 uses 1)
    #[arg(long, default_value = "1000")]
    servant_interval_ms: u64,

    /// Per-call timeout of master to servant RPCs
    #[arg(long)]
    rpc_timeout_ms: Option<u64>,

    /// Port for the first node's web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Servant RPC address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:7000")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum TicketCommands {
    /// Show the tickets a servant currently holds
    Get,
    /// Replace a servant's tickets with the contents of a JSON file
    Set {
        /// JSON array of {"id", "type", "content"}
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Serialize)]
struct TicketsOutput {
    tickets: Vec<TicketRecord>,
    stats: Option<String>,
}

#[derive(Serialize)]
struct SetOutput {
    assigned: usize,
}

// =============================================================================
// Serve
// =============================================================================

/// Logs every ticket it is handed.
struct LogHandler;

#[async_trait]
impl TicketHandler for LogHandler {
    async fn handle(&self, ticket: &Ticket) -> Result<(), HandlerError> {
        tracing::info!(
            ticket_id = %ticket.id,
            kind = %ticket.kind,
            bytes = ticket.content.len(),
            "Processing ticket"
        );
        Ok(())
    }
}

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if args.nodes == 0 {
        return Err("--nodes must be at least 1".into());
    }

    let shutdown = install_shutdown_handler()?;

    let tickets = match &args.tickets {
        Some(path) => load_ticket_file(path).await?,
        None => TicketSet::new(),
    };
    tracing::info!(tickets = tickets.len(), summary = %tickets.summary(), "Loaded tickets");
    let source = Arc::new(AuthoritativeTickets::new(tickets));
    let policy = Arc::new(ConservativeAverageDispatch::new(source));

    let namespace = coordination::connect(&args.coordination)?;
    let reaper = namespace
        .clone()
        .spawn_reaper(Duration::from_millis(500), shutdown.clone());
    let shared: Arc<dyn Namespace> = namespace;

    let mut nodes: Vec<RunningNode> = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let port = if args.base_port == 0 {
            0
        } else {
            args.base_port
                .checked_add(i as u16)
                .ok_or("port range overflows")?
        };
        let mut config = NodeConfig::new(SocketAddr::from(([0, 0, 0, 0], port)))
            .with_prefix(args.prefix.clone())
            .with_max_workers(args.max_workers)
            .with_master_interval(Duration::from_secs(args.master_interval_secs))
            .with_servant_interval(Duration::from_millis(args.servant_interval_ms));
        config.coordination_endpoints = args.coordination.clone();
        config.advertise_host = args.host.clone();
        config.rpc_timeout = args.rpc_timeout_ms.map(Duration::from_millis);
        if i == 0 {
            if let Some(port) = args.dashboard_port {
                config = config.with_dashboard(SocketAddr::from(([0, 0, 0, 0], port)));
            }
        }

        let node = Node::builder(config)
            .namespace(shared.clone())
            .dispatch_policy(policy.clone())
            .ticket_handler(Arc::new(LogHandler))
            .build()?
            .start()
            .await?;
        tracing::info!(node = i, address = %node.address(), "Servant node running");
        nodes.push(node);
    }

    shutdown.cancelled().await;

    for node in &nodes {
        if let Err(e) = node.shutdown().await {
            tracing::warn!(address = %node.address(), error = %e, "Node shutdown failed");
        }
    }
    if let Err(e) = reaper.await {
        tracing::warn!(error = %e, "Lease reaper panicked");
    }
    Ok(())
}

// =============================================================================
// Ticket Commands
// =============================================================================

async fn handle_tickets_get(
    client: &mut TicketDispatcherClient<tonic::transport::Channel>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.get_tickets(Empty {}).await?.into_inner();
    let tickets = response.to_ticket_set()?;
    let stats = response
        .sys_info
        .map(|info| String::from_utf8_lossy(&info.stats).into_owned());

    match output_format {
        OutputFormat::Json => {
            let output = TicketsOutput {
                tickets: tickets.iter().map(TicketRecord::from).collect(),
                stats,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if tickets.is_empty() {
                println!("No tickets held.");
            } else {
                println!("{:<36} {:<11} CONTENT", "TICKET ID", "TYPE");
                println!("{}", "-".repeat(70));
                for ticket in tickets.iter() {
                    let content = String::from_utf8_lossy(&ticket.content);
                    let content_display = if content.chars().count() > 20 {
                        format!("{}...", content.chars().take(17).collect::<String>())
                    } else {
                        content.into_owned()
                    };
                    println!("{:<36} {:<11} {}", ticket.id, ticket.kind, content_display);
                }
                println!();
                println!("{} tickets", tickets.len());
            }
            if let Some(stats) = stats {
                println!("Stats: {}", stats);
            }
        }
    }
    Ok(())
}

async fn handle_tickets_set(
    client: &mut TicketDispatcherClient<tonic::transport::Channel>,
    file: PathBuf,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let tickets = load_ticket_file(&file).await?;
    client
        .set_tickets(TicketsInfo::from_tickets(&tickets))
        .await?;

    match output_format {
        OutputFormat::Json => {
            let output = SetOutput {
                assigned: tickets.len(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Assigned {} tickets.", tickets.len());
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => {
            run_serve(serve_args).await?;
        }
        Commands::Tickets { client, command } => {
            let mut grpc_client = TicketDispatcherClient::connect(client.addr.clone()).await?;

            match command {
                TicketCommands::Get => {
                    handle_tickets_get(&mut grpc_client, &client.output).await?;
                }
                TicketCommands::Set { file } => {
                    handle_tickets_set(&mut grpc_client, file, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
