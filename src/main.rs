use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use fleet_queue::config::QueueServerConfig;
use fleet_queue::scheduler::NothingToDequeueBehavior;
use fleet_queue::server::QueueServer;
use fleet_queue::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "fleet-queue")]
#[command(version)]
#[command(about = "Distributes test buckets over a fleet of workers with retries and liveness tracking")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the queue server
    Serve(ServeArgs),

    /// Print the effective configuration as JSON and exit
    PrintConfig(ServeArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// JSON configuration file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of times a failed test is re-run
    #[arg(long)]
    number_of_retries: Option<u32>,

    /// Expected interval between worker heartbeats, in seconds
    #[arg(long)]
    report_alive_interval_secs: Option<u64>,

    /// Grace period on top of the heartbeat interval, in seconds
    #[arg(long)]
    alive_grace_secs: Option<u64>,

    /// Delay workers are told to wait when nothing can be dequeued, in seconds
    #[arg(long)]
    check_again_secs: Option<u64>,

    /// Release idle workers once every job is depleted instead of parking them
    #[arg(long)]
    wait_for_depletion: bool,

    /// Period of the stuck bucket sweep, in seconds
    #[arg(long)]
    stuck_poll_secs: Option<u64>,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,
}

fn build_config(args: ServeArgs) -> Result<QueueServerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => QueueServerConfig::from_json_file(path)?,
        None => QueueServerConfig::default(),
    };

    if let Some(retries) = args.number_of_retries {
        config = config.with_number_of_retries(retries);
    }
    if let Some(secs) = args.report_alive_interval_secs {
        config = config.with_report_alive_interval(Duration::from_secs(secs));
    }
    if let Some(secs) = args.alive_grace_secs {
        config = config
            .with_additional_time_to_perform_worker_is_alive_report(Duration::from_secs(secs));
    }
    if let Some(secs) = args.stuck_poll_secs {
        config = config.with_stuck_bucket_poll_interval(Duration::from_secs(secs));
    }

    if args.check_again_secs.is_some() || args.wait_for_depletion {
        let check_after = match args.check_again_secs {
            Some(secs) => Duration::from_secs(secs),
            None => match config.nothing_to_dequeue_behavior {
                NothingToDequeueBehavior::CheckLater { check_after }
                | NothingToDequeueBehavior::WaitForAllQueuesToDeplete { check_after } => {
                    check_after
                }
            },
        };
        let behavior = if args.wait_for_depletion {
            NothingToDequeueBehavior::WaitForAllQueuesToDeplete { check_after }
        } else {
            NothingToDequeueBehavior::CheckLater { check_after }
        };
        config = config.with_nothing_to_dequeue_behavior(behavior);
    }

    if let Some(port) = args.dashboard_port {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        config = config.with_dashboard_addr(addr);
    }

    config.validate()?;
    Ok(config)
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = build_config(args)?;

    tracing::info!(
        number_of_retries = config.number_of_retries,
        report_alive_interval_secs = config.report_alive_interval.as_secs_f64(),
        alive_grace_secs = config
            .additional_time_to_perform_worker_is_alive_report
            .as_secs_f64(),
        nothing_to_dequeue_behavior = ?config.nothing_to_dequeue_behavior,
        known_workers = config.known_worker_ids.len(),
        dashboard_addr = ?config.dashboard_addr,
        "Starting fleet-queue server"
    );

    let shutdown = install_shutdown_handler()?;
    let server = Arc::new(QueueServer::new(config));
    server.run(shutdown).await?;

    tracing::info!("Queue server stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_server(serve_args).await,
        Commands::PrintConfig(serve_args) => {
            let config = build_config(serve_args)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
