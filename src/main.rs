use clap::Parser;
use connpool::config::Config;
use connpool::pool::{ConnectionKind, HostPortPair, SocketParams};
use connpool::transport::TcpConnectJobFactory;
use connpool::{ClientSocketPool, GroupId, PoolError, PoolService, Priority, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[cfg(feature = "fast-allocator")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "connpool")]
#[command(
    about = "Connect to destinations through a pooled TCP connection pool",
    long_about = None
)]
#[command(version)]
struct Args {
    /// Destinations to connect to (host:port)
    #[arg(value_name = "HOST:PORT")]
    destinations: Vec<String>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Generate example configuration file
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(long)]
    log_level: Option<String>,

    /// Sockets to preconnect per destination before connecting
    #[arg(long, default_value_t = 0)]
    preconnect: usize,

    /// Connections to open per destination
    #[arg(long, default_value_t = 1)]
    connections: usize,

    /// Request priority (throttled, idle, lowest, low, medium, highest)
    #[arg(long, default_value = "medium")]
    priority: String,

    /// Print Prometheus metrics after the run
    #[cfg(feature = "metrics")]
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle config generation
    if let Some(config_path) = args.generate_config {
        println!("Generating example configuration file: {:?}", config_path);
        Config::create_example(&config_path)?;
        println!("Example configuration file created successfully!");
        println!(
            "Edit the file and run: connpool --config {:?} HOST:PORT",
            config_path
        );
        return Ok(());
    }

    // Load configuration
    let mut config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => Config::default(),
    };
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    init_logging(&config.logging.level, &config.logging.format)?;
    info!("connpool v{} starting", env!("CARGO_PKG_VERSION"));

    #[cfg(feature = "metrics")]
    connpool::pool::metrics::init();

    let priority = parse_priority(&args.priority)?;
    let groups = args
        .destinations
        .iter()
        .map(|dest| {
            HostPortPair::parse(dest)
                .map(|pair| GroupId::new(pair, ConnectionKind::Http))
                .ok_or_else(|| PoolError::Config(format!("Invalid destination: {}", dest)))
        })
        .collect::<Result<Vec<_>>>()?;
    if groups.is_empty() {
        warn!("No destinations given, nothing to do");
        return Ok(());
    }

    let factory = Arc::new(TcpConnectJobFactory::new(config.transport.to_options()));
    let pool = ClientSocketPool::new(config.pool.to_settings(), factory);
    let service = PoolService::spawn(pool);
    let client = service.client();

    if args.preconnect > 0 {
        for group in &groups {
            match client
                .preconnect(group.clone(), SocketParams::default(), args.preconnect)
                .await
            {
                Ok(started) => info!(group = %group, started, "Preconnect issued"),
                Err(e) => warn!(group = %group, error = %e, "Preconnect failed"),
            }
        }
    }

    let attempts = groups.iter().flat_map(|group| {
        let client = client.clone();
        (0..args.connections).map(move |_| {
            let client = client.clone();
            let group = group.clone();
            async move {
                let started = tokio::time::Instant::now();
                let result = client.connect(group.clone(), priority).await;
                (group, result, started.elapsed())
            }
        })
    });

    let mut sockets = Vec::new();
    for (group, result, elapsed) in futures::future::join_all(attempts).await {
        match result {
            Ok(socket) => {
                let peer = socket
                    .get()
                    .and_then(|s| s.peer_addr().ok())
                    .map(|addr| addr.to_string())
                    .unwrap_or_default();
                info!(
                    group = %group,
                    peer,
                    reuse = ?socket.reuse_type(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Connected"
                );
                sockets.push(socket);
            }
            Err(e) => error!(group = %group, error = %e, "Connection failed"),
        }
    }

    // Hand the sockets back so they show up as idle.
    for socket in sockets {
        client.release(socket);
    }

    let stats = client.stats().await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&stats)
            .map_err(|e| PoolError::Config(format!("Failed to encode stats: {}", e)))?
    );

    #[cfg(feature = "metrics")]
    if args.metrics {
        print!("{}", connpool::pool::metrics::render());
    }

    service.shutdown().await;
    Ok(())
}

fn parse_priority(value: &str) -> Result<Priority> {
    serde_json::from_value(serde_json::Value::String(value.to_ascii_lowercase()))
        .map_err(|_| PoolError::Config(format!("Invalid priority: {}", value)))
}

fn init_logging(level: &str, format: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(level)
        .map_err(|e| PoolError::Config(format!("Invalid log level: {}", e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }

    Ok(())
}
