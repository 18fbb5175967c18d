//! Drover frontend server binary
//!
//! Thin TCP transport over the bundle pipeline: length-prefixed postcard
//! frames in, one response parcel per request parcel out. TLS termination
//! and HTTP fronting belong to the infrastructure in front of this process.

use clap::Parser;
use drover::frontend::message::MAX_PARCEL_SIZE;
use drover::{
    crypto, metrics, Event, FrontendConfig, FrontendServer, Message, Parcel, WellKnownFlow,
    WorkerPool,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "drover", version, about = "Drover fleet frontend server")]
struct Args {
    /// Listen address for the agent transport
    #[arg(short, long, default_value = "0.0.0.0:7700")]
    listen: SocketAddr,

    /// Data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Maximum tasks handed to one agent per exchange
    #[arg(long, default_value_t = 50)]
    max_queue_size: usize,

    /// Bundle admission ratio in (0, 1]; omit to disable throttling
    #[arg(long)]
    throttle_ratio: Option<f64>,

    /// Throttler averaging window in seconds
    #[arg(long, default_value_t = 60)]
    throttle_interval: u64,

    /// Worker threads for deferred flow work
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Comma-separated well-known flows active on this node
    #[arg(long, default_value = "Stats")]
    flows: String,
}

/// Sink for unsolicited agent stats reports. Parsing is pushed onto the
/// worker pool so the bundle path only pays for the hand-off.
struct StatsSink {
    pool: Arc<WorkerPool>,
}

impl WellKnownFlow for StatsSink {
    fn name(&self) -> &str {
        "Stats"
    }

    fn process_messages(&self, messages: Vec<Message>) {
        self.pool.spawn(move || {
            for msg in &messages {
                debug!(
                    "stats report on {}: {} bytes",
                    msg.session_id,
                    msg.payload.len()
                );
            }
        });
    }
}

async fn handle_connection(server: Arc<FrontendServer>, mut stream: TcpStream) {
    let peer_addr = stream.peer_addr().ok();
    let peer = peer_addr
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    loop {
        let mut len_bytes = [0u8; 4];
        if stream.read_exact(&mut len_bytes).await.is_err() {
            break;
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_PARCEL_SIZE {
            warn!("oversized parcel ({} bytes) from {}", len, peer);
            break;
        }

        let mut frame = vec![0u8; len];
        if stream.read_exact(&mut frame).await.is_err() {
            break;
        }

        let mut parcel: Parcel = match postcard::from_bytes(&frame) {
            Ok(parcel) => parcel,
            Err(e) => {
                warn!("malformed parcel from {}: {}", peer, e);
                break;
            }
        };
        // The observed address belongs to the transport; whatever the
        // agent wrote in this field is discarded.
        parcel.source_ip = peer_addr.map(|a| a.ip());

        let server = Arc::clone(&server);
        let result =
            tokio::task::spawn_blocking(move || server.handle_bundle(&parcel)).await;

        let response = match result {
            Ok(Ok((response, source, count))) => {
                debug!("handled bundle from {} ({} messages)", source, count);
                response
            }
            Ok(Err(e)) => {
                // No response parcel: the agent retries later and its leased
                // tasks resurface when the leases lapse.
                warn!("bundle from {} rejected: {}", peer, e);
                break;
            }
            Err(e) => {
                error!("bundle handler panicked: {}", e);
                break;
            }
        };

        let encoded = match postcard::to_allocvec(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("failed to encode response for {}: {}", peer, e);
                break;
            }
        };
        if stream
            .write_all(&(encoded.len() as u32).to_be_bytes())
            .await
            .is_err()
            || stream.write_all(&encoded).await.is_err()
        {
            break;
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("drover=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    info!("Drover v{} — fleet frontend", VERSION);
    info!("Listen: {} | Data dir: {:?}", args.listen, args.data_dir);

    let db = match sled::open(args.data_dir.join("store")) {
        Ok(db) => db,
        Err(e) => {
            error!("failed to open store: {}", e);
            return;
        }
    };

    let identity = match crypto::load_or_generate_identity(&args.data_dir) {
        Ok(identity) => identity,
        Err(e) => {
            error!("failed to load identity keys: {}", e);
            return;
        }
    };
    let exchange = match crypto::load_or_generate_exchange(&args.data_dir) {
        Ok(exchange) => exchange,
        Err(e) => {
            error!("failed to load exchange key: {}", e);
            return;
        }
    };

    let config = FrontendConfig {
        max_queue_size: args.max_queue_size,
        threadpool_size: args.workers,
        well_known_flows: args
            .flows
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        throttle_average_interval: std::time::Duration::from_secs(args.throttle_interval),
        throttle_ratio: args.throttle_ratio,
        ..Default::default()
    };

    let pool = Arc::new(WorkerPool::new(config.worker_threads()));
    let flows: Vec<Arc<dyn WellKnownFlow>> = vec![Arc::new(StatsSink {
        pool: Arc::clone(&pool),
    })];

    let (server, mut event_rx) =
        match FrontendServer::new(config, identity, exchange, &db, flows, pool) {
            Ok(built) => built,
            Err(e) => {
                error!("failed to build frontend server: {}", e);
                return;
            }
        };
    let server = Arc::new(server);

    info!(
        "Server exchange key: {}",
        hex::encode(server.exchange_public())
    );

    // Crash events from ingested STATUS messages.
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                Event::ClientCrash { agent, message } => {
                    warn!(
                        "agent {} crashed during request {} on {}",
                        agent, message.request_id, message.session_id
                    );
                }
            }
        }
    });

    // Periodic status line.
    tokio::spawn(async {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            info!(
                "Status: {} bundles handled | {} throttled | {} tasks sent",
                metrics::HANDLE_BUNDLES.get(),
                metrics::HANDLE_THROTTLED.get(),
                metrics::MESSAGES_SENT.get()
            );
        }
    });

    let listener = match TcpListener::bind(args.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {}", args.listen, e);
            return;
        }
    };
    info!("Accepting agent connections on {}", args.listen);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        debug!("connection from {}", addr);
                        tokio::spawn(handle_connection(Arc::clone(&server), stream));
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }
}
