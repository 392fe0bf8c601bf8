use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use log::{info, warn};

use courier::config::Config;
use courier::logic::LocalLogic;
use courier::proto::{init_tcp, init_ws, Server};
use courier::registry::{self, Instance, LogRegistry};
use courier::rpc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "courier", version, about = "instant-messaging fan-out gateway")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = "courier.toml")]
    conf: PathBuf,

    /// Deployment region, e.g. sh.
    #[arg(long, env = "REGION")]
    region: Option<String>,

    /// Availability zone, e.g. sh001.
    #[arg(long, env = "ZONE")]
    zone: Option<String>,

    /// Deploy environment: dev/uat/pre/prod.
    #[arg(long, env = "DEPLOY_ENV")]
    deploy_env: Option<String>,

    /// Instance id; defaults to the machine hostname.
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Public addresses, comma separated.
    #[arg(long, env = "ADDRS")]
    addrs: Option<String>,

    /// Load-balancing weight.
    #[arg(long, env = "WEIGHT")]
    weight: Option<i64>,

    /// Keep the instance out of balancer rotation.
    #[arg(long, env = "OFFLINE")]
    offline: bool,

    /// Verbose per-connection logging.
    #[arg(long, env = "DEBUG")]
    debug: bool,
}

#[tokio::main]
async fn main() -> courier::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = if args.conf.exists() {
        Config::load(&args.conf)?
    } else {
        warn!("config file {:?} not found, using defaults", args.conf);
        Config::default()
    };
    apply_flags(&mut config, &args);

    info!("courier [version: {} env: {:?}] start", VERSION, config.env);

    let logic = Arc::new(LocalLogic::new(config.protocol.heartbeat()));
    let server = Server::new(config.clone(), logic)?;

    init_tcp(&server, &config.tcp.bind).await?;
    init_ws(&server, &config.websocket.bind).await?;
    rpc::serve(server.clone(), &config.rpc_server.addr).await?;

    let registry = Arc::new(LogRegistry);
    let instance = Instance::from_config(&config, server.server_id());
    let updater = tokio::spawn(registry::updater(
        server.clone(),
        registry.clone(),
        instance,
    ));

    wait_for_signal().await;
    info!("courier [version: {}] exiting", VERSION);

    // Close every connection, then let the updater deregister.
    server.close().await;
    let _ = updater.await;

    info!("courier [version: {}] exit", VERSION);
    Ok(())
}

fn apply_flags(config: &mut Config, args: &Args) {
    if let Some(ref region) = args.region {
        config.env.region = region.clone();
    }
    if let Some(ref zone) = args.zone {
        config.env.zone = zone.clone();
    }
    if let Some(ref deploy_env) = args.deploy_env {
        config.env.deploy_env = deploy_env.clone();
    }
    if let Some(ref host) = args.host {
        config.env.host = host.clone();
    }
    if let Some(ref addrs) = args.addrs {
        config.env.addrs = addrs.split(',').map(str::to_owned).collect();
    }
    if let Some(weight) = args.weight {
        config.env.weight = weight;
    }
    if args.offline {
        config.env.offline = true;
    }
    if args.debug {
        config.debug = true;
    }
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("signal handler failed; error={:?}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = term.recv() => info!("received SIGTERM"),
    }
}
