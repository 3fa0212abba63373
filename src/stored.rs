use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vidsearch::config::Credentials;
use vidsearch::manager::{self, SystemProfile};
use vidsearch::server::StoreServer;
use vidsearch::{Error, Result, StoreEngine};

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = "Record store for vidsearch", long_about = None)]
struct Args {
    #[clap(long, default_value = "127.0.0.1:6380")]
    addr: String,

    /// Segment file holding every record
    #[clap(long, default_value = "vidstore.dat")]
    data: PathBuf,

    /// Credentials file; when given, clients must log in with User/Pass
    #[clap(long)]
    keys: Option<PathBuf>,

    /// Seconds between background compactions (0 disables them)
    #[clap(long, default_value = "600")]
    compact_interval_secs: u64,
}

fn main() {
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,vidsearch=info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .init();

    let profile = SystemProfile::detect();
    profile.log();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(profile.worker_threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Cannot start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(async_main(args, profile)) {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
}

async fn async_main(args: Args, profile: SystemProfile) -> Result<()> {
    let credentials = match &args.keys {
        Some(path) => Credentials::load(path)?.store(),
        None => None,
    };
    if credentials.is_none() {
        info!("No store credentials configured, accepting every client");
    }

    info!("Initializing Storage Engine...");
    let engine = StoreEngine::open(&args.data, profile.strict_durability)
        .map_err(|e| Error::Config(format!("cannot open {}: {}", args.data.display(), e)))?;
    let engine = Arc::new(engine);

    if args.compact_interval_secs > 0 {
        manager::start_gc_thread(engine.clone(), Duration::from_secs(args.compact_interval_secs));
    }

    let server = StoreServer::new(engine, credentials);
    tokio::select! {
        res = server.run(&args.addr) => {
            res.map_err(|e| Error::Config(format!("cannot serve on {}: {}", args.addr, e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down.");
        }
    }
    Ok(())
}
