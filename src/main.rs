use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vidsearch::api::{self, AppState, Converter};
use vidsearch::client::{StoreClient, StoreClientConfig};
use vidsearch::config::Credentials;
use vidsearch::indexer::SyncQueue;
use vidsearch::manager::SystemProfile;
use vidsearch::pool::PoolConfig;
use vidsearch::search::{ElasticClient, ElasticConfig, MemoryIndex, SearchBackend};
use vidsearch::{Error, Result};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum IndexBackend {
    /// Elasticsearch-compatible service over HTTP
    Elastic,
    /// In-process index, lost on restart
    Memory,
}

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = "Video metadata and transcript search API", long_about = None)]
struct Args {
    #[clap(long, default_value = "0.0.0.0:3001")]
    addr: SocketAddr,

    /// Address of the vidstore record store
    #[clap(long, default_value = "127.0.0.1:6380")]
    store_addr: String,

    /// Credentials file (User, Pass, ElasticUser, ElasticPass)
    #[clap(long, default_value = "config/keys.json")]
    keys: PathBuf,

    #[clap(long, value_enum, default_value = "elastic")]
    index_backend: IndexBackend,

    #[clap(long, default_value = "http://127.0.0.1:9200")]
    elastic_url: String,

    /// Idle connections kept per pool
    #[clap(long, default_value = "80")]
    max_idle: usize,

    /// Connections allowed out at once per pool
    #[clap(long, default_value = "12000")]
    max_active: usize,

    /// Retries after a connection failure to the index service
    #[clap(long, default_value = "10")]
    index_retries: usize,

    /// Hits asked of the index service per search
    #[clap(long, default_value = "10000")]
    max_hits: usize,

    /// Deadline for each store, sync and search operation
    #[clap(long, default_value = "5000")]
    op_timeout_ms: u64,

    /// Queue a sync after every successful write
    #[clap(long)]
    sync_on_write: bool,

    #[clap(long, default_value = "1024")]
    sync_queue: usize,

    /// Media converter used by /api/videos/process (empty disables it)
    #[clap(long, default_value = "ffmpeg")]
    converter: String,

    #[clap(long, default_value = ".")]
    convert_dir: PathBuf,
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

    // Only startup failures end the process
    if let Err(e) = runtime.block_on(async_main(args)) {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
}

async fn async_main(args: Args) -> Result<()> {
    let credentials = Credentials::load(&args.keys)?;
    info!("Loaded credentials from {}", args.keys.display());

    let pool = PoolConfig { max_idle: args.max_idle, max_active: args.max_active };
    let store = StoreClient::new(StoreClientConfig {
        addr: args.store_addr.clone(),
        credentials: credentials.store(),
        pool,
        op_timeout: Duration::from_millis(args.op_timeout_ms),
    });
    match store.ping().await {
        Ok(()) => info!("Record store reachable at {}", args.store_addr),
        Err(e) => warn!("Record store not reachable yet at {}: {}", args.store_addr, e),
    }

    match args.index_backend {
        IndexBackend::Elastic => {
            let es = ElasticClient::new(ElasticConfig {
                url: args.elastic_url.clone(),
                credentials: credentials.index(),
                max_retries: args.index_retries,
                max_idle: args.max_idle,
                max_active: args.max_active,
                max_hits: args.max_hits,
                ..Default::default()
            })?;
            serve(args, store, Arc::new(es)).await
        }
        IndexBackend::Memory => serve(args, store, Arc::new(MemoryIndex::new())).await,
    }
}

async fn serve<B: SearchBackend>(args: Args, store: StoreClient, backend: Arc<B>) -> Result<()> {
    match backend.version().await {
        Ok(version) => info!("Index service version {}", version),
        Err(e) => warn!("Index service not reachable yet: {}", e),
    }

    let mut state = AppState::new(store.clone(), backend, Duration::from_millis(args.op_timeout_ms));
    if let Err(e) = state.indexer.ensure_collection().await {
        warn!("Could not prepare the search collection, the first sync will retry: {}", e);
    }
    if !args.converter.is_empty() {
        state = state.with_converter(Converter::new(args.converter.clone(), args.convert_dir.clone()));
    }
    let worker = if args.sync_on_write {
        let (queue, handle) = SyncQueue::spawn(state.indexer.clone(), args.sync_queue);
        state = state.with_sync_queue(queue);
        Some(handle)
    } else {
        None
    };

    let (addr, server) = warp::serve(api::routes(state))
        .try_bind_with_graceful_shutdown(args.addr, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .map_err(|e| Error::Config(format!("cannot bind {}: {}", args.addr, e)))?;
    info!("vidsearch API listening on http://{}", addr);

    server.await;
    info!("Shutting down.");

    // Routes are gone, so the queue's last sender is too
    if let Some(handle) = worker {
        let _ = handle.await;
    }
    store.close();
    Ok(())
}
