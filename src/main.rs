use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, ValueEnum};
use shadow_rs::shadow;
use shortcode::{
    MappingStore, StoreConfig,
    persistence::{JsonFileStore, MemoryStore, SnapshotStore, SqliteStore},
    render::{Fallback, Renderer},
};
use tracing_subscriber::EnvFilter;

shadow!(build);

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    Json,
    Sqlite,
    Memory,
}

#[derive(Parser, Debug)]
#[command(version = build::VERSION, long_version = build::CLAP_LONG_VERSION, about = "", long_about = "")]
struct Args {
    #[arg(long, env = "HOST", default_value = "127.0.0.1:3000")]
    host: SocketAddr,
    /// prefix for rendered short links
    #[arg(long, env = "BASE_URL", default_value = "http://localhost:3000")]
    base_url: String,
    #[arg(long, env = "BACKEND", value_enum, default_value = "json")]
    backend: Backend,
    #[arg(long, env = "DATA_DIR", default_value = ".")]
    data_dir: PathBuf,
    #[arg(long, env = "ACCESS_LOG_CAP", default_value_t = 1000)]
    access_log_cap: usize,
    #[arg(long, env = "MAX_ATTEMPTS", default_value_t = 20)]
    max_attempts: u32,
    /// where visitors of unknown or expired codes are sent
    #[arg(long, env = "FALLBACK_LOCATION", default_value = "/")]
    fallback_location: String,
    /// seconds before the fallback redirect
    #[arg(long, env = "FALLBACK_DELAY", default_value_t = 3)]
    fallback_delay: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // construct a subscriber that prints formatted traces to stdout
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    // use that subscriber to process traces emitted after this point
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    tracing::info!("{:?}", &args);

    let persistence: Arc<dyn SnapshotStore> = match args.backend {
        Backend::Json => {
            let path = args.data_dir.join("shortcode.json");
            tracing::info!("json snapshot: {}", path.display());
            Arc::new(JsonFileStore::new(path))
        }
        Backend::Sqlite => {
            let path = args.data_dir.join("shortcode.db");
            tracing::info!("sqlitedb: {}", path.display());
            Arc::new(SqliteStore::open(path)?) // we want this to fail loudly
        }
        Backend::Memory => {
            tracing::warn!("in-memory backend, mappings are lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let config = StoreConfig {
        access_log_cap: args.access_log_cap.max(1),
        max_attempts: args.max_attempts.max(1),
    };
    let store = MappingStore::open(persistence, config).await;
    if store.health().degraded {
        tracing::warn!("store opened degraded: {:?}", store.health().last_error);
    }

    let fallback = Fallback {
        location: args.fallback_location.clone(),
        delay_secs: args.fallback_delay,
    };
    let renderer = Renderer::new(&args.base_url, fallback, store)?;
    let routes = shortcode::routes::get_routes(renderer);

    tracing::info!("starting warp server: {}", &args.host);
    warp::serve(routes)
        .bind(args.host)
        .await
        .graceful(async {
            tokio::signal::ctrl_c()
                .await
                .expect("\nfailed to install CTRL+C signal handler");
        })
        .run()
        .await;

    tracing::info!("gracefully exited.");
    tokio::time::sleep(Duration::from_secs(1)).await;

    Ok(())
}
