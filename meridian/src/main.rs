use std::error::Error;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, instrument, trace, warn};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod cli;

use meridian_api as api;
use meridian_state as state;
use meridian_store as store;
use meridian_util as util;

use crate::api::ApiState;
use crate::cli::Cli;
use crate::state::{MetricsThrottle, Reconciler};
use crate::store::{MemoryStore, Scope, Store};
use crate::util::cache::{MemoryTier, TieredCache};
use crate::util::types::Uuid;

fn initialize_tracing() -> Result<(), Box<dyn Error>> {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            // Use some log defaults. These can be overriden using
            // RUST_LOG
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive("debug".parse()?)
                    .add_directive("hyper=error".parse()?)
                    .add_directive("tower_http=debug".parse()?),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    initialize_tracing()?;

    let cli = cli::parse();

    let store = match &cli.seed {
        Some(path) => MemoryStore::load(path).await?,
        None => {
            warn!("no seed file provided, starting with an empty store");
            MemoryStore::new()
        }
    };

    start_service(cli, Arc::new(store)).await
}

#[instrument(name = "meridian", skip_all, err)]
async fn start_service(cli: Cli, store: Arc<dyn Store>) -> Result<(), Box<dyn Error>> {
    trace!(config = ?cli, "using config:");

    // Caches are in-process only, so each tier is backed by memory
    let metrics = MetricsThrottle::new(Arc::new(TieredCache::<Uuid>::new(
        "device-metrics",
        &cli.cache_version,
        cli.metrics_interval,
        Arc::new(MemoryTier::default()),
    )));
    let api_keys = Arc::new(TieredCache::<Scope>::new(
        "api-keys",
        &cli.cache_version,
        cli.api_key_cache_ttl,
        Arc::new(MemoryTier::default()),
    ));

    let reconciler = Reconciler::new(Arc::clone(&store), metrics);
    let state = ApiState::new(store, reconciler, api_keys).with_trusted_proxy(cli.trust_proxy);

    let listener = TcpListener::bind(cli.listen_address).await?;
    debug!("bound to address {}", cli.listen_address);

    api::start(listener, state).await?;

    Ok(())
}
