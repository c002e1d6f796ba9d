use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rttp_proxy::{
    Blacklist, Cli, ProxyConfig, ProxyServer, RequestHandler, ResponseCache, Scheduler, ThreadPool,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rttp_proxy=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = ProxyConfig::from_env(&cli)?;

    tracing::info!(
        port = config.port,
        workers = config.workers,
        cache_dir = %config.cache_dir.display(),
        blacklist = %config.blacklist_path.display(),
        "configuration loaded"
    );

    let blacklist = Blacklist::load(&config.blacklist_path)?;
    let cache = ResponseCache::open(&config.cache_dir, config.cache.clone())?;
    let handler = RequestHandler::new(Arc::new(blacklist), Arc::new(cache), config.handler.clone());

    let pool = ThreadPool::new(config.workers)?;
    let scheduler = Scheduler::new(pool, Arc::new(handler));
    let server = ProxyServer::bind(&config, scheduler)?;

    server.run();
    Ok(())
}
