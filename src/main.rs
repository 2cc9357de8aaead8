//! Seawire host binary.
//!
//! Boots the framework services and the administrative HTTP surface, then
//! runs until interrupted. Protocol listeners are registered by loaded
//! modules; the host itself only wires the shared subsystems together.

mod cli;

use std::sync::Arc;

use clap::Parser;
use seawire::{
    config::ServerConfig, module::ModuleLoader, profile::Profiler, registry::SessionRegistry,
    system_http::{SystemContext, SystemHttpServer},
};

#[tokio::main]
async fn main() -> seawire::Result<()> {
    // Applications embedding the library should install their own
    // subscriber.
    tracing_subscriber::fmt::init();

    let cli = cli::Cli::parse();
    let config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };

    let loader = ModuleLoader::new();
    let connections = Arc::new(SessionRegistry::new());
    let profiler = Arc::new(Profiler::new());

    for module in &cli.modules {
        loader.load(module)?;
    }

    let http = SystemHttpServer::start(
        &config,
        SystemContext {
            loader: Arc::clone(&loader),
            connections: Arc::clone(&connections),
            profiler: Arc::clone(&profiler),
        },
    )
    .await?;
    log::info!("seawire host up, admin surface on {}", http.local_addr());

    tokio::signal::ctrl_c().await?;
    log::info!("interrupt received, shutting down");

    http.stop();
    loader.stop().await;
    Ok(())
}
