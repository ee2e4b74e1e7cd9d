use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use tokio::task::JoinHandle;
use tracing::info;

use rule_engine::config::Config;
use rule_engine::coordinator::EngineContext;
use rule_engine::fs_source::{FileRuleProvider, LogSink, SpoolDirectory};
use rule_engine::server;
use rule_engine::service::RuleEngineService;

fn start_server(config: &Config) -> JoinHandle<()> {
    let router = server::router();
    let bind = config.bind_address();

    tokio::task::spawn(async move {
        server::serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("Starting rule engine service");

    let config = Config::init_from_env()
        .context("Failed to load configuration from environment variables")?;
    info!("Configuration loaded: {:?}", config);

    let server_handle = start_server(&config);
    info!("Started metrics server on {}", config.bind_address());

    let spool = Arc::new(SpoolDirectory::new(PathBuf::from(&config.spool_dir)));
    let context = EngineContext {
        provider: Arc::new(FileRuleProvider::new(PathBuf::from(&config.rules_file))),
        catalog: spool.clone(),
        pipeline: spool,
        sink: Arc::new(LogSink),
    };

    let service = RuleEngineService::new(config, context)
        .context("Failed to create rule engine service")?;
    service.run().await?;

    server_handle.abort();
    Ok(())
}
