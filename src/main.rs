use clap::Parser;

use mqttd::args::Args;
use mqttd::backend::MemoryBackend;
use mqttd::broker::Engine;
use mqttd::config::BrokerConfig;
use mqttd::{transport, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    mqttd::bootstrap(args.log)?;

    let config = BrokerConfig::load(&args.config)?;

    let engine = Engine::new(MemoryBackend::new(), config.engine_options());

    let mut closers = Vec::new();

    for url in &config.listeners {
        let listener = transport::launch(url, config.tls_config()?).await?;
        closers.push(listener.closer());
        engine.accept(listener);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    // Close the listeners first so the acceptors exit; only then will
    // `close()` be able to drain every task.
    for closer in &closers {
        closer.close();
    }

    engine.close().await;

    Ok(())
}
