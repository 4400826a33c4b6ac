use color_eyre::Result;
use homebus::bus::{BusLogLayer, LogQueue};
use homebus::config::{LoggingConfig, NodeConfig};
use homebus::manager::Node;
use homebus::plugins::PluginCatalog;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = NodeConfig::load(config_path.as_deref()).await?;
    let log_queue = setup_logging(&config.logging);

    let connector = config.connector();
    let node = Node::new(
        config.transport_options(),
        &connector,
        log_queue,
        PluginCatalog::builtin(),
    )?;

    for component in &config.components {
        if let Err(e) = node.manager().add_component(component.clone()) {
            error!("Could not add component '{}': {}", component.id, e);
        }
    }

    for binding in &config.bindings {
        if let Err(e) = node.manager().add_binding(binding.clone()) {
            error!("Could not add binding '{}': {}", binding, e);
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    node.terminate().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

/// Console output, plus forwarding to the bus when enabled. `RUST_LOG` wins
/// over the configured level.
fn setup_logging(config: &LoggingConfig) -> Option<LogQueue> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console = fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let queue = config.publish_to_bus.then(LogQueue::default);
    let bus = queue.clone().map(BusLogLayer::new);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(bus)
        .init();

    queue
}
