use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::client::{BusClient, ClientOptions};
use super::components::ComponentChannel;
use super::error::BusResult;
use super::instance_info::{hostname, InstanceInfoPublisher};
use super::link::Connector;
use super::logger::{BusLogger, LogQueue, LoggerIdentity};
use super::metadata::MetadataChannel;
use super::presence::Presence;
use super::rpc::Rpc;
use crate::observable::Observer;

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub instance_name: String,
    pub main_component: String,
    pub cleanup_quiescence: Duration,
    pub rpc_timeout: Duration,
    pub presence_tracking: bool,
    pub instance_info_refresh: Duration,
}

impl TransportOptions {
    pub fn new(instance_name: &str) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            main_component: "core".to_string(),
            cleanup_quiescence: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(2),
            presence_tracking: true,
            instance_info_refresh: Duration::from_secs(60),
        }
    }
}

/// Everything an instance needs to talk on the bus, sharing one client.
pub struct Transport {
    client: BusClient,
    presence: Presence,
    rpc: Rpc,
    components: ComponentChannel,
    metadata: Arc<MetadataChannel>,
    logger: Option<BusLogger>,
    instance_info: InstanceInfoPublisher,
}

impl Transport {
    /// `log_queue` is the queue fed by a `BusLogLayer`; when set, its records
    /// are published on `{instance}/logger`.
    pub fn new(
        options: TransportOptions,
        connector: &dyn Connector,
        log_queue: Option<LogQueue>,
    ) -> BusResult<Self> {
        let client_options = ClientOptions {
            cleanup_quiescence: options.cleanup_quiescence,
            ..ClientOptions::new(&options.instance_name)
        };
        let client = BusClient::new(client_options, connector)?;

        let metadata = Arc::new(MetadataChannel::new(client.clone()));
        let logger = log_queue.map(|queue| {
            let identity = LoggerIdentity {
                instance_name: options.instance_name.clone(),
                hostname: hostname(),
                pid: std::process::id(),
            };
            BusLogger::new(client.clone(), queue, identity)
        });

        let transport = Self {
            presence: Presence::new(client.clone(), options.presence_tracking),
            rpc: Rpc::new(client.clone(), options.rpc_timeout),
            components: ComponentChannel::new(client.clone()),
            instance_info: InstanceInfoPublisher::new(
                client.clone(),
                metadata.clone(),
                &options.main_component,
                options.instance_info_refresh,
            ),
            metadata,
            logger,
            client,
        };

        info!("Transport for '{}' created", options.instance_name);
        Ok(transport)
    }

    pub fn client(&self) -> &BusClient {
        &self.client
    }

    pub fn instance_name(&self) -> &str {
        self.client.instance_name()
    }

    pub fn online(&self) -> bool {
        self.client.online()
    }

    pub fn on_online_changed(&self) -> Observer<bool> {
        self.client.on_online_changed()
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn rpc(&self) -> &Rpc {
        &self.rpc
    }

    pub fn components(&self) -> &ComponentChannel {
        &self.components
    }

    pub fn metadata(&self) -> &MetadataChannel {
        &self.metadata
    }

    pub fn instance_info(&self) -> &InstanceInfoPublisher {
        &self.instance_info
    }

    /// Stops the sub-protocols, then the client.
    pub async fn terminate(&self) {
        let logger = async {
            if let Some(logger) = &self.logger {
                logger.terminate().await;
            }
        };

        tokio::join!(
            self.presence.terminate(),
            self.rpc.terminate(),
            self.instance_info.terminate(),
            logger,
        );

        self.client.terminate().await;
        info!("Transport terminated");
    }
}
