//! `instance-info` metadata entry describing this process.
//!
//! Published on every connect and on every update. Uptimes are refreshed by
//! a periodic update.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::client::BusClient;
use super::metadata::MetadataChannel;
use crate::observable::{Observer, Subject};

pub const METADATA_PATH: &str = "instance-info";
const PRODUCT_PREFIX: &str = "homebus-";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    #[serde(rename = "type")]
    pub instance_type: String,
    pub hardware: BTreeMap<String, String>,
    pub versions: BTreeMap<String, String>,
    pub system_uptime: u64,
    pub instance_uptime: u64,
    pub hostname: String,
    pub capabilities: Vec<String>,
}

/// Host name of the machine, from the kernel or the environment.
pub fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn system_uptime() -> u64 {
    std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|content| {
            content
                .split_whitespace()
                .next()
                .and_then(|secs| secs.parse::<f64>().ok())
        })
        .map(|secs| secs as u64)
        .unwrap_or(0)
}

struct InfoInner {
    info: Mutex<InstanceInfo>,
    started: Instant,
    updates: Subject<InstanceInfo>,
}

impl InfoInner {
    fn update(&self, callback: impl FnOnce(&mut InstanceInfo)) {
        let mut info = self.info.lock();
        callback(&mut info);
        info.system_uptime = system_uptime();
        info.instance_uptime = self.started.elapsed().as_secs();
        self.updates.notify(info.clone());
    }
}

pub struct InstanceInfoPublisher {
    inner: Arc<InfoInner>,
    cancel: CancellationToken,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl InstanceInfoPublisher {
    pub fn new(
        client: BusClient,
        metadata: Arc<MetadataChannel>,
        main_component: &str,
        refresh_interval: Duration,
    ) -> Self {
        let mut hardware = BTreeMap::new();
        hardware.insert("main".to_string(), std::env::consts::ARCH.to_string());

        let mut versions = BTreeMap::new();
        versions.insert(
            "os".to_string(),
            format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        );
        versions.insert(
            format!("{}common", PRODUCT_PREFIX),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        versions.insert(
            format!("{}{}", PRODUCT_PREFIX, main_component),
            env!("CARGO_PKG_VERSION").to_string(),
        );

        let started = Instant::now();
        let inner = Arc::new(InfoInner {
            info: Mutex::new(InstanceInfo {
                instance_type: main_component.to_string(),
                hardware,
                versions,
                system_uptime: system_uptime(),
                instance_uptime: 0,
                hostname: hostname(),
                capabilities: Vec::new(),
            }),
            started,
            updates: Subject::new(),
        });

        let cancel = CancellationToken::new();
        let online_rx = client.on_online_changed();
        let updates_rx = inner.updates.subscribe();
        let handle = tokio::spawn(publish_worker(
            client,
            metadata,
            inner.clone(),
            online_rx,
            updates_rx,
            refresh_interval,
            cancel.clone(),
        ));

        Self {
            inner,
            cancel,
            task_handle: Mutex::new(Some(handle)),
        }
    }

    pub fn get(&self) -> InstanceInfo {
        self.inner.info.lock().clone()
    }

    pub fn on_update(&self) -> Observer<InstanceInfo> {
        self.inner.updates.subscribe()
    }

    pub fn add_component_version(&self, component_name: &str, version: &str) {
        let version = if version.is_empty() { "<unknown>" } else { version };
        self.inner.update(|info| {
            info.versions
                .insert(format!("{}{}", PRODUCT_PREFIX, component_name), version.to_string());
        });
    }

    pub fn add_capability(&self, capability: &str) {
        self.inner.update(|info| {
            if !info.capabilities.iter().any(|c| c == capability) {
                info.capabilities.push(capability.to_string());
            }
        });
    }

    pub async fn terminate(&self) {
        self.cancel.cancel();
        let handle = self.task_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Instance info task failed: {}", e);
            }
        }
    }
}

async fn publish_worker(
    client: BusClient,
    metadata: Arc<MetadataChannel>,
    inner: Arc<InfoInner>,
    mut online_rx: Observer<bool>,
    mut updates_rx: Observer<InstanceInfo>,
    refresh_interval: Duration,
    cancel: CancellationToken,
) {
    let mut refresh = tokio::time::interval(refresh_interval);
    refresh.tick().await;

    if client.online() {
        let info = inner.info.lock().clone();
        publish(&metadata, &info);
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            online = online_rx.recv() => match online {
                Some(true) => {
                    let info = inner.info.lock().clone();
                    publish(&metadata, &info);
                }
                Some(false) => {}
                None => break,
            },
            info = updates_rx.recv() => match info {
                Some(info) => {
                    if client.online() {
                        publish(&metadata, &info);
                    }
                }
                None => break,
            },
            _ = refresh.tick() => inner.update(|_| {}),
        }
    }

    debug!("Instance info worker terminated");
}

fn publish(metadata: &MetadataChannel, info: &InstanceInfo) {
    if let Err(e) = metadata.set(METADATA_PATH, info) {
        warn!("Could not publish instance info: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_is_never_empty() {
        assert!(!hostname().is_empty());
    }

    #[test]
    fn wire_names() {
        let info = InstanceInfo {
            instance_type: "core".to_string(),
            hardware: BTreeMap::new(),
            versions: BTreeMap::new(),
            system_uptime: 1,
            instance_uptime: 2,
            hostname: "host".to_string(),
            capabilities: vec!["rpc".to_string()],
        };

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["type"], "core");
        assert_eq!(json["systemUptime"], 1);
        assert_eq!(json["instanceUptime"], 2);
        assert_eq!(json["capabilities"][0], "rpc");
    }
}
