mod common;

use bytes::Bytes;
use color_eyre::eyre::eyre;
use color_eyre::Report;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{options, wait_for, wait_online};
use homebus::bus::metadata::MetadataChange;
use homebus::bus::{MemoryBroker, RpcError, Transport};

#[tokio::test]
async fn resident_state_is_cleaned_on_connect() {
    let broker = MemoryBroker::new();
    broker.retain("alpha/metadata/stale", Bytes::from_static(b"1"));
    broker.retain("alpha/components/old/value", Bytes::from_static(&[1]));
    broker.retain("beta/metadata/kept", Bytes::from_static(b"1"));

    let alpha = Transport::new(options("alpha"), &broker, None).unwrap();
    wait_online(&alpha).await;

    assert!(broker.retained("alpha/metadata/stale").is_none());
    assert!(broker.retained("alpha/components/old/value").is_none());
    assert!(broker.retained("beta/metadata/kept").is_some());
    assert_eq!(broker.retained("alpha/online").as_deref(), Some(&[1u8][..]));

    alpha.terminate().await;
}

#[tokio::test]
async fn presence_follows_remote_instances() {
    let broker = MemoryBroker::new();
    let alpha = Transport::new(options("alpha"), &broker, None).unwrap();
    let beta = Transport::new(options("beta"), &broker, None).unwrap();

    wait_for("alpha sees beta", || alpha.presence().is_online("beta")).await;
    assert!(!alpha.presence().is_online("alpha"));

    let mut changes = alpha.presence().on_change();

    // repeated announcements are not transitions
    broker.retain("beta/online", vec![1u8]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(changes.try_recv().is_none());

    broker.drop_connection("beta");
    wait_for("beta offline", || !alpha.presence().is_online("beta")).await;

    let change = changes.recv().await.unwrap();
    assert_eq!(change.instance_name, "beta");
    assert!(!change.online);

    broker.restore_connection("beta");
    wait_for("beta back", || alpha.presence().is_online("beta")).await;
    assert_eq!(alpha.presence().online_instances(), vec!["beta".to_string()]);

    beta.terminate().await;
    alpha.terminate().await;
}

async fn pair(broker: &MemoryBroker) -> (Arc<Transport>, Arc<Transport>) {
    let alpha = Arc::new(Transport::new(options("alpha"), broker, None).unwrap());
    let beta = Arc::new(Transport::new(options("beta"), broker, None).unwrap());
    wait_online(&alpha).await;
    wait_online(&beta).await;
    (alpha, beta)
}

#[tokio::test]
async fn rpc_round_trip() {
    let broker = MemoryBroker::new();
    let (alpha, beta) = pair(&broker).await;

    beta.rpc()
        .serve("math.add", |(a, b): (i64, i64)| async move { Ok::<_, Report>(a + b) })
        .unwrap();
    beta.rpc()
        .serve("math.fail", |_: ()| async move {
            Err::<(), _>(eyre!("division by zero"))
        })
        .unwrap();

    let sum: i64 = alpha.rpc().call("beta", "math.add", (2, 3)).await.unwrap();
    assert_eq!(sum, 5);

    let failure = alpha.rpc().call::<_, ()>("beta", "math.fail", ()).await;
    assert!(matches!(failure, Err(RpcError::Remote(message)) if message == "division by zero"));

    assert!(matches!(
        beta.rpc().serve("math.add", |_: ()| async move { Ok::<_, Report>(()) }),
        Err(RpcError::DuplicateService(_))
    ));
    beta.rpc().unserve("math.add").unwrap();
    assert!(matches!(
        beta.rpc().unserve("math.add"),
        Err(RpcError::UnknownService(_))
    ));

    alpha.terminate().await;
    beta.terminate().await;
}

#[tokio::test]
async fn rpc_unknown_address_times_out() {
    let broker = MemoryBroker::new();
    let (alpha, beta) = pair(&broker).await;

    let result = alpha
        .rpc()
        .call_with_timeout::<_, ()>("beta", "nothing.here", (), Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(RpcError::Timeout(100))));

    alpha.terminate().await;
    beta.terminate().await;
}

#[tokio::test]
async fn rpc_fails_when_connection_is_lost() {
    let broker = MemoryBroker::new();
    let (alpha, beta) = pair(&broker).await;

    beta.rpc()
        .serve("slow.echo", |input: String| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok::<_, Report>(input)
        })
        .unwrap();

    let caller = alpha.clone();
    let call = tokio::spawn(async move {
        caller
            .rpc()
            .call_with_timeout::<_, String>("beta", "slow.echo", "hi", Duration::from_secs(3))
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.drop_connection("alpha");

    let result = call.await.unwrap();
    assert!(matches!(result, Err(RpcError::ConnectionLost)));

    // offline calls fail right away
    let result = alpha.rpc().call::<_, String>("beta", "slow.echo", "hi").await;
    assert!(matches!(result, Err(RpcError::ConnectionLost)));

    alpha.terminate().await;
    beta.terminate().await;
}

#[tokio::test]
async fn rpc_terminate_waits_for_running_handlers() {
    let broker = MemoryBroker::new();
    let (alpha, beta) = pair(&broker).await;

    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let (started_flag, finished_flag) = (started.clone(), finished.clone());
    beta.rpc()
        .serve("slow.double", move |input: i64| {
            let started = started_flag.clone();
            let finished = finished_flag.clone();
            async move {
                started.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                finished.store(true, Ordering::SeqCst);
                Ok::<_, Report>(input * 2)
            }
        })
        .unwrap();

    let caller = alpha.clone();
    let call = tokio::spawn(async move {
        caller
            .rpc()
            .call_with_timeout::<_, i64>("beta", "slow.double", 21, Duration::from_secs(2))
            .await
    });

    wait_for("handler started", || started.load(Ordering::SeqCst)).await;
    beta.rpc().terminate().await;
    assert!(finished.load(Ordering::SeqCst));

    // the reply went out before the client could be shut down
    assert_eq!(call.await.unwrap().unwrap(), 42);

    alpha.terminate().await;
    beta.terminate().await;
}

#[tokio::test]
async fn metadata_view_mirrors_remote_entries() {
    let broker = MemoryBroker::new();
    let (alpha, beta) = pair(&broker).await;

    beta.metadata().set("rooms/kitchen", &json!({"lights": 3})).unwrap();

    let view = alpha.metadata().create_view("beta").unwrap();
    assert!(alpha.metadata().create_view("beta").is_err());

    wait_for("kitchen entry", || view.get("rooms/kitchen").is_some()).await;
    assert_eq!(view.get("rooms/kitchen"), Some(json!({"lights": 3})));

    let mut changes = view.on_change();
    beta.metadata().clear("rooms/kitchen").unwrap();
    wait_for("kitchen cleared", || view.get("rooms/kitchen").is_none()).await;
    loop {
        match changes.recv().await {
            Some(MetadataChange::Clear { path }) if path == "rooms/kitchen" => break,
            Some(_) => {}
            None => panic!("view closed"),
        }
    }

    assert!(beta.metadata().set("bad/+", &1).is_err());

    view.close().await;
    assert!(alpha.metadata().create_view("beta").is_ok());

    alpha.terminate().await;
    beta.terminate().await;
}

#[tokio::test]
async fn instance_info_is_published() {
    let broker = MemoryBroker::new();
    let alpha = Transport::new(options("alpha"), &broker, None).unwrap();
    wait_online(&alpha).await;

    alpha.instance_info().add_capability("testing");
    wait_for("instance info", || {
        broker
            .retained("alpha/metadata/instance-info")
            .and_then(|payload| serde_json::from_slice::<serde_json::Value>(&payload).ok())
            .map(|info| info["capabilities"] == json!(["testing"]))
            .unwrap_or(false)
    })
    .await;

    alpha.terminate().await;
    assert!(broker.retained("alpha/metadata/instance-info").is_none());
}
