mod common;

use parking_lot::Mutex;
use std::sync::Arc;

use common::wait_for;
use homebus::components::{Component, Registry, LOCAL_INSTANCE};
use homebus::manager::{Binding, BindingConfig};
use homebus::metadata::{PluginDescriptor, PluginUsage, Value, ValueType};

fn switch_plugin() -> Arc<PluginDescriptor> {
    Arc::new(
        PluginDescriptor::new("test", "switch", "1.0.0", PluginUsage::Sensor)
            .with_state("value", ValueType::Bool),
    )
}

fn lamp_plugin() -> Arc<PluginDescriptor> {
    Arc::new(
        PluginDescriptor::new("test", "lamp", "1.0.0", PluginUsage::Actuator)
            .with_state("on", ValueType::Bool)
            .with_action("setOn", ValueType::Bool),
    )
}

fn dimmer_plugin() -> Arc<PluginDescriptor> {
    Arc::new(
        PluginDescriptor::new("test", "dimmer", "1.0.0", PluginUsage::Actuator)
            .with_action("setLevel", ValueType::range(0, 100).unwrap()),
    )
}

fn switch(id: &str) -> Arc<Component> {
    Arc::new(Component::builder(id, switch_plugin()).build().unwrap())
}

fn recording(id: &str, plugin: Arc<PluginDescriptor>) -> (Arc<Component>, Arc<Mutex<Vec<Value>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let component = Component::builder(id, plugin)
        .on_any_action(move |_, value| sink.lock().push(value))
        .build()
        .unwrap();
    (Arc::new(component), received)
}

#[tokio::test]
async fn forwards_state_while_both_ends_exist() {
    let registry = Arc::new(Registry::new());
    let binding = Binding::new(
        registry.clone(),
        BindingConfig::new("switch", "value", "lamp", "setOn"),
    );

    let source = switch("switch");
    source.set_state("value", Value::Bool(true)).unwrap();
    registry.add_component(LOCAL_INSTANCE, source.clone()).unwrap();
    tokio::task::yield_now().await;
    assert!(!binding.is_active());

    let (lamp, received) = recording("lamp", lamp_plugin());
    registry.add_component("remote", lamp.clone()).unwrap();
    wait_for("binding active", || binding.is_active()).await;

    // the current value goes out on activation
    wait_for("initial value", || received.lock().len() == 1).await;
    assert_eq!(received.lock()[0], Value::Bool(true));

    source.set_state("value", Value::Bool(false)).unwrap();
    wait_for("second value", || received.lock().len() == 2).await;
    assert_eq!(received.lock()[1], Value::Bool(false));

    registry.remove_component("remote", &lamp).unwrap();
    wait_for("binding inactive", || !binding.is_active()).await;

    source.set_state("value", Value::Bool(true)).unwrap();
    tokio::task::yield_now().await;
    assert_eq!(received.lock().len(), 2);

    binding.terminate().await;
}

#[tokio::test]
async fn reports_validation_errors() {
    let registry = Arc::new(Registry::new());
    registry.add_component(LOCAL_INSTANCE, switch("switch")).unwrap();
    let (dimmer, received) = recording("dimmer", dimmer_plugin());
    registry.add_component(LOCAL_INSTANCE, dimmer).unwrap();

    let mismatch = Binding::new(
        registry.clone(),
        BindingConfig::new("switch", "value", "dimmer", "setLevel"),
    );
    wait_for("type mismatch", || !mismatch.errors().is_empty()).await;
    assert!(!mismatch.is_active());
    assert!(mismatch.errors()[0].contains("which is different from type"));

    let missing = Binding::new(
        registry.clone(),
        BindingConfig::new("switch", "level", "dimmer", "setValue"),
    );
    wait_for("missing members", || missing.errors().len() == 2).await;
    assert!(missing.errors()[0].starts_with("State 'level' does not exist"));
    assert!(missing.errors()[1].starts_with("Action 'setValue' does not exist"));

    assert!(received.lock().is_empty());

    mismatch.terminate().await;
    missing.terminate().await;
}

#[tokio::test]
async fn rebinds_to_a_replacement_component() {
    let registry = Arc::new(Registry::new());
    let binding = Binding::new(
        registry.clone(),
        BindingConfig::new("switch", "value", "lamp", "setOn"),
    );

    let source = switch("switch");
    registry.add_component(LOCAL_INSTANCE, source.clone()).unwrap();

    let (first, first_received) = recording("lamp", lamp_plugin());
    registry.add_component(LOCAL_INSTANCE, first.clone()).unwrap();
    wait_for("binding active", || binding.is_active()).await;

    registry.remove_component(LOCAL_INSTANCE, &first).unwrap();
    wait_for("binding inactive", || !binding.is_active()).await;

    let (second, second_received) = recording("lamp", lamp_plugin());
    registry.add_component("remote", second).unwrap();
    wait_for("binding active again", || binding.is_active()).await;

    source.set_state("value", Value::Bool(true)).unwrap();
    wait_for("value on replacement", || second_received.lock().len() == 1).await;
    assert!(first_received.lock().is_empty());

    binding.terminate().await;
    assert!(!binding.is_active());
}

#[tokio::test]
async fn recovers_once_a_compatible_target_appears() {
    let registry = Arc::new(Registry::new());
    let binding = Binding::new(
        registry.clone(),
        BindingConfig::new("switch", "value", "lamp", "setOn"),
    );

    let source = switch("switch");
    source.set_state("value", Value::Bool(true)).unwrap();
    registry.add_component(LOCAL_INSTANCE, source.clone()).unwrap();

    let ranged_lamp = Arc::new(
        PluginDescriptor::new("test", "ranged-lamp", "1.0.0", PluginUsage::Actuator)
            .with_action("setOn", ValueType::range(0, 1).unwrap()),
    );
    let (wrong, wrong_received) = recording("lamp", ranged_lamp);
    registry.add_component(LOCAL_INSTANCE, wrong.clone()).unwrap();

    wait_for("type mismatch", || !binding.errors().is_empty()).await;
    assert!(!binding.is_active());

    source.set_state("value", Value::Bool(false)).unwrap();
    tokio::task::yield_now().await;
    assert!(wrong_received.lock().is_empty());

    registry.remove_component(LOCAL_INSTANCE, &wrong).unwrap();
    let (lamp, received) = recording("lamp", lamp_plugin());
    registry.add_component(LOCAL_INSTANCE, lamp).unwrap();

    wait_for("binding active", || binding.is_active()).await;
    assert!(binding.errors().is_empty());
    wait_for("current value", || received.lock().len() == 1).await;
    assert_eq!(received.lock()[0], Value::Bool(false));

    source.set_state("value", Value::Bool(true)).unwrap();
    wait_for("change forwarded", || received.lock().len() == 2).await;
    assert_eq!(received.lock()[1], Value::Bool(true));
    assert!(wrong_received.lock().is_empty());

    binding.terminate().await;
}
