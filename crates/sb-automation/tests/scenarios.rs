//! End-to-end pipeline scenarios driven through the automation handler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use sb_automation::executor::{ActionError, ActionExecutor};
use sb_automation::format::format_str;
use sb_automation::handler::AutomationHandler;
use sb_automation::rule::AutomationRule;
use sb_automation::runner::ActionRunner;
use sb_core::{
    AliasTable, AttrValue, BleAdvertisement, DeviceEntry, RawEvent, StateObject,
};
use sb_store::StateStore;

/// Records every execution, formatting an optional template against the
/// state it fired with.
struct Recorder {
    template: Option<String>,
    log: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl ActionExecutor for Recorder {
    fn kind(&self) -> &'static str {
        "recorder"
    }

    async fn execute(&self, state: &StateObject) -> Result<(), ActionError> {
        let text = self
            .template
            .as_deref()
            .map(|t| format_str(t, state))
            .unwrap_or_default();
        self.log.lock().unwrap().push((state.id().to_string(), text));
        Ok(())
    }
}

fn rule(yaml: &str) -> AutomationRule {
    serde_yaml::from_str(yaml).unwrap()
}

fn make_handler(
    rule_yaml: &str,
    template: Option<&str>,
    aliases: AliasTable,
) -> (AutomationHandler, Arc<Mutex<Vec<(String, String)>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let aliases = Arc::new(aliases);
    let runner = ActionRunner::with_executors(
        &rule(rule_yaml),
        0,
        &aliases,
        vec![Box::new(Recorder {
            template: template.map(str::to_string),
            log: log.clone(),
        })],
    )
    .unwrap();
    let handler =
        AutomationHandler::with_runners(vec![runner], Arc::new(StateStore::new()), aliases);
    (handler, log)
}

fn sensor(address: &str, model: &str, temp: f64) -> RawEvent {
    RawEvent::Ble(BleAdvertisement::new(
        address,
        -50,
        HashMap::from([
            ("modelName".to_string(), AttrValue::Str(model.to_string())),
            ("temperature".to_string(), AttrValue::Float(temp)),
        ]),
    ))
}

fn motion(address: &str, detected: bool) -> RawEvent {
    RawEvent::Ble(BleAdvertisement::new(
        address,
        -50,
        HashMap::from([("motion_detected".to_string(), AttrValue::Bool(detected))]),
    ))
}

fn contact(address: &str, open: bool) -> RawEvent {
    RawEvent::Ble(BleAdvertisement::new(
        address,
        -50,
        HashMap::from([("contact_open".to_string(), AttrValue::Bool(open))]),
    ))
}

fn button(address: &str, count: i64) -> RawEvent {
    RawEvent::Ble(BleAdvertisement::new(
        address,
        -50,
        HashMap::from([("button_count".to_string(), AttrValue::Int(count))]),
    ))
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

// Scenario A: rising-edge rule with cooldown.
#[tokio::test(start_paused = true)]
async fn rising_edge_with_cooldown() {
    let (handler, log) = make_handler(
        r#"
name: hot alert
cooldown: 10m
if:
  source: ble-event
  conditions:
    modelName: WoSensorTH
    temperature: "> 28.0"
then:
  - type: log
    message: unused
"#,
        Some("hot: {temperature}"),
        HashMap::new(),
    );

    let addr = "aa:aa:aa:aa:aa:aa";

    // t=0: below threshold
    handler.handle_event(sensor(addr, "WoSensorTH", 27.5));
    settle().await;
    assert!(log.lock().unwrap().is_empty());

    // t=1: crosses threshold, fires with the formatted payload
    tokio::time::sleep(Duration::from_secs(1)).await;
    handler.handle_event(sensor(addr, "WoSensorTH", 28.5));
    settle().await;
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[(addr.to_string(), "hot: 28.5".to_string())]
    );

    // t=2: still high, no re-fire
    tokio::time::sleep(Duration::from_secs(1)).await;
    handler.handle_event(sensor(addr, "WoSensorTH", 29.0));
    settle().await;
    assert_eq!(log.lock().unwrap().len(), 1);

    // t=3: goes low
    tokio::time::sleep(Duration::from_secs(1)).await;
    handler.handle_event(sensor(addr, "WoSensorTH", 27.0));
    settle().await;
    assert_eq!(log.lock().unwrap().len(), 1);

    // t=4: rising edge again, but 3s < 10m cooldown
    tokio::time::sleep(Duration::from_secs(1)).await;
    handler.handle_event(sensor(addr, "WoSensorTH", 30.0));
    settle().await;
    assert_eq!(log.lock().unwrap().len(), 1);

    handler.stop().await;
}

// Scenario B: duration-sustained rule.
#[tokio::test(start_paused = true)]
async fn duration_sustained() {
    let (handler, log) = make_handler(
        r#"
name: quiet room
if:
  source: ble-event
  duration: 5m
  conditions:
    motion_detected: false
then:
  - type: log
    message: unused
"#,
        Some("quiet"),
        HashMap::new(),
    );

    let addr = "bb:bb:bb:bb:bb:bb";

    // t=0: conditions true, timer armed
    handler.handle_event(motion(addr, false));
    settle().await;

    // t=120: still true, timer keeps running
    tokio::time::sleep(Duration::from_secs(120)).await;
    handler.handle_event(motion(addr, false));
    settle().await;

    // t=290: motion detected, timer cancelled before expiry
    tokio::time::sleep(Duration::from_secs(170)).await;
    handler.handle_event(motion(addr, true));
    settle().await;

    // t=300: quiet again, timer restarts
    tokio::time::sleep(Duration::from_secs(10)).await;
    handler.handle_event(motion(addr, false));
    settle().await;
    assert!(log.lock().unwrap().is_empty());

    // t=600: the timer armed at t=300 has expired; exactly one fire
    tokio::time::sleep(Duration::from_secs(300)).await;
    settle().await;
    handler.handle_event(motion(addr, false));
    settle().await;
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[(addr.to_string(), "quiet".to_string())]
    );

    handler.stop().await;
}

// Scenario C: cross-device condition through an alias.
#[tokio::test(start_paused = true)]
async fn cross_device_alias_condition() {
    let meter_addr = "aa:aa:aa:aa:aa:aa";
    let window_addr = "11:11:11:11:11:11";
    let aliases: AliasTable = HashMap::from([
        ("meter".to_string(), DeviceEntry::with_address(meter_addr)),
        ("window".to_string(), DeviceEntry::with_address(window_addr)),
    ]);

    let (handler, log) = make_handler(
        r#"
name: hot with window closed
if:
  source: ble-event
  device: meter
  conditions:
    temperature: "> 28.0"
    window.contact_open: false
then:
  - type: log
    message: unused
"#,
        Some("{temperature}"),
        aliases,
    );

    // t=0: preload the window state
    handler.handle_event(contact(window_addr, false));
    settle().await;
    assert!(log.lock().unwrap().is_empty());

    // t=1: meter reports hot, window closed in the snapshot: fires
    tokio::time::sleep(Duration::from_secs(1)).await;
    handler.handle_event(sensor(meter_addr, "WoSensorTH", 29.0));
    settle().await;
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[(meter_addr.to_string(), "29".to_string())]
    );

    // t=2: the window opens
    tokio::time::sleep(Duration::from_secs(1)).await;
    handler.handle_event(contact(window_addr, true));
    settle().await;

    // t=3: hot again, but the new snapshot shows the window open: no fire
    tokio::time::sleep(Duration::from_secs(1)).await;
    handler.handle_event(sensor(meter_addr, "WoSensorTH", 30.0));
    settle().await;
    assert_eq!(log.lock().unwrap().len(), 1);

    handler.stop().await;
}

// Scenario D: previous-state comparison.
#[tokio::test(start_paused = true)]
async fn previous_state_comparison() {
    let (handler, log) = make_handler(
        r#"
name: button changed
if:
  source: ble-event
  conditions:
    button_count: "!= {previous.button_count}"
then:
  - type: log
    message: unused
"#,
        Some("{button_count}"),
        HashMap::new(),
    );

    let addr = "cc:cc:cc:cc:cc:cc";

    // first event has no previous: condition false
    handler.handle_event(button(addr, 5));
    settle().await;
    assert!(log.lock().unwrap().is_empty());

    // 6 != 5: fires
    handler.handle_event(button(addr, 6));
    settle().await;
    assert_eq!(log.lock().unwrap().len(), 1);

    // 6 == 6: goes low
    handler.handle_event(button(addr, 6));
    settle().await;
    assert_eq!(log.lock().unwrap().len(), 1);

    // 7 != 6: fires again
    handler.handle_event(button(addr, 7));
    settle().await;
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[
            (addr.to_string(), "6".to_string()),
            (addr.to_string(), "7".to_string()),
        ]
    );

    handler.stop().await;
}

// Scenario E: first-seen per entity.
#[tokio::test(start_paused = true)]
async fn first_seen_per_entity() {
    let (handler, log) = make_handler(
        r#"
name: new device
if:
  source: ble-event
then:
  - type: log
    message: unused
"#,
        Some("{address} seen"),
        HashMap::new(),
    );

    let a = "aa:aa:aa:aa:aa:aa";
    let b = "bb:bb:bb:bb:bb:bb";

    handler.handle_event(sensor(a, "WoSensorTH", 20.0));
    settle().await;
    handler.handle_event(sensor(a, "WoSensorTH", 21.0));
    settle().await;
    handler.handle_event(sensor(b, "WoHand", 0.0));
    settle().await;

    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[
            (a.to_string(), format!("{} seen", a)),
            (b.to_string(), format!("{} seen", b)),
        ]
    );

    handler.stop().await;
}

// Invariant: runners observe the previous raw event for the same key.
#[tokio::test(start_paused = true)]
async fn previous_event_is_visible_to_runners() {
    let (handler, log) = make_handler(
        r#"
name: trace
if:
  source: ble-event
  conditions:
    temperature: "> 0"
then:
  - type: log
    message: unused
"#,
        Some("{previous.temperature}->{temperature}"),
        HashMap::new(),
    );

    let addr = "dd:dd:dd:dd:dd:dd";
    handler.handle_event(sensor(addr, "WoSensorTH", 20.0));
    settle().await;

    // drop to false so a second rising edge can record the transition
    handler.handle_event(sensor(addr, "WoSensorTH", -1.0));
    settle().await;
    handler.handle_event(sensor(addr, "WoSensorTH", 21.5));
    settle().await;

    let log = log.lock().unwrap();
    // first fire had no previous event
    assert_eq!(log[0].1, "->20");
    assert_eq!(log[1].1, "-1->21.5");
}
