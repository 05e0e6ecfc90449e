//! End-to-end lifecycle scenarios through `ControllerHandle`, with every host service and
//! the broker replaced by in-process fakes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use pushlink::controller::command::Command;
use pushlink::controller::keepalive::KEEP_ALIVE_INTERVAL;
use pushlink::controller::{
    command_channel, Action, CommandSender, ControllerHandle, ControllerSettings, LinkState,
    ResultListener, Services, Status,
};
use pushlink::mqtt::{
    BrokerCallback, BrokerClient, BrokerError, BrokerEvent, ConnectRequest, ConnectionConfig,
    DeliveryToken, MqttMessage, Qos,
};
use pushlink::persistence::{LifecycleState, StatePortal};
use pushlink::platform::{
    Clock, Notifier, ProbeSettings, ReachabilityMonitor, TcpProbeMonitor, TimerId, TimerService,
};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Connect(String),
    Subscribe(String),
    Unsubscribe(String),
    Publish(String, Vec<u8>, Qos),
    Disconnect,
}

#[derive(Default)]
struct BrokerState {
    calls: Vec<Call>,
    connect_results: VecDeque<Result<(), BrokerError>>,
    connected: bool,
    callback: Option<BrokerCallback>,
    next_token: u64,
}

#[derive(Clone, Default)]
struct FakeBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    fn fail_next_connect(&self, error: BrokerError) {
        self.inner.lock().unwrap().connect_results.push_back(Err(error));
    }

    fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    fn connects(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Connect(_)))
            .count()
    }

    fn emit(&self, event: BrokerEvent) {
        let callback = self.inner.lock().unwrap().callback.clone();
        if let Some(callback) = callback {
            if matches!(event, BrokerEvent::ConnectionLost(_)) {
                self.inner.lock().unwrap().connected = false;
            }
            callback(event);
        }
    }
}

#[async_trait::async_trait]
impl BrokerClient for FakeBroker {
    async fn connect(
        &mut self,
        request: ConnectRequest,
        callback: BrokerCallback,
    ) -> Result<(), BrokerError> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(Call::Connect(request.url.clone()));
        let result = state.connect_results.pop_front().unwrap_or(Ok(()));
        state.connected = result.is_ok();
        if result.is_ok() {
            state.callback = Some(callback);
        }
        result
    }

    async fn subscribe(&mut self, topic: &str, _qos: Qos) -> Result<(), BrokerError> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(Call::Subscribe(topic.to_string()));
        if state.connected {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .push(Call::Unsubscribe(topic.to_string()));
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        _retain: bool,
    ) -> Result<DeliveryToken, BrokerError> {
        let mut state = self.inner.lock().unwrap();
        state
            .calls
            .push(Call::Publish(topic.to_string(), payload, qos));
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        state.next_token += 1;
        Ok(DeliveryToken(state.next_token))
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(Call::Disconnect);
        let was_connected = std::mem::replace(&mut state.connected, false);
        state.callback = None;
        if was_connected {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }
}

#[derive(Clone, Default)]
struct ManualTimers {
    armed: Arc<Mutex<HashMap<TimerId, (Duration, Command)>>>,
}

impl ManualTimers {
    fn delay(&self, id: TimerId) -> Option<Duration> {
        self.armed.lock().unwrap().get(&id).map(|(d, _)| *d)
    }
}

impl TimerService for ManualTimers {
    fn schedule_once(&mut self, id: TimerId, delay: Duration, command: Command) {
        self.armed.lock().unwrap().insert(id, (delay, command));
    }
    fn schedule_repeating(&mut self, id: TimerId, period: Duration, command: Command) {
        self.armed.lock().unwrap().insert(id, (period, command));
    }
    fn cancel(&mut self, id: TimerId) {
        self.armed.lock().unwrap().remove(&id);
    }
    fn is_scheduled(&self, id: TimerId) -> bool {
        self.armed.lock().unwrap().contains_key(&id)
    }
}

#[derive(Clone)]
struct FakeReachability {
    reachable: Arc<AtomicBool>,
}

impl ReachabilityMonitor for FakeReachability {
    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
    fn observe(&mut self) {}
    fn unobserve(&mut self) {}
}

type Results = Arc<Mutex<Vec<(Action, Status)>>>;

#[derive(Clone, Default)]
struct RecordingListener {
    results: Results,
}

impl ResultListener for RecordingListener {
    fn on_result(&self, action: Action, status: Status, _message: Option<&str>) {
        self.results.lock().unwrap().push((action, status));
    }
}

#[derive(Clone, Default)]
struct RecordingNotifier {
    seen: Arc<Mutex<Vec<String>>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &MqttMessage) {
        self.seen.lock().unwrap().push(message.text());
    }
}

struct FixedClock(DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

struct Rig {
    handle: ControllerHandle,
    broker: FakeBroker,
    store: StatePortal,
    timers: ManualTimers,
    results: Results,
    notified: Arc<Mutex<Vec<String>>>,
}

fn configured_store() -> StatePortal {
    let store = StatePortal::in_memory();
    ConnectionConfig::new("broker.local", "dev1")
        .with_topic("news")
        .save(&store)
        .unwrap();
    store
}

fn spawn(store: StatePortal, broker: FakeBroker) -> Rig {
    spawn_with(store, broker, |_| {
        Box::new(FakeReachability {
            reachable: Arc::new(AtomicBool::new(true)),
        })
    })
}

fn spawn_with(
    store: StatePortal,
    broker: FakeBroker,
    reachability: impl FnOnce(CommandSender) -> Box<dyn ReachabilityMonitor>,
) -> Rig {
    let timers = ManualTimers::default();
    let listener = RecordingListener::default();
    let notifier = RecordingNotifier::default();
    let (sender, inbox) = command_channel();

    let services = Services {
        store: Arc::new(store.clone()),
        timers: Box::new(timers.clone()),
        reachability: reachability(sender.clone()),
        listener: Box::new(listener.clone()),
        notifier: Box::new(notifier.clone()),
        clock: Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )),
    };

    let handle = ControllerHandle::spawn(
        sender,
        inbox,
        services,
        Box::new(broker.clone()),
        ControllerSettings::default(),
    );

    Rig {
        handle,
        broker,
        store,
        timers,
        results: listener.results,
        notified: notifier.seen,
    }
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn wait_for_state(rig: &Rig, state: LinkState) {
    let mut watch = rig.handle.watch_state();
    tokio::time::timeout(Duration::from_secs(2), watch.wait_for(|s| *s == state))
        .await
        .expect("state change timed out")
        .expect("controller stopped");
}

#[tokio::test]
async fn start_connects_subscribes_and_arms_keepalive() {
    let rig = spawn(configured_store(), FakeBroker::default());
    rig.handle.start().unwrap();
    wait_for_state(&rig, LinkState::Connected).await;

    assert_eq!(
        rig.broker.calls(),
        vec![
            Call::Connect("tcp://broker.local:1883".into()),
            Call::Subscribe("news".into()),
        ]
    );
    assert!(LifecycleState::was_started(&rig.store).unwrap());
    assert_eq!(rig.timers.delay(TimerId::Keepalive), Some(KEEP_ALIVE_INTERVAL));
    assert_eq!(
        *rig.results.lock().unwrap(),
        vec![(Action::Start, Status::Success)]
    );
}

#[tokio::test]
async fn failed_connect_backs_off() {
    let broker = FakeBroker::default();
    broker.fail_next_connect(BrokerError::Network("connection refused".into()));
    let rig = spawn(configured_store(), broker);

    rig.handle.start().unwrap();
    wait_for_state(&rig, LinkState::AwaitingRetry).await;

    assert_eq!(rig.timers.delay(TimerId::Retry), Some(Duration::from_secs(40)));
    assert_eq!(
        LifecycleState::last_retry_interval(&rig.store).unwrap(),
        Duration::from_millis(40_000)
    );
    assert_eq!(
        *rig.results.lock().unwrap(),
        vec![(Action::Start, Status::Code(32103))]
    );

    rig.handle.sender().send(Command::RetryTick).unwrap();
    wait_for_state(&rig, LinkState::Connected).await;
    assert_eq!(rig.broker.connects(), 2);
    assert!(rig.timers.delay(TimerId::Retry).is_none());
}

#[tokio::test]
async fn stop_disconnects_and_clears_intent() {
    let rig = spawn(configured_store(), FakeBroker::default());
    rig.handle.start().unwrap();
    wait_for_state(&rig, LinkState::Connected).await;

    rig.handle.stop().unwrap();
    wait_for_state(&rig, LinkState::Idle).await;

    let calls = rig.broker.calls();
    assert_eq!(
        &calls[2..],
        &[Call::Unsubscribe("news".into()), Call::Disconnect]
    );
    assert!(!LifecycleState::was_started(&rig.store).unwrap());
    assert!(rig.timers.armed.lock().unwrap().is_empty());
    assert_eq!(
        rig.results.lock().unwrap().last(),
        Some(&(Action::Stop, Status::Success))
    );
}

#[tokio::test]
async fn restart_with_intent_reconnects_on_its_own() {
    let store = configured_store();
    LifecycleState::set_started(&store, true).unwrap();

    let rig = spawn(store, FakeBroker::default());
    wait_for_state(&rig, LinkState::Connected).await;

    assert_eq!(rig.broker.connects(), 1);
    assert_eq!(rig.timers.armed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn lost_connection_reconnects_immediately() {
    let rig = spawn(configured_store(), FakeBroker::default());
    rig.handle.start().unwrap();
    wait_for_state(&rig, LinkState::Connected).await;

    rig.broker
        .emit(BrokerEvent::ConnectionLost("reset by peer".into()));
    let broker = rig.broker.clone();
    eventually("reconnect", || broker.connects() == 2).await;
    wait_for_state(&rig, LinkState::Connected).await;
}

#[tokio::test]
async fn keepalive_and_messages_flow_through() {
    let rig = spawn(configured_store(), FakeBroker::default());
    rig.handle.start().unwrap();
    wait_for_state(&rig, LinkState::Connected).await;

    rig.handle.sender().send(Command::KeepaliveTick).unwrap();
    let broker = rig.broker.clone();
    eventually("keepalive publish", || {
        broker.calls().contains(&Call::Publish(
            "/users/dev1/keepalive".into(),
            vec![0],
            Qos::AtMostOnce,
        ))
    })
    .await;

    rig.broker.emit(BrokerEvent::MessageArrived(MqttMessage::from_topic(
        "news",
        b"hello".to_vec(),
        Qos::AtLeastOnce,
    )));
    let notified = rig.notified.clone();
    eventually("notification", || {
        notified.lock().unwrap().as_slice() == ["hello".to_string()]
    })
    .await;

    rig.handle.publish("news", "hi").unwrap();
    eventually("user publish", || {
        broker
            .calls()
            .contains(&Call::Publish("news".into(), b"hi".to_vec(), Qos::AtLeastOnce))
    })
    .await;
}

#[tokio::test]
async fn shutdown_keeps_intent_and_closes_session() {
    let rig = spawn(configured_store(), FakeBroker::default());
    rig.handle.start().unwrap();
    wait_for_state(&rig, LinkState::Connected).await;

    rig.handle.shutdown(Duration::from_secs(2)).await.unwrap();

    assert!(LifecycleState::was_started(&rig.store).unwrap());
    assert_eq!(rig.broker.calls().last(), Some(&Call::Disconnect));
    assert!(!rig.broker.is_connected());
}

#[tokio::test]
async fn reconfigured_broker_is_what_reachability_probes() {
    // The stored broker is down; the newly configured one listens.
    let old = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let old_address = old.local_addr().unwrap().to_string();
    drop(old);
    let live = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let live_port = live.local_addr().unwrap().port();

    let rig = spawn_with(configured_store(), FakeBroker::default(), |sender| {
        Box::new(TcpProbeMonitor::spawn(
            ProbeSettings {
                address: old_address,
                interval: Duration::from_millis(20),
                timeout: Duration::from_millis(200),
                follow_broker: true,
            },
            sender,
        ))
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    rig.handle
        .configure(
            ConnectionConfig::new("127.0.0.1", "dev1")
                .with_port(live_port)
                .with_topic("news"),
        )
        .unwrap();
    rig.handle.start().unwrap();
    wait_for_state(&rig, LinkState::Connected).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(rig.handle.state(), LinkState::Connected);
    assert_eq!(
        rig.broker.calls(),
        vec![
            Call::Connect(format!("tcp://127.0.0.1:{}", live_port)),
            Call::Subscribe("news".into()),
        ]
    );
}

#[tokio::test]
async fn stop_while_connecting_reports_start_then_stop() {
    let broker = FakeBroker::default();
    broker.fail_next_connect(BrokerError::Network("connection refused".into()));
    let rig = spawn(configured_store(), broker);

    rig.handle.start().unwrap();
    rig.handle.stop().unwrap();
    wait_for_state(&rig, LinkState::Idle).await;
    let results = rig.results.clone();
    eventually("stop result", || results.lock().unwrap().len() == 2).await;

    assert_eq!(
        *rig.results.lock().unwrap(),
        vec![
            (Action::Start, Status::Code(32102)),
            (Action::Stop, Status::Success),
        ]
    );
}
