//! Connection lifecycle controller.
//!
//! A plain state machine driven one [`Input`] at a time by the actor in
//! [`controller_handle`](super::controller_handle). Network calls are handed to the
//! network worker as [`NetJob`]s and their results come back as [`JobOutcome`]s, so no
//! method here blocks on I/O.
//!
//! ```text
//!            start                 connected
//!   Idle ───────────► Connecting ───────────► Connected
//!    ▲                 │      ▲                 │
//!    │ stop            │fail  │retry / online   │ lost / offline
//!    │                 ▼      │                 │
//!    └─────────────  AwaitingRetry ◄────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::backoff::BackoffPolicy;
use super::command::{Command, Input};
use super::keepalive::{
    keepalive_topic, KeepaliveScheduler, KEEP_ALIVE_PAYLOAD, KEEP_ALIVE_QOS, KEEP_ALIVE_RETAIN,
};
use super::listener::{Action, ResultListener, Status};
use super::net_worker::{DisconnectReason, JobOutcome, JobSender, NetJob, PublishPurpose};
use super::state::{LinkState, RuntimeState, SessionHandle};
use crate::mqtt::error::codes;
use crate::mqtt::{BrokerError, BrokerEvent, ConnectRequest, ConnectionConfig, Qos};
use crate::persistence::{keys, LifecycleState, StateStore};
use crate::platform::{Clock, Notifier, ReachabilityMonitor, TimerId, TimerService};

/// Host services the controller talks to.
pub struct Services {
    pub store: Arc<dyn StateStore>,
    pub timers: Box<dyn TimerService>,
    pub reachability: Box<dyn ReachabilityMonitor>,
    pub listener: Box<dyn ResultListener>,
    pub notifier: Box<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone, Debug)]
pub struct ControllerSettings {
    pub backoff: BackoffPolicy,
    pub keepalive: KeepaliveScheduler,
    /// Base directory for durable session stores. `None` keeps sessions in memory.
    pub session_dir: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            keepalive: KeepaliveScheduler::default(),
            session_dir: None,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Controller {
    state: LinkState,
    runtime: RuntimeState,
    settings: ControllerSettings,
    services: Services,
    jobs: JobSender,
}

impl Controller {
    pub fn new(services: Services, jobs: JobSender, settings: ControllerSettings) -> Self {
        let runtime = RuntimeState::new(services.clock.now());
        Self {
            state: LinkState::Idle,
            runtime,
            settings,
            services,
            jobs,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn runtime(&self) -> &RuntimeState {
        &self.runtime
    }

    /// Resumes a connection the previous process had open. Runs once, before any other input.
    pub fn recover_from_restart(&mut self) {
        if !self.was_started() {
            debug!("No connection to recover");
            return;
        }

        info!("Previous process was connected, recovering");
        if self.settings.keepalive.has_schedule(&*self.services.timers) {
            self.settings.keepalive.stop(&mut *self.services.timers);
        }
        self.start();
    }

    pub fn handle(&mut self, input: Input) {
        match input {
            Input::Command(command) => self.handle_command(command),
            Input::Broker { attempt, event } => self.handle_broker_event(attempt, event),
            Input::Job(outcome) => self.handle_job(outcome),
        }
    }

    fn handle_command(&mut self, command: Command) {
        if self.runtime.stopping && command != Command::Stop {
            debug!("Ignoring {} while stopping", command.name());
            return;
        }

        match command {
            Command::Start => self.start(),
            Command::Stop => self.stop(),
            Command::Subscribe(topic) => self.subscribe(topic),
            Command::Publish { topic, payload } => self.publish(topic, payload),
            Command::KeepaliveTick => self.on_keepalive_timer(),
            Command::RetryTick => self.on_retry_timer(),
            Command::ReachabilityChanged(reachable) => self.on_reachability_changed(reachable),
            Command::Configure(config) => self.configure(config),
        }
    }

    // ---- user requests ----

    fn start(&mut self) {
        if self.state != LinkState::Idle {
            info!("Start requested while {}, nothing to do", self.state);
            return;
        }

        if self.settings.keepalive.has_schedule(&*self.services.timers) {
            debug!("Cancelling leftover keepalive schedule");
            self.settings.keepalive.stop(&mut *self.services.timers);
        }

        self.runtime.pending_report = true;
        self.connect_attempt(false);
        if self.state.is_active() {
            self.services.reachability.observe();
        }
    }

    fn stop(&mut self) {
        if self.runtime.stopping {
            info!("Stop already in progress");
            return;
        }
        if self.state == LinkState::Idle {
            info!("Stop requested while idle, nothing to do");
            return;
        }

        info!("Stopping connection ({})", self.state);
        if self.state == LinkState::Connecting {
            self.report(
                Action::Start,
                Status::Code(codes::DISCONNECTING),
                Some("stopped before the connection was established"),
            );
        }
        self.runtime.pending_report = true;

        // A connect still running on the worker has to be closed too.
        if self.runtime.has_session() || self.state == LinkState::Connecting {
            if self.runtime.has_session() {
                if let Some(topic) = self.runtime.subscribed_topic.clone() {
                    self.submit(NetJob::Unsubscribe { topic });
                }
            }
            if self.submit(NetJob::Disconnect {
                reason: DisconnectReason::Stop,
            }) {
                self.runtime.stopping = true;
                return;
            }
        }

        self.finish_stop();
    }

    fn finish_stop(&mut self) {
        self.runtime.stopping = false;
        self.runtime.session = None;
        self.runtime.subscribed_topic = None;
        self.settings.keepalive.stop(&mut *self.services.timers);
        self.services.timers.cancel(TimerId::Retry);
        self.services.reachability.unobserve();
        self.persist_started(false);
        self.set_state(LinkState::Idle);
        self.report(Action::Stop, Status::Success, None);
    }

    fn subscribe(&mut self, topic: String) {
        if !self.is_connected() {
            warn!("Not connected, cannot subscribe to {}", topic);
            return;
        }
        self.submit(NetJob::Subscribe { topic });
    }

    fn publish(&mut self, topic: String, payload: Vec<u8>) {
        if !self.is_connected() {
            warn!("Not connected, cannot publish to {}", topic);
            return;
        }
        self.submit(NetJob::Publish {
            topic,
            payload,
            qos: Qos::AtLeastOnce,
            retain: false,
            purpose: PublishPurpose::User,
        });
    }

    fn configure(&mut self, config: ConnectionConfig) {
        if self.state != LinkState::Idle {
            warn!(
                "Connection settings are locked while {}, stop first",
                self.state
            );
            return;
        }

        match config.save(&*self.services.store) {
            Ok(()) => {
                info!("Saved connection settings for {}", config.broker_url());
                self.services.reachability.retarget(&config.endpoint());
            }
            Err(e) => error!("Failed to save connection settings: {}", e),
        }
        self.runtime.keepalive_topic = None;
    }

    // ---- connection attempts ----

    /// Opens a new session on the worker.
    ///
    /// `continue_streak` keeps `session_started_at` from the session that was just lost,
    /// so a quick failure after a long-lived session resets the backoff.
    fn connect_attempt(&mut self, continue_streak: bool) {
        let config = match ConnectionConfig::load(&*self.services.store) {
            Ok(config) => config,
            Err(e) => {
                let error = BrokerError::Config(e.to_string());
                error!("Cannot connect: {}", error);
                self.services.timers.cancel(TimerId::Retry);
                self.services.reachability.unobserve();
                self.set_state(LinkState::Idle);
                self.report(
                    Action::Start,
                    Status::Code(error.code()),
                    Some(&error.to_string()),
                );
                return;
            }
        };

        self.services.reachability.retarget(&config.endpoint());
        let attempt = self.runtime.next_attempt();
        if !continue_streak {
            self.runtime.session_started_at = self.services.clock.now();
        }

        let request = ConnectRequest::from_config(&config, self.settings.session_dir.clone());
        info!("Connect attempt {} to {}", attempt, request.url);

        self.set_state(LinkState::Connecting);
        let queued = self.submit(NetJob::Connect {
            attempt,
            request,
            topic: config.topic.clone(),
        });
        if !queued {
            self.on_connect_failed(
                attempt,
                BrokerError::Client("network worker is not running".into()),
            );
        }
    }

    fn on_connected(&mut self, attempt: u64, subscribed: Option<String>) {
        if self.runtime.stopping {
            debug!("Attempt {} connected during stop, disconnect is queued", attempt);
            return;
        }
        if attempt != self.runtime.attempt || self.state != LinkState::Connecting {
            // The worker's next connect replaces that session.
            info!("Ignoring stale connect result from attempt {}", attempt);
            return;
        }

        let now = self.services.clock.now();
        self.runtime.session = Some(SessionHandle {
            attempt,
            connected_at: now,
        });
        self.runtime.session_started_at = now;
        self.runtime.subscribed_topic = subscribed;

        self.persist_started(true);
        self.settings.keepalive.start(&mut *self.services.timers);
        self.set_state(LinkState::Connected);
        info!("Connected, keepalives started");
        self.report(Action::Start, Status::Success, None);
    }

    fn on_connect_failed(&mut self, attempt: u64, error: BrokerError) {
        if self.runtime.stopping {
            debug!("Attempt {} failed during stop: {}", attempt, error);
            return;
        }
        if attempt != self.runtime.attempt || self.state != LinkState::Connecting {
            debug!("Ignoring stale failure from attempt {}: {}", attempt, error);
            return;
        }

        warn!("Connect attempt {} failed: {}", attempt, error);
        self.set_state(LinkState::AwaitingRetry);
        if self.services.reachability.is_reachable() {
            self.schedule_retry();
        } else {
            info!("Network unreachable, waiting for it to come back");
        }
        self.report(
            Action::Start,
            Status::Code(error.code()),
            Some(&error.to_string()),
        );
    }

    fn schedule_retry(&mut self) {
        let store = &*self.services.store;
        let previous = LifecycleState::last_retry_interval(store).unwrap_or_else(|e| {
            warn!("Could not read retry interval: {}", e);
            self.settings.backoff.initial
        });
        let elapsed = (self.services.clock.now() - self.runtime.session_started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);

        let interval = self.settings.backoff.next_interval(previous, elapsed);
        if let Err(e) = LifecycleState::set_retry_interval(store, interval) {
            warn!("Could not persist retry interval: {}", e);
        }

        info!("Rescheduling connection in {}ms", interval.as_millis());
        self.services.timers.cancel(TimerId::Retry);
        self.services
            .timers
            .schedule_once(TimerId::Retry, interval, Command::RetryTick);
    }

    fn on_connection_lost(&mut self, reason: &str) {
        info!("Connection lost: {}", reason);
        self.settings.keepalive.stop(&mut *self.services.timers);
        let had_session = self.runtime.session.take().is_some();
        self.set_state(LinkState::AwaitingRetry);

        if self.services.reachability.is_reachable() {
            self.services.timers.cancel(TimerId::Retry);
            self.connect_attempt(had_session);
        } else {
            info!("Network unreachable, waiting for it to come back");
        }
    }

    // ---- timers and reachability ----

    fn on_retry_timer(&mut self) {
        if self.state != LinkState::AwaitingRetry {
            debug!("Retry timer fired while {}, ignoring", self.state);
            return;
        }
        if !self.services.reachability.is_reachable() {
            info!("Retry timer fired but the network is unreachable");
            return;
        }
        self.connect_attempt(false);
    }

    fn on_keepalive_timer(&mut self) {
        match self.state {
            LinkState::Connected if self.runtime.has_session() => self.send_keepalive(),
            LinkState::Connected | LinkState::AwaitingRetry => {
                warn!("Keepalive fired without a live session while {}", self.state);
                self.on_connection_lost("keepalive fired without a session");
            }
            LinkState::Connecting | LinkState::Idle => {
                warn!("Keepalive fired while {}, cancelling it", self.state);
                self.settings.keepalive.stop(&mut *self.services.timers);
            }
        }
    }

    fn send_keepalive(&mut self) {
        let Some(topic) = self.keepalive_topic() else {
            warn!("No client id stored, cannot send keepalive");
            return;
        };

        debug!("Sending keepalive to {}", topic);
        self.submit(NetJob::Publish {
            topic,
            payload: KEEP_ALIVE_PAYLOAD.to_vec(),
            qos: KEEP_ALIVE_QOS,
            retain: KEEP_ALIVE_RETAIN,
            purpose: PublishPurpose::Keepalive,
        });
    }

    fn on_reachability_changed(&mut self, reachable: bool) {
        info!("Reachability changed: reachable={}", reachable);

        if reachable {
            match self.state {
                LinkState::AwaitingRetry => {
                    self.services.timers.cancel(TimerId::Retry);
                    self.connect_attempt(false);
                }
                LinkState::Idle if self.was_started() => self.start(),
                _ => debug!("Nothing to do while {}", self.state),
            }
            return;
        }

        if !self.runtime.has_session() {
            return;
        }

        info!("Network gone, dropping session");
        self.submit(NetJob::Disconnect {
            reason: DisconnectReason::Unreachable,
        });
        self.services.timers.cancel(TimerId::Retry);
        self.settings.keepalive.stop(&mut *self.services.timers);
        self.runtime.session = None;
        self.set_state(LinkState::AwaitingRetry);
    }

    // ---- broker callbacks and job results ----

    fn handle_broker_event(&mut self, attempt: u64, event: BrokerEvent) {
        match event {
            BrokerEvent::ConnectionLost(reason) => {
                let current = self.runtime.session.map(|s| s.attempt);
                if self.runtime.stopping
                    || self.state != LinkState::Connected
                    || current != Some(attempt)
                {
                    debug!("Ignoring connection loss of old session {}", attempt);
                    return;
                }
                self.on_connection_lost(&reason);
            }
            BrokerEvent::MessageArrived(message) => self.services.notifier.notify(&message),
            BrokerEvent::DeliveryComplete(token) => debug!("Delivery {} complete", token),
        }
    }

    fn handle_job(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Connected {
                attempt,
                subscribed,
            } => self.on_connected(attempt, subscribed),
            JobOutcome::ConnectFailed { attempt, error } => self.on_connect_failed(attempt, error),
            JobOutcome::Subscribed { topic, result } => match result {
                Ok(()) => {
                    info!("Subscribed to {}", topic);
                    self.runtime.subscribed_topic = Some(topic);
                }
                Err(e) => self.on_request_failed("subscribe", e),
            },
            JobOutcome::Unsubscribed { topic, result } => match result {
                Ok(()) => debug!("Unsubscribed from {}", topic),
                Err(e) => warn!("Unsubscribing {} failed: {}", topic, e),
            },
            JobOutcome::Published {
                purpose: PublishPurpose::Keepalive,
                result,
            } => match result {
                Ok(token) => debug!("Keepalive {} sent", token),
                Err(e) => self.on_keepalive_failed(e),
            },
            JobOutcome::Published {
                purpose: PublishPurpose::User,
                result,
            } => match result {
                Ok(token) => info!("Published {}", token),
                Err(e) => self.on_request_failed("publish", e),
            },
            JobOutcome::Disconnected { reason, result } => {
                if let Err(e) = result {
                    warn!("Disconnect failed: {}", e);
                }
                if reason == DisconnectReason::Stop && self.runtime.stopping {
                    self.finish_stop();
                }
            }
        }
    }

    fn on_keepalive_failed(&mut self, error: BrokerError) {
        if self.runtime.stopping || !self.is_connected() {
            debug!("Keepalive failure after session ended: {}", error);
            return;
        }

        if error.is_persistence() {
            error!("Keepalive could not be persisted, stopping: {}", error);
            self.stop();
        } else {
            warn!("Keepalive failed: {}", error);
            self.on_connection_lost(&error.to_string());
        }
    }

    fn on_request_failed(&mut self, what: &str, error: BrokerError) {
        warn!("{} failed: {}", what, error);
        if error.is_not_connected() && self.is_connected() && !self.runtime.stopping {
            warn!("Session is gone although the controller thinks it is connected");
            self.on_connection_lost(&error.to_string());
        }
    }

    // ---- helpers ----

    fn is_connected(&self) -> bool {
        self.state == LinkState::Connected && self.runtime.has_session()
    }

    fn keepalive_topic(&mut self) -> Option<String> {
        if self.runtime.keepalive_topic.is_none() {
            match self.services.store.get_string(keys::CLIENT_ID) {
                Ok(Some(client_id)) => {
                    self.runtime.keepalive_topic = Some(keepalive_topic(&client_id))
                }
                Ok(None) => {}
                Err(e) => warn!("Could not read client id: {}", e),
            }
        }
        self.runtime.keepalive_topic.clone()
    }

    fn was_started(&self) -> bool {
        LifecycleState::was_started(&*self.services.store).unwrap_or_else(|e| {
            warn!("Could not read started flag: {}", e);
            false
        })
    }

    fn persist_started(&self, started: bool) {
        if let Err(e) = LifecycleState::set_started(&*self.services.store, started) {
            warn!("Could not persist started={}: {}", started, e);
        }
    }

    fn submit(&self, job: NetJob) -> bool {
        match self.jobs.send(job) {
            Ok(()) => true,
            Err(e) => {
                error!("Network worker is gone, dropped {:?}", e.0);
                false
            }
        }
    }

    fn set_state(&mut self, next: LinkState) {
        if self.state != next {
            info!("{} -> {}", self.state, next);
            self.state = next;
        }
    }

    /// Fires the listener once per start/stop request.
    fn report(&mut self, action: Action, status: Status, message: Option<&str>) {
        if !self.runtime.pending_report {
            debug!("{} outcome {:?} already reported", action, status);
            return;
        }
        self.runtime.pending_report = false;
        self.services.listener.on_result(action, status, message);
    }
}
