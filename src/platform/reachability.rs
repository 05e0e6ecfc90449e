//! Network reachability.
//!
//! The production monitor has no OS connectivity API to lean on, so it probes a TCP
//! endpoint (normally the broker) on a fixed interval and reports edges. When it follows
//! the broker, the controller retargets it whenever the connection settings change.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::command::{Command, CommandSender};

pub trait ReachabilityMonitor: Send {
    /// Current snapshot.
    fn is_reachable(&self) -> bool;

    /// Start emitting `ReachabilityChanged` commands. Idempotent.
    fn observe(&mut self);

    /// Stop emitting. Idempotent.
    fn unobserve(&mut self);

    /// The broker endpoint (`host:port`) changed. Monitors that do not probe the broker
    /// ignore this.
    fn retarget(&mut self, _address: &str) {}
}

#[derive(Clone, Debug)]
pub struct ProbeSettings {
    pub address: String,
    pub interval: Duration,
    pub timeout: Duration,
    /// Follow [`ReachabilityMonitor::retarget`]. Off when an explicit probe address is
    /// configured.
    pub follow_broker: bool,
}

/// Periodic TCP connect probe.
///
/// Starts out optimistic (reachable) until the first probe says otherwise. A retarget
/// probes the new address right away and discards a probe of the old one still in flight.
pub struct TcpProbeMonitor {
    reachable: Arc<AtomicBool>,
    observing: Arc<AtomicBool>,
    target: watch::Sender<String>,
    follow_broker: bool,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TcpProbeMonitor {
    pub fn spawn(settings: ProbeSettings, sender: CommandSender) -> Self {
        let reachable = Arc::new(AtomicBool::new(true));
        let observing = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let (target, target_rx) = watch::channel(settings.address.clone());

        info!(
            "Probing {} every {:?} for reachability",
            settings.address, settings.interval
        );

        let task = tokio::spawn(probe_loop(
            settings.interval,
            settings.timeout,
            target_rx,
            sender,
            reachable.clone(),
            observing.clone(),
            cancel.clone(),
        ));

        Self {
            reachable,
            observing,
            target,
            follow_broker: settings.follow_broker,
            cancel,
            task,
        }
    }

    pub fn target(&self) -> String {
        self.target.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for TcpProbeMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ReachabilityMonitor for TcpProbeMonitor {
    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn observe(&mut self) {
        if !self.observing.swap(true, Ordering::SeqCst) {
            debug!("Observing reachability changes");
        }
    }

    fn unobserve(&mut self) {
        if self.observing.swap(false, Ordering::SeqCst) {
            debug!("No longer observing reachability changes");
        }
    }

    fn retarget(&mut self, address: &str) {
        if !self.follow_broker {
            debug!("Probe address is pinned, not following {}", address);
            return;
        }
        if *self.target.borrow() == address {
            return;
        }
        info!("Probing {} for reachability", address);
        self.target.send_replace(address.to_string());
    }
}

async fn probe(address: &str, limit: Duration) -> bool {
    let target = match address.parse::<SocketAddr>() {
        Ok(addr) => timeout(limit, TcpStream::connect(addr)).await,
        Err(_) => timeout(limit, TcpStream::connect(address)).await,
    };
    matches!(target, Ok(Ok(_)))
}

async fn probe_loop(
    period: Duration,
    limit: Duration,
    mut target: watch::Receiver<String>,
    sender: CommandSender,
    reachable: Arc<AtomicBool>,
    observing: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut ticks = interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = target.changed() => {
                if changed.is_err() {
                    break;
                }
                // First tick of a fresh interval fires immediately.
                ticks = interval(period);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            }
            _ = ticks.tick() => {
                let address = target.borrow_and_update().clone();
                let now_reachable = probe(&address, limit).await;
                if target.has_changed().unwrap_or(false) {
                    debug!("Probe target changed while probing {}, discarding", address);
                    continue;
                }

                let before = reachable.swap(now_reachable, Ordering::SeqCst);
                if before == now_reachable {
                    continue;
                }

                info!("Reachability of {} changed: reachable={}", address, now_reachable);
                if observing.load(Ordering::SeqCst)
                    && sender.send(Command::ReachabilityChanged(now_reachable)).is_err()
                {
                    warn!("Controller gone, stopping reachability probe");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::command::{command_channel, Input};

    fn settings(address: String) -> ProbeSettings {
        ProbeSettings {
            address,
            interval: Duration::from_millis(20),
            timeout: Duration::from_millis(200),
            follow_broker: true,
        }
    }

    fn closed_port() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        address
    }

    #[tokio::test]
    async fn reports_unreachable_endpoint_only_while_observing() {
        let (sender, mut inbox) = command_channel();
        let mut monitor = TcpProbeMonitor::spawn(settings(closed_port()), sender);
        monitor.observe();

        let input = timeout(Duration::from_secs(2), inbox.recv()).await.unwrap();
        assert!(matches!(
            input,
            Some(Input::Command(Command::ReachabilityChanged(false)))
        ));
        assert!(!monitor.is_reachable());
        monitor.unobserve();
    }

    #[tokio::test]
    async fn listening_endpoint_stays_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let (sender, mut inbox) = command_channel();
        let mut monitor = TcpProbeMonitor::spawn(settings(address), sender);
        monitor.observe();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(monitor.is_reachable());
        assert!(inbox.try_recv().is_err());
        assert!(monitor.is_running());
    }

    #[tokio::test]
    async fn retarget_to_a_live_endpoint_reports_it_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap().to_string();

        let (sender, mut inbox) = command_channel();
        let mut monitor = TcpProbeMonitor::spawn(settings(closed_port()), sender);
        monitor.observe();
        let input = timeout(Duration::from_secs(2), inbox.recv()).await.unwrap();
        assert!(matches!(
            input,
            Some(Input::Command(Command::ReachabilityChanged(false)))
        ));

        monitor.retarget(&live);
        assert_eq!(monitor.target(), live);
        let input = timeout(Duration::from_secs(2), inbox.recv()).await.unwrap();
        assert!(matches!(
            input,
            Some(Input::Command(Command::ReachabilityChanged(true)))
        ));
        assert!(monitor.is_reachable());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(monitor.is_reachable());
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn pinned_probe_ignores_retarget() {
        let (sender, _inbox) = command_channel();
        let mut monitor = TcpProbeMonitor::spawn(
            ProbeSettings {
                follow_broker: false,
                ..settings("1.1.1.1:53".into())
            },
            sender,
        );
        monitor.retarget("broker.local:1883");
        assert_eq!(monitor.target(), "1.1.1.1:53");
    }
}
