//! Host services the lifecycle controller depends on.
//!
//! Each service is a trait with one production implementation. The controller only holds
//! trait objects, so tests drive it with manual timers, a fixed clock and a scripted
//! reachability flag.
//!
//! ```text
//! platform/
//! ├── clock.rs         - wall clock (backoff bookkeeping)
//! ├── notifier.rs      - where arrived messages are shown
//! ├── reachability.rs  - network reachability snapshot and change events
//! └── timer.rs         - one-shot and repeating wake-ups keyed by TimerId
//! ```

pub mod clock;
pub mod notifier;
pub mod reachability;
pub mod timer;

pub use clock::{Clock, SystemClock};
pub use notifier::{LogNotifier, Notifier};
pub use reachability::{ProbeSettings, ReachabilityMonitor, TcpProbeMonitor};
pub use timer::{TimerId, TimerService, TokioTimers};
