//! Connection lifecycle subsystem
//!
//! Decides when to connect, when a link is dead, how long to back off and how to keep an
//! idle connection alive.
//!
//! 1. [`controller`] - the state machine (Idle, Connecting, Connected, AwaitingRetry)
//! 2. [`backoff`] - reconnect delay policy
//! 3. [`keepalive`] - periodic application-level keepalive
//! 4. [`net_worker`] - sequential executor for broker calls
//! 5. [`controller_handle`] - actor wiring and the public API
//!
//! # Architecture
//!
//! ```text
//! user / timers / reachability ──► mailbox ──► Controller ──► NetWorker ──► broker
//!                                     ▲                          │
//!                                     └──── outcomes, events ────┘
//! ```
//!
//! Every input is handled to completion before the next one is read, which is what
//! keeps timers, reachability edges and connect results from racing each other.

pub mod backoff;
pub mod command;
pub mod controller;
pub mod controller_handle;
pub mod keepalive;
pub mod listener;
pub mod net_worker;
pub mod state;

pub use command::{command_channel, Command, CommandSender, Input};
pub use controller::{Controller, ControllerSettings, Services};
pub use controller_handle::{ControllerError, ControllerHandle};
pub use listener::{Action, LogListener, ResultListener, Status};
pub use state::LinkState;
