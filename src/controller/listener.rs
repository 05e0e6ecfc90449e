use std::fmt;
use tracing::{error, info};

/// Which user request a result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    /// Client error code of the failure.
    Code(i32),
}

impl Status {
    pub const SUCCESS_CODE: i32 = 256;

    pub fn code(&self) -> i32 {
        match self {
            Status::Success => Self::SUCCESS_CODE,
            Status::Code(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

/// Receives the outcome of every start and stop request.
pub trait ResultListener: Send {
    fn on_result(&self, action: Action, status: Status, message: Option<&str>);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LogListener;

impl ResultListener for LogListener {
    fn on_result(&self, action: Action, status: Status, message: Option<&str>) {
        match status {
            Status::Success => info!("{} succeeded", action),
            Status::Code(code) => error!(
                "{} failed with code {}: {}",
                action,
                code,
                message.unwrap_or("no details")
            ),
        }
    }
}
