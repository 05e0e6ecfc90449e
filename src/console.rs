//! Line commands read from stdin by the binary.
//!
//! ```text
//! configure <server> <port> <clientId> <topic> [user] [pass]
//! start | stop
//! sub <topic>
//! pub <topic> <text...>
//! quit
//! ```

use thiserror::Error;

use crate::controller::Command;
use crate::mqtt::ConnectionConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Controller(Command),
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Empty line")]
    Empty,

    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Invalid port: {0}")]
    InvalidPort(String),
}

const CONFIGURE_USAGE: &str = "configure <server> <port> <clientId> <topic> [user] [pass]";
const SUB_USAGE: &str = "sub <topic>";
const PUB_USAGE: &str = "pub <topic> <text>";

pub fn parse_line(line: &str) -> Result<ConsoleCommand, ParseError> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    match word {
        "" => Err(ParseError::Empty),
        "start" => Ok(ConsoleCommand::Controller(Command::Start)),
        "stop" => Ok(ConsoleCommand::Controller(Command::Stop)),
        "quit" | "exit" => Ok(ConsoleCommand::Quit),
        "sub" => {
            let args: Vec<&str> = rest.split_whitespace().collect();
            match args.as_slice() {
                [topic] => Ok(ConsoleCommand::Controller(Command::Subscribe(
                    topic.to_string(),
                ))),
                _ => Err(ParseError::Usage(SUB_USAGE)),
            }
        }
        "pub" => {
            let (topic, text) = rest
                .split_once(char::is_whitespace)
                .ok_or(ParseError::Usage(PUB_USAGE))?;
            Ok(ConsoleCommand::Controller(Command::Publish {
                topic: topic.to_string(),
                payload: text.trim_start().as_bytes().to_vec(),
            }))
        }
        "configure" => parse_configure(rest).map(|config| {
            ConsoleCommand::Controller(Command::Configure(config))
        }),
        other => Err(ParseError::Unknown(other.to_string())),
    }
}

fn parse_configure(rest: &str) -> Result<ConnectionConfig, ParseError> {
    let args: Vec<&str> = rest.split_whitespace().collect();
    if !(4..=6).contains(&args.len()) {
        return Err(ParseError::Usage(CONFIGURE_USAGE));
    }

    let port: u16 = args[1]
        .parse()
        .map_err(|_| ParseError::InvalidPort(args[1].to_string()))?;

    let mut config = ConnectionConfig::new(args[0], args[2])
        .with_port(port)
        .with_topic(args[3]);
    if let Some(user) = args.get(4) {
        config = config.with_credentials(*user, args.get(5).copied().unwrap_or(""));
    }
    Ok(config)
}
