use color_eyre::{eyre::eyre, Result};
use pushlink::config::AppConfig;
use pushlink::console::{parse_line, ConsoleCommand, ParseError};
use pushlink::controller::{command_channel, ControllerHandle, LogListener, Services};
use pushlink::mqtt::{ConnectionConfig, RumqttBroker};
use pushlink::persistence::StatePortal;
use pushlink::platform::{LogNotifier, SystemClock, TcpProbeMonitor, TokioTimers};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Probed when neither a probe address nor a broker is configured.
const FALLBACK_PROBE_ADDRESS: &str = "1.1.1.1:53";

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(AppConfig::default_path);
    let app_config = AppConfig::load_or_create(&config_path).await?;
    info!("Using configuration {}", config_path.display());

    let store = open_store(&app_config).await;
    let probe_fallback = match ConnectionConfig::load(&store) {
        Ok(connection) => connection.endpoint(),
        Err(e) => {
            debug!("No broker configured yet ({}), probing fallback address", e);
            FALLBACK_PROBE_ADDRESS.to_string()
        }
    };

    let (sender, inbox) = command_channel();
    let services = Services {
        store: Arc::new(store.clone()),
        timers: Box::new(TokioTimers::new(sender.clone())),
        reachability: Box::new(TcpProbeMonitor::spawn(
            app_config.probe_settings(&probe_fallback),
            sender.clone(),
        )),
        listener: Box::new(LogListener),
        notifier: Box::new(LogNotifier),
        clock: Arc::new(SystemClock),
    };
    let broker = Box::new(RumqttBroker::new(app_config.broker_settings()));

    let handle = ControllerHandle::spawn(
        sender,
        inbox,
        services,
        broker,
        app_config.controller_settings(),
    );

    info!("Ready. Commands: configure, start, stop, sub, pub, quit");
    run_console(&handle).await?;

    handle
        .shutdown(app_config.shutdown_grace())
        .await
        .map_err(|e| eyre!("Failed to shut down controller: {}", e))?;
    if let Err(e) = store.sync().await {
        error!("Failed to flush state: {}", e);
    }
    Ok(())
}

async fn run_console(handle: &ControllerHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line.map_err(|e| eyre!("Failed to read stdin: {}", e))? else {
                    info!("stdin closed, shutting down");
                    return Ok(());
                };

                match parse_line(&line) {
                    Ok(ConsoleCommand::Quit) => return Ok(()),
                    Ok(ConsoleCommand::Controller(command)) => {
                        debug!("Console command: {}", command.name());
                        handle
                            .sender()
                            .send(command)
                            .map_err(|e| eyre!("Controller unavailable: {}", e))?;
                    }
                    Err(ParseError::Empty) => {}
                    Err(e) => warn!("{}", e),
                }
            }
        }
    }
}

async fn open_store(app_config: &AppConfig) -> StatePortal {
    match StatePortal::open(&app_config.state_file).await {
        Ok((store, _worker)) => store,
        Err(e) => {
            error!(
                "Could not open state file {} ({}), state will not survive a restart",
                app_config.state_file.display(),
                e
            );
            StatePortal::in_memory()
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
