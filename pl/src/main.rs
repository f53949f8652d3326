//! ProtoLock - protocol edit-lock client
//!
//! CLI entry point for watching the hub's lock table and requesting or
//! releasing locks from a terminal.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::*;
use eyre::{Context, Result, bail, eyre};
use tokio::sync::broadcast;
use tracing::{debug, info};

use protolock::cli::{Cli, Command, IdentityCommand, get_log_path};
use protolock::config::Config;
use protolock::{
    Capability, ConnectionState, DeviceIdentity, FileStore, LockCoordinator, LockEvent, LockHandle, LockSnapshot,
    WsHubFactory, spawn_list_changed_listener,
};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>, to_stderr: bool) -> Result<()> {
    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    if to_stderr {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    } else {
        let log_path = get_log_path();
        if let Some(log_dir) = log_path.parent() {
            fs::create_dir_all(log_dir).context("Failed to create log directory")?;
        }
        let log_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .context("Failed to open log file")?;

        tracing_subscriber::fmt()
            .with_writer(log_file)
            .with_ansi(false)
            .with_env_filter(filter)
            .init();
    }

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref(), cli.stderr)
        .context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(api_base = %config.hub.api_base, "ProtoLock loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Watch => cmd_watch(&config).await,
        Command::Lock { protocol_id, wait_ms } => {
            cmd_request(&config, Request::Lock, &protocol_id, Duration::from_millis(wait_ms)).await
        }
        Command::Unlock { protocol_id, wait_ms } => {
            cmd_request(&config, Request::Unlock, &protocol_id, Duration::from_millis(wait_ms)).await
        }
        Command::Identity { command } => cmd_identity(&config, command),
        Command::Config => cmd_config(&config),
    }
}

fn open_identity(config: &Config) -> Arc<DeviceIdentity> {
    let path = config.identity.store_path();
    debug!(?path, "open_identity: called");
    Arc::new(DeviceIdentity::new(Arc::new(FileStore::new(path))))
}

/// Spawn a coordinator against the configured hub and connect it
///
/// Returns once the first connection attempt settled.
async fn start_coordinator(config: &Config, capability: Capability, identity: Arc<DeviceIdentity>) -> Result<LockHandle> {
    let url = config.hub.url().context("Invalid hub address")?;
    let factory = Arc::new(WsHubFactory::new(url.clone(), config.hub.options()));
    let coordinator = LockCoordinator::new(config.coordinator.clone(), capability, identity, factory);
    let handle = coordinator.handle();
    tokio::spawn(coordinator.run());

    handle.connect().await?;
    // Connect has been handled once the view comes back
    handle.view().await?;

    let mut views = handle.watch();
    let limit = Duration::from_millis(config.hub.handshake_timeout_ms) + Duration::from_secs(1);
    let settled = tokio::time::timeout(limit, views.wait_for(|view| view.state != ConnectionState::Connecting))
        .await
        .is_ok();
    if !settled {
        debug!(%url, "start_coordinator: still connecting after {:?}", limit);
    }
    info!(%url, state = %handle.state(), "Coordinator started");
    Ok(handle)
}

fn print_locks(locks: &LockSnapshot) {
    if locks.is_empty() {
        println!("  {}", "(no protocols locked)".dimmed());
        return;
    }
    for (protocol_id, device_name) in locks.iter() {
        println!("  {} {}", protocol_id.yellow(), device_name.cyan());
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

fn colored_state(state: ConnectionState) -> ColoredString {
    match state {
        ConnectionState::Connected => state.to_string().green(),
        ConnectionState::Connecting | ConnectionState::Reconnecting => state.to_string().yellow(),
        ConnectionState::Disconnected => state.to_string().red(),
    }
}

async fn cmd_watch(config: &Config) -> Result<()> {
    let identity = open_identity(config);
    let handle = start_coordinator(config, Capability::ReadOnly, identity).await?;
    let mut events = handle.subscribe();

    let listener = spawn_list_changed_listener(handle.subscribe(), || {
        println!("{} {}", timestamp().dimmed(), "Protocol list changed".magenta());
    });

    println!("{} Hub is {}", timestamp().dimmed(), colored_state(handle.state()));
    print_locks(&handle.locks());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                debug!("cmd_watch: ctrl-c");
                break;
            }
            event = events.recv() => match event {
                Ok(LockEvent::StateChanged { state }) => {
                    println!("{} Hub is {}", timestamp().dimmed(), colored_state(state));
                }
                Ok(LockEvent::LocksChanged { count }) => {
                    println!("{} {} protocol(s) locked", timestamp().dimmed(), count.to_string().bold());
                    print_locks(&handle.locks());
                }
                Ok(LockEvent::LockDenied { protocol_id, holder }) => {
                    println!("{} Lock on {} denied, held by {}", timestamp().dimmed(), protocol_id.yellow(), holder.cyan());
                }
                Ok(LockEvent::ListChanged) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "cmd_watch: lagged");
                    print_locks(&handle.locks());
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown().await?;
    listener.abort();
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Lock,
    Unlock,
}

async fn cmd_request(config: &Config, request: Request, protocol_id: &str, wait: Duration) -> Result<()> {
    let identity = open_identity(config);
    let device_name = identity.name().context("Failed to resolve device identity")?;
    let handle = start_coordinator(config, Capability::LockCapable, identity).await?;

    if !handle.is_connected() {
        handle.shutdown().await?;
        bail!("Could not connect to lock hub at {}", config.hub.api_base);
    }

    let mut events = handle.subscribe();
    let mut views = handle.watch();
    match request {
        Request::Lock => handle.lock(protocol_id).await?,
        Request::Unlock => handle.unlock(protocol_id).await?,
    }

    let confirmed = |locks: &LockSnapshot| match request {
        Request::Lock => locks.holder(protocol_id) == Some(device_name.as_str()),
        Request::Unlock => !locks.is_locked(protocol_id),
    };

    let outcome = tokio::time::timeout(wait, async {
        loop {
            if confirmed(&views.borrow_and_update().locks) {
                return Ok(());
            }
            tokio::select! {
                changed = views.changed() => {
                    if changed.is_err() {
                        return Err(eyre!("Coordinator stopped"));
                    }
                }
                event = events.recv() => {
                    if let Ok(LockEvent::LockDenied { protocol_id: denied, holder }) = event
                        && denied == protocol_id
                    {
                        return Err(eyre!("Lock on {} denied, held by {}", denied, holder));
                    }
                }
            }
        }
    })
    .await;

    handle.shutdown().await?;

    match outcome {
        Ok(Ok(())) => {
            let verb = match request {
                Request::Lock => "Locked",
                Request::Unlock => "Unlocked",
            };
            println!("{} {} protocol {} as {}", "✓".green(), verb, protocol_id.yellow(), device_name.cyan());
            Ok(())
        }
        Ok(Err(e)) => {
            println!("{} {}", "✗".red(), e);
            Err(e)
        }
        Err(_) => {
            println!("{} No confirmation from the hub for protocol {}", "?".yellow(), protocol_id.yellow());
            Err(eyre!("Hub did not confirm protocol {} within {:?}", protocol_id, wait))
        }
    }
}

fn cmd_identity(config: &Config, command: IdentityCommand) -> Result<()> {
    let identity = open_identity(config);
    match command {
        IdentityCommand::Show => {
            let name = identity.name().context("Failed to resolve device identity")?;
            let used = identity.used_ids().context("Failed to read claimed device ids")?;
            let used: Vec<String> = used.iter().map(u32::to_string).collect();
            println!("{}", name.cyan());
            println!("{} {}", "claimed ids:".dimmed(), used.join(", "));
        }
        IdentityCommand::Reset => match identity.reset().context("Failed to reset device identity")? {
            Some(previous) => println!("{} Forgot device identity {}", "✓".green(), previous.cyan()),
            None => println!("{}", "No device identity to reset".dimmed()),
        },
    }
    Ok(())
}

fn cmd_config(config: &Config) -> Result<()> {
    let mut shown = config.clone();
    if shown.identity.store_path.is_none() {
        shown.identity.store_path = Some(config.identity.store_path());
    }
    print!("{}", shown.to_yaml()?);
    Ok(())
}
