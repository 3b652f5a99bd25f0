mod config;
mod session;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use config::{CliConfig, ConfigFile};
use session::Session;
use std::{path::PathBuf, time::Duration};
use tokio::signal;
use tracing::{info, warn};
use vsp_client_core::ExtensionState;
use vsp_proto::{CheckFlags, ControllerData, FlowControl, Parity, PortParameters, TraceFlags};

#[derive(Debug, Parser)]
#[command(name = "vsp-cli")]
#[command(about = "Manage the virtual serial port driver", long_about = None)]
struct Args {
    /// JSON file with the system setup and the port topology to restore
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Upper bound for each driver command and extension request, in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Activate the driver extension
    Install,
    /// Deactivate the driver extension
    Uninstall,
    /// Show extension and driver status
    Status,
    /// List serial ports
    Ports,
    /// List port links
    Links,
    /// Create a serial port
    CreatePort {
        #[arg(long, default_value_t = 115_200)]
        baud: u32,
        #[arg(long, default_value_t = 8)]
        data_bits: u8,
        #[arg(long, default_value_t = 1)]
        stop_bits: u8,
        #[arg(long, value_enum, default_value_t = ParityArg::None)]
        parity: ParityArg,
        #[arg(long, value_enum, default_value_t = FlowArg::None)]
        flow_control: FlowArg,
    },
    /// Remove a serial port
    RemovePort { id: u8 },
    /// Link two ports
    Link { source: u8, target: u8 },
    /// Remove the link between two ports
    Unlink { source: u8, target: u8 },
    /// Set trace and check flags on a port
    Trace {
        port: u8,
        #[arg(long)]
        rx: bool,
        #[arg(long)]
        tx: bool,
        #[arg(long)]
        io: bool,
        /// Line settings to check between linked ports
        #[arg(long = "check", value_enum)]
        checks: Vec<CheckArg>,
    },
    /// Create, link, list and tear down a pair of ports
    Demo,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ParityArg {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl From<ParityArg> for Parity {
    fn from(arg: ParityArg) -> Self {
        match arg {
            ParityArg::None => Parity::None,
            ParityArg::Odd => Parity::Odd,
            ParityArg::Even => Parity::Even,
            ParityArg::Mark => Parity::Mark,
            ParityArg::Space => Parity::Space,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FlowArg {
    None,
    Hardware,
    Software,
}

impl From<FlowArg> for FlowControl {
    fn from(arg: FlowArg) -> Self {
        match arg {
            FlowArg::None => FlowControl::None,
            FlowArg::Hardware => FlowControl::Hardware,
            FlowArg::Software => FlowControl::Software,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CheckArg {
    Baud,
    DataSize,
    StopBits,
    Parity,
    FlowControl,
}

impl From<CheckArg> for CheckFlags {
    fn from(arg: CheckArg) -> Self {
        match arg {
            CheckArg::Baud => CheckFlags::BAUD,
            CheckArg::DataSize => CheckFlags::DATA_SIZE,
            CheckArg::StopBits => CheckFlags::STOP_BITS,
            CheckArg::Parity => CheckFlags::PARITY,
            CheckArg::FlowControl => CheckFlags::FLOW_CONTROL,
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config_file = args.config.clone().map(ConfigFile::new);
    let mut config = match &config_file {
        Some(file) => file.load().context("load config")?.unwrap_or_default(),
        None => CliConfig::default(),
    };

    let mut session = Session::start(&config, Duration::from_millis(args.timeout_ms));
    let outcome = tokio::select! {
        res = execute(&mut session, &config, &args.command) => res,
        _ = signal::ctrl_c() => {
            info!("interrupted");
            Ok(false)
        }
    };
    let changed = match outcome {
        Ok(changed) => changed,
        Err(err) => {
            if let Err(close_err) = session.shutdown().await {
                warn!(error = %close_err, "session shutdown failed");
            }
            return Err(err);
        }
    };

    if changed {
        if let Some(file) = &config_file {
            let (ports, links) = session.topology();
            config.ports = ports;
            config.links = links;
            file.store(&config).context("store config")?;
            info!(path = %file.path().display(), "saved port topology");
        }
    }
    session.shutdown().await?;
    Ok(())
}

/// Run one command. Returns whether the port topology changed.
async fn execute(session: &mut Session, config: &CliConfig, command: &Command) -> Result<bool> {
    match command {
        Command::Install => {
            let state = session.install().await?;
            println!("{}", state.describe());
            ensure_state(state, ExtensionState::Activated)?;
            return Ok(false);
        }
        Command::Uninstall => {
            let state = session.discover().await?;
            if state != ExtensionState::Activated {
                println!("{}", state.describe());
                return Ok(false);
            }
            let state = session.uninstall().await?;
            println!("{}", state.describe());
            ensure_state(state, ExtensionState::Removal)?;
            return Ok(false);
        }
        _ => {}
    }

    session.ready(config).await?;
    let controller = session.controller().clone();
    match command {
        Command::Install | Command::Uninstall => Ok(false),
        Command::Status => {
            let status = session.run(controller.get_status()).await?;
            println!("extension: {}", controller.extension_state());
            match controller.connection().attachment() {
                Some(attachment) => {
                    println!("driver: {} ({})", attachment.name, attachment.path)
                }
                None => println!("driver: not connected"),
            }
            println!("ports: {}", status.ports.len());
            println!("links: {}", status.links.len());
            Ok(false)
        }
        Command::Ports => {
            print_ports(&session.run(controller.get_port_list()).await?);
            Ok(false)
        }
        Command::Links => {
            print_links(&session.run(controller.get_link_list()).await?);
            Ok(false)
        }
        Command::CreatePort {
            baud,
            data_bits,
            stop_bits,
            parity,
            flow_control,
        } => {
            let params = PortParameters::new(
                *baud,
                *data_bits,
                *stop_bits,
                (*parity).into(),
                (*flow_control).into(),
            )
            .map_err(|err| anyhow::anyhow!("port parameters: {err}"))?;
            let created = session.run(controller.create_port(params)).await?;
            println!("created port {}", created.parameter.link.source);
            print_ports(&created);
            Ok(true)
        }
        Command::RemovePort { id } => {
            print_ports(&session.run(controller.remove_port(*id)).await?);
            Ok(true)
        }
        Command::Link { source, target } => {
            print_links(&session.run(controller.link_ports(*source, *target)).await?);
            Ok(true)
        }
        Command::Unlink { source, target } => {
            print_links(&session.run(controller.unlink_ports(*source, *target)).await?);
            Ok(true)
        }
        Command::Trace {
            port,
            rx,
            tx,
            io,
            checks,
        } => {
            let mut traces = TraceFlags::empty();
            traces.set(TraceFlags::RX, *rx);
            traces.set(TraceFlags::TX, *tx);
            traces.set(TraceFlags::IO, *io);
            let checks = checks
                .iter()
                .fold(CheckFlags::empty(), |acc, arg| acc | CheckFlags::from(*arg));
            let submitted = if checks.is_empty() {
                controller.enable_trace(*port, traces)
            } else {
                controller.enable_checks_and_trace(*port, checks, traces)
            };
            print_ports(&session.run(submitted).await?);
            Ok(false)
        }
        Command::Demo => {
            let a = session
                .run(controller.create_port(PortParameters::default()))
                .await?
                .parameter
                .link
                .source;
            let b = session
                .run(controller.create_port(PortParameters::default()))
                .await?
                .parameter
                .link
                .source;
            print_links(&session.run(controller.link_ports(a, b)).await?);
            print_ports(&session.run(controller.get_port_list()).await?);
            if let Err(err) = session.run(controller.link_ports(a, a)).await {
                println!("self link rejected: {err:#}");
            }
            session.run(controller.unlink_ports(a, b)).await?;
            session.run(controller.remove_port(b)).await?;
            print_ports(&session.run(controller.remove_port(a)).await?);
            Ok(false)
        }
    }
}

fn ensure_state(state: ExtensionState, expected: ExtensionState) -> Result<()> {
    if state != expected {
        bail!("extension ended in {state}, expected {expected}");
    }
    Ok(())
}

fn print_ports(data: &ControllerData) {
    if data.ports.is_empty() {
        println!("no ports");
    }
    for port in &data.ports {
        println!(
            "{:>3}  {:<16} trace={:?} checks={:?}",
            port.id,
            port.name.as_str(),
            port.trace_flags(),
            port.check_flags()
        );
    }
}

fn print_links(data: &ControllerData) {
    if data.links.is_empty() {
        println!("no links");
    }
    for link in data.link_records() {
        println!("{:>3}  {} <-> {}", link.link_id, link.source, link.target);
    }
}
