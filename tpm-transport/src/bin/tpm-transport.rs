// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command line front end for the TPM transport
//!
//! Sends raw, already-marshaled TPM commands and inspects driver state.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tpm_transport::{
    cap_area, cap_prop, cap_version, BackendConfig, DeviceConfig, Locality, Priority,
    SimulatorConfig, StatusType, TpmTransport, TransportConfig,
};
use tracing::debug;

/// TPM command transport
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "TPM_TRANSPORT_CONFIG")]
    config: Option<PathBuf>,

    /// Backend to use, overriding the configuration file
    #[arg(long, value_enum, env = "TPM_TRANSPORT_BACKEND")]
    backend: Option<BackendArg>,

    /// TPM character device (implies the device backend)
    #[arg(long, env = "TPM_DEVICE")]
    device: Option<PathBuf>,

    /// Simulator address as HOST[:PORT]; the platform port is PORT + 1
    /// (implies the simulator backend)
    #[arg(long, env = "TPM_SIMULATOR")]
    simulator: Option<String>,

    /// Power on the simulator after connecting
    #[arg(long)]
    power_on: bool,

    /// Per-command transmit timeout in milliseconds
    #[arg(long, env = "TPM_TRANSPORT_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Device,
    Simulator,
}

#[derive(Subcommand)]
enum Commands {
    /// Show driver and device status
    Status,
    /// List the known capabilities and their values
    Caps,
    /// Query one capability, e.g. `cap 0x200 0x201`
    Cap {
        #[clap(value_parser = parse_u32)]
        area: u32,
        #[clap(value_parser = parse_u32)]
        sub_cap: u32,
    },
    /// Send one hex encoded command and print the hex encoded response
    Send(SendArgs),
    /// Send one command read from a binary file
    SendFile {
        path: PathBuf,
        #[clap(flatten)]
        opts: SubmitOpts,
    },
}

#[derive(Parser)]
struct SendArgs {
    /// Hex encoded command bytes
    command: String,
    #[clap(flatten)]
    opts: SubmitOpts,
}

#[derive(Args)]
struct SubmitOpts {
    /// Locality (0-4)
    #[arg(short, long, default_value_t = 0)]
    locality: u8,

    /// Priority: low, normal, high or system
    #[arg(short, long, default_value = "normal")]
    priority: Priority,
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn parse_simulator(addr: &str) -> Result<SimulatorConfig> {
    let mut sim = SimulatorConfig::default();
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid simulator port in {addr:?}"))?;
            sim.host = host.to_string();
            sim.command_port = port;
            sim.platform_port = port
                .checked_add(1)
                .context("simulator port leaves no room for the platform port")?;
        }
        None => sim.host = addr.to_string(),
    }
    Ok(sim)
}

fn load_config(cli: &Cli) -> Result<TransportConfig> {
    let mut config = match &cli.config {
        Some(path) => TransportConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => TransportConfig::default(),
    };

    if let Some(addr) = &cli.simulator {
        let mut sim = parse_simulator(addr)?;
        sim.power_on = cli.power_on;
        config.backend = BackendConfig::Simulator(sim);
    } else if let Some(path) = &cli.device {
        config.backend = BackendConfig::Device(DeviceConfig {
            path: Some(path.clone()),
        });
    }
    match (cli.backend, &config.backend) {
        (Some(BackendArg::Device), BackendConfig::Simulator(_)) => {
            config.backend = BackendConfig::Device(DeviceConfig::default());
        }
        (Some(BackendArg::Simulator), BackendConfig::Device(_)) => {
            config.backend = BackendConfig::Simulator(SimulatorConfig {
                power_on: cli.power_on,
                ..Default::default()
            });
        }
        _ => {}
    }
    if let Some(ms) = cli.timeout_ms {
        config.transmit_timeout_ms = ms;
    }
    config.validate().context("invalid configuration")?;
    debug!("using {:?}", config.backend);
    Ok(config)
}

fn cmd_status(transport: &TpmTransport) {
    for status_type in [StatusType::Driver, StatusType::Device] {
        let value = transport.get_status(status_type);
        println!("{status_type:?}: {value:?} (0x{:04x})", value.to_u32());
    }
}

fn cmd_caps(transport: &TpmTransport) {
    let known = [
        (cap_area::VERSION, cap_version::DRIVER, "driver version"),
        (cap_area::VERSION, cap_version::FIRMWARE, "firmware version"),
        (cap_area::PROPERTY, cap_prop::MANUFACTURER, "manufacturer"),
        (cap_area::PROPERTY, cap_prop::MODULE_TYPE, "module type"),
        (cap_area::PROPERTY, cap_prop::GLOBAL_STATE, "global state"),
        (cap_area::PROPERTY, cap_prop::MAX_BUFFER, "max buffer"),
        (cap_area::PROPERTY, cap_prop::TIMEOUT_MS, "timeout (ms)"),
    ];
    for (area, sub_cap, name) in known {
        match transport.query_capability(area, sub_cap) {
            Ok(value) => println!("0x{area:04x}/0x{sub_cap:04x} {name}: {}", hex::encode(value)),
            Err(err) => println!("0x{area:04x}/0x{sub_cap:04x} {name}: <{err}>"),
        }
    }
}

fn cmd_send(transport: &TpmTransport, command: &[u8], opts: &SubmitOpts) -> Result<()> {
    let Some(locality) = Locality::from_u8(opts.locality) else {
        bail!("locality must be between 0 and 4, got {}", opts.locality);
    };
    let session = transport
        .create_session()
        .context("failed to open TPM session")?;
    let response = transport.submit_command(session, command, locality, opts.priority);
    transport
        .close_session(session)
        .context("failed to close TPM session")?;
    let response = response.context("TPM command failed")?;
    println!("{}", hex::encode(response));
    Ok(())
}

fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let transport = TpmTransport::new(&config).context("failed to set up TPM transport")?;

    match &cli.command {
        Commands::Status => cmd_status(&transport),
        Commands::Caps => cmd_caps(&transport),
        Commands::Cap { area, sub_cap } => {
            let value = transport
                .query_capability(*area, *sub_cap)
                .with_context(|| format!("failed to query capability 0x{area:x}/0x{sub_cap:x}"))?;
            println!("{}", hex::encode(value));
        }
        Commands::Send(args) => {
            let command = hex::decode(args.command.trim()).context("invalid hex command")?;
            cmd_send(&transport, &command, &args.opts)?;
        }
        Commands::SendFile { path, opts } => {
            let command = fs_err::read(path)?;
            cmd_send(&transport, &command, opts)?;
        }
    }

    Ok(())
}
