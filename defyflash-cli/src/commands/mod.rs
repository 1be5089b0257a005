//! Command implementations.
//!
//! Each subcommand is implemented in its own module. Helpers shared by the
//! commands that talk to the keyboard live here.

pub(crate) mod completions;
pub(crate) mod device_info;
pub(crate) mod inspect;
pub(crate) mod ports;
pub(crate) mod upgrade;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use defyflash::{NativePort, SerialConfig, Side, UpgradeSession};
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::{Config, UpgradeConfig};
use crate::{Cli, CliError, get_port, use_fancy_output, was_interrupted};

/// Which halves a command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum SideArg {
    /// Left half only.
    Left,
    /// Right half only.
    Right,
    /// Left half, then right half.
    Both,
}

impl SideArg {
    pub(crate) fn sides(self) -> &'static [Side] {
        match self {
            Self::Left => &[Side::Left],
            Self::Right => &[Side::Right],
            Self::Both => &Side::BOTH,
        }
    }
}

/// Session timing flags, layered over the `[upgrade]` config section.
#[derive(Args, Debug, Clone, Default)]
pub(crate) struct SessionArgs {
    /// Give up after this many not-ready answers (default: poll forever).
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    pub max_ready_attempts: Option<u32>,

    /// Delay between readiness polls in milliseconds.
    #[arg(long, value_name = "MS")]
    pub poll_interval_ms: Option<u64>,

    /// Give up polling readiness after this many milliseconds.
    #[arg(long, value_name = "MS")]
    pub ready_timeout_ms: Option<u64>,

    /// Time to wait for each response line in milliseconds.
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..))]
    pub response_timeout_ms: Option<u64>,
}

impl SessionArgs {
    /// Apply the flags that were given on top of `settings`.
    pub(crate) fn apply(&self, settings: &mut UpgradeConfig) {
        if let Some(n) = self.max_ready_attempts {
            settings.max_ready_attempts = Some(n);
        }
        if let Some(ms) = self.poll_interval_ms {
            settings.poll_interval_ms = Some(ms);
        }
        if let Some(ms) = self.ready_timeout_ms {
            settings.ready_timeout_ms = Some(ms);
        }
        if let Some(ms) = self.response_timeout_ms {
            settings.response_timeout_ms = Some(ms);
        }
    }
}

pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted by user".to_string()).into())
    } else {
        Ok(())
    }
}

/// Resolve the port and open an upgrade session on it.
pub(crate) fn open_session(
    cli: &Cli,
    config: &mut Config,
    settings: &UpgradeConfig,
) -> Result<(String, UpgradeSession<NativePort>)> {
    let port_name = get_port(cli, config)?;
    let baud = cli.baud_rate(config);
    ensure_not_interrupted()?;

    let port = NativePort::open(&SerialConfig::new(&port_name, baud))
        .with_context(|| format!("Failed to open {port_name}"))?;
    let session = UpgradeSession::new(port).with_options(settings.to_options());

    Ok((port_name, session))
}

/// Progress bar for block transfers, hidden in quiet or plain output.
pub(crate) fn transfer_progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Format a CRC or address the way the device tools print them.
pub(crate) fn hex32(value: u32) -> String {
    format!("0x{value:08X}")
}
