//! defyflash CLI - Command-line tool for upgrading split keyboard key scanners.
//!
//! ## Features
//!
//! - Upgrade the left and right key-scanner firmware over serial
//! - Query the bootloader info of each half
//! - Inspect sealed firmware images offline
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use commands::upgrade::UpgradeArgs;
use commands::{SessionArgs, SideArg};
use config::{Config, ConfigError};
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

const EXIT_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_CONFIG: i32 = 3;
const EXIT_NOT_FOUND: i32 = 4;
const EXIT_CANCELLED: i32 = 130;
const EXIT_PROTOCOL: i32 = 255;

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors that carry their own exit status.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation or an ambiguous choice in non-interactive mode.
    #[error("{0}")]
    Usage(String),
    /// Configuration could not be loaded or is invalid.
    #[error("{0}")]
    Config(String),
    /// The user aborted the operation.
    #[error("{0}")]
    Cancelled(String),
}

/// defyflash - Upgrade the key-scanner firmware of Dygma split keyboards.
///
/// Environment variables:
///   DEFYFLASH_PORT              - Default serial port
///   DEFYFLASH_BAUD              - Default baud rate (default: 115200)
///   DEFYFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "defyflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    defyflash upgrade keyscanner.bin\n  \
    defyflash -p /dev/ttyACM0 device-info --json\n  \
    defyflash inspect keyscanner.bin")]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "DEFYFLASH_PORT")]
    port: Option<String>,

    /// Baud rate of the keyboard's serial interface.
    #[arg(short, long, global = true, env = "DEFYFLASH_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "DEFYFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// List all available ports (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash a sealed key-scanner image to both halves.
    Upgrade(UpgradeArgs),

    /// Read the bootloader info of each half.
    DeviceInfo {
        /// Compare against this image and report which halves are stale.
        #[arg(long, value_name = "FIRMWARE")]
        firmware: Option<PathBuf>,

        /// Halves to query.
        #[arg(long, value_enum, default_value_t = SideArg::Both)]
        side: SideArg,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Show the seal and transfer layout of a firmware image.
    Inspect {
        /// Path to the firmware image.
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

impl Cli {
    /// Baud rate from the command line, then config, then the default.
    pub(crate) fn baud_rate(&self, config: &Config) -> u32 {
        self.baud
            .or(config.port.connection.baud)
            .unwrap_or(defyflash::port::DEFAULT_BAUD)
    }
}

fn main() {
    let cli = Cli::parse();

    let code = match run(&cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            exit_code_for(&err)
        },
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<()> {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    init_logging(cli.verbose, cli.quiet);
    install_interrupt_handler();

    debug!(
        "defyflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    let mut config = match &cli.config_path {
        Some(path) => Config::load_from_path(path).map_err(config_error)?,
        None => Config::load(),
    };
    config.upgrade.validate().map_err(config_error)?;

    match &cli.command {
        Commands::Upgrade(args) => commands::upgrade::cmd_upgrade(cli, &mut config, args),
        Commands::DeviceInfo {
            firmware,
            side,
            json,
            session,
        } => commands::device_info::cmd_device_info(
            cli,
            &mut config,
            firmware.as_deref(),
            *side,
            *json,
            session,
        ),
        Commands::Inspect { firmware, json } => commands::inspect::cmd_inspect(firmware, *json),
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "Specify a shell type, e.g. `defyflash completions bash`, \
                         or use `defyflash completions --install`"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Setup logging based on verbosity. `RUST_LOG` takes precedence.
fn init_logging(verbose: u8, quiet: bool) {
    let log_level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(verbose >= 2)
        .format_timestamp(if verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

/// Route Ctrl-C into the library's cancellation checks. A second Ctrl-C
/// exits immediately.
fn install_interrupt_handler() {
    let result = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            std::process::exit(EXIT_CANCELLED);
        }
    });
    if let Err(e) = result {
        debug!("Failed to install Ctrl-C handler: {e}");
    }
    defyflash::set_interrupt_checker(was_interrupted);
}

fn config_error(err: ConfigError) -> anyhow::Error {
    CliError::Config(err.to_string()).into()
}

/// Resolve the serial port to use, prompting if needed.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive && cli.port.is_none() {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}

/// Map an error to the process exit status.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return match cli_err {
                CliError::Usage(_) => EXIT_USAGE,
                CliError::Config(_) => EXIT_CONFIG,
                CliError::Cancelled(_) => EXIT_CANCELLED,
            };
        }
        if let Some(lib_err) = cause.downcast_ref::<defyflash::Error>() {
            return library_exit_code(lib_err);
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return EXIT_CONFIG;
        }
    }
    EXIT_FAILURE
}

fn library_exit_code(err: &defyflash::Error) -> i32 {
    use defyflash::Error;

    if err.is_protocol_failure() {
        return EXIT_PROTOCOL;
    }
    if err.is_device_missing() {
        return EXIT_NOT_FOUND;
    }
    match err {
        Error::Cancelled(_) => EXIT_CANCELLED,
        Error::Config(_) => EXIT_CONFIG,
        _ => EXIT_FAILURE,
    }
}
