//! Upgrade command implementation.

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use defyflash::{FirmwareImage, HalfOutcome, Side, UpgradeReport};
use std::path::{Path, PathBuf};

use super::{SessionArgs, SideArg, ensure_not_interrupted, hex32, open_session};
use crate::Cli;
use crate::config::{Config, UpgradeConfig};

/// Arguments of `defyflash upgrade`.
#[derive(Args, Debug, Clone)]
pub(crate) struct UpgradeArgs {
    /// Sealed key-scanner firmware image.
    pub firmware: PathBuf,

    /// Skip halves that already run the sealed program.
    #[arg(long)]
    pub skip_current: bool,

    /// Send `upgrade.end` after the last half.
    #[arg(long)]
    pub end: bool,

    /// Halves to flash.
    #[arg(long, value_enum, default_value_t = SideArg::Both)]
    pub side: SideArg,

    #[command(flatten)]
    pub session: SessionArgs,
}

impl UpgradeArgs {
    fn settings(&self, config: &Config) -> UpgradeConfig {
        let mut settings = config.upgrade.clone();
        self.session.apply(&mut settings);
        if self.skip_current {
            settings.skip_current = Some(true);
        }
        if self.end {
            settings.send_end = Some(true);
        }
        settings
    }
}

pub(crate) fn load_image(path: &Path) -> Result<FirmwareImage> {
    FirmwareImage::from_file(path)
        .with_context(|| format!("Failed to load firmware: {}", path.display()))
}

/// Upgrade command implementation.
pub(crate) fn cmd_upgrade(cli: &Cli, config: &mut Config, args: &UpgradeArgs) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware: {}",
            style("📦").cyan(),
            args.firmware.display()
        );
    }
    let image = load_image(&args.firmware)?;

    if !cli.quiet {
        let seal = image.seal();
        eprintln!(
            "{} Program version {}, CRC {}, {} bytes in {} blocks",
            style("ℹ").blue(),
            hex32(seal.program_version),
            hex32(seal.program_crc),
            image.len(),
            image.chunk_count()
        );
    }

    let settings = args.settings(config);
    settings.validate()?;

    let (port_name, mut session) = open_session(cli, config, &settings)?;
    if !cli.quiet {
        eprintln!(
            "{} Using port {} @ {} baud",
            style("🔌").cyan(),
            port_name,
            cli.baud_rate(config)
        );
        eprintln!("{} Waiting for the keyboard...", style("⏳").yellow());
    }

    let pb = super::transfer_progress_bar(cli.quiet);
    let mut current_side: Option<Side> = None;

    let result = session.run_sides(
        args.side.sides(),
        &image,
        &mut |side: Side, written: usize, total: usize| {
            if current_side != Some(side) {
                current_side = Some(side);
                pb.reset();
                pb.set_message(format!("Flashing {side} half"));
            }
            if total > 0 {
                pb.set_position((written * 100 / total) as u64);
            }
        },
    );

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            pb.abandon();
            ensure_not_interrupted()?;
            return Err(err).context("Upgrade failed");
        },
    };
    pb.finish_with_message("Complete");

    if !cli.quiet {
        print_report(&report);
        eprintln!("\n{} Upgrade complete!", style("🎉").green().bold());
    }

    Ok(())
}

fn print_report(report: &UpgradeReport) {
    for half in &report.halves {
        match half.outcome {
            HalfOutcome::Flashed if half.needed_update => eprintln!(
                "{} {} half flashed (was {})",
                style("✓").green(),
                half.side,
                hex32(half.info.program_crc)
            ),
            HalfOutcome::Flashed => eprintln!(
                "{} {} half flashed, it already ran this program",
                style("✓").green(),
                half.side
            ),
            HalfOutcome::Skipped => eprintln!(
                "{} {} half already current, skipped",
                style("•").dim(),
                half.side
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(skip_current: bool, end: bool) -> UpgradeArgs {
        UpgradeArgs {
            firmware: PathBuf::from("fw.bin"),
            skip_current,
            end,
            side: SideArg::Both,
            session: SessionArgs::default(),
        }
    }

    #[test]
    fn test_flags_enable_config_switches() {
        let config = Config::default();
        let settings = args(true, true).settings(&config);
        assert_eq!(settings.skip_current, Some(true));
        assert_eq!(settings.send_end, Some(true));
    }

    #[test]
    fn test_unset_flags_keep_config_switches() {
        let mut config = Config::default();
        config.upgrade.skip_current = Some(true);
        config.upgrade.send_end = Some(false);
        config.upgrade.poll_interval_ms = Some(250);

        let settings = args(false, false).settings(&config);
        assert_eq!(settings.skip_current, Some(true));
        assert_eq!(settings.send_end, Some(false));
        assert_eq!(settings.poll_interval_ms, Some(250));
    }

    #[test]
    fn test_load_image_missing_file() {
        let err = load_image(Path::new("/nonexistent/keyscanner.bin")).unwrap_err();
        assert!(err.to_string().contains("Failed to load firmware"));
    }

    #[test]
    fn test_load_image_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, [0u8; 8]).unwrap();

        let err = load_image(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<defyflash::Error>(),
            Some(defyflash::Error::TruncatedImage { len: 8, .. })
        ));
    }
}
