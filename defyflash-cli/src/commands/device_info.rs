//! Device info command implementation.

use anyhow::{Context, Result};
use console::style;
use defyflash::{DeviceInfo, FirmwareImage, Side};
use serde_json::{Value, json};
use std::path::Path;

use super::{SessionArgs, SideArg, hex32, open_session};
use crate::Cli;
use crate::commands::upgrade::load_image;
use crate::config::Config;

/// Query the bootloader of each requested half and print what it reports.
pub(crate) fn cmd_device_info(
    cli: &Cli,
    config: &mut Config,
    firmware: Option<&Path>,
    side: SideArg,
    json_output: bool,
    session_args: &SessionArgs,
) -> Result<()> {
    let image = firmware.map(load_image).transpose()?;

    let mut settings = config.upgrade.clone();
    session_args.apply(&mut settings);
    settings.validate()?;

    let (port_name, mut session) = open_session(cli, config, &settings)?;
    if !cli.quiet && !json_output {
        eprintln!("{} Querying keyboard on {}", style("🔍").cyan(), port_name);
    }

    let halves = session
        .query_sides(side.sides())
        .context("Failed to read device info")?;

    if json_output {
        let payload = json!({
            "ok": true,
            "data": {
                "port": port_name,
                "halves": halves
                    .iter()
                    .map(|(side, info)| half_json(*side, info, image.as_ref()))
                    .collect::<Vec<_>>(),
            }
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    for (side, info) in &halves {
        print_half(*side, info, image.as_ref());
    }
    Ok(())
}

fn half_json(side: Side, info: &DeviceInfo, image: Option<&FirmwareImage>) -> Value {
    json!({
        "side": side,
        "hardware_version": info.hardware_version,
        "flash_start": hex32(info.flash_start),
        "program_version": hex32(info.program_version),
        "program_crc": hex32(info.program_crc),
        "needs_update": image.map(|image| image.seal().needs_update(info)),
    })
}

fn print_half(side: Side, info: &DeviceInfo, image: Option<&FirmwareImage>) {
    eprintln!("\n{} {} half", style("⌨").cyan(), style(side).bold());
    eprintln!("  Hardware version: {}", info.hardware_version);
    eprintln!("  Flash start:      {}", hex32(info.flash_start));
    eprintln!("  Program version:  {}", hex32(info.program_version));
    eprintln!("  Program CRC:      {}", hex32(info.program_crc));

    if let Some(image) = image {
        if image.seal().needs_update(info) {
            eprintln!("  {}", style("Update available").yellow());
        } else {
            eprintln!("  {}", style("Up to date").green());
        }
    }
}
