//! Port listing command implementation.

use anyhow::Result;
use console::style;
use defyflash::{DetectedPort, detect_ports, device::pick_port};
use serde_json::{Value, json};

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json_output: bool) -> Result<()> {
    let detected = detect_ports();

    if json_output {
        let output = json!({
            "ok": true,
            "data": {
                "ports": detected.iter().map(port_json).collect::<Vec<_>>(),
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let name = if port.is_keyboard() {
            style(&port.name).cyan().bold()
        } else {
            style(&port.name).cyan()
        };
        let device = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
            _ => String::new(),
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!("  {} {name}{device}{vid_pid}{product}", style("•").green());
    }

    if let Ok(auto_port) = pick_port(detected) {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }

    Ok(())
}

fn port_json(port: &DetectedPort) -> Value {
    json!({
        "name": port.name,
        "device": port.device.name(),
        "known": port.device.is_known(),
        "vid": port.vid,
        "pid": port.pid,
        "manufacturer": port.manufacturer,
        "product": port.product,
        "serial": port.serial,
    })
}
