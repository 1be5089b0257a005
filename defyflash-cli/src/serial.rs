//! Interactive serial port selection.
//!
//! Port resolution order:
//! - Explicit `--port` / `DEFYFLASH_PORT`
//! - `[port.connection] serial` from configuration
//! - Auto-detection of known keyboards and remembered USB devices
//! - Interactive selection via dialoguer
//!
//! Non-interactive mode never prompts and fails when the choice is ambiguous.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    defyflash::{DetectedPort, detect_ports},
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    std::io::IsTerminal,
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// List all ports (including unknown types).
    pub list_all_ports: bool,
    /// Non-interactive mode (fail if multiple ports).
    pub non_interactive: bool,
    /// Force confirmation even for single recognized port.
    pub confirm_port: bool,
}

/// Result of port selection including whether it was a known device.
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port matched a known keyboard or remembered device.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn cancelled_err() -> anyhow::Error {
    CliError::Cancelled("Port selection cancelled".to_string()).into()
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name, detect_ports(), config));
    }

    if let Some(port_name) = &config.port.connection.serial {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name, detect_ports(), config));
    }

    let ports = detect_ports();
    if ports.is_empty() {
        return Err(defyflash::Error::DeviceNotFound.into());
    }

    let candidates = candidate_ports(ports, options.list_all_ports, config);

    if options.non_interactive {
        return select_non_interactive_port(candidates, config);
    }

    match candidates.as_slice() {
        [] => Err(defyflash::Error::DeviceNotFound.into()),
        [single] => {
            let port = single.clone();
            let is_known = is_known_device(&port, config);
            if is_known && !options.confirm_port {
                info!("Auto-selected port: {} [{}]", port.name, port.device.name());
                Ok(SelectedPort { port, is_known })
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port, is_known)
            }
        },
        _ => {
            ensure_interactive_terminal()?;
            select_port_interactive(candidates, config)
        },
    }
}

/// Narrow `ports` to known devices unless none are present or all are requested.
fn candidate_ports(
    ports: Vec<DetectedPort>,
    list_all_ports: bool,
    config: &Config,
) -> Vec<DetectedPort> {
    if list_all_ports {
        return ports;
    }
    let known: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();
    if known.is_empty() { ports } else { known }
}

fn select_non_interactive_port(
    mut candidates: Vec<DetectedPort>,
    config: &Config,
) -> Result<SelectedPort> {
    match candidates.len() {
        0 => Err(defyflash::Error::DeviceNotFound.into()),
        1 => {
            let port = candidates.remove(0);
            Ok(SelectedPort {
                is_known: is_known_device(&port, config),
                port,
            })
        },
        n => Err(usage_err(&format!(
            "Found {n} candidate ports (multiple matches); pass --port to choose one"
        ))),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal; pass --port instead",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                cancelled_err()
            } else {
                usage_err(&format!("Prompt failed: {io_err}"))
            }
        },
    }
}

/// Resolve a port name against the enumerated ports.
fn find_port_by_name(name: &str, ports: Vec<DetectedPort>, config: &Config) -> SelectedPort {
    let found = ports
        .iter()
        .find(|p| p.name == name)
        .or_else(|| ports.iter().find(|p| p.name.eq_ignore_ascii_case(name)))
        .cloned();

    match found {
        Some(port) => SelectedPort {
            is_known: is_known_device(&port, config),
            port,
        },
        None => SelectedPort {
            port: DetectedPort::unlisted(name),
            is_known: false,
        },
    }
}

/// Check if a port matches a known keyboard or a remembered USB device.
fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port.is_keyboard() {
        return true;
    }

    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config
            .port
            .usb_device
            .iter()
            .any(|device| device.matches(vid, pid)),
        _ => false,
    }
}

/// Display label for a port in the selection list.
fn port_label(port: &DetectedPort, known: bool) -> String {
    let name = if known {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };

    let device_info = if port.device.is_known() {
        format!(" [{}]", style(port.device.name()).yellow())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };

    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{name}{device_info}{product}")
}

/// Interactive port selection.
fn select_port_interactive(mut ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Detected {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );
    eprintln!(
        "{}",
        style("Ports shown in bold are recognized keyboards").dim()
    );

    ports.sort_by_key(|p| !is_known_device(p, config));

    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|port| {
            let label = port_label(port, is_known_device(port, config));
            console::truncate_str(&label, max_item_width, "\u{2026}").into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the keyboard's serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            let is_known = is_known_device(&port, config);
            Ok(SelectedPort { port, is_known })
        },
        None => Err(cancelled_err()),
    }
}

/// Confirm use of a single port.
fn confirm_single_port(port: DetectedPort, is_known: bool) -> Result<SelectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}{product_info}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort { port, is_known })
    } else {
        Err(cancelled_err())
    }
}

/// Ask user if they want to remember this port.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if config.port.usb_device.iter().any(|d| d.matches(vid, pid)) {
        return Ok(());
    }
    if !(std::io::stdin().is_terminal() && std::io::stderr().is_terminal()) {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "Remember {vid:04X}:{pid:04X} as a keyboard for auto-detection?"
        ))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Failed to save port configuration: {e}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::config::UsbDevice,
        console::{measure_text_width, truncate_str},
        defyflash::{DeviceKind, PortInfo},
    };

    fn usb_port(name: &str, vid: u16, pid: u16) -> DetectedPort {
        DetectedPort::from(PortInfo {
            name: name.to_string(),
            vid: Some(vid),
            pid: Some(pid),
            manufacturer: None,
            product: None,
            serial_number: None,
        })
    }

    fn cli_error(err: &anyhow::Error) -> Option<&CliError> {
        err.downcast_ref::<CliError>()
    }

    #[test]
    fn test_serial_options_default() {
        let options = SerialOptions::default();
        assert!(options.port.is_none());
        assert!(!options.list_all_ports);
        assert!(!options.non_interactive);
        assert!(!options.confirm_port);
    }

    #[test]
    fn test_truncate_port_label() {
        let port = DetectedPort {
            product: Some("Very Long Product Name That Would Wrap".to_string()),
            ..usb_port("/dev/verylongttyACM0", 0x35EF, 0x0010)
        };
        let label = port_label(&port, true);
        let truncated = truncate_str(&label, 26, "\u{2026}").into_owned();

        assert!(!truncated.contains('\n'));
        assert!(measure_text_width(&truncated) <= 26);
    }

    #[test]
    fn test_is_known_device_builtin() {
        let port = usb_port("/dev/ttyACM0", 0x35EF, 0x0010);
        assert_eq!(port.device, DeviceKind::Defy);
        assert!(is_known_device(&port, &Config::default()));
    }

    #[test]
    fn test_is_known_device_unknown() {
        let port = usb_port("/dev/ttyUSB0", 0x9999, 0x9999);
        assert!(!is_known_device(&port, &Config::default()));
    }

    #[test]
    fn test_is_known_device_from_config() {
        let port = usb_port("/dev/ttyUSB0", 0xABCD, 0x1234);
        let mut config = Config::default();
        config.port.usb_device.push(UsbDevice {
            vid: 0xABCD,
            pid: 0x1234,
        });
        assert!(is_known_device(&port, &config));
    }

    #[test]
    fn test_is_known_device_no_vid_pid() {
        let port = DetectedPort::unlisted("/dev/ttyS0");
        assert!(!is_known_device(&port, &Config::default()));
    }

    #[test]
    fn test_candidate_ports_prefers_known() {
        let ports = vec![
            usb_port("/dev/ttyUSB0", 0x1A86, 0x7523),
            usb_port("/dev/ttyACM0", 0x1209, 0x2201),
        ];
        let config = Config::default();

        let known = candidate_ports(ports.clone(), false, &config);
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].name, "/dev/ttyACM0");

        assert_eq!(candidate_ports(ports, true, &config).len(), 2);
    }

    #[test]
    fn test_candidate_ports_falls_back_to_all() {
        let ports = vec![
            usb_port("/dev/ttyUSB0", 0x1A86, 0x7523),
            DetectedPort::unlisted("/dev/ttyS0"),
        ];
        assert_eq!(candidate_ports(ports, false, &Config::default()).len(), 2);
    }

    #[test]
    fn test_find_port_by_name() {
        let ports = vec![usb_port("COM3", 0x35EF, 0x0010)];
        let config = Config::default();

        let exact = find_port_by_name("COM3", ports.clone(), &config);
        assert!(exact.is_known);

        let folded = find_port_by_name("com3", ports.clone(), &config);
        assert_eq!(folded.port.name, "COM3");

        let missing = find_port_by_name("/dev/ttyACM9", ports, &config);
        assert_eq!(missing.port.name, "/dev/ttyACM9");
        assert!(!missing.is_known);
    }

    #[test]
    fn test_select_non_interactive_multiple_ports_returns_usage_error() {
        let ports = vec![
            DetectedPort::unlisted("/dev/ttyUSB0"),
            DetectedPort::unlisted("/dev/ttyUSB1"),
        ];

        let err = select_non_interactive_port(ports, &Config::default())
            .err()
            .expect("expected error");
        assert!(matches!(cli_error(&err), Some(CliError::Usage(_))));
        assert!(err.to_string().contains("multiple"));
    }

    #[test]
    fn test_select_non_interactive_no_ports_returns_not_found() {
        let err = select_non_interactive_port(vec![], &Config::default())
            .err()
            .expect("expected error");
        assert!(matches!(
            err.downcast_ref::<defyflash::Error>(),
            Some(defyflash::Error::DeviceNotFound)
        ));
    }

    #[test]
    fn test_select_non_interactive_single_port_returns_selected_port() {
        let ports = vec![DetectedPort::unlisted("/dev/ttyUSB0")];
        let selected = select_non_interactive_port(ports, &Config::default()).unwrap();
        assert_eq!(selected.port.name, "/dev/ttyUSB0");
        assert!(!selected.is_known);
    }

    #[test]
    fn test_explicit_port_skips_detection_order() {
        let options = SerialOptions {
            port: Some("/dev/does-not-exist".to_string()),
            non_interactive: true,
            ..SerialOptions::default()
        };
        let selected = select_serial_port(&options, &Config::default()).unwrap();
        assert_eq!(selected.port.name, "/dev/does-not-exist");
    }
}
