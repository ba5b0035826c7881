//! Probe selection and connection setup.
//!
//! A probe is picked, in order, by:
//! - `--probe` / `MICROFLASH_PROBE` / the config file (`bus:address` or a
//!   serial number prefix)
//! - being the only micro:bit attached
//! - an interactive prompt (refused in non-interactive mode)

use {
    crate::{Cli, CliError, config::Config},
    anyhow::{Context, Result},
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    microflash::{
        ConnectOptions, ConnectionStatus, DeviceConnection, Host, ProbeInfo, UsbHost,
        format_probe_list,
    },
    std::io::IsTerminal,
};

/// Open a connection to the selected micro:bit.
///
/// Serial is only started when `serial` is set.
pub(crate) fn open_connection(
    cli: &Cli,
    config: &Config,
    serial: bool,
) -> Result<DeviceConnection<UsbHost>> {
    let options = config.connection_options(cli.baud);
    let filter = options.filter;
    let mut connection = DeviceConnection::new(UsbHost::new(), options);
    if connection.status() == ConnectionStatus::NotSupported {
        return Err(CliError::Usage("USB access is not available on this system".to_string()).into());
    }

    let probes = connection
        .host()
        .list_probes(&filter)
        .context("Failed to enumerate USB devices")?;
    debug!("Found {} candidate probe(s)", probes.len());

    let wanted = cli
        .probe
        .as_deref()
        .or(config
            .connection
            .probe
            .as_deref());
    let preselected = match wanted {
        Some(selector) => Some(
            find_probe(&probes, selector)
                .cloned()
                .ok_or_else(|| CliError::Usage(format!("No micro:bit matches '{selector}'")))?,
        ),
        None if probes.is_empty() => {
            return Err(CliError::Usage(
                "No micro:bit found. Connect one with a data USB cable".to_string(),
            )
            .into());
        },
        None => None,
    };

    let mut failure: Option<anyhow::Error> = None;
    let status = {
        let mut chooser = |candidates: &[ProbeInfo]| -> Option<ProbeInfo> {
            if let Some(probe) = &preselected {
                return Some(probe.clone());
            }
            match choose_probe(candidates, cli.non_interactive) {
                Ok(choice) => choice,
                Err(e) => {
                    failure = Some(e);
                    None
                },
            }
        };
        connection.connect(ConnectOptions { serial }, &mut chooser)?
    };

    if let Some(err) = failure {
        return Err(err);
    }
    if status != ConnectionStatus::Connected {
        return Err(CliError::Cancelled("No micro:bit selected".to_string()).into());
    }

    if let Some(board) = connection.board_info() {
        info!("Using {board}");
    }
    Ok(connection)
}

/// Find the probe named by `selector`: `bus:address` or a serial number prefix.
pub(crate) fn find_probe<'a>(probes: &'a [ProbeInfo], selector: &str) -> Option<&'a ProbeInfo> {
    if let Some((bus, address)) = parse_location(selector) {
        return probes
            .iter()
            .find(|p| p.id.bus == bus && p.id.address == address);
    }

    let selector = selector.to_ascii_lowercase();
    probes.iter().find(|p| {
        p.serial_number
            .as_deref()
            .is_some_and(|s| {
                s.to_ascii_lowercase()
                    .starts_with(&selector)
            })
    })
}

fn parse_location(selector: &str) -> Option<(u8, u8)> {
    let (bus, address) = selector.split_once(':')?;
    Some((bus.trim().parse().ok()?, address.trim().parse().ok()?))
}

/// Ask the user to pick one of several probes.
fn choose_probe(probes: &[ProbeInfo], non_interactive: bool) -> Result<Option<ProbeInfo>> {
    if non_interactive {
        return Err(CliError::Usage(format!(
            "Found {} micro:bits (multiple); choose one with --probe",
            probes.len()
        ))
        .into());
    }
    if probes.is_empty() {
        return Ok(None);
    }
    ensure_interactive_terminal()?;

    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let items: Vec<String> = format_probe_list(probes)
        .into_iter()
        .map(|item| {
            console::truncate_str(&item, term_width.saturating_sub(4), "\u{2026}").into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a micro:bit")
        .items(&items)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    Ok(selection.and_then(|index| probes.get(index).cloned()))
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(CliError::Usage(
            "Several micro:bits found and no terminal to ask on; choose one with --probe"
                .to_string(),
        )
        .into())
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => {
            CliError::Cancelled("Selection cancelled".to_string()).into()
        },
        DialoguerError::IO(io_err) => {
            CliError::Usage(format!("Could not show the selection prompt: {io_err}")).into()
        },
    }
}

#[cfg(test)]
mod tests {
    use {super::*, microflash::ProbeId};

    fn probe(bus: u8, address: u8, serial: &str) -> ProbeInfo {
        ProbeInfo {
            id: ProbeId { bus, address },
            vendor_id: 0x0d28,
            product_id: 0x0204,
            manufacturer: Some("ARM".to_string()),
            product: Some("BBC micro:bit CMSIS-DAP".to_string()),
            serial_number: Some(serial.to_string()),
        }
    }

    fn probes() -> Vec<ProbeInfo> {
        vec![
            probe(1, 4, "9904360251974e450039900a00000041000000009796990b"),
            probe(2, 9, "990036020005282046e4a5b8d2c7d1ea00000000e8faa5ef"),
        ]
    }

    #[test]
    fn test_find_probe_by_location() {
        let probes = probes();
        assert_eq!(find_probe(&probes, "2:9").map(|p| p.id.address), Some(9));
        assert_eq!(find_probe(&probes, "001:004").map(|p| p.id.bus), Some(1));
        assert!(find_probe(&probes, "3:1").is_none());
    }

    #[test]
    fn test_find_probe_by_serial_prefix() {
        let probes = probes();
        assert_eq!(find_probe(&probes, "9900").map(|p| p.id.bus), Some(2));
        assert_eq!(find_probe(&probes, "9904360251974E45").map(|p| p.id.bus), Some(1));
        assert!(find_probe(&probes, "1234").is_none());
    }

    #[test]
    fn test_parse_location() {
        assert_eq!(parse_location("1:4"), Some((1, 4)));
        assert_eq!(parse_location(" 001 : 010 "), Some((1, 10)));
        assert_eq!(parse_location("9904"), None);
        assert_eq!(parse_location("a:b"), None);
    }

    #[test]
    fn test_non_interactive_choice_is_usage_error() {
        let err = choose_probe(&probes(), true).unwrap_err();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
        assert!(err
            .to_string()
            .contains("multiple"));
    }
}
