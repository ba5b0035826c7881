//! Probe listing.

use {
    crate::config::Config,
    anyhow::{Context, Result},
    console::style,
    microflash::{BoardSerialInfo, Host, ProbeInfo, UsbHost},
};

/// List probes command implementation.
pub(crate) fn cmd_list(config: &Config, json: bool) -> Result<()> {
    let probes = UsbHost::new()
        .list_probes(&config.device_filter())
        .context("Failed to enumerate USB devices")?;

    if json {
        let entries: Vec<serde_json::Value> = probes
            .iter()
            .map(probe_json)
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "probes": entries,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Attached micro:bits")
            .bold()
            .underlined()
    );

    if probes.is_empty() {
        eprintln!("  {}", style("(none found)").dim());
        return Ok(());
    }

    for probe in &probes {
        let board = match serial_info(probe) {
            Some(info) => format!(
                " [{} {}]",
                style(format!("micro:bit {}", info.id.version())).yellow(),
                info.id
            ),
            None => String::new(),
        };
        let serial = probe
            .serial_number
            .as_deref()
            .unwrap_or("");

        eprintln!(
            "  {} {}{} {}",
            style("•").green(),
            style(probe.id).cyan(),
            board,
            style(serial).dim()
        );
    }

    Ok(())
}

fn serial_info(probe: &ProbeInfo) -> Option<BoardSerialInfo> {
    let serial = probe
        .serial_number
        .as_deref()?;
    BoardSerialInfo::parse(serial, |_| {}).ok()
}

fn probe_json(probe: &ProbeInfo) -> serde_json::Value {
    let info = serial_info(probe);
    serde_json::json!({
        "id": probe.id.to_string(),
        "vid": probe.vendor_id,
        "pid": probe.product_id,
        "manufacturer": probe.manufacturer,
        "product": probe.product,
        "serial": probe.serial_number,
        "board_id": info.as_ref().map(|i| i.id.to_string()),
        "version": info.as_ref().map(|i| i.id.version().to_string()),
        "family_id": info.as_ref().map(|i| i.family_id.clone()),
        "hic": info.as_ref().map(|i| i.hic.clone()),
    })
}

#[cfg(test)]
mod tests {
    use {super::*, microflash::ProbeId};

    fn probe(serial: Option<&str>) -> ProbeInfo {
        ProbeInfo {
            id: ProbeId { bus: 3, address: 12 },
            vendor_id: 0x0d28,
            product_id: 0x0204,
            manufacturer: None,
            product: None,
            serial_number: serial.map(str::to_string),
        }
    }

    #[test]
    fn test_probe_json_decodes_board() {
        let value = probe_json(&probe(Some("9904360251974e450039900a00000041000000009796990b")));
        assert_eq!(value["id"], "003:012");
        assert_eq!(value["board_id"], "9904");
        assert_eq!(value["version"], "V2");
        assert_eq!(value["hic"], "9796990b");
    }

    #[test]
    fn test_probe_json_without_serial() {
        let value = probe_json(&probe(None));
        assert!(value["board_id"].is_null());
        assert!(value["serial"].is_null());
    }
}
