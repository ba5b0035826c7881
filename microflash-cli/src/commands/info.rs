//! Board information command.

use {
    crate::{Cli, config::Config, probe::open_connection},
    anyhow::{Context, Result},
    console::style,
    microflash::{BoardSerialInfo, ProbeInfo},
};

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let mut connection = open_connection(cli, config, false)?;

    let board = connection
        .board_info()
        .cloned()
        .context("Board identity unavailable")?;
    let probe = connection
        .device()
        .cloned()
        .context("No micro:bit selected")?;
    let geometry = connection.flash_geometry();
    connection.disconnect();

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": info_json(&probe, &board, geometry),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!(
        "\n{}",
        style("micro:bit")
            .bold()
            .underlined()
    );
    eprintln!("  {:<12} {}", style("Probe:").dim(), probe.id);
    eprintln!("  {:<12} {} ({})", style("Board ID:").dim(), board.id, board.id.version());
    eprintln!("  {:<12} {}", style("Family:").dim(), board.family_id);
    eprintln!("  {:<12} {}", style("HIC:").dim(), board.hic);
    if let Some((page_size, num_pages)) = geometry {
        eprintln!(
            "  {:<12} {} pages x {} bytes ({} KiB)",
            style("Flash:").dim(),
            num_pages,
            page_size,
            u64::from(page_size) * u64::from(num_pages) / 1024
        );
    }

    Ok(())
}

fn info_json(probe: &ProbeInfo, board: &BoardSerialInfo, geometry: Option<(u32, u32)>) -> serde_json::Value {
    serde_json::json!({
        "probe": probe.id.to_string(),
        "serial": probe.serial_number,
        "board_id": board.id.to_string(),
        "version": board.id.version().to_string(),
        "family_id": board.family_id,
        "hic": board.hic,
        "page_size": geometry.map(|(size, _)| size),
        "num_pages": geometry.map(|(_, pages)| pages),
    })
}
