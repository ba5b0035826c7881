//! Device discovery and classification utilities.
//!
//! A [`Host`] enumerates attached CMSIS-DAP probes, opens them as a
//! [`Transport`] and reports unplug events. The native implementation lives
//! in [`crate::transport::usb`]; tests use an in-memory host.

use {
    crate::{
        board::{BoardId, BoardSerialInfo},
        error::Result,
        transport::Transport,
    },
    std::fmt,
};

/// USB vendor ID of the micro:bit DAPLink interface (ARM mbed).
pub const MICROBIT_VENDOR_ID: u16 = 0x0d28;

/// USB product ID of the micro:bit DAPLink interface.
pub const MICROBIT_PRODUCT_ID: u16 = 0x0204;

/// Vendor/product filter applied when enumerating probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    /// Vendor ID to match, or any.
    pub vendor_id: Option<u16>,
    /// Product ID to match, or any.
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    /// The micro:bit DAPLink interface.
    pub const MICROBIT: Self = Self {
        vendor_id: Some(MICROBIT_VENDOR_ID),
        product_id: Some(MICROBIT_PRODUCT_ID),
    };

    /// Check whether a VID/PID pair passes this filter.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vendor_id
            .is_none_or(|v| v == vid)
            && self
                .product_id
                .is_none_or(|p| p == pid)
    }
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self::MICROBIT
    }
}

/// Bus location of an attached probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProbeId {
    /// USB bus number.
    pub bus: u8,
    /// Device address on the bus.
    pub address: u8,
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// Discovered probe information.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProbeInfo {
    /// Bus location.
    pub id: ProbeId,
    /// USB vendor ID.
    pub vendor_id: u16,
    /// USB product ID.
    pub product_id: u16,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// USB serial number (if available).
    pub serial_number: Option<String>,
}

impl ProbeInfo {
    /// Board ID decoded from the serial number, if it carries one.
    pub fn board_id(&self) -> Option<BoardId> {
        let serial = self
            .serial_number
            .as_deref()?;
        BoardSerialInfo::parse(serial, |_| {})
            .ok()
            .map(|info| info.id)
    }

    /// Returns true if this probe looks like a micro:bit.
    pub fn is_microbit(&self) -> bool {
        DeviceFilter::MICROBIT.matches(self.vendor_id, self.product_id)
    }
}

/// Platform access to attached probes.
pub trait Host {
    /// Transport produced by [`Host::open`].
    type Transport: Transport + 'static;

    /// Returns false when the platform has no USB access.
    fn is_supported(&self) -> bool;

    /// List attached probes that pass the filter.
    fn list_probes(&self, filter: &DeviceFilter) -> Result<Vec<ProbeInfo>>;

    /// Open the CMSIS-DAP interface of a probe.
    fn open(&self, probe: &ProbeInfo) -> Result<Self::Transport>;

    /// Drain probes removed since the last call.
    fn removed_probes(&self) -> Vec<ProbeId>;
}

/// Format a list of probes for display.
pub fn format_probe_list(probes: &[ProbeInfo]) -> Vec<String> {
    let mut result = Vec::new();

    for probe in probes {
        let board_info = match probe.board_id() {
            Some(id) => format!(" [micro:bit {} {}]", id.version(), id),
            None => format!(" [VID:{:04X} PID:{:04X}]", probe.vendor_id, probe.product_id),
        };

        let product_info = probe
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();

        let serial_info = probe
            .serial_number
            .as_ref()
            .map(|s| format!(" ({s})"))
            .unwrap_or_default();

        result.push(format!(
            "{}{}{}{}",
            probe.id, board_info, product_info, serial_info
        ));
    }

    result
}
