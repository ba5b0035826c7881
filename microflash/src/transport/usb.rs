//! Native USB transport using the `nusb` crate.
//!
//! DAPLink exposes CMSIS-DAP on a vendor-class (0xFF) interface with one IN
//! and one OUT endpoint. Older firmware uses interrupt endpoints and needs
//! full-size reports, newer firmware uses bulk endpoints.

use {
    crate::{
        device::{DeviceFilter, Host, ProbeId, ProbeInfo},
        error::{Error, Result},
        transport::Transport,
    },
    futures_lite::future::block_on,
    log::{debug, trace, warn},
    nusb::{
        DeviceId, DeviceInfo, Interface,
        hotplug::HotplugEvent,
        transfer::{Direction, EndpointType, RequestBuffer},
    },
    std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        thread,
    },
};

/// USB interface class used by the CMSIS-DAP interface.
const VENDOR_CLASS: u8 = 0xFF;

#[derive(Debug, Clone, Copy)]
struct Endpoint {
    address: u8,
    kind: EndpointType,
}

/// CMSIS-DAP interface of an opened probe.
pub struct UsbTransport {
    interface: Option<Interface>,
    in_ep: Endpoint,
    out_ep: Endpoint,
    packet_size: usize,
}

impl UsbTransport {
    /// Open the CMSIS-DAP interface of a device.
    pub fn open(info: &DeviceInfo) -> Result<Self> {
        let interface_number = info
            .interfaces()
            .find(|i| i.class() == VENDOR_CLASS)
            .map(nusb::InterfaceInfo::interface_number)
            .ok_or(Error::NoValidInterfaces)?;

        let device = info.open()?;
        let config = device
            .active_configuration()
            .map_err(|e| Error::Protocol(e.to_string()))?;

        let mut in_ep = None;
        let mut out_ep = None;
        let mut packet_size = 0;
        for alt in config.interface_alt_settings() {
            if alt.interface_number() != interface_number {
                continue;
            }
            for ep in alt.endpoints() {
                if !matches!(
                    ep.transfer_type(),
                    EndpointType::Bulk | EndpointType::Interrupt
                ) {
                    continue;
                }
                let endpoint = Endpoint {
                    address: ep.address(),
                    kind: ep.transfer_type(),
                };
                match ep.direction() {
                    Direction::In => {
                        if in_ep.is_none() {
                            packet_size = ep.max_packet_size();
                            in_ep = Some(endpoint);
                        }
                    },
                    Direction::Out => {
                        if out_ep.is_none() {
                            out_ep = Some(endpoint);
                        }
                    },
                }
            }
            break;
        }

        let (Some(in_ep), Some(out_ep)) = (in_ep, out_ep) else {
            return Err(Error::NoValidInterfaces);
        };

        let interface = device
            .claim_interface(interface_number)
            .map_err(Error::ClaimInterface)?;

        debug!(
            "Opened CMSIS-DAP interface {interface_number} (IN {:#04x}, OUT {:#04x}, {packet_size} byte packets)",
            in_ep.address, out_ep.address
        );

        Ok(Self {
            interface: Some(interface),
            in_ep,
            out_ep,
            packet_size,
        })
    }

    fn interface(&self) -> Result<&Interface> {
        self.interface
            .as_ref()
            .ok_or(Error::DeviceDisconnected)
    }
}

impl Transport for UsbTransport {
    fn packet_size(&self) -> usize {
        self.packet_size
    }

    fn write(&mut self, packet: &[u8]) -> Result<()> {
        let mut data = packet.to_vec();
        let interface = self.interface()?;
        let completion = match self.out_ep.kind {
            EndpointType::Interrupt => {
                if data.len() < self.packet_size {
                    data.resize(self.packet_size, 0);
                }
                block_on(interface.interrupt_out(self.out_ep.address, data))
            },
            _ => block_on(interface.bulk_out(self.out_ep.address, data)),
        };
        completion.into_result()?;

        trace!("USB write {} bytes", packet.len());
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<u8>> {
        let interface = self.interface()?;
        let request = RequestBuffer::new(self.packet_size);
        let completion = match self.in_ep.kind {
            EndpointType::Interrupt => block_on(interface.interrupt_in(self.in_ep.address, request)),
            _ => block_on(interface.bulk_in(self.in_ep.address, request)),
        };
        let data = completion.into_result()?;

        trace!("USB read {} bytes", data.len());
        Ok(data)
    }

    fn close(&mut self) -> Result<()> {
        self.interface = None;
        Ok(())
    }
}

/// Probe access through the operating system's USB stack.
pub struct UsbHost {
    known: Mutex<HashMap<DeviceId, ProbeId>>,
    removed: Arc<Mutex<Vec<DeviceId>>>,
}

impl UsbHost {
    /// Create a host and start watching for unplug events.
    pub fn new() -> Self {
        let removed = Arc::new(Mutex::new(Vec::new()));

        match nusb::watch_devices() {
            Ok(watch) => {
                let removed = Arc::clone(&removed);
                let spawned = thread::Builder::new()
                    .name("microflash-hotplug".to_string())
                    .spawn(move || {
                        for event in futures_lite::stream::block_on(watch) {
                            if let HotplugEvent::Disconnected(id) = event {
                                trace!("USB device removed: {id:?}");
                                if let Ok(mut removed) = removed.lock() {
                                    removed.push(id);
                                }
                            }
                        }
                    });
                if let Err(e) = spawned {
                    warn!("Failed to start hotplug watcher: {e}");
                }
            },
            Err(e) => warn!("Hotplug events unavailable: {e}"),
        }

        Self {
            known: Mutex::new(HashMap::new()),
            removed,
        }
    }

    fn probe_info(info: &DeviceInfo) -> ProbeInfo {
        ProbeInfo {
            id: ProbeId {
                bus: info.bus_number(),
                address: info.device_address(),
            },
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            manufacturer: info
                .manufacturer_string()
                .map(str::to_string),
            product: info
                .product_string()
                .map(str::to_string),
            serial_number: info
                .serial_number()
                .map(str::to_string),
        }
    }
}

impl Default for UsbHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for UsbHost {
    type Transport = UsbTransport;

    fn is_supported(&self) -> bool {
        true
    }

    fn list_probes(&self, filter: &DeviceFilter) -> Result<Vec<ProbeInfo>> {
        let mut probes = Vec::new();
        let mut known = self
            .known
            .lock()
            .map_err(|_| Error::Protocol("device table poisoned".to_string()))?;

        for info in nusb::list_devices()? {
            if !filter.matches(info.vendor_id(), info.product_id()) {
                continue;
            }
            let probe = Self::probe_info(&info);
            trace!(
                "Found probe {} (VID: {:04X}, PID: {:04X})",
                probe.id, probe.vendor_id, probe.product_id
            );
            known.insert(info.id(), probe.id);
            probes.push(probe);
        }

        Ok(probes)
    }

    fn open(&self, probe: &ProbeInfo) -> Result<UsbTransport> {
        let info = nusb::list_devices()?
            .find(|info| {
                info.bus_number() == probe.id.bus && info.device_address() == probe.id.address
            })
            .ok_or(Error::DeviceDisconnected)?;

        if let Ok(mut known) = self.known.lock() {
            known.insert(info.id(), probe.id);
        }
        UsbTransport::open(&info)
    }

    fn removed_probes(&self) -> Vec<ProbeId> {
        let Ok(mut removed) = self.removed.lock() else {
            return Vec::new();
        };
        let Ok(known) = self.known.lock() else {
            return Vec::new();
        };

        removed
            .drain(..)
            .filter_map(|id| known.get(&id).copied())
            .collect()
    }
}
