//! Packet transport to a CMSIS-DAP probe.
//!
//! CMSIS-DAP is strictly request/response: every command packet written is
//! answered by exactly one response packet. The protocol layer is written
//! against the [`Transport`] trait so it can run over native USB or an
//! in-memory probe.
//!
//! ```text
//! +---------------------+
//! |  Flash / Target     |
//! +----------+----------+
//!            |
//! +----------v----------+
//! |  CMSIS-DAP commands |
//! +----------+----------+
//!            |
//! +----------v----------+
//! |  Transport trait    |
//! +----------+----------+
//!            |
//! +----------v----------+
//! |  nusb (native)      |
//! +---------------------+
//! ```

#[cfg(feature = "native")]
pub mod usb;

#[cfg(test)]
pub(crate) mod mock;

use crate::error::Result;

/// Default CMSIS-DAP packet size for full-speed probes.
pub const DEFAULT_PACKET_SIZE: usize = 64;

/// A packet channel to a CMSIS-DAP probe.
pub trait Transport: Send {
    /// Maximum size of a command or response packet.
    fn packet_size(&self) -> usize;

    /// Send one command packet.
    fn write(&mut self, packet: &[u8]) -> Result<()>;

    /// Receive one response packet.
    fn read(&mut self) -> Result<Vec<u8>>;

    /// Release the underlying interface. Further I/O fails.
    fn close(&mut self) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn packet_size(&self) -> usize {
        (**self).packet_size()
    }

    fn write(&mut self, packet: &[u8]) -> Result<()> {
        (**self).write(packet)
    }

    fn read(&mut self) -> Result<Vec<u8>> {
        (**self).read()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}
