//! CMSIS-DAP command layer.
//!
//! Every command is a single packet whose first byte is the command id. The
//! probe echoes the id in the first byte of its response, and most commands
//! follow it with a status byte (0 = OK).
//!
//! ## Register transfers
//!
//! ```text
//! DAP_TRANSFER        +------+-------+-------+---------+----------------+
//!   request           | 0x05 | index | count | request | [u32 if write] | ...
//!                     +------+-------+-------+---------+----------------+
//!   response          | 0x05 | count | ack   | [u32 per read]           |
//!                     +------+-------+-------+--------------------------+
//!
//! DAP_TRANSFER_BLOCK  +------+-------+-----------+---------+-------------+
//!   request           | 0x06 | index | count u16 | request | u32 * count |
//!                     +------+-------+-----------+---------+-------------+
//!   response          | 0x06 | count u16 | ack |
//!                     +------+-----------+-----+
//! ```
//!
//! Registers are addressed by a small integer id: 0..=3 for the debug port
//! (DP) and 4..=7 for the access port (AP).

use {
    crate::{
        error::{Error, Result},
        transport::{DEFAULT_PACKET_SIZE, Transport},
    },
    byteorder::{ByteOrder, LittleEndian, WriteBytesExt},
    log::{debug, trace},
    std::{thread, time::Duration},
};

/// CMSIS-DAP command ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DapCommand {
    /// Query probe information.
    Info = 0x00,
    /// Drive the probe status LEDs.
    HostStatus = 0x01,
    /// Select and power the debug port.
    Connect = 0x02,
    /// Release the debug port.
    Disconnect = 0x03,
    /// Idle cycles and WAIT/match retry counts.
    TransferConfigure = 0x04,
    /// Single register transfers.
    Transfer = 0x05,
    /// Repeated transfers to one register.
    TransferBlock = 0x06,
    /// Abort an ongoing transfer.
    TransferAbort = 0x07,
    /// Write the DP ABORT register.
    WriteAbort = 0x08,
    /// Wait on the probe.
    Delay = 0x09,
    /// Vendor-specific target reset.
    ResetTarget = 0x0A,
    /// Drive SWD/JTAG pins directly.
    SwjPins = 0x10,
    /// Set the SWD clock.
    SwjClock = 0x11,
    /// Clock out a raw bit sequence.
    SwjSequence = 0x12,
    /// SWD turnaround and data phase settings.
    SwdConfigure = 0x13,
}

impl DapCommand {
    /// Returns true if byte 1 of the response is a status byte.
    pub fn has_status(self) -> bool {
        !matches!(
            self,
            Self::Info | Self::Connect | Self::Transfer | Self::TransferBlock
        )
    }
}

/// DAP_INFO id for the maximum packet size.
pub const INFO_PACKET_SIZE: u8 = 0xFF;

/// Smallest packet size a probe may report.
pub const MIN_PACKET_SIZE: usize = 64;
/// Largest packet size a probe may report.
pub const MAX_PACKET_SIZE: usize = 512;

/// DAP_CONNECT port selector for SWD.
pub const PORT_SWD: u8 = 1;

/// Transfer acknowledge: OK.
pub const TRANSFER_OK: u8 = 1;
/// Transfer acknowledge: WAIT.
pub const TRANSFER_WAIT: u8 = 2;
/// Transfer acknowledge: FAULT.
pub const TRANSFER_FAULT: u8 = 4;

/// Maximum reads batched into one DAP_TRANSFER command.
pub const MAX_TRANSFER_COUNT: usize = 15;

/// Default SWD clock in Hz.
pub const DEFAULT_CLOCK_HZ: u32 = 10_000_000;

/// Attempts to observe the debug power-up acknowledge.
const MAX_POWER_UP_ATTEMPTS: usize = 100;

/// Delay between power-up polls.
const POWER_UP_POLL_DELAY: Duration = Duration::from_millis(10);

/// Debug port registers and bits.
pub mod dp {
    /// Identification register (read).
    pub const DPIDR: u8 = 0x0;
    /// Abort register (write).
    pub const ABORT: u8 = 0x0;
    /// Control/status register.
    pub const CTRL_STAT: u8 = 0x4;
    /// AP select register.
    pub const SELECT: u8 = 0x8;
    /// Read buffer.
    pub const RDBUFF: u8 = 0xC;

    /// System power-up acknowledge.
    pub const CSYSPWRUPACK: u32 = 1 << 31;
    /// System power-up request.
    pub const CSYSPWRUPREQ: u32 = 1 << 30;
    /// Debug power-up acknowledge.
    pub const CDBGPWRUPACK: u32 = 1 << 29;
    /// Debug power-up request.
    pub const CDBGPWRUPREQ: u32 = 1 << 28;
    /// Enable all byte lanes.
    pub const MASKLANE: u32 = 0x0000_0F00;

    /// Clear sticky compare.
    pub const STKCMPCLR: u32 = 1 << 1;
    /// Clear sticky error.
    pub const STKERRCLR: u32 = 1 << 2;
    /// Clear write data error.
    pub const WDERRCLR: u32 = 1 << 3;
    /// Clear overrun error.
    pub const ORUNERRCLR: u32 = 1 << 4;
}

/// MEM-AP registers and values.
pub mod ap {
    /// Control/status word.
    pub const CSW: u8 = 0x00;
    /// Transfer address.
    pub const TAR: u8 = 0x04;
    /// Data read/write.
    pub const DRW: u8 = 0x0C;
    /// Identification register.
    pub const IDR: u8 = 0xFC;

    /// Debug software access, privileged, auto-increment single.
    pub const CSW_VALUE: u32 = 0x0100_0000 | 0x2000_0000 | 0x0200_0000 | 0x40 | 0x10;
    /// 32-bit access size.
    pub const CSW_SIZE32: u32 = 0x0000_0002;
}

/// Request bit: read.
pub const READ: u8 = 1 << 1;
/// Request bit: write.
pub const WRITE: u8 = 0;
const AP_ACC: u8 = 1 << 0;
const DP_ACC: u8 = 0;

/// Register id of a DP register.
pub fn dp_reg(reg: u8) -> u8 {
    (reg & 0x0c) >> 2
}

/// Register id of an AP register.
pub fn ap_reg(reg: u8, mode: u8) -> u8 {
    let v = reg | mode | AP_ACC;
    4 + ((v & 0x0c) >> 2)
}

/// Encode the transfer request byte for a register id.
pub fn reg_request(reg_id: u8, is_write: bool) -> u8 {
    let mut request = if is_write { WRITE } else { READ };

    if reg_id < 4 {
        request |= DP_ACC;
    } else {
        request |= AP_ACC;
    }

    request | ((reg_id & 3) << 2)
}

/// A CMSIS-DAP probe speaking over a [`Transport`].
pub struct CmsisDap<T: Transport> {
    transport: T,
    packet_size: usize,
    clock_hz: u32,
    ap_bank: Option<u32>,
}

impl<T: Transport> CmsisDap<T> {
    /// Wrap an opened transport.
    pub fn new(transport: T) -> Self {
        let packet_size = match transport.packet_size() {
            0 => DEFAULT_PACKET_SIZE,
            n => n,
        };

        Self {
            transport,
            packet_size,
            clock_hz: DEFAULT_CLOCK_HZ,
            ap_bank: None,
        }
    }

    /// Set the SWD clock used by [`CmsisDap::connect`].
    #[must_use]
    pub fn with_clock(mut self, clock_hz: u32) -> Self {
        self.clock_hz = clock_hz;
        self
    }

    /// Negotiated packet size.
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Get a mutable reference to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Close the underlying transport.
    pub fn close(&mut self) -> Result<()> {
        self.ap_bank = None;
        self.transport
            .close()
    }

    /// Send a raw packet and return the raw response.
    pub fn send(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        trace!("DAP > {packet:02x?}");
        self.transport
            .write(packet)?;
        let response = self
            .transport
            .read()?;
        trace!("DAP < {response:02x?}");
        Ok(response)
    }

    /// Send a command and validate the echoed id and status byte.
    pub fn cmd(&mut self, command: DapCommand, data: &[u8]) -> Result<Vec<u8>> {
        let response = self.vendor_cmd(command as u8, data)?;

        if command.has_status() {
            let status = response
                .get(1)
                .copied()
                .ok_or_else(|| Error::Protocol(format!("{command:?} response truncated")))?;
            if status != 0 {
                return Err(Error::BadStatus {
                    command: command as u8,
                    status,
                });
            }
        }

        Ok(response)
    }

    /// Send a command by id, validating only the echoed id.
    pub fn vendor_cmd(&mut self, op: u8, data: &[u8]) -> Result<Vec<u8>> {
        let mut packet = Vec::with_capacity(data.len() + 1);
        packet.push(op);
        packet.extend_from_slice(data);

        let response = self.send(&packet)?;
        match response.first() {
            Some(&actual) if actual == op => Ok(response),
            Some(&actual) => Err(Error::BadResponse {
                expected: op,
                actual,
            }),
            None => Err(Error::Protocol(format!("empty response to {op:#04x}"))),
        }
    }

    /// Query the probe's maximum packet size.
    pub fn info_packet_size(&mut self) -> Result<usize> {
        let response = self.cmd(DapCommand::Info, &[INFO_PACKET_SIZE])?;
        match response.get(1) {
            Some(2) if response.len() >= 4 => Ok(usize::from(LittleEndian::read_u16(&response[2..4]))),
            Some(1) if response.len() >= 3 => Ok(usize::from(response[2])),
            _ => Ok(0),
        }
    }

    /// Bring up the SWD link and power the debug domain.
    pub fn connect(&mut self) -> Result<()> {
        let reported = self.info_packet_size()?;
        if reported > 0 {
            self.packet_size = reported;
        }
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&self.packet_size) {
            return Err(Error::Protocol(format!(
                "unsupported packet size {}",
                self.packet_size
            )));
        }
        debug!("CMSIS-DAP packet size {}", self.packet_size);

        self.cmd(DapCommand::SwjClock, &self.clock_hz.to_le_bytes())?;

        let response = self.cmd(DapCommand::Connect, &[PORT_SWD])?;
        if response.get(1) != Some(&PORT_SWD) {
            return Err(Error::Protocol("SWD mode not enabled".to_string()));
        }

        // 0 idle cycles, 80 WAIT retries, 0 match retries
        self.cmd(DapCommand::TransferConfigure, &[0, 0x50, 0, 0, 0])?;
        self.cmd(DapCommand::SwdConfigure, &[0])?;
        self.jtag_to_swd()?;

        let idcode = self.read_dp(dp::DPIDR)?;
        debug!("DPIDR {idcode:#010x}");

        self.write_dp(
            dp::ABORT,
            dp::STKCMPCLR | dp::STKERRCLR | dp::WDERRCLR | dp::ORUNERRCLR,
        )?;
        self.write_dp(dp::SELECT, 0)?;
        self.ap_bank = Some(0);

        self.power_up()?;
        self.write_ap(ap::CSW, ap::CSW_VALUE | ap::CSW_SIZE32)?;

        Ok(())
    }

    /// Release the debug port.
    pub fn disconnect(&mut self) -> Result<()> {
        self.ap_bank = None;
        self.cmd(DapCommand::Disconnect, &[])?;
        Ok(())
    }

    /// Clock out `bits` bits of `data`, LSB first.
    pub fn swj_sequence(&mut self, bits: u8, data: &[u8]) -> Result<()> {
        let mut packet = Vec::with_capacity(data.len() + 1);
        packet.push(bits);
        packet.extend_from_slice(data);
        self.cmd(DapCommand::SwjSequence, &packet)?;
        Ok(())
    }

    fn jtag_to_swd(&mut self) -> Result<()> {
        const LINE_RESET: [u8; 7] = [0xFF; 7];

        self.swj_sequence(51, &LINE_RESET)?;
        self.swj_sequence(16, &[0x9E, 0xE7])?;
        self.swj_sequence(51, &LINE_RESET)?;
        self.swj_sequence(8, &[0x00])
    }

    fn power_up(&mut self) -> Result<()> {
        const ACK: u32 = dp::CSYSPWRUPACK | dp::CDBGPWRUPACK;

        self.write_dp(dp::CTRL_STAT, dp::CSYSPWRUPREQ | dp::CDBGPWRUPREQ)?;

        for attempt in 1..=MAX_POWER_UP_ATTEMPTS {
            let status = self.read_dp(dp::CTRL_STAT)?;
            if status & ACK == ACK {
                return self.write_dp(
                    dp::CTRL_STAT,
                    dp::CSYSPWRUPREQ | dp::CDBGPWRUPREQ | dp::MASKLANE,
                );
            }
            trace!("Waiting for debug power-up ({attempt}/{MAX_POWER_UP_ATTEMPTS})");
            thread::sleep(POWER_UP_POLL_DELAY);
        }

        Err(Error::Timeout("debug power-up".to_string()))
    }

    /// Read `count` words from one register in a single DAP_TRANSFER.
    pub fn read_reg_repeat(&mut self, reg_id: u8, count: usize) -> Result<Vec<u8>> {
        if count == 0 || count > MAX_TRANSFER_COUNT {
            return Err(Error::InvalidArgument(format!(
                "{count} reads in one transfer (max {MAX_TRANSFER_COUNT})"
            )));
        }

        let request = reg_request(reg_id, false);
        let mut data = Vec::with_capacity(count + 2);
        data.push(0);
        data.push(count as u8);
        data.extend(std::iter::repeat_n(request, count));

        let response = self.cmd(DapCommand::Transfer, &data)?;
        check_transfer(&response, count)?;

        response
            .get(3..3 + count * 4)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::Protocol("short DAP_TRANSFER response".to_string()))
    }

    /// Write `data` to one register in a single DAP_TRANSFER_BLOCK.
    ///
    /// A WAIT acknowledge is reported as [`Error::TransferWait`]; the caller
    /// decides whether to retry.
    pub fn write_reg_repeat(&mut self, reg_id: u8, data: &[u32]) -> Result<()> {
        let max_words = (self.packet_size - 5) / 4;
        if data.is_empty() || data.len() > max_words {
            return Err(Error::InvalidArgument(format!(
                "{} words in one block (max {max_words})",
                data.len()
            )));
        }

        let mut packet = Vec::with_capacity(4 + data.len() * 4);
        packet.write_u8(0)?;
        packet.write_u16::<LittleEndian>(data.len() as u16)?;
        packet.write_u8(reg_request(reg_id, true))?;
        for word in data {
            packet.write_u32::<LittleEndian>(*word)?;
        }

        let response = self.cmd(DapCommand::TransferBlock, &packet)?;
        match response.get(3) {
            Some(&TRANSFER_OK) => Ok(()),
            Some(&TRANSFER_WAIT) => Err(Error::TransferWait),
            Some(&ack) => Err(Error::TransferFault(ack)),
            None => Err(Error::Protocol("short DAP_TRANSFER_BLOCK response".to_string())),
        }
    }

    /// Read one register.
    pub fn read_reg(&mut self, reg_id: u8) -> Result<u32> {
        let data = self.read_reg_repeat(reg_id, 1)?;
        Ok(LittleEndian::read_u32(&data))
    }

    /// Write one register.
    pub fn write_reg(&mut self, reg_id: u8, value: u32) -> Result<()> {
        let mut data = Vec::with_capacity(7);
        data.write_u8(0)?;
        data.write_u8(1)?;
        data.write_u8(reg_request(reg_id, true))?;
        data.write_u32::<LittleEndian>(value)?;

        let response = self.cmd(DapCommand::Transfer, &data)?;
        check_transfer(&response, 1)
    }

    /// Read a DP register.
    pub fn read_dp(&mut self, reg: u8) -> Result<u32> {
        self.read_reg(dp_reg(reg))
    }

    /// Write a DP register.
    pub fn write_dp(&mut self, reg: u8, value: u32) -> Result<()> {
        self.write_reg(dp_reg(reg), value)
    }

    /// Read an AP register, switching the AP bank if needed.
    pub fn read_ap(&mut self, reg: u8) -> Result<u32> {
        self.select_ap_bank(reg)?;
        self.read_reg(ap_reg(reg, READ))
    }

    /// Write an AP register, switching the AP bank if needed.
    pub fn write_ap(&mut self, reg: u8, value: u32) -> Result<()> {
        self.select_ap_bank(reg)?;
        self.write_reg(ap_reg(reg, WRITE), value)
    }

    fn select_ap_bank(&mut self, reg: u8) -> Result<()> {
        let bank = u32::from(reg & 0xF0);
        if self.ap_bank != Some(bank) {
            self.write_dp(dp::SELECT, bank)?;
            self.ap_bank = Some(bank);
        }
        Ok(())
    }
}

fn check_transfer(response: &[u8], expected: usize) -> Result<()> {
    let (Some(&count), Some(&ack)) = (response.get(1), response.get(2)) else {
        return Err(Error::Protocol("short DAP_TRANSFER response".to_string()));
    };

    match ack {
        TRANSFER_OK => {},
        TRANSFER_WAIT => return Err(Error::TransferWait),
        ack => return Err(Error::TransferFault(ack)),
    }

    if usize::from(count) != expected {
        return Err(Error::TransferCount {
            expected,
            actual: usize::from(count),
        });
    }

    Ok(())
}
