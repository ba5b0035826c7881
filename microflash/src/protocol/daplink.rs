//! DAPLink vendor commands.
//!
//! DAPLink extends CMSIS-DAP with commands in the 0x80 range for the USB
//! serial bridge and for drag-and-drop style flashing of a whole image.
//!
//! ```text
//! FLASH_WRITE  +------+-----+------------------+
//!              | 0x8C | len | data (len bytes) |
//!              +------+-----+------------------+
//! SERIAL_READ  response
//!              +------+-----+------------------+
//!              | 0x83 | len | data (len bytes) |
//!              +------+-----+------------------+
//! ```

use {
    crate::{
        error::{Error, Result},
        protocol::cmsis_dap::CmsisDap,
        transport::Transport,
    },
    byteorder::{ByteOrder, LittleEndian},
    log::{debug, info},
};

/// Read the serial bridge line settings.
pub const SERIAL_READ_SETTINGS: u8 = 0x81;
/// Write the serial bridge line settings.
pub const SERIAL_WRITE_SETTINGS: u8 = 0x82;
/// Read buffered serial data.
pub const SERIAL_READ: u8 = 0x83;
/// Write serial data.
pub const SERIAL_WRITE: u8 = 0x84;
/// Reset the target after a flash session.
pub const FLASH_RESET: u8 = 0x89;
/// Start a flash session.
pub const FLASH_OPEN: u8 = 0x8A;
/// Finish a flash session.
pub const FLASH_CLOSE: u8 = 0x8B;
/// Stream a chunk of the image.
pub const FLASH_WRITE: u8 = 0x8C;

/// Largest image chunk sent per FLASH_WRITE.
pub const FLASH_CHUNK_SIZE: usize = 62;

/// Largest serial payload a one-byte length field can describe.
pub const MAX_SERIAL_CHUNK: usize = 255;

/// DAPLink vendor command status: success.
const DAPLINK_OK: u8 = 0;

impl<T: Transport> CmsisDap<T> {
    /// Program a complete image through the interface chip.
    ///
    /// # Arguments
    ///
    /// * `image` - Hex file or raw binary accepted by DAPLink.
    /// * `progress` - Called with the fraction of the image sent.
    pub fn flash_image(&mut self, image: &[u8], progress: &mut dyn FnMut(f64)) -> Result<()> {
        info!("Flashing {} bytes through DAPLink", image.len());

        self.daplink_status(FLASH_OPEN, &[])?;

        let chunk_size = FLASH_CHUNK_SIZE.min(
            self.packet_size()
                .saturating_sub(2)
                .max(1),
        );
        let total = image.len();
        let mut offset = 0;
        for chunk in image.chunks(chunk_size) {
            let mut data = Vec::with_capacity(chunk.len() + 1);
            data.push(chunk.len() as u8);
            data.extend_from_slice(chunk);
            self.daplink_status(FLASH_WRITE, &data)?;

            offset += chunk.len();
            progress(offset as f64 / total as f64);
        }

        self.daplink_status(FLASH_CLOSE, &[])?;
        progress(1.0);

        self.vendor_cmd(FLASH_RESET, &[])?;
        debug!("DAPLink flash complete");
        Ok(())
    }

    /// Read buffered bytes from the serial bridge. May be empty.
    pub fn serial_read(&mut self) -> Result<Vec<u8>> {
        let response = self.vendor_cmd(SERIAL_READ, &[])?;
        let len = response
            .get(1)
            .copied()
            .map_or(0, usize::from);

        response
            .get(2..2 + len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::Protocol("short serial read response".to_string()))
    }

    /// Send bytes to the target's UART.
    pub fn serial_write(&mut self, data: &[u8]) -> Result<()> {
        let chunk_size = MAX_SERIAL_CHUNK.min(
            self.packet_size()
                .saturating_sub(2)
                .max(1),
        );
        for chunk in data.chunks(chunk_size) {
            let mut packet = Vec::with_capacity(chunk.len() + 1);
            packet.push(chunk.len() as u8);
            packet.extend_from_slice(chunk);
            self.vendor_cmd(SERIAL_WRITE, &packet)?;
        }
        Ok(())
    }

    /// Current serial bridge baud rate.
    pub fn serial_baud_rate(&mut self) -> Result<u32> {
        let response = self.vendor_cmd(SERIAL_READ_SETTINGS, &[])?;
        response
            .get(1..5)
            .map(LittleEndian::read_u32)
            .ok_or_else(|| Error::Protocol("short serial settings response".to_string()))
    }

    /// Set the serial bridge baud rate.
    ///
    /// DAPLink resets the target when the line settings change.
    pub fn set_serial_baud_rate(&mut self, baud: u32) -> Result<()> {
        debug!("Setting serial baud rate to {baud}");
        self.vendor_cmd(SERIAL_WRITE_SETTINGS, &baud.to_le_bytes())?;
        Ok(())
    }

    fn daplink_status(&mut self, op: u8, data: &[u8]) -> Result<()> {
        let response = self.vendor_cmd(op, data)?;
        match response.get(1) {
            Some(&DAPLINK_OK) => Ok(()),
            Some(&status) => Err(Error::BadStatus {
                command: op,
                status,
            }),
            None => Err(Error::Protocol(format!("{op:#04x} response truncated"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::transport::mock::{MockProbe, ProbeState},
    };

    #[test]
    fn test_flash_image_chunks_and_progress() {
        let state = ProbeState::shared();
        let mut dap = CmsisDap::new(MockProbe::new(state.clone()));
        let image: Vec<u8> = (0..200u32)
            .map(|i| i as u8)
            .collect();

        let mut reports = Vec::new();
        dap.flash_image(&image, &mut |p| reports.push(p))
            .unwrap();

        let state = state
            .lock()
            .unwrap();
        assert_eq!(state.full_flashes, vec![image]);
        assert_eq!(state.flash_writes, 4);
        assert_eq!(state.daplink_resets, 1);
        assert_eq!(reports.len(), 5);
        assert!((reports[0] - 62.0 / 200.0).abs() < f64::EPSILON);
        assert!((reports[3] - 1.0).abs() < f64::EPSILON);
        assert!((reports[4] - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_flash_open_failure() {
        let state = ProbeState::shared();
        state
            .lock()
            .unwrap()
            .flash_open_status = 0xFF;
        let mut dap = CmsisDap::new(MockProbe::new(state.clone()));

        let err = dap
            .flash_image(&[1, 2, 3], &mut |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            Error::BadStatus {
                command: FLASH_OPEN,
                status: 0xFF
            }
        ));
        assert!(state
            .lock()
            .unwrap()
            .full_flashes
            .is_empty());
    }

    #[test]
    fn test_serial_round_trip() {
        let state = ProbeState::shared();
        state
            .lock()
            .unwrap()
            .serial_rx
            .push_back(b"hello\r\n".to_vec());
        let mut dap = CmsisDap::new(MockProbe::new(state.clone()));

        assert_eq!(dap.serial_read().unwrap(), b"hello\r\n");
        assert!(dap.serial_read().unwrap().is_empty());

        dap.serial_write(b"print(1)\r")
            .unwrap();
        assert_eq!(state.lock().unwrap().serial_tx, b"print(1)\r");
    }

    #[test]
    fn test_serial_write_fits_length_byte() {
        let state = ProbeState::shared();
        state
            .lock()
            .unwrap()
            .packet_size = 512;
        let mut dap = CmsisDap::new(MockProbe::new(state.clone()));
        let data: Vec<u8> = (0..600u32)
            .map(|i| i as u8)
            .collect();

        dap.serial_write(&data)
            .unwrap();

        let state = state
            .lock()
            .unwrap();
        assert_eq!(state.serial_tx, data);
        assert_eq!(state.serial_writes, 3);
    }

    #[test]
    fn test_serial_baud_rate() {
        let state = ProbeState::shared();
        let mut dap = CmsisDap::new(MockProbe::new(state.clone()));

        assert_eq!(dap.serial_baud_rate().unwrap(), 9600);
        dap.set_serial_baud_rate(115_200)
            .unwrap();
        assert_eq!(dap.serial_baud_rate().unwrap(), 115_200);
        assert_eq!(state.lock().unwrap().baud_writes, 1);
    }
}
