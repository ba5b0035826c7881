//! Debug session with a micro:bit target.
//!
//! A [`Session`] owns the CMSIS-DAP link to one board and knows the board's
//! flash geometry once the first handshake completed. Memory access lives in
//! [`memory`], core control in [`cortex_m`].

pub mod cortex_m;
pub mod memory;

use {
    crate::{
        board::BoardSerialInfo,
        error::{Error, Result},
        protocol::cmsis_dap::CmsisDap,
        transport::Transport,
    },
    log::{debug, warn},
    std::time::Duration,
};

/// FICR register holding the flash page size in bytes.
pub const FICR_CODEPAGESIZE: u32 = 0x1000_0010;

/// FICR register holding the number of flash pages.
pub const FICR_CODESIZE: u32 = 0x1000_0014;

/// Timing knobs for target operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Upper bound on waiting for the core to halt.
    pub halt: Duration,
    /// Backoff before retrying a memory write answered with WAIT.
    pub wait_backoff: Duration,
    /// Attempts for a memory write answered with WAIT.
    pub wait_attempts: usize,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            halt: Duration::from_secs(10),
            wait_backoff: Duration::from_millis(100),
            wait_attempts: 3,
        }
    }
}

/// An open debug link to one board.
pub struct Session<T: Transport> {
    dap: CmsisDap<T>,
    serial_number: Option<String>,
    serial_info: Option<BoardSerialInfo>,
    page_size: Option<u32>,
    num_pages: Option<u32>,
    initial_connection_complete: bool,
    timeouts: SessionTimeouts,
}

impl<T: Transport> Session<T> {
    /// Create a session over an opened transport.
    ///
    /// # Arguments
    ///
    /// * `transport` - CMSIS-DAP transport of the board.
    /// * `serial_number` - USB serial number of the board.
    pub fn new(transport: T, serial_number: Option<String>) -> Self {
        Self {
            dap: CmsisDap::new(transport),
            serial_number,
            serial_info: None,
            page_size: None,
            num_pages: None,
            initial_connection_complete: false,
            timeouts: SessionTimeouts::default(),
        }
    }

    /// Override the timing knobs.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Timing knobs in use.
    pub fn timeouts(&self) -> SessionTimeouts {
        self.timeouts
    }

    /// (Re)establish the debug link.
    ///
    /// The first call performs the handshake. Later calls release the debug
    /// port first. The board identity and flash geometry are refreshed each
    /// time.
    pub fn reconnect(&mut self) -> Result<()> {
        if self.initial_connection_complete {
            self.dap
                .disconnect()?;
        } else {
            self.initial_connection_complete = true;
        }

        self.dap
            .connect()?;

        let serial = self
            .serial_number
            .as_deref()
            .unwrap_or_default();
        let info = BoardSerialInfo::parse(serial, |message| warn!("{message}"))?;
        debug!("Connected to {info}");
        self.serial_info = Some(info);

        let page_size = self.read_mem32(FICR_CODEPAGESIZE)?;
        let num_pages = self.read_mem32(FICR_CODESIZE)?;
        debug!("Flash geometry: {num_pages} pages of {page_size} bytes");
        self.page_size = Some(page_size);
        self.num_pages = Some(num_pages);

        Ok(())
    }

    /// Release the debug port.
    pub fn disconnect(&mut self) -> Result<()> {
        self.dap
            .disconnect()
    }

    /// Release the debug port and close the transport.
    pub fn close(&mut self) -> Result<()> {
        let released = self
            .dap
            .disconnect();
        self.dap
            .close()?;
        released
    }

    /// Flash page size in bytes.
    pub fn page_size(&self) -> Result<u32> {
        self.page_size
            .ok_or(Error::NotConnected("pageSize"))
    }

    /// Number of flash pages.
    pub fn num_pages(&self) -> Result<u32> {
        self.num_pages
            .ok_or(Error::NotConnected("numPages"))
    }

    /// Identity decoded from the USB serial number.
    pub fn board_serial_info(&self) -> Result<&BoardSerialInfo> {
        self.serial_info
            .as_ref()
            .ok_or(Error::NotConnected("boardSerialInfo"))
    }

    /// Get a mutable reference to the CMSIS-DAP link.
    pub fn dap_mut(&mut self) -> &mut CmsisDap<T> {
        &mut self.dap
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::transport::mock::{MockProbe, ProbeState, V2_SERIAL},
    };

    #[test]
    fn test_geometry_fails_before_connect() {
        let session = Session::new(MockProbe::new(ProbeState::shared()), None);

        assert!(matches!(
            session.page_size(),
            Err(Error::NotConnected("pageSize"))
        ));
        assert!(matches!(
            session.num_pages(),
            Err(Error::NotConnected("numPages"))
        ));
        assert!(session
            .board_serial_info()
            .is_err());
    }

    #[test]
    fn test_reconnect_reads_geometry() {
        let state = ProbeState::shared();
        let mut session = Session::new(
            MockProbe::new(state.clone()),
            Some(V2_SERIAL.to_string()),
        );

        session
            .reconnect()
            .unwrap();
        assert_eq!(session.page_size().unwrap(), 256);
        assert_eq!(session.num_pages().unwrap(), 16);
        assert_eq!(
            session
                .board_serial_info()
                .unwrap()
                .id
                .id(),
            0x9904
        );

        session
            .reconnect()
            .unwrap();
        let state = state
            .lock()
            .unwrap();
        assert_eq!(state.dap_connects, 2);
        assert_eq!(state.dap_disconnects, 1);
    }

    #[test]
    fn test_reconnect_requires_serial_number() {
        let mut session = Session::new(MockProbe::new(ProbeState::shared()), None);
        assert!(matches!(
            session.reconnect(),
            Err(Error::InvalidSerialNumber(_))
        ));
    }
}
