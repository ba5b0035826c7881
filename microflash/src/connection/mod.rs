//! Connection lifecycle for one micro:bit.
//!
//! [`DeviceConnection`] ties device selection, the debug [`Session`], the
//! background serial reader and flashing together behind a small status
//! state machine:
//!
//! ```text
//! NotSupported   (no USB access at all)
//! NoAuthorizedDevice <--> NotConnected <--> Connected
//! ```
//!
//! Every fallible public operation goes through one error path: the failure
//! is logged, the connection is torn down to `NotConnected` and the error is
//! returned as a classified [`DeviceError`]. Image generation failures are
//! the exception; they are returned untouched and leave the connection
//! alone.
//!
//! The connection is not internally synchronized. Callers serialize
//! `connect`, `flash` and the rest; only the serial reader runs on its own
//! thread.

pub mod events;
mod serial;

pub use events::ConnectionEvent;

use {
    crate::{
        board::BoardSerialInfo,
        device::{DeviceFilter, Host, ProbeInfo},
        error::{DeviceError, Error, Result, error_slug},
        flash::{FlashDataSource, FlashKind, FlashOptions, Flasher},
        target::{Session, SessionTimeouts},
    },
    events::EventBus,
    log::{debug, error, info, warn},
    serial::SerialReader,
    std::{
        fmt,
        sync::{Arc, Mutex, MutexGuard, mpsc::Receiver},
        time::{Duration, Instant},
    },
};

/// Where a connection stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionStatus {
    /// The host has no USB access.
    NotSupported,
    /// No board has been chosen, or the chosen board went away.
    NoAuthorizedDevice,
    /// A board is known but not connected.
    NotConnected,
    /// Connected, with the serial reader running.
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotSupported => "not supported",
            Self::NoAuthorizedDevice => "no device",
            Self::NotConnected => "not connected",
            Self::Connected => "connected",
        })
    }
}

/// Connection tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Which USB devices count as boards.
    pub filter: DeviceFilter,
    /// Serial bridge baud rate.
    pub baud_rate: u32,
    /// Sleep between serial polls that returned nothing.
    pub serial_poll_interval: Duration,
    /// Flash strategy and pre-flash reset deadline.
    pub flash: FlashOptions,
    /// Target operation timeouts.
    pub session: SessionTimeouts,
    /// How long after a cancelled unload serial is resumed.
    pub resume_delay: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            filter: DeviceFilter::MICROBIT,
            baud_rate: 115_200,
            serial_poll_interval: Duration::from_millis(1),
            flash: FlashOptions::default(),
            session: SessionTimeouts::default(),
            resume_delay: Duration::from_secs(1),
        }
    }
}

impl ConnectionOptions {
    /// Set the device filter.
    #[must_use]
    pub fn with_filter(mut self, filter: DeviceFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Set the serial baud rate.
    #[must_use]
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the idle serial poll interval.
    #[must_use]
    pub fn with_serial_poll_interval(mut self, interval: Duration) -> Self {
        self.serial_poll_interval = interval;
        self
    }

    /// Set the pre-flash reset deadline.
    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.flash.reset_timeout = timeout;
        self
    }

    /// Set the target operation timeouts.
    #[must_use]
    pub fn with_session_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.session = timeouts;
        self
    }

    /// Set the serial resume delay after a cancelled unload.
    #[must_use]
    pub fn with_resume_delay(mut self, delay: Duration) -> Self {
        self.resume_delay = delay;
        self
    }
}

/// Per-call options for [`DeviceConnection::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Start the serial reader once connected.
    pub serial: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self { serial: true }
    }
}

/// Picks a board when there is not exactly one. `None` means the user
/// cancelled.
pub type DeviceChooser<'a> = dyn FnMut(&[ProbeInfo]) -> Option<ProbeInfo> + 'a;

type SharedSession<T> = Arc<Mutex<Session<T>>>;

/// A connection to one micro:bit.
pub struct DeviceConnection<H: Host> {
    host: H,
    options: ConnectionOptions,
    status: ConnectionStatus,
    device: Option<ProbeInfo>,
    session: Option<SharedSession<H::Transport>>,
    serial: Option<SerialReader>,
    events: EventBus,
    logged_serial_info: Option<BoardSerialInfo>,
    unloading: bool,
    visibility_reconnect: bool,
    resume_serial_at: Option<Instant>,
}

impl<H: Host> DeviceConnection<H> {
    /// Create a connection on `host`.
    pub fn new(host: H, options: ConnectionOptions) -> Self {
        let status = if host.is_supported() {
            ConnectionStatus::NoAuthorizedDevice
        } else {
            ConnectionStatus::NotSupported
        };

        Self {
            host,
            options,
            status,
            device: None,
            session: None,
            serial: None,
            events: EventBus::default(),
            logged_serial_info: None,
            unloading: false,
            visibility_reconnect: false,
            resume_serial_at: None,
        }
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// The tracked board, if any.
    pub fn device(&self) -> Option<&ProbeInfo> {
        self.device
            .as_ref()
    }

    /// The host this connection enumerates boards on.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Options in use.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Identity of the board seen on the most recent handshake.
    pub fn board_info(&self) -> Option<&BoardSerialInfo> {
        self.logged_serial_info
            .as_ref()
    }

    /// Flash page size and page count read on the last handshake.
    pub fn flash_geometry(&self) -> Option<(u32, u32)> {
        let session = lock(self.session.as_ref()?).ok()?;
        Some((session.page_size().ok()?, session.num_pages().ok()?))
    }

    /// Receive all future events.
    pub fn subscribe(&self) -> Receiver<ConnectionEvent> {
        self.events
            .subscribe()
    }

    /// Pick up a single already attached board without connecting to it.
    pub fn initialize(&mut self) -> Result<()> {
        if self.status == ConnectionStatus::NotSupported {
            return Ok(());
        }

        if let Some(device) = self.paired_device()? {
            info!("Found micro:bit at {}", device.id);
            self.device = Some(device);
            self.set_status(ConnectionStatus::NotConnected);
        }
        Ok(())
    }

    /// Connect to the tracked board, or to one picked by `chooser`.
    ///
    /// Returns the resulting status; a cancelled choice yields
    /// [`ConnectionStatus::NoAuthorizedDevice`] rather than an error.
    pub fn connect(
        &mut self,
        options: ConnectOptions,
        chooser: &mut DeviceChooser<'_>,
    ) -> Result<ConnectionStatus> {
        self.with_enriched_errors(|this| {
            let status = this.connect_internal(options, Some(chooser))?;
            this.set_status(status);
            Ok(status)
        })
    }

    fn connect_internal(
        &mut self,
        options: ConnectOptions,
        chooser: Option<&mut DeviceChooser<'_>>,
    ) -> Result<ConnectionStatus> {
        if !self
            .host
            .is_supported()
        {
            return Err(Error::Unsupported("USB access is not available".to_string()));
        }

        self.stop_serial();
        let Some(session) = self.ensure_session(chooser)? else {
            return Ok(ConnectionStatus::NoAuthorizedDevice);
        };

        self.handshake(&session)?;
        if options.serial {
            self.start_serial()?;
        }
        Ok(ConnectionStatus::Connected)
    }

    /// Stop serial, release the board and move to `NotConnected`.
    ///
    /// Release failures are only logged.
    pub fn disconnect(&mut self) {
        self.stop_serial();
        if let Some(session) = self
            .session
            .take()
        {
            let released = lock(&session).and_then(|mut s| s.close());
            if let Err(e) = released {
                warn!("Error during disconnection: {e}");
            }
        }
        self.set_status(ConnectionStatus::NotConnected);
        debug!("Disconnection complete");
    }

    /// Program the board.
    ///
    /// Serial is stopped for the duration and restarted afterwards. If the
    /// board is not connected yet it is connected first.
    ///
    /// # Arguments
    ///
    /// * `source` - Supplies the images.
    /// * `partial` - Try a partial flash first.
    /// * `progress` - Called with the completed fraction and the strategy in
    ///   use, and with `None` once flashing finished or failed.
    pub fn flash(
        &mut self,
        source: &mut dyn FlashDataSource,
        partial: bool,
        progress: &mut dyn FnMut(Option<f64>, FlashKind),
    ) -> Result<FlashKind> {
        let mut last_kind = if partial {
            FlashKind::Partial
        } else {
            FlashKind::Full
        };

        let result = self.with_enriched_errors(|this| {
            this.flash_internal(source, partial, &mut |fraction, kind| {
                last_kind = kind;
                progress(Some(fraction), kind);
            })
        });
        progress(None, last_kind);

        match &result {
            Ok(kind) => self
                .events
                .emit(ConnectionEvent::Flash(*kind)),
            Err(Error::HexGeneration(_)) if self.status == ConnectionStatus::Connected => {
                if let Err(e) = self.start_serial() {
                    warn!("Could not restart serial: {e}");
                }
            },
            Err(_) => {},
        }
        result
    }

    fn flash_internal(
        &mut self,
        source: &mut dyn FlashDataSource,
        partial: bool,
        progress: &mut dyn FnMut(f64, FlashKind),
    ) -> Result<FlashKind> {
        debug!("Stopping serial before flash");
        self.stop_serial();

        let session = self
            .ensure_session(None)?
            .ok_or(Error::NoDeviceSelected)?;
        debug!("Reconnecting before flash");
        self.handshake(&session)?;

        let kind = {
            let mut session = lock(&session)?;
            let board = session
                .board_serial_info()?
                .id;
            let options = self
                .options
                .flash
                .with_partial(partial);
            Flasher::new(&mut session, options).flash(board, source, progress)?
        };

        debug!("Reinstating serial after flash");
        self.events
            .emit(ConnectionEvent::SerialReset);
        self.start_serial()?;
        if self.status != ConnectionStatus::Connected {
            self.set_status(ConnectionStatus::Connected);
        }
        Ok(kind)
    }

    /// Send bytes to the board's serial port. Does nothing when not
    /// connected.
    pub fn serial_write(&mut self, data: &[u8]) -> Result<()> {
        self.with_enriched_errors(|this| {
            let Some(session) = &this.session else {
                return Ok(());
            };
            lock(session)?
                .dap_mut()
                .serial_write(data)
        })
    }

    /// Forget the tracked board so the next connect chooses again.
    pub fn clear_device(&mut self) {
        self.stop_serial();
        self.session = None;
        self.device = None;
        self.set_status(ConnectionStatus::NoAuthorizedDevice);
    }

    /// Stop serial and drop all subscribers.
    pub fn dispose(&mut self) {
        self.stop_serial();
        self.events
            .clear();
    }

    /// Apply unplug notifications and run due timers.
    ///
    /// Call this periodically from the thread that owns the connection.
    pub fn poll(&mut self) {
        for id in self
            .host
            .removed_probes()
        {
            if self
                .device
                .as_ref()
                .is_some_and(|d| d.id == id)
            {
                info!("micro:bit {id} removed");
                if let Some(reader) = self
                    .serial
                    .take()
                {
                    reader.stop();
                }
                self.session = None;
                self.device = None;
                self.set_status(ConnectionStatus::NoAuthorizedDevice);
            }
        }

        if self
            .resume_serial_at
            .is_some_and(|at| Instant::now() >= at)
        {
            self.resume_serial_at = None;
            self.unloading = false;
            if self.status == ConnectionStatus::Connected {
                if let Err(e) = self.start_serial() {
                    self.events
                        .emit(ConnectionEvent::SerialError(DeviceError::classify(&e)));
                }
            }
        }
    }

    /// The application is about to exit; release the serial bridge early.
    pub fn handle_unload(&mut self) {
        self.unloading = true;
        self.stop_serial();
    }

    /// The exit did not happen after all. Serial resumes after
    /// `resume_delay` if still connected by then.
    pub fn handle_unload_cancelled(&mut self) {
        self.resume_serial_at = Some(Instant::now() + self.options.resume_delay);
    }

    /// The application was hidden or shown again.
    ///
    /// Hiding disconnects a connected board; showing reconnects it.
    pub fn handle_visibility_change(&mut self, visible: bool) -> Result<()> {
        if visible {
            if self.visibility_reconnect && self.status != ConnectionStatus::Connected {
                self.visibility_reconnect = false;
                if !self.unloading {
                    self.connect(ConnectOptions::default(), &mut |_| None)?;
                }
            }
        } else if !self.unloading && self.status == ConnectionStatus::Connected {
            self.disconnect();
            self.visibility_reconnect = true;
        }
        Ok(())
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        debug!("Device status {status}");
        self.status = status;
        self.visibility_reconnect = false;
        self.events
            .emit(ConnectionEvent::Status(status));
    }

    /// Run `f`, folding failures into a classified error after a full
    /// disconnect.
    fn with_enriched_errors<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        match f(self) {
            Ok(value) => Ok(value),
            Err(err @ Error::HexGeneration(_)) => {
                warn!("Failed to build the flash image: {err}");
                Err(err)
            },
            Err(err) => {
                let classified = DeviceError::classify(&err);
                error!(
                    "Device error {}/{}: {err}",
                    classified
                        .code
                        .as_str(),
                    error_slug(&err.to_string())
                );
                debug!("{err:?}");
                self.disconnect();
                Err(Error::Device(classified))
            },
        }
    }

    /// The single attached board matching the filter, if there is exactly one.
    fn paired_device(&self) -> Result<Option<ProbeInfo>> {
        let mut probes = self
            .host
            .list_probes(&self.options.filter)?;
        Ok(if probes.len() == 1 {
            probes.pop()
        } else {
            None
        })
    }

    fn choose_device(&self, chooser: Option<&mut DeviceChooser<'_>>) -> Result<Option<ProbeInfo>> {
        let probes = self
            .host
            .list_probes(&self.options.filter)?;
        if let [only] = probes.as_slice() {
            return Ok(Some(only.clone()));
        }

        let Some(chooser) = chooser else {
            return Ok(None);
        };
        let choice = chooser(&probes);
        if choice.is_none() {
            info!("No micro:bit selected");
        }
        Ok(choice)
    }

    /// The current session, opening the tracked or chosen board if needed.
    fn ensure_session(
        &mut self,
        chooser: Option<&mut DeviceChooser<'_>>,
    ) -> Result<Option<SharedSession<H::Transport>>> {
        if let Some(session) = &self.session {
            return Ok(Some(Arc::clone(session)));
        }

        let device = match self.device.clone() {
            Some(device) => device,
            None => match self.choose_device(chooser)? {
                Some(device) => device,
                None => return Ok(None),
            },
        };

        debug!("Opening {}", device.id);
        let transport = self
            .host
            .open(&device)?;
        let session = Session::new(transport, device.serial_number.clone())
            .with_timeouts(self.options.session);
        let session = Arc::new(Mutex::new(session));

        self.device = Some(device);
        self.session = Some(Arc::clone(&session));
        Ok(Some(session))
    }

    /// Handshake with the board and note its identity.
    fn handshake(&mut self, session: &SharedSession<H::Transport>) -> Result<()> {
        let info = {
            let mut session = lock(session)?;
            session.reconnect()?;
            session
                .board_serial_info()?
                .clone()
        };

        debug!("Detected board ID {}", info.id);
        if self.logged_serial_info.as_ref() != Some(&info) {
            info!("Connected to micro:bit {} (board-family-hic {}{})", info.id, info.family_id, info.hic);
            self.logged_serial_info = Some(info);
        }
        Ok(())
    }

    fn start_serial(&mut self) -> Result<()> {
        if self.serial.is_some() {
            return Ok(());
        }
        let Some(session) = &self.session else {
            return Ok(());
        };

        {
            let mut session = lock(session)?;
            let dap = session.dap_mut();
            // changing the baud rate resets the board
            if dap.serial_baud_rate()? != self.options.baud_rate {
                dap.set_serial_baud_rate(self.options.baud_rate)?;
            }
        }

        self.serial = Some(SerialReader::spawn(
            Arc::clone(session),
            self.events.clone(),
            self.options.serial_poll_interval,
        )?);
        Ok(())
    }

    fn stop_serial(&mut self) {
        if let Some(reader) = self
            .serial
            .take()
        {
            reader.stop();
            self.events
                .emit(ConnectionEvent::SerialReset);
        }
    }
}

impl<H: Host> Drop for DeviceConnection<H> {
    fn drop(&mut self) {
        if let Some(reader) = self
            .serial
            .take()
        {
            reader.stop();
        }
    }
}

fn lock<T>(session: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    session
        .lock()
        .map_err(|_| Error::Protocol("session lock poisoned".to_string()))
}
