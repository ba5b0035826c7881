//! # microflash
//!
//! A library for programming BBC micro:bit boards through their DAPLink
//! interface chip.
//!
//! The board is reached over USB using CMSIS-DAP. On top of that link the
//! crate provides:
//!
//! - Board identification from the DAPLink serial number
//! - Target memory access and Cortex-M halt, resume and reset control
//! - Partial flashing that rewrites only changed pages
//! - Full flashing through DAPLink's flash commands
//! - A connection manager with a background serial reader
//! - MicroPython traceback detection in serial output
//!
//! ## Features
//!
//! - `native` (default): USB access through `nusb`
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use microflash::{ConnectOptions, ConnectionOptions, DeviceConnection, UsbHost};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut connection = DeviceConnection::new(UsbHost::new(), ConnectionOptions::default());
//!     let events = connection.subscribe();
//!
//!     // pick the first board when several are attached
//!     connection.connect(ConnectOptions::default(), &mut |probes| probes.first().cloned())?;
//!
//!     for event in events {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod board;
pub mod connection;
pub mod device;
pub mod error;
pub mod flash;
pub mod monitor;
pub mod protocol;
pub mod target;
pub mod transport;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

#[cfg(feature = "native")]
pub use transport::usb::{UsbHost, UsbTransport};
pub use {
    board::{BoardId, BoardSerialInfo, BoardVersion},
    connection::{
        ConnectOptions, ConnectionEvent, ConnectionOptions, ConnectionStatus, DeviceChooser,
        DeviceConnection,
    },
    device::{DeviceFilter, Host, ProbeId, ProbeInfo, format_probe_list},
    error::{DeviceError, DeviceErrorCode, Error, HexGenerationError, Result, error_slug},
    flash::{FlashDataSource, FlashKind, FlashOptions, Flasher},
    monitor::{
        Traceback, TracebackScrollback, clean_monitor_text, drain_utf8_lossy,
        format_monitor_output,
    },
    protocol::{CmsisDap, DapCommand},
    target::{Session, SessionTimeouts},
    transport::Transport,
};
