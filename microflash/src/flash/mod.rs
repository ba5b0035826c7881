//! Programming strategies.
//!
//! A partial flash compares per-page checksums computed on the target and
//! rewrites only the pages that changed, using a small page-copy routine
//! loaded into RAM. A full flash streams the complete image to DAPLink.
//! [`Flasher::flash`] picks between them and falls back from one to the
//! other on failure.
//!
//! ## Example
//!
//! ```rust,no_run
//! use microflash::{
//!     BoardId, FlashDataSource, FlashKind, FlashOptions, Flasher, HexGenerationError, Session,
//! };
//!
//! struct Files;
//!
//! impl FlashDataSource for Files {
//!     fn partial_flash_data(&mut self, _: BoardId) -> Result<Vec<u8>, HexGenerationError> {
//!         std::fs::read("app.bin").map_err(|e| HexGenerationError(e.to_string()))
//!     }
//!
//!     fn full_flash_data(&mut self, _: BoardId) -> Result<Vec<u8>, HexGenerationError> {
//!         std::fs::read("app.hex").map_err(|e| HexGenerationError(e.to_string()))
//!     }
//! }
//!
//! fn flash<T: microflash::Transport>(session: &mut Session<T>) -> microflash::Result<FlashKind> {
//!     let board = session.board_serial_info()?.id;
//!     Flasher::new(session, FlashOptions::default()).flash(board, &mut Files, &mut |p, kind| {
//!         println!("{kind:?}: {:.0}%", p * 100.0);
//!     })
//! }
//! ```

pub mod full;
pub mod pages;
pub mod partial;

use {
    crate::{
        board::BoardId,
        error::{HexGenerationError, Result},
        target::Session,
        transport::Transport,
    },
    log::{info, warn},
    std::time::{Duration, Instant},
};

/// Supplies images for a board.
pub trait FlashDataSource {
    /// Raw binary image laid out from flash address 0.
    fn partial_flash_data(&mut self, board: BoardId) -> std::result::Result<Vec<u8>, HexGenerationError>;

    /// Image accepted by DAPLink for a full flash (usually Intel hex).
    fn full_flash_data(&mut self, board: BoardId) -> std::result::Result<Vec<u8>, HexGenerationError>;
}

/// Which strategy actually programmed the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlashKind {
    /// Changed pages only, through the debug port.
    Partial,
    /// Whole image, through DAPLink.
    Full,
}

/// Flash options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashOptions {
    /// Try a partial flash first.
    pub partial: bool,
    /// How long the pre-flash reset may take before giving up on partial.
    pub reset_timeout: Duration,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            partial: true,
            reset_timeout: Duration::from_secs(1),
        }
    }
}

impl FlashOptions {
    /// Enable or disable partial flashing.
    #[must_use]
    pub fn with_partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    /// Set the pre-flash reset deadline.
    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

/// Programs a board over an established [`Session`].
pub struct Flasher<'a, T: Transport> {
    session: &'a mut Session<T>,
    options: FlashOptions,
}

impl<'a, T: Transport> Flasher<'a, T> {
    /// Create a flasher for a connected session.
    pub fn new(session: &'a mut Session<T>, options: FlashOptions) -> Self {
        Self { session, options }
    }

    /// Program the board.
    ///
    /// The debug port is released afterwards whatever the outcome.
    ///
    /// # Arguments
    ///
    /// * `board` - Board ID passed to the data source.
    /// * `source` - Supplies the images.
    /// * `progress` - Called with the completed fraction and the strategy.
    pub fn flash(
        &mut self,
        board: BoardId,
        source: &mut dyn FlashDataSource,
        progress: &mut dyn FnMut(f64, FlashKind),
    ) -> Result<FlashKind> {
        let result = if self.options.partial {
            self.flash_with_reset(board, source, progress)
        } else {
            self.full_flash(board, source, progress)
                .map(|()| FlashKind::Full)
        };

        let released = self
            .session
            .disconnect();
        let kind = result?;
        released?;
        Ok(kind)
    }

    fn flash_with_reset(
        &mut self,
        board: BoardId,
        source: &mut dyn FlashDataSource,
        progress: &mut dyn FnMut(f64, FlashKind),
    ) -> Result<FlashKind> {
        match self.reset_for_flash() {
            Ok(()) => {
                info!("Begin flashing");
                self.partial_flash(board, source, progress)
            },
            Err(e) if e.is_timeout() => {
                warn!("Resetting micro:bit timed out, attempting full flash");
                self.full_flash(board, source, progress)?;
                Ok(FlashKind::Full)
            },
            Err(e) => Err(e),
        }
    }

    /// Reset into a halted state, retrying once after a reconnect.
    fn reset_for_flash(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.options.reset_timeout;
        info!("Begin reset");

        match self
            .session
            .reset_until(true, deadline)
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_timeout() => Err(e),
            Err(e) => {
                warn!("Retrying reset: {e}");
                self.session
                    .reconnect()?;
                self.session
                    .reset_until(true, deadline)
            },
        }
    }
}
