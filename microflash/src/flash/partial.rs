//! Partial flashing through the debug port.
//!
//! Two Thumb routines are loaded into RAM at [`LOAD_ADDR`]:
//!
//! - [`COMPUTE_CHECKSUMS`] hashes every flash page into a table at
//!   [`DATA_ADDR`] (two words per page).
//! - [`FLASH_PAGE_BIN`] erases one page and copies a page from RAM into it.
//!   Its entry point is four bytes in, after a pair of breakpoints that serve
//!   as the return address.
//!
//! Pages are double-buffered: while the core copies one page, the host
//! uploads the next one into the other RAM slot.
//!
//! ```text
//! 0x2000_0000  routine code
//! 0x2000_1000  stack top
//! 0x2000_2000  page slot A / checksum table
//! +page_size   page slot B
//! ```

use {
    crate::{
        board::BoardId,
        error::Result,
        flash::{
            FlashDataSource, FlashKind, Flasher,
            pages::{Page, only_changed, page_align_blocks},
        },
        target::cortex_m::{REG_LR, REG_PC, REG_SP},
        transport::Transport,
    },
    log::{debug, info, warn},
};

/// Where routines are loaded.
pub const LOAD_ADDR: u32 = 0x2000_0000;

/// Initial stack pointer for routines.
pub const STACK_ADDR: u32 = 0x2000_1000;

/// Checksum table and page slots.
pub const DATA_ADDR: u32 = 0x2000_2000;

/// Addresses at or above this (UICR and beyond) are never partially flashed.
pub const PROTECTED_ADDR: u32 = 0x1000_0000;

/// Erase-and-copy routine for one page.
///
/// Entry at `LOAD_ADDR + 4` with r0 = flash address, r1 = RAM address,
/// r2 = word count. Returns to the breakpoint at `LOAD_ADDR`.
pub const FLASH_PAGE_BIN: [u32; 36] = [
    0xbe00be00, 0x2502b5f0, 0x4c204b1f, 0xf3bf511d, 0xf3bf8f6f, 0x25808f4f, 0x002e00ed,
    0x2f00595f, 0x25a1d0fc, 0x515800ed, 0x2d00599d, 0x2500d0fc, 0xf3bf511d, 0xf3bf8f6f,
    0x25808f4f, 0x002e00ed, 0x2f00595f, 0x2501d0fc, 0xf3bf511d, 0xf3bf8f6f, 0x599d8f4f,
    0xd0fc2d00, 0x25002680, 0x00f60092, 0xd1094295, 0x511a2200, 0x8f6ff3bf, 0x8f4ff3bf,
    0x2a00599a, 0xbdf0d0fc, 0x5147594f, 0x2f00599f, 0x3504d0fc, 0x46c0e7ec, 0x4001e000,
    0x00000504,
];

/// Page checksum routine.
///
/// Entry at `LOAD_ADDR + 1` with r0 = output table, r2 = page size,
/// r3 = page count. Ends in a breakpoint.
pub const COMPUTE_CHECKSUMS: [u32; 48] = [
    0x4c27b5f0, 0x44a52680, 0x22009201, 0x91004f25, 0x00769303, 0x24080013, 0x25010019,
    0x40eb4029, 0xd0002900, 0x3c01407b, 0xd1f52c00, 0x468c0091, 0xa9044665, 0x506b3201,
    0xd1eb42b2, 0x089b9b01, 0x23139302, 0x9b03469c, 0xd104429c, 0x2000be2a, 0x449d4b15,
    0x9f00bdf0, 0x4d149e02, 0x49154a14, 0x3e01cf08, 0x2111434b, 0x491341cb, 0x405a434b,
    0x4663405d, 0x230541da, 0x4b10435a, 0x466318d2, 0x230541dd, 0x4b0d435d, 0x2e0018ed,
    0x6002d1e7, 0x9a009b01, 0x18d36045, 0x93003008, 0xe7d23401, 0xfffffbec, 0xedb88320,
    0x00000414, 0x1ec3a6c8, 0x2f9be6cc, 0xcc9e2d51, 0x1b873593, 0xe6546b64,
];

impl<T: Transport> Flasher<'_, T> {
    /// Run the checksum routine and read back the table.
    pub fn flash_checksums(&mut self) -> Result<Vec<u8>> {
        let page_size = self
            .session
            .page_size()?;
        let num_pages = self
            .session
            .num_pages()?;

        self.session
            .execute(
                LOAD_ADDR,
                &COMPUTE_CHECKSUMS,
                STACK_ADDR,
                LOAD_ADDR + 1,
                0xffff_ffff,
                &[DATA_ADDR, 0, page_size, num_pages],
            )?;

        self.session
            .read_block(DATA_ADDR, num_pages as usize * 2)
    }

    /// Partially flash the board, falling back to a full flash.
    pub(crate) fn partial_flash(
        &mut self,
        board: BoardId,
        source: &mut dyn FlashDataSource,
        progress: &mut dyn FnMut(f64, FlashKind),
    ) -> Result<FlashKind> {
        let data = source.partial_flash_data(board)?;
        let checksums = self.flash_checksums()?;
        self.session
            .write_block(LOAD_ADDR, &FLASH_PAGE_BIN)?;

        let page_size = self
            .session
            .page_size()?;
        let pages = page_align_blocks(&data, 0, page_size)?;
        let total = pages.len();
        let changed = only_changed(pages, &checksums, page_size);
        info!("Changed pages: {}/{total}", changed.len());

        let kind = if changed.len() * 2 > total {
            match self.full_flash(board, source, progress) {
                Ok(()) => FlashKind::Full,
                Err(e) => {
                    warn!("Full flash failed, attempting partial flash: {e}");
                    self.partial_flash_core(&changed, progress)?;
                    FlashKind::Partial
                },
            }
        } else {
            match self.partial_flash_core(&changed, progress) {
                Ok(()) => FlashKind::Partial,
                Err(e) => {
                    warn!("Partial flash failed, attempting full flash: {e}");
                    self.full_flash(board, source, progress)?;
                    FlashKind::Full
                },
            }
        };

        // the user can always reset by hand
        if let Err(e) = self
            .session
            .reset(false)
        {
            debug!("Ignoring reset error after flashing: {e}");
        }

        info!("Flashing complete");
        Ok(kind)
    }

    /// Write `pages` one by one, double-buffering through RAM.
    pub fn partial_flash_core(
        &mut self,
        pages: &[Page],
        progress: &mut dyn FnMut(f64, FlashKind),
    ) -> Result<()> {
        let pages: Vec<&Page> = pages
            .iter()
            .filter(|p| p.target_addr < PROTECTED_ADDR)
            .collect();
        info!("Partial flash of {} pages", pages.len());

        let total = pages.len();
        for (i, page) in pages
            .iter()
            .enumerate()
        {
            progress(i as f64 / total as f64, FlashKind::Partial);
            self.partial_flash_page(page, pages.get(i + 1).copied(), i)?;
        }
        progress(1.0, FlashKind::Partial);

        Ok(())
    }

    fn partial_flash_page(&mut self, page: &Page, next: Option<&Page>, index: usize) -> Result<()> {
        let page_size = self
            .session
            .page_size()?;
        let (this_addr, next_addr) = if index & 1 == 1 {
            (DATA_ADDR, DATA_ADDR + page_size)
        } else {
            (DATA_ADDR + page_size, DATA_ADDR)
        };

        // later pages were uploaded while the previous one was copied
        if index == 0 {
            self.session
                .write_bytes(this_addr, &page.data)?;
        }

        self.run_flash(page, this_addr)?;

        if let Some(next) = next {
            self.session
                .write_bytes(next_addr, &next.data)?;
        }

        let timeout = self
            .session
            .timeouts()
            .halt;
        self.session
            .wait_for_halt(timeout)
    }

    /// Start the page-copy routine without waiting for it.
    fn run_flash(&mut self, page: &Page, addr: u32) -> Result<()> {
        let page_size = self
            .session
            .page_size()?;
        debug!("Flashing page {:#010x} from {addr:#010x}", page.target_addr);

        self.session
            .halt(true)?;
        self.session
            .write_core_register(REG_PC, LOAD_ADDR + 4 + 1)?;
        self.session
            .write_core_register(REG_LR, LOAD_ADDR + 1)?;
        self.session
            .write_core_register(REG_SP, STACK_ADDR)?;
        self.session
            .write_core_register(0, page.target_addr)?;
        self.session
            .write_core_register(1, addr)?;
        self.session
            .write_core_register(2, page_size >> 2)?;
        self.session
            .resume()
    }
}
