//! Full flashing through DAPLink.

use {
    crate::{
        board::BoardId,
        error::Result,
        flash::{FlashDataSource, FlashKind, Flasher},
        transport::Transport,
    },
    log::info,
};

impl<T: Transport> Flasher<'_, T> {
    /// Stream the full image to DAPLink.
    pub(crate) fn full_flash(
        &mut self,
        board: BoardId,
        source: &mut dyn FlashDataSource,
        progress: &mut dyn FnMut(f64, FlashKind),
    ) -> Result<()> {
        info!("Full flash");
        let data = source.full_flash_data(board)?;

        self.session
            .dap_mut()
            .flash_image(&data, &mut |p| progress(p, FlashKind::Full))?;

        info!("Full flash successful");
        Ok(())
    }
}
