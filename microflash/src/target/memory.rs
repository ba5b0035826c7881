//! Target memory access through the MEM-AP.
//!
//! Reads go through DAP_TRANSFER in batches of at most
//! [`MAX_TRANSFER_COUNT`] words. Writes stream through DAP_TRANSFER_BLOCK in
//! chunks sized to the packet.

use {
    crate::{
        error::{Error, Result},
        protocol::cmsis_dap::{MAX_TRANSFER_COUNT, READ, WRITE, ap, ap_reg},
        target::Session,
        transport::Transport,
    },
    byteorder::{ByteOrder, LittleEndian},
    log::{debug, trace},
    std::thread,
};

/// Overhead of a DAP_TRANSFER_BLOCK packet, rounded up to a word.
const BLOCK_OVERHEAD: usize = 8;

impl<T: Transport> Session<T> {
    /// Read one word.
    pub fn read_mem32(&mut self, addr: u32) -> Result<u32> {
        let dap = self.dap_mut();
        dap.write_ap(ap::CSW, ap::CSW_VALUE | ap::CSW_SIZE32)?;
        dap.write_ap(ap::TAR, addr)?;
        dap.read_ap(ap::DRW)
    }

    /// Write one word.
    pub fn write_mem32(&mut self, addr: u32, value: u32) -> Result<()> {
        let dap = self.dap_mut();
        dap.write_ap(ap::CSW, ap::CSW_VALUE | ap::CSW_SIZE32)?;
        dap.write_ap(ap::TAR, addr)?;
        dap.write_ap(ap::DRW, value)
    }

    /// Read `words` words starting at `addr`.
    ///
    /// The read is split at flash page boundaries so TAR auto-increment never
    /// crosses one.
    pub fn read_block(&mut self, addr: u32, words: usize) -> Result<Vec<u8>> {
        let page_size = self.page_size()?;
        if page_size < 4 {
            return Err(Error::Protocol(format!("invalid page size {page_size}")));
        }
        let mut data = Vec::with_capacity(words * 4);
        let mut addr = addr;
        let mut remaining = words;

        while remaining > 0 {
            let to_boundary = ((page_size - addr % page_size) / 4).max(1) as usize;
            let n = remaining.min(to_boundary);
            data.extend(self.read_block_core(addr, n)?);
            addr += (n * 4) as u32;
            remaining -= n;
        }

        Ok(data)
    }

    /// Write `data` starting at `addr`.
    pub fn write_block(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        let chunk_words = (self.dap_mut().packet_size() - BLOCK_OVERHEAD) / 4;
        trace!("Writing {} words at {addr:#010x}", data.len());

        let mut addr = addr;
        for chunk in data.chunks(chunk_words) {
            self.write_block_core(addr, chunk)?;
            addr += (chunk.len() * 4) as u32;
        }

        Ok(())
    }

    /// Write a byte buffer as little-endian words, zero-padding the tail.
    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let words: Vec<u32> = data
            .chunks(4)
            .map(|chunk| {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                LittleEndian::read_u32(&word)
            })
            .collect();
        self.write_block(addr, &words)
    }

    fn read_block_core(&mut self, addr: u32, words: usize) -> Result<Vec<u8>> {
        let dap = self.dap_mut();
        dap.write_ap(ap::CSW, ap::CSW_VALUE | ap::CSW_SIZE32)?;
        dap.write_ap(ap::TAR, addr)?;

        let drw = ap_reg(ap::DRW, READ);
        let mut data = Vec::with_capacity(words * 4);
        let mut remaining = words;
        while remaining > 0 {
            let n = remaining.min(MAX_TRANSFER_COUNT);
            data.extend(dap.read_reg_repeat(drw, n)?);
            remaining -= n;
        }

        Ok(data)
    }

    /// Write one chunk, retrying the whole CSW/TAR/DRW sequence on WAIT.
    ///
    /// TAR has auto-incremented by the time a WAIT is seen, so the address is
    /// set again before each attempt.
    fn write_block_core(&mut self, addr: u32, data: &[u32]) -> Result<()> {
        let timeouts = self.timeouts();
        let drw = ap_reg(ap::DRW, WRITE);

        for attempt in 1..=timeouts.wait_attempts {
            let dap = self.dap_mut();
            dap.write_ap(ap::CSW, ap::CSW_VALUE | ap::CSW_SIZE32)?;
            dap.write_ap(ap::TAR, addr)?;

            match dap.write_reg_repeat(drw, data) {
                Ok(()) => return Ok(()),
                Err(Error::TransferWait) if attempt < timeouts.wait_attempts => {
                    debug!(
                        "Target busy writing {addr:#010x} (attempt {attempt}/{}), retrying",
                        timeouts.wait_attempts
                    );
                    thread::sleep(timeouts.wait_backoff);
                },
                Err(e) => return Err(e),
            }
        }

        Err(Error::TransferWait)
    }
}
