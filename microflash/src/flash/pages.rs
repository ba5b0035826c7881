//! Page alignment and change detection for partial flashing.
//!
//! The on-target checksum routine hashes every flash page with a two-lane
//! variant of the MurmurHash3 core. [`murmur3_core`] computes the same hash
//! on the host so unchanged pages can be skipped.

use crate::error::{Error, Result};

/// Fill byte for erased flash.
pub const ERASED: u8 = 0xFF;

/// A page-aligned slice of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Flash address of the first byte.
    pub target_addr: u32,
    /// Exactly one page of data.
    pub data: Vec<u8>,
}

/// Split `buffer`, loaded at `target_addr`, into whole pages.
///
/// Bytes outside the buffer are filled with [`ERASED`].
pub fn page_align_blocks(buffer: &[u8], target_addr: u32, page_size: u32) -> Result<Vec<Page>> {
    if page_size == 0 || !page_size.is_power_of_two() {
        return Err(Error::InvalidArgument(format!(
            "page size {page_size} is not a power of two"
        )));
    }

    let mask = page_size - 1;
    let page_len = page_size as usize;
    let mut pages: Vec<Page> = Vec::new();

    for (offset, &byte) in buffer
        .iter()
        .enumerate()
    {
        let addr = target_addr + offset as u32;
        let base = addr & !mask;
        let index = (addr & mask) as usize;

        match pages.last_mut() {
            Some(page) if page.target_addr == base => page.data[index] = byte,
            _ => {
                let mut data = vec![ERASED; page_len];
                data[index] = byte;
                pages.push(Page {
                    target_addr: base,
                    data,
                });
            },
        }
    }

    Ok(pages)
}

/// Hash a page the way the on-target checksum routine does.
///
/// Trailing bytes that do not fill a word are read as zero.
pub fn murmur3_core(data: &[u8]) -> [u32; 2] {
    let mut h0: u32 = 0x2f9b_e6cc;
    let mut h1: u32 = 0x1ec3_a6c8;

    for chunk in data.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);

        let mut k = u32::from_le_bytes(word);
        k = k.wrapping_mul(0xcc9e_2d51);
        k = k.rotate_left(15);
        k = k.wrapping_mul(0x1b87_3593);

        h0 ^= k;
        h1 ^= k;
        h0 = h0
            .rotate_left(13)
            .wrapping_mul(5)
            .wrapping_add(0xe654_6b64);
        h1 = h1
            .rotate_left(13)
            .wrapping_mul(5)
            .wrapping_add(0xe654_6b64);
    }

    [h0, h1]
}

/// Keep only the pages whose hash differs from the device's checksums.
///
/// `checksums` holds two little-endian words per device page. Pages beyond
/// the end of the table are always kept.
pub fn only_changed(pages: Vec<Page>, checksums: &[u8], page_size: u32) -> Vec<Page> {
    pages
        .into_iter()
        .filter(|page| {
            let idx = (page.target_addr / page_size) as usize;
            let Some(stored) = checksums.get(idx * 8..idx * 8 + 8) else {
                return true;
            };

            let [h0, h1] = murmur3_core(&page.data);
            stored[..4] != h0.to_le_bytes() || stored[4..] != h1.to_le_bytes()
        })
        .collect()
}
