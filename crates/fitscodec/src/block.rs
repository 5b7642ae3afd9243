use alloc::vec::Vec;

use crate::error::{Error, Result};

/// FITS block size in bytes. Every header and data region is a whole number of blocks.
pub const BLOCK_SIZE: usize = 2880;

/// Size of one physical card record.
pub const CARD_SIZE: usize = 80;

/// Number of card records in a single block.
pub const CARDS_PER_BLOCK: usize = BLOCK_SIZE / CARD_SIZE;

/// Padding byte used for header blocks (ASCII space).
pub const HEADER_PAD_BYTE: u8 = 0x20;

/// Padding byte used for binary data blocks.
pub const DATA_PAD_BYTE: u8 = 0x00;

/// Padding byte used for ASCII-table data blocks.
pub const ASCII_PAD_BYTE: u8 = 0x20;

/// What kind of region is being padded, which decides the fill byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadKind {
    Header,
    Binary,
    AsciiTable,
}

impl PadKind {
    pub const fn byte(self) -> u8 {
        match self {
            PadKind::Header => HEADER_PAD_BYTE,
            PadKind::Binary => DATA_PAD_BYTE,
            PadKind::AsciiTable => ASCII_PAD_BYTE,
        }
    }
}

/// Number of fill bytes needed after `n` bytes to reach the next block boundary.
///
/// Always in `0..BLOCK_SIZE`; zero when `n` is already aligned.
pub const fn pad_len(n: usize) -> usize {
    (BLOCK_SIZE - n % BLOCK_SIZE) % BLOCK_SIZE
}

/// Returns the number of blocks required to hold `num_bytes` bytes.
pub const fn blocks_needed(num_bytes: usize) -> usize {
    num_bytes.div_ceil(BLOCK_SIZE)
}

/// Returns the total byte length (in whole blocks) required to hold `num_bytes`,
/// or `None` when that length does not fit a `usize`.
pub const fn padded_byte_len(num_bytes: usize) -> Option<usize> {
    num_bytes.checked_add(pad_len(num_bytes))
}

/// Extends `buf` in place with the fill byte for `kind` up to the next block boundary.
pub fn pad_in_place(buf: &mut Vec<u8>, kind: PadKind) {
    let fill = pad_len(buf.len());
    buf.resize(buf.len() + fill, kind.byte());
}

/// Fails unless `len` is a whole number of blocks.
pub fn check_aligned(len: usize) -> Result<()> {
    if len % BLOCK_SIZE == 0 {
        Ok(())
    } else {
        Err(Error::BlockAlignmentViolation(len))
    }
}

/// An `(offset, length)` window into the backing store.
///
/// Both ends sit on block boundaries. `data_len` records how many of the
/// region's bytes are meaningful payload; the rest is padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRegion {
    offset: u64,
    len: usize,
    data_len: usize,
}

impl BlockRegion {
    /// Region covering `data_len` payload bytes starting at `offset`.
    pub fn for_payload(offset: u64, data_len: usize) -> Result<Self> {
        if offset % BLOCK_SIZE as u64 != 0 {
            return Err(Error::BlockAlignmentViolation(offset as usize));
        }
        let len = padded_byte_len(data_len).ok_or(Error::InvalidShape("data size overflows"))?;
        u64::try_from(len)
            .ok()
            .and_then(|n| offset.checked_add(n))
            .ok_or(Error::InvalidShape("data extends past the addressable range"))?;
        Ok(BlockRegion {
            offset,
            len,
            data_len,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length including block padding.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Meaningful payload bytes at the start of the region.
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// Offset of the first byte after this region.
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }
}
