//! Per-connection cursor over the packed data region.
//!
//! The cursor tracks a logical position (block number, intra-block byte)
//! together with the matching physical position of its private file handle.
//! While the current block is present in the image, the file offset always
//! points at the byte following the logical position; while it is absent the
//! file offset is parked where the next present block's data will start, so
//! a later advance lands correctly without re-ranking.
//!
//! Sequential service is the dominant pattern for a block device, so
//! [`Cursor::advance`] is O(1): it never recomputes a rank, it only skips
//! the rest of the current block plus a checksum record when one intervenes.
//! Random access pays one rank query in [`Cursor::set_block`].

use std::fs::File;
use std::io::{Read, Seek};
use std::sync::Arc;

use crate::error::ImageError;
use crate::image::Image;
use crate::io::{seek_by, seek_to};

/// Mutable read position bound to one connection.
pub struct Cursor {
    image: Arc<Image>,
    file: File,
    /// Current source-device block.
    num: u64,
    /// Residency bit of `num`.
    present: bool,
    /// Rank of `num`: present blocks strictly before it.
    blocks_set: u64,
    /// Unread bytes of `num` from the current position.
    remaining: u32,
}

impl Cursor {
    /// Opens a private descriptor on the image and positions it at block 0.
    pub fn new(image: Arc<Image>) -> Result<Self, ImageError> {
        let mut file = File::open(image.path()).map_err(|source| ImageError::Open {
            path: image.path().to_path_buf(),
            source,
        })?;
        seek_to(&mut file, image.data_offset())?;

        let present = image.present(0);
        let remaining = image.block_size();
        Ok(Self {
            image,
            file,
            num: 0,
            present,
            blocks_set: 0,
            remaining,
        })
    }

    /// Current block number.
    pub fn block(&self) -> u64 {
        self.num
    }

    /// Whether the current block is stored in the image.
    pub fn present(&self) -> bool {
        self.present
    }

    /// Unread bytes left in the current block.
    pub fn remaining_bytes(&self) -> u32 {
        self.remaining
    }

    /// Rank of the current block.
    pub fn rank(&self) -> u64 {
        self.blocks_set
    }

    /// Positions the cursor at the start of `block`.
    ///
    /// Three cases, cheapest first: already there (rewind within the block),
    /// the immediate successor (O(1) advance), anywhere else (one rank
    /// query).
    pub fn set_block(&mut self, block: u64) -> Result<(), ImageError> {
        if block == self.num + 1 {
            self.advance()
        } else if block == self.num {
            self.seek_within_current_block(0)
        } else {
            self.seek_from_scratch(block)
        }
    }

    /// Moves to the next block without consulting the rank cache.
    ///
    /// If the outgoing block was present, the file offset must skip its
    /// unread bytes, plus one checksum record when the block completed a
    /// checksum group (the boundary test uses the count of packed blocks
    /// consumed once the outgoing block is included). An absent outgoing
    /// block leaves the file offset untouched.
    pub fn advance(&mut self) -> Result<(), ImageError> {
        let skip = if self.present {
            let consumed = self.blocks_set + 1;
            let crosses = consumed % self.image.blocks_per_checksum() == 0;
            i64::from(self.remaining)
                + if crosses {
                    i64::from(self.image.checksum_size())
                } else {
                    0
                }
        } else {
            0
        };

        self.blocks_set += u64::from(self.present);
        self.num += 1;
        self.present = self.image.present(self.num);
        self.remaining = self.image.block_size();

        seek_by(&mut self.file, skip)
    }

    /// Moves to byte `offset` inside the current block.
    ///
    /// While the block is present the file offset follows along, rewinding
    /// when the seek goes backwards. While it is absent the descriptor must
    /// stay parked at the next present block's packed data, so only the
    /// byte counter moves.
    pub fn seek_within_current_block(&mut self, offset: u32) -> Result<(), ImageError> {
        let new_remaining = self.image.block_size() - offset;
        if self.present {
            let delta = i64::from(self.remaining) - i64::from(new_remaining);
            seek_by(&mut self.file, delta)?;
        }
        self.remaining = new_remaining;
        Ok(())
    }

    /// Repositions on an arbitrary block, paying one rank query.
    ///
    /// The file offset is computed from the rank even when the target block
    /// is absent, so that subsequent advances land on the right data once a
    /// present block is reached.
    fn seek_from_scratch(&mut self, block: u64) -> Result<(), ImageError> {
        self.num = block;
        self.remaining = self.image.block_size();
        self.present = self.image.present(block);
        self.blocks_set = self.image.rank(block);

        let offset = self.image.packed_offset(self.blocks_set);
        seek_to(&mut self.file, offset)
    }

    /// Reads `buf.len()` bytes of the current block's stored data, advancing
    /// the file offset (the caller accounts for them via [`Self::consume`]).
    ///
    /// Must only be called while [`Self::present`] is true and `buf` is no
    /// longer than [`Self::remaining_bytes`].
    pub fn read_data(&mut self, buf: &mut [u8]) -> Result<(), ImageError> {
        debug_assert!(self.present);
        debug_assert!(buf.len() <= self.remaining as usize);
        self.file.read_exact(buf).map_err(ImageError::DataRead)
    }

    /// Records that `bytes` of the current block were consumed outside
    /// [`Self::read_data`] (for example by a zero-copy send from the
    /// descriptor).
    pub fn consume(&mut self, bytes: u32) {
        debug_assert!(bytes <= self.remaining);
        self.remaining -= bytes;
    }

    /// The underlying descriptor, for zero-copy transfers. The file offset
    /// belongs to the cursor: callers must account for any bytes they move
    /// with [`Self::consume`].
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Current absolute file offset, for diagnostics and invariant checks.
    pub fn position(&mut self) -> Result<u64, ImageError> {
        self.file.stream_position().map_err(|source| ImageError::Seek {
            offset: 0,
            source,
        })
    }
}
