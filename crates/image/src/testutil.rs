//! Synthetic image builders for the unit tests.
//!
//! The generated files are real on-disk layouts: a loader bug shows up here
//! before any protocol test gets involved. Data blocks are filled with a
//! recognizable per-block pattern so cursor tests can assert on content.

use std::io::Write;

use tempfile::NamedTempFile;

use crate::header::{V1_HEADER_SIZE, V2_HEADER_SIZE};

/// Description of a synthetic image: one bool per source block.
pub struct SyntheticImage {
    pub block_size: u32,
    pub bitmap: Vec<bool>,
    pub blocks_per_checksum: u64,
    pub checksum_size: u32,
    /// Overrides the natural `blocks * block_size` device size.
    pub device_size: Option<u64>,
}

impl SyntheticImage {
    pub fn device_size(&self) -> u64 {
        self.device_size
            .unwrap_or(self.bitmap.len() as u64 * u64::from(self.block_size))
    }

    fn used_blocks(&self) -> u64 {
        self.bitmap.iter().filter(|&&b| b).count() as u64
    }

    /// The bytes of the packed data region: used blocks in bitmap order,
    /// interleaved with zero-filled checksum records every
    /// `blocks_per_checksum` packed blocks.
    pub fn data_region(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut packed = 0_u64;
        for (block, &present) in self.bitmap.iter().enumerate() {
            if !present {
                continue;
            }
            out.extend(block_payload(block as u64, self.block_size));
            packed += 1;
            if packed % self.blocks_per_checksum == 0 {
                out.extend(vec![0_u8; self.checksum_size as usize]);
            }
        }
        out
    }
}

/// Deterministic content of one stored block.
pub fn block_payload(block: u64, block_size: u32) -> Vec<u8> {
    (0..block_size)
        .map(|i| (block as u8).wrapping_mul(16).wrapping_add(i as u8 + 1))
        .collect()
}

/// Writes a version-2 (bit bitmap) image. Returns the file and its data
/// region offset.
pub fn v2_image(spec: &SyntheticImage) -> (NamedTempFile, u64) {
    let blocks = spec.bitmap.len() as u64;
    let mut header = vec![0_u8; V2_HEADER_SIZE as usize];
    header[..16].copy_from_slice(b"partclone-image\0");
    header[16..20].copy_from_slice(b"3.20");
    header[30..34].copy_from_slice(b"0002");
    header[34..36].copy_from_slice(&0xC0DE_u16.to_le_bytes());
    header[36..40].copy_from_slice(b"ext4");
    header[52..60].copy_from_slice(&spec.device_size().to_le_bytes());
    header[60..68].copy_from_slice(&blocks.to_le_bytes());
    header[68..76].copy_from_slice(&spec.used_blocks().to_le_bytes());
    header[76..84].copy_from_slice(&spec.used_blocks().to_le_bytes());
    header[84..88].copy_from_slice(&spec.block_size.to_le_bytes());
    header[96..98].copy_from_slice(&0x20_u16.to_le_bytes());
    header[98..100].copy_from_slice(&(spec.checksum_size as u16).to_le_bytes());
    header[100..104].copy_from_slice(&(spec.blocks_per_checksum as u32).to_le_bytes());
    header[105] = 0x01;

    let mut bitmap_bytes = vec![0_u8; blocks.div_ceil(8) as usize];
    for (block, &present) in spec.bitmap.iter().enumerate() {
        if present {
            bitmap_bytes[block / 8] |= 1 << (block % 8);
        }
    }

    let data_offset = V2_HEADER_SIZE + bitmap_bytes.len() as u64 + u64::from(spec.checksum_size);

    let mut file = NamedTempFile::new().expect("create image file");
    file.write_all(&header).expect("write header");
    file.write_all(&bitmap_bytes).expect("write bitmap");
    file.write_all(&vec![0_u8; spec.checksum_size as usize])
        .expect("write bitmap checksum");
    file.write_all(&spec.data_region()).expect("write data");
    file.flush().expect("flush image");

    (file, data_offset)
}

/// Writes a version-1 (byte bitmap) image. Returns the file and its data
/// region offset. The checksum stride is fixed by the format: one 4-byte
/// record per packed block.
pub fn v1_image(spec: &SyntheticImage) -> (NamedTempFile, u64) {
    assert_eq!(spec.blocks_per_checksum, 1, "v1 stride is one block");
    assert_eq!(spec.checksum_size, 4, "v1 records are CRC32-sized");

    let blocks = spec.bitmap.len() as u64;
    let mut header = vec![0_u8; V1_HEADER_SIZE as usize];
    header[..15].copy_from_slice(b"partclone-image");
    header[15..19].copy_from_slice(b"ext4");
    header[30..34].copy_from_slice(b"0001");
    header[36..40].copy_from_slice(&spec.block_size.to_le_bytes());
    header[40..48].copy_from_slice(&spec.device_size().to_le_bytes());
    header[48..56].copy_from_slice(&blocks.to_le_bytes());
    header[56..64].copy_from_slice(&spec.used_blocks().to_le_bytes());

    let bytemap: Vec<u8> = spec.bitmap.iter().map(|&b| u8::from(b)).collect();
    let data_offset = V1_HEADER_SIZE + blocks + 8;

    let mut file = NamedTempFile::new().expect("create image file");
    file.write_all(&header).expect("write header");
    file.write_all(&bytemap).expect("write bytemap");
    file.write_all(b"BiTmAgIc").expect("write bitmap signature");
    file.write_all(&spec.data_region()).expect("write data");
    file.flush().expect("flush image");

    (file, data_offset)
}
