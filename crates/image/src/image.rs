//! Image loading: header, bitmap and rank cache assembly.

use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::bitmap::{Bitmap, RankCache};
use crate::error::ImageError;
use crate::header::{
    BitmapMode, ChecksumMode, Header, ImageVersion, BITMAP_SIGNATURE, V1_HEADER_SIZE,
};
use crate::io::read_up_to;

/// An immutable, loaded Partclone image.
///
/// Holds the geometry, the word bitmap and the rank cache; shared read-only
/// across all connections. Each connection opens its own descriptor on
/// [`Image::path`] through a [`crate::Cursor`].
#[derive(Debug)]
pub struct Image {
    path: PathBuf,
    version: ImageVersion,
    device_size: u64,
    blocks_count: u64,
    used_blocks: u64,
    block_size: u32,
    checksum_mode: ChecksumMode,
    checksum_size: u32,
    blocks_per_checksum: u64,
    bitmap_offset: u64,
    data_offset: u64,
    bitmap: Bitmap,
    cache: RankCache,
}

impl Image {
    /// Opens and loads an image file.
    ///
    /// `elems_per_cache` is the rank-cache bucket width in bitmap words
    /// (see [`crate::DEFAULT_ELEMS_PER_CACHE`]); larger buckets use less
    /// memory and more per-query work.
    pub fn load(path: impl AsRef<Path>, elems_per_cache: u64) -> Result<Self, ImageError> {
        let path = path.as_ref().to_path_buf();

        let mut file = File::open(&path).map_err(|source| ImageError::Open {
            path: path.clone(),
            source,
        })?;
        logging::log_debug!("image file {} opened", path.display());

        let mut prefix = vec![0_u8; V1_HEADER_SIZE as usize];
        let got = read_up_to(&mut file, &mut prefix).map_err(ImageError::HeaderRead)?;
        let header = Header::parse(&prefix[..got])?;

        if header.block_size == 0 {
            return Err(ImageError::InvalidGeometry("block size is zero"));
        }

        logging::log_debug!("information from header:");
        logging::log_debug!("- device size: {} bytes", header.device_size);
        logging::log_debug!("- blocks count: {}", header.blocks_count);
        logging::log_debug!("- used blocks: {}", header.used_blocks);
        logging::log_debug!("- block size: {} bytes", header.block_size);
        logging::log_debug!("- checksum size: {} bytes", header.checksum_size);
        logging::log_debug!("- blocks per checksum: {}", header.blocks_per_checksum);

        // An NTFS header may declare a device larger than its block grid;
        // the difference is served as absent tail blocks.
        let stored_blocks = header.blocks_count;
        let block_size = u64::from(header.block_size);
        let covered = stored_blocks
            .checked_mul(block_size)
            .ok_or(ImageError::InvalidGeometry("block count overflows"))?;
        let blocks_count = if header.device_size > covered {
            let missing = (header.device_size - covered).div_ceil(block_size);
            logging::log_debug!("padding bitmap with {missing} absent tail blocks");
            stored_blocks + missing
        } else {
            stored_blocks
        };

        let mut words = vec![0_u64; blocks_count.div_ceil(64) as usize];
        match header.bitmap_mode {
            BitmapMode::Byte => load_byte_bitmap(&file, &header, &mut words)?,
            BitmapMode::Bit => load_bit_bitmap(&mut file, &header, &mut words)?,
            BitmapMode::None => return Err(ImageError::UnsupportedBitmapMode),
        }
        clear_tail_bits(&mut words, stored_blocks);

        let bitmap = Bitmap::from_words(words, blocks_count);
        let cache = RankCache::build(&bitmap, elems_per_cache);
        logging::log_debug!(
            "rank cache built: {} buckets of {} words",
            cache.sums().len(),
            cache.words_per_bucket()
        );

        let population = bitmap.count_ones();
        if population != header.used_blocks {
            logging::log_debug!(
                "header reports {} used blocks, bitmap holds {population}",
                header.used_blocks
            );
        }

        logging::log_info!("image loaded");

        Ok(Self {
            path,
            version: header.version,
            device_size: header.device_size,
            blocks_count,
            used_blocks: header.used_blocks,
            block_size: header.block_size,
            checksum_mode: header.checksum_mode,
            checksum_size: header.checksum_size,
            blocks_per_checksum: header.blocks_per_checksum,
            bitmap_offset: header.bitmap_offset,
            data_offset: header.data_offset,
            bitmap,
            cache,
        })
    }

    /// Filesystem path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recognized layout generation.
    pub fn version(&self) -> ImageVersion {
        self.version
    }

    /// Size of the source device in bytes; what the export advertises.
    pub fn device_size(&self) -> u64 {
        self.device_size
    }

    /// Number of represented blocks, including synthetic tail blocks.
    pub fn blocks_count(&self) -> u64 {
        self.blocks_count
    }

    /// Used-block count as recorded in the header.
    pub fn used_blocks(&self) -> u64 {
        self.used_blocks
    }

    /// Bytes per block.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Checksum record handling mode.
    pub fn checksum_mode(&self) -> ChecksumMode {
        self.checksum_mode
    }

    /// Bytes per checksum record in the data region.
    pub fn checksum_size(&self) -> u32 {
        self.checksum_size
    }

    /// Packed blocks between consecutive checksum records.
    pub fn blocks_per_checksum(&self) -> u64 {
        self.blocks_per_checksum
    }

    /// Absolute offset of the on-disk bitmap.
    pub fn bitmap_offset(&self) -> u64 {
        self.bitmap_offset
    }

    /// Absolute offset of the packed data region.
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    /// The presence bitmap.
    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// Residency of one block; out-of-range blocks are absent.
    pub fn present(&self, block: u64) -> bool {
        self.bitmap.get(block)
    }

    /// Number of present blocks before `block`.
    pub fn rank(&self, block: u64) -> u64 {
        self.cache.rank(&self.bitmap, block)
    }

    /// Absolute file offset of the packed block with the given rank,
    /// accounting for the checksum records interleaved before it.
    pub fn packed_offset(&self, rank: u64) -> u64 {
        self.data_offset
            + rank * u64::from(self.block_size)
            + (rank / self.blocks_per_checksum) * u64::from(self.checksum_size)
    }
}

/// Converts the version-1 byte-per-block bitmap, mapped read-only, into
/// bitmap words. The map covers the file prefix through the `BiTmAgIc`
/// signature that terminates the byte array.
fn load_byte_bitmap(file: &File, header: &Header, words: &mut [u64]) -> Result<(), ImageError> {
    let region_len = header.bitmap_offset + header.blocks_count + BITMAP_SIGNATURE.len() as u64;

    let file_len = file
        .metadata()
        .map_err(ImageError::BitmapRead)?
        .len();
    if file_len < region_len {
        return Err(ImageError::BitmapRead(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "file ends inside the byte bitmap",
        )));
    }

    // SAFETY: the image is opened read-only and this server never writes to
    // it; the map is dropped before the function returns.
    let map = unsafe {
        memmap2::MmapOptions::new()
            .len(region_len as usize)
            .map(file)
            .map_err(ImageError::BitmapRead)?
    };
    logging::log_debug!("byte bitmap mapped ({region_len} bytes)");

    let bytes = &map[header.bitmap_offset as usize..];
    let (bytemap, signature) = bytes.split_at(header.blocks_count as usize);
    if signature != &BITMAP_SIGNATURE[..] {
        return Err(ImageError::BadBitmapSignature);
    }

    for (block, &byte) in bytemap.iter().enumerate() {
        if byte != 0 {
            words[block / 64] |= 1_u64 << (block % 64);
        }
    }

    logging::log_debug!("byte bitmap converted to {} words", words.len());
    Ok(())
}

/// Reads the version-2 bit bitmap straight into bitmap words; the on-disk
/// byte order matches little-endian word layout.
fn load_bit_bitmap(file: &mut File, header: &Header, words: &mut [u64]) -> Result<(), ImageError> {
    file.seek(SeekFrom::Start(header.bitmap_offset))
        .map_err(ImageError::BitmapRead)?;

    let mut bytes = vec![0_u8; header.blocks_count.div_ceil(8) as usize];
    let got = read_up_to(file, &mut bytes).map_err(ImageError::BitmapRead)?;
    if got < bytes.len() {
        return Err(ImageError::BitmapRead(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "file ends inside the bit bitmap",
        )));
    }

    for (index, chunk) in bytes.chunks(8).enumerate() {
        let mut raw = [0_u8; 8];
        raw[..chunk.len()].copy_from_slice(chunk);
        words[index] = u64::from_le_bytes(raw);
    }

    logging::log_debug!("bit bitmap loaded ({} bytes)", bytes.len());
    Ok(())
}

/// Zeroes every bitmap bit at positions `>= blocks`: the producer only
/// wrote that many blocks, and synthetic tail blocks must read as absent.
fn clear_tail_bits(words: &mut [u64], blocks: u64) {
    let bit = (blocks % 64) as u32;
    if bit != 0 {
        if let Some(word) = words.get_mut((blocks / 64) as usize) {
            *word &= (1_u64 << bit) - 1;
        }
    }
    for word in words.iter_mut().skip(blocks.div_ceil(64) as usize) {
        *word = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{v1_image, v2_image, SyntheticImage};

    #[test]
    fn loads_v2_bit_image() {
        let spec = SyntheticImage {
            block_size: 4,
            bitmap: vec![false, true, false, true],
            blocks_per_checksum: 2,
            checksum_size: 4,
            device_size: None,
        };
        let (file, expected_data_offset) = v2_image(&spec);
        let image = Image::load(file.path(), 512).expect("load v2 image");

        assert_eq!(image.version(), ImageVersion::V2);
        assert_eq!(image.blocks_count(), 4);
        assert_eq!(image.block_size(), 4);
        assert_eq!(image.device_size(), 16);
        assert_eq!(image.data_offset(), expected_data_offset);
        assert!(!image.present(0));
        assert!(image.present(1));
        assert!(!image.present(2));
        assert!(image.present(3));
        assert_eq!(image.rank(4), 2);
    }

    #[test]
    fn loads_v1_byte_image() {
        let spec = SyntheticImage {
            block_size: 4,
            bitmap: vec![true, false, true],
            blocks_per_checksum: 1,
            checksum_size: 4,
            device_size: None,
        };
        let (file, expected_data_offset) = v1_image(&spec);
        let image = Image::load(file.path(), 512).expect("load v1 image");

        assert_eq!(image.version(), ImageVersion::V1);
        assert_eq!(image.blocks_count(), 3);
        assert_eq!(image.data_offset(), expected_data_offset);
        assert_eq!(image.checksum_mode(), ChecksumMode::Ignored);
        assert_eq!(image.blocks_per_checksum(), 1);
        assert!(image.present(0));
        assert!(!image.present(1));
        assert!(image.present(2));
    }

    #[test]
    fn corrupt_byte_bitmap_signature_is_rejected() {
        let spec = SyntheticImage {
            block_size: 4,
            bitmap: vec![true, false],
            blocks_per_checksum: 1,
            checksum_size: 4,
            device_size: None,
        };
        let (file, _) = v1_image(&spec);

        let mut bytes = std::fs::read(file.path()).expect("read image");
        let sig_at = V1_HEADER_SIZE as usize + 2;
        bytes[sig_at] = b'x';
        std::fs::write(file.path(), &bytes).expect("corrupt image");

        assert!(matches!(
            Image::load(file.path(), 512),
            Err(ImageError::BadBitmapSignature)
        ));
    }

    #[test]
    fn ntfs_style_oversized_device_grows_block_count() {
        let spec = SyntheticImage {
            block_size: 4,
            bitmap: vec![true, true],
            blocks_per_checksum: 1,
            checksum_size: 0,
            device_size: Some(15),
        };
        let (file, _) = v2_image(&spec);
        let image = Image::load(file.path(), 512).expect("load padded image");

        // 2 stored blocks cover 8 bytes; 15 bytes need 2 more blocks.
        assert_eq!(image.blocks_count(), 4);
        assert!(image.present(0));
        assert!(image.present(1));
        assert!(!image.present(2));
        assert!(!image.present(3));
        assert!(image.blocks_count() * u64::from(image.block_size()) >= image.device_size());
    }

    #[test]
    fn missing_file_reports_open_error() {
        let err = Image::load("/nonexistent/partclone.img", 512).unwrap_err();
        assert!(matches!(err, ImageError::Open { .. }));
    }

    #[test]
    fn packed_offset_accounts_for_checksum_stride() {
        let spec = SyntheticImage {
            block_size: 4,
            bitmap: vec![false, true, false, true],
            blocks_per_checksum: 2,
            checksum_size: 4,
            device_size: None,
        };
        let (file, data_offset) = v2_image(&spec);
        let image = Image::load(file.path(), 512).expect("load image");

        assert_eq!(image.packed_offset(0), data_offset);
        assert_eq!(image.packed_offset(1), data_offset + 4);
        // After two packed blocks one checksum record intervenes.
        assert_eq!(image.packed_offset(2), data_offset + 8 + 4);
    }
}
