//! On-disk header layouts for image versions 0001 and 0002.
//!
//! Both layouts share the first 34 bytes (magic, a filesystem or version
//! string, and the four-byte image version at offset 30), then diverge
//! completely. Fields are decoded at fixed offsets; there is no alignment or
//! padding beyond what the format itself contains.

use crate::error::ImageError;

/// Total size of the legacy packed header, including the unused 4 KiB
/// options area. The byte bitmap starts right behind it.
pub(crate) const V1_HEADER_SIZE: u64 = 4160;

/// Total size of the version-2 header up to and including its CRC32.
pub(crate) const V2_HEADER_SIZE: u64 = 110;

/// Trailing signature of the version-1 byte bitmap.
pub(crate) const BITMAP_SIGNATURE: &[u8; 8] = b"BiTmAgIc";

const MAGIC: &[u8; 15] = b"partclone-image";

/// Endianness marker written by a same-endian producer.
const ENDIANNESS_COMPATIBLE: u16 = 0xC0DE;
/// Marker seen when the producer ran on the opposite endianness.
const ENDIANNESS_INCOMPATIBLE: u16 = 0xDEC0;

/// Recognized on-disk layout generations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageVersion {
    /// Legacy "0001" images with a byte-per-block bitmap.
    V1,
    /// "0002" images with explicit checksum and bitmap descriptors.
    V2,
}

/// How the presence bitmap is stored on disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BitmapMode {
    /// One bit per block.
    Bit,
    /// One byte per block, terminated by the `BiTmAgIc` signature.
    Byte,
    /// No bitmap at all (every block present). Not served here.
    None,
}

/// Whether checksum records in the data region carry meaning.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChecksumMode {
    /// CRC32 records; their stride must be skipped over, content is not
    /// verified by this server.
    Crc32,
    /// Records are present but garbage (version 1 recomputed the first byte
    /// over and over), or absent entirely.
    Ignored,
}

/// Geometry extracted from a parsed header, before tail inflation.
#[derive(Clone, Debug)]
pub(crate) struct Header {
    pub version: ImageVersion,
    pub device_size: u64,
    pub blocks_count: u64,
    pub used_blocks: u64,
    pub block_size: u32,
    pub checksum_mode: ChecksumMode,
    pub checksum_size: u32,
    pub blocks_per_checksum: u64,
    pub bitmap_mode: BitmapMode,
    pub bitmap_offset: u64,
    pub data_offset: u64,
}

impl Header {
    /// Decodes a header from the first bytes of the image file.
    ///
    /// `buf` holds as much of the file prefix as exists, up to
    /// [`V1_HEADER_SIZE`] bytes. Version 1 needs the whole prefix; version 2
    /// only its 110 bytes.
    pub(crate) fn parse(buf: &[u8]) -> Result<Self, ImageError> {
        if buf.len() < 34 || &buf[..15] != MAGIC {
            return Err(ImageError::BadMagic);
        }

        match &buf[30..34] {
            b"0001" => Self::parse_v1(buf),
            b"0002" => Self::parse_v2(buf),
            other => Err(ImageError::UnsupportedVersion(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    fn parse_v1(buf: &[u8]) -> Result<Self, ImageError> {
        if (buf.len() as u64) < V1_HEADER_SIZE {
            return Err(ImageError::HeaderRead(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "file shorter than a version 1 header",
            )));
        }

        let block_size = read_u32(buf, 36);
        let device_size = read_u64(buf, 40);
        let blocks_count = read_u64(buf, 48);
        let used_blocks = read_u64(buf, 56);

        logging::log_debug!(
            "detected image version 0001, filesystem {:?}",
            latin1_trim(&buf[15..30])
        );

        Ok(Self {
            version: ImageVersion::V1,
            device_size,
            blocks_count,
            used_blocks,
            block_size,
            // Version 1 recomputed the first checksum byte over and over, so
            // the records carry no information. The stride still occupies
            // space: one 4-byte record after every packed block.
            checksum_mode: ChecksumMode::Ignored,
            checksum_size: 4,
            blocks_per_checksum: 1,
            bitmap_mode: BitmapMode::Byte,
            bitmap_offset: V1_HEADER_SIZE,
            data_offset: V1_HEADER_SIZE + blocks_count + BITMAP_SIGNATURE.len() as u64,
        })
    }

    fn parse_v2(buf: &[u8]) -> Result<Self, ImageError> {
        if (buf.len() as u64) < V2_HEADER_SIZE {
            return Err(ImageError::HeaderRead(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "file shorter than a version 2 header",
            )));
        }

        let endianness = read_u16(buf, 34);
        if endianness == ENDIANNESS_INCOMPATIBLE {
            return Err(ImageError::IncompatibleEndianness);
        }
        if endianness != ENDIANNESS_COMPATIBLE {
            logging::log_warning!("unexpected endianness marker {endianness:#06x}");
        }

        let device_size = read_u64(buf, 52);
        let blocks_count = read_u64(buf, 60);
        let used_blocks_bitmap = read_u64(buf, 76);
        let block_size = read_u32(buf, 84);
        let image_version = read_u16(buf, 92);
        let cpu_bits = read_u16(buf, 94);
        let checksum_mode_raw = read_u16(buf, 96);
        let checksum_size = u32::from(read_u16(buf, 98));
        let blocks_per_checksum = u64::from(read_u32(buf, 100));
        let bitmap_mode_raw = buf[105];
        let header_crc = read_u32(buf, 106);

        logging::log_debug!(
            "detected image version 0002 (partclone {:?}, fs {:?}, {cpu_bits}-bit, \
             image version field {image_version}, header crc {header_crc:#010x})",
            latin1_trim(&buf[16..30]),
            latin1_trim(&buf[36..52]),
        );

        let bitmap_mode = match bitmap_mode_raw {
            0x01 => BitmapMode::Bit,
            0x08 => BitmapMode::Byte,
            0x00 => BitmapMode::None,
            other => return Err(ImageError::UnknownBitmapMode(other)),
        };

        // A checksum-less image declares stride 0; serving code divides by
        // the stride, so normalize to "one zero-byte record per block".
        let (checksum_size, blocks_per_checksum) = if blocks_per_checksum == 0 {
            (0, 1)
        } else {
            (checksum_size, blocks_per_checksum)
        };

        let checksum_mode = if checksum_mode_raw == 0x20 && checksum_size > 0 {
            ChecksumMode::Crc32
        } else {
            ChecksumMode::Ignored
        };

        Ok(Self {
            version: ImageVersion::V2,
            device_size,
            blocks_count,
            used_blocks: used_blocks_bitmap,
            block_size,
            checksum_mode,
            checksum_size,
            blocks_per_checksum,
            bitmap_mode,
            bitmap_offset: V2_HEADER_SIZE,
            data_offset: V2_HEADER_SIZE + blocks_count.div_ceil(8) + u64::from(checksum_size),
        })
    }
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(buf[offset..offset + 2].try_into().expect("u16 slice"))
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("u32 slice"))
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().expect("u64 slice"))
}

/// Renders a fixed-width, possibly NUL-padded header string for diagnostics.
fn latin1_trim(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| char::from(b))
        .collect()
}
