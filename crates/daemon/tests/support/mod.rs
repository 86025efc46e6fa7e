//! Shared fixtures for the end-to-end scenarios: synthetic images on disk
//! and a client side for the NBD wire.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::JoinHandle;

use tempfile::NamedTempFile;

use daemon::{handle_connection, ConnectionError};
use image::Image;

/// Size of the version-1 header including its unused options area.
const V1_HEADER_SIZE: usize = 4160;
/// Size of the version-2 header.
const V2_HEADER_SIZE: usize = 110;

/// One synthetic image: a bool per source block plus checksum geometry.
pub struct ImageSpec {
    pub block_size: u32,
    pub bitmap: Vec<bool>,
    pub blocks_per_checksum: u64,
    pub checksum_size: u32,
}

impl ImageSpec {
    /// The canonical 4-block fixture: blocks 0 and 2 absent, 1 and 3
    /// present, one checksum record after every two packed blocks.
    pub fn sparse_1010() -> Self {
        Self {
            block_size: 4,
            bitmap: vec![false, true, false, true],
            blocks_per_checksum: 2,
            checksum_size: 4,
        }
    }

    pub fn device_size(&self) -> u64 {
        self.bitmap.len() as u64 * u64::from(self.block_size)
    }

    fn used_blocks(&self) -> u64 {
        self.bitmap.iter().filter(|&&b| b).count() as u64
    }

    fn data_region(&self) -> Vec<u8> {
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

    /// The bytes a client must observe for the device range
    /// `[offset, offset + length)`: stored data for present blocks, zeros
    /// for holes.
    pub fn expanded_device(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (block, &present) in self.bitmap.iter().enumerate() {
            if present {
                out.extend(block_payload(block as u64, self.block_size));
            } else {
                out.extend(vec![0_u8; self.block_size as usize]);
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

/// Writes a version-2 (bit bitmap) image file.
pub fn write_v2_image(spec: &ImageSpec) -> NamedTempFile {
    let blocks = spec.bitmap.len() as u64;
    let mut header = vec![0_u8; V2_HEADER_SIZE];
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

    let mut file = NamedTempFile::new().expect("create image file");
    file.write_all(&header).expect("write header");
    file.write_all(&bitmap_bytes).expect("write bitmap");
    file.write_all(&vec![0_u8; spec.checksum_size as usize])
        .expect("write bitmap checksum");
    file.write_all(&spec.data_region()).expect("write data");
    file.flush().expect("flush image");
    file
}

/// Writes a version-1 (byte bitmap) image file; the format fixes the
/// checksum stride at one 4-byte record per packed block.
pub fn write_v1_image(spec: &ImageSpec) -> NamedTempFile {
    assert_eq!(spec.blocks_per_checksum, 1);
    assert_eq!(spec.checksum_size, 4);

    let blocks = spec.bitmap.len() as u64;
    let mut header = vec![0_u8; V1_HEADER_SIZE];
    header[..15].copy_from_slice(b"partclone-image");
    header[15..19].copy_from_slice(b"ext4");
    header[30..34].copy_from_slice(b"0001");
    header[36..40].copy_from_slice(&spec.block_size.to_le_bytes());
    header[40..48].copy_from_slice(&spec.device_size().to_le_bytes());
    header[48..56].copy_from_slice(&blocks.to_le_bytes());
    header[56..64].copy_from_slice(&spec.used_blocks().to_le_bytes());

    let bytemap: Vec<u8> = spec.bitmap.iter().map(|&b| u8::from(b)).collect();

    let mut file = NamedTempFile::new().expect("create image file");
    file.write_all(&header).expect("write header");
    file.write_all(&bytemap).expect("write bytemap");
    file.write_all(b"BiTmAgIc").expect("write signature");
    file.write_all(&spec.data_region()).expect("write data");
    file.flush().expect("flush image");
    file
}

/// A served connection: the client end of the pair plus the worker result.
pub struct ServedConnection {
    pub stream: UnixStream,
    worker: JoinHandle<Result<(), ConnectionError>>,
}

impl ServedConnection {
    /// Closes the client end and returns how the server side finished.
    pub fn finish(self) -> Result<(), ConnectionError> {
        drop(self.stream);
        self.worker.join().expect("server worker panicked")
    }
}

/// Spawns `handle_connection` on one end of a socketpair, exactly the way
/// the TCP accept loop does for a real client.
pub fn serve(image: &Arc<Image>) -> ServedConnection {
    let (client, server) = UnixStream::pair().expect("socketpair");
    let image = Arc::clone(image);
    let worker = std::thread::spawn(move || {
        let mut server = server;
        handle_connection(&mut server, &image)
    });
    ServedConnection {
        stream: client,
        worker,
    }
}

/// Loads a freshly written image file.
pub fn load_image(file: &NamedTempFile) -> Arc<Image> {
    Arc::new(Image::load(file.path(), 512).expect("load synthetic image"))
}

/// Runs the client side of the handshake, asserting the advertised export
/// matches a read-only device of `expected_size` bytes.
pub fn client_handshake(stream: &mut UnixStream, expected_size: u64) {
    let mut greeting = [0_u8; 18];
    stream.read_exact(&mut greeting).expect("read greeting");
    assert_eq!(&greeting[..8], b"NBDMAGIC");
    assert_eq!(greeting[8..16], 0x4948_4156_454F_5054_u64.to_be_bytes());
    assert_eq!(greeting[16..18], [0, 0]);

    stream
        .write_all(&0_u32.to_be_bytes())
        .expect("send client flags");
    stream
        .write_all(&0x4948_4156_454F_5054_u64.to_be_bytes())
        .expect("send option magic");
    stream
        .write_all(&1_u32.to_be_bytes())
        .expect("send EXPORT_NAME");
    stream
        .write_all(&0_u32.to_be_bytes())
        .expect("send empty name length");

    let mut export = [0_u8; 10];
    stream.read_exact(&mut export).expect("read export info");
    assert_eq!(export[..8], expected_size.to_be_bytes());
    assert_eq!(export[8..10], 0x0003_u16.to_be_bytes());

    let mut padding = [0_u8; 124];
    stream.read_exact(&mut padding).expect("read padding");
    assert!(padding.iter().all(|&b| b == 0));
}

/// Sends one 28-byte request frame.
pub fn send_request(stream: &mut UnixStream, kind: u32, handle: u64, offset: u64, length: u32) {
    let mut frame = Vec::with_capacity(28);
    frame.extend(0x2560_9513_u32.to_be_bytes());
    frame.extend(kind.to_be_bytes());
    frame.extend(handle.to_be_bytes());
    frame.extend(offset.to_be_bytes());
    frame.extend(length.to_be_bytes());
    stream.write_all(&frame).expect("send request");
}

/// Reads one reply header, returning `(errno, handle)`.
pub fn read_reply(stream: &mut UnixStream) -> (u32, u64) {
    let mut header = [0_u8; 16];
    stream.read_exact(&mut header).expect("read reply header");
    assert_eq!(
        header[..4],
        0x6744_6698_u32.to_be_bytes(),
        "reply carries the reply magic"
    );
    let errno = u32::from_be_bytes(header[4..8].try_into().expect("errno"));
    let handle = u64::from_be_bytes(header[8..16].try_into().expect("handle"));
    (errno, handle)
}

/// Reads an expected payload of `length` bytes.
pub fn read_payload(stream: &mut UnixStream, length: usize) -> Vec<u8> {
    let mut payload = vec![0_u8; length];
    stream.read_exact(&mut payload).expect("read payload");
    payload
}

/// Issues a read request and returns its payload, asserting success.
pub fn read_range(stream: &mut UnixStream, handle: u64, offset: u64, length: u32) -> Vec<u8> {
    send_request(stream, 0, handle, offset, length);
    let (errno, echoed) = read_reply(stream);
    assert_eq!(errno, 0, "read request succeeded");
    assert_eq!(echoed, handle, "reply echoes the handle");
    read_payload(stream, length as usize)
}
