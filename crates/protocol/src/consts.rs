//! NBD protocol constants.

/// ASCII greeting that opens every newstyle negotiation.
pub const GREETING_MAGIC: &[u8; 8] = b"NBDMAGIC";

/// `"IHAVEOPT"`: sent by the server after the greeting and echoed back by
/// the client in front of each option.
pub const OPTION_MAGIC: u64 = 0x4948_4156_454F_5054;

/// Magic opening each 28-byte request frame.
pub const REQUEST_MAGIC: u32 = 0x2560_9513;

/// Magic opening each reply header.
pub const REPLY_MAGIC: u32 = 0x6744_6698;

/// The only option the nonfixed handshake accepts: select the (sole,
/// unnamed) export and move to the transmission phase.
pub const OPT_EXPORT_NAME: u32 = 1;

/// Client flag bit 1: the client asks the server to omit the 124 zero bytes
/// that end the negotiation. Only valid when the server advertised
/// `NO_ZEROES`, which this one never does.
pub const CLIENT_FLAG_NO_ZEROES: u32 = 1 << 1;

/// Export flags advertised after `EXPORT_NAME`: `HAS_FLAGS | READ_ONLY`.
pub const EXPORT_FLAGS: u16 = 0x0003;

/// Handshake flags sent with the greeting (nonfixed newstyle: none).
pub const SERVER_FLAGS: u16 = 0x0000;

/// Zero padding that terminates the export info block.
pub const EXPORT_PAD: usize = 124;

/// Request types of the transmission phase.
pub const CMD_READ: u32 = 0;
/// Write request; never honored on this read-only export.
pub const CMD_WRITE: u32 = 1;
/// Orderly disconnect.
pub const CMD_DISC: u32 = 2;
/// Flush request; meaningless without a write path.
pub const CMD_FLUSH: u32 = 3;
/// Trim request; meaningless without a write path.
pub const CMD_TRIM: u32 = 4;

/// Reply errno for out-of-bounds requests.
pub const ERR_INVAL: u32 = 22;

/// Reply errno for write-class requests on the read-only export.
pub const ERR_PERM: u32 = 1;
