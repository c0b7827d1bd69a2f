use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::header::FrameHeader;

/// Payload-size prefix: one little-endian `u64`.
pub const PREFIX_SIZE: usize = 8;

/// Frame header: magic (4) + width, height, channels (3 x 4) + sequence,
/// timestamp (2 x 8) = 32 bytes.
pub const HEADER_SIZE: usize = 32;

/// Bytes on the wire before the payload.
pub const FRAME_OVERHEAD: usize = PREFIX_SIZE + HEADER_SIZE;

/// Header magic: "FLHD".
pub const MAGIC: [u8; 4] = *b"FLHD";

/// Default maximum payload size: one 1920x1080x3 frame.
pub const DEFAULT_MAX_PAYLOAD: usize = 1920 * 1080 * 3;

/// A decoded socket frame.
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl WireFrame {
    /// The total wire size of this frame (prefix + header + payload).
    pub fn wire_size(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }
}

/// Encode the prefix and header of a frame whose payload follows separately.
///
/// Wire format:
/// ```text
/// ┌────────────────┬────────┬───────┬────────┬──────────┬──────────┬───────────┬─────────┐
/// │ payload_size   │ "FLHD" │ width │ height │ channels │ sequence │ timestamp │ payload │
/// │ (8B LE)        │ (4B)   │ (4B)  │ (4B)   │ (4B)     │ (8B LE)  │ (8B LE)   │         │
/// └────────────────┴────────┴───────┴────────┴──────────┴──────────┴───────────┴─────────┘
/// ```
pub fn encode_header(header: &FrameHeader) -> [u8; FRAME_OVERHEAD] {
    let mut out = [0u8; FRAME_OVERHEAD];
    let mut dst = &mut out[..];
    dst.put_u64_le(header.payload_size);
    dst.put_slice(&MAGIC);
    dst.put_u32_le(header.width);
    dst.put_u32_le(header.height);
    dst.put_u32_le(header.channels);
    dst.put_u64_le(header.sequence_number);
    dst.put_u64_le(header.timestamp_us);
    out
}

/// Encode a complete frame into `dst`.
///
/// `header.payload_size` must equal `payload.len()` and the dimensions.
pub fn encode_frame(header: &FrameHeader, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    check_dimensions(header)?;
    if header.payload_size != payload.len() as u64 {
        return Err(FrameError::DimensionMismatch {
            payload_size: payload.len() as u64,
            width: header.width,
            height: header.height,
            channels: header.channels,
        });
    }
    dst.reserve(FRAME_OVERHEAD + payload.len());
    dst.put_slice(&encode_header(header));
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// The size limit is enforced as soon as the prefix arrives, before any
/// payload is buffered. On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<WireFrame>> {
    if src.len() < PREFIX_SIZE {
        return Ok(None);
    }

    let payload_size = (&src[..PREFIX_SIZE]).get_u64_le();
    if payload_size > max_payload as u64 {
        return Err(FrameError::PayloadTooLarge {
            size: usize::try_from(payload_size).unwrap_or(usize::MAX),
            max: max_payload,
        });
    }

    if src.len() < FRAME_OVERHEAD {
        return Ok(None);
    }

    let mut head = &src[PREFIX_SIZE..FRAME_OVERHEAD];
    if head[..MAGIC.len()] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }
    head.advance(MAGIC.len());
    let header = FrameHeader {
        width: head.get_u32_le(),
        height: head.get_u32_le(),
        channels: head.get_u32_le(),
        sequence_number: head.get_u64_le(),
        timestamp_us: head.get_u64_le(),
        payload_size,
    };
    check_dimensions(&header)?;

    let payload_len = payload_size as usize;
    if src.len() < FRAME_OVERHEAD + payload_len {
        return Ok(None);
    }

    src.advance(FRAME_OVERHEAD);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(WireFrame { header, payload }))
}

pub(crate) fn check_dimensions(header: &FrameHeader) -> Result<()> {
    let expected =
        u64::from(header.width) * u64::from(header.height) * u64::from(header.channels);
    if expected != header.payload_size {
        return Err(FrameError::DimensionMismatch {
            payload_size: header.payload_size,
            width: header.width,
            height: header.height,
            channels: header.channels,
        });
    }
    Ok(())
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: one 1920x1080x3 frame.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
