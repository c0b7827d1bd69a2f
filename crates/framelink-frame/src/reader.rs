use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use framelink_transport::{IpcStream, TransportError};

use crate::codec::{decode_frame, FrameConfig, WireFrame, FRAME_OVERHEAD};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 64 * 1024;
const READ_CHUNK_SIZE: usize = 64 * 1024;
/// Read timeout once the deadline has passed; only used right after the
/// socket polled readable, so the read does not actually wait.
const ZERO_WAIT_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Reads complete frames from any `Read` stream.
///
/// Handles partial reads internally, callers always get complete frames.
/// Bytes of a frame that has not fully arrived when a read times out stay
/// buffered, so the next call resumes where the last one stopped.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    chunk: Box<[u8]>,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            chunk: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
            config,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` at EOF between frames and
    /// `Err(FrameError::TruncatedFrame)` at EOF inside one.
    pub fn read_frame(&mut self) -> Result<WireFrame> {
        loop {
            if let Some(frame) = self.try_decode()? {
                return Ok(frame);
            }
            self.fill()?;
        }
    }

    /// Bytes buffered towards the next frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop any partially received frame.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame decoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    fn try_decode(&mut self) -> Result<Option<WireFrame>> {
        let frame = decode_frame(&mut self.buf, self.config.max_payload_size)?;
        if frame.is_none() && self.buf.len() >= FRAME_OVERHEAD {
            // Header is valid; reserve the whole payload once instead of growing per chunk.
            let size = u64::from_le_bytes(self.prefix()) as usize;
            self.buf.reserve((FRAME_OVERHEAD + size).saturating_sub(self.buf.len()));
        }
        Ok(frame)
    }

    fn prefix(&self) -> [u8; 8] {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.buf[..8]);
        prefix
    }

    fn fill(&mut self) -> Result<()> {
        loop {
            let read = match self.inner.read(&mut self.chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                if self.buf.is_empty() {
                    return Err(FrameError::ConnectionClosed);
                }
                return Err(FrameError::TruncatedFrame {
                    buffered: self.buf.len(),
                });
            }

            self.buf.extend_from_slice(&self.chunk[..read]);
            return Ok(());
        }
    }
}

impl FrameReader<IpcStream> {
    /// Create a frame reader for `IpcStream` and apply read timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }

    /// Read the next complete frame, giving up once `timeout` has elapsed in
    /// total, however the bytes trickle in.
    ///
    /// Expiry surfaces as an I/O error for which
    /// [`FrameError::is_timeout`] is true. The configured read timeout is
    /// restored afterwards.
    pub fn read_frame_timeout(&mut self, timeout: Duration) -> Result<WireFrame> {
        let deadline = Instant::now() + timeout;
        let result = self.read_until(deadline);
        self.inner
            .set_read_timeout(self.config.read_timeout)
            .map_err(transport_to_frame_error)?;
        result
    }

    fn read_until(&mut self, deadline: Instant) -> Result<WireFrame> {
        loop {
            if let Some(frame) = self.try_decode()? {
                return Ok(frame);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // Out of time: still take whatever is already queued.
                if !self
                    .inner
                    .wait_readable(Duration::ZERO)
                    .map_err(transport_to_frame_error)?
                {
                    return Err(FrameError::Io(std::io::Error::from(ErrorKind::TimedOut)));
                }
                self.inner
                    .set_read_timeout(Some(ZERO_WAIT_READ_TIMEOUT))
                    .map_err(transport_to_frame_error)?;
            } else {
                self.inner
                    .set_read_timeout(Some(remaining))
                    .map_err(transport_to_frame_error)?;
            }
            self.fill()?;
        }
    }
}

pub(crate) fn transport_to_frame_error(err: TransportError) -> FrameError {
    match err {
        TransportError::Io(io) | TransportError::Accept(io) => FrameError::Io(io),
        TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => {
            FrameError::Io(source)
        }
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::io::Write;

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::codec::{encode_frame, encode_header};
    use crate::header::FrameHeader;

    fn header(width: u32, height: u32, channels: u32, seq: u64) -> FrameHeader {
        FrameHeader {
            sequence_number: seq,
            timestamp_us: seq * 1000,
            width,
            height,
            channels,
            payload_size: u64::from(width) * u64::from(height) * u64::from(channels),
        }
    }

    fn wire(frames: &[(FrameHeader, Vec<u8>)]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for (hdr, payload) in frames {
            encode_frame(hdr, payload, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn read_single_frame() {
        let bytes = wire(&[(header(1, 5, 1, 1), b"hello".to_vec())]);
        let mut reader = FrameReader::new(Cursor::new(bytes));
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.header.sequence_number, 1);
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[test]
    fn read_multiple_frames() {
        let bytes = wire(&[
            (header(1, 1, 3, 1), b"one".to_vec()),
            (header(1, 1, 3, 2), b"two".to_vec()),
            (header(1, 5, 1, 3), b"three".to_vec()),
        ]);
        let mut reader = FrameReader::new(Cursor::new(bytes));

        for (seq, expected) in [(1, &b"one"[..]), (2, &b"two"[..]), (3, &b"three"[..])] {
            let frame = reader.read_frame().unwrap();
            assert_eq!(frame.header.sequence_number, seq);
            assert_eq!(frame.payload.as_ref(), expected);
        }
    }

    #[test]
    fn read_frame_larger_than_chunk() {
        let payload: Vec<u8> = (0..320 * 240 * 3).map(|i| (i % 251) as u8).collect();
        let bytes = wire(&[(header(320, 240, 3, 4), payload.clone())]);
        let mut reader = FrameReader::new(Cursor::new(bytes));
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.header.width, 320);
        assert_eq!(frame.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn partial_read_handling() {
        let bytes = wire(&[(header(2, 2, 1, 4), b"slow".to_vec())]);
        let mut reader = FrameReader::new(ByteByByteReader { bytes, pos: 0 });

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.header.sequence_number, 4);
        assert_eq!(frame.payload.as_ref(), b"slow");
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_frame() {
        let mut partial = BytesMut::new();
        partial.put_slice(&encode_header(&header(4, 4, 1, 1)));
        partial.put_slice(b"only-part");

        let mut reader = FrameReader::new(Cursor::new(partial.to_vec()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(
            err,
            FrameError::TruncatedFrame { buffered } if buffered == FRAME_OVERHEAD + 9
        ));
    }

    #[test]
    fn invalid_magic_in_stream() {
        let mut bytes = encode_header(&header(0, 0, 0, 1)).to_vec();
        bytes[8..12].copy_from_slice(b"IPIP");
        let mut reader = FrameReader::new(Cursor::new(bytes));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::InvalidMagic));
    }

    #[test]
    fn oversized_frame_in_stream() {
        let bytes = encode_header(&header(32, 32, 1, 1)).to_vec();
        let cfg = FrameConfig {
            max_payload_size: 16,
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config(Cursor::new(bytes), cfg);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 1024, max: 16 }));
    }

    #[test]
    fn interrupted_read_retries() {
        let bytes = wire(&[(header(1, 1, 2, 8), b"ok".to_vec())]);
        let mut framed = FrameReader::new(InterruptedThenData {
            interrupted: false,
            inner: Cursor::new(bytes),
        });
        let frame = framed.read_frame().unwrap();

        assert_eq!(frame.header.sequence_number, 8);
        assert_eq!(frame.payload.as_ref(), b"ok");
    }

    #[test]
    fn timeout_keeps_partial_frame_for_next_call() {
        let (mut left, right) = IpcStream::pair().unwrap();
        let mut reader = FrameReader::with_config_ipc(right, FrameConfig::default()).unwrap();

        let bytes = wire(&[(header(2, 2, 3, 5), vec![9; 12])]);
        left.write_all(&bytes[..FRAME_OVERHEAD + 4]).unwrap();

        let err = reader
            .read_frame_timeout(Duration::from_millis(30))
            .unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");
        assert_eq!(reader.buffered(), FRAME_OVERHEAD + 4);

        left.write_all(&bytes[FRAME_OVERHEAD + 4..]).unwrap();
        let frame = reader.read_frame_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.header.sequence_number, 5);
        assert_eq!(frame.payload.as_ref(), &[9u8; 12]);
    }

    #[test]
    fn timeout_on_idle_stream() {
        let (_left, right) = IpcStream::pair().unwrap();
        let mut reader = FrameReader::new(right);
        let start = Instant::now();
        let err = reader
            .read_frame_timeout(Duration::from_millis(20))
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn zero_timeout_returns_queued_frame() {
        let (mut left, right) = IpcStream::pair().unwrap();
        let mut reader = FrameReader::with_config_ipc(right, FrameConfig::default()).unwrap();

        let err = reader.read_frame_timeout(Duration::ZERO).unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");

        left.write_all(&wire(&[(header(1, 1, 3, 4), vec![1, 2, 3])]))
            .unwrap();
        let frame = reader.read_frame_timeout(Duration::ZERO).unwrap();
        assert_eq!(frame.header.sequence_number, 4);
        assert_eq!(frame.payload.as_ref(), &[1, 2, 3]);

        let err = reader.read_frame_timeout(Duration::ZERO).unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");
    }

    #[test]
    fn peer_shutdown_is_connection_closed() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut reader = FrameReader::new(right);
        left.shutdown().unwrap();
        let err = reader
            .read_frame_timeout(Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn accessors_and_into_inner() {
        let cursor = Cursor::new(Vec::<u8>::new());
        let mut reader = FrameReader::new(cursor);

        let _ = reader.get_ref();
        let _ = reader.get_mut();
        reader.set_max_payload_size(10);
        assert_eq!(reader.config().max_payload_size, 10);
        let _inner = reader.into_inner();
    }

    #[derive(Debug)]
    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }

            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedThenData {
        interrupted: bool,
        inner: Cursor<Vec<u8>>,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.inner.read(buf)
        }
    }
}
