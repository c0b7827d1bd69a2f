use std::io::{ErrorKind, Write};

use framelink_transport::IpcStream;

use crate::codec::{check_dimensions, encode_header, FrameConfig, WireFrame, FRAME_OVERHEAD};
use crate::error::{FrameError, Result};
use crate::header::FrameHeader;
use crate::reader::transport_to_frame_error;

/// Writes complete frames to any `Write` stream.
///
/// The header is encoded into a fixed buffer and the payload is written
/// straight from the caller's slice, so large frames are never copied.
pub struct FrameWriter<T> {
    inner: T,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self { inner, config }
    }

    /// Write a complete frame (blocking).
    pub fn write_frame(&mut self, frame: &WireFrame) -> Result<()> {
        self.send(&frame.header, frame.payload.as_ref())
    }

    /// Encode and send one frame.
    ///
    /// If the stream stops accepting bytes (write timeout or `WouldBlock`)
    /// part-way through, `WriteStalled` reports how far it got; the stream is
    /// then mid-frame and must not be written to again.
    pub fn send(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        if payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }
        check_dimensions(header)?;
        if header.payload_size != payload.len() as u64 {
            return Err(FrameError::DimensionMismatch {
                payload_size: payload.len() as u64,
                width: header.width,
                height: header.height,
                channels: header.channels,
            });
        }

        let head = encode_header(header);
        let total = FRAME_OVERHEAD + payload.len();
        let mut written = 0usize;

        while written < total {
            let pending = if written < FRAME_OVERHEAD {
                &head[written..]
            } else {
                &payload[written - FRAME_OVERHEAD..]
            };
            match self.inner.write(pending) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => written += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(FrameError::WriteStalled { written, total });
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame encoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameWriter<IpcStream> {
    /// Create a frame writer for `IpcStream` and apply write timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::BytesMut;

    use super::*;
    use crate::codec::decode_frame;
    use crate::reader::FrameReader;

    fn header(width: u32, height: u32, channels: u32, seq: u64) -> FrameHeader {
        FrameHeader {
            sequence_number: seq,
            timestamp_us: 42,
            width,
            height,
            channels,
            payload_size: u64::from(width) * u64::from(height) * u64::from(channels),
        }
    }

    #[test]
    fn write_single_frame() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        writer.send(&header(1, 5, 1, 1), b"hello").unwrap();

        let mut wire = BytesMut::from(writer.into_inner().into_inner().as_slice());
        let frame = decode_frame(&mut wire, usize::MAX).unwrap().unwrap();
        assert_eq!(frame.header, header(1, 5, 1, 1));
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[test]
    fn payload_too_large_rejected() {
        let cfg = FrameConfig {
            max_payload_size: 4,
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(Cursor::new(Vec::<u8>::new()), cfg);

        let err = writer.send(&header(9, 1, 1, 1), b"oversized").unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
        assert!(writer.into_inner().into_inner().is_empty());
    }

    #[test]
    fn dimension_mismatch_rejected_before_writing() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let err = writer.send(&header(2, 2, 1, 1), b"abc").unwrap_err();
        assert!(matches!(err, FrameError::DimensionMismatch { .. }));
        assert!(writer.into_inner().into_inner().is_empty());
    }

    #[test]
    fn write_frame_method() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));
        let frame = WireFrame {
            header: header(1, 1, 3, 2),
            payload: bytes::Bytes::from_static(b"abc"),
        };
        writer.write_frame(&frame).unwrap();

        let mut reader = FrameReader::new(Cursor::new(writer.into_inner().into_inner()));
        let decoded = reader.read_frame().unwrap();
        assert_eq!(decoded.header.sequence_number, 2);
        assert_eq!(decoded.payload.as_ref(), b"abc");
    }

    #[test]
    fn flush_propagates() {
        let sink = FlushTrackingWriter::default();
        let flag = Arc::clone(&sink.flushed);
        let mut writer = FrameWriter::new(sink);

        writer.send(&header(1, 1, 1, 1), b"x").unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn short_writes_cross_header_boundary() {
        let mut writer = FrameWriter::new(ShortWriter {
            max_per_call: 7,
            data: Vec::new(),
        });
        let payload: Vec<u8> = (0..30).collect();
        writer.send(&header(5, 2, 3, 3), &payload).unwrap();

        let mut wire = BytesMut::from(writer.into_inner().data.as_slice());
        let frame = decode_frame(&mut wire, usize::MAX).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn handles_interrupted_write() {
        let mut writer = FrameWriter::new(InterruptedOnce {
            interrupted: false,
            data: Vec::new(),
        });
        writer.send(&header(5, 1, 1, 5), b"retry").unwrap();
        assert_eq!(writer.into_inner().data.len(), FRAME_OVERHEAD + 5);
    }

    #[test]
    fn would_block_reports_stall_with_progress() {
        let mut writer = FrameWriter::new(StallAfter {
            budget: FRAME_OVERHEAD + 3,
            data: Vec::new(),
        });
        let err = writer.send(&header(10, 1, 1, 1), &[1; 10]).unwrap_err();
        assert!(matches!(
            err,
            FrameError::WriteStalled {
                written,
                total
            } if written == FRAME_OVERHEAD + 3 && total == FRAME_OVERHEAD + 10
        ));
    }

    #[test]
    fn connection_closed_when_write_returns_zero() {
        let mut writer = FrameWriter::new(ZeroWriter);
        let err = writer.send(&header(1, 1, 1, 1), b"x").unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn write_timeout_stalls_on_full_socket() {
        let (left, _right) = IpcStream::pair().unwrap();
        let cfg = FrameConfig {
            max_payload_size: usize::MAX,
            write_timeout: Some(Duration::from_millis(20)),
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config_ipc(left, cfg).unwrap();

        // Larger than any default unix socket buffer; nobody reads the other end.
        let payload = vec![0u8; 16 * 1024 * 1024];
        let err = writer
            .send(&header(4096, 4096, 1, 1), &payload)
            .unwrap_err();
        assert!(matches!(err, FrameError::WriteStalled { written, .. } if written > 0));
    }

    #[test]
    fn roundtrip_over_socket_pair() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut writer = FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        let reader_thread = std::thread::spawn(move || {
            for seq in 1..=32u64 {
                let frame = reader.read_frame().unwrap();
                assert_eq!(frame.header.sequence_number, seq);
                assert!(frame.payload.iter().all(|b| *b == seq as u8));
            }
        });

        for seq in 1..=32u64 {
            let payload = vec![seq as u8; 64 * 48 * 3];
            writer.send(&header(64, 48, 3, seq), &payload).unwrap();
        }

        reader_thread.join().unwrap();
    }

    #[derive(Default)]
    struct FlushTrackingWriter {
        flushed: Arc<AtomicBool>,
        data: Vec<u8>,
    }

    impl Write for FlushTrackingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ShortWriter {
        max_per_call: usize,
        data: Vec<u8>,
    }

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.max_per_call);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct InterruptedOnce {
        interrupted: bool,
        data: Vec<u8>,
    }

    impl Write for InterruptedOnce {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct StallAfter {
        budget: usize,
        data: Vec<u8>,
    }

    impl Write for StallAfter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let room = self.budget - self.data.len();
            if room == 0 {
                return Err(std::io::Error::from(ErrorKind::WouldBlock));
            }
            let n = buf.len().min(room);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
