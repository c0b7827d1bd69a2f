//! Socket Frame Channel: frames as length-prefixed messages on a Unix
//! domain socket.
//!
//! The consumer binds and the producer connects. Unlike the shared-memory
//! channels nothing is dropped in transit; when the consumer falls behind,
//! the producer drops whole frames after waiting up to the send timeout.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use framelink_frame::{
    Acquired, AcquiredFrame, Backend, ChannelError, ChannelResult, FrameConfig, FrameConsumer,
    FrameError, FrameHeader, FrameLimits, FramePayload, FrameProducer, FrameReader, FrameWriter,
    RawFrame, WireFrame,
};
use framelink_transport::{Backoff, IpcStream, TransportError, UnixDomainSocket};
use tracing::{debug, info, warn};

/// Timing knobs for the socket channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    /// Longest `publish` waits for the consumer to make room.
    pub send_timeout: Duration,
    /// Longest `connect` keeps retrying while no consumer is listening.
    pub connect_timeout: Duration,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

fn frame_config(limits: FrameLimits, write_timeout: Option<Duration>) -> FrameConfig {
    FrameConfig {
        max_payload_size: usize::try_from(limits.slot_capacity()).unwrap_or(usize::MAX),
        read_timeout: None,
        write_timeout,
    }
}

fn is_disconnect(err: &FrameError) -> bool {
    match err {
        FrameError::ConnectionClosed | FrameError::TruncatedFrame { .. } => true,
        FrameError::Io(io) => matches!(
            io.kind(),
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
        ),
        _ => false,
    }
}

/// Producer end of a Socket Frame Channel.
pub struct SocketFrameProducer {
    writer: FrameWriter<IpcStream>,
    path: PathBuf,
    limits: FrameLimits,
    options: SocketOptions,
    last_sequence: u64,
    poisoned: Option<String>,
    closed: bool,
}

impl SocketFrameProducer {
    /// Connect to the consumer listening at `path`, retrying with backoff
    /// until `options.connect_timeout` has passed.
    pub fn connect(
        path: impl AsRef<Path>,
        limits: FrameLimits,
        options: SocketOptions,
    ) -> ChannelResult<Self> {
        let path = path.as_ref();
        let backoff = Backoff::with_max_wait(options.connect_timeout);
        let stream = match UnixDomainSocket::connect_with_backoff(path, &backoff) {
            Ok(stream) => stream,
            Err(err) if err.is_endpoint_missing() => {
                return Err(ChannelError::ChannelNotFound {
                    name: path.display().to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        let writer =
            FrameWriter::with_config_ipc(stream, frame_config(limits, Some(options.send_timeout)))?;
        info!(path = %path.display(), %limits, "connected socket frame channel");
        Ok(Self {
            writer,
            path: path.to_path_buf(),
            limits,
            options,
            last_sequence: 0,
            poisoned: None,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn poison(&mut self, reason: String) -> ChannelError {
        warn!(path = %self.path.display(), %reason, "socket frame channel lost its consumer");
        self.poisoned = Some(reason.clone());
        ChannelError::PeerGone(reason)
    }
}

impl FrameProducer for SocketFrameProducer {
    fn publish(&mut self, frame: &RawFrame<'_>) -> ChannelResult<u64> {
        if self.closed {
            return Err(ChannelError::ChannelClosed);
        }
        if let Some(reason) = &self.poisoned {
            return Err(ChannelError::PeerGone(reason.clone()));
        }
        self.limits.check(frame)?;

        if !self.writer.get_ref().wait_writable(self.options.send_timeout)? {
            warn!(
                sequence = self.last_sequence + 1,
                "consumer is not draining the socket, dropping frame"
            );
            return Err(ChannelError::Timeout(self.options.send_timeout));
        }

        let header = FrameHeader {
            sequence_number: self.last_sequence + 1,
            timestamp_us: frame.timestamp_us,
            width: frame.width,
            height: frame.height,
            channels: frame.channels,
            payload_size: frame.pixels.len() as u64,
        };
        match self.writer.send(&header, frame.pixels) {
            Ok(()) => {
                self.last_sequence = header.sequence_number;
                debug!(sequence = header.sequence_number, "sent frame");
                Ok(header.sequence_number)
            }
            Err(FrameError::WriteStalled { written: 0, .. }) => {
                warn!(
                    sequence = header.sequence_number,
                    "socket send timed out, dropping frame"
                );
                Err(ChannelError::Timeout(self.options.send_timeout))
            }
            Err(FrameError::WriteStalled { written, total }) => Err(self.poison(format!(
                "send stalled after {written} of {total} bytes"
            ))),
            Err(err) if is_disconnect(&err) => Err(self.poison(err.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    fn backend(&self) -> Backend {
        Backend::Socket
    }

    fn limits(&self) -> FrameLimits {
        self.limits
    }

    fn close(&mut self) -> ChannelResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.get_ref().shutdown()?;
        info!(path = %self.path.display(), "closed socket frame channel");
        Ok(())
    }
}

impl Drop for SocketFrameProducer {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            debug!(error = %err, "socket producer close failed");
        }
    }
}

impl std::fmt::Debug for SocketFrameProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketFrameProducer")
            .field("path", &self.path)
            .field("limits", &self.limits)
            .field("last_sequence", &self.last_sequence)
            .field("poisoned", &self.poisoned.is_some())
            .finish()
    }
}

/// Consumer end of a Socket Frame Channel.
///
/// Accepts one producer at a time. When that producer goes away, `acquire`
/// reports `PeerGone` once and the next call waits for a new producer.
///
/// Every producer connection numbers its frames from 1. Reported sequence
/// numbers are offset by what this handle already returned, so they keep
/// rising across reconnects.
pub struct SocketFrameConsumer {
    listener: UnixDomainSocket,
    reader: Option<FrameReader<IpcStream>>,
    limits: FrameLimits,
    current: Option<WireFrame>,
    /// Last sequence returned by this handle.
    last_seen: u64,
    /// `last_seen` when the current producer connected.
    base: u64,
    /// Last sequence on the wire from the current producer.
    wire_last: u64,
    closed: bool,
}

impl SocketFrameConsumer {
    /// Bind `path`, replacing a stale socket left by an earlier run.
    pub fn bind(path: impl AsRef<Path>, limits: FrameLimits) -> ChannelResult<Self> {
        let listener = UnixDomainSocket::bind(path)?;
        info!(path = %listener.path().display(), %limits, "listening for socket frame producer");
        Ok(Self {
            listener,
            reader: None,
            limits,
            current: None,
            last_seen: 0,
            base: 0,
            wire_last: 0,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        self.listener.path()
    }

    /// Whether a producer is currently connected.
    pub fn is_connected(&self) -> bool {
        self.reader.is_some()
    }

    fn disconnect(&mut self, reason: String) -> ChannelError {
        if let Some(reader) = self.reader.take() {
            let _ = reader.get_ref().shutdown();
        }
        info!(path = %self.listener.path().display(), %reason, "socket frame producer went away");
        ChannelError::PeerGone(reason)
    }

    fn validate(&self, frame: &WireFrame) -> ChannelResult<()> {
        let header = &frame.header;
        self.limits.check(
            &RawFrame::new(&frame.payload, header.width, header.height, header.channels)
                .with_timestamp(header.timestamp_us),
        )?;
        if header.sequence_number <= self.wire_last {
            return Err(ChannelError::Incompatible(format!(
                "sequence {} after {}",
                header.sequence_number, self.wire_last
            )));
        }
        Ok(())
    }
}

impl FrameConsumer for SocketFrameConsumer {
    fn acquire(&mut self, timeout: Duration) -> ChannelResult<Acquired<'_>> {
        if self.closed {
            return Err(ChannelError::ChannelClosed);
        }
        let deadline = Instant::now() + timeout;

        if self.reader.is_none() {
            let stream = match self.listener.accept_timeout(timeout) {
                Ok(stream) => stream,
                Err(TransportError::Timeout(_)) => return Err(ChannelError::Timeout(timeout)),
                Err(err) => return Err(err.into()),
            };
            self.reader = Some(FrameReader::with_config_ipc(
                stream,
                frame_config(self.limits, None),
            )?);
            self.base = self.last_seen;
            self.wire_last = 0;
            info!(path = %self.listener.path().display(), "socket frame producer connected");
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = match self.reader.as_mut() {
            Some(reader) => reader.read_frame_timeout(remaining),
            None => return Err(ChannelError::Timeout(timeout)),
        };

        let mut frame = match result {
            Ok(frame) => frame,
            Err(err) if err.is_timeout() => return Err(ChannelError::Timeout(timeout)),
            Err(err) if is_disconnect(&err) => return Err(self.disconnect(err.to_string())),
            Err(err) => {
                // Framing is lost; the stream cannot be resynchronized.
                let _ = self.disconnect(err.to_string());
                return Err(err.into());
            }
        };

        self.validate(&frame)?;
        self.wire_last = frame.header.sequence_number;
        frame.header.sequence_number = self.base + self.wire_last;
        self.last_seen = frame.header.sequence_number;
        debug!(sequence = self.last_seen, wire = self.wire_last, "received frame");

        let frame = self.current.insert(frame);
        Ok(Acquired::Frame(AcquiredFrame {
            header: frame.header,
            payload: FramePayload::Host(&frame.payload),
        }))
    }

    fn backend(&self) -> Backend {
        Backend::Socket
    }

    fn limits(&self) -> FrameLimits {
        self.limits
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.closed = true;
        if let Some(reader) = self.reader.take() {
            let _ = reader.get_ref().shutdown();
        }
        Ok(())
    }
}

impl std::fmt::Debug for SocketFrameConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketFrameConsumer")
            .field("path", &self.listener.path())
            .field("limits", &self.limits)
            .field("connected", &self.reader.is_some())
            .field("last_seen", &self.last_seen)
            .finish()
    }
}
