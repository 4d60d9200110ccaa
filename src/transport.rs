// Byte I/O boundary. A `Transport` owns an opaque duplex stream and moves
// whole frames across it; everything above this layer deals in frames
// only. Reads accumulate into a buffer until a full frame is available,
// writes go through a buffered writer and are flushed per frame.

use crate::codec::FrameFormatError;
use crate::error::{AmqpError, AmqpResult};
use crate::frame::{Frame, PROTOCOL_HEADER};
use bytes::{Buf, BytesMut};
use std::future::Future;
use std::io::{self, Cursor};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

/// Default AMQP port, used when the host string carries none.
pub const DEFAULT_PORT: u16 = 5672;

/// Opens the byte stream for a connection attempt. The redirect loop may
/// dial several hosts over the lifetime of one `connect` call, so dialing
/// is a capability handed to the connection rather than a one-shot socket.
pub trait Dialer {
    type Io: AsyncRead + AsyncWrite + Unpin + Send;

    /// `host` is `"hostname[:port]"`; without a port the AMQP default
    /// applies.
    fn dial(&mut self, host: &str) -> impl Future<Output = io::Result<Self::Io>> + Send;
}

/// Plain TCP dialing with an optional connect timeout.
#[derive(Debug, Default)]
pub struct TcpDialer {
    pub connect_timeout: Option<Duration>,
}

impl Dialer for TcpDialer {
    type Io = TcpStream;

    async fn dial(&mut self, host: &str) -> io::Result<TcpStream> {
        let addr = match host.contains(':') {
            true => host.to_owned(),
            false => format!("{host}:{DEFAULT_PORT}"),
        };
        match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(&addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?,
            None => TcpStream::connect(&addr).await,
        }
    }
}

/// Frame-level I/O over one duplex byte stream.
#[derive(Debug)]
pub struct Transport<Io> {
    stream: BufWriter<Io>,
    buffer: BytesMut,
}

impl<Io: AsyncRead + AsyncWrite + Unpin> Transport<Io> {
    pub fn new(io: Io) -> Transport<Io> {
        Transport {
            stream: BufWriter::new(io),
            buffer: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Announces the protocol revision. Must be the first thing on the
    /// wire after the stream opens.
    pub async fn write_protocol_header(&mut self) -> io::Result<()> {
        self.stream.write_all(&PROTOCOL_HEADER).await?;
        self.stream.flush().await
    }

    /// Reads one whole frame, buffering as much of the stream as needed.
    ///
    /// Cancelling this future (a read deadline, for instance) leaves any
    /// partially received frame in the buffer, so a later call resumes
    /// cleanly.
    pub async fn read_frame(&mut self) -> AmqpResult<Frame> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(frame);
            }
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return Err(AmqpError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer mid-protocol",
                )));
            }
        }
    }

    fn parse_frame(&mut self) -> AmqpResult<Option<Frame>> {
        let mut cursor = Cursor::new(&self.buffer[..]);
        match Frame::check(&cursor) {
            Ok(total) => {
                let frame = Frame::parse(&mut cursor)?;
                self.buffer.advance(total);
                Ok(Some(frame))
            }
            // Not an error, just not enough buffered yet.
            Err(FrameFormatError::Incomplete) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes one frame and flushes it out. Frames from a single caller
    /// are contiguous on the wire because the engine serializes access to
    /// the write side.
    pub async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        frame.encode(&mut buf);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await
    }

    /// Best-effort close of the write side.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
