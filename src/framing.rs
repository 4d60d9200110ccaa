// Method framing: turning the inbound frame stream into whole logical
// methods, and fanning outbound methods back out into frames.
//
// `MethodReader` tracks, per channel, which frame kind must arrive next
// (METHOD normally, HEADER/BODY while content is being assembled) and
// keeps the assembly cursor for at most one in-flight message per
// channel. `MethodWriter` is the mirror image, splitting bodies to the
// negotiated frame size.

use crate::codec::Reader;
use crate::error::AmqpError;
use crate::frame::{Frame, FrameKind};
use crate::message::{Body, Message};
use crate::method::MethodSignature;
use crate::transport::Transport;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

/// One fully assembled inbound method.
#[derive(Debug)]
pub(crate) struct IncomingMethod {
    pub channel: u16,
    pub sig: MethodSignature,
    pub args: Reader,
    pub content: Option<Message>,
}

/// What `read_method` hands back. Channel errors leave the framer (and
/// the connection) running; fatal errors do not.
#[derive(Debug)]
pub(crate) enum Delivery {
    Method(IncomingMethod),
    ChannelError { channel: u16, error: AmqpError },
    Fatal(AmqpError),
    TimedOut,
}

/// Content-assembly state between a content method frame and its final
/// body frame. At most one exists per channel.
#[derive(Debug)]
struct PartialMessage {
    sig: MethodSignature,
    args: Reader,
    message: Option<Message>,
    body_size: u64,
    body_received: u64,
    parts: Vec<Bytes>,
}

impl PartialMessage {
    fn new(sig: MethodSignature, args: Reader) -> PartialMessage {
        PartialMessage {
            sig,
            args,
            message: None,
            body_size: 0,
            body_received: 0,
            parts: Vec::new(),
        }
    }

    fn add_header(&mut self, payload: Bytes) -> Result<(), AmqpError> {
        let mut r = Reader::new(payload);
        let _class_id = r.read_short()?;
        let _weight = r.read_short()?;
        self.body_size = r.read_longlong()?;
        self.message = Some(Message::load_properties(r.take_remaining())?);
        Ok(())
    }

    fn add_body(&mut self, payload: Bytes) {
        self.body_received += payload.len() as u64;
        self.parts.push(payload);
    }

    fn complete(&self) -> bool {
        self.message.is_some() && self.body_received == self.body_size
    }

    fn finish(mut self, channel: u16) -> IncomingMethod {
        let mut message = self.message.take().unwrap_or_default();
        message.body = match self.parts.len() {
            0 => Body::Binary(Bytes::new()),
            1 => Body::Binary(self.parts.remove(0)),
            _ => {
                let mut joined = BytesMut::with_capacity(self.body_received as usize);
                for part in &self.parts {
                    joined.put_slice(part);
                }
                Body::Binary(joined.freeze())
            }
        };
        IncomingMethod {
            channel,
            sig: self.sig,
            args: self.args,
            content: Some(message),
        }
    }
}

/// Reassembles the inbound frame stream into whole methods.
#[derive(Debug, Default)]
pub(crate) struct MethodReader {
    queue: VecDeque<Delivery>,
    partials: HashMap<u16, PartialMessage>,
    expected: HashMap<u16, FrameKind>,
    /// Frame counter (not bytes), watched by the heartbeat monitor.
    pub bytes_recv: u64,
}

impl MethodReader {
    pub fn new() -> MethodReader {
        MethodReader::default()
    }

    /// The frame kind the framer will accept next on `channel`.
    pub fn expected_kind(&self, channel: u16) -> FrameKind {
        self.expected
            .get(&channel)
            .copied()
            .unwrap_or(FrameKind::Method)
    }

    /// Returns the next assembled unit from any channel, pulling frames
    /// from the transport as needed. Transport failures are queued and
    /// surfaced here so callers observe them at a well-defined point; a
    /// deadline expiry surfaces as `TimedOut` without touching any
    /// per-channel state.
    pub async fn read_method<Io>(
        &mut self,
        transport: &mut Transport<Io>,
        timeout: Option<Duration>,
    ) -> Delivery
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            if let Some(delivery) = self.queue.pop_front() {
                return delivery;
            }

            let read = match timeout {
                Some(limit) => match tokio::time::timeout(limit, transport.read_frame()).await {
                    Ok(read) => read,
                    Err(_) => return Delivery::TimedOut,
                },
                None => transport.read_frame().await,
            };
            let frame = match read {
                Ok(frame) => frame,
                Err(e) => {
                    self.queue.push_back(Delivery::Fatal(e));
                    continue;
                }
            };
            self.bytes_recv += 1;

            if frame.kind == FrameKind::Heartbeat {
                trace!("heartbeat from peer, echoing");
                if let Err(e) = transport.write_frame(&Frame::heartbeat()).await {
                    self.queue.push_back(Delivery::Fatal(e.into()));
                }
                continue;
            }

            let expected = self.expected_kind(frame.channel);
            if frame.kind != expected {
                self.queue.push_back(Delivery::ChannelError {
                    channel: frame.channel,
                    error: AmqpError::UnexpectedFrame {
                        channel: frame.channel,
                        kind: frame.kind,
                        expected,
                    },
                });
                continue;
            }

            let result = match frame.kind {
                FrameKind::Method => self.process_method(frame.channel, frame.payload),
                FrameKind::Header => self.process_header(frame.channel, frame.payload),
                FrameKind::Body => self.process_body(frame.channel, frame.payload),
                FrameKind::Heartbeat => Ok(()),
            };
            if let Err(e) = result {
                self.queue.push_back(Delivery::Fatal(e));
            }
        }
    }

    fn process_method(&mut self, channel: u16, payload: Bytes) -> Result<(), AmqpError> {
        let mut args = Reader::new(payload);
        let sig = MethodSignature::new(args.read_short()?, args.read_short()?);
        trace!(channel, %sig, "method frame");

        if sig.carries_content() {
            // Hold the method until its header and body arrive.
            self.partials.insert(channel, PartialMessage::new(sig, args));
            self.expected.insert(channel, FrameKind::Header);
        } else {
            self.queue.push_back(Delivery::Method(IncomingMethod {
                channel,
                sig,
                args,
                content: None,
            }));
        }
        Ok(())
    }

    fn process_header(&mut self, channel: u16, payload: Bytes) -> Result<(), AmqpError> {
        let Some(partial) = self.partials.get_mut(&channel) else {
            self.queue.push_back(Delivery::ChannelError {
                channel,
                error: AmqpError::UnexpectedFrame {
                    channel,
                    kind: FrameKind::Header,
                    expected: FrameKind::Method,
                },
            });
            return Ok(());
        };
        partial.add_header(payload)?;
        if partial.complete() {
            // Bodyless message: done on the header frame.
            self.finalize(channel);
        } else {
            self.expected.insert(channel, FrameKind::Body);
        }
        Ok(())
    }

    fn process_body(&mut self, channel: u16, payload: Bytes) -> Result<(), AmqpError> {
        let Some(partial) = self.partials.get_mut(&channel) else {
            self.queue.push_back(Delivery::ChannelError {
                channel,
                error: AmqpError::UnexpectedFrame {
                    channel,
                    kind: FrameKind::Body,
                    expected: FrameKind::Method,
                },
            });
            return Ok(());
        };
        partial.add_body(payload);
        if partial.complete() {
            self.finalize(channel);
        }
        Ok(())
    }

    fn finalize(&mut self, channel: u16) {
        if let Some(partial) = self.partials.remove(&channel) {
            debug!(channel, sig = %partial.sig, bytes = partial.body_received, "content assembled");
            self.queue
                .push_back(Delivery::Method(partial.finish(channel)));
        }
        self.expected.insert(channel, FrameKind::Method);
    }
}

/// Serializes outbound methods into method/header/body frames.
#[derive(Debug)]
pub(crate) struct MethodWriter {
    /// Negotiated maximum frame size; pushed down after Tune.
    pub frame_max: u32,
    /// Frame counter (not bytes), watched by the heartbeat monitor.
    pub bytes_sent: u64,
}

impl MethodWriter {
    pub fn new(frame_max: u32) -> MethodWriter {
        MethodWriter {
            frame_max,
            bytes_sent: 0,
        }
    }

    /// Emits one method, with its content header and body chunks when a
    /// message rides along. All frames of one call are contiguous on the
    /// wire.
    pub async fn write_method<Io>(
        &mut self,
        transport: &mut Transport<Io>,
        channel: u16,
        sig: MethodSignature,
        args: &[u8],
        content: Option<&mut Message>,
    ) -> Result<(), AmqpError>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        let mut payload = BytesMut::with_capacity(4 + args.len());
        payload.put_u16(sig.class_id);
        payload.put_u16(sig.method_id);
        payload.put_slice(args);

        // Resolve the body and properties before the first frame goes
        // out, so a property error never leaves a dangling method frame.
        let prepared = match content {
            Some(message) => {
                let body = message.resolve_body();
                let properties = message.serialize_properties()?;
                Some((body, properties))
            }
            None => None,
        };

        transport
            .write_frame(&Frame::new(FrameKind::Method, channel, payload.freeze()))
            .await?;

        if let Some((mut body, properties)) = prepared {
            let mut header = BytesMut::with_capacity(12 + properties.len());
            header.put_u16(sig.class_id);
            header.put_u16(0);
            header.put_u64(body.len() as u64);
            header.put_slice(&properties);
            transport
                .write_frame(&Frame::new(FrameKind::Header, channel, header.freeze()))
                .await?;

            let chunk_size = self.frame_max as usize - 8;
            while !body.is_empty() {
                let take = body.len().min(chunk_size);
                transport
                    .write_frame(&Frame::new(FrameKind::Body, channel, body.split_to(take)))
                    .await?;
            }
        }

        self.bytes_sent += 1;
        Ok(())
    }

    pub async fn send_heartbeat<Io>(&mut self, transport: &mut Transport<Io>) -> io::Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        transport.write_frame(&Frame::heartbeat()).await
    }
}
