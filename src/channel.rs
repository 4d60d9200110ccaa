// Per-channel state and the caller-facing events produced by channel
// dispatch.

use crate::error::{AmqpError, AmqpResult};
use crate::framing::IncomingMethod;
use crate::message::Message;
use crate::method::{self, MethodSignature};
use std::collections::VecDeque;

/// Whether `sig` satisfies a wait filter. `Channel.Close` is always
/// admissible: a server-initiated shutdown preempts any pending wait.
pub(crate) fn sig_admissible(sig: MethodSignature, allowed: Option<&[MethodSignature]>) -> bool {
    match allowed {
        None => true,
        Some(set) => set.contains(&sig) || sig == method::CHANNEL_CLOSE,
    }
}

/// A method or error parked on a channel until someone waits for it.
#[derive(Debug)]
pub(crate) enum QueuedItem {
    Method(IncomingMethod),
    Error(AmqpError),
}

impl QueuedItem {
    pub fn admissible(&self, allowed: Option<&[MethodSignature]>) -> bool {
        match self {
            // Errors go to the channel's next waiter no matter the filter.
            QueuedItem::Error(_) => true,
            QueuedItem::Method(m) => sig_admissible(m.sig, allowed),
        }
    }
}

/// Connection-owned record for one channel. Channel 0 is the connection
/// itself.
#[derive(Debug)]
pub(crate) struct ChannelState {
    pub channel_id: u16,
    pub is_open: bool,
    /// Decode UTF-8 bodies of inbound content to text.
    pub auto_decode: bool,
    pub queue: VecDeque<QueuedItem>,
}

impl ChannelState {
    pub fn new(channel_id: u16) -> ChannelState {
        ChannelState {
            channel_id,
            is_open: false,
            auto_decode: true,
            queue: VecDeque::new(),
        }
    }
}

/// An inbound `Basic.Deliver`.
#[derive(Debug)]
pub struct Deliver {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub message: Message,
}

/// An inbound `Basic.Return`: a published message the server could not
/// route.
#[derive(Debug)]
pub struct Return {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub message: Message,
}

/// An inbound `Basic.GetOk`.
#[derive(Debug)]
pub struct GetOk {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub message_count: u32,
    pub message: Message,
}

/// What `drain_events` hands to the caller.
#[derive(Debug)]
pub enum ChannelEvent {
    Deliver(Deliver),
    Return(Return),
    GetOk(GetOk),
}

impl ChannelEvent {
    pub fn message(&self) -> &Message {
        match self {
            ChannelEvent::Deliver(d) => &d.message,
            ChannelEvent::Return(r) => &r.message,
            ChannelEvent::GetOk(g) => &g.message,
        }
    }
}

/// Decodes a content-bearing method into its event. Signatures outside
/// the dispatch table raise `UnexpectedMethod` for the channel.
pub(crate) fn decode_event(m: IncomingMethod) -> AmqpResult<ChannelEvent> {
    let IncomingMethod {
        channel,
        sig,
        mut args,
        content,
    } = m;
    let message = content.unwrap_or_default();
    match sig {
        method::BASIC_DELIVER => Ok(ChannelEvent::Deliver(Deliver {
            consumer_tag: args.read_shortstr()?,
            delivery_tag: args.read_longlong()?,
            redelivered: args.read_bit()?,
            exchange: args.read_shortstr()?,
            routing_key: args.read_shortstr()?,
            message,
        })),
        method::BASIC_RETURN => Ok(ChannelEvent::Return(Return {
            reply_code: args.read_short()?,
            reply_text: args.read_shortstr()?,
            exchange: args.read_shortstr()?,
            routing_key: args.read_shortstr()?,
            message,
        })),
        method::BASIC_GET_OK => Ok(ChannelEvent::GetOk(GetOk {
            delivery_tag: args.read_longlong()?,
            redelivered: args.read_bit()?,
            exchange: args.read_shortstr()?,
            routing_key: args.read_shortstr()?,
            message_count: args.read_long()?,
            message,
        })),
        sig => Err(AmqpError::UnexpectedMethod { channel, sig }),
    }
}
