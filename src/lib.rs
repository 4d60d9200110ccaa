//! AMQP 0-8 client protocol engine.
//!
//! This crate implements the wire-level machinery of an AMQP 0-8 client:
//! the primitive type codec, transport framing, reassembly of
//! method/header/body frame triples into logical messages, the
//! connection handshake state machine, channel multiplexing with
//! per-channel ordering and blocking waits, and heartbeat monitoring.
//! The byte stream underneath is opaque: anything `AsyncRead +
//! AsyncWrite` works, with plain TCP provided out of the box.
//!
//! ```rust,no_run
//! use amqp08::{Connection, ConnectionOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ConnectionOptions::new()
//!         .host("localhost:5672")
//!         .userid("guest")
//!         .password("guest")
//!         .virtual_host("/");
//!     let mut conn = Connection::connect(options).await?;
//!
//!     let channel = conn.open_channel(None).await?;
//!
//!     // ... issue methods on the channel, drain deliveries ...
//!     let (on_channel, event) = conn.drain_events(None).await?;
//!     println!("event on channel {on_channel}: {event:?}");
//!
//!     conn.close_channel(channel, 0, "", amqp08::MethodSignature::new(0, 0))
//!         .await?;
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod codec;
pub mod connection;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod message;
pub mod method;
pub mod transport;

mod framing;
mod macros;


pub use channel::{ChannelEvent, Deliver, GetOk, Return};
pub use codec::{Decimal, FrameFormatError, Reader, Table, TableValue, Timestamp, Writer};
pub use connection::{
    Connection, ConnectionOptions, DEFAULT_CHANNEL_MAX, DEFAULT_FRAME_MAX, MIN_FRAME_MAX,
};
pub use error::{AmqpError, AmqpResult};
pub use frame::{Frame, FrameKind, FRAME_END, PROTOCOL_HEADER};
pub use heartbeat::{HeartbeatMonitor, Tick};
pub use message::{Body, Message};
pub use method::MethodSignature;
pub use transport::{Dialer, TcpDialer, Transport};
