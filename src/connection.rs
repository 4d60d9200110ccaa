// Connection lifecycle: the multi-step handshake, channel multiplexing,
// blocking waits, and the close handshakes in both directions.
//
//     connection          = open-connection *use-connection close-connection
//     open-connection     = C:protocol-header
//                           S:START C:START-OK
//                           *challenge
//                           S:TUNE C:TUNE-OK
//                           C:OPEN S:OPEN-OK | S:REDIRECT
//     challenge           = S:SECURE C:SECURE-OK
//     close-connection    = C:CLOSE S:CLOSE-OK / S:CLOSE C:CLOSE-OK

use crate::channel::{sig_admissible, ChannelEvent, ChannelState, QueuedItem};
use crate::codec::{encode_table_entries, FrameFormatError, Table, TableValue, Writer};
use crate::error::{AmqpError, AmqpResult};
use crate::framing::{Delivery, IncomingMethod, MethodReader, MethodWriter};
use crate::heartbeat::HeartbeatMonitor;
use crate::macros::builder_setters;
use crate::message::Message;
use crate::method::{self, MethodSignature};
use crate::transport::{Dialer, TcpDialer, Transport};
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub const DEFAULT_CHANNEL_MAX: u16 = 0xFFFF;
pub const DEFAULT_FRAME_MAX: u32 = 131_072;

/// Until Tune-Ok both peers must accept frames this large, and the
/// negotiated value never drops below it.
pub const MIN_FRAME_MAX: u32 = 4096;

/// Configuration for one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// `"hostname[:port]"`; the AMQP default port applies when omitted.
    pub host: String,
    pub userid: String,
    pub password: String,
    pub login_method: String,
    /// Raw SASL response bytes; overrides `userid`/`password` when set.
    pub login_response: Option<Bytes>,
    pub virtual_host: String,
    pub locale: String,
    /// Merged over the built-in library identification.
    pub client_properties: Table,
    /// Opaque to the engine; the bundled TCP dialer rejects it, a
    /// TLS-capable `Dialer` interprets it.
    pub ssl: bool,
    /// Ask the server not to redirect us.
    pub insist: bool,
    pub connect_timeout: Option<Duration>,
    /// Desired heartbeat delay in seconds; 0 disables.
    pub heartbeat: u16,
    pub frame_max: u32,
    pub channel_max: u16,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            host: "localhost".to_owned(),
            userid: "guest".to_owned(),
            password: "guest".to_owned(),
            login_method: "AMQPLAIN".to_owned(),
            login_response: None,
            virtual_host: "/".to_owned(),
            locale: "en_US".to_owned(),
            client_properties: Table::new(),
            ssl: false,
            insist: false,
            connect_timeout: None,
            heartbeat: 0,
            frame_max: DEFAULT_FRAME_MAX,
            channel_max: DEFAULT_CHANNEL_MAX,
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> ConnectionOptions {
        ConnectionOptions::default()
    }

    builder_setters! {
        host: String,
        userid: String,
        password: String,
        login_method: String,
        login_response: Option<Bytes>,
        virtual_host: String,
        locale: String,
        client_properties: Table,
        ssl: bool,
        insist: bool,
        connect_timeout: Option<Duration>,
        heartbeat: u16,
        frame_max: u32,
        channel_max: u16,
    }
}

/// One AMQP connection. Owns the transport, the framer and writer, and
/// every channel multiplexed on it; channels are addressed by id and all
/// channel operations go through the connection.
#[derive(Debug)]
pub struct Connection<Io> {
    transport: Option<Transport<Io>>,
    pub(crate) reader: MethodReader,
    pub(crate) writer: MethodWriter,
    channels: HashMap<u16, ChannelState>,
    channel_max: u16,
    frame_max: u32,
    heartbeat: u16,
    version_major: u8,
    version_minor: u8,
    server_properties: Table,
    mechanisms: Vec<String>,
    locales: Vec<String>,
    known_hosts: String,
    heartbeat_generation: u64,
}

impl Connection<TcpStream> {
    /// Connects over plain TCP.
    pub async fn connect(options: ConnectionOptions) -> AmqpResult<Connection<TcpStream>> {
        if options.ssl {
            return Err(AmqpError::InvalidState(
                "TLS requires a TLS-capable dialer; use connect_with",
            ));
        }
        let dialer = TcpDialer {
            connect_timeout: options.connect_timeout,
        };
        Connection::connect_with(options, dialer).await
    }
}

impl<Io: AsyncRead + AsyncWrite + Unpin> Connection<Io> {
    /// Runs the handshake against whatever byte streams `dialer`
    /// produces, following server redirects until an Open-Ok lands.
    pub async fn connect_with<D>(
        options: ConnectionOptions,
        mut dialer: D,
    ) -> AmqpResult<Connection<D::Io>>
    where
        D: Dialer<Io = Io>,
    {
        let login_response = match &options.login_response {
            Some(raw) => raw.clone(),
            None => amqplain_response(&options.userid, &options.password)?,
        };
        let mut client_properties = library_properties();
        for (name, value) in &options.client_properties {
            client_properties.insert(name.clone(), value.clone());
        }
        let client_frame_max = match options.frame_max {
            0 => DEFAULT_FRAME_MAX,
            given => given.max(MIN_FRAME_MAX),
        };
        let client_channel_max = match options.channel_max {
            0 => DEFAULT_CHANNEL_MAX,
            given => given,
        };

        let mut host = options.host.clone();
        let mut known_hosts = String::new();
        loop {
            debug!(%host, "opening transport");
            let io = dialer.dial(&host).await?;
            let mut conn = Connection {
                transport: Some(Transport::new(io)),
                reader: MethodReader::new(),
                writer: MethodWriter::new(client_frame_max),
                channels: HashMap::from([(0, ChannelState::new(0))]),
                channel_max: client_channel_max,
                frame_max: client_frame_max,
                heartbeat: options.heartbeat,
                version_major: 0,
                version_minor: 0,
                server_properties: Table::new(),
                mechanisms: Vec::new(),
                locales: Vec::new(),
                known_hosts: known_hosts.clone(),
                heartbeat_generation: 0,
            };
            match conn.handshake(&options, &client_properties, &login_response).await {
                Ok(None) => return Ok(conn),
                Ok(Some(redirect_host)) => {
                    known_hosts = conn.known_hosts.clone();
                    conn.teardown().await;
                    host = redirect_host;
                }
                Err(e) => {
                    conn.teardown().await;
                    return Err(e);
                }
            }
        }
    }

    /// One pass of the handshake. `Ok(Some(host))` means the server
    /// redirected us and the caller should dial again.
    async fn handshake(
        &mut self,
        options: &ConnectionOptions,
        client_properties: &Table,
        login_response: &Bytes,
    ) -> AmqpResult<Option<String>> {
        self.transport
            .as_mut()
            .ok_or(AmqpError::InvalidState("connection is closed"))?
            .write_protocol_header()
            .await?;

        let mut start = self
            .wait_method(0, Some(&[method::CONNECTION_START]), None)
            .await?;
        self.version_major = start.args.read_octet()?;
        self.version_minor = start.args.read_octet()?;
        self.server_properties = start.args.read_table()?;
        self.mechanisms = split_space(&start.args.read_longstr()?);
        self.locales = split_space(&start.args.read_longstr()?);
        debug!(
            version_major = self.version_major,
            version_minor = self.version_minor,
            mechanisms = ?self.mechanisms,
            locales = ?self.locales,
            "server start"
        );

        let mut args = Writer::new();
        args.write_table(client_properties)?;
        args.write_shortstr(&options.login_method)?;
        args.write_longstr(login_response);
        args.write_shortstr(&options.locale)?;
        self.send_method(0, method::CONNECTION_START_OK, args, None)
            .await?;

        // The server may interpose any number of Secure challenges
        // before it settles on Tune.
        loop {
            let mut m = self
                .wait_method(
                    0,
                    Some(&[method::CONNECTION_SECURE, method::CONNECTION_TUNE]),
                    None,
                )
                .await?;
            match m.sig {
                method::CONNECTION_SECURE => {
                    let _challenge = m.args.read_longstr()?;
                    let mut args = Writer::new();
                    args.write_longstr(login_response);
                    self.send_method(0, method::CONNECTION_SECURE_OK, args, None)
                        .await?;
                }
                method::CONNECTION_TUNE => {
                    let server_channel_max = m.args.read_short()?;
                    let server_frame_max = m.args.read_long()?;
                    let _server_heartbeat = m.args.read_short()?;
                    self.channel_max = negotiated(server_channel_max, self.channel_max);
                    self.frame_max =
                        negotiated(server_frame_max, self.frame_max).max(MIN_FRAME_MAX);
                    self.writer.frame_max = self.frame_max;
                    debug!(
                        channel_max = self.channel_max,
                        frame_max = self.frame_max,
                        heartbeat = self.heartbeat,
                        "tuned"
                    );
                    let mut args = Writer::new();
                    args.write_short(self.channel_max);
                    args.write_long(self.frame_max);
                    args.write_short(self.heartbeat);
                    self.send_method(0, method::CONNECTION_TUNE_OK, args, None)
                        .await?;
                    break;
                }
                sig => return Err(AmqpError::UnexpectedMethod { channel: 0, sig }),
            }
        }

        let mut args = Writer::new();
        args.write_shortstr(&options.virtual_host)?;
        args.write_shortstr("")?; // capabilities
        args.write_bit(options.insist);
        self.send_method(0, method::CONNECTION_OPEN, args, None)
            .await?;

        let mut m = self
            .wait_method(
                0,
                Some(&[method::CONNECTION_OPEN_OK, method::CONNECTION_REDIRECT]),
                None,
            )
            .await?;
        match m.sig {
            method::CONNECTION_OPEN_OK => {
                self.known_hosts = m.args.read_shortstr()?;
                if let Some(chan) = self.channels.get_mut(&0) {
                    chan.is_open = true;
                }
                debug!(known_hosts = %self.known_hosts, "connection open");
                Ok(None)
            }
            method::CONNECTION_REDIRECT => {
                let redirect_host = m.args.read_shortstr()?;
                self.known_hosts = m.args.read_shortstr()?;
                debug!(host = %redirect_host, known_hosts = %self.known_hosts, "redirected");
                Ok(Some(redirect_host))
            }
            sig => Err(AmqpError::UnexpectedMethod { channel: 0, sig }),
        }
    }

    /// Sends one method on `channel`, with optional content. This is the
    /// outbound half every per-method wrapper reduces to.
    pub async fn send_method(
        &mut self,
        channel: u16,
        sig: MethodSignature,
        args: Writer,
        content: Option<&mut Message>,
    ) -> AmqpResult<()> {
        let payload = args.into_bytes();
        let transport = self
            .transport
            .as_mut()
            .ok_or(AmqpError::InvalidState("connection is closed"))?;
        self.writer
            .write_method(transport, channel, sig, &payload, content)
            .await
    }

    /// Waits for a method on one channel. See `wait_on`.
    pub(crate) async fn wait_method(
        &mut self,
        channel: u16,
        allowed: Option<&[MethodSignature]>,
        timeout: Option<Duration>,
    ) -> AmqpResult<IncomingMethod> {
        self.wait_on(&[channel], allowed, timeout).await
    }

    /// Waits until one of `channel_ids` produces a method admitted by
    /// `allowed` (`Channel.Close` always is). Methods for other channels
    /// are parked on their queues; channel-0 traffic that nobody asked
    /// for is handled immediately, because mid-wait it is almost always
    /// a peer-initiated close.
    async fn wait_on(
        &mut self,
        channel_ids: &[u16],
        allowed: Option<&[MethodSignature]>,
        timeout: Option<Duration>,
    ) -> AmqpResult<IncomingMethod> {
        for &id in channel_ids {
            if let Some(chan) = self.channels.get_mut(&id) {
                if let Some(pos) = chan.queue.iter().position(|item| item.admissible(allowed)) {
                    match chan.queue.remove(pos) {
                        Some(QueuedItem::Method(m)) => return Ok(m),
                        Some(QueuedItem::Error(e)) => return Err(e),
                        None => {}
                    }
                }
            }
        }

        loop {
            let delivery = {
                let transport = self
                    .transport
                    .as_mut()
                    .ok_or(AmqpError::InvalidState("connection is closed"))?;
                self.reader.read_method(transport, timeout).await
            };
            match delivery {
                Delivery::TimedOut => return Err(AmqpError::Timeout),
                Delivery::Fatal(e) => {
                    self.teardown().await;
                    return Err(e);
                }
                Delivery::ChannelError { channel, error } => {
                    if channel == 0 || channel_ids.contains(&channel) {
                        return Err(error);
                    }
                    self.channel_entry(channel)
                        .queue
                        .push_back(QueuedItem::Error(error));
                }
                Delivery::Method(m) => {
                    if channel_ids.contains(&m.channel) && sig_admissible(m.sig, allowed) {
                        return Ok(m);
                    }
                    let channel = m.channel;
                    self.channel_entry(channel)
                        .queue
                        .push_back(QueuedItem::Method(m));
                    if channel == 0 {
                        self.handle_pending_connection_method().await?;
                    }
                }
            }
        }
    }

    fn channel_entry(&mut self, channel: u16) -> &mut ChannelState {
        self.channels
            .entry(channel)
            .or_insert_with(|| ChannelState::new(channel))
    }

    async fn handle_pending_connection_method(&mut self) -> AmqpResult<()> {
        let item = self.channels.get_mut(&0).and_then(|c| c.queue.pop_front());
        match item {
            Some(QueuedItem::Method(m)) => self.dispatch_connection_method(m).await,
            Some(QueuedItem::Error(e)) => Err(e),
            None => Ok(()),
        }
    }

    /// Channel-0 method table. Only the close handshake is legitimate
    /// outside the connection setup sequence.
    async fn dispatch_connection_method(&mut self, mut m: IncomingMethod) -> AmqpResult<()> {
        match m.sig {
            method::CONNECTION_CLOSE => {
                let reply_code = m.args.read_short()?;
                let reply_text = m.args.read_shortstr()?;
                let cause =
                    MethodSignature::new(m.args.read_short()?, m.args.read_short()?);
                warn!(reply_code, %reply_text, "connection closed by peer");
                if let Err(e) = self
                    .send_method(0, method::CONNECTION_CLOSE_OK, Writer::new(), None)
                    .await
                {
                    debug!(error = %e, "could not acknowledge peer close");
                }
                self.teardown().await;
                Err(AmqpError::ConnectionClosedByPeer {
                    reply_code,
                    reply_text,
                    cause,
                })
            }
            method::CONNECTION_CLOSE_OK => {
                self.teardown().await;
                Ok(())
            }
            sig => Err(AmqpError::UnexpectedMethod { channel: 0, sig }),
        }
    }

    /// Opens a channel, picking the first free id in `[1, channel_max]`
    /// unless the caller asks for a specific one.
    pub async fn open_channel(&mut self, channel_id: Option<u16>) -> AmqpResult<u16> {
        let id = match channel_id {
            Some(id) => {
                if id == 0 || id > self.channel_max {
                    return Err(AmqpError::InvalidState("channel id out of range"));
                }
                if self.channels.contains_key(&id) {
                    return Err(AmqpError::InvalidState("channel id already in use"));
                }
                id
            }
            None => (1..=self.channel_max)
                .find(|id| !self.channels.contains_key(id))
                .ok_or(AmqpError::NoFreeChannels {
                    channel_max: self.channel_max,
                })?,
        };
        self.channels.insert(id, ChannelState::new(id));

        let mut args = Writer::new();
        args.write_shortstr("")?; // out-of-band settings, unused
        if let Err(e) = self.send_method(id, method::CHANNEL_OPEN, args, None).await {
            self.channels.remove(&id);
            return Err(e);
        }
        match self
            .wait_method(id, Some(&[method::CHANNEL_OPEN_OK]), None)
            .await
        {
            Ok(m) if m.sig == method::CHANNEL_CLOSE => Err(self.peer_channel_close(m).await),
            Ok(_) => {
                if let Some(chan) = self.channels.get_mut(&id) {
                    chan.is_open = true;
                }
                debug!(channel = id, "channel open");
                Ok(id)
            }
            Err(e) => {
                self.channels.remove(&id);
                Err(e)
            }
        }
    }

    /// Closes one channel. Closing a channel that is already gone is a
    /// no-op.
    pub async fn close_channel(
        &mut self,
        channel: u16,
        reply_code: u16,
        reply_text: &str,
        cause: MethodSignature,
    ) -> AmqpResult<()> {
        if channel == 0 {
            return Err(AmqpError::InvalidState(
                "channel 0 is the connection; use close",
            ));
        }
        if !self.channels.contains_key(&channel) {
            return Ok(());
        }

        let mut args = Writer::new();
        args.write_short(reply_code);
        args.write_shortstr(reply_text)?;
        args.write_short(cause.class_id);
        args.write_short(cause.method_id);
        self.send_method(channel, method::CHANNEL_CLOSE, args, None)
            .await?;

        let m = self
            .wait_method(channel, Some(&[method::CHANNEL_CLOSE_OK]), None)
            .await?;
        if m.sig == method::CHANNEL_CLOSE {
            return Err(self.peer_channel_close(m).await);
        }
        self.channels.remove(&channel);
        debug!(channel, "channel closed");
        Ok(())
    }

    /// Replies Close-Ok, drops the channel, and reports the peer's
    /// reason.
    async fn peer_channel_close(&mut self, mut m: IncomingMethod) -> AmqpError {
        let channel = m.channel;
        let reply_code = match m.args.read_short() {
            Ok(v) => v,
            Err(e) => return e.into(),
        };
        let reply_text = match m.args.read_shortstr() {
            Ok(v) => v,
            Err(e) => return e.into(),
        };
        let cause = match (m.args.read_short(), m.args.read_short()) {
            (Ok(class_id), Ok(method_id)) => MethodSignature::new(class_id, method_id),
            (Err(e), _) | (_, Err(e)) => return e.into(),
        };
        warn!(channel, reply_code, %reply_text, "channel closed by peer");
        if let Err(e) = self
            .send_method(channel, method::CHANNEL_CLOSE_OK, Writer::new(), None)
            .await
        {
            debug!(channel, error = %e, "could not acknowledge channel close");
        }
        self.channels.remove(&channel);
        AmqpError::ChannelClosedByPeer {
            channel,
            reply_code,
            reply_text,
            cause,
        }
    }

    /// Waits for an event on any channel and dispatches it.
    pub async fn drain_events(
        &mut self,
        timeout: Option<Duration>,
    ) -> AmqpResult<(u16, ChannelEvent)> {
        loop {
            let ids: Vec<u16> = self.channels.keys().copied().collect();
            let m = self.wait_on(&ids, None, timeout).await?;
            if m.channel == 0 {
                self.dispatch_connection_method(m).await?;
                continue;
            }
            if m.sig == method::CHANNEL_CLOSE {
                return Err(self.peer_channel_close(m).await);
            }
            let mut m = m;
            let channel = m.channel;
            if let Some(content) = m.content.as_mut() {
                let auto_decode = self
                    .channels
                    .get(&channel)
                    .is_none_or(|chan| chan.auto_decode);
                if auto_decode {
                    content.apply_auto_decode();
                }
            }
            return crate::channel::decode_event(m).map(|event| (channel, event));
        }
    }

    /// Requests an orderly shutdown and waits for the server's Close-Ok.
    pub async fn close(&mut self) -> AmqpResult<()> {
        self.close_with_cause(0, "", MethodSignature::new(0, 0)).await
    }

    pub async fn close_with_cause(
        &mut self,
        reply_code: u16,
        reply_text: &str,
        cause: MethodSignature,
    ) -> AmqpResult<()> {
        if self.transport.is_none() {
            return Ok(());
        }
        let mut args = Writer::new();
        args.write_short(reply_code);
        args.write_shortstr(reply_text)?;
        args.write_short(cause.class_id);
        args.write_short(cause.method_id);
        self.send_method(0, method::CONNECTION_CLOSE, args, None)
            .await?;
        self.wait_method(0, Some(&[method::CONNECTION_CLOSE_OK]), None)
            .await?;
        self.teardown().await;
        Ok(())
    }

    /// Releases the transport and every channel. Safe to call twice.
    pub(crate) async fn teardown(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown().await;
        }
        self.channels.clear();
        // Any outstanding heartbeat monitor is stale now.
        self.heartbeat_generation = self.heartbeat_generation.wrapping_add(1);
    }

    /// Creates the monitor for this connection, superseding any earlier
    /// one. `None` when heartbeats were disabled at negotiation.
    pub fn heartbeat_monitor(&mut self) -> Option<HeartbeatMonitor> {
        if self.heartbeat == 0 {
            return None;
        }
        self.heartbeat_generation = self.heartbeat_generation.wrapping_add(1);
        Some(HeartbeatMonitor::new(self.heartbeat, self.heartbeat_generation))
    }

    pub(crate) async fn send_heartbeat(&mut self) -> AmqpResult<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(AmqpError::InvalidState("connection is closed"))?;
        self.writer.send_heartbeat(transport).await?;
        Ok(())
    }

    /// Frames written so far (a counter, not bytes).
    pub fn frames_sent(&self) -> u64 {
        self.writer.bytes_sent
    }

    /// Frames read so far (a counter, not bytes).
    pub fn frames_recv(&self) -> u64 {
        self.reader.bytes_recv
    }

    pub(crate) fn heartbeat_generation(&self) -> u64 {
        self.heartbeat_generation
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn channel_max(&self) -> u16 {
        self.channel_max
    }

    pub fn frame_max(&self) -> u32 {
        self.frame_max
    }

    pub fn heartbeat(&self) -> u16 {
        self.heartbeat
    }

    pub fn known_hosts(&self) -> &str {
        &self.known_hosts
    }

    pub fn server_properties(&self) -> &Table {
        &self.server_properties
    }

    pub fn mechanisms(&self) -> &[String] {
        &self.mechanisms
    }

    pub fn locales(&self) -> &[String] {
        &self.locales
    }

    pub fn server_version(&self) -> (u8, u8) {
        (self.version_major, self.version_minor)
    }

    pub fn is_channel_open(&self, channel: u16) -> bool {
        self.channels.get(&channel).is_some_and(|chan| chan.is_open)
    }

    /// Ids of the user channels currently open, ascending.
    pub fn open_channels(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self
            .channels
            .values()
            .filter(|chan| chan.is_open && chan.channel_id != 0)
            .map(|chan| chan.channel_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Controls UTF-8 body decoding for content delivered on `channel`.
    pub fn set_auto_decode(&mut self, channel: u16, enabled: bool) {
        if let Some(chan) = self.channels.get_mut(&channel) {
            chan.auto_decode = enabled;
        }
    }
}

/// Client identification sent in Start-Ok, under any caller-supplied
/// properties.
fn library_properties() -> Table {
    let mut table = Table::new();
    table.insert("library".into(), TableValue::from("amqp08 (rust)"));
    table.insert(
        "library_version".into(),
        TableValue::from(env!("CARGO_PKG_VERSION")),
    );
    table
}

/// The AMQPLAIN response: a `{LOGIN, PASSWORD}` field table serialized
/// without its length prefix.
fn amqplain_response(userid: &str, password: &str) -> Result<Bytes, FrameFormatError> {
    let mut table = Table::new();
    table.insert("LOGIN".into(), TableValue::from(userid));
    table.insert("PASSWORD".into(), TableValue::from(password));
    encode_table_entries(&table)
}

/// Tune negotiation: zero means "no preference", otherwise the smaller
/// value wins.
fn negotiated<T: Ord + Copy + Default>(server: T, client: T) -> T {
    if server == T::default() {
        client
    } else if client == T::default() {
        server
    } else {
        server.min(client)
    }
}

fn split_space(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .split(' ')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
