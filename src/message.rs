// Content messages and their header-frame property encoding.

use crate::codec::{FrameFormatError, Reader, Table, Timestamp, Writer};
use bytes::Bytes;

/// A message body. Text bodies are encoded as UTF-8 on the wire and have
/// their `content_encoding` property defaulted accordingly when sent.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Binary(Bytes),
    Text(String),
}

impl Body {
    pub fn len(&self) -> usize {
        match self {
            Body::Binary(b) => b.len(),
            Body::Text(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Binary(b) => b,
            Body::Text(s) => s.as_bytes(),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Binary(Bytes::new())
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Body::Text(value.to_owned())
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::Text(value)
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Body::Binary(value)
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::Binary(Bytes::from(value))
    }
}

/// A content message: the fixed set of fourteen basic properties plus the
/// body. On the wire the properties travel in the content header frame
/// behind a 16-bit presence bitmap; the first declared property maps to
/// the most significant bit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub application_headers: Option<Table>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<Timestamp>,
    pub message_type: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
    pub body: Body,
}

impl Message {
    pub fn new(body: impl Into<Body>) -> Message {
        Message {
            body: body.into(),
            ..Message::default()
        }
    }

    /// Resolves the body to wire bytes. Text bodies get their
    /// `content_encoding` persisted as `UTF-8` when the sender left it
    /// unset.
    pub(crate) fn resolve_body(&mut self) -> Bytes {
        match &self.body {
            Body::Text(text) => {
                if self.content_encoding.is_none() {
                    self.content_encoding = Some("UTF-8".to_owned());
                }
                Bytes::copy_from_slice(text.as_bytes())
            }
            Body::Binary(bytes) => bytes.clone(),
        }
    }

    /// Re-interprets a binary body as text when the content encoding says
    /// it is UTF-8. Anything that does not decode stays binary.
    pub(crate) fn apply_auto_decode(&mut self) {
        let utf8 = self
            .content_encoding
            .as_deref()
            .is_some_and(|enc| enc.eq_ignore_ascii_case("utf-8") || enc.eq_ignore_ascii_case("utf8"));
        if !utf8 {
            return;
        }
        if let Body::Binary(bytes) = &self.body {
            if let Ok(text) = std::str::from_utf8(bytes) {
                self.body = Body::Text(text.to_owned());
            }
        }
    }

    /// Encodes the property bitmap and the present fields, in
    /// declaration order, as carried by the content header frame.
    pub fn serialize_properties(&self) -> Result<Bytes, FrameFormatError> {
        let mut flags = 0u16;
        let mut present = |set: bool, bit: u16| {
            if set {
                flags |= 1 << (15 - bit);
            }
        };
        present(self.content_type.is_some(), 0);
        present(self.content_encoding.is_some(), 1);
        present(self.application_headers.is_some(), 2);
        present(self.delivery_mode.is_some(), 3);
        present(self.priority.is_some(), 4);
        present(self.correlation_id.is_some(), 5);
        present(self.reply_to.is_some(), 6);
        present(self.expiration.is_some(), 7);
        present(self.message_id.is_some(), 8);
        present(self.timestamp.is_some(), 9);
        present(self.message_type.is_some(), 10);
        present(self.user_id.is_some(), 11);
        present(self.app_id.is_some(), 12);
        present(self.cluster_id.is_some(), 13);

        let mut w = Writer::new();
        w.write_short(flags);
        if let Some(v) = &self.content_type {
            w.write_shortstr(v)?;
        }
        if let Some(v) = &self.content_encoding {
            w.write_shortstr(v)?;
        }
        if let Some(v) = &self.application_headers {
            w.write_table(v)?;
        }
        if let Some(v) = self.delivery_mode {
            w.write_octet(v);
        }
        if let Some(v) = self.priority {
            w.write_octet(v);
        }
        if let Some(v) = &self.correlation_id {
            w.write_shortstr(v)?;
        }
        if let Some(v) = &self.reply_to {
            w.write_shortstr(v)?;
        }
        if let Some(v) = &self.expiration {
            w.write_shortstr(v)?;
        }
        if let Some(v) = &self.message_id {
            w.write_shortstr(v)?;
        }
        if let Some(v) = self.timestamp {
            w.write_timestamp(v);
        }
        if let Some(v) = &self.message_type {
            w.write_shortstr(v)?;
        }
        if let Some(v) = &self.user_id {
            w.write_shortstr(v)?;
        }
        if let Some(v) = &self.app_id {
            w.write_shortstr(v)?;
        }
        if let Some(v) = &self.cluster_id {
            w.write_shortstr(v)?;
        }
        Ok(w.into_bytes())
    }

    /// Builds a message (empty body) from a content header's property
    /// blob.
    pub fn load_properties(blob: Bytes) -> Result<Message, FrameFormatError> {
        let mut r = Reader::new(blob);
        let flags = r.read_short()?;
        let is_set = |bit: u16| flags & (1 << (15 - bit)) != 0;

        let mut msg = Message::default();
        if is_set(0) {
            msg.content_type = Some(r.read_shortstr()?);
        }
        if is_set(1) {
            msg.content_encoding = Some(r.read_shortstr()?);
        }
        if is_set(2) {
            msg.application_headers = Some(r.read_table()?);
        }
        if is_set(3) {
            msg.delivery_mode = Some(r.read_octet()?);
        }
        if is_set(4) {
            msg.priority = Some(r.read_octet()?);
        }
        if is_set(5) {
            msg.correlation_id = Some(r.read_shortstr()?);
        }
        if is_set(6) {
            msg.reply_to = Some(r.read_shortstr()?);
        }
        if is_set(7) {
            msg.expiration = Some(r.read_shortstr()?);
        }
        if is_set(8) {
            msg.message_id = Some(r.read_shortstr()?);
        }
        if is_set(9) {
            msg.timestamp = Some(r.read_timestamp()?);
        }
        if is_set(10) {
            msg.message_type = Some(r.read_shortstr()?);
        }
        if is_set(11) {
            msg.user_id = Some(r.read_shortstr()?);
        }
        if is_set(12) {
            msg.app_id = Some(r.read_shortstr()?);
        }
        if is_set(13) {
            msg.cluster_id = Some(r.read_shortstr()?);
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TableValue;

    fn reload(msg: &Message) -> Message {
        Message::load_properties(msg.serialize_properties().unwrap()).unwrap()
    }

    #[test]
    fn no_properties_is_a_bare_bitmap() {
        let msg = Message::default();
        let blob = msg.serialize_properties().unwrap();
        assert_eq!(blob.as_ref(), &[0, 0]);
        assert_eq!(reload(&msg), Message::default());
    }

    #[test]
    fn first_property_sets_the_top_bit() {
        let msg = Message {
            content_type: Some("text/plain".into()),
            ..Message::default()
        };
        let blob = msg.serialize_properties().unwrap();
        assert_eq!(blob[0], 0x80);
        assert_eq!(blob[1], 0x00);
    }

    #[test]
    fn last_property_sets_bit_two() {
        let msg = Message {
            cluster_id: Some("cluster-1".into()),
            ..Message::default()
        };
        let blob = msg.serialize_properties().unwrap();
        assert_eq!(blob[0], 0x00);
        assert_eq!(blob[1], 0x04);
    }

    #[test]
    fn full_property_roundtrip() {
        let mut headers = Table::new();
        headers.insert("retries".into(), TableValue::Long(3));

        let msg = Message {
            content_type: Some("application/json".into()),
            content_encoding: Some("UTF-8".into()),
            application_headers: Some(headers),
            delivery_mode: Some(2),
            priority: Some(5),
            correlation_id: Some("corr-9".into()),
            reply_to: Some("reply.queue".into()),
            expiration: Some("60000".into()),
            message_id: Some("msg-1".into()),
            timestamp: Some(Timestamp(1_234_567_890)),
            message_type: Some("event".into()),
            user_id: Some("guest".into()),
            app_id: Some("worker".into()),
            cluster_id: Some("c1".into()),
            body: Body::default(),
        };
        assert_eq!(reload(&msg), msg);
    }

    #[test]
    fn sparse_subsets_roundtrip() {
        // Exercise a few scattered subsets rather than every combination.
        let subsets: [&dyn Fn(&mut Message); 3] = [
            &|m| {
                m.delivery_mode = Some(1);
                m.timestamp = Some(Timestamp(77));
            },
            &|m| {
                m.content_encoding = Some("UTF-8".into());
                m.cluster_id = Some("x".into());
            },
            &|m| {
                m.priority = Some(9);
                m.reply_to = Some("q".into());
                m.app_id = Some("a".into());
            },
        ];
        for set in subsets {
            let mut msg = Message::default();
            set(&mut msg);
            assert_eq!(reload(&msg), msg);
        }
    }

    #[test]
    fn text_body_defaults_content_encoding() {
        let mut msg = Message::new("hello");
        let body = msg.resolve_body();
        assert_eq!(body.as_ref(), b"hello");
        assert_eq!(msg.content_encoding.as_deref(), Some("UTF-8"));
    }

    #[test]
    fn explicit_content_encoding_is_kept() {
        let mut msg = Message::new("hello");
        msg.content_encoding = Some("utf-8".into());
        msg.resolve_body();
        assert_eq!(msg.content_encoding.as_deref(), Some("utf-8"));
    }

    #[test]
    fn auto_decode_honors_content_encoding() {
        let mut msg = Message::new(Bytes::from_static("caf\u{e9}".as_bytes()));
        msg.content_encoding = Some("UTF-8".into());
        msg.apply_auto_decode();
        assert_eq!(msg.body, Body::Text("caf\u{e9}".into()));

        // Invalid UTF-8 stays binary.
        let mut msg = Message::new(Bytes::from_static(b"\xFF\xFE"));
        msg.content_encoding = Some("UTF-8".into());
        msg.apply_auto_decode();
        assert_eq!(msg.body, Body::Binary(Bytes::from_static(b"\xFF\xFE")));

        // No declared encoding: leave it alone.
        let mut msg = Message::new(Bytes::from_static(b"plain"));
        msg.apply_auto_decode();
        assert_eq!(msg.body, Body::Binary(Bytes::from_static(b"plain")));
    }
}
