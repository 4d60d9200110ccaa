// AMQP 0-8 primitive type codec.
//
// A `Reader` consumes wire primitives from a frame payload and a `Writer`
// accumulates them into one. Both keep a bit cursor so that consecutive
// boolean fields pack LSB-first into shared octets; any non-bit access
// resets the cursor, matching the 0-8 grammar.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use indexmap::IndexMap;
use thiserror::Error;

/// Field tables preserve insertion order on the wire.
pub type Table = IndexMap<String, TableValue>;

/// Errors raised while decoding or encoding wire data. All of these are
/// fatal to the connection except `Incomplete`, which the transport uses
/// internally to wait for more buffered bytes.
#[derive(Debug, Error)]
pub enum FrameFormatError {
    /// Not enough data buffered to parse a whole frame yet
    #[error("incomplete frame: need more data")]
    Incomplete,

    /// Payload ended in the middle of a value
    #[error("truncated payload: {needed} more bytes required")]
    Truncated { needed: usize },

    /// Frame did not end with the 0xCE sentinel
    #[error("bad frame terminator: {found:#04x}")]
    BadFrameEnd { found: u8 },

    /// Frame type octet is not METHOD, HEADER, BODY, or HEARTBEAT
    #[error("unknown frame type: {0}")]
    UnknownFrameKind(u8),

    /// Table entry carries a type tag the codec does not know
    #[error("unknown table value tag: {0:#04x}")]
    UnknownTableTag(u8),

    /// Short strings are length-prefixed with a single octet
    #[error("short string of {0} bytes exceeds 255")]
    ShortStringTooLong(usize),

    /// Short strings are required to be UTF-8
    #[error("invalid utf-8 in short string")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// A 64-bit POSIX timestamp, seconds since epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

/// AMQP decimal: a signed value scaled by a power of ten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decimal {
    pub scale: u8,
    pub value: i32,
}

/// A single field-table value.
///
/// Wire tags: `S` string, `I` signed 32-bit, `D` decimal, `T` timestamp,
/// `F` nested table.
#[derive(Debug, Clone, PartialEq)]
pub enum TableValue {
    String(String),
    Long(i32),
    Decimal(Decimal),
    Timestamp(Timestamp),
    Table(Table),
}

impl From<&str> for TableValue {
    fn from(value: &str) -> Self {
        TableValue::String(value.to_owned())
    }
}

impl From<String> for TableValue {
    fn from(value: String) -> Self {
        TableValue::String(value)
    }
}

impl From<i32> for TableValue {
    fn from(value: i32) -> Self {
        TableValue::Long(value)
    }
}

/// Decodes primitives from an owned payload slice.
#[derive(Debug, Clone)]
pub struct Reader {
    buf: Bytes,
    bits: u8,
    bitcount: u8,
}

impl Reader {
    pub fn new(buf: Bytes) -> Self {
        Reader {
            buf,
            bits: 0,
            bitcount: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<(), FrameFormatError> {
        if self.buf.remaining() < n {
            return Err(FrameFormatError::Truncated {
                needed: n - self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn reset_bits(&mut self) {
        self.bits = 0;
        self.bitcount = 0;
    }

    pub fn read_octet(&mut self) -> Result<u8, FrameFormatError> {
        self.reset_bits();
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_short(&mut self) -> Result<u16, FrameFormatError> {
        self.reset_bits();
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_long(&mut self) -> Result<u32, FrameFormatError> {
        self.reset_bits();
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_longlong(&mut self) -> Result<u64, FrameFormatError> {
        self.reset_bits();
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    /// Bits pack LSB-first into octets; the cursor survives until any
    /// non-bit read.
    pub fn read_bit(&mut self) -> Result<bool, FrameFormatError> {
        if self.bitcount == 0 {
            self.need(1)?;
            self.bits = self.buf.get_u8();
            self.bitcount = 8;
        }
        let result = self.bits & 1 == 1;
        self.bits >>= 1;
        self.bitcount -= 1;
        Ok(result)
    }

    pub fn read_shortstr(&mut self) -> Result<String, FrameFormatError> {
        self.reset_bits();
        self.need(1)?;
        let len = self.buf.get_u8() as usize;
        self.need(len)?;
        Ok(String::from_utf8(self.buf.split_to(len).to_vec())?)
    }

    /// Long strings are opaque binary on the wire.
    pub fn read_longstr(&mut self) -> Result<Bytes, FrameFormatError> {
        self.reset_bits();
        self.need(4)?;
        let len = self.buf.get_u32() as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn read_timestamp(&mut self) -> Result<Timestamp, FrameFormatError> {
        Ok(Timestamp(self.read_longlong()?))
    }

    /// Consumes and returns everything left in the payload.
    pub fn take_remaining(&mut self) -> Bytes {
        self.reset_bits();
        self.buf.split_to(self.buf.len())
    }

    pub fn read_table(&mut self) -> Result<Table, FrameFormatError> {
        self.reset_bits();
        self.need(4)?;
        let len = self.buf.get_u32() as usize;
        self.need(len)?;
        let mut entries = Reader::new(self.buf.split_to(len));

        let mut table = Table::new();
        while entries.remaining() > 0 {
            let name = entries.read_shortstr()?;
            let value = entries.read_table_value()?;
            table.insert(name, value);
        }
        Ok(table)
    }

    fn read_table_value(&mut self) -> Result<TableValue, FrameFormatError> {
        let tag = self.read_octet()?;
        Ok(match tag {
            b'S' => {
                let raw = self.read_longstr()?;
                TableValue::String(String::from_utf8(raw.to_vec())?)
            }
            b'I' => TableValue::Long(self.read_long()? as i32),
            b'D' => TableValue::Decimal(Decimal {
                scale: self.read_octet()?,
                value: self.read_long()? as i32,
            }),
            b'T' => TableValue::Timestamp(self.read_timestamp()?),
            b'F' => TableValue::Table(self.read_table()?),
            other => return Err(FrameFormatError::UnknownTableTag(other)),
        })
    }
}

/// Accumulates primitives into a linear byte buffer.
#[derive(Debug, Default)]
pub struct Writer {
    out: BytesMut,
    bits: u8,
    bitcount: u8,
}

impl Writer {
    pub fn new() -> Self {
        Writer::default()
    }

    /// Flushes any pending bits and returns the accumulated payload.
    pub fn into_bytes(mut self) -> Bytes {
        self.flush_bits();
        self.out.freeze()
    }

    pub fn len(&self) -> usize {
        self.out.len() + usize::from(self.bitcount > 0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes out the partially filled bit octet, if any.
    pub fn flush_bits(&mut self) {
        if self.bitcount > 0 {
            self.out.put_u8(self.bits);
            self.bits = 0;
            self.bitcount = 0;
        }
    }

    pub fn write_octet(&mut self, value: u8) {
        self.flush_bits();
        self.out.put_u8(value);
    }

    pub fn write_short(&mut self, value: u16) {
        self.flush_bits();
        self.out.put_u16(value);
    }

    pub fn write_long(&mut self, value: u32) {
        self.flush_bits();
        self.out.put_u32(value);
    }

    pub fn write_longlong(&mut self, value: u64) {
        self.flush_bits();
        self.out.put_u64(value);
    }

    /// Buffers up to eight bits in one octet; a ninth bit, a non-bit
    /// write, or `flush_bits` emits the octet.
    pub fn write_bit(&mut self, value: bool) {
        if self.bitcount == 8 {
            self.flush_bits();
        }
        if value {
            self.bits |= 1 << self.bitcount;
        }
        self.bitcount += 1;
    }

    pub fn write_shortstr(&mut self, value: &str) -> Result<(), FrameFormatError> {
        if value.len() > 255 {
            return Err(FrameFormatError::ShortStringTooLong(value.len()));
        }
        self.flush_bits();
        self.out.put_u8(value.len() as u8);
        self.out.put_slice(value.as_bytes());
        Ok(())
    }

    pub fn write_longstr(&mut self, value: &[u8]) {
        self.flush_bits();
        self.out.put_u32(value.len() as u32);
        self.out.put_slice(value);
    }

    pub fn write_timestamp(&mut self, value: Timestamp) {
        self.write_longlong(value.0);
    }

    pub fn write_table(&mut self, table: &Table) -> Result<(), FrameFormatError> {
        let entries = encode_table_entries(table)?;
        self.write_longstr(&entries);
        Ok(())
    }

    fn write_table_value(&mut self, value: &TableValue) -> Result<(), FrameFormatError> {
        match value {
            TableValue::String(s) => {
                self.write_octet(b'S');
                self.write_longstr(s.as_bytes());
            }
            TableValue::Long(v) => {
                self.write_octet(b'I');
                self.write_long(*v as u32);
            }
            TableValue::Decimal(d) => {
                self.write_octet(b'D');
                self.write_octet(d.scale);
                self.write_long(d.value as u32);
            }
            TableValue::Timestamp(t) => {
                self.write_octet(b'T');
                self.write_timestamp(*t);
            }
            TableValue::Table(t) => {
                self.write_octet(b'F');
                self.write_table(t)?;
            }
        }
        Ok(())
    }
}

/// Encodes a table without its leading length prefix. The AMQPLAIN SASL
/// response is exactly this encoding.
pub fn encode_table_entries(table: &Table) -> Result<Bytes, FrameFormatError> {
    let mut entries = Writer::new();
    for (name, value) in table {
        entries.write_shortstr(name)?;
        entries.write_table_value(value)?;
    }
    Ok(entries.into_bytes())
}
