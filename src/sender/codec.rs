//! AMQP 1.0 message encoding for the outbound path, and the matching
//! decoder for the subset this crate produces.
//!
//! A message body is a sequence of described sections: header,
//! (optional) delivery- and message-annotations, properties,
//! application-properties, one binary data section, (optional) footer.
//! The encoder emits header, properties, application-properties and
//! data; the decoder additionally skips annotation and footer sections.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::core::error::{Error, Result};
use crate::core::message::{Address, EncodedMessage, Message, ReceivedHeader};
use crate::core::values::{FieldTable, FieldValue};

/// Reserved header prefix: such keys travel in standard sections, never
/// in application-properties.
pub const X_AMQP_PREFIX: &str = "x-amqp-";

pub const X_AMQP_FIRST_ACQUIRER: &str = "x-amqp-first-acquirer";
pub const X_AMQP_DELIVERY_COUNT: &str = "x-amqp-delivery-count";
pub const X_AMQP_TO: &str = "x-amqp-to";
pub const X_AMQP_CONTENT_ENCODING: &str = "x-amqp-content-encoding";
pub const X_AMQP_CREATION_TIME: &str = "x-amqp-creation-time";
pub const X_AMQP_ABSOLUTE_EXPIRY_TIME: &str = "x-amqp-absolute-expiry-time";
pub const X_AMQP_GROUP_ID: &str = "x-amqp-group-id";
pub const X_AMQP_GROUP_SEQUENCE: &str = "x-amqp-group-sequence";
pub const X_AMQP_REPLY_TO_GROUP_ID: &str = "x-amqp-reply-to-group-id";

// section descriptor codes
const HEADER: u64 = 0x70;
const DELIVERY_ANNOTATIONS: u64 = 0x71;
const MESSAGE_ANNOTATIONS: u64 = 0x72;
const PROPERTIES: u64 = 0x73;
const APPLICATION_PROPERTIES: u64 = 0x74;
const DATA: u64 = 0x75;
const FOOTER: u64 = 0x78;

/* -------------------------------- encode -------------------------------- */

/// Header-section fields derived from a message.
fn header_of(msg: &Message) -> ReceivedHeader {
    let first_acquirer = msg
        .with_headers(|h| h.get(X_AMQP_FIRST_ACQUIRER).map(FieldValue::is_truthy))
        .unwrap_or(false);
    let delivery_count = msg
        .with_headers(|h| h.get(X_AMQP_DELIVERY_COUNT).and_then(FieldValue::as_int))
        .map(|v| v.max(0) as u32)
        .unwrap_or_else(|| u32::from(msg.is_redelivered()));
    ReceivedHeader {
        durable: msg.durable(),
        priority: msg.priority(),
        ttl: msg.ttl(),
        first_acquirer,
        delivery_count,
    }
}

fn subject_changed(msg: &Message, address: &Address) -> bool {
    match address.subject.as_deref() {
        Some(subject) if !subject.is_empty() => msg.subject() != Some(subject),
        _ => false,
    }
}

/// Encode a message for transfer to `address`.
///
/// Messages still carrying their original encoded form are forwarded
/// verbatim when nothing changed; a revised header is spliced in front
/// of the received bare message when only header fields differ.
pub fn encode_message(msg: &Message, address: &Address) -> Bytes {
    if let Some(original) = msg.original_encoded() {
        if !subject_changed(msg, address) {
            let header = header_of(msg);
            if header == original.header {
                // entire content as received
                return original.data.clone();
            }
            // revised header, then the bare message as received
            let mut buf = BytesMut::with_capacity(32 + original.bare_message().len());
            write_header(&mut buf, &header);
            buf.put_slice(original.bare_message());
            return buf.freeze();
        }
    }

    let mut buf = BytesMut::with_capacity(64 + msg.content().len());
    write_header(&mut buf, &header_of(msg));
    let bare_offset = buf.len();
    write_properties(&mut buf, msg, address);
    msg.with_headers(|headers| write_application_properties(&mut buf, headers));
    if !msg.content().is_empty() {
        write_data(&mut buf, msg.content());
    }
    debug!(bytes = buf.len(), bare_offset, "encoded outbound message");
    buf.freeze()
}

fn write_header(buf: &mut BytesMut, header: &ReceivedHeader) {
    let mut body = BytesMut::new();
    put_bool(&mut body, header.durable);
    put_ubyte(&mut body, header.priority);
    match header.ttl {
        Some(ttl) => put_uint(&mut body, ttl),
        None => put_null(&mut body),
    }
    put_bool(&mut body, header.first_acquirer);
    put_uint(&mut body, header.delivery_count);
    write_described_list(buf, HEADER, 5, &body);
}

fn write_properties(buf: &mut BytesMut, msg: &Message, address: &Address) {
    let headers = msg.headers_clone();
    let subject = address
        .subject
        .clone()
        .filter(|s| !s.is_empty())
        .or_else(|| msg.subject().map(str::to_string));
    let reply_to = msg.reply_to().map(|a| match &a.subject {
        Some(subject) => format!("{}/{}", a.name, subject),
        None => a.name.clone(),
    });

    let mut body = BytesMut::new();
    put_opt_string(&mut body, msg.message_id());
    match msg.user_id() {
        Some(id) => put_binary(&mut body, id.as_bytes()),
        None => put_null(&mut body),
    }
    put_opt_string(&mut body, headers.get_as_str(X_AMQP_TO));
    put_opt_string(&mut body, subject.as_deref());
    put_opt_string(&mut body, reply_to.as_deref());
    put_opt_string(&mut body, msg.correlation_id());
    put_opt_symbol(&mut body, msg.content_type());
    put_opt_symbol(&mut body, headers.get_as_str(X_AMQP_CONTENT_ENCODING));
    put_opt_timestamp(&mut body, int_header(&headers, X_AMQP_ABSOLUTE_EXPIRY_TIME));
    put_opt_timestamp(&mut body, int_header(&headers, X_AMQP_CREATION_TIME));
    put_opt_string(&mut body, headers.get_as_str(X_AMQP_GROUP_ID));
    match int_header(&headers, X_AMQP_GROUP_SEQUENCE) {
        Some(seq) => put_uint(&mut body, seq.max(0) as u32),
        None => put_null(&mut body),
    }
    put_opt_string(&mut body, headers.get_as_str(X_AMQP_REPLY_TO_GROUP_ID));
    write_described_list(buf, PROPERTIES, 13, &body);
}

fn int_header(headers: &FieldTable, key: &str) -> Option<i64> {
    headers.get(key).and_then(FieldValue::as_int)
}

fn write_application_properties(buf: &mut BytesMut, headers: &FieldTable) {
    let mut body = BytesMut::new();
    let mut count = 0u32;
    for (key, value) in headers.iter() {
        // special keys are sent in standard fields
        if key.starts_with(X_AMQP_PREFIX) {
            continue;
        }
        match value {
            FieldValue::Uuid(_) => {
                warn!(%key, "skipping UUID in application properties");
                continue;
            }
            FieldValue::List(_) | FieldValue::Map(_) => {
                warn!(%key, "skipping nested list or map; not allowed in application properties");
                continue;
            }
            _ => {}
        }
        put_string(&mut body, key);
        put_scalar(&mut body, value);
        count += 2;
    }
    write_described_map(buf, APPLICATION_PROPERTIES, count, &body);
}

fn write_data(buf: &mut BytesMut, content: &[u8]) {
    put_descriptor(buf, DATA);
    put_binary(buf, content);
}

/* --------------------------- primitive writers --------------------------- */

fn put_descriptor(buf: &mut BytesMut, code: u64) {
    buf.put_u8(0x00);
    put_ulong(buf, code);
}

fn write_described_list(buf: &mut BytesMut, code: u64, count: u32, body: &[u8]) {
    put_descriptor(buf, code);
    if body.len() + 1 <= u8::MAX as usize && count <= u8::MAX as u32 {
        buf.put_u8(0xc0);
        buf.put_u8(body.len() as u8 + 1);
        buf.put_u8(count as u8);
    } else {
        buf.put_u8(0xd0);
        buf.put_u32(body.len() as u32 + 4);
        buf.put_u32(count);
    }
    buf.put_slice(body);
}

fn write_described_map(buf: &mut BytesMut, code: u64, count: u32, body: &[u8]) {
    put_descriptor(buf, code);
    if body.len() + 1 <= u8::MAX as usize && count <= u8::MAX as u32 {
        buf.put_u8(0xc1);
        buf.put_u8(body.len() as u8 + 1);
        buf.put_u8(count as u8);
    } else {
        buf.put_u8(0xd1);
        buf.put_u32(body.len() as u32 + 4);
        buf.put_u32(count);
    }
    buf.put_slice(body);
}

fn put_null(buf: &mut BytesMut) {
    buf.put_u8(0x40);
}

fn put_bool(buf: &mut BytesMut, v: bool) {
    buf.put_u8(if v { 0x41 } else { 0x42 });
}

fn put_ubyte(buf: &mut BytesMut, v: u8) {
    buf.put_u8(0x50);
    buf.put_u8(v);
}

fn put_ushort(buf: &mut BytesMut, v: u16) {
    buf.put_u8(0x60);
    buf.put_u16(v);
}

fn put_uint(buf: &mut BytesMut, v: u32) {
    if v == 0 {
        buf.put_u8(0x43);
    } else if v <= u8::MAX as u32 {
        buf.put_u8(0x52);
        buf.put_u8(v as u8);
    } else {
        buf.put_u8(0x70);
        buf.put_u32(v);
    }
}

fn put_ulong(buf: &mut BytesMut, v: u64) {
    if v == 0 {
        buf.put_u8(0x44);
    } else if v <= u8::MAX as u64 {
        buf.put_u8(0x53);
        buf.put_u8(v as u8);
    } else {
        buf.put_u8(0x80);
        buf.put_u64(v);
    }
}

fn put_byte(buf: &mut BytesMut, v: i8) {
    buf.put_u8(0x51);
    buf.put_i8(v);
}

fn put_short(buf: &mut BytesMut, v: i16) {
    buf.put_u8(0x61);
    buf.put_i16(v);
}

fn put_int(buf: &mut BytesMut, v: i32) {
    if (i8::MIN as i32..=i8::MAX as i32).contains(&v) {
        buf.put_u8(0x54);
        buf.put_i8(v as i8);
    } else {
        buf.put_u8(0x71);
        buf.put_i32(v);
    }
}

fn put_long(buf: &mut BytesMut, v: i64) {
    if (i8::MIN as i64..=i8::MAX as i64).contains(&v) {
        buf.put_u8(0x55);
        buf.put_i8(v as i8);
    } else {
        buf.put_u8(0x81);
        buf.put_i64(v);
    }
}

fn put_float(buf: &mut BytesMut, v: f32) {
    buf.put_u8(0x72);
    buf.put_f32(v);
}

fn put_double(buf: &mut BytesMut, v: f64) {
    buf.put_u8(0x82);
    buf.put_f64(v);
}

fn put_timestamp(buf: &mut BytesMut, v: i64) {
    buf.put_u8(0x83);
    buf.put_i64(v);
}

fn put_opt_timestamp(buf: &mut BytesMut, v: Option<i64>) {
    match v {
        Some(v) => put_timestamp(buf, v),
        None => put_null(buf),
    }
}

fn put_string(buf: &mut BytesMut, v: &str) {
    let bytes = v.as_bytes();
    if bytes.len() <= u8::MAX as usize {
        buf.put_u8(0xa1);
        buf.put_u8(bytes.len() as u8);
    } else {
        buf.put_u8(0xb1);
        buf.put_u32(bytes.len() as u32);
    }
    buf.put_slice(bytes);
}

fn put_opt_string(buf: &mut BytesMut, v: Option<&str>) {
    match v {
        Some(v) => put_string(buf, v),
        None => put_null(buf),
    }
}

fn put_symbol(buf: &mut BytesMut, v: &str) {
    let bytes = v.as_bytes();
    if bytes.len() <= u8::MAX as usize {
        buf.put_u8(0xa3);
        buf.put_u8(bytes.len() as u8);
    } else {
        buf.put_u8(0xb3);
        buf.put_u32(bytes.len() as u32);
    }
    buf.put_slice(bytes);
}

fn put_opt_symbol(buf: &mut BytesMut, v: Option<&str>) {
    match v {
        Some(v) => put_symbol(buf, v),
        None => put_null(buf),
    }
}

fn put_binary(buf: &mut BytesMut, v: &[u8]) {
    if v.len() <= u8::MAX as usize {
        buf.put_u8(0xa0);
        buf.put_u8(v.len() as u8);
    } else {
        buf.put_u8(0xb0);
        buf.put_u32(v.len() as u32);
    }
    buf.put_slice(v);
}

/// Scalar application-property value by variant tag. Callers have
/// already filtered out UUIDs and nested values.
fn put_scalar(buf: &mut BytesMut, value: &FieldValue) {
    match value {
        FieldValue::Void => put_null(buf),
        FieldValue::Bool(v) => put_bool(buf, *v),
        FieldValue::U8(v) => put_ubyte(buf, *v),
        FieldValue::U16(v) => put_ushort(buf, *v),
        FieldValue::U32(v) => put_uint(buf, *v),
        FieldValue::U64(v) => put_ulong(buf, *v),
        FieldValue::I8(v) => put_byte(buf, *v),
        FieldValue::I16(v) => put_short(buf, *v),
        FieldValue::I32(v) => put_int(buf, *v),
        FieldValue::I64(v) => put_long(buf, *v),
        FieldValue::F32(v) => put_float(buf, *v),
        FieldValue::F64(v) => put_double(buf, *v),
        FieldValue::Str(v) => put_string(buf, v),
        FieldValue::Uuid(_) | FieldValue::List(_) | FieldValue::Map(_) => put_null(buf),
    }
}

/* -------------------------------- decode -------------------------------- */

/// Properties section as decoded.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DecodedProperties {
    pub message_id: Option<String>,
    pub user_id: Option<Vec<u8>>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub absolute_expiry_time: Option<i64>,
    pub creation_time: Option<i64>,
    pub group_id: Option<String>,
    pub group_sequence: Option<u32>,
    pub reply_to_group_id: Option<String>,
}

/// A received message, sectioned.
#[derive(Debug, Default, Clone)]
pub struct DecodedMessage {
    pub header: ReceivedHeader,
    pub properties: DecodedProperties,
    pub application_properties: FieldTable,
    pub body: Bytes,
    /// Offset of the first section after the header.
    pub bare_offset: usize,
}

impl DecodedMessage {
    /// Retain the received form for verbatim forwarding.
    pub fn into_encoded(self, data: Bytes) -> EncodedMessage {
        EncodedMessage { data, bare_offset: self.bare_offset, header: self.header }
    }
}

/// Decode the sections of a message body produced by
/// [`encode_message`] (annotations and footers are tolerated and
/// skipped).
pub fn decode_message(data: &[u8]) -> Result<DecodedMessage> {
    let mut r = Reader { data, pos: 0 };
    let mut decoded = DecodedMessage { bare_offset: 0, ..Default::default() };
    while !r.is_empty() {
        let section_start = r.pos;
        let code = r.descriptor()?;
        match code {
            HEADER => {
                let fields = r.list()?;
                decoded.header = header_from_fields(&fields);
                decoded.bare_offset = r.pos;
            }
            PROPERTIES => {
                let fields = r.list()?;
                decoded.properties = properties_from_fields(fields)?;
            }
            APPLICATION_PROPERTIES => {
                decoded.application_properties = r.field_map()?;
            }
            DATA => {
                decoded.body = match r.value()? {
                    Value::Binary(b) => Bytes::from(b),
                    other => {
                        return Err(Error::Malformed(format!(
                            "data section holds {other:?}, expected binary"
                        )))
                    }
                };
            }
            DELIVERY_ANNOTATIONS | MESSAGE_ANNOTATIONS | FOOTER => {
                // recognized but unused
                let _ = r.value()?;
            }
            other => {
                return Err(Error::Malformed(format!(
                    "unknown section descriptor 0x{other:x} at offset {section_start}"
                )))
            }
        }
    }
    Ok(decoded)
}

fn header_from_fields(fields: &[Value]) -> ReceivedHeader {
    ReceivedHeader {
        durable: matches!(fields.first(), Some(Value::Bool(true))),
        priority: match fields.get(1) {
            Some(Value::U8(p)) => *p,
            _ => 4,
        },
        ttl: match fields.get(2) {
            Some(Value::U32(t)) => Some(*t),
            _ => None,
        },
        first_acquirer: matches!(fields.get(3), Some(Value::Bool(true))),
        delivery_count: match fields.get(4) {
            Some(Value::U32(c)) => *c,
            _ => 0,
        },
    }
}

fn properties_from_fields(fields: Vec<Value>) -> Result<DecodedProperties> {
    let mut fields = fields.into_iter();
    let mut next = || fields.next().unwrap_or(Value::Null);
    Ok(DecodedProperties {
        message_id: next().into_string(),
        user_id: next().into_bytes(),
        to: next().into_string(),
        subject: next().into_string(),
        reply_to: next().into_string(),
        correlation_id: next().into_string(),
        content_type: next().into_string(),
        content_encoding: next().into_string(),
        absolute_expiry_time: next().into_i64(),
        creation_time: next().into_i64(),
        group_id: next().into_string(),
        group_sequence: next().into_u32(),
        reply_to_group_id: next().into_string(),
    })
}

/// Decoded primitive.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Null,
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Timestamp(i64),
    Uuid([u8; 16]),
    Str(String),
    Symbol(String),
    Binary(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl Value {
    fn into_string(self) -> Option<String> {
        match self {
            Value::Str(s) | Value::Symbol(s) => Some(s),
            _ => None,
        }
    }

    fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    fn into_i64(self) -> Option<i64> {
        match self {
            Value::Timestamp(t) | Value::I64(t) => Some(t),
            _ => None,
        }
    }

    fn into_u32(self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(v),
            _ => None,
        }
    }

    fn into_field_value(self) -> Option<FieldValue> {
        Some(match self {
            Value::Null => FieldValue::Void,
            Value::Bool(v) => FieldValue::Bool(v),
            Value::U8(v) => FieldValue::U8(v),
            Value::U16(v) => FieldValue::U16(v),
            Value::U32(v) => FieldValue::U32(v),
            Value::U64(v) => FieldValue::U64(v),
            Value::I8(v) => FieldValue::I8(v),
            Value::I16(v) => FieldValue::I16(v),
            Value::I32(v) => FieldValue::I32(v),
            Value::I64(v) => FieldValue::I64(v),
            Value::F32(v) => FieldValue::F32(v),
            Value::F64(v) => FieldValue::F64(v),
            Value::Str(v) | Value::Symbol(v) => FieldValue::Str(v),
            Value::Timestamp(v) => FieldValue::I64(v),
            Value::Uuid(_) | Value::Binary(_) | Value::List(_) | Value::Map(_) => return None,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::Malformed(format!(
                "truncated at offset {} (wanted {n} bytes)",
                self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok((&*self.take(4)?).get_u32())
    }

    /// Expect a descriptor (0x00 + ulong code).
    fn descriptor(&mut self) -> Result<u64> {
        let marker = self.u8()?;
        if marker != 0x00 {
            return Err(Error::Malformed(format!(
                "expected descriptor at offset {}, found 0x{marker:x}",
                self.pos - 1
            )));
        }
        match self.value()? {
            Value::U64(code) => Ok(code),
            other => Err(Error::Malformed(format!("descriptor is {other:?}, expected ulong"))),
        }
    }

    fn list(&mut self) -> Result<Vec<Value>> {
        match self.value()? {
            Value::List(items) => Ok(items),
            other => Err(Error::Malformed(format!("expected list, found {other:?}"))),
        }
    }

    fn field_map(&mut self) -> Result<FieldTable> {
        let entries = match self.value()? {
            Value::Map(entries) => entries,
            other => return Err(Error::Malformed(format!("expected map, found {other:?}"))),
        };
        let mut table = FieldTable::new();
        for (key, value) in entries {
            let Some(key) = key.into_string() else {
                return Err(Error::Malformed("non-string map key".to_string()));
            };
            if let Some(value) = value.into_field_value() {
                table.insert(key, value);
            }
        }
        Ok(table)
    }

    fn compound(&mut self, count: usize) -> Result<Vec<Value>> {
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.value()?);
        }
        Ok(items)
    }

    fn value(&mut self) -> Result<Value> {
        let code = self.u8()?;
        Ok(match code {
            0x40 => Value::Null,
            0x41 => Value::Bool(true),
            0x42 => Value::Bool(false),
            0x50 => Value::U8(self.u8()?),
            0x60 => Value::U16((&*self.take(2)?).get_u16()),
            0x43 => Value::U32(0),
            0x52 => Value::U32(self.u8()? as u32),
            0x70 => Value::U32(self.u32()?),
            0x44 => Value::U64(0),
            0x53 => Value::U64(self.u8()? as u64),
            0x80 => Value::U64((&*self.take(8)?).get_u64()),
            0x51 => Value::I8(self.u8()? as i8),
            0x61 => Value::I16((&*self.take(2)?).get_i16()),
            0x54 => Value::I32(self.u8()? as i8 as i32),
            0x71 => Value::I32((&*self.take(4)?).get_i32()),
            0x55 => Value::I64(self.u8()? as i8 as i64),
            0x81 => Value::I64((&*self.take(8)?).get_i64()),
            0x72 => Value::F32((&*self.take(4)?).get_f32()),
            0x82 => Value::F64((&*self.take(8)?).get_f64()),
            0x83 => Value::Timestamp((&*self.take(8)?).get_i64()),
            0x98 => {
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(self.take(16)?);
                Value::Uuid(uuid)
            }
            0xa1 => {
                let len = self.u8()? as usize;
                Value::Str(self.utf8(len)?)
            }
            0xb1 => {
                let len = self.u32()? as usize;
                Value::Str(self.utf8(len)?)
            }
            0xa3 => {
                let len = self.u8()? as usize;
                Value::Symbol(self.utf8(len)?)
            }
            0xb3 => {
                let len = self.u32()? as usize;
                Value::Symbol(self.utf8(len)?)
            }
            0xa0 => {
                let len = self.u8()? as usize;
                Value::Binary(self.take(len)?.to_vec())
            }
            0xb0 => {
                let len = self.u32()? as usize;
                Value::Binary(self.take(len)?.to_vec())
            }
            0x45 => Value::List(Vec::new()),
            0xc0 => {
                let _size = self.u8()?;
                let count = self.u8()? as usize;
                Value::List(self.compound(count)?)
            }
            0xd0 => {
                let _size = self.u32()?;
                let count = self.u32()? as usize;
                Value::List(self.compound(count)?)
            }
            0xc1 => {
                let _size = self.u8()?;
                let count = self.u8()? as usize;
                self.map_entries(count)?
            }
            0xd1 => {
                let _size = self.u32()?;
                let count = self.u32()? as usize;
                self.map_entries(count)?
            }
            other => {
                return Err(Error::Malformed(format!(
                    "unsupported type code 0x{other:x} at offset {}",
                    self.pos - 1
                )))
            }
        })
    }

    fn map_entries(&mut self, count: usize) -> Result<Value> {
        if count % 2 != 0 {
            return Err(Error::Malformed(format!("map with odd element count {count}")));
        }
        let mut entries = Vec::with_capacity(count / 2);
        for _ in 0..count / 2 {
            let key = self.value()?;
            let value = self.value()?;
            entries.push((key, value));
        }
        Ok(Value::Map(entries))
    }

    fn utf8(&mut self, len: usize) -> Result<String> {
        String::from_utf8(self.take(len)?.to_vec())
            .map_err(|_| Error::Malformed("invalid utf8 in string".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_round_trip() {
        let mut buf = BytesMut::new();
        put_bool(&mut buf, true);
        put_ubyte(&mut buf, 9);
        put_uint(&mut buf, 0);
        put_uint(&mut buf, 7);
        put_uint(&mut buf, 70_000);
        put_long(&mut buf, -5);
        put_long(&mut buf, 1 << 40);
        put_string(&mut buf, "hello");
        put_binary(&mut buf, b"bytes");
        put_timestamp(&mut buf, 1_500_000_000_000);

        let data = buf.freeze();
        let mut r = Reader { data: &data, pos: 0 };
        assert_eq!(r.value().unwrap(), Value::Bool(true));
        assert_eq!(r.value().unwrap(), Value::U8(9));
        assert_eq!(r.value().unwrap(), Value::U32(0));
        assert_eq!(r.value().unwrap(), Value::U32(7));
        assert_eq!(r.value().unwrap(), Value::U32(70_000));
        assert_eq!(r.value().unwrap(), Value::I64(-5));
        assert_eq!(r.value().unwrap(), Value::I64(1 << 40));
        assert_eq!(r.value().unwrap(), Value::Str("hello".to_string()));
        assert_eq!(r.value().unwrap(), Value::Binary(b"bytes".to_vec()));
        assert_eq!(r.value().unwrap(), Value::Timestamp(1_500_000_000_000));
        assert!(r.is_empty());
    }

    #[test]
    fn truncated_input_is_malformed() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "hello");
        let data = buf.freeze();
        let mut r = Reader { data: &data[..3], pos: 0 };
        assert!(matches!(r.value(), Err(Error::Malformed(_))));
    }

    #[test]
    fn reserved_headers_land_in_properties_not_application_properties() {
        let msg = Message::builder("k")
            .header(X_AMQP_GROUP_ID, "g1")
            .header(X_AMQP_GROUP_SEQUENCE, 3i64)
            .header("plain", "v")
            .finish();
        let encoded = encode_message(&msg, &Address::new("target"));
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded.properties.group_id.as_deref(), Some("g1"));
        assert_eq!(decoded.properties.group_sequence, Some(3));
        assert!(!decoded.application_properties.contains_key(X_AMQP_GROUP_ID));
        assert_eq!(decoded.application_properties.get_as_str("plain"), Some("v"));
    }

    #[test]
    fn uuid_and_nested_values_are_skipped() {
        let msg = Message::builder("k")
            .header("id", FieldValue::Uuid(uuid::Uuid::new_v4()))
            .header("nested", FieldValue::List(vec![FieldValue::Bool(true)]))
            .header("kept", 1i64)
            .finish();
        let encoded = encode_message(&msg, &Address::new("target"));
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded.application_properties.len(), 1);
        assert_eq!(decoded.application_properties.integer_setting("kept"), 1);
    }

    #[test]
    fn address_subject_overrides_message_subject() {
        let msg = Message::builder("k").subject("original").finish();
        let encoded = encode_message(&msg, &Address::with_subject("t", "override"));
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded.properties.subject.as_deref(), Some("override"));
    }

    #[test]
    fn unmodified_forward_is_verbatim() {
        let original_msg = Message::builder("k")
            .durable(true)
            .priority(7)
            .content(&b"payload"[..])
            .finish();
        let wire = encode_message(&original_msg, &Address::new("t"));
        let decoded = decode_message(&wire).unwrap();
        let forwarded = Message::builder("k")
            .durable(true)
            .priority(7)
            .content(&b"payload"[..])
            .original_encoded(decoded.into_encoded(wire.clone()))
            .finish();
        let re_encoded = encode_message(&forwarded, &Address::new("elsewhere"));
        assert_eq!(re_encoded, wire);
    }

    #[test]
    fn changed_header_splices_new_header_onto_bare_message() {
        let original_msg = Message::builder("k").priority(3).content(&b"payload"[..]).finish();
        let wire = encode_message(&original_msg, &Address::new("t"));
        let decoded = decode_message(&wire).unwrap();
        // redelivery bumps the delivery count, so the header differs
        let forwarded = Message::builder("k")
            .priority(3)
            .content(&b"payload"[..])
            .original_encoded(decoded.into_encoded(wire.clone()))
            .finish();
        forwarded.set_redelivered();
        let re_encoded = encode_message(&forwarded, &Address::new("t"));
        assert_ne!(re_encoded, wire);
        let decoded = decode_message(&re_encoded).unwrap();
        assert_eq!(decoded.header.delivery_count, 1);
        assert_eq!(decoded.body.as_ref(), b"payload");
    }
}
