//! Message section encoding for outbound TRANSFER frames.
//!
//! Sections precede the payload inside the first fragment of a
//! delivery: optional message-annotations, properties and
//! application-properties, then an amqp-value header wrapping the
//! binary body. Inbound TRANSFER bodies are not decoded; the transfer
//! path is receive-and-skip by design, so only encoders live here.

use bytes::{BufMut, Bytes, BytesMut};

use super::primitives::{Value, encode_value, trim_trailing_nulls};

pub(crate) const DESC_MESSAGE_ANNOTATIONS: u64 = 0x72;
pub(crate) const DESC_PROPERTIES: u64 = 0x73;
pub(crate) const DESC_APPLICATION_PROPERTIES: u64 = 0x74;
pub(crate) const DESC_AMQP_VALUE: u64 = 0x77;

/// Key of a message annotation: a registry id or a symbolic name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnnotationKey {
    Id(u64),
    Name(String),
}

/// One message annotation entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Annotation {
    pub key: AnnotationKey,
    pub value: Bytes,
}

/// The subset of AMQP message properties the bridge relays.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub user_id: Option<Bytes>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub absolute_expiry_time: Option<u64>,
    pub creation_time: Option<u64>,
    pub group_id: Option<String>,
    pub group_sequence: Option<u32>,
    pub reply_to_group_id: Option<String>,
}

impl MessageProperties {
    /// Whether any property is set; empty properties encode nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.message_id.is_none()
            && self.user_id.is_none()
            && self.to.is_none()
            && self.subject.is_none()
            && self.reply_to.is_none()
            && self.correlation_id.is_none()
            && self.content_type.is_none()
            && self.content_encoding.is_none()
            && self.absolute_expiry_time.is_none()
            && self.creation_time.is_none()
            && self.group_id.is_none()
            && self.group_sequence.is_none()
            && self.reply_to_group_id.is_none()
    }
}

fn opt_str(value: Option<&String>) -> Value {
    value.map_or(Value::Null, |v| Value::Str(v.clone()))
}

fn opt_sym(value: Option<&String>) -> Value {
    value.map_or(Value::Null, |v| Value::Symbol(v.clone()))
}

/// Encode a message-annotations section. Empty input encodes nothing.
pub(crate) fn encode_annotations(annotations: &[Annotation], dst: &mut BytesMut) {
    if annotations.is_empty() {
        return;
    }
    let entries = annotations
        .iter()
        .map(|annotation| {
            let key = match &annotation.key {
                AnnotationKey::Id(id) => Value::Ulong(*id),
                AnnotationKey::Name(name) => Value::Symbol(name.clone()),
            };
            (key, Value::Binary(annotation.value.clone()))
        })
        .collect();
    encode_value(
        &Value::Described(DESC_MESSAGE_ANNOTATIONS, Box::new(Value::Map(entries))),
        dst,
    );
}

/// Encode a properties section. Empty input encodes nothing.
pub(crate) fn encode_properties(properties: &MessageProperties, dst: &mut BytesMut) {
    if properties.is_empty() {
        return;
    }
    let fields = trim_trailing_nulls(vec![
        opt_str(properties.message_id.as_ref()),
        properties
            .user_id
            .as_ref()
            .map_or(Value::Null, |v| Value::Binary(v.clone())),
        opt_str(properties.to.as_ref()),
        opt_str(properties.subject.as_ref()),
        opt_str(properties.reply_to.as_ref()),
        opt_str(properties.correlation_id.as_ref()),
        opt_sym(properties.content_type.as_ref()),
        opt_sym(properties.content_encoding.as_ref()),
        properties
            .absolute_expiry_time
            .map_or(Value::Null, Value::Ulong),
        properties.creation_time.map_or(Value::Null, Value::Ulong),
        opt_str(properties.group_id.as_ref()),
        properties.group_sequence.map_or(Value::Null, Value::Uint),
        opt_str(properties.reply_to_group_id.as_ref()),
    ]);
    encode_value(
        &Value::Described(DESC_PROPERTIES, Box::new(Value::List(fields))),
        dst,
    );
}

/// Encode an application-properties section. Empty input encodes nothing.
pub(crate) fn encode_application_properties(properties: &[(String, String)], dst: &mut BytesMut) {
    if properties.is_empty() {
        return;
    }
    let entries = properties
        .iter()
        .map(|(key, value)| (Value::Str(key.clone()), Value::Str(value.clone())))
        .collect();
    encode_value(
        &Value::Described(DESC_APPLICATION_PROPERTIES, Box::new(Value::Map(entries))),
        dst,
    );
}

/// Fixed-size header announcing the binary message body.
///
/// Encodes as the amqp-value described prefix followed by a `vbin32`
/// constructor whose length covers the whole delivery, including bytes
/// deferred to later transport frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValueHeader {
    pub value_length: u32,
}

impl ValueHeader {
    /// Encoded size: described prefix (3) + constructor (1) + length (4).
    pub const SIZE: usize = 8;

    pub(crate) fn encode(self, dst: &mut BytesMut) {
        dst.put_u8(0x00);
        dst.put_u8(0x53);
        dst.put_u8(DESC_AMQP_VALUE as u8);
        dst.put_u8(0xb0);
        dst.put_u32(self.value_length);
    }
}
