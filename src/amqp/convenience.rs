//! Conversions between [`Message`] and the AMQP properties used by [`lapin`].
use crate::messages::Message;
use amq_protocol_types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;
use std::borrow::{Borrow, Cow};
use std::collections::BTreeMap;

/// Delivery mode: Non-persistent (1) or persistent (2).
const PERSISTENT: u8 = 2;

/// Convenience methods for [`lapin::BasicProperties`].
pub trait BasicPropertiesExt {
    /// Lookup header by key.
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized;

    /// Lookup a header string value.
    ///
    /// Returns `None` if not a string.
    fn get_header_str<Q>(&self, key: &Q) -> Option<Cow<'_, str>>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        match self.get_header(key) {
            Some(value) => header_str(value),
            None => None,
        }
    }
}

impl BasicPropertiesExt for lapin::BasicProperties {
    fn get_header<Q>(&self, key: &Q) -> Option<&AMQPValue>
    where
        ShortString: Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        self.headers().as_ref()?.inner().get(key)
    }
}

fn header_str(value: &AMQPValue) -> Option<Cow<'_, str>> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes())),
        AMQPValue::ShortString(s) => Some(Cow::Borrowed(s.as_str())),
        _ => None,
    }
}

/// Build the AMQP properties to publish `message` with.
///
/// Metadata entries become `LongString` headers and the message is always marked as persistent.
pub fn message_properties(message: &Message) -> BasicProperties {
    let mut properties = BasicProperties::default().with_delivery_mode(PERSISTENT);
    if let Some(message_id) = &message.message_id {
        properties = properties.with_message_id(message_id.as_str().into());
    }
    if let Some(correlation_id) = &message.correlation_id {
        properties = properties.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(content_type) = &message.content_type {
        properties = properties.with_content_type(content_type.as_str().into());
    }
    if let Some(timestamp) = message.timestamp {
        properties = properties.with_timestamp(timestamp);
    }
    if !message.metadata.is_empty() {
        let mut headers = FieldTable::default();
        for (key, value) in &message.metadata {
            headers.insert(
                key.as_str().into(),
                AMQPValue::LongString(value.as_str().into()),
            );
        }
        properties = properties.with_headers(headers);
    }
    properties
}

/// Rebuild a [`Message`] from a lapin delivery.
///
/// Headers that are not strings are not representable as metadata and are skipped.
pub fn message_from_delivery(delivery: &lapin::message::Delivery) -> Message {
    let properties = &delivery.properties;
    let metadata: BTreeMap<String, String> = properties
        .headers()
        .as_ref()
        .map(|headers| {
            headers
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    header_str(value).map(|v| (key.as_str().to_owned(), v.into_owned()))
                })
                .collect()
        })
        .unwrap_or_default();

    Message {
        payload: delivery.data.clone(),
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        message_id: properties.message_id().as_ref().map(|s| s.as_str().to_owned()),
        correlation_id: properties.correlation_id().as_ref().map(|s| s.as_str().to_owned()),
        content_type: properties.content_type().as_ref().map(|s| s.as_str().to_owned()),
        timestamp: *properties.timestamp(),
        metadata,
    }
}
