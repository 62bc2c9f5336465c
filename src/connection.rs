// Copyright (c) 2026, The amqp-messenger Authors
// MIT License
// All rights reserved.

//! # Transport Connection
//!
//! [`Connection`] owns the physical link to the broker: it can fetch one
//! pending delivery, acknowledge or negative-acknowledge it, publish a
//! message, declare the broker-side topology, and republish a failed delivery
//! to the retry tier. Retry policy decisions do not live here; this layer
//! never retries a failed broker call on its own.

use crate::{
    config::ConnectionConfig,
    errors::TransportError,
    retry::{ATTEMPTS_HEADER, RETRY_EXCHANGE},
    serializer::Headers,
    topology::Topology,
};
use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions},
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    BasicProperties, Channel, ConnectionProperties,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use uuid::Uuid;

/// Content type set on published messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode marking a message as persisted to disk
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// The broker operations a receiver drives.
///
/// [`Connection`] is the live implementation; the seam exists so the receive
/// loop can run against a scripted connection in tests.
#[async_trait]
pub trait ConnectionOps: Send + Sync {
    fn config(&self) -> &ConnectionConfig;

    /// Non-blocking poll for one pending delivery.
    ///
    /// Returns `Ok(None)` when the queue is empty; the caller decides idle
    /// behavior.
    async fn get(&self) -> Result<Option<Delivery>, TransportError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError>;

    /// Republishes a failed delivery to the retry tier, returning the new
    /// attempt number. On success the caller must still ack the original
    /// delivery.
    async fn publish_for_retry(&self, delivery: &Delivery) -> Result<u32, TransportError>;
}

/// Owns one channel to the broker plus the resolved configuration.
pub struct Connection {
    channel: Channel,
    config: ConnectionConfig,
    // Keeps the underlying link alive for as long as the channel is used.
    _connection: lapin::Connection,
}

impl Connection {
    /// Establishes the link and creates the channel.
    ///
    /// When `auto_setup` is enabled the broker topology is declared before
    /// the connection is handed out.
    pub async fn connect(config: ConnectionConfig) -> Result<Connection, TransportError> {
        debug!(host = config.host, vhost = config.vhost, "connecting to the broker");

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(config.queue.name.clone()));

        let connection = lapin::Connection::connect(&config.amqp_uri(), options)
            .await
            .map_err(TransportError::Connect)?;

        let channel = connection
            .create_channel()
            .await
            .map_err(TransportError::Channel)?;
        debug!("channel created");

        let connection = Connection {
            channel,
            config,
            _connection: connection,
        };

        if connection.config.auto_setup {
            connection.setup().await?;
        }

        Ok(connection)
    }

    /// Idempotently declares the exchange/queue topology, including the
    /// per-attempt retry queues when a retry policy is configured.
    pub async fn setup(&self) -> Result<(), TransportError> {
        Topology::new(&self.channel, &self.config).install().await
    }

    /// Publishes a new message to the main exchange.
    ///
    /// Falls back to the configured queue routing key when `routing_key` is
    /// `None`.
    pub async fn publish(
        &self,
        body: &[u8],
        headers: &Headers,
        routing_key: Option<&str>,
    ) -> Result<(), TransportError> {
        let routing_key = match routing_key {
            Some(key) => key.to_owned(),
            None => self.config.queue.routing_key.clone().unwrap_or_default(),
        };

        let mut table = BTreeMap::new();
        for (name, value) in headers {
            table.insert(
                ShortString::from(name.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(table));
        if self.config.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        self.channel
            .basic_publish(
                &self.config.exchange.name,
                &routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(TransportError::Publish)?;

        Ok(())
    }
}

#[async_trait]
impl ConnectionOps for Connection {
    fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    async fn get(&self) -> Result<Option<Delivery>, TransportError> {
        let fetched = self
            .channel
            .basic_get(&self.config.queue.name, BasicGetOptions { no_ack: false })
            .await
            .map_err(TransportError::Get)?;

        Ok(fetched.map(|message| message.delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        delivery
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(TransportError::Ack)
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        delivery
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(TransportError::Nack)
    }

    /// Republishes a failed delivery to the retry tier.
    ///
    /// Computes the next attempt number, lazily declares the retry queue it
    /// routes to (workers may race on this, declaration is idempotent), and
    /// publishes body plus headers with the attempt counter updated. Returns
    /// the new attempt number. On success the caller must still ack the
    /// original delivery; the retry copy is now the only live one, and a
    /// missing ack would surface a duplicate on redelivery.
    async fn publish_for_retry(&self, delivery: &Delivery) -> Result<u32, TransportError> {
        let retry = self
            .config
            .retry
            .as_ref()
            .ok_or(TransportError::RetryNotConfigured)?;

        let attempts = attempts_from(&delivery.properties);
        let next = attempts + 1;

        let topology = Topology::new(&self.channel, &self.config);
        topology.declare_retry_exchange().await?;
        if next <= retry.attempts() {
            let entry = retry.entry(next);
            topology.declare_retry_queue(&entry).await?;
            // The main queue must also listen under this attempt key, or the
            // expired retry dead-letters into the main exchange unroutable.
            topology.bind_queue(&entry.routing_key).await?;
        } else {
            warn!(attempt = next, "attempt is past the retry policy, dead-lettering");
        }

        let routing_key = retry.publish_routing_key(next);
        let properties = delivery
            .properties
            .clone()
            .with_headers(headers_with_attempts(&delivery.properties, next));

        self.channel
            .basic_publish(
                RETRY_EXCHANGE,
                &routing_key,
                BasicPublishOptions::default(),
                &delivery.data,
                properties,
            )
            .await
            .map_err(TransportError::Publish)?;

        debug!(attempt = next, routing_key, "delivery republished for retry");
        Ok(next)
    }
}

/// Extracts the attempt counter from the delivery headers.
///
/// Absent or non-numeric values count as 0. Brokers and clients disagree on
/// the integer type used for headers, so every integer kind is accepted, as
/// are numeric strings.
pub(crate) fn attempts_from(properties: &AMQPProperties) -> u32 {
    let Some(headers) = properties.headers() else {
        return 0;
    };

    match headers.inner().get(ATTEMPTS_HEADER) {
        Some(AMQPValue::LongLongInt(count)) => (*count).try_into().unwrap_or(0),
        Some(AMQPValue::LongInt(count)) => (*count).try_into().unwrap_or(0),
        Some(AMQPValue::ShortInt(count)) => (*count).try_into().unwrap_or(0),
        Some(AMQPValue::ShortShortInt(count)) => (*count).try_into().unwrap_or(0),
        Some(AMQPValue::LongString(count)) => std::str::from_utf8(count.as_bytes())
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        _ => 0,
    }
}

/// Copies the delivery headers with the attempt counter set to `attempts`.
pub(crate) fn headers_with_attempts(properties: &AMQPProperties, attempts: u32) -> FieldTable {
    let mut table = match properties.headers() {
        Some(headers) => headers.inner().clone(),
        None => BTreeMap::new(),
    };

    table.insert(
        ShortString::from(ATTEMPTS_HEADER),
        AMQPValue::LongLongInt(LongLongInt::from(attempts as i64)),
    );

    FieldTable::from(table)
}

/// Projects the delivery headers to strings for the serializer.
pub(crate) fn header_strings(properties: &AMQPProperties) -> Headers {
    let mut headers = Headers::new();

    let Some(table) = properties.headers() else {
        return headers;
    };

    for (name, value) in table.inner() {
        let string = match value {
            AMQPValue::LongString(value) => {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            }
            AMQPValue::ShortString(value) => value.to_string(),
            AMQPValue::LongLongInt(value) => value.to_string(),
            AMQPValue::LongInt(value) => value.to_string(),
            AMQPValue::ShortInt(value) => value.to_string(),
            AMQPValue::ShortShortInt(value) => value.to_string(),
            AMQPValue::Boolean(value) => value.to_string(),
            _ => continue,
        };
        headers.insert(name.to_string(), string);
    }

    headers
}
