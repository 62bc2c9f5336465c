// Copyright (c) 2026, The amqp-messenger Authors
// MIT License
// All rights reserved.

//! # Broker Topology Management
//!
//! Declares the broker-side topology this transport relies on: the main
//! exchange and queue, and, when a retry policy is configured, the retry
//! exchange plus one retry queue per attempt number. Each retry queue carries
//! `x-message-ttl` for its attempt and dead-letters into the main exchange, so
//! an expired retry message is redelivered without any polling on our side.
//!
//! Every declaration is idempotent: multiple workers may start concurrently
//! and each runs the same declarations against the broker.

use crate::{
    config::{Argument, ConnectionConfig},
    errors::TransportError,
    retry::{RetryConfig, RetryEntry, RETRY_EXCHANGE},
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    Channel, ExchangeKind,
};
use std::collections::BTreeMap;
use tracing::debug;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Declares topology for one connection configuration.
pub(crate) struct Topology<'tp> {
    channel: &'tp Channel,
    config: &'tp ConnectionConfig,
}

impl<'tp> Topology<'tp> {
    pub(crate) fn new(channel: &'tp Channel, config: &'tp ConnectionConfig) -> Topology<'tp> {
        Topology { channel, config }
    }

    /// Declares the main exchange/queue pair, their binding, and the full
    /// retry tier when a retry policy is configured.
    pub(crate) async fn install(&self) -> Result<(), TransportError> {
        self.install_exchange().await?;
        self.install_queue().await?;

        let routing_key = self.config.queue.routing_key.clone().unwrap_or_default();
        self.bind_queue(&routing_key).await?;

        if let Some(retry) = &self.config.retry {
            self.install_retry(retry).await?;
        }

        Ok(())
    }

    async fn install_exchange(&self) -> Result<(), TransportError> {
        let name = &self.config.exchange.name;
        debug!("declaring exchange: {}", name);

        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments_table(&self.config.exchange.arguments),
            )
            .await
            .map_err(|err| TransportError::DeclareExchange(name.clone(), err))?;

        debug!("exchange: {} was declared", name);
        Ok(())
    }

    async fn install_queue(&self) -> Result<(), TransportError> {
        let name = &self.config.queue.name;
        debug!("declaring queue: {}", name);

        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments_table(&self.config.queue.arguments),
            )
            .await
            .map_err(|err| TransportError::DeclareQueue(name.clone(), err))?;

        debug!("queue: {} was declared", name);
        Ok(())
    }

    /// Binds the main queue to the main exchange under `routing_key`.
    pub(crate) async fn bind_queue(&self, routing_key: &str) -> Result<(), TransportError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            self.config.queue.name, self.config.exchange.name, routing_key
        );

        self.channel
            .queue_bind(
                &self.config.queue.name,
                &self.config.exchange.name,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                TransportError::BindQueue(
                    self.config.queue.name.clone(),
                    self.config.exchange.name.clone(),
                    err,
                )
            })
    }

    /// Declares the retry exchange and one retry queue per attempt number.
    ///
    /// The main queue is also bound under each attempt routing key, so a
    /// message dead-lettered out of a retry queue lands back in it.
    async fn install_retry(&self, retry: &RetryConfig) -> Result<(), TransportError> {
        self.declare_retry_exchange().await?;

        for attempt in 1..=retry.attempts() {
            let entry = retry.entry(attempt);
            self.declare_retry_queue(&entry).await?;
            self.bind_queue(&entry.routing_key).await?;
        }

        Ok(())
    }

    pub(crate) async fn declare_retry_exchange(&self) -> Result<(), TransportError> {
        self.channel
            .exchange_declare(
                RETRY_EXCHANGE,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| TransportError::DeclareExchange(RETRY_EXCHANGE.to_owned(), err))
    }

    /// Declares one per-attempt retry queue and binds it to the retry
    /// exchange. TTL expiry dead-letters into the main exchange.
    pub(crate) async fn declare_retry_queue(&self, entry: &RetryEntry) -> Result<(), TransportError> {
        debug!(
            "declaring retry queue: {} with ttl: {}",
            entry.queue_name, entry.ttl
        );

        let mut args = BTreeMap::new();
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongLongInt(LongLongInt::from(entry.ttl as i64)),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(self.config.exchange.name.clone())),
        );

        self.channel
            .queue_declare(
                &entry.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::from(args),
            )
            .await
            .map_err(|err| TransportError::DeclareQueue(entry.queue_name.clone(), err))?;

        self.channel
            .queue_bind(
                &entry.queue_name,
                RETRY_EXCHANGE,
                &entry.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                TransportError::BindQueue(entry.queue_name.clone(), RETRY_EXCHANGE.to_owned(), err)
            })
    }
}

/// Converts validated configuration arguments into a broker field table.
fn arguments_table(arguments: &BTreeMap<String, Argument>) -> FieldTable {
    let mut table = BTreeMap::new();

    for (name, value) in arguments {
        let amqp_value = match value {
            Argument::Int(int) => AMQPValue::LongLongInt(LongLongInt::from(*int)),
            Argument::Str(string) => AMQPValue::LongString(LongString::from(string.clone())),
        };
        table.insert(ShortString::from(name.clone()), amqp_value);
    }

    FieldTable::from(table)
}
