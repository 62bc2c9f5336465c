// Copyright (c) 2026, The amqp-messenger Authors
// MIT License
// All rights reserved.

//! # Message Receiver
//!
//! The [`Receiver`] trait is the transport-agnostic consumption contract: it
//! decodes raw deliveries into envelopes plus delivery metadata, and exposes
//! the three dispositions (acknowledge, reject, retry) keyed by an opaque
//! handle. [`AmqpReceiver`] is the broker-backed implementation wrapping one
//! [`Connection`].
//!
//! Exactly one disposition is applied per fetched delivery, exactly once. The
//! handle is consumed by whichever disposition is invoked, so a second one is
//! unrepresentable.

use crate::{
    connection::{attempts_from, header_strings, Connection, ConnectionOps},
    envelope::Envelope,
    errors::{DecodeError, TransportError},
    serializer::Serializer,
};
use async_trait::async_trait;
use lapin::message::Delivery;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Pairs an opaque delivery handle with the attempt count extracted from the
/// broker headers. Created fresh per fetch, discarded after disposition.
pub struct QueuedMessageMetadata<H> {
    handle: H,
    attempts: u32,
}

impl<H> QueuedMessageMetadata<H> {
    pub fn new(handle: H, attempts: u32) -> Self {
        QueuedMessageMetadata { handle, attempts }
    }

    /// Number of prior handling attempts for this message.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Surrenders the handle for a disposition call.
    pub fn into_handle(self) -> H {
        self.handle
    }
}

/// One fetched delivery as passed to a [`DeliveryHandler`]: the decode
/// outcome plus the delivery metadata. Decode failures are not swallowed by
/// the receiver; they reach the handler's failure path.
pub type ReceivedDelivery<M, H> = (Result<Envelope<M>, DecodeError>, QueuedMessageMetadata<H>);

/// Callback driven by [`Receiver::receive`].
///
/// `None` is the idle tick: the queue had nothing pending and the receiver is
/// about to sleep. The returned error is reserved for transport failures in
/// the disposition path; returning one terminates the consume loop.
#[async_trait]
pub trait DeliveryHandler<M, H: Send>: Send + Sync {
    async fn handle(
        &self,
        received: Option<ReceivedDelivery<M, H>>,
    ) -> Result<(), TransportError>;
}

/// Transport-agnostic consumption contract.
///
/// The handle type is opaque to callers: it is obtained through the metadata
/// of a received delivery and only ever passed back to one of the disposition
/// methods.
#[async_trait]
pub trait Receiver<M>: Send + Sync {
    type Handle: Send;

    /// Runs the consume loop until [`stop`](Receiver::stop) is called.
    ///
    /// Each iteration fetches at most one delivery and hands it to `handler`;
    /// an empty poll invokes the handler's idle tick and then sleeps for the
    /// configured interval. Only transport failures escape this loop.
    async fn receive(
        &self,
        handler: &dyn DeliveryHandler<M, Self::Handle>,
    ) -> Result<(), TransportError>;

    /// Removes the delivery from the queue.
    async fn acknowledge(&self, handle: Self::Handle) -> Result<(), TransportError>;

    /// Negatively acknowledges the delivery, optionally requeueing it.
    async fn reject(&self, handle: Self::Handle, requeue: bool) -> Result<(), TransportError>;

    /// Schedules the delivery for another attempt after `delay`.
    async fn retry(&self, handle: Self::Handle, delay: Duration) -> Result<(), TransportError>;

    /// Whether [`retry`](Receiver::retry) is available at all. Callers must
    /// check before scheduling one; without retry support a failed delivery
    /// can only be rejected.
    fn supports_retry(&self) -> bool;

    /// Requests a cooperative stop, effective at the next loop boundary. An
    /// in-flight fetch or disposition always completes first.
    fn stop(&self);
}

/// Opaque handle to one in-flight broker delivery.
pub struct AmqpHandle {
    delivery: Delivery,
}

/// Broker-backed receiver wrapping one [`Connection`] and a serializer.
pub struct AmqpReceiver<M, C = Connection> {
    connection: C,
    serializer: Box<dyn Serializer<M>>,
    cancel: CancellationToken,
}

impl<M, C: ConnectionOps> AmqpReceiver<M, C> {
    pub fn new(connection: C, serializer: Box<dyn Serializer<M>>) -> Self {
        AmqpReceiver {
            connection,
            serializer,
            cancel: CancellationToken::new(),
        }
    }

    /// Token cancelled by [`stop`](Receiver::stop). The hosting process wires
    /// OS signal delivery to this token so a termination request drains the
    /// in-flight delivery instead of abandoning its disposition.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }
}

#[async_trait]
impl<M: Send + Sync, C: ConnectionOps> Receiver<M> for AmqpReceiver<M, C> {
    type Handle = AmqpHandle;

    async fn receive(
        &self,
        handler: &dyn DeliveryHandler<M, AmqpHandle>,
    ) -> Result<(), TransportError> {
        while !self.cancel.is_cancelled() {
            let Some(delivery) = self.connection.get().await? else {
                handler.handle(None).await?;
                tokio::time::sleep(self.connection.config().loop_sleep).await;
                continue;
            };

            let attempts = attempts_from(&delivery.properties);
            let headers = header_strings(&delivery.properties);
            let decoded = self.serializer.decode(&delivery.data, &headers);

            let metadata = QueuedMessageMetadata::new(AmqpHandle { delivery }, attempts);
            handler.handle(Some((decoded, metadata))).await?;
        }

        debug!("receiver stopped");
        Ok(())
    }

    async fn acknowledge(&self, handle: AmqpHandle) -> Result<(), TransportError> {
        self.connection.ack(&handle.delivery).await
    }

    async fn reject(&self, handle: AmqpHandle, requeue: bool) -> Result<(), TransportError> {
        self.connection.nack(&handle.delivery, requeue).await
    }

    /// Two-phase retry: publish the retry copy first, ack the original only
    /// once the publish succeeded. A failed publish leaves the original
    /// unacked; the broker will redeliver it, which at-least-once allows.
    ///
    /// The `delay` hint is not applied here: the per-attempt TTL queues own
    /// the delay, and an in-process sleep would not survive multiple workers.
    async fn retry(&self, handle: AmqpHandle, _delay: Duration) -> Result<(), TransportError> {
        self.connection.publish_for_retry(&handle.delivery).await?;
        self.connection.ack(&handle.delivery).await
    }

    fn supports_retry(&self) -> bool {
        self.connection.config().retry.is_some()
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ConnectionConfig, ConnectionOptions},
        retry::ATTEMPTS_HEADER,
        serializer::JsonSerializer,
    };
    use lapin::{
        acker::Acker,
        types::{AMQPValue, FieldTable, LongLongInt, ShortString},
        BasicProperties,
    };
    use serde::{Deserialize, Serialize};
    use std::{
        collections::{BTreeMap, VecDeque},
        sync::Mutex,
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct DummyMessage {
        message: String,
    }

    fn config(with_retry: bool) -> ConnectionConfig {
        let dsn = if with_retry {
            "amqp://localhost/%2f/messages?loop_sleep=1000&retry[attempts]=3&retry[ttl]=30000"
        } else {
            "amqp://localhost/%2f/messages?loop_sleep=1000"
        };
        ConnectionConfig::from_dsn(dsn, ConnectionOptions::default()).unwrap()
    }

    fn delivery(tag: u64, body: &[u8], attempts: Option<u32>) -> Delivery {
        let mut properties = BasicProperties::default();
        if let Some(attempts) = attempts {
            let mut table = BTreeMap::new();
            table.insert(
                ShortString::from(ATTEMPTS_HEADER),
                AMQPValue::LongLongInt(LongLongInt::from(attempts as i64)),
            );
            properties = properties.with_headers(FieldTable::from(table));
        }

        Delivery {
            delivery_tag: tag,
            exchange: "messages".into(),
            routing_key: "".into(),
            redelivered: false,
            properties,
            data: body.to_vec(),
            acker: Acker::default(),
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum BrokerOp {
        Ack(u64),
        Nack(u64, bool),
        PublishForRetry(u64),
    }

    struct FakeConnection {
        config: ConnectionConfig,
        deliveries: Mutex<VecDeque<Delivery>>,
        ops: Mutex<Vec<BrokerOp>>,
        fail_publish: bool,
    }

    impl FakeConnection {
        fn new(config: ConnectionConfig, deliveries: Vec<Delivery>) -> Self {
            FakeConnection {
                config,
                deliveries: Mutex::new(deliveries.into()),
                ops: Mutex::new(vec![]),
                fail_publish: false,
            }
        }

        fn failing_publishes(mut self) -> Self {
            self.fail_publish = true;
            self
        }

        fn ops(&self) -> Vec<BrokerOp> {
            self.ops.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ConnectionOps for FakeConnection {
        fn config(&self) -> &ConnectionConfig {
            &self.config
        }

        async fn get(&self) -> Result<Option<Delivery>, TransportError> {
            Ok(self.deliveries.lock().unwrap().pop_front())
        }

        async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
            self.ops
                .lock()
                .unwrap()
                .push(BrokerOp::Ack(delivery.delivery_tag));
            Ok(())
        }

        async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
            self.ops
                .lock()
                .unwrap()
                .push(BrokerOp::Nack(delivery.delivery_tag, requeue));
            Ok(())
        }

        async fn publish_for_retry(&self, delivery: &Delivery) -> Result<u32, TransportError> {
            if self.fail_publish {
                return Err(TransportError::Publish(lapin::Error::ChannelsLimitReached));
            }
            self.ops
                .lock()
                .unwrap()
                .push(BrokerOp::PublishForRetry(delivery.delivery_tag));
            Ok(attempts_from(&delivery.properties) + 1)
        }
    }

    /// Records what the receive loop hands over: `Some((decode_ok, attempts))`
    /// per delivery, `None` per idle tick. Stops the receiver on the first
    /// idle tick so the loop terminates.
    struct RecordingHandler {
        seen: Mutex<Vec<Option<(bool, u32)>>>,
        cancel: CancellationToken,
    }

    impl RecordingHandler {
        fn new(cancel: CancellationToken) -> Self {
            RecordingHandler {
                seen: Mutex::new(vec![]),
                cancel,
            }
        }

        fn seen(&self) -> Vec<Option<(bool, u32)>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeliveryHandler<DummyMessage, AmqpHandle> for RecordingHandler {
        async fn handle(
            &self,
            received: Option<ReceivedDelivery<DummyMessage, AmqpHandle>>,
        ) -> Result<(), TransportError> {
            match received {
                Some((decoded, metadata)) => self
                    .seen
                    .lock()
                    .unwrap()
                    .push(Some((decoded.is_ok(), metadata.attempts()))),
                None => {
                    self.seen.lock().unwrap().push(None);
                    self.cancel.cancel();
                }
            }
            Ok(())
        }
    }

    fn receiver(connection: FakeConnection) -> AmqpReceiver<DummyMessage, FakeConnection> {
        AmqpReceiver::new(connection, Box::new(JsonSerializer::new("DummyMessage")))
    }

    #[tokio::test]
    async fn receive_hands_over_each_delivery_and_idles_once_when_drained() {
        let connection = FakeConnection::new(
            config(true),
            vec![delivery(1, br#"{"message":"Hi"}"#, Some(2))],
        );
        let receiver = receiver(connection);
        let handler = RecordingHandler::new(receiver.cancellation_token());

        receiver.receive(&handler).await.unwrap();

        assert_eq!(handler.seen(), vec![Some((true, 2)), None]);
        // The loop itself never applies a disposition.
        assert!(receiver.connection().ops().is_empty());
    }

    #[tokio::test]
    async fn an_undecodable_delivery_reaches_the_handler_with_its_metadata() {
        let connection = FakeConnection::new(config(true), vec![delivery(1, b"not json", Some(2))]);
        let receiver = receiver(connection);
        let handler = RecordingHandler::new(receiver.cancellation_token());

        receiver.receive(&handler).await.unwrap();

        assert_eq!(handler.seen(), vec![Some((false, 2)), None]);
    }

    #[tokio::test]
    async fn acknowledge_and_reject_pass_through_to_the_connection() {
        let receiver = receiver(FakeConnection::new(config(true), vec![]));

        let handle = AmqpHandle {
            delivery: delivery(1, b"{}", None),
        };
        receiver.acknowledge(handle).await.unwrap();

        let handle = AmqpHandle {
            delivery: delivery(2, b"{}", None),
        };
        receiver.reject(handle, false).await.unwrap();

        assert_eq!(
            receiver.connection().ops(),
            vec![BrokerOp::Ack(1), BrokerOp::Nack(2, false)]
        );
    }

    #[tokio::test]
    async fn retry_publishes_before_acknowledging_the_original() {
        let receiver = receiver(FakeConnection::new(config(true), vec![]));

        let handle = AmqpHandle {
            delivery: delivery(1, b"{}", None),
        };
        receiver.retry(handle, Duration::from_secs(10)).await.unwrap();

        assert_eq!(
            receiver.connection().ops(),
            vec![BrokerOp::PublishForRetry(1), BrokerOp::Ack(1)]
        );
    }

    #[tokio::test]
    async fn a_failed_retry_publish_never_acknowledges_the_original() {
        let receiver = receiver(FakeConnection::new(config(true), vec![]).failing_publishes());

        let handle = AmqpHandle {
            delivery: delivery(1, b"{}", None),
        };
        let result = receiver.retry(handle, Duration::from_secs(10)).await;

        assert!(matches!(result, Err(TransportError::Publish(_))));
        assert!(receiver.connection().ops().is_empty());
    }

    #[tokio::test]
    async fn retry_support_follows_the_connection_retry_policy() {
        assert!(receiver(FakeConnection::new(config(true), vec![])).supports_retry());
        assert!(!receiver(FakeConnection::new(config(false), vec![])).supports_retry());
    }
}
