// Copyright (c) 2026, The amqp-messenger Authors
// MIT License
// All rights reserved.

//! # Message Worker
//!
//! The [`Worker`] drives one consumption session: it pulls deliveries from a
//! [`Receiver`], dispatches each envelope to the [`MessageBus`], and resolves
//! the outcome back to the broker. Per delivery exactly one disposition is
//! applied: acknowledge on success; on failure either reject or retry,
//! depending on the error class and the attempt count.
//!
//! The fetch, dispatch and disposition of one delivery are strictly
//! sequential; a worker never has more than one delivery in flight. A failing
//! message never crashes the session; only a transport error in the
//! disposition path terminates the loop, since the connection itself is then
//! unusable.

use crate::{
    bus::MessageBus,
    envelope::{Envelope, Stamp},
    errors::{HandlerError, TransportError},
    events::{EventListener, WorkerEvent},
    receiver::{DeliveryHandler, QueuedMessageMetadata, ReceivedDelivery, Receiver},
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Attempts allowed per message when none are configured.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Delay hint passed to the receiver's retry when none is configured.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(10_000);

/// Tunables of one worker session.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Total handling attempts before a failing message is rejected.
    pub max_attempts: u32,
    /// Delay hint forwarded to [`Receiver::retry`]. The broker-side retry
    /// topology remains authoritative for the actual wait.
    pub retry_delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Pulls messages from a receiver and dispatches them to a bus.
pub struct Worker<M, R, B> {
    receiver: R,
    bus: B,
    listener: Option<Arc<dyn EventListener<M>>>,
    options: WorkerOptions,
}

impl<M, R, B> Worker<M, R, B>
where
    M: Clone + Send + Sync,
    R: Receiver<M>,
    B: MessageBus<M>,
{
    pub fn new(receiver: R, bus: B) -> Self {
        Worker {
            receiver,
            bus,
            listener: None,
            options: WorkerOptions::default(),
        }
    }

    /// Attaches an optional lifecycle listener.
    pub fn with_listener(mut self, listener: Arc<dyn EventListener<M>>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// The owned receiver, exposed so the hosting process can wire a
    /// termination request to [`Receiver::stop`].
    pub fn receiver(&self) -> &R {
        &self.receiver
    }

    /// Runs the consume loop until the receiver is stopped.
    pub async fn run(&self) -> Result<(), TransportError> {
        self.receiver.receive(self).await
    }

    async fn handle_envelope(
        &self,
        envelope: Envelope<M>,
        metadata: QueuedMessageMetadata<R::Handle>,
    ) -> Result<(), TransportError> {
        self.notify(WorkerEvent::HandlingStarted(&envelope));

        let dispatched = envelope
            .with(Stamp::Received)
            .with(Stamp::Attempts(metadata.attempts()));

        match self.bus.dispatch(dispatched).await {
            Ok(()) => {
                self.receiver.acknowledge(metadata.into_handle()).await?;
                self.notify(WorkerEvent::Handled(&envelope));
                Ok(())
            }
            Err(error) => self.apply_failure(error, metadata, Some(&envelope)).await,
        }
    }

    /// Applies the failure disposition and emits the failed event.
    ///
    /// `envelope` is absent when the payload never decoded; there is nothing
    /// to report to listeners in that case, but the disposition still runs so
    /// a malformed message exhausts its retries and dead-letters instead of
    /// looping forever.
    async fn apply_failure(
        &self,
        error: HandlerError,
        metadata: QueuedMessageMetadata<R::Handle>,
        envelope: Option<&Envelope<M>>,
    ) -> Result<(), TransportError> {
        let attempts = metadata.attempts();
        let requeued = self.should_requeue(&error, attempts);

        if requeued {
            debug!(attempts, "handling failed, scheduling a retry");
            self.receiver
                .retry(metadata.into_handle(), self.options.retry_delay)
                .await?;
        } else {
            warn!(attempts, "handling failed, rejecting the message");
            self.receiver.reject(metadata.into_handle(), false).await?;
        }

        if let Some(envelope) = envelope {
            self.notify(WorkerEvent::Failed {
                envelope,
                error: &error,
                requeued,
            });
        }

        Ok(())
    }

    /// A retry needs headroom in the attempt budget and a receiver that can
    /// actually schedule one; everything else is a reject.
    fn should_requeue(&self, error: &HandlerError, attempts: u32) -> bool {
        if error.is_unrecoverable() || !self.receiver.supports_retry() {
            return false;
        }

        attempts + 1 < self.options.max_attempts
    }

    fn notify(&self, event: WorkerEvent<'_, M>) {
        if let Some(listener) = &self.listener {
            listener.on_event(event);
        }
    }
}

#[async_trait]
impl<M, R, B> DeliveryHandler<M, R::Handle> for Worker<M, R, B>
where
    M: Clone + Send + Sync,
    R: Receiver<M>,
    B: MessageBus<M>,
{
    async fn handle(
        &self,
        received: Option<ReceivedDelivery<M, R::Handle>>,
    ) -> Result<(), TransportError> {
        // Idle tick: the receiver's sleep governs pacing, nothing to do here.
        let Some((decoded, metadata)) = received else {
            return Ok(());
        };

        match decoded {
            Ok(envelope) => self.handle_envelope(envelope, metadata).await,
            Err(error) => {
                warn!(error = error.to_string(), "delivery could not be decoded");
                self.apply_failure(HandlerError::from(error), metadata, None)
                    .await
            }
        }
    }
}
