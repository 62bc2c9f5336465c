// Copyright (c) 2026, The amqp-messenger Authors
// MIT License
// All rights reserved.

//! # Worker Lifecycle Events
//!
//! Fire-and-forget notifications emitted by the worker around each delivery.
//! The listener is optional; running without one is a valid configuration.

use crate::{envelope::Envelope, errors::HandlerError};

/// One lifecycle notification.
#[derive(Debug)]
pub enum WorkerEvent<'e, M> {
    /// Dispatch of the envelope is about to start
    HandlingStarted(&'e Envelope<M>),
    /// The envelope was dispatched and the delivery acknowledged
    Handled(&'e Envelope<M>),
    /// Dispatch failed; `requeued` tells whether a retry was scheduled
    Failed {
        envelope: &'e Envelope<M>,
        error: &'e HandlerError,
        requeued: bool,
    },
}

/// Sink for worker lifecycle events. No return value is consumed.
pub trait EventListener<M>: Send + Sync {
    fn on_event(&self, event: WorkerEvent<'_, M>);
}
