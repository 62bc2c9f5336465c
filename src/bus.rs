// Copyright (c) 2026, The amqp-messenger Authors
// MIT License
// All rights reserved.

//! # Message Bus Contract
//!
//! The bus is an external collaborator: the worker hands it every received
//! envelope and classifies any failure it reports.

use crate::{envelope::Envelope, errors::HandlerError};
use async_trait::async_trait;

/// Dispatches an envelope to the application handling logic.
#[async_trait]
pub trait MessageBus<M>: Send + Sync {
    async fn dispatch(&self, envelope: Envelope<M>) -> Result<(), HandlerError>;
}
