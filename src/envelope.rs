// Copyright (c) 2026, The amqp-messenger Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! An [`Envelope`] bundles a decoded application message with an ordered list
//! of metadata stamps. Stamps are append-only: deriving a new envelope with an
//! added stamp never mutates the original.

/// A metadata annotation attached to an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stamp {
    /// The envelope was produced by a receiver, not dispatched locally
    Received,
    /// Number of prior handling attempts for this logical message
    Attempts(u32),
}

/// The decoded application message plus its ordered stamps.
///
/// Created by a receiver's decode step, consumed by the dispatch to the bus,
/// and discarded after the delivery's disposition.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    message: M,
    stamps: Vec<Stamp>,
}

impl<M> Envelope<M> {
    /// Wraps a message with no stamps.
    pub fn new(message: M) -> Self {
        Envelope {
            message,
            stamps: Vec::new(),
        }
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn into_message(self) -> M {
        self.message
    }

    /// The stamps in the order they were appended.
    pub fn stamps(&self) -> &[Stamp] {
        &self.stamps
    }

    /// Derives a new envelope with `stamp` appended, leaving `self` untouched.
    pub fn with(&self, stamp: Stamp) -> Self
    where
        M: Clone,
    {
        let mut stamps = self.stamps.clone();
        stamps.push(stamp);
        Envelope {
            message: self.message.clone(),
            stamps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appending_a_stamp_derives_a_new_envelope() {
        let envelope = Envelope::new("payload");
        let stamped = envelope.with(Stamp::Received);

        assert!(envelope.stamps().is_empty());
        assert_eq!(stamped.stamps(), &[Stamp::Received]);
        assert_eq!(stamped.message(), &"payload");
    }

    #[test]
    fn stamps_keep_their_append_order() {
        let envelope = Envelope::new(1u8)
            .with(Stamp::Attempts(2))
            .with(Stamp::Received);

        assert_eq!(envelope.stamps(), &[Stamp::Attempts(2), Stamp::Received]);
    }
}
