// Copyright (c) 2026, The amqp-messenger Authors
// MIT License
// All rights reserved.

//! # Retry Policy and Topology Resolution
//!
//! The broker has no native "retry after N seconds" primitive, so delay is
//! synthesized from queue TTLs and dead-letter routing: failed messages are
//! republished to a per-attempt retry queue whose `x-message-ttl` expiry
//! dead-letters them back into the main exchange. This module holds the retry
//! policy and the pure mapping from an attempt number to its retry queue name,
//! TTL and routing key.

/// Header carrying the integer attempt counter on the wire. Absent means 0.
pub const ATTEMPTS_HEADER: &str = "symfony-messenger-attempts";

/// Name of the exchange the per-attempt retry queues are bound to.
pub const RETRY_EXCHANGE: &str = "retry";

/// TTL applied when the retry policy configures none, in milliseconds.
pub const DEFAULT_RETRY_TTL_MS: u64 = 10_000;

/// Resolved retry policy of a connection. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    attempts: u32,
    ttl: Vec<u64>,
    dead_routing_key: Option<String>,
}

/// Broker coordinates of one retry attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    pub queue_name: String,
    pub ttl: u64,
    pub routing_key: String,
}

impl RetryConfig {
    /// Builds a policy for `attempts` total attempts.
    ///
    /// `ttl` is an ordered list of per-attempt delays in milliseconds, indexed
    /// by attempt number (1-based); a single element applies uniformly. An
    /// empty list falls back to [`DEFAULT_RETRY_TTL_MS`].
    pub fn new(attempts: u32, ttl: Vec<u64>, dead_routing_key: Option<String>) -> Self {
        let ttl = if ttl.is_empty() {
            vec![DEFAULT_RETRY_TTL_MS]
        } else {
            ttl
        };

        RetryConfig {
            attempts,
            ttl,
            dead_routing_key,
        }
    }

    /// Maximum number of handling attempts before a message is dead-lettered.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Resolves the retry queue used for attempt number `attempt` (1-based).
    ///
    /// Deterministic: the same attempt always maps to the same entry. The TTL
    /// list clamps to its last element for attempts beyond its length.
    pub fn entry(&self, attempt: u32) -> RetryEntry {
        let attempt = attempt.max(1);
        let index = attempt.min(self.ttl.len() as u32) as usize - 1;

        RetryEntry {
            queue_name: format!("retry_queue_{attempt}"),
            ttl: self.ttl[index],
            routing_key: format!("attempt_{attempt}"),
        }
    }

    /// Routing key to publish attempt number `attempt` under.
    ///
    /// Attempts within the policy route to their retry queue; an attempt past
    /// the maximum routes under the dead routing key (empty when none is
    /// configured) so the message dead-letters instead of being retried again.
    pub fn publish_routing_key(&self, attempt: u32) -> String {
        if attempt > self.attempts {
            self.dead_routing_key.clone().unwrap_or_default()
        } else {
            format!("attempt_{attempt}")
        }
    }
}
