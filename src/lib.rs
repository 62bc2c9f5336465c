// Copyright (c) 2026, The amqp-messenger Authors
// MIT License
// All rights reserved.

mod topology;

pub mod bus;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod receiver;
pub mod retry;
pub mod serializer;
pub mod worker;
