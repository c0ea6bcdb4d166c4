//! Solimesh Realtime client for Rust
//!
//! This crate speaks the Phoenix channel protocol used by the hosted
//! realtime service and exposes broadcast subscriptions: join a topic,
//! receive the payloads published under a named event, and publish your own.

mod channel;
mod client;
mod error;
mod message;

pub use channel::{BroadcastChanges, ChannelBuilder, Subscription};
pub use client::{ConnectionState, RealtimeClient, RealtimeClientOptions};
pub use error::RealtimeError;
pub use message::{BroadcastPayload, ChannelEvent, RealtimeMessage};
