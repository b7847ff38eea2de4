#![deny(missing_docs)]
//! Matrix agent bridge library.
//!
//! Forwards Matrix room messages to a local agent process and relays the
//! agent's answers back. Text messages are briefly held so that an image or
//! file sent right after them can be delivered together as one request.

/// Text/media message aggregation engine.
pub mod aggregator;
/// Event dispatch, agent forwarding and reply relay.
pub mod bridge;
/// Configuration management.
pub mod config;
/// Agent process protocol and client.
pub mod ipc;
/// Logging setup with secret redaction.
pub mod logging;
/// Parsed Matrix message events.
pub mod matrix;

pub use aggregator::{AggregationKey, AggregationState, MediaOutcome, MessageAggregator, TextOutcome};
pub use bridge::Bridge;
