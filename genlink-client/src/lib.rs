//! # genlink-client
//!
//! Client library for the image-generation task service.
//!
//! This crate provides:
//! - One persistent, authenticated WebSocket with single-flight connect
//! - Request/response correlation over that socket, with per-request timeouts
//! - Automatic reconnection with exponential backoff and an attempt cap
//! - Classification of transport failures into user-facing categories
//! - A typed API for inference, upload and result lookup

pub mod backoff;
pub mod classify;
pub mod client;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod tls;
pub mod transport;

#[cfg(test)]
mod testing;

pub use backoff::ReconnectPolicy;
pub use classify::{classify, ClassifiedError, ErrorCategory, TransportSignal};
pub use client::{Client, InferenceOptions};
pub use config::{ClientConfig, ConfigError, TlsClientConfig};
pub use connection::{ConnectionManager, ConnectionState, ReconnectionState};
pub use error::ClientError;
pub use genlink_protocol::{JobResult, UploadAck};
