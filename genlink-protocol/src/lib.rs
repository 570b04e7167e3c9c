//! # genlink-protocol
//!
//! Wire protocol for the image-generation task service.
//!
//! This crate provides:
//! - Task message types (`taskType` + `taskUUID` envelopes)
//! - The authentication frame sent during the handshake
//! - Typed result records for inference and upload tasks
//! - A JSON codec that flattens single, array and batched frames

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{decode_frame, encode};
pub use error::ProtocolError;
pub use message::{
    AuthenticationMessage, IncomingMessage, JobResult, OutgoingMessage, TaskRequest, TaskType,
    UploadAck,
};

/// Default service endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://ws-api.runware.ai/v1";

/// Default inference model.
pub const DEFAULT_MODEL: &str = "google:4@1";
