//! Request/response protocol between execution contexts.
//!
//! - [`envelope`]: wire envelope and the closed per-service request schema
//! - [`client`]: message-id correlation, timeouts and the serving loop

pub mod client;
pub mod envelope;

pub use client::{serve, ClientConfig, ServiceClient, ServiceHandler};
pub use envelope::{
    BatchPayload, CloudRequest, DeviceRecord, DeviceRequest, Envelope, PathPayload,
    ReadBatchPayload, Request, ServiceKey, StoreRequest, UpdatePayload, UtilsRequest, RESPONSE,
};

use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("{caller} invoke timeout: {service}/{operation}")]
    Timeout {
        caller: ServiceKey,
        service: ServiceKey,
        operation: String,
    },

    #[error("Unknown operation for {service}: {operation}")]
    UnknownOperation {
        service: ServiceKey,
        operation: String,
    },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{operation} failed: {message}")]
    Remote { operation: String, message: String },

    #[error("Response channel closed before a reply arrived")]
    ChannelClosed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
