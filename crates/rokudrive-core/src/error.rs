//! Errors surfaced to callers of [`DeviceClient`](crate::client::DeviceClient).

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::node_tree::TreeError;
use crate::protocol::ProtocolError;

/// Errors that can occur while talking to the on-device component.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The socket failed with an error that is not retried.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The device answered with `success: false`.
    #[error("{request_type} failed on device: {message}")]
    Device {
        request_type: &'static str,
        message: String,
    },

    /// No response arrived in time. The device may still be working on it.
    #[error(
        "{request_type} request timed out after {}ms{}",
        .timeout.as_millis(),
        call_site_suffix(.call_site)
    )]
    Timeout {
        request_type: &'static str,
        timeout: Duration,
        call_site: Option<String>,
    },

    /// The socket closed while the request was in flight.
    #[error("connection to device closed")]
    ConnectionClosed,

    /// The response lacked the fields this operation returns.
    #[error("unexpected {request_type} response: {source}")]
    UnexpectedResponse {
        request_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// The scene graph listing violated the parent/ref contract.
    #[error("scene graph error: {0}")]
    Tree(#[from] TreeError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl RpcError {
    /// `true` for "device never answered", as opposed to "device said no".
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    /// `true` when the device rejected the operation.
    pub fn is_device_error(&self) -> bool {
        matches!(self, RpcError::Device { .. })
    }
}

fn call_site_suffix(call_site: &Option<String>) -> String {
    match call_site {
        Some(location) => format!(" (called at {location})"),
        None => String::new(),
    }
}
