use alloy::transports::{RpcError as AlloyRpcError, TransportErrorKind};
use relay_queue::error::QueueError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorKind {
    /// Server returned an error response.
    #[error("server returned an error response: {}", .0.as_display())]
    ErrorResp(RpcErrorResponse),

    /// Server returned a null response when a non-null response was expected.
    #[error("server returned a null response when a non-null response was expected")]
    NullResp,

    #[error("unsupported feature: {message}")]
    UnsupportedFeature { message: String },

    /// A local pre-processing step failed, for example request signing.
    #[error("local usage error: {message}")]
    InternalError { message: String },

    #[error("serialization error: {message}")]
    SerError { message: String },

    #[error("deserialization error: {message}, text: {text}")]
    DeserError { message: String, text: String },

    #[error("HTTP error {status}")]
    TransportHttpError { status: u16, body: String },

    #[error("Other transport error: {message}")]
    OtherTransportError { message: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RpcErrorResponse {
    pub code: i64,
    pub message: String,
    pub data: Option<String>,
}

impl RpcErrorResponse {
    pub fn as_display(&self) -> String {
        format!(
            "code {}: {}{}",
            self.code,
            self.message,
            self.data
                .as_ref()
                .map(|data| format!(", data: {data}"))
                .unwrap_or_default()
        )
    }
}

#[derive(Error, Debug, Serialize, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineError {
    #[error("RPC error on chain {chain_id} at {rpc_url}: {message}")]
    #[serde(rename_all = "camelCase")]
    RpcError {
        chain_id: u64,
        rpc_url: String,
        message: String,
        kind: RpcErrorKind,
    },

    #[error("Bundler error on chain {chain_id} at {rpc_url}: {message}")]
    #[serde(rename_all = "camelCase")]
    BundlerError {
        chain_id: u64,
        rpc_url: String,
        message: String,
        kind: RpcErrorKind,
    },

    #[error("Bad RPC configuration: {message}")]
    RpcConfigError { message: String },

    #[error("Signing error: {message}")]
    SigningError { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl EngineError {
    /// The JSON-RPC error response, when the node answered with one.
    pub fn rpc_error_response(&self) -> Option<&RpcErrorResponse> {
        match self {
            EngineError::RpcError {
                kind: RpcErrorKind::ErrorResp(resp),
                ..
            }
            | EngineError::BundlerError {
                kind: RpcErrorKind::ErrorResp(resp),
                ..
            } => Some(resp),
            _ => None,
        }
    }
}

pub trait AlloyRpcErrorToEngineError {
    fn to_engine_error(&self, chain_id: u64, rpc_url: &str) -> EngineError;
    fn to_engine_bundler_error(&self, chain_id: u64, bundler_url: &str) -> EngineError;
}

fn to_engine_rpc_error_kind(err: &AlloyRpcError<TransportErrorKind>) -> RpcErrorKind {
    match err {
        AlloyRpcError::ErrorResp(err) => RpcErrorKind::ErrorResp(RpcErrorResponse {
            code: err.code,
            message: err.message.to_string(),
            data: err.data.as_ref().map(|data| data.to_string()),
        }),
        AlloyRpcError::NullResp => RpcErrorKind::NullResp,
        AlloyRpcError::UnsupportedFeature(feature) => RpcErrorKind::UnsupportedFeature {
            message: feature.to_string(),
        },
        AlloyRpcError::LocalUsageError(err) => RpcErrorKind::InternalError {
            message: err.to_string(),
        },
        AlloyRpcError::SerError(err) => RpcErrorKind::SerError {
            message: err.to_string(),
        },
        AlloyRpcError::DeserError { err, text } => RpcErrorKind::DeserError {
            message: err.to_string(),
            text: text.to_string(),
        },
        AlloyRpcError::Transport(TransportErrorKind::HttpError(err)) => {
            RpcErrorKind::TransportHttpError {
                status: err.status,
                body: err.body.to_string(),
            }
        }
        AlloyRpcError::Transport(err) => RpcErrorKind::OtherTransportError {
            message: err.to_string(),
        },
    }
}

impl AlloyRpcErrorToEngineError for AlloyRpcError<TransportErrorKind> {
    fn to_engine_error(&self, chain_id: u64, rpc_url: &str) -> EngineError {
        EngineError::RpcError {
            chain_id,
            rpc_url: rpc_url.to_string(),
            message: self.to_string(),
            kind: to_engine_rpc_error_kind(self),
        }
    }

    fn to_engine_bundler_error(&self, chain_id: u64, bundler_url: &str) -> EngineError {
        EngineError::BundlerError {
            chain_id,
            rpc_url: bundler_url.to_string(),
            message: self.to_string(),
            kind: to_engine_rpc_error_kind(self),
        }
    }
}

impl From<relay_queue::redis::RedisError> for EngineError {
    fn from(error: relay_queue::redis::RedisError) -> Self {
        EngineError::InternalError {
            message: error.to_string(),
        }
    }
}

impl From<QueueError> for EngineError {
    fn from(error: QueueError) -> Self {
        EngineError::InternalError {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::InternalError {
            message: format!("serialization error: {error}"),
        }
    }
}
