//! Application-wide error types.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// JSON-RPC error code lightningd uses for bad parameters.
pub const INVALID_PARAMS: i32 = -32602;

#[derive(Debug, Error)]
pub enum PayanyError {
    #[error("missing required parameter: {0}")]
    MissingParameter(String),

    #[error("{0}, must specify `amount_msat`")]
    AmountRequired(&'static str),

    #[error("{kind}: not matching stated amount_msat: {fixed_msat} != {requested_msat}")]
    AmountMismatch {
        kind: &'static str,
        fixed_msat: u64,
        requested_msat: u64,
    },

    #[error("{0}")]
    ResolutionFailed(String),

    #[error("Budget would be exceeded! {projected_msat}msat / {cap_msat}msat")]
    BudgetExceeded { projected_msat: u64, cap_msat: u64 },

    #[error("Setting {key} to true when payany is active is blocked")]
    OwnershipConflict { key: String },

    #[error("{0}")]
    DownstreamPaymentFailed(EngineFailure),

    #[error("{0}")]
    InvalidParameter(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Node RPC error: {0}")]
    Node(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type Result<T> = std::result::Result<T, PayanyError>;

/// A JSON-RPC error returned by a payment engine, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineFailure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<cln_rpc::RpcError> for EngineFailure {
    fn from(err: cln_rpc::RpcError) -> Self {
        EngineFailure {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

impl PayanyError {
    pub fn resolution(msg: impl Into<String>) -> Self {
        PayanyError::ResolutionFailed(msg.into())
    }

    /// Errors raised while turning a target into an invoice, as opposed to
    /// budget or engine failures.
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            PayanyError::AmountRequired(_)
                | PayanyError::AmountMismatch { .. }
                | PayanyError::ResolutionFailed(_)
                | PayanyError::Http(_)
        )
    }

    /// Render as a JSON-RPC error object. Engine failures keep their own
    /// code, message and data.
    pub fn to_rpc_error(&self) -> Value {
        match self {
            PayanyError::DownstreamPaymentFailed(failure) => json!(failure),
            other => json!({
                "code": INVALID_PARAMS,
                "message": other.to_string(),
            }),
        }
    }

    /// Like [`PayanyError::to_rpc_error`] but with a context prefix on the
    /// message, used by the `rpc_command` hook so callers can tell payany's
    /// rejections apart from the engine's.
    pub fn to_rpc_error_with_context(&self) -> Value {
        let prefix = match self {
            PayanyError::BudgetExceeded { .. } => "payany budget exceeded: ",
            e if e.is_resolution() => "payany could not fetch invoice: ",
            _ => return self.to_rpc_error(),
        };
        json!({
            "code": INVALID_PARAMS,
            "message": format!("{prefix}{self}"),
        })
    }
}
