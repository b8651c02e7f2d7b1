// SPDX-License-Identifier: Apache-2.0

//! The framework-wide error taxonomy.
//!
//! Negative discriminants are framework-level failures, positive
//! discriminants are server-app returned codes, and `0` means success.
//! The enum itself is Rust-side ergonomics; on the wire and across the
//! `OnResponse` callback boundary only the raw `i32` travels (see
//! [`RpcError::code`]).

use thiserror::Error;

/// Error taxonomy shared by the client and server halves of the core.
///
/// Discriminant values are ported from Pebble's `ErrorInfo` /
/// `PebbleRpcErrorCode` tables so that a handler which only cares about
/// the numeric code still lines up with the original framework.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("rpc timeout")]
    RpcTimeout,

    #[error("channel closed")]
    ChannelClosed,

    #[error("unknown method")]
    UnknownMethod,

    #[error("message type error")]
    MessageTypeError,

    #[error("decode head failed: {0}")]
    DecodeHeadFailed(String),

    #[error("decode body failed: {0}")]
    DecodeBodyFailed(String),

    #[error("encode head failed: {0}")]
    EncodeHeadFailed(String),

    #[error("encode body failed: {0}")]
    EncodeBodyFailed(String),

    #[error("service already exists")]
    ServiceAlreadyExisted,

    #[error("service registration failed: {0}")]
    ServiceAddFailed(String),

    #[error("insufficient memory")]
    InsufficientMemory,

    #[error("buffer not enough")]
    BuffNotEnough,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("unknown codec")]
    UnknownCodec,

    #[error("response missing result field")]
    MissingResult,

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("protocol exception: {0}")]
    ProtocolException(String),

    #[error("other exception: {0}")]
    OtherException(String),

    /// Internal-only: returned by [`crate::session::SessionTable::register`]
    /// on a session id collision. Never travels on the wire.
    #[error("duplicate session id")]
    Duplicate,

    /// Internal-only: returned by the scheduler when `resume` targets an
    /// id with no registered waiter.
    #[error("unknown coroutine id")]
    UnknownId,

    /// Internal-only: returned by the scheduler when `resume` targets a
    /// coroutine that already consumed its wake.
    #[error("coroutine not yielded")]
    NotYielded,
}

impl RpcError {
    /// The wire-level numeric code for this error, matching the taxonomy
    /// in `source/rpc/common/rpc_error_info.h` / `framework/pebble_rpc.h`
    /// where Pebble defines a matching constant.
    pub fn code(&self) -> i32 {
        match self {
            RpcError::RpcTimeout => -2,
            RpcError::ChannelClosed => -20,
            RpcError::UnknownMethod => 1,
            RpcError::MessageTypeError => -9,
            RpcError::DecodeHeadFailed(_) => -101,
            RpcError::DecodeBodyFailed(_) => -102,
            RpcError::EncodeHeadFailed(_) => -103,
            RpcError::EncodeBodyFailed(_) => -104,
            RpcError::ServiceAlreadyExisted => -105,
            RpcError::ServiceAddFailed(_) => -106,
            RpcError::InsufficientMemory => -107,
            RpcError::BuffNotEnough => -108,
            RpcError::SendFailed(_) => -4,
            RpcError::UnknownCodec => -109,
            RpcError::MissingResult => -11,
            RpcError::InvalidParam(_) => -6,
            RpcError::ProtocolException(_) => -110,
            RpcError::OtherException(_) => -10,
            RpcError::Duplicate => -111,
            RpcError::UnknownId => -112,
            RpcError::NotYielded => -113,
        }
    }

    /// Build an [`RpcError::OtherException`] from any displayable error,
    /// the catch-all translation used at codec/handler boundaries.
    pub fn other(e: impl std::fmt::Display) -> Self {
        RpcError::OtherException(e.to_string())
    }
}

impl From<RpcError> for i32 {
    fn from(e: RpcError) -> i32 {
        e.code()
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::SendFailed(e.to_string())
    }
}
