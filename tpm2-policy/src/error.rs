// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the session and policy engine
//!
//! Every variant maps onto the TPM 2.0 response code a command handler
//! reports to its caller.

use thiserror::Error;

use crate::constants::TpmRc;

/// Errors returned by session management and policy assertions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TpmError {
    // ===== Resource exhaustion =====
    #[error("no free session slot, save a session and retry")]
    SessionMemory,

    #[error("context gap: the oldest saved session must be reloaded first")]
    ContextGap,

    #[error("all active session handles are in use")]
    SessionHandles,

    #[error("context counter exhausted")]
    TooManyContexts,

    // ===== Internal =====
    #[error("device is in failure mode: {0}")]
    Failure(String),

    // ===== Policy violations =====
    #[error("policy check failed")]
    PolicyFail,

    #[error("policy comparison failed")]
    Policy,

    #[error("command code does not match the policy lock")]
    PolicyCc,

    #[error("cpHash does not match the bound value")]
    CpHash,

    #[error("authorization has expired")]
    Expired,

    #[error("nonce does not match the session nonce")]
    Nonce,

    #[error("locality does not match the policy lock")]
    Locality,

    #[error("physical presence required")]
    Pp,

    // ===== Caller misuse =====
    #[error("value is not acceptable: {0}")]
    Value(&'static str),

    #[error("value out of range: {0}")]
    Range(&'static str),

    #[error("size is not valid: {0}")]
    Size(&'static str),

    #[error("hash algorithm not supported or mismatched")]
    Hash,

    #[error("attribute inconsistency: {0}")]
    Attributes(&'static str),

    #[error("handle does not reference a usable session")]
    Handle,

    #[error("signature is not valid")]
    Signature,

    #[error("ticket is not valid")]
    Ticket,

    #[error("integrity check failed")]
    Integrity,

    #[error("authorization failed")]
    AuthFail,

    #[error("unsupported mode")]
    Mode,

    #[error("unsupported scheme")]
    Scheme,

    // ===== Collaborators =====
    #[error("clock is not advancing")]
    NvUnavailable,

    #[error("NV index has not been written")]
    NvUninitialized,
}

impl TpmError {
    /// Response code reported for this error
    pub fn rc(&self) -> TpmRc {
        match self {
            TpmError::SessionMemory => TpmRc::SessionMemory,
            TpmError::ContextGap => TpmRc::ContextGap,
            TpmError::SessionHandles => TpmRc::SessionHandles,
            TpmError::TooManyContexts => TpmRc::TooManyContexts,
            TpmError::Failure(_) => TpmRc::Failure,
            TpmError::PolicyFail => TpmRc::PolicyFail,
            TpmError::Policy => TpmRc::Policy,
            TpmError::PolicyCc => TpmRc::PolicyCc,
            TpmError::CpHash => TpmRc::CpHash,
            TpmError::Expired => TpmRc::Expired,
            TpmError::Nonce => TpmRc::Nonce,
            TpmError::Locality => TpmRc::Locality,
            TpmError::Pp => TpmRc::Pp,
            TpmError::Value(_) => TpmRc::Value,
            TpmError::Range(_) => TpmRc::Range,
            TpmError::Size(_) => TpmRc::Size,
            TpmError::Hash => TpmRc::Hash,
            TpmError::Attributes(_) => TpmRc::Attributes,
            TpmError::Handle => TpmRc::Handle,
            TpmError::Signature => TpmRc::Signature,
            TpmError::Ticket => TpmRc::Ticket,
            TpmError::Integrity => TpmRc::Integrity,
            TpmError::AuthFail => TpmRc::AuthFail,
            TpmError::Mode => TpmRc::Mode,
            TpmError::Scheme => TpmRc::Scheme,
            TpmError::NvUnavailable => TpmRc::NvUnavailable,
            TpmError::NvUninitialized => TpmRc::NvUninitialized,
        }
    }

    /// Fatal errors latch the session manager into failure mode
    pub fn is_fatal(&self) -> bool {
        matches!(self, TpmError::TooManyContexts | TpmError::Failure(_))
    }

    /// Recoverable by freeing resources and retrying
    pub fn is_warning(&self) -> bool {
        self.rc().is_warning()
    }
}

pub type Result<T, E = TpmError> = std::result::Result<T, E>;
