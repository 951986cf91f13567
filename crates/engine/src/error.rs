//! Error taxonomy of the draw engine.
//!
//! | Family | Variants | Caller action |
//! |--------|----------|---------------|
//! | [`ValidationError`] | malformed request | fix request, never retried |
//! | [`VerificationError`] | transfer not found, failed, or mismatched | resubmit a new transfer |
//! | [`StateError`] | unknown pot, busy pot, replayed transfer | caller-visible, not retried |
//! | [`SettlementError`] | SettlementFailed, Unconfirmed | operator alert, entries preserved |
//! | [`StoreError`] | Io, Serialize | operator alert |
//!
//! Messages carry references and expected/observed values, never lock state.

use rapidpot_common::{AmountError, Lamports};
use thiserror::Error;

fn suffix(prefix: &str, value: &Option<String>) -> String {
    value
        .as_ref()
        .map(|v| format!("{}{})", prefix, v))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("invalid transfer reference {0:?}")]
    InvalidReference(String),

    #[error("invalid pot configuration: {0}")]
    InvalidConfig(String),
}

impl From<AmountError> for ValidationError {
    fn from(e: AmountError) -> Self {
        ValidationError::InvalidAmount(e.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error(
        "transaction {reference} not found after {attempts} attempts{}",
        suffix(" (last error: ", .last_error)
    )]
    NotFound {
        reference: String,
        attempts: u32,
        last_error: Option<String>,
    },

    #[error("transaction {reference} failed on-chain: {reason}")]
    ChainError { reference: String, reason: String },

    #[error("transaction {reference} has no transfer to {expected_recipient}")]
    RecipientMismatch {
        reference: String,
        expected_recipient: String,
    },

    #[error("transaction {reference} was paid by {observed_source}, not {expected_source}")]
    SourceMismatch {
        reference: String,
        expected_source: String,
        observed_source: String,
    },

    #[error(
        "amount mismatch for {reference}: claimed {claimed}, on-chain {observed}, \
         tolerance {tolerance}"
    )]
    AmountMismatch {
        reference: String,
        claimed: Lamports,
        observed: Lamports,
        tolerance: Lamports,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("unknown pot: {0}")]
    UnknownPot(String),

    #[error("a draw is already in progress for pot {0}")]
    DrawInProgress(String),

    #[error("transfer {0} has already been credited or is being verified")]
    DuplicateTransfer(String),

    #[error("pot {0} has a payout with unknown outcome; operator resolution required")]
    PayoutUnresolved(String),

    #[error("pot {0} has no unresolved payout")]
    NothingToResolve(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SettlementError {
    #[error("payout settlement failed{}: {reason}", suffix(" (", .reference))]
    SettlementFailed {
        reason: String,
        reference: Option<String>,
    },

    #[error("payout not confirmed after {attempts} checks{}", suffix(" (", .reference))]
    Unconfirmed {
        reference: Option<String>,
        attempts: u32,
    },
}

impl SettlementError {
    pub fn reference(&self) -> Option<&str> {
        match self {
            SettlementError::SettlementFailed { reference, .. }
            | SettlementError::Unconfirmed { reference, .. } => reference.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("state store I/O error: {0}")]
    Io(String),

    #[error("state store serialization error: {0}")]
    Serialize(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialize(e.to_string())
    }
}

/// Any failure surfaced by the engine's public operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Settlement(#[from] SettlementError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Stable machine-readable kind for API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::Verification(VerificationError::NotFound { .. }) => "not_found",
            EngineError::Verification(VerificationError::ChainError { .. }) => "chain_error",
            EngineError::Verification(VerificationError::RecipientMismatch { .. }) => {
                "recipient_mismatch"
            }
            EngineError::Verification(VerificationError::SourceMismatch { .. }) => {
                "source_mismatch"
            }
            EngineError::Verification(VerificationError::AmountMismatch { .. }) => {
                "amount_mismatch"
            }
            EngineError::State(StateError::UnknownPot(_)) => "unknown_pot",
            EngineError::State(StateError::DrawInProgress(_)) => "draw_in_progress",
            EngineError::State(StateError::DuplicateTransfer(_)) => "duplicate_transfer",
            EngineError::State(StateError::PayoutUnresolved(_)) => "payout_unresolved",
            EngineError::State(StateError::NothingToResolve(_)) => "nothing_to_resolve",
            EngineError::Settlement(SettlementError::SettlementFailed { .. }) => {
                "settlement_failed"
            }
            EngineError::Settlement(SettlementError::Unconfirmed { .. }) => "unconfirmed",
            EngineError::Store(_) => "store_error",
        }
    }
}
