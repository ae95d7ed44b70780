use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::swap::SwapHash;

/// Errors surfaced by the swap core.
#[derive(Debug, Error)]
pub enum SwapError {
    #[error("quote exceeds limit: {field} quoted at {quoted} sat, limit {limit} sat")]
    QuoteExceedsLimit {
        field: &'static str,
        quoted: u64,
        limit: u64,
    },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("deadline passed before the htlc reached the target depth")]
    InsufficientConfirmations,

    #[error("off-chain payment failed: {0}")]
    OffchainPaymentFailed(String),

    #[error("on-chain broadcast failed: {0}")]
    OnchainBroadcastFailed(String),

    #[error("cancel rejected: swap {0} is past the point of no return")]
    PastPointOfNoReturn(SwapHash),

    #[error("unknown swap: {0}")]
    UnknownSwap(SwapHash),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("swap server error: {0}")]
    Server(String),

    #[error("collaborator failure: {0}")]
    Collaborator(String),

    #[error("too many active swaps")]
    MaxActiveSwaps,

    #[error("too many active loop in swaps for peer")]
    PeerLimitExceeded,

    #[error("storage failed; no further swaps will be admitted")]
    Halted,

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Terminal failure tag recorded in the swap state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    QuoteExceedsLimit,
    ProtocolViolation(String),
    InsufficientConfirmations,
    OffchainPaymentFailed(String),
    OnchainBroadcastFailed(String),
    UserCancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::QuoteExceedsLimit => write!(f, "quote exceeds limit"),
            FailureReason::ProtocolViolation(detail) => {
                write!(f, "protocol violation: {detail}")
            }
            FailureReason::InsufficientConfirmations => {
                write!(f, "insufficient confirmations before deadline")
            }
            FailureReason::OffchainPaymentFailed(detail) => {
                write!(f, "off-chain payment failed: {detail}")
            }
            FailureReason::OnchainBroadcastFailed(detail) => {
                write!(f, "on-chain broadcast failed: {detail}")
            }
            FailureReason::UserCancelled => write!(f, "cancelled by user"),
        }
    }
}

/// Errors from the durable swap store. Any of these is fatal to the process:
/// the supervisor refuses to advance state it cannot record.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("contract already exists for swap {0}")]
    DuplicateContract(SwapHash),

    #[error("unknown swap {0}")]
    UnknownSwap(SwapHash),

    #[error("swap {0} is terminal; event rejected")]
    Terminal(SwapHash),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store io: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode swap record: {0}")]
    Encode(#[from] serde_json::Error),
}
