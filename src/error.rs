//! Stable error kinds shared across the plugin surfaces. EVM-internal
//! failures are materialized as failed receipts and never cross
//! [processor::process](crate::processor); block-level failures abort the
//! whole block; admission failures are returned per transaction.

use thiserror::Error;

use crate::common::Hash;

/// Errors surfaced through the host-facing plugin contract.
#[derive(Error, Debug)]
pub enum VmError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
    #[error("invalid block: {0}")]
    InvalidBlock(String),
    #[error("unknown parent {0}")]
    UnknownParent(Hash),
    #[error("unknown block {0}")]
    UnknownBlock(Hash),
    #[error("no pending work")]
    NoPendingWork,
    #[error("operation canceled")]
    Canceled,
    #[error("corrupted: {0}")]
    Corrupted(String),
    #[error("internal: {0}")]
    Internal(String),
}

/// State store failures. `Corrupted` is irrecoverable and must abort rather
/// than be silently masked.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum StateError {
    #[error("unknown state root {0}")]
    NotFound(Hash),
    #[error("corrupted state: missing trie node {0}")]
    Corrupted(Hash),
}

/// EVM-level execution failures, reported through receipts and call traces.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    #[error("out of gas")]
    OutOfGas,
    #[error("execution reverted")]
    Reverted,
    #[error("write protection")]
    WriteProtection,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("nonce overflow")]
    NonceIntOverflow,
    #[error("max call depth exceeded")]
    Depth,
    #[error("contract address collision")]
    ContractAddrCollision,
    #[error("invalid code")]
    InvalidCode,
}

/// Warp message verification failures. Surfaced as predicate-false in the
/// block header bitmap, or as a revert for direct opcode use.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WarpError {
    #[error("cannot unpack warp message: {0}")]
    InvalidWarpMsg(String),
    #[error("insufficient signature weight: {signed} * {denominator} < {total} * {numerator}")]
    InsufficientWeight {
        signed: u64,
        total: u64,
        numerator: u64,
        denominator: u64,
    },
    #[error("invalid aggregate signature")]
    InvalidSignature,
    #[error("cannot retrieve validator set: {0}")]
    ValidatorSet(String),
    #[error("gas overflow computing warp verification cost")]
    GasOverflow,
    #[error("no warp signer configured")]
    NoSigner,
    #[error("unknown warp message {0}")]
    UnknownMessage(Hash),
}

/// State-sync failures. `Stalled` surfaces after retries and pivot
/// escalation are exhausted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("network: {0}")]
    Network(String),
    #[error("invalid range proof")]
    InvalidProof,
    #[error("sync stalled after {0} attempts")]
    Stalled(usize),
    #[error("reconstructed root {got} does not match pivot {want}")]
    RootMismatch { got: Hash, want: Hash },
    #[error("sync interrupted")]
    Interrupted,
}

/// Transaction admission failures, returned per transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("mempool is full")]
    MempoolFull,
    #[error("nonce too low: tx {tx} < state {state}")]
    NonceTooLow { tx: u64, state: u64 },
    #[error("nonce too high: tx {tx} > state {state}")]
    NonceTooHigh { tx: u64, state: u64 },
    #[error("replacement transaction underpriced")]
    ReplaceUnderpriced,
    #[error("invalid encoding")]
    InvalidEncoding,
    #[error("intrinsic gas too low")]
    IntrinsicGas,
    #[error("insufficient funds for gas * price + value")]
    InsufficientFunds,
    #[error("fee cap below minimum")]
    Underpriced,
    #[error("transaction type not yet supported")]
    TxTypeNotSupported,
    #[error("sender not allowed by tx allow list")]
    SenderNotAllowed,
}
