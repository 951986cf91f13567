//! # Chain Collaborators
//!
//! Narrow, mockable interfaces to the external ledger. The engine never
//! talks to an RPC endpoint directly; it goes through these three traits:
//!
//! ```text
//! ContributionVerifier ──▶ ChainQuery::fetch_transaction()
//! PotService (boost)   ──▶ TokenBalanceOracle::token_balance()
//! PayoutExecutor       ──▶ TransferSubmitter::prepare_transfer()
//!                          TransferSubmitter::send_transfer()
//!                          TransferSubmitter::settlement_status()
//! ```
//!
//! ## Contract
//!
//! - Implementations MUST NOT retry internally; retry belongs to the caller's
//!   [`RetryPolicy`](crate::retry::RetryPolicy).
//! - Implementations MUST return [`ChainClientError::Timeout`] for timeouts.
//! - `prepare_transfer` signs locally and MUST NOT broadcast; the reference
//!   it returns is final before anything leaves the process.
//! - `send_transfer` MUST return [`ChainClientError::Rejected`] or
//!   [`ChainClientError::InvalidAddress`] only when the transfer definitely
//!   was not accepted. Any other error means "may have been submitted".
//!
//! Mock implementations return pre-loaded responses in FIFO order.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;

use rapidpot_common::Lamports;

// ════════════════════════════════════════════════════════════════════════════════
// TYPES
// ════════════════════════════════════════════════════════════════════════════════

/// A native-value transfer instruction observed inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedTransfer {
    pub source: String,
    pub destination: String,
    pub lamports: Lamports,
}

/// A located, confirmed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedTransaction {
    pub reference: String,
    /// `Some(reason)` when the transaction's own execution failed.
    pub failure: Option<String>,
    /// Top-level native transfers, in instruction order.
    pub transfers: Vec<ObservedTransfer>,
}

/// A signed outbound transfer that has not been broadcast yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTransfer {
    /// Settlement reference the transfer will carry once it lands.
    pub reference: String,
    pub recipient: String,
    pub amount: Lamports,
    /// Wire-encoded transaction, opaque to the engine.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementStatus {
    /// Not yet seen at the required commitment.
    Pending,
    Confirmed,
    /// Landed but failed on-chain.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainClientError {
    /// Transport-level failure.
    Network(String),
    Timeout,
    /// The endpoint refused the request.
    Rejected(String),
    /// The endpoint answered with something unparseable.
    InvalidResponse(String),
    InvalidAddress(String),
}

impl ChainClientError {
    /// `true` when a submission that produced this error cannot have landed.
    pub fn is_definitive_rejection(&self) -> bool {
        matches!(
            self,
            ChainClientError::Rejected(_) | ChainClientError::InvalidAddress(_)
        )
    }
}

impl fmt::Display for ChainClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "chain network error: {}", msg),
            Self::Timeout => write!(f, "chain request timed out"),
            Self::Rejected(msg) => write!(f, "chain rejected request: {}", msg),
            Self::InvalidResponse(msg) => write!(f, "invalid chain response: {}", msg),
            Self::InvalidAddress(addr) => write!(f, "invalid address: {}", addr),
        }
    }
}

impl std::error::Error for ChainClientError {}

// ════════════════════════════════════════════════════════════════════════════════
// TRAITS
// ════════════════════════════════════════════════════════════════════════════════

/// Transaction lookup oracle.
#[async_trait]
pub trait ChainQuery: Send + Sync {
    /// `Ok(None)` when the transaction is not (yet) indexed.
    async fn fetch_transaction(
        &self,
        reference: &str,
    ) -> Result<Option<ObservedTransaction>, ChainClientError>;
}

/// Outbound transfer submission and settlement tracking.
#[async_trait]
pub trait TransferSubmitter: Send + Sync {
    /// Builds and signs one transfer without broadcasting it.
    async fn prepare_transfer(
        &self,
        recipient: &str,
        amount: Lamports,
    ) -> Result<PreparedTransfer, ChainClientError>;

    /// Broadcasts a prepared transfer.
    async fn send_transfer(&self, transfer: &PreparedTransfer) -> Result<(), ChainClientError>;

    async fn settlement_status(&self, reference: &str)
        -> Result<SettlementStatus, ChainClientError>;
}

/// Token balance lookup used for boost eligibility.
#[async_trait]
pub trait TokenBalanceOracle: Send + Sync {
    /// Total balance of `mint` held by `owner`, in the token's raw units.
    async fn token_balance(&self, owner: &str, mint: &str) -> Result<u64, ChainClientError>;
}

// ════════════════════════════════════════════════════════════════════════════════
// MOCKS
// ════════════════════════════════════════════════════════════════════════════════

type QueryResponse = Result<Option<ObservedTransaction>, ChainClientError>;

/// Mock [`ChainQuery`].
///
/// Responses are queued per reference and consumed FIFO. Once a
/// reference's queue holds a single response, that response is repeated.
/// Unknown references answer `Ok(None)`.
#[derive(Default)]
pub struct MockChainQuery {
    responses: Mutex<HashMap<String, VecDeque<QueryResponse>>>,
    calls: Mutex<Vec<String>>,
}

impl MockChainQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(
        &self,
        reference: &str,
        response: Result<Option<ObservedTransaction>, ChainClientError>,
    ) {
        self.responses
            .lock()
            .entry(reference.to_string())
            .or_default()
            .push_back(response);
    }

    /// Shorthand: a confirmed transaction with a single transfer.
    pub fn push_transfer(&self, reference: &str, source: &str, destination: &str, lamports: u64) {
        self.push_response(
            reference,
            Ok(Some(ObservedTransaction {
                reference: reference.to_string(),
                failure: None,
                transfers: vec![ObservedTransfer {
                    source: source.to_string(),
                    destination: destination.to_string(),
                    lamports: Lamports(lamports),
                }],
            })),
        );
    }

    /// Number of lookups performed for `reference`.
    pub fn calls_for(&self, reference: &str) -> usize {
        self.calls.lock().iter().filter(|r| *r == reference).count()
    }
}

#[async_trait]
impl ChainQuery for MockChainQuery {
    async fn fetch_transaction(
        &self,
        reference: &str,
    ) -> Result<Option<ObservedTransaction>, ChainClientError> {
        self.calls.lock().push(reference.to_string());
        let mut responses = self.responses.lock();
        match responses.get_mut(reference) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Ok(None)),
            Some(queue) => queue.front().cloned().unwrap_or(Ok(None)),
            None => Ok(None),
        }
    }
}

/// Mock [`TransferSubmitter`].
///
/// Submissions, sends and statuses are separate FIFO queues. A submission
/// result decides what `prepare_transfer` yields: `Ok(reference)` signs a
/// transfer with that reference, `Err` is returned as is. An empty
/// submission queue answers `Network("no mock response")`, an empty send
/// queue accepts the broadcast and an empty status queue answers `Pending`.
#[derive(Default)]
pub struct MockTransferSubmitter {
    submissions: Mutex<VecDeque<Result<String, ChainClientError>>>,
    sends: Mutex<VecDeque<Result<(), ChainClientError>>>,
    statuses: Mutex<VecDeque<Result<SettlementStatus, ChainClientError>>>,
    submitted: Mutex<Vec<(String, Lamports)>>,
}

impl MockTransferSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_submission(&self, result: Result<String, ChainClientError>) {
        self.submissions.lock().push_back(result);
    }

    pub fn push_send(&self, result: Result<(), ChainClientError>) {
        self.sends.lock().push_back(result);
    }

    pub fn push_status(&self, status: Result<SettlementStatus, ChainClientError>) {
        self.statuses.lock().push_back(status);
    }

    /// Every `(recipient, amount)` passed to `send_transfer`.
    pub fn submitted(&self) -> Vec<(String, Lamports)> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl TransferSubmitter for MockTransferSubmitter {
    async fn prepare_transfer(
        &self,
        recipient: &str,
        amount: Lamports,
    ) -> Result<PreparedTransfer, ChainClientError> {
        let reference = self
            .submissions
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(ChainClientError::Network("no mock response".to_string())))?;
        Ok(PreparedTransfer {
            reference,
            recipient: recipient.to_string(),
            amount,
            payload: Vec::new(),
        })
    }

    async fn send_transfer(&self, transfer: &PreparedTransfer) -> Result<(), ChainClientError> {
        self.submitted
            .lock()
            .push((transfer.recipient.clone(), transfer.amount));
        self.sends.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn settlement_status(
        &self,
        _reference: &str,
    ) -> Result<SettlementStatus, ChainClientError> {
        self.statuses
            .lock()
            .pop_front()
            .unwrap_or(Ok(SettlementStatus::Pending))
    }
}

/// Mock [`TokenBalanceOracle`] backed by a fixed `owner -> balance` map.
/// Unknown owners hold zero.
#[derive(Default)]
pub struct MockTokenBalances {
    balances: Mutex<HashMap<String, u64>>,
    failing: Mutex<bool>,
}

impl MockTokenBalances {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, owner: &str, balance: u64) {
        self.balances.lock().insert(owner.to_string(), balance);
    }

    /// Makes every lookup fail with a network error.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }
}

#[async_trait]
impl TokenBalanceOracle for MockTokenBalances {
    async fn token_balance(&self, owner: &str, _mint: &str) -> Result<u64, ChainClientError> {
        if *self.failing.lock() {
            return Err(ChainClientError::Network("mock balance failure".to_string()));
        }
        Ok(self.balances.lock().get(owner).copied().unwrap_or(0))
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// COMPILE-TIME ASSERTIONS
// ════════════════════════════════════════════════════════════════════════════════

const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn check() {
        assert_send_sync::<MockChainQuery>();
        assert_send_sync::<MockTransferSubmitter>();
        assert_send_sync::<MockTokenBalances>();
    }
    let _ = check;
};
