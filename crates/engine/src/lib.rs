//! # RapidPot Engine Crate
//!
//! Weighted prize-draw engine: contributions are verified against the
//! chain, credited to a pot, and periodically one entrant wins the pool
//! minus the house fee.
//!
//! ## Architecture Overview
//!
//! ```text
//!   POST /enter ──▶ PotEngine::enter
//!                     ├── ReferenceRegistry   (one credit per transfer)
//!                     ├── ContributionVerifier ──▶ ChainQuery
//!                     ├── TokenBalanceOracle   (boost eligibility)
//!                     └── EntryLedger ──▶ PotStore ──▶ StateBackend
//!
//!   DrawScheduler / POST /draw/:pot ──▶ DrawOrchestrator
//!                     ├── detach entries (InFlightDraw persisted)
//!                     ├── select_winner ◀── RandomSource
//!                     ├── PayoutExecutor ──▶ TransferSubmitter
//!                     └── commit result, or reinstate entries
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `chain` | chain-facing traits and FIFO mocks |
//! | `solana` | Solana JSON-RPC client and transfer codec |
//! | `verifier` | contribution verification with retry |
//! | `ledger` | entry recording and transfer de-duplication |
//! | `selector` | weighted winner selection |
//! | `payout` | payout submission and confirmation |
//! | `orchestrator` | draw lifecycle, recovery, operator resolution |
//! | `scheduler` | per-pot draw timers |
//! | `store` | persisted ledger document |
//! | `engine` | façade composing the above |
//! | `handlers` | axum HTTP surface |
//! | `config` | environment configuration |
//! | `metrics` | counters and Prometheus export |
//!
//! ## Draw Stages
//!
//! ```text
//! Idle ──▶ Detached ──▶ Submitting ──▶ Idle (result recorded)
//!              │             │
//!              │             ├──▶ Idle (entries reinstated, failure logged)
//!              │             └──▶ Unresolved (operator resolves)
//!              └──▶ Idle (crash recovery reinstates)
//! ```

pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod metrics;
pub mod orchestrator;
pub mod payout;
pub mod retry;
pub mod scheduler;
pub mod selector;
pub mod solana;
pub mod store;
pub mod verifier;

pub use chain::{
    ChainClientError, ChainQuery, MockChainQuery, MockTokenBalances, MockTransferSubmitter,
    ObservedTransaction, ObservedTransfer, PreparedTransfer, SettlementStatus, TokenBalanceOracle,
    TransferSubmitter,
};
pub use config::{load_env_file, ConfigError, ServiceConfig};
pub use engine::{BoostPolicy, EngineDeps, EngineSettings, EnterRequest, PotEngine, PotSummary};
pub use error::{
    EngineError, SettlementError, StateError, StoreError, ValidationError, VerificationError,
};
pub use handlers::{build_router, AppState};
pub use ledger::{EntryLedger, ReferenceGuard, ReferenceRegistry, DEFAULT_BOOST_BPS};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use orchestrator::{DrawOrchestrator, DrawOutcome, RecoveryReport, Resolution};
pub use payout::PayoutExecutor;
pub use retry::RetryPolicy;
pub use scheduler::DrawScheduler;
pub use selector::{
    select_winner, select_winner_at, total_weight, FixedPoint, OsRandom, RandomSource, SeededRandom,
};
pub use solana::{PayoutKeypair, SolanaRpcClient};
pub use store::{FileBackend, MemoryBackend, PotStore, StateBackend};
pub use verifier::{ContributionVerifier, VerifiedTransfer};
