//! # RapidPot Common Crate
//!
//! Data model shared by the draw engine and anything that reads its state.
//!
//! ## Modules
//! - `amount`: fixed-point [`Lamports`] and rounding rules
//! - `pot`: [`PotConfig`] and [`DrawSchedule`]
//! - `document`: persisted [`LedgerDocument`] with version migration
//!
//! ## Ownership
//! ```text
//! LedgerDocument
//!   └── pots: PotId -> PotState
//!         ├── entries          (active, insertion order)
//!         ├── history          (DrawResult, chronological)
//!         ├── last_winner
//!         ├── spent_references (credited transfer references)
//!         ├── in_flight        (InFlightDraw while Drawing)
//!         └── failures         (DrawFailure log)
//! ```

pub mod amount;
pub mod document;
pub mod pot;

pub use amount::{AmountError, Lamports, BPS_DENOMINATOR, LAMPORTS_PER_SOL};
pub use document::{
    ContributionEntry, DrawFailure, DrawResult, DrawStage, InFlightDraw, LedgerDocument,
    PotState, CURRENT_VERSION, LEGACY_POT_ID, MAX_FAILURE_LOG,
};
pub use pot::{
    default_pots, validate_pots, DrawSchedule, PotConfig, PotConfigError, PotId,
    DEFAULT_FEE_BPS, DEFAULT_TOLERANCE,
};
