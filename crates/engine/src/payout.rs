//! Payout execution in two steps: [`PayoutExecutor::prepare`] signs the
//! transfer and fixes its reference, [`PayoutExecutor::settle`] broadcasts
//! it once and polls for confirmation within a bounded window.
//!
//! The executor never resubmits. A broadcast transfer that cannot be
//! confirmed within the policy window is reported as `Unconfirmed` with
//! its reference.

use std::sync::Arc;

use tracing::{debug, info, warn};

use rapidpot_common::Lamports;

use crate::chain::{PreparedTransfer, SettlementStatus, TransferSubmitter};
use crate::error::SettlementError;
use crate::retry::RetryPolicy;

pub struct PayoutExecutor {
    submitter: Arc<dyn TransferSubmitter>,
    confirmation: RetryPolicy,
}

impl PayoutExecutor {
    pub fn new(submitter: Arc<dyn TransferSubmitter>, confirmation: RetryPolicy) -> Self {
        Self {
            submitter,
            confirmation,
        }
    }

    pub fn confirmation(&self) -> &RetryPolicy {
        &self.confirmation
    }

    /// Signs a transfer of `amount` to `recipient`. Nothing is broadcast,
    /// so every failure here is definitive.
    pub async fn prepare(
        &self,
        recipient: &str,
        amount: Lamports,
    ) -> Result<PreparedTransfer, SettlementError> {
        if amount.is_zero() {
            return Err(SettlementError::SettlementFailed {
                reason: "payout amount is zero".to_string(),
                reference: None,
            });
        }
        self.submitter
            .prepare_transfer(recipient, amount)
            .await
            .map_err(|e| SettlementError::SettlementFailed {
                reason: format!("could not prepare payout: {}", e),
                reference: None,
            })
    }

    /// Broadcasts `transfer` and waits for settlement.
    ///
    /// Returns the settlement reference on confirmation.
    pub async fn settle(&self, transfer: &PreparedTransfer) -> Result<String, SettlementError> {
        let reference = transfer.reference.as_str();
        match self.submitter.send_transfer(transfer).await {
            Ok(()) => info!(
                recipient = %transfer.recipient,
                lamports = transfer.amount.get(),
                reference,
                "payout submitted"
            ),
            Err(e) if e.is_definitive_rejection() => {
                return Err(SettlementError::SettlementFailed {
                    reason: e.to_string(),
                    reference: Some(reference.to_string()),
                });
            }
            Err(e) => warn!(
                recipient = %transfer.recipient,
                lamports = transfer.amount.get(),
                reference,
                error = %e,
                "payout broadcast outcome unknown; polling settlement"
            ),
        }

        let attempts = self.confirmation.attempts();
        for attempt in 0..attempts {
            match self.submitter.settlement_status(reference).await {
                Ok(SettlementStatus::Confirmed) => return Ok(reference.to_string()),
                Ok(SettlementStatus::Failed(reason)) => {
                    return Err(SettlementError::SettlementFailed {
                        reason,
                        reference: Some(reference.to_string()),
                    });
                }
                Ok(SettlementStatus::Pending) => {
                    debug!(reference, attempt = attempt + 1, "payout pending");
                }
                Err(e) => {
                    debug!(
                        reference,
                        attempt = attempt + 1,
                        error = %e,
                        "settlement status lookup failed"
                    );
                }
            }
            self.confirmation.pause(attempt).await;
        }

        Err(SettlementError::Unconfirmed {
            reference: Some(reference.to_string()),
            attempts,
        })
    }

    /// [`prepare`](Self::prepare) then [`settle`](Self::settle).
    pub async fn payout(
        &self,
        recipient: &str,
        amount: Lamports,
    ) -> Result<String, SettlementError> {
        let transfer = self.prepare(recipient, amount).await?;
        self.settle(&transfer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainClientError, MockTransferSubmitter};

    fn executor(mock: Arc<MockTransferSubmitter>, checks: u32) -> PayoutExecutor {
        PayoutExecutor::new(mock, RetryPolicy::immediate(checks))
    }

    #[tokio::test]
    async fn confirmed_after_pending() {
        let mock = Arc::new(MockTransferSubmitter::new());
        mock.push_submission(Ok("payout-sig".into()));
        mock.push_status(Ok(SettlementStatus::Pending));
        mock.push_status(Err(ChainClientError::Timeout));
        mock.push_status(Ok(SettlementStatus::Confirmed));

        let result = executor(mock.clone(), 5).payout("W", Lamports(970)).await;
        assert_eq!(result, Ok("payout-sig".into()));
        assert_eq!(mock.submitted(), vec![("W".to_string(), Lamports(970))]);
    }

    #[tokio::test]
    async fn reference_is_known_before_broadcast() {
        let mock = Arc::new(MockTransferSubmitter::new());
        mock.push_submission(Ok("payout-sig".into()));
        let executor = executor(mock.clone(), 2);

        let prepared = executor
            .prepare("W", Lamports(970))
            .await
            .unwrap_or_else(|e| panic!("prepare: {}", e));
        assert_eq!(prepared.reference, "payout-sig");
        assert!(mock.submitted().is_empty());

        mock.push_status(Ok(SettlementStatus::Confirmed));
        assert_eq!(executor.settle(&prepared).await, Ok("payout-sig".into()));
        assert_eq!(mock.submitted().len(), 1);
    }

    #[tokio::test]
    async fn prepare_failure_is_settlement_failure() {
        let mock = Arc::new(MockTransferSubmitter::new());
        mock.push_submission(Err(ChainClientError::Timeout));
        let err = executor(mock.clone(), 4).payout("W", Lamports(970)).await.err();
        assert!(matches!(
            err,
            Some(SettlementError::SettlementFailed { reference: None, .. })
        ));
        assert!(mock.submitted().is_empty());
    }

    #[tokio::test]
    async fn rejected_send_is_settlement_failure() {
        let mock = Arc::new(MockTransferSubmitter::new());
        mock.push_submission(Ok("sig".into()));
        mock.push_send(Err(ChainClientError::Rejected("insufficient funds".into())));
        let err = executor(mock, 5).payout("W", Lamports(970)).await.err();
        assert!(matches!(
            err,
            Some(SettlementError::SettlementFailed { reference: Some(ref r), .. }) if r == "sig"
        ));
    }

    #[tokio::test]
    async fn on_chain_failure_carries_reference() {
        let mock = Arc::new(MockTransferSubmitter::new());
        mock.push_submission(Ok("sig".into()));
        mock.push_status(Ok(SettlementStatus::Failed("InstructionError".into())));
        let err = executor(mock, 5).payout("W", Lamports(970)).await.err();
        assert_eq!(err.as_ref().and_then(|e| e.reference()), Some("sig"));
    }

    #[tokio::test]
    async fn never_confirmed_is_unconfirmed_and_submitted_once() {
        let mock = Arc::new(MockTransferSubmitter::new());
        mock.push_submission(Ok("sig".into()));
        let err = executor(mock.clone(), 4).payout("W", Lamports(970)).await.err();
        assert_eq!(
            err,
            Some(SettlementError::Unconfirmed {
                reference: Some("sig".into()),
                attempts: 4
            })
        );
        assert_eq!(mock.submitted().len(), 1);
    }

    #[tokio::test]
    async fn transport_error_on_send_still_polls() {
        let mock = Arc::new(MockTransferSubmitter::new());
        mock.push_submission(Ok("sig".into()));
        mock.push_send(Err(ChainClientError::Timeout));
        mock.push_status(Ok(SettlementStatus::Confirmed));
        let result = executor(mock.clone(), 4).payout("W", Lamports(970)).await;
        assert_eq!(result, Ok("sig".into()));
        assert_eq!(mock.submitted().len(), 1);
    }

    #[tokio::test]
    async fn zero_payout_is_not_submitted() {
        let mock = Arc::new(MockTransferSubmitter::new());
        let err = executor(mock.clone(), 4).payout("W", Lamports(0)).await.err();
        assert!(matches!(err, Some(SettlementError::SettlementFailed { .. })));
        assert!(mock.submitted().is_empty());
    }
}
