//! Contribution verification against the chain-query oracle.
//!
//! Pure query: no shared mutable state, safe to call concurrently and
//! never run under a pot lock.

use std::sync::Arc;

use tracing::debug;

use rapidpot_common::Lamports;

use crate::chain::ChainQuery;
use crate::error::VerificationError;
use crate::retry::RetryPolicy;

/// A contribution confirmed on-chain. `amount` is the observed value and is
/// the only figure the ledger credits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedTransfer {
    pub reference: String,
    pub source: String,
    pub recipient: String,
    pub amount: Lamports,
}

pub struct ContributionVerifier {
    chain: Arc<dyn ChainQuery>,
    policy: RetryPolicy,
}

impl ContributionVerifier {
    pub fn new(chain: Arc<dyn ChainQuery>, policy: RetryPolicy) -> Self {
        Self { chain, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Locates `reference` and checks that `payer` sent `expected_recipient`
    /// roughly `claimed` (within `tolerance`).
    ///
    /// A transfer to the recipient from any other account is a
    /// `SourceMismatch`: a reference only credits the account that paid it.
    ///
    /// Each attempt is a full re-query. Transport errors count as "not
    /// located" for that attempt; the last one is reported in `NotFound`.
    pub async fn verify(
        &self,
        reference: &str,
        payer: &str,
        claimed: Lamports,
        expected_recipient: &str,
        tolerance: Lamports,
    ) -> Result<VerifiedTransfer, VerificationError> {
        let attempts = self.policy.attempts();
        let mut last_error = None;

        for attempt in 0..attempts {
            match self.chain.fetch_transaction(reference).await {
                Ok(Some(tx)) => {
                    if let Some(reason) = tx.failure {
                        return Err(VerificationError::ChainError {
                            reference: reference.to_string(),
                            reason,
                        });
                    }

                    let mut to_recipient = tx
                        .transfers
                        .into_iter()
                        .filter(|t| t.destination == expected_recipient)
                        .peekable();
                    let first_source = match to_recipient.peek() {
                        Some(t) => t.source.clone(),
                        None => {
                            return Err(VerificationError::RecipientMismatch {
                                reference: reference.to_string(),
                                expected_recipient: expected_recipient.to_string(),
                            })
                        }
                    };
                    let matched = to_recipient.find(|t| t.source == payer).ok_or_else(|| {
                        VerificationError::SourceMismatch {
                            reference: reference.to_string(),
                            expected_source: payer.to_string(),
                            observed_source: first_source,
                        }
                    })?;

                    if matched.lamports.abs_diff(claimed) > tolerance {
                        return Err(VerificationError::AmountMismatch {
                            reference: reference.to_string(),
                            claimed,
                            observed: matched.lamports,
                            tolerance,
                        });
                    }

                    return Ok(VerifiedTransfer {
                        reference: reference.to_string(),
                        source: matched.source,
                        recipient: matched.destination,
                        amount: matched.lamports,
                    });
                }
                Ok(None) => {
                    debug!(reference, attempt = attempt + 1, "transaction not indexed yet");
                }
                Err(e) => {
                    debug!(
                        reference,
                        attempt = attempt + 1,
                        error = %e,
                        "transaction lookup failed"
                    );
                    last_error = Some(e.to_string());
                }
            }
            self.policy.pause(attempt).await;
        }

        Err(VerificationError::NotFound {
            reference: reference.to_string(),
            attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainClientError, MockChainQuery, ObservedTransaction, ObservedTransfer};

    const ADMIN: &str = "ADMIN";

    fn verifier(mock: Arc<MockChainQuery>, attempts: u32) -> ContributionVerifier {
        ContributionVerifier::new(mock, RetryPolicy::immediate(attempts))
    }

    fn transfer(source: &str, destination: &str, lamports: u64) -> ObservedTransfer {
        ObservedTransfer {
            source: source.into(),
            destination: destination.into(),
            lamports: Lamports(lamports),
        }
    }

    #[tokio::test]
    async fn verified_amount_is_the_observed_one() {
        let mock = Arc::new(MockChainQuery::new());
        mock.push_transfer("sig", "A", ADMIN, 1_000_050_000);
        let v = verifier(mock, 5)
            .verify("sig", "A", Lamports(1_000_000_000), ADMIN, Lamports(100_000))
            .await
            .unwrap_or_else(|e| panic!("verify: {}", e));
        assert_eq!(v.amount, Lamports(1_000_050_000));
        assert_eq!(v.source, "A");
    }

    #[tokio::test]
    async fn amount_outside_tolerance_is_rejected() {
        let mock = Arc::new(MockChainQuery::new());
        mock.push_transfer("sig", "A", ADMIN, 1_000_110_000);
        let err = verifier(mock, 5)
            .verify("sig", "A", Lamports(1_000_000_000), ADMIN, Lamports(100_000))
            .await
            .err();
        assert_eq!(
            err,
            Some(VerificationError::AmountMismatch {
                reference: "sig".into(),
                claimed: Lamports(1_000_000_000),
                observed: Lamports(1_000_110_000),
                tolerance: Lamports(100_000),
            })
        );
    }

    #[tokio::test]
    async fn retries_until_indexed() {
        let mock = Arc::new(MockChainQuery::new());
        mock.push_response("sig", Ok(None));
        mock.push_response("sig", Err(ChainClientError::Timeout));
        mock.push_transfer("sig", "A", ADMIN, 10);
        let v = verifier(mock.clone(), 5)
            .verify("sig", "A", Lamports(10), ADMIN, Lamports(0))
            .await;
        assert!(v.is_ok());
        assert_eq!(mock.calls_for("sig"), 3);
    }

    #[tokio::test]
    async fn not_found_after_budget() {
        let mock = Arc::new(MockChainQuery::new());
        mock.push_response("sig", Err(ChainClientError::Network("refused".into())));
        let err = verifier(mock.clone(), 5)
            .verify("sig", "A", Lamports(10), ADMIN, Lamports(0))
            .await
            .err();
        match err {
            Some(VerificationError::NotFound { attempts, last_error, .. }) => {
                assert_eq!(attempts, 5);
                assert!(last_error.unwrap_or_default().contains("refused"));
            }
            other => panic!("expected NotFound, got {:?}", other),
        }
        assert_eq!(mock.calls_for("sig"), 5);
    }

    #[tokio::test]
    async fn failed_transaction_is_chain_error() {
        let mock = Arc::new(MockChainQuery::new());
        mock.push_response(
            "sig",
            Ok(Some(ObservedTransaction {
                reference: "sig".into(),
                failure: Some("InsufficientFunds".into()),
                transfers: vec![],
            })),
        );
        let err = verifier(mock.clone(), 5)
            .verify("sig", "A", Lamports(10), ADMIN, Lamports(0))
            .await
            .err();
        assert!(matches!(err, Some(VerificationError::ChainError { .. })));
        assert_eq!(mock.calls_for("sig"), 1);
    }

    #[tokio::test]
    async fn first_transfer_to_recipient_is_matched() {
        let mock = Arc::new(MockChainQuery::new());
        mock.push_response(
            "sig",
            Ok(Some(ObservedTransaction {
                reference: "sig".into(),
                failure: None,
                transfers: vec![
                    transfer("A", "OTHER", 10),
                    transfer("A", ADMIN, 20),
                    transfer("A", ADMIN, 30),
                ],
            })),
        );
        let v = verifier(mock, 1)
            .verify("sig", "A", Lamports(20), ADMIN, Lamports(0))
            .await
            .unwrap_or_else(|e| panic!("verify: {}", e));
        assert_eq!(v.amount, Lamports(20));
    }

    #[tokio::test]
    async fn wrong_recipient() {
        let mock = Arc::new(MockChainQuery::new());
        mock.push_transfer("sig", "A", "SOMEONE_ELSE", 10);
        let err = verifier(mock, 1)
            .verify("sig", "A", Lamports(10), ADMIN, Lamports(0))
            .await
            .err();
        assert!(matches!(err, Some(VerificationError::RecipientMismatch { .. })));
    }

    #[tokio::test]
    async fn reference_paid_by_someone_else_is_rejected() {
        let mock = Arc::new(MockChainQuery::new());
        mock.push_transfer("sig", "A", ADMIN, 10);
        let err = verifier(mock, 1)
            .verify("sig", "B", Lamports(10), ADMIN, Lamports(0))
            .await
            .err();
        assert_eq!(
            err,
            Some(VerificationError::SourceMismatch {
                reference: "sig".into(),
                expected_source: "B".into(),
                observed_source: "A".into(),
            })
        );
    }

    #[tokio::test]
    async fn payer_transfer_found_among_others() {
        let mock = Arc::new(MockChainQuery::new());
        mock.push_response(
            "sig",
            Ok(Some(ObservedTransaction {
                reference: "sig".into(),
                failure: None,
                transfers: vec![
                    transfer("C", ADMIN, 5),
                    transfer("B", ADMIN, 10),
                ],
            })),
        );
        let v = verifier(mock, 1)
            .verify("sig", "B", Lamports(10), ADMIN, Lamports(0))
            .await
            .unwrap_or_else(|e| panic!("verify: {}", e));
        assert_eq!(v.source, "B");
        assert_eq!(v.amount, Lamports(10));
    }
}
