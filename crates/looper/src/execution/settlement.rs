//! Submission & confirmation engine.
//!
//! Binds a settlement unit to a fresh checkpoint, signs it locally, hands it
//! to the ledger fire-and-forget, then polls for a terminal status. Success
//! is only ever reported after a `Confirmed` or `Finalized` status has been
//! observed.

use std::sync::Arc;
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use tracing::{debug, info, warn};

use super::ledger::Ledger;
use super::wallet::sign_settlement;
use crate::config::ConfirmationTiming;
use crate::errors::LooperError;
use crate::types::{Outcome, PendingSettlement, SettlementStatus, SettlementUnit};

pub struct SettlementEngine {
    ledger: Arc<dyn Ledger>,
    signer: PrivateKeySigner,
    poll_interval: Duration,
    max_attempts: u32,
}

impl SettlementEngine {
    pub fn new(ledger: Arc<dyn Ledger>, signer: PrivateKeySigner, timing: &ConfirmationTiming) -> Self {
        info!(
            signer = %signer.address(),
            poll_interval_ms = timing.poll_interval_ms,
            max_attempts = timing.max_attempts,
            "SettlementEngine initialized"
        );

        Self {
            ledger,
            signer,
            poll_interval: Duration::from_millis(timing.poll_interval_ms),
            max_attempts: timing.max_attempts,
        }
    }

    /// Owner address of the signing wallet.
    pub fn owner(&self) -> String {
        self.signer.address().to_string()
    }

    /// Sign and send `unit`. Returns once the ledger has accepted it.
    pub async fn submit(&self, unit: SettlementUnit) -> Result<PendingSettlement, LooperError> {
        let token = self.ledger.latest_checkpoint().await?;
        let label = unit.label.clone();
        let signed = sign_settlement(&self.signer, unit, token.clone())?;
        let id = self.ledger.send(signed).await?;

        info!(
            settlement_id = %id,
            label = %label,
            expiry_height = token.expiry_height,
            "settlement submitted"
        );

        Ok(PendingSettlement { id, token })
    }

    /// Poll until a terminal status is observed.
    ///
    /// - embedded failure: `SettlementFailed`, polling stops.
    /// - confirmed / finalized: success.
    /// - no status yet: `SettlementExpired` as soon as the ledger height has
    ///   passed the token's expiry, otherwise keep polling.
    ///
    /// Poll errors are logged and treated as "no status". An exhausted attempt
    /// budget is reported as `SettlementExpired`.
    pub async fn confirm(&self, pending: &PendingSettlement) -> Result<Outcome, LooperError> {
        let id = &pending.id;
        let mut last_height = 0;

        for attempt in 1..=self.max_attempts {
            let status = match self.ledger.status(id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(error = %e, settlement_id = %id, attempt, "status poll error, retrying");
                    None
                }
            };

            match status {
                Some(SettlementStatus::Failed { reason }) => {
                    warn!(settlement_id = %id, %reason, "settlement failed on ledger");
                    return Err(LooperError::SettlementFailed {
                        id: id.to_string(),
                        reason,
                    });
                }
                Some(s @ (SettlementStatus::Confirmed | SettlementStatus::Finalized)) => {
                    let finalized = s == SettlementStatus::Finalized;
                    info!(settlement_id = %id, attempt, finalized, "settlement confirmed");
                    return Ok(Outcome {
                        id: id.clone(),
                        finalized,
                        attempts: attempt,
                    });
                }
                Some(SettlementStatus::Processed) => {
                    debug!(settlement_id = %id, attempt, "settlement processed, awaiting confirmation");
                }
                None => match self.ledger.current_height().await {
                    Ok(height) => {
                        last_height = height;
                        if height > pending.token.expiry_height {
                            warn!(
                                settlement_id = %id,
                                height,
                                expiry_height = pending.token.expiry_height,
                                attempt,
                                "freshness window elapsed without a status"
                            );
                            return Err(self.expired(pending, height));
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, settlement_id = %id, "height read failed");
                    }
                },
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        warn!(
            settlement_id = %id,
            attempts = self.max_attempts,
            "confirmation attempt budget exhausted"
        );
        Err(self.expired(pending, last_height))
    }

    pub async fn submit_and_confirm(&self, unit: SettlementUnit) -> Result<Outcome, LooperError> {
        let pending = self.submit(unit).await?;
        self.confirm(&pending).await
    }

    fn expired(&self, pending: &PendingSettlement, current_height: u64) -> LooperError {
        LooperError::SettlementExpired {
            id: pending.id.to_string(),
            expiry_height: pending.token.expiry_height,
            current_height,
        }
    }
}
