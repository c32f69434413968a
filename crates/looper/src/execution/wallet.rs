//! Wallet loading and settlement signing.

use alloy::primitives::keccak256;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use tracing::info;

use crate::errors::LooperError;
use crate::types::{FreshnessToken, SettlementUnit, SignedSettlement};

/// Load the signing key from `WALLET_PRIVATE_KEY`.
///
/// In dry-run mode a missing key is replaced by an ephemeral random signer.
/// In live mode it is a configuration error.
pub fn load_signer(dry_run: bool) -> Result<PrivateKeySigner, LooperError> {
    match std::env::var("WALLET_PRIVATE_KEY")
        .ok()
        .filter(|v| !v.is_empty())
    {
        Some(key) => {
            let key = key.strip_prefix("0x").unwrap_or(&key);
            key.parse::<PrivateKeySigner>()
                .map_err(|e| LooperError::Config(format!("failed to parse WALLET_PRIVATE_KEY: {e}")))
        }
        None => {
            if !dry_run {
                return Err(LooperError::Config(
                    "WALLET_PRIVATE_KEY is required in live mode".into(),
                ));
            }
            info!("no private key set, generating ephemeral signer (dry run)");
            Ok(PrivateKeySigner::random())
        }
    }
}

/// Digest signed for a settlement: keccak256 over the JSON encoding of the
/// unit and its freshness token.
pub fn settlement_digest(
    unit: &SettlementUnit,
    token: &FreshnessToken,
) -> Result<alloy::primitives::B256, LooperError> {
    let payload = serde_json::to_vec(&(unit, token))?;
    Ok(keccak256(payload))
}

/// Bind `unit` to `token` and sign it.
pub fn sign_settlement(
    signer: &PrivateKeySigner,
    unit: SettlementUnit,
    token: FreshnessToken,
) -> Result<SignedSettlement, LooperError> {
    let digest = settlement_digest(&unit, &token)?;
    let signature = signer
        .sign_hash_sync(&digest)
        .map_err(|e| LooperError::Signing(e.to_string()))?;

    Ok(SignedSettlement {
        unit,
        token,
        signer: signer.address().to_string(),
        signature: hex::encode(signature.as_bytes()),
    })
}
