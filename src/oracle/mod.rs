//! Balance verification against the on-chain source of truth.
//!
//! The verifier owns the oracle conversation and nothing else: it answers
//! "how much does this wallet hold right now" with either a confirmed
//! balance or an explicit unavailable outcome. What to do with either answer
//! is the engine's call, so transient RPC trouble here never turns into a
//! position mutation on its own.

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::warn;

pub mod rpc;

pub use rpc::SolanaRpcClient;

/// Fractional decimals of the staked SPL mint.
pub const MINT_DECIMALS: u8 = 9;

/// One verification attempt. `Unavailable` is an answer, not an error: it
/// propagates as a value so the engine can apply its failure policy.
#[derive(Debug, Clone, PartialEq)]
pub enum Verification {
    /// Confirmed balance in whole tokens. A wallet with no token account
    /// for the mint holds nothing and verifies as 0.0.
    Balance(f64),
    /// The oracle could not answer (transport failure, RPC error, timeout).
    Unavailable(String),
}

#[async_trait]
pub trait BalanceVerifier: Send + Sync {
    async fn verify(&self, wallet_address: &str) -> Verification;
}

/// Production verifier: reads SPL token accounts over Solana JSON-RPC.
pub struct OnchainBalanceVerifier {
    rpc: SolanaRpcClient,
    mint_address: String,
}

impl OnchainBalanceVerifier {
    pub fn new(rpc: SolanaRpcClient, mint_address: String) -> Self {
        Self { rpc, mint_address }
    }

    /// Sums the wallet's balance across every token account it holds for the
    /// mint. Wallets normally hold one associated account, but nothing stops
    /// a second account from existing, and missing it would misread a live
    /// stake as a withdrawal.
    async fn fetch_staked_balance(&self, wallet_address: &str) -> Result<f64> {
        let accounts = self
            .rpc
            .get_token_accounts_by_owner(wallet_address, &self.mint_address)
            .await?;

        // No account for the mint means nothing staked, not an error.
        if accounts.is_empty() {
            return Ok(0.0);
        }

        let mut total = 0.0;
        for account in &accounts {
            let (raw, decimals) = self.rpc.get_token_account_balance(account).await?;
            check_mint_decimals(account, decimals)?;
            total += scale_raw_amount(raw, decimals);
        }

        Ok(total)
    }
}

#[async_trait]
impl BalanceVerifier for OnchainBalanceVerifier {
    async fn verify(&self, wallet_address: &str) -> Verification {
        match self.fetch_staked_balance(wallet_address).await {
            Ok(balance) => Verification::Balance(balance),
            Err(e) => {
                warn!(wallet = %wallet_address, error = %e, "balance verification unavailable");
                Verification::Unavailable(e.to_string())
            }
        }
    }
}

/// Raw base units to whole tokens (`raw / 10^decimals`).
pub fn scale_raw_amount(raw: u64, decimals: u8) -> f64 {
    raw as f64 / 10f64.powi(decimals as i32)
}

/// The staking mint carries exactly [`MINT_DECIMALS`] decimals; an account
/// reporting anything else belongs to a different mint, so the balance is
/// rejected rather than scaled.
fn check_mint_decimals(account: &str, decimals: u8) -> Result<()> {
    if decimals != MINT_DECIMALS {
        bail!(
            "token account {} reports {} decimals, expected {}",
            account,
            decimals,
            MINT_DECIMALS
        );
    }
    Ok(())
}
