use anyhow::{bail, Result};
use std::env;

/// How the engine treats a position whose balance could not be verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyFailurePolicy {
    /// Leave the position untouched and retry next cycle. Nothing is lost:
    /// the untouched calculation timestamp keeps the interval intact.
    Defer,
    /// Treat the failure as a zero balance and deactivate the position.
    /// Eager, for operators who would rather close positions than carry
    /// balances that cannot be confirmed.
    AssumeUnstaked,
}

impl VerifyFailurePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "defer" | "retry" => Some(Self::Defer),
            "assume_unstaked" | "assume-unstaked" | "unstaked" => Some(Self::AssumeUnstaked),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Defer => "defer",
            Self::AssumeUnstaked => "assume_unstaked",
        }
    }
}

/// Engine configuration, built once at startup and passed by reference.
/// No global state; every component receives the values it needs at
/// construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Solana JSON-RPC endpoint used for balance verification. Required.
    pub rpc_url: String,
    /// SPL mint of the staked token (9 decimals). Required.
    pub mint_address: String,
    pub db_path: String,
    pub cycle_interval_secs: u64,
    pub verify_timeout_secs: u64,
    pub max_concurrent_verifications: usize,
    pub failure_policy: VerifyFailurePolicy,
}

impl Config {
    /// Reads configuration from the environment. Missing `SOLANA_RPC_URL` or
    /// `MINT_ADDRESS` is fatal: the process refuses to start rather than run
    /// a cycle it cannot verify.
    pub fn from_env() -> Result<Self> {
        let rpc_url = match env::var("SOLANA_RPC_URL") {
            Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ => bail!("SOLANA_RPC_URL is not set; refusing to start without a balance oracle"),
        };
        let mint_address = match env::var("MINT_ADDRESS") {
            Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ => bail!("MINT_ADDRESS is not set; refusing to start without the staked mint"),
        };

        let mut cfg = Self {
            rpc_url,
            mint_address,
            db_path: "stakepoints.db".to_string(),
            cycle_interval_secs: 86_400,
            verify_timeout_secs: 10,
            max_concurrent_verifications: 8,
            failure_policy: VerifyFailurePolicy::Defer,
        };

        cfg.db_path = env::var("REWARDS_DB_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(cfg.db_path);

        cfg.cycle_interval_secs = env::var("REWARD_CYCLE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(cfg.cycle_interval_secs);

        cfg.verify_timeout_secs = env::var("VERIFY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(cfg.verify_timeout_secs);

        cfg.max_concurrent_verifications = env::var("REWARD_MAX_CONCURRENT_VERIFICATIONS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(cfg.max_concurrent_verifications);

        if let Ok(raw) = env::var("VERIFY_FAILURE_POLICY") {
            match VerifyFailurePolicy::parse(&raw) {
                Some(p) => cfg.failure_policy = p,
                None => bail!(
                    "VERIFY_FAILURE_POLICY '{}' is not one of: defer, assume_unstaked",
                    raw
                ),
            }
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parse() {
        assert_eq!(
            VerifyFailurePolicy::parse("defer"),
            Some(VerifyFailurePolicy::Defer)
        );
        assert_eq!(
            VerifyFailurePolicy::parse(" ASSUME_UNSTAKED "),
            Some(VerifyFailurePolicy::AssumeUnstaked)
        );
        assert_eq!(
            VerifyFailurePolicy::parse("assume-unstaked"),
            Some(VerifyFailurePolicy::AssumeUnstaked)
        );
        assert_eq!(VerifyFailurePolicy::parse("panic"), None);
        assert_eq!(VerifyFailurePolicy::parse(""), None);
    }

    #[test]
    fn test_policy_round_trips_through_as_str() {
        for p in [
            VerifyFailurePolicy::Defer,
            VerifyFailurePolicy::AssumeUnstaked,
        ] {
            assert_eq!(VerifyFailurePolicy::parse(p.as_str()), Some(p));
        }
    }
}
