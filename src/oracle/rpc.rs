//! Minimal Solana JSON-RPC 2.0 client for SPL token balance reads.
//!
//! Two calls only: resolve the token accounts a wallet owns for one mint,
//! then read each account's raw quantity. Solana reports failures in the
//! JSON-RPC `error` field with HTTP 200, so both are surfaced from the
//! envelope rather than from response status.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TokenAccountsResult {
    value: Vec<TokenAccountEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenAccountEntry {
    pubkey: String,
}

#[derive(Debug, Deserialize)]
struct TokenBalanceResult {
    value: TokenAmount,
}

#[derive(Debug, Deserialize)]
struct TokenAmount {
    /// Raw base-unit quantity, stringified u64 on the wire.
    amount: String,
    decimals: u8,
}

pub struct SolanaRpcClient {
    client: Client,
    rpc_url: String,
}

impl SolanaRpcClient {
    pub fn new(rpc_url: String, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build RPC HTTP client")?;

        Ok(Self { client, rpc_url })
    }

    /// Token-account pubkeys the owner holds for one mint. Empty when the
    /// wallet never created an account for the mint.
    pub async fn get_token_accounts_by_owner(
        &self,
        owner: &str,
        mint: &str,
    ) -> Result<Vec<String>> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getTokenAccountsByOwner",
            "params": [owner, { "mint": mint }, { "encoding": "jsonParsed" }]
        });

        let result: TokenAccountsResult = self.call(&payload).await?;
        Ok(result.value.into_iter().map(|e| e.pubkey).collect())
    }

    /// Raw base-unit quantity held in one token account.
    pub async fn get_token_account_balance(&self, account: &str) -> Result<(u64, u8)> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getTokenAccountBalance",
            "params": [account]
        });

        let result: TokenBalanceResult = self.call(&payload).await?;
        let raw = result
            .value
            .amount
            .parse::<u64>()
            .context("token amount is not a valid integer")?;

        Ok((raw, result.value.decimals))
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, payload: &serde_json::Value) -> Result<T> {
        let response: RpcResponse<T> = self
            .client
            .post(&self.rpc_url)
            .json(payload)
            .send()
            .await
            .context("RPC request failed")?
            .json()
            .await
            .context("failed to parse RPC response")?;

        if let Some(err) = response.error {
            return Err(anyhow::anyhow!("RPC error: {}", err));
        }

        response
            .result
            .ok_or_else(|| anyhow::anyhow!("no result in RPC response"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_accounts_response() {
        let raw = r#"{
            "jsonrpc": "2.0",
            "result": {
                "context": { "apiVersion": "1.18.22", "slot": 311115149 },
                "value": [
                    {
                        "pubkey": "C2gJg6tKpQs41PRS1nC8aw3ZKNZK3HQQZGVrDFDup5nx",
                        "account": { "lamports": 2039280, "owner": "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA" }
                    }
                ]
            },
            "id": 1
        }"#;

        let resp: RpcResponse<TokenAccountsResult> = serde_json::from_str(raw).unwrap();
        assert!(resp.error.is_none());
        let value = resp.result.unwrap().value;
        assert_eq!(value.len(), 1);
        assert_eq!(
            value[0].pubkey,
            "C2gJg6tKpQs41PRS1nC8aw3ZKNZK3HQQZGVrDFDup5nx"
        );
    }

    #[test]
    fn test_parse_empty_token_accounts_response() {
        let raw = r#"{
            "jsonrpc": "2.0",
            "result": { "context": { "slot": 1 }, "value": [] },
            "id": 1
        }"#;

        let resp: RpcResponse<TokenAccountsResult> = serde_json::from_str(raw).unwrap();
        assert!(resp.result.unwrap().value.is_empty());
    }

    #[test]
    fn test_parse_token_balance_response() {
        let raw = r#"{
            "jsonrpc": "2.0",
            "result": {
                "context": { "slot": 311115150 },
                "value": {
                    "amount": "9864510000000",
                    "decimals": 9,
                    "uiAmount": 9864.51,
                    "uiAmountString": "9864.51"
                }
            },
            "id": 1
        }"#;

        let resp: RpcResponse<TokenBalanceResult> = serde_json::from_str(raw).unwrap();
        let value = resp.result.unwrap().value;
        assert_eq!(value.amount.parse::<u64>().unwrap(), 9_864_510_000_000);
        assert_eq!(value.decimals, 9);
    }

    #[test]
    fn test_parse_rpc_error_envelope() {
        let raw = r#"{
            "jsonrpc": "2.0",
            "error": { "code": -32602, "message": "Invalid param: could not find account" },
            "id": 1
        }"#;

        let resp: RpcResponse<TokenBalanceResult> = serde_json::from_str(raw).unwrap();
        assert!(resp.result.is_none());
        assert!(resp.error.is_some());
    }
}
