// JSON-RPC chain client for a live network

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::cluster::{ChainClient, ClusterError};
use crate::types::{
    Amount, Height, Identity, ProposalId, ProposalStatus, SoftwareUpgradeProposal, VoteOption,
};

/// JSON-RPC request
#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    method: String,
    params: serde_json::Value,
    id: u64,
}

/// JSON-RPC response
#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    #[allow(dead_code)]
    jsonrpc: String,
    result: Option<T>,
    error: Option<JsonRpcError>,
    #[allow(dead_code)]
    id: u64,
}

/// JSON-RPC error
#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

/// Chain info returned by `chain_getInfo`
#[derive(Debug, Clone, Deserialize)]
pub struct ChainInfo {
    pub height: Height,
    #[serde(default)]
    pub chain_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProposalInfo {
    status: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResult {
    proposal_id: serde_json::Value,
}

/// Decode a JSON-RPC response body
fn decode<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, ClusterError> {
    let response: JsonRpcResponse<T> = serde_json::from_str(body)
        .map_err(|e| ClusterError::Rpc(format!("Parse error: {}", e)))?;

    if let Some(error) = response.error {
        return Err(ClusterError::Rpc(format!("{} (code {})", error.message, error.code)));
    }

    response
        .result
        .ok_or_else(|| ClusterError::Rpc("Empty response".to_string()))
}

/// Proposal ids come back as numbers from some nodes and strings from others
fn proposal_id_from(value: serde_json::Value) -> Result<ProposalId, ClusterError> {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .map(ProposalId::from)
            .ok_or_else(|| ClusterError::Rpc(format!("Invalid proposal id: {}", n))),
        serde_json::Value::String(s) if !s.is_empty() => Ok(ProposalId::new(s)),
        other => Err(ClusterError::Rpc(format!("Invalid proposal id: {}", other))),
    }
}

/// Transactions rejected by the node are not transport failures
fn as_rejection(err: ClusterError) -> ClusterError {
    match err {
        ClusterError::Rpc(msg) => ClusterError::Rejected(msg),
        other => other,
    }
}

/// RPC client for one chain of the cluster
pub struct RpcChainClient {
    url: String,
    chain_id: String,
    denom: String,
    client: reqwest::Client,
    request_id: AtomicU64,
}

impl RpcChainClient {
    pub fn new(
        url: &str,
        chain_id: &str,
        denom: &str,
        timeout: Duration,
    ) -> Result<Self, ClusterError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClusterError::Unreachable(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            url: url.to_string(),
            chain_id: chain_id.to_string(),
            denom: denom.to_string(),
            client,
            request_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get next request ID
    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Make a JSON-RPC call
    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, ClusterError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
            id: self.next_id(),
        };
        debug!("→ {} {} (id {})", self.chain_id, method, request.id);

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ClusterError::Unreachable(format!("Network error: {}", e)))?;

        if !response.status().is_success() {
            return Err(ClusterError::Unreachable(format!("HTTP error: {}", response.status())));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ClusterError::Unreachable(format!("Read body failed: {}", e)))?;

        decode(&body)
    }

    /// Get chain info
    pub async fn chain_info(&self) -> Result<ChainInfo, ClusterError> {
        self.call("chain_getInfo", serde_json::Value::Null).await
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn denom(&self) -> &str {
        &self.denom
    }

    async fn query_height(&self) -> Result<Height, ClusterError> {
        Ok(self.chain_info().await?.height)
    }

    async fn submit_proposal(
        &self,
        signer: &Identity,
        proposal: &SoftwareUpgradeProposal,
    ) -> Result<ProposalId, ClusterError> {
        let result: SubmitResult = self
            .call(
                "gov_submitUpgradeProposal",
                serde_json::json!([{ "signer": signer.key_name, "proposal": proposal }]),
            )
            .await
            .map_err(as_rejection)?;

        proposal_id_from(result.proposal_id)
    }

    async fn submit_vote(
        &self,
        voter: &Identity,
        proposal_id: &ProposalId,
        option: VoteOption,
    ) -> Result<(), ClusterError> {
        let _: serde_json::Value = self
            .call(
                "gov_vote",
                serde_json::json!([{
                    "voter": voter.key_name,
                    "proposal_id": proposal_id,
                    "option": option.as_str(),
                }]),
            )
            .await
            .map_err(as_rejection)?;
        Ok(())
    }

    async fn query_proposal_status(
        &self,
        proposal_id: &ProposalId,
    ) -> Result<ProposalStatus, ClusterError> {
        let info: ProposalInfo = self
            .call("gov_getProposal", serde_json::json!([proposal_id]))
            .await?;

        info.status.parse().map_err(ClusterError::Rpc)
    }

    async fn fund_test_accounts(
        &self,
        amount: Amount,
        count: usize,
    ) -> Result<Vec<Identity>, ClusterError> {
        self.call(
            "faucet_fundAccounts",
            serde_json::json!([{ "amount": amount, "denom": self.denom, "count": count }]),
        )
        .await
        .map_err(as_rejection)
    }
}
