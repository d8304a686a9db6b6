// Copyright (c) Custodia, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Thin retrying client for the external ledger node's JSON-RPC endpoint.
//!
//! Pre-submission reads (balance, fee, reserve, confirmation polls) retry
//! transient failures with exponential backoff. Submission never retransmits
//! after the request may have reached the node: a submitted transfer that
//! cannot be confirmed is resolved by observation (see `reconcile`), never by
//! resubmission.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::metrics::EngineMetrics;
use crate::retry_transient_with_max_elapsed_time;

/// Result of a confirmation query for a submitted signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationStatus {
    Confirmed,
    Pending,
    // The ledger dropped or rejected the transaction; it will never land.
    Failed,
}

/// The four logical operations the engine needs from the ledger node, plus
/// confirmation. Implemented by [`JsonRpcLedgerClient`] in production and by
/// the mock client in tests.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn get_balance(&self, address: &str) -> EngineResult<u64>;

    async fn estimate_fee(&self) -> EngineResult<u64>;

    async fn minimum_reserve(&self) -> EngineResult<u64>;

    /// Submit a transfer signed with the key behind `from_key_ref`. Returns
    /// the external signature identifying the transfer.
    async fn submit_transfer(
        &self,
        from_key_ref: &str,
        to_address: &str,
        amount: u64,
    ) -> EngineResult<String>;

    async fn confirm(&self, signature: &str) -> EngineResult<ConfirmationStatus>;
}

/// Poll `confirm` until the signature is terminal or the deadline passes.
///
/// `Ok(true)` means confirmed, `Ok(false)` means the ledger dropped the
/// transfer. A deadline pass yields `ConfirmationTimeout`, the ambiguous
/// outcome handed to the reconciler.
pub async fn await_confirmation<C: LedgerClient + ?Sized>(
    client: &C,
    signature: &str,
    poll_interval: Duration,
    deadline: Duration,
) -> EngineResult<bool> {
    let started = Instant::now();
    loop {
        match client.confirm(signature).await {
            Ok(ConfirmationStatus::Confirmed) => return Ok(true),
            Ok(ConfirmationStatus::Failed) => return Ok(false),
            Ok(ConfirmationStatus::Pending) => {}
            Err(e) if e.is_transient() => {
                warn!("[Ledger] transient error polling {}: {}", signature, e);
            }
            Err(e) => return Err(e),
        }

        if started.elapsed() + poll_interval > deadline {
            return Err(EngineError::ConfirmationTimeout {
                signature: signature.to_string(),
            });
        }
        sleep(poll_interval).await;
    }
}

/// Classify a JSON-RPC error into the engine taxonomy. Rate limiting and
/// congestion signals are transient; malformed transactions and invalid
/// addresses are fatal.
pub fn classify_rpc_error(code: i64, message: &str) -> EngineError {
    // -32005 is the conventional "limit exceeded" code.
    if code == -32005 {
        return EngineError::RpcTransient(format!("{} ({})", message, code));
    }
    let lowered = message.to_lowercase();
    let transient = ["rate limit", "too many requests", "congest", "timeout", "busy", "try again"]
        .iter()
        .any(|needle| lowered.contains(needle));
    if transient {
        EngineError::RpcTransient(format!("{} ({})", message, code))
    } else {
        EngineError::RpcFatal(format!("{} ({})", message, code))
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    method: String,
    params: Vec<Value>,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Clone, Debug)]
pub struct JsonRpcLedgerClient {
    http_client: reqwest::Client,
    rpc_url: String,
    request_id: Arc<AtomicU64>,
    max_elapsed: Duration,
    metrics: Option<Arc<EngineMetrics>>,
}

impl JsonRpcLedgerClient {
    pub fn new(rpc_url: impl Into<String>, max_elapsed: Duration) -> Self {
        fn shared_http_client() -> reqwest::Client {
            static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
            CLIENT
                .get_or_init(|| {
                    reqwest::Client::builder()
                        .pool_max_idle_per_host(16)
                        .tcp_keepalive(Some(Duration::from_secs(30)))
                        .connect_timeout(Duration::from_secs(2))
                        .timeout(Duration::from_secs(30))
                        .build()
                        .expect("Failed to build reqwest client")
                })
                .clone()
        }

        Self {
            http_client: shared_http_client(),
            rpc_url: rpc_url.into(),
            request_id: Arc::new(AtomicU64::new(1)),
            max_elapsed,
            metrics: None,
        }
    }

    pub fn with_metrics(
        rpc_url: impl Into<String>,
        max_elapsed: Duration,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let mut client = Self::new(rpc_url, max_elapsed);
        client.metrics = Some(metrics);
        client
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> EngineResult<Value> {
        // A request that never connected provably never reached the node, so
        // it is always safe to resend; anything past that is left to the
        // backoff layer (reads) or to reconciliation (submits).
        self.call_inner(method, params, true).await
    }

    async fn call_no_retransmit(&self, method: &str, params: Vec<Value>) -> EngineResult<Value> {
        self.call_inner(method, params, false).await
    }

    async fn call_inner(
        &self,
        method: &str,
        params: Vec<Value>,
        retransmit: bool,
    ) -> EngineResult<Value> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id,
        };

        let max_attempts: usize = if retransmit { 3 } else { 2 };
        let started = Instant::now();
        let result = self
            .transport_round_trip(&request, method, max_attempts, retransmit)
            .await;

        if let Some(metrics) = &self.metrics {
            let label = if result.is_ok() { "ok" } else { "err" };
            metrics.rpc_queries.with_label_values(&[method, label]).inc();
            metrics
                .rpc_queries_latency
                .with_label_values(&[method])
                .observe(started.elapsed().as_secs_f64());
            metrics.node_connected.set(result.is_ok() as i64);
        }

        result
    }

    async fn transport_round_trip(
        &self,
        request: &JsonRpcRequest,
        method: &str,
        max_attempts: usize,
        retransmit: bool,
    ) -> EngineResult<Value> {
        fn is_transient_transport_error(err: &reqwest::Error) -> bool {
            if err.is_connect() || err.is_timeout() {
                return true;
            }
            let msg = err.to_string().to_lowercase();
            msg.contains("connection closed")
                || msg.contains("connection reset")
                || msg.contains("broken pipe")
                || msg.contains("unexpected eof")
        }

        for attempt in 0..max_attempts {
            let response = match self
                .http_client
                .post(&self.rpc_url)
                .json(request)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(err) => {
                    let resendable = if retransmit {
                        is_transient_transport_error(&err)
                    } else {
                        // The request may already sit in the node's mempool
                        // unless the connection itself never opened.
                        err.is_connect()
                    };
                    if attempt + 1 < max_attempts && resendable {
                        warn!(
                            "[Ledger] transport error calling {} (attempt {}/{}), retrying",
                            method,
                            attempt + 1,
                            max_attempts
                        );
                        sleep(Duration::from_millis(50 * (attempt as u64 + 1))).await;
                        continue;
                    }
                    return if resendable {
                        Err(EngineError::RpcTransient(err.to_string()))
                    } else {
                        Err(EngineError::RpcFatal(err.to_string()))
                    };
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return if status.as_u16() == 429 || status.is_server_error() {
                    Err(EngineError::RpcTransient(format!("HTTP {}: {}", status, body)))
                } else {
                    Err(EngineError::RpcFatal(format!("HTTP {}: {}", status, body)))
                };
            }

            let parsed: JsonRpcResponse = response
                .json()
                .await
                .map_err(|e| EngineError::RpcFatal(format!("invalid JSON-RPC response: {}", e)))?;

            if let Some(err) = parsed.error {
                return Err(classify_rpc_error(err.code, &err.message));
            }
            return parsed
                .result
                .ok_or_else(|| EngineError::RpcFatal("empty JSON-RPC result".to_string()));
        }

        Err(EngineError::RpcTransient(format!(
            "no response from {} after {} attempts",
            method, max_attempts
        )))
    }

    fn map_exhausted(e: EngineError) -> EngineError {
        if e.is_transient() {
            EngineError::RpcExhausted(e.to_string())
        } else {
            e
        }
    }

    fn parse_amount(value: &Value, context: &str) -> EngineResult<u64> {
        value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .ok_or_else(|| EngineError::RpcFatal(format!("unexpected {} result: {}", context, value)))
    }

    async fn raw_get_balance(&self, address: &str) -> EngineResult<u64> {
        let result = self.call("account.get_balance", vec![json!(address)]).await?;
        Self::parse_amount(&result, "balance")
    }

    async fn raw_estimate_fee(&self) -> EngineResult<u64> {
        let result = self.call("transaction.estimate_fee", vec![]).await?;
        Self::parse_amount(&result, "fee")
    }

    async fn raw_minimum_reserve(&self) -> EngineResult<u64> {
        let result = self.call("chain.minimum_reserve", vec![]).await?;
        Self::parse_amount(&result, "reserve")
    }
}

#[async_trait]
impl LedgerClient for JsonRpcLedgerClient {
    async fn get_balance(&self, address: &str) -> EngineResult<u64> {
        retry_transient_with_max_elapsed_time!(self.raw_get_balance(address), self.max_elapsed)
            .map_err(Self::map_exhausted)
    }

    async fn estimate_fee(&self) -> EngineResult<u64> {
        retry_transient_with_max_elapsed_time!(self.raw_estimate_fee(), self.max_elapsed)
            .map_err(Self::map_exhausted)
    }

    async fn minimum_reserve(&self) -> EngineResult<u64> {
        retry_transient_with_max_elapsed_time!(self.raw_minimum_reserve(), self.max_elapsed)
            .map_err(Self::map_exhausted)
    }

    async fn submit_transfer(
        &self,
        from_key_ref: &str,
        to_address: &str,
        amount: u64,
    ) -> EngineResult<String> {
        // Deliberately not wrapped in the backoff layer: a retried submit is
        // a potential duplicate transfer.
        let result = self
            .call_no_retransmit(
                "transaction.submit_transfer",
                vec![json!(from_key_ref), json!(to_address), json!(amount)],
            )
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| EngineError::RpcFatal(format!("unexpected submit result: {}", result)))
    }

    async fn confirm(&self, signature: &str) -> EngineResult<ConfirmationStatus> {
        let result = self
            .call("transaction.confirm", vec![json!(signature)])
            .await?;
        match result.get("status").and_then(Value::as_str) {
            Some("confirmed") => Ok(ConfirmationStatus::Confirmed),
            Some("pending") => Ok(ConfirmationStatus::Pending),
            Some("failed") => Ok(ConfirmationStatus::Failed),
            _ => Err(EngineError::RpcFatal(format!(
                "unexpected confirm result: {}",
                result
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit_code_is_transient() {
        assert!(classify_rpc_error(-32005, "limit exceeded").is_transient());
    }

    #[test]
    fn test_classify_congestion_messages_are_transient() {
        for msg in [
            "rate limit exceeded",
            "Too Many Requests",
            "network congestion, try again",
            "node busy",
        ] {
            assert!(classify_rpc_error(-32000, msg).is_transient(), "{}", msg);
        }
    }

    #[test]
    fn test_classify_fatal_errors() {
        for msg in [
            "invalid address",
            "malformed transaction",
            "insufficient funds for transfer",
        ] {
            let err = classify_rpc_error(-32602, msg);
            assert!(!err.is_transient(), "{}", msg);
            assert!(matches!(err, EngineError::RpcFatal(_)));
        }
    }

    #[test]
    fn test_parse_amount_accepts_number_and_string() {
        assert_eq!(
            JsonRpcLedgerClient::parse_amount(&json!(42u64), "balance").unwrap(),
            42
        );
        assert_eq!(
            JsonRpcLedgerClient::parse_amount(&json!("1000000000"), "balance").unwrap(),
            1_000_000_000
        );
        assert!(JsonRpcLedgerClient::parse_amount(&json!({"v": 1}), "balance").is_err());
    }

    #[test]
    fn test_map_exhausted_only_wraps_transient() {
        let wrapped =
            JsonRpcLedgerClient::map_exhausted(EngineError::RpcTransient("x".to_string()));
        assert!(matches!(wrapped, EngineError::RpcExhausted(_)));

        let fatal = JsonRpcLedgerClient::map_exhausted(EngineError::RpcFatal("y".to_string()));
        assert!(matches!(fatal, EngineError::RpcFatal(_)));
    }
}
