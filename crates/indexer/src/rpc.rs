//! Node access: the [`ChainSource`] seam and its JSON-RPC implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use base64::Engine;
use crossbeam_channel::{bounded, Receiver, Sender};
use serde_json::{json, Value};
use stakeidx_consensus::{money_range, parse_coin_amount, Amount};
use stakeidx_log::{log_debug, log_trace};
use stakeidx_primitives::{
    Block, OutPoint, SpentOutput, Transaction, TxInput, TxOutput, Txid, ValidationType,
};

use crate::error::RpcError;
use crate::metrics::{RpcMetrics, RpcMetricsSnapshot};

/// One entry of the node's live unspent set for an address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressUtxo {
    pub address: String,
    pub outpoint: OutPoint,
    pub value: Amount,
    pub height: u32,
}

/// The queries the pipeline needs from a node.
pub trait ChainSource: Send + Sync {
    fn chain_height(&self) -> Result<u32, RpcError>;
    fn block_hash(&self, height: u32) -> Result<String, RpcError>;
    /// Block with full transaction detail.
    fn block(&self, hash: &str) -> Result<Block, RpcError>;
    fn transaction(&self, txid: &Txid) -> Result<Transaction, RpcError>;
    fn address_utxos(&self, address: &str) -> Result<Vec<AddressUtxo>, RpcError>;

    fn block_at_height(&self, height: u32) -> Result<Block, RpcError> {
        let hash = self.block_hash(height)?;
        let block = self.block(&hash)?;
        if block.height != height {
            return Err(RpcError::Malformed(format!(
                "block {hash} reports height {} (asked for {height})",
                block.height
            )));
        }
        Ok(block)
    }
}

impl<T: ChainSource + ?Sized> ChainSource for Arc<T> {
    fn chain_height(&self) -> Result<u32, RpcError> {
        self.as_ref().chain_height()
    }

    fn block_hash(&self, height: u32) -> Result<String, RpcError> {
        self.as_ref().block_hash(height)
    }

    fn block(&self, hash: &str) -> Result<Block, RpcError> {
        self.as_ref().block(hash)
    }

    fn transaction(&self, txid: &Txid) -> Result<Transaction, RpcError> {
        self.as_ref().transaction(txid)
    }

    fn address_utxos(&self, address: &str) -> Result<Vec<AddressUtxo>, RpcError> {
        self.as_ref().address_utxos(address)
    }

    fn block_at_height(&self, height: u32) -> Result<Block, RpcError> {
        self.as_ref().block_at_height(height)
    }
}

#[derive(Clone, Debug)]
pub struct RpcConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
    /// Extra attempts after a transient failure.
    pub retries: u32,
    pub retry_base: Duration,
    /// Hard cap on concurrently outstanding requests.
    pub max_in_flight: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:27486".to_string(),
            user: None,
            password: None,
            timeout_secs: 30,
            retries: 3,
            retry_base: Duration::from_millis(250),
            max_in_flight: 8,
        }
    }
}

const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);
const ERROR_BODY_LIMIT: usize = 256;

/// Blocking JSON-RPC client shared by every scan worker.
pub struct RpcClient {
    config: RpcConfig,
    auth_header: Option<String>,
    next_id: AtomicU64,
    slots_tx: Sender<()>,
    slots_rx: Receiver<()>,
    metrics: RpcMetrics,
}

/// Releases an in-flight slot on drop.
struct InFlightSlot<'a> {
    slots_rx: &'a Receiver<()>,
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        let _ = self.slots_rx.try_recv();
    }
}

impl RpcClient {
    pub fn new(config: RpcConfig) -> Self {
        let auth_header = config.user.as_ref().map(|user| {
            let password = config.password.as_deref().unwrap_or("");
            let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
            format!("Basic {token}")
        });
        let (slots_tx, slots_rx) = bounded(config.max_in_flight.max(1));
        Self {
            config,
            auth_header,
            next_id: AtomicU64::new(1),
            slots_tx,
            slots_rx,
            metrics: RpcMetrics::default(),
        }
    }

    pub fn metrics(&self) -> RpcMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn acquire_slot(&self) -> Result<InFlightSlot<'_>, RpcError> {
        self.slots_tx
            .send(())
            .map_err(|_| RpcError::Transport("in-flight limiter closed".to_string()))?;
        self.metrics.observe_in_flight(self.slots_tx.len() as u64);
        Ok(InFlightSlot {
            slots_rx: &self.slots_rx,
        })
    }

    /// Sends one request, retrying transient failures with exponential backoff.
    pub fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let mut attempt = 0u32;
        loop {
            match self.call_once(method, &params) {
                Ok(result) => return Ok(result),
                Err(err) if err.is_transient() && attempt < self.config.retries => {
                    attempt += 1;
                    self.metrics.record_retry();
                    let delay = retry_delay(self.config.retry_base, attempt);
                    log_debug!(
                        "rpc {method} attempt {attempt}/{} failed: {err}; retrying in {}ms",
                        self.config.retries,
                        delay.as_millis()
                    );
                    thread::sleep(delay);
                }
                Err(err) => {
                    self.metrics.record_failure();
                    return Err(err);
                }
            }
        }
    }

    fn call_once(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string();
        log_trace!("rpc -> {method} id={id} {params}");

        let _slot = self.acquire_slot()?;
        let started = Instant::now();
        let mut request = minreq::post(self.config.url.as_str())
            .with_header("Content-Type", "application/json")
            .with_timeout(self.config.timeout_secs.max(1))
            .with_body(body);
        if let Some(auth) = &self.auth_header {
            request = request.with_header("Authorization", auth.as_str());
        }
        let response = request
            .send()
            .map_err(|err| RpcError::Transport(err.to_string()))?;
        self.metrics.record_request(started.elapsed());

        let status = response.status_code;
        if status == 401 || status == 403 {
            return Err(RpcError::Unauthorized(status));
        }
        let text = response
            .as_str()
            .map_err(|err| RpcError::Malformed(err.to_string()))?;
        log_trace!("rpc <- {method} id={id} status={status} bytes={}", text.len());
        parse_envelope(status, text)
    }
}

pub(crate) fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(MAX_RETRY_DELAY)
}

/// Splits a reply into result or error. Nodes send application errors with
/// HTTP 500 and a JSON body, so the body wins over the status.
pub(crate) fn parse_envelope(status: i32, body: &str) -> Result<Value, RpcError> {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(err) => {
            if !(200..300).contains(&status) {
                return Err(RpcError::Http {
                    status,
                    body: body.chars().take(ERROR_BODY_LIMIT).collect(),
                });
            }
            return Err(RpcError::Malformed(err.to_string()));
        }
    };
    if let Some(error) = value.get("error").filter(|error| !error.is_null()) {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(RpcError::Node { code, message });
    }
    if !(200..300).contains(&status) {
        return Err(RpcError::Http {
            status,
            body: body.chars().take(ERROR_BODY_LIMIT).collect(),
        });
    }
    value
        .get("result")
        .cloned()
        .ok_or_else(|| RpcError::Malformed("response has no result".to_string()))
}

impl ChainSource for RpcClient {
    fn chain_height(&self) -> Result<u32, RpcError> {
        let value = self.call("getblockcount", json!([]))?;
        value
            .as_u64()
            .and_then(|height| u32::try_from(height).ok())
            .ok_or_else(|| RpcError::Malformed("getblockcount is not a height".to_string()))
    }

    fn block_hash(&self, height: u32) -> Result<String, RpcError> {
        let value = self.call("getblockhash", json!([height]))?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::Malformed("getblockhash is not a string".to_string()))
    }

    fn block(&self, hash: &str) -> Result<Block, RpcError> {
        let value = self.call("getblock", json!([hash, 2]))?;
        parse_block(&value)
    }

    fn transaction(&self, txid: &Txid) -> Result<Transaction, RpcError> {
        let value = self.call("getrawtransaction", json!([txid.to_hex(), 1]))?;
        parse_transaction(&value)
    }

    fn address_utxos(&self, address: &str) -> Result<Vec<AddressUtxo>, RpcError> {
        let value = self.call("getaddressutxos", json!([{ "addresses": [address] }]))?;
        parse_address_utxos(&value)
    }
}

fn malformed(what: &str) -> RpcError {
    RpcError::Malformed(format!("missing or invalid {what}"))
}

fn field_str<'a>(value: &'a Value, key: &str) -> Result<&'a str, RpcError> {
    value.get(key).and_then(Value::as_str).ok_or_else(|| malformed(key))
}

fn field_u32(value: &Value, key: &str) -> Result<u32, RpcError> {
    value
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| malformed(key))
}

fn field_txid(value: &Value, key: &str) -> Result<Txid, RpcError> {
    Txid::from_hex(field_str(value, key)?).ok_or_else(|| malformed(key))
}

/// Prefers the integer minor-unit field; falls back to the decimal coin field.
fn amount_field(value: &Value, sat_key: &str, coin_key: &str) -> Result<Option<Amount>, RpcError> {
    let amount = if let Some(sat) = value.get(sat_key).filter(|v| !v.is_null()) {
        sat.as_i64().ok_or_else(|| malformed(sat_key))?
    } else if let Some(coin) = value.get(coin_key).filter(|v| !v.is_null()) {
        let raw = match coin {
            Value::Number(number) => number.to_string(),
            Value::String(text) => text.clone(),
            _ => return Err(malformed(coin_key)),
        };
        parse_coin_amount(&raw).ok_or_else(|| malformed(coin_key))?
    } else {
        return Ok(None);
    };
    if !money_range(amount) {
        return Err(RpcError::Malformed(format!("amount {amount} out of range")));
    }
    Ok(Some(amount))
}

fn output_addresses(output: &Value) -> Vec<String> {
    let script = output.get("scriptPubKey").unwrap_or(&Value::Null);
    if let Some(list) = script.get("addresses").and_then(Value::as_array) {
        return list
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }
    script
        .get("address")
        .and_then(Value::as_str)
        .map(|address| vec![address.to_string()])
        .unwrap_or_default()
}

fn parse_input(input: &Value) -> Result<TxInput, RpcError> {
    if input.get("coinbase").is_some() {
        return Ok(TxInput::Generation);
    }
    let prevout = OutPoint::new(field_txid(input, "txid")?, field_u32(input, "vout")?);
    let address = input
        .get("address")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            input
                .get("addresses")
                .and_then(Value::as_array)
                .and_then(|list| list.first())
                .and_then(Value::as_str)
                .map(str::to_string)
        });
    let origin = amount_field(input, "valueSat", "value")?.map(|value| SpentOutput { address, value });
    Ok(TxInput::Spend { prevout, origin })
}

fn parse_output(output: &Value) -> Result<TxOutput, RpcError> {
    Ok(TxOutput {
        index: field_u32(output, "n")?,
        value: amount_field(output, "valueSat", "value")?.ok_or_else(|| malformed("value"))?,
        addresses: output_addresses(output),
    })
}

pub(crate) fn parse_transaction(value: &Value) -> Result<Transaction, RpcError> {
    let txid = field_txid(value, "txid")?;
    let inputs = value
        .get("vin")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("vin"))?
        .iter()
        .map(parse_input)
        .collect::<Result<Vec<_>, _>>()?;
    let outputs = value
        .get("vout")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("vout"))?
        .iter()
        .map(parse_output)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Transaction {
        txid,
        inputs,
        outputs,
    })
}

fn parse_validation(value: &Value) -> ValidationType {
    for key in ["validationtype", "blocktype"] {
        if let Some(raw) = value.get(key).and_then(Value::as_str) {
            return ValidationType::parse(raw);
        }
    }
    match value.get("flags").and_then(Value::as_str) {
        Some(flags) if flags.contains("proof-of-stake") => ValidationType::Stake,
        Some(flags) if flags.contains("proof-of-work") => ValidationType::Work,
        _ => ValidationType::Unknown,
    }
}

pub(crate) fn parse_block(value: &Value) -> Result<Block, RpcError> {
    let transactions = value
        .get("tx")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("tx"))?
        .iter()
        .map(|tx| {
            if tx.is_string() {
                Err(RpcError::Malformed(
                    "block has txids only; expected verbosity 2".to_string(),
                ))
            } else {
                parse_transaction(tx)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Block {
        hash: field_str(value, "hash")?.to_string(),
        height: field_u32(value, "height")?,
        time: value
            .get("time")
            .and_then(Value::as_u64)
            .ok_or_else(|| malformed("time"))?,
        validation: parse_validation(value),
        transactions,
    })
}

pub(crate) fn parse_address_utxos(value: &Value) -> Result<Vec<AddressUtxo>, RpcError> {
    value
        .as_array()
        .ok_or_else(|| malformed("utxo list"))?
        .iter()
        .map(|entry| {
            Ok(AddressUtxo {
                address: field_str(entry, "address")?.to_string(),
                outpoint: OutPoint::new(
                    field_txid(entry, "txid")?,
                    field_u32(entry, "outputIndex")?,
                ),
                value: amount_field(entry, "satoshis", "value")?
                    .ok_or_else(|| malformed("satoshis"))?,
                height: field_u32(entry, "height")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TXID_A: &str = "aa00000000000000000000000000000000000000000000000000000000000001";
    const TXID_P: &str = "bb00000000000000000000000000000000000000000000000000000000000002";

    #[test]
    fn envelope_prefers_node_error_over_status() {
        let body = r#"{"result":null,"error":{"code":-5,"message":"No such transaction"},"id":1}"#;
        assert_eq!(
            parse_envelope(500, body),
            Err(RpcError::Node {
                code: -5,
                message: "No such transaction".to_string()
            })
        );
        assert_eq!(
            parse_envelope(200, r#"{"result":42,"error":null,"id":1}"#),
            Ok(json!(42))
        );
    }

    #[test]
    fn envelope_classifies_non_json() {
        assert!(matches!(
            parse_envelope(503, "Service Unavailable"),
            Err(RpcError::Http { status: 503, .. })
        ));
        assert!(matches!(
            parse_envelope(200, "<html>"),
            Err(RpcError::Malformed(_))
        ));
        assert!(matches!(
            parse_envelope(200, r#"{"id":1}"#),
            Err(RpcError::Malformed(_))
        ));
    }

    #[test]
    fn parses_verbose_stake_block() {
        let raw = json!({
            "hash": "00ff",
            "height": 1000,
            "time": 1700000000u64,
            "validationtype": "stake",
            "tx": [
                {
                    "txid": TXID_A,
                    "vin": [{
                        "txid": TXID_P, "vout": 1,
                        "address": "RX", "value": 100.0, "valueSat": 10000000000i64
                    }],
                    "vout": [{
                        "n": 0, "value": 103.0,
                        "scriptPubKey": { "addresses": ["RX"] }
                    }]
                },
                {
                    "txid": TXID_P,
                    "vin": [{ "coinbase": "03e80300" }],
                    "vout": [{ "n": 0, "valueSat": 300000000i64, "scriptPubKey": { "address": "RX" } }]
                }
            ]
        });
        let block = parse_block(&raw).expect("block");
        assert!(block.is_stake_produced());
        assert_eq!(block.height, 1000);
        let reward = &block.transactions[0];
        assert_eq!(reward.outputs[0].value, 103 * stakeidx_consensus::COIN);
        assert_eq!(reward.outputs[0].address(), Some("RX"));
        match &reward.inputs[0] {
            TxInput::Spend { prevout, origin } => {
                assert_eq!(prevout.index, 1);
                let origin = origin.as_ref().expect("origin");
                assert_eq!(origin.address.as_deref(), Some("RX"));
                assert_eq!(origin.value, 100 * stakeidx_consensus::COIN);
            }
            TxInput::Generation => panic!("expected spend"),
        }
        assert!(block.transactions[1].is_generation());
        assert_eq!(block.transactions[1].outputs[0].value, 300_000_000);
    }

    #[test]
    fn txid_only_blocks_are_rejected() {
        let raw = json!({ "hash": "00", "height": 1, "time": 1, "tx": [TXID_A] });
        assert!(matches!(parse_block(&raw), Err(RpcError::Malformed(_))));
    }

    #[test]
    fn flags_field_marks_stake() {
        let raw = json!({ "hash": "00", "height": 1, "time": 1, "flags": "proof-of-stake stake-modifier", "tx": [] });
        assert_eq!(parse_block(&raw).expect("block").validation, ValidationType::Stake);
    }

    #[test]
    fn decimal_amounts_convert_exactly() {
        let output = json!({ "n": 2, "value": 0.00000003, "scriptPubKey": {} });
        let parsed = parse_output(&output).expect("output");
        assert_eq!(parsed.value, 3);
        assert!(parsed.addresses.is_empty());

        let negative = json!({ "n": 0, "valueSat": -1 });
        assert!(matches!(parse_output(&negative), Err(RpcError::Malformed(_))));
    }

    #[test]
    fn parses_address_utxos() {
        let raw = json!([{
            "address": "RX", "txid": TXID_A, "outputIndex": 3,
            "script": "76a9", "satoshis": 5000, "height": 990
        }]);
        let utxos = parse_address_utxos(&raw).expect("utxos");
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].outpoint.index, 3);
        assert_eq!(utxos[0].value, 5000);
        assert_eq!(utxos[0].height, 990);
    }

    #[test]
    fn basic_auth_header_is_encoded() {
        let client = RpcClient::new(RpcConfig {
            user: Some("user".to_string()),
            password: Some("pass".to_string()),
            ..RpcConfig::default()
        });
        assert_eq!(client.auth_header.as_deref(), Some("Basic dXNlcjpwYXNz"));
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(retry_delay(base, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(base, 3), Duration::from_millis(400));
        assert_eq!(retry_delay(base, 30), MAX_RETRY_DELAY);
    }
}
