//! Funding-address resolution and reward refinement.

use std::collections::HashMap;

use stakeidx_consensus::Amount;
use stakeidx_log::{log_debug, log_warn};
use stakeidx_primitives::{Confidence, OutPoint, Transaction, TxInput, TxOutput, Txid};

use crate::classify::SpentOrigins;
use crate::error::{IndexError, RpcError};
use crate::rpc::ChainSource;

#[derive(Clone, Debug)]
pub struct AttributionConfig {
    /// Shared delegation address; never preferred as the funder.
    pub pool_address: Option<String>,
    /// Inputs beyond this many are not traced and the trace is incomplete.
    pub max_traced_inputs: usize,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            pool_address: None,
            max_traced_inputs: 64,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TracedInput {
    pub address: Option<String>,
    pub value: Amount,
}

/// Originating outputs of a reward transaction's inputs, in input order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TraceResult {
    pub inputs: Vec<TracedInput>,
    /// False when any input could not be resolved.
    pub complete: bool,
}

/// Originating transactions fetched while processing one block. Each txid is
/// requested at most once, whether the lookup succeeds or not.
pub struct PrevOutputs<'c, C: ChainSource + ?Sized> {
    chain: &'c C,
    fetched: HashMap<Txid, Option<Transaction>>,
}

impl<'c, C: ChainSource + ?Sized> PrevOutputs<'c, C> {
    pub fn new(chain: &'c C) -> Self {
        Self {
            chain,
            fetched: HashMap::new(),
        }
    }

    /// Lookup failures resolve to `None`; only credential failures escape.
    fn lookup(&mut self, prevout: &OutPoint) -> Result<Option<&TxOutput>, IndexError> {
        if !self.fetched.contains_key(&prevout.txid) {
            let fetched = match self.chain.transaction(&prevout.txid) {
                Ok(prev_tx) => Some(prev_tx),
                Err(err @ RpcError::Unauthorized(_)) => return Err(err.into()),
                Err(err) => {
                    log_debug!("cannot resolve {}:{}: {err}", prevout.txid, prevout.index);
                    None
                }
            };
            self.fetched.insert(prevout.txid, fetched);
        }
        Ok(self
            .fetched
            .get(&prevout.txid)
            .and_then(Option::as_ref)
            .and_then(|prev_tx| prev_tx.output(prevout.index)))
    }

    /// Resolves every input to the output it spends, preferring inline data.
    pub fn trace(
        &mut self,
        tx: &Transaction,
        config: &AttributionConfig,
    ) -> Result<TraceResult, IndexError> {
        let mut result = TraceResult {
            inputs: Vec::new(),
            complete: true,
        };
        for (position, input) in tx.inputs.iter().enumerate() {
            let TxInput::Spend { prevout, origin } = input else {
                continue;
            };
            if position >= config.max_traced_inputs {
                result.complete = false;
                break;
            }
            if let Some(origin) = origin {
                result.inputs.push(TracedInput {
                    address: origin.address.clone(),
                    value: origin.value,
                });
                continue;
            }
            match self.lookup(prevout)? {
                Some(output) => result.inputs.push(TracedInput {
                    address: output.address().map(str::to_string),
                    value: output.value,
                }),
                None => result.complete = false,
            }
        }
        Ok(result)
    }
}

impl<C: ChainSource + ?Sized> SpentOrigins for PrevOutputs<'_, C> {
    fn spent_address(&mut self, input: &TxInput) -> Result<Option<String>, IndexError> {
        match input {
            TxInput::Generation => Ok(None),
            TxInput::Spend {
                origin: Some(origin),
                ..
            } => Ok(origin.address.clone()),
            TxInput::Spend {
                prevout,
                origin: None,
            } => Ok(self
                .lookup(prevout)?
                .and_then(|output| output.address().map(str::to_string))),
        }
    }
}

/// Traces `tx` with a fresh lookup cache.
pub fn trace_inputs<C: ChainSource + ?Sized>(
    chain: &C,
    tx: &Transaction,
    config: &AttributionConfig,
) -> Result<TraceResult, IndexError> {
    PrevOutputs::new(chain).trace(tx, config)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attribution {
    pub funding_address: String,
    pub reward_amount: Amount,
    pub funding_stake_amount: Option<Amount>,
    pub confidence: Confidence,
}

/// Picks the funder among traced input addresses: the beneficiary itself,
/// then any non-pool address, then the first one seen.
pub fn choose_funding_address<'a>(
    beneficiary: &'a str,
    trace: &'a TraceResult,
    pool_address: Option<&str>,
) -> Option<&'a str> {
    let addresses: Vec<&str> = trace
        .inputs
        .iter()
        .filter_map(|input| input.address.as_deref())
        .collect();
    if addresses.contains(&beneficiary) {
        return Some(beneficiary);
    }
    addresses
        .iter()
        .copied()
        .find(|address| Some(*address) != pool_address)
        .or_else(|| addresses.first().copied())
}

/// Attributes one beneficiary's receipt from the reward transaction.
///
/// The reward is what the beneficiary received minus what it put in. A
/// non-positive result is a data anomaly and no event is produced.
pub fn resolve(
    beneficiary: &str,
    gross_value: Amount,
    trace: &TraceResult,
    config: &AttributionConfig,
) -> Result<Attribution, IndexError> {
    let returned: Amount = trace
        .inputs
        .iter()
        .filter(|input| input.address.as_deref() == Some(beneficiary))
        .map(|input| input.value)
        .sum();
    let reward_amount = gross_value - returned;
    if reward_amount <= 0 {
        return Err(IndexError::DataAnomaly(format!(
            "non-positive reward for {beneficiary}: received {gross_value}, staked {returned}"
        )));
    }

    let funder = if trace.complete {
        choose_funding_address(beneficiary, trace, config.pool_address.as_deref())
    } else {
        None
    };
    let Some(funder) = funder else {
        if returned == 0 {
            log_warn!(
                "untraced stake for {beneficiary}: reward {reward_amount} is the gross receipt and likely includes returned capital"
            );
        }
        return Ok(Attribution {
            funding_address: beneficiary.to_string(),
            reward_amount,
            funding_stake_amount: None,
            confidence: Confidence::Unknown,
        });
    };
    let staked: Amount = trace
        .inputs
        .iter()
        .filter(|input| input.address.as_deref() == Some(funder))
        .map(|input| input.value)
        .sum();
    Ok(Attribution {
        funding_address: funder.to_string(),
        reward_amount,
        funding_stake_amount: Some(staked),
        confidence: Confidence::Direct,
    })
}
