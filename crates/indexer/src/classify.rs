//! Stake-block detection and reward extraction.
//!
//! Chains disagree on where the coinstake sits in a block, so selection is a
//! fixed-order list of independent strategies. The first one that yields a
//! transaction paying at least one address wins.

use std::collections::HashSet;

use stakeidx_consensus::Amount;
use stakeidx_primitives::{Block, Transaction, TxInput};

use crate::error::IndexError;

/// Which beneficiary addresses a scan records.
#[derive(Clone, Debug, Default)]
pub enum AddressFilter {
    #[default]
    All,
    Tracked(HashSet<String>),
}

impl AddressFilter {
    pub fn tracked<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: HashSet<String> = addresses.into_iter().map(Into::into).collect();
        if set.is_empty() {
            AddressFilter::All
        } else {
            AddressFilter::Tracked(set)
        }
    }

    pub fn matches(&self, address: &str) -> bool {
        match self {
            AddressFilter::All => true,
            AddressFilter::Tracked(set) => set.contains(address),
        }
    }
}

/// Resolves the address an input's spent output paid.
pub trait SpentOrigins {
    /// `Ok(None)` when the output cannot be resolved or carries no address.
    fn spent_address(&mut self, input: &TxInput) -> Result<Option<String>, IndexError>;
}

/// Reads only the prevout data the node sent inline with the block.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineOrigins;

impl SpentOrigins for InlineOrigins {
    fn spent_address(&mut self, input: &TxInput) -> Result<Option<String>, IndexError> {
        Ok(match input {
            TxInput::Spend {
                origin: Some(origin),
                ..
            } => origin.address.clone(),
            _ => None,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Strategy {
    /// Spending transaction whose first output is an empty marker.
    EmptyMarker,
    /// A transaction that pays back the address its first input came from.
    SelfSpend,
    /// Last transaction spending prior outputs.
    Trailing,
    /// First transaction spending prior outputs.
    Leading,
}

impl Strategy {
    pub const ORDER: [Strategy; 4] = [
        Strategy::EmptyMarker,
        Strategy::SelfSpend,
        Strategy::Trailing,
        Strategy::Leading,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::EmptyMarker => "empty-marker",
            Strategy::SelfSpend => "self-spend",
            Strategy::Trailing => "trailing",
            Strategy::Leading => "leading",
        }
    }

    fn select<'b>(
        self,
        block: &'b Block,
        origins: &mut dyn SpentOrigins,
    ) -> Result<Option<&'b Transaction>, IndexError> {
        let mut spending = block.transactions.iter().filter(|tx| tx.has_spend_input());
        Ok(match self {
            Strategy::EmptyMarker => spending.find(|tx| has_empty_marker(tx)),
            Strategy::SelfSpend => self_spend(block, origins)?,
            Strategy::Trailing => spending.next_back(),
            Strategy::Leading => spending.next(),
        })
    }
}

fn has_empty_marker(tx: &Transaction) -> bool {
    tx.outputs.len() > 1
        && tx
            .outputs
            .first()
            .is_some_and(|out| out.value == 0 && out.addresses.is_empty())
}

/// Checks the coinstake positions (first and last spending transaction) before
/// the rest, so a payment returning change cannot outrank the reward.
fn self_spend<'b>(
    block: &'b Block,
    origins: &mut dyn SpentOrigins,
) -> Result<Option<&'b Transaction>, IndexError> {
    let spending: Vec<&Transaction> = block
        .transactions
        .iter()
        .filter(|tx| tx.has_spend_input())
        .collect();
    let mut order: Vec<usize> = (0..spending.len()).collect();
    if let Some(last) = order.pop() {
        order.insert(1.min(order.len()), last);
    }
    for position in order {
        let tx = spending[position];
        let Some(input) = tx.inputs.iter().find(|input| !input.is_generation()) else {
            continue;
        };
        if let Some(address) = origins.spent_address(input)? {
            if tx.outputs.iter().any(|out| out.address() == Some(address.as_str())) {
                return Ok(Some(tx));
            }
        }
    }
    Ok(None)
}

/// Everything one address received from the reward transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RewardOutput {
    pub address: String,
    /// First output paying this address; the event's key.
    pub output_index: u32,
    /// Sum over every output paying this address.
    pub gross_value: Amount,
}

#[derive(Clone, Debug)]
pub struct Extraction<'a> {
    pub strategy: Strategy,
    pub reward_tx: &'a Transaction,
    pub outputs: Vec<RewardOutput>,
}

pub fn is_stake_block(block: &Block) -> bool {
    block.is_stake_produced()
}

/// Picks the reward transaction. Candidates without any addressed output are
/// passed over so a later strategy can try.
pub fn select_reward_tx<'b>(
    block: &'b Block,
    origins: &mut dyn SpentOrigins,
) -> Result<Option<(Strategy, &'b Transaction)>, IndexError> {
    if !is_stake_block(block) || block.transactions.len() < 2 {
        return Ok(None);
    }
    for strategy in Strategy::ORDER {
        if let Some(tx) = strategy.select(block, origins)? {
            if tx.outputs.iter().any(|out| out.address().is_some()) {
                return Ok(Some((strategy, tx)));
            }
        }
    }
    Ok(None)
}

/// Groups the reward transaction's outputs per beneficiary, in output order.
pub fn extract<'a>(
    block: &'a Block,
    filter: &AddressFilter,
    origins: &mut dyn SpentOrigins,
) -> Result<Option<Extraction<'a>>, IndexError> {
    let Some((strategy, reward_tx)) = select_reward_tx(block, origins)? else {
        return Ok(None);
    };
    let mut outputs: Vec<RewardOutput> = Vec::new();
    for output in &reward_tx.outputs {
        let Some(address) = output.address() else {
            continue;
        };
        if !filter.matches(address) {
            continue;
        }
        match outputs.iter_mut().find(|entry| entry.address == address) {
            Some(entry) => entry.gross_value += output.value,
            None => outputs.push(RewardOutput {
                address: address.to_string(),
                output_index: output.index,
                gross_value: output.value,
            }),
        }
    }
    Ok(Some(Extraction {
        strategy,
        reward_tx,
        outputs,
    }))
}
