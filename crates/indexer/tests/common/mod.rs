#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use stakeidx_consensus::Amount;
use stakeidx_indexer::{AddressUtxo, ChainSource, RpcError};
use stakeidx_primitives::{
    Block, OutPoint, Transaction, TxInput, TxOutput, Txid, ValidationType,
};

pub fn txid(tag: u32) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[..4].copy_from_slice(&tag.to_be_bytes());
    Txid(bytes)
}

pub fn output(index: u32, value: Amount, address: &str) -> TxOutput {
    TxOutput {
        index,
        value,
        addresses: vec![address.to_string()],
    }
}

pub fn generation(tag: u32, outputs: Vec<TxOutput>) -> Transaction {
    Transaction {
        txid: txid(tag),
        inputs: vec![TxInput::Generation],
        outputs,
    }
}

pub fn spending(tag: u32, prevouts: &[OutPoint], outputs: Vec<TxOutput>) -> Transaction {
    Transaction {
        txid: txid(tag),
        inputs: prevouts
            .iter()
            .map(|prevout| TxInput::Spend {
                prevout: *prevout,
                origin: None,
            })
            .collect(),
        outputs,
    }
}

pub fn block_hash(height: u32) -> String {
    format!("{height:064x}")
}

/// In-process chain: every height up to `tip` exists; heights without an
/// explicit block are empty work blocks.
pub struct FixtureChain {
    tip: AtomicU32,
    blocks: BTreeMap<u32, Block>,
    txs: HashMap<Txid, Transaction>,
    utxos: HashMap<String, Vec<AddressUtxo>>,
    /// Height -> remaining transient failures before it succeeds.
    flaky: Mutex<HashMap<u32, u32>>,
    broken: HashSet<u32>,
    pub block_fetches: AtomicUsize,
}

impl FixtureChain {
    pub fn new(tip: u32) -> Self {
        Self {
            tip: AtomicU32::new(tip),
            blocks: BTreeMap::new(),
            txs: HashMap::new(),
            utxos: HashMap::new(),
            flaky: Mutex::new(HashMap::new()),
            broken: HashSet::new(),
            block_fetches: AtomicUsize::new(0),
        }
    }

    pub fn set_tip(&self, tip: u32) {
        self.tip.store(tip, Ordering::Relaxed);
    }

    /// Registers a transaction that only exists as a spend origin.
    pub fn add_tx(&mut self, tx: Transaction) {
        self.txs.insert(tx.txid, tx);
    }

    pub fn add_block(&mut self, height: u32, validation: ValidationType, txs: Vec<Transaction>) {
        for tx in &txs {
            self.txs.insert(tx.txid, tx.clone());
        }
        self.blocks.insert(
            height,
            Block {
                hash: block_hash(height),
                height,
                time: 1_600_000_000 + u64::from(height) * 120,
                validation,
                transactions: txs,
            },
        );
    }

    /// Adds a stake block at `height` where `address` re-stakes `stake` and
    /// earns `reward`. Returns the reward txid.
    pub fn add_stake(&mut self, height: u32, address: &str, stake: Amount, reward: Amount) -> Txid {
        let funding = generation(height * 10 + 1, vec![output(0, stake, address)]);
        let prevout = OutPoint::new(funding.txid, 0);
        self.add_tx(funding);
        let coinstake = spending(
            height * 10 + 2,
            &[prevout],
            vec![output(0, stake + reward, address)],
        );
        let reward_txid = coinstake.txid;
        let coinbase = generation(height * 10 + 3, vec![output(0, 0, "MINER")]);
        self.add_block(height, ValidationType::Stake, vec![coinbase, coinstake]);
        reward_txid
    }

    pub fn set_utxos(&mut self, address: &str, utxos: Vec<AddressUtxo>) {
        self.utxos.insert(address.to_string(), utxos);
    }

    pub fn fail_times(&self, height: u32, times: u32) {
        if let Ok(mut flaky) = self.flaky.lock() {
            flaky.insert(height, times);
        }
    }

    /// Height that never answers.
    pub fn break_height(&mut self, height: u32) {
        self.broken.insert(height);
    }

    pub fn heal_height(&mut self, height: u32) {
        self.broken.remove(&height);
    }

    pub fn stake_heights(&self) -> Vec<u32> {
        self.blocks
            .values()
            .filter(|block| block.validation == ValidationType::Stake)
            .map(|block| block.height)
            .collect()
    }

    fn empty_block(height: u32) -> Block {
        Block {
            hash: block_hash(height),
            height,
            time: 1_600_000_000 + u64::from(height) * 120,
            validation: ValidationType::Work,
            transactions: vec![generation(u32::MAX - height, vec![output(0, 5, "MINER")])],
        }
    }
}

impl ChainSource for FixtureChain {
    fn chain_height(&self) -> Result<u32, RpcError> {
        Ok(self.tip.load(Ordering::Relaxed))
    }

    fn block_hash(&self, height: u32) -> Result<String, RpcError> {
        if height > self.tip.load(Ordering::Relaxed) {
            return Err(RpcError::Node {
                code: -8,
                message: "Block height out of range".to_string(),
            });
        }
        if self.broken.contains(&height) {
            return Err(RpcError::Transport("connection reset".to_string()));
        }
        if let Ok(mut flaky) = self.flaky.lock() {
            if let Some(remaining) = flaky.get_mut(&height) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(RpcError::Transport("timed out".to_string()));
                }
            }
        }
        Ok(block_hash(height))
    }

    fn block(&self, hash: &str) -> Result<Block, RpcError> {
        self.block_fetches.fetch_add(1, Ordering::Relaxed);
        let height = u32::from_str_radix(hash, 16)
            .map_err(|_| RpcError::Node {
                code: -5,
                message: "Block not found".to_string(),
            })?;
        Ok(self
            .blocks
            .get(&height)
            .cloned()
            .unwrap_or_else(|| Self::empty_block(height)))
    }

    fn transaction(&self, txid: &Txid) -> Result<Transaction, RpcError> {
        self.txs.get(txid).cloned().ok_or(RpcError::Node {
            code: -5,
            message: "No such mempool or blockchain transaction".to_string(),
        })
    }

    fn address_utxos(&self, address: &str) -> Result<Vec<AddressUtxo>, RpcError> {
        Ok(self.utxos.get(address).cloned().unwrap_or_default())
    }
}
