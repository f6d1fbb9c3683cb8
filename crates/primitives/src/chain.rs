//! Blocks and transactions as the node reports them.
//!
//! These are transient: built from RPC responses, consumed once per scan pass.

use std::fmt;

use sha2::{Digest, Sha256};
use stakeidx_consensus::Amount;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hex::{bytes_to_hex, hex_to_array32};

/// Transaction id in the node's display byte order.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Txid(pub [u8; 32]);

impl Txid {
    pub fn from_hex(value: &str) -> Option<Self> {
        hex_to_array32(value).map(Self)
    }

    pub fn to_hex(&self) -> String {
        bytes_to_hex(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Txid({})", self.to_hex())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OutPoint {
    pub txid: Txid,
    pub index: u32,
}

impl OutPoint {
    pub const KEY_LEN: usize = 36;

    pub fn new(txid: Txid, index: u32) -> Self {
        Self { txid, index }
    }

    /// Sort-preserving storage key: txid bytes then big-endian index.
    pub fn key(&self) -> [u8; Self::KEY_LEN] {
        let mut out = [0u8; Self::KEY_LEN];
        out[..32].copy_from_slice(&self.txid.0);
        out[32..].copy_from_slice(&self.index.to_be_bytes());
        out
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != Self::KEY_LEN {
            return None;
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&key[..32]);
        let mut index = [0u8; 4];
        index.copy_from_slice(&key[32..]);
        Some(Self::new(Txid(txid), u32::from_be_bytes(index)))
    }
}

impl Encodable for OutPoint {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.txid.0);
        encoder.write_u32_le(self.index);
    }
}

impl Decodable for OutPoint {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let txid = Txid(decoder.read_fixed()?);
        let index = decoder.read_u32_le()?;
        Ok(Self { txid, index })
    }
}

/// Fixed-width key for per-address indexes.
pub fn address_hash(address: &str) -> [u8; 32] {
    let digest = Sha256::digest(address.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// How the node says a block earned its place.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationType {
    Stake,
    Work,
    Unknown,
}

impl ValidationType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stake" | "minted" | "proof-of-stake" => Self::Stake,
            "work" | "mined" | "proof-of-work" => Self::Work,
            _ => Self::Unknown,
        }
    }
}

/// The output an input spends, when the node reports it inline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpentOutput {
    pub address: Option<String>,
    pub value: Amount,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TxInput {
    /// Coin generation; spends nothing.
    Generation,
    Spend {
        prevout: OutPoint,
        origin: Option<SpentOutput>,
    },
}

impl TxInput {
    pub fn is_generation(&self) -> bool {
        matches!(self, TxInput::Generation)
    }

    pub fn prevout(&self) -> Option<&OutPoint> {
        match self {
            TxInput::Generation => None,
            TxInput::Spend { prevout, .. } => Some(prevout),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOutput {
    pub index: u32,
    pub value: Amount,
    pub addresses: Vec<String>,
}

impl TxOutput {
    /// Receiving address. Multi-address outputs are attributed to the first one.
    pub fn address(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub txid: Txid,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn is_generation(&self) -> bool {
        !self.inputs.is_empty() && self.inputs.iter().all(TxInput::is_generation)
    }

    pub fn has_spend_input(&self) -> bool {
        self.inputs.iter().any(|input| !input.is_generation())
    }

    pub fn output(&self, index: u32) -> Option<&TxOutput> {
        self.outputs.iter().find(|output| output.index == index)
    }

    pub fn paid_to(&self, address: &str) -> Amount {
        self.outputs
            .iter()
            .filter(|output| output.address() == Some(address))
            .map(|output| output.value)
            .sum()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub hash: String,
    pub height: u32,
    pub time: u64,
    pub validation: ValidationType,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn is_stake_produced(&self) -> bool {
        self.validation == ValidationType::Stake
    }
}
