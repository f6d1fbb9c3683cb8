//! Chain-facing value types, persisted records and their binary encoding.

pub mod chain;
pub mod encoding;
pub mod hex;
pub mod range;
pub mod records;

pub use chain::{address_hash, Block, OutPoint, SpentOutput, Transaction, TxInput, TxOutput, Txid, ValidationType};
pub use encoding::{decode, encode, Decodable, DecodeError, Decoder, Encodable, Encoder};
pub use range::{HeightRange, RangeSet};
pub use records::{
    Confidence, ScanCheckpoint, ScanState, ScanTarget, StakeBlockSummary, StakeEvent,
    UnspentOutput,
};
