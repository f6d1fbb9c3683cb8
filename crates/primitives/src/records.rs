//! Persisted records.

use stakeidx_consensus::Amount;

use crate::chain::{OutPoint, Txid};
use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::range::HeightRange;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Confidence {
    /// Derived from the coinstake's own inputs.
    Direct,
    /// Approximated later from the funder's mature holdings.
    Estimated,
    Unknown,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::Direct => "direct",
            Confidence::Estimated => "estimated",
            Confidence::Unknown => "unknown",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Confidence::Direct => 0,
            Confidence::Estimated => 1,
            Confidence::Unknown => 2,
        }
    }

    fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Confidence::Direct),
            1 => Ok(Confidence::Estimated),
            2 => Ok(Confidence::Unknown),
            _ => Err(DecodeError::InvalidData("invalid confidence tag")),
        }
    }

    /// The only transition allowed after creation is unknown to estimated.
    pub fn may_become(self, next: Confidence) -> bool {
        self == next || (self == Confidence::Unknown && next == Confidence::Estimated)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StakeEvent {
    pub beneficiary_address: String,
    pub funding_address: String,
    pub block_height: u32,
    pub block_hash: String,
    pub block_time: u64,
    pub reward_txid: Txid,
    pub output_index: u32,
    pub reward_amount: Amount,
    pub funding_stake_amount: Option<Amount>,
    pub confidence: Confidence,
}

impl StakeEvent {
    /// Idempotency key.
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.reward_txid, self.output_index)
    }

    pub fn is_direct_stake(&self) -> bool {
        self.beneficiary_address == self.funding_address
    }
}

impl Encodable for StakeEvent {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_var_str(&self.beneficiary_address);
        encoder.write_var_str(&self.funding_address);
        encoder.write_u32_le(self.block_height);
        encoder.write_var_str(&self.block_hash);
        encoder.write_u64_le(self.block_time);
        encoder.write_bytes(self.reward_txid.as_bytes());
        encoder.write_u32_le(self.output_index);
        encoder.write_i64_le(self.reward_amount);
        encoder.write_opt_i64(self.funding_stake_amount);
        encoder.write_u8(self.confidence.to_u8());
    }
}

impl Decodable for StakeEvent {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            beneficiary_address: decoder.read_var_str()?,
            funding_address: decoder.read_var_str()?,
            block_height: decoder.read_u32_le()?,
            block_hash: decoder.read_var_str()?,
            block_time: decoder.read_u64_le()?,
            reward_txid: Txid(decoder.read_fixed()?),
            output_index: decoder.read_u32_le()?,
            reward_amount: decoder.read_i64_le()?,
            funding_stake_amount: decoder.read_opt_i64()?,
            confidence: Confidence::from_u8(decoder.read_u8()?)?,
        })
    }
}

/// Cached view of one output of the live unspent set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnspentOutput {
    pub address: String,
    pub outpoint: OutPoint,
    pub value: Amount,
    pub creation_height: u32,
    pub spent: bool,
    pub maturity_eligible: bool,
}

impl Encodable for UnspentOutput {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_var_str(&self.address);
        self.outpoint.encode_into(encoder);
        encoder.write_i64_le(self.value);
        encoder.write_u32_le(self.creation_height);
        encoder.write_bool(self.spent);
        encoder.write_bool(self.maturity_eligible);
    }
}

impl Decodable for UnspentOutput {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            address: decoder.read_var_str()?,
            outpoint: OutPoint::decode_from(decoder)?,
            value: decoder.read_i64_le()?,
            creation_height: decoder.read_u32_le()?,
            spent: decoder.read_bool()?,
            maturity_eligible: decoder.read_bool()?,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanState {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanState::Idle => "idle",
            ScanState::Running => "running",
            ScanState::Completed => "completed",
            ScanState::Failed => "failed",
            ScanState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanState::Completed | ScanState::Failed | ScanState::Cancelled
        )
    }

    fn to_u8(self) -> u8 {
        match self {
            ScanState::Idle => 0,
            ScanState::Running => 1,
            ScanState::Completed => 2,
            ScanState::Failed => 3,
            ScanState::Cancelled => 4,
        }
    }

    fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(ScanState::Idle),
            1 => Ok(ScanState::Running),
            2 => Ok(ScanState::Completed),
            3 => Ok(ScanState::Failed),
            4 => Ok(ScanState::Cancelled),
            _ => Err(DecodeError::InvalidData("invalid scan state")),
        }
    }
}

/// Upper bound of a scan: a fixed height or the tip sampled at each batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanTarget {
    Height(u32),
    Tip,
}

impl ScanTarget {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("tip") {
            return Some(ScanTarget::Tip);
        }
        raw.parse().ok().map(ScanTarget::Height)
    }
}

impl std::fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanTarget::Height(height) => write!(f, "{height}"),
            ScanTarget::Tip => f.write_str("tip"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScanCheckpoint {
    pub scan_key: String,
    pub start_height: u32,
    /// `None` until the first batch commits.
    pub last_completed_height: Option<u32>,
    pub target: ScanTarget,
    pub state: ScanState,
    pub updated_at: u64,
}

impl ScanCheckpoint {
    pub fn new(scan_key: &str, start_height: u32, target: ScanTarget, now: u64) -> Self {
        Self {
            scan_key: scan_key.to_string(),
            start_height,
            last_completed_height: None,
            target,
            state: ScanState::Idle,
            updated_at: now,
        }
    }

    pub fn resume_height(&self) -> u32 {
        match self.last_completed_height {
            Some(height) => height.saturating_add(1),
            None => self.start_height,
        }
    }

    /// Heights this checkpoint vouches for.
    pub fn completed_range(&self) -> Option<HeightRange> {
        self.last_completed_height
            .and_then(|last| HeightRange::new(self.start_height, last))
    }
}

impl Encodable for ScanCheckpoint {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_var_str(&self.scan_key);
        encoder.write_u32_le(self.start_height);
        encoder.write_opt_u32(self.last_completed_height);
        match self.target {
            ScanTarget::Height(height) => encoder.write_opt_u32(Some(height)),
            ScanTarget::Tip => encoder.write_opt_u32(None),
        }
        encoder.write_u8(self.state.to_u8());
        encoder.write_u64_le(self.updated_at);
    }
}

impl Decodable for ScanCheckpoint {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let scan_key = decoder.read_var_str()?;
        let start_height = decoder.read_u32_le()?;
        let last_completed_height = decoder.read_opt_u32()?;
        let target = match decoder.read_opt_u32()? {
            Some(height) => ScanTarget::Height(height),
            None => ScanTarget::Tip,
        };
        let state = ScanState::from_u8(decoder.read_u8()?)?;
        let updated_at = decoder.read_u64_le()?;
        Ok(Self {
            scan_key,
            start_height,
            last_completed_height,
            target,
            state,
            updated_at,
        })
    }
}

/// One row per stake-produced block a scan has processed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StakeBlockSummary {
    pub height: u32,
    pub hash: String,
    pub time: u64,
    pub reward_txid: Option<Txid>,
    pub events: u32,
    pub anomalies: u32,
}

impl Encodable for StakeBlockSummary {
    fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.height);
        encoder.write_var_str(&self.hash);
        encoder.write_u64_le(self.time);
        match &self.reward_txid {
            Some(txid) => {
                encoder.write_u8(1);
                encoder.write_bytes(txid.as_bytes());
            }
            None => encoder.write_u8(0),
        }
        encoder.write_u32_le(self.events);
        encoder.write_u32_le(self.anomalies);
    }
}

impl Decodable for StakeBlockSummary {
    fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let height = decoder.read_u32_le()?;
        let hash = decoder.read_var_str()?;
        let time = decoder.read_u64_le()?;
        let reward_txid = match decoder.read_u8()? {
            0 => None,
            1 => Some(Txid(decoder.read_fixed()?)),
            _ => return Err(DecodeError::InvalidData("invalid option tag")),
        };
        Ok(Self {
            height,
            hash,
            time,
            reward_txid,
            events: decoder.read_u32_le()?,
            anomalies: decoder.read_u32_le()?,
        })
    }
}
