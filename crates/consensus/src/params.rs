//! Chain parameters the stake index depends on.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Self::Mainnet),
            "testnet" | "test" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub default_rpc_port: u16,
    /// Confirmations an output needs before it may stake again.
    pub staking_maturity: u32,
    /// Lowest height at which stake-produced blocks can appear.
    pub first_stake_height: u32,
    /// Shared address that collects delegated stake; never the true funder.
    pub delegation_pool_address: Option<String>,
    pub target_spacing_secs: u64,
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            default_rpc_port: 27486,
            staking_maturity: 150,
            first_stake_height: 1,
            delegation_pool_address: None,
            target_spacing_secs: 60,
        },
        Network::Testnet => ChainParams {
            network,
            default_rpc_port: 18843,
            staking_maturity: 150,
            first_stake_height: 1,
            delegation_pool_address: None,
            target_spacing_secs: 60,
        },
        Network::Regtest => ChainParams {
            network,
            default_rpc_port: 18844,
            staking_maturity: 10,
            first_stake_height: 1,
            delegation_pool_address: None,
            target_spacing_secs: 1,
        },
    }
}
