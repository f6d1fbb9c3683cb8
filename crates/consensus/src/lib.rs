//! Monetary units and per-network chain parameters.

pub mod money;
pub mod params;

pub use money::{money_range, parse_coin_amount, Amount, COIN, MAX_MONEY};
pub use params::{chain_params, ChainParams, Network};
