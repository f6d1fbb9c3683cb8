use stakeidx_consensus::{chain_params, Network};

#[test]
fn network_names_roundtrip() {
    for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
        assert_eq!(Network::parse(network.as_str()), Some(network));
    }
    assert_eq!(Network::parse("MAIN"), Some(Network::Mainnet));
    assert_eq!(Network::parse("signet"), None);
}

#[test]
fn maturity_is_positive_everywhere() {
    for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
        let params = chain_params(network);
        assert!(params.staking_maturity > 0);
        assert!(params.first_stake_height > 0);
        assert!(params.delegation_pool_address.is_none());
    }
}
