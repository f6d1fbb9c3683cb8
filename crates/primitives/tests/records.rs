use stakeidx_primitives::{
    address_hash, decode, encode, Confidence, DecodeError, OutPoint, StakeBlockSummary, StakeEvent,
    Txid, UnspentOutput,
};

fn event() -> StakeEvent {
    StakeEvent {
        beneficiary_address: "RBeneficiary".to_string(),
        funding_address: "RFunder".to_string(),
        block_height: 1000,
        block_hash: "ab".repeat(32),
        block_time: 1_700_000_000,
        reward_txid: Txid([0x11; 32]),
        output_index: 0,
        reward_amount: 3,
        funding_stake_amount: None,
        confidence: Confidence::Unknown,
    }
}

#[test]
fn stake_event_survives_storage_encoding() {
    let event = event();
    let decoded: StakeEvent = decode(&encode(&event)).expect("decode");
    assert_eq!(decoded, event);
    assert!(!decoded.is_direct_stake());
    assert_eq!(decoded.outpoint(), OutPoint::new(Txid([0x11; 32]), 0));
}

#[test]
fn truncated_records_are_rejected() {
    let bytes = encode(&event());
    let err = decode::<StakeEvent>(&bytes[..bytes.len() - 2]).unwrap_err();
    assert_eq!(err, DecodeError::UnexpectedEof);

    let mut padded = bytes.clone();
    padded.push(0);
    assert_eq!(
        decode::<StakeEvent>(&padded).unwrap_err(),
        DecodeError::TrailingBytes
    );
}

#[test]
fn unspent_output_and_summary_encode() {
    let utxo = UnspentOutput {
        address: "RFunder".to_string(),
        outpoint: OutPoint::new(Txid([0x22; 32]), 5),
        value: 250_000_000,
        creation_height: 900,
        spent: false,
        maturity_eligible: true,
    };
    assert_eq!(decode::<UnspentOutput>(&encode(&utxo)).expect("utxo"), utxo);

    let summary = StakeBlockSummary {
        height: 1000,
        hash: "cd".repeat(32),
        time: 1,
        reward_txid: None,
        events: 0,
        anomalies: 1,
    };
    assert_eq!(
        decode::<StakeBlockSummary>(&encode(&summary)).expect("summary"),
        summary
    );
}

#[test]
fn address_hash_is_stable_and_distinct() {
    assert_eq!(address_hash("RFunder"), address_hash("RFunder"));
    assert_ne!(address_hash("RFunder"), address_hash("RFunder2"));
}
