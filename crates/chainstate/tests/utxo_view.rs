use bitnode_chainstate::{
    BlockCheck, ChainError, InputPartition, Utxo, UtxoView, ValidationError,
};
use bitnode_consensus::{consensus_params, Network};
use bitnode_primitives::block::{Block, BlockHeader};
use bitnode_primitives::outpoint::OutPoint;
use bitnode_primitives::transaction::{Transaction, TxIn, TxOut};

fn tx(inputs: &[OutPoint], outputs: &[i64]) -> Transaction {
    Transaction {
        version: 1,
        vin: inputs
            .iter()
            .map(|prevout| TxIn {
                prevout: *prevout,
                script_sig: vec![0x01, 0x02],
                sequence: u32::MAX,
            })
            .collect(),
        vout: outputs
            .iter()
            .map(|value| TxOut {
                value: *value,
                script_pubkey: vec![0x51],
            })
            .collect(),
        lock_time: 0,
    }
}

fn block(transactions: Vec<Transaction>) -> Block {
    Block {
        header: BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 0,
            bits: 0x207f_ffff,
            nonce: 0,
        },
        transactions,
    }
}

fn stored(value: i64) -> Utxo {
    Utxo {
        value,
        script_pubkey: vec![0x51],
        height: 1,
        is_coinbase: false,
    }
}

fn build_from(partition: &InputPartition, value: i64) -> UtxoView {
    UtxoView::build(partition, |outpoints| {
        Ok(outpoints
            .iter()
            .map(|outpoint| (*outpoint, stored(value)))
            .collect())
    })
    .expect("view")
}

#[test]
fn in_block_spend_needs_no_fetch() {
    let coinbase = tx(&[OutPoint::null()], &[50]);
    let first = tx(&[OutPoint::new([1u8; 32], 0)], &[10, 20]);
    let second = tx(&[OutPoint::new(first.txid(), 1)], &[15]);
    let block = block(vec![coinbase, first.clone(), second]);
    let partition = InputPartition::new(&block, &block.txids(), 5).expect("partition");

    assert_eq!(partition.external, vec![OutPoint::new([1u8; 32], 0)]);
    assert!(partition.internal.contains_key(&OutPoint::new(first.txid(), 1)));
    assert!(!partition
        .created
        .iter()
        .any(|(outpoint, _)| *outpoint == OutPoint::new(first.txid(), 1)));

    let mut internal_only = partition;
    internal_only.external.clear();
    let view = UtxoView::build(&internal_only, |_| -> Result<Vec<(OutPoint, Utxo)>, ChainError> {
        panic!("fetch called for block-internal spends")
    })
    .expect("view");
    assert_eq!(view.len(), 1);
    assert!(view.have(&OutPoint::new(first.txid(), 1)));
    assert_eq!(view.fetch(&OutPoint::new(first.txid(), 1)).map(|utxo| utxo.height), Some(5));
}

#[test]
fn coinbase_only_block_has_empty_view() {
    let block = block(vec![tx(&[OutPoint::null()], &[50])]);
    let partition = InputPartition::new(&block, &block.txids(), 1).expect("partition");
    let view = UtxoView::build(&partition, |_| -> Result<Vec<(OutPoint, Utxo)>, ChainError> {
        panic!("nothing to fetch")
    })
    .expect("view");
    assert!(view.is_empty());
    assert_eq!(partition.created.len(), 1);
}

#[test]
fn double_spend_within_block_is_rejected() {
    let outpoint = OutPoint::new([2u8; 32], 0);
    let block = block(vec![
        tx(&[OutPoint::null()], &[50]),
        tx(&[outpoint], &[1]),
        tx(&[outpoint], &[2]),
    ]);
    let err = InputPartition::new(&block, &block.txids(), 3).unwrap_err();
    assert!(matches!(
        err,
        ChainError::Validation(ValidationError::DuplicateSpend)
    ));
}

#[test]
fn fee_is_value_in_minus_value_out() {
    let params = consensus_params(Network::Regtest);
    let check = BlockCheck::new(&params);
    let inputs = [OutPoint::new([3u8; 32], 0), OutPoint::new([3u8; 32], 1)];
    let block = block(vec![tx(&[OutPoint::null()], &[50]), tx(&inputs, &[80])]);
    let partition = InputPartition::new(&block, &block.txids(), 10).expect("partition");
    let view = build_from(&partition, 50);

    let fee = check
        .check_contextual_inputs(&view, &tx(&inputs, &[80]), 10)
        .expect("fee");
    assert_eq!(fee, 20);

    let err = check
        .check_contextual_inputs(&view, &tx(&inputs, &[60, 60]), 10)
        .unwrap_err();
    assert_eq!(
        err,
        ValidationError::ValueInBelowValueOut {
            value_in: 100,
            value_out: 120
        }
    );
}

#[test]
fn missing_input_is_reported() {
    let params = consensus_params(Network::Regtest);
    let check = BlockCheck::new(&params);
    let missing = OutPoint::new([4u8; 32], 7);
    let err = check
        .check_contextual_inputs(&UtxoView::default(), &tx(&[missing], &[1]), 10)
        .unwrap_err();
    assert_eq!(err, ValidationError::MissingInputs(missing));
}
