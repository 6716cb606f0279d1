use bitnode_primitives::hash::hash160;
use bitnode_primitives::outpoint::OutPoint;
use bitnode_primitives::transaction::{Transaction, TxIn, TxOut};
use bitnode_script::interpreter::{encode_num, opcodes::*};
use bitnode_script::sighash::{signature_hash, SighashType, SIGHASH_ALL};
use bitnode_script::{
    verify_script, ScriptError, ScriptVerifier, StandardVerifier,
    SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, SCRIPT_VERIFY_CLEANSTACK, SCRIPT_VERIFY_NULLDUMMY,
    SCRIPT_VERIFY_P2SH, SCRIPT_VERIFY_STRICTENC,
};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

const STANDARD: u32 = SCRIPT_VERIFY_P2SH | SCRIPT_VERIFY_STRICTENC | SCRIPT_VERIFY_NULLDUMMY;

fn push(script: &mut Vec<u8>, data: &[u8]) {
    assert!(data.len() < usize::from(OP_PUSHDATA1));
    script.push(data.len() as u8);
    script.extend_from_slice(data);
}

fn key(seed: u8) -> (SecretKey, Vec<u8>) {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[seed; 32]).expect("secret key");
    let public = PublicKey::from_secret_key(&secp, &secret);
    (secret, public.serialize().to_vec())
}

fn spending_tx(lock_time: u32, sequence: u32) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new([0x42; 32], 0),
            script_sig: Vec::new(),
            sequence,
        }],
        vout: vec![TxOut {
            value: 4_000,
            script_pubkey: vec![OP_1],
        }],
        lock_time,
    }
}

fn sign(tx: &Transaction, script_code: &[u8], secret: &SecretKey) -> Vec<u8> {
    let secp = Secp256k1::new();
    let digest = signature_hash(tx, 0, script_code, SighashType(SIGHASH_ALL));
    let message = Message::from_digest_slice(&digest).expect("digest");
    let mut sig = secp.sign_ecdsa(&message, secret).serialize_der().to_vec();
    sig.push(SIGHASH_ALL as u8);
    sig
}

fn p2pkh(pubkey: &[u8]) -> Vec<u8> {
    let mut script = vec![OP_DUP, OP_HASH160];
    push(&mut script, &hash160(pubkey));
    script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

#[test]
fn pay_to_pubkey_hash_spend() {
    let (secret, pubkey) = key(0x11);
    let script_pubkey = p2pkh(&pubkey);
    let mut tx = spending_tx(0, u32::MAX);
    let sig = sign(&tx, &script_pubkey, &secret);
    let mut script_sig = Vec::new();
    push(&mut script_sig, &sig);
    push(&mut script_sig, &pubkey);
    tx.vin[0].script_sig = script_sig;

    assert_eq!(verify_script(&tx.vin[0].script_sig, &script_pubkey, &tx, 0, STANDARD), Ok(()));
    assert!(StandardVerifier.verify(&tx, &script_pubkey, 0, STANDARD | SCRIPT_VERIFY_CLEANSTACK));

    // Changing any signed field invalidates the signature.
    let mut tampered = tx.clone();
    tampered.vout[0].value += 1;
    assert!(!StandardVerifier.verify(&tampered, &script_pubkey, 0, STANDARD));

    let (_, other) = key(0x22);
    assert!(!StandardVerifier.verify(&tx, &p2pkh(&other), 0, STANDARD));
}

#[test]
fn pay_to_script_hash_multisig_spend() {
    let (secret, pubkey) = key(0x33);
    let mut redeem = vec![OP_1];
    push(&mut redeem, &pubkey);
    redeem.extend_from_slice(&[OP_1, OP_CHECKMULTISIG]);

    let mut script_pubkey = vec![OP_HASH160];
    push(&mut script_pubkey, &hash160(&redeem));
    script_pubkey.push(OP_EQUAL);

    let mut tx = spending_tx(0, u32::MAX);
    let sig = sign(&tx, &redeem, &secret);
    let mut script_sig = vec![OP_0];
    push(&mut script_sig, &sig);
    push(&mut script_sig, &redeem);
    tx.vin[0].script_sig = script_sig;

    assert!(StandardVerifier.verify(&tx, &script_pubkey, 0, STANDARD));

    let mut not_null = tx.clone();
    not_null.vin[0].script_sig[0] = OP_1;
    assert_eq!(
        verify_script(&not_null.vin[0].script_sig, &script_pubkey, &not_null, 0, STANDARD),
        Err(ScriptError::NullDummy)
    );
}

#[test]
fn lock_time_verify() {
    let script_for = |lock: i64| {
        let mut script = Vec::new();
        push(&mut script, &encode_num(lock));
        script.extend_from_slice(&[OP_CHECKLOCKTIMEVERIFY, OP_DROP, OP_1]);
        script
    };
    let tx = spending_tx(100, 0);
    let flags = SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;

    assert_eq!(verify_script(&[], &script_for(50), &tx, 0, flags), Ok(()));
    assert_eq!(
        verify_script(&[], &script_for(200), &tx, 0, flags),
        Err(ScriptError::UnsatisfiedLockTime)
    );
    // Without the flag the opcode is a no-op.
    assert_eq!(verify_script(&[], &script_for(200), &tx, 0, 0), Ok(()));

    let final_input = spending_tx(100, u32::MAX);
    assert_eq!(
        verify_script(&[], &script_for(50), &final_input, 0, flags),
        Err(ScriptError::UnsatisfiedLockTime)
    );
}

#[test]
fn op_return_and_false_results() {
    let tx = spending_tx(0, u32::MAX);
    assert_eq!(verify_script(&[], &[OP_RETURN], &tx, 0, 0), Err(ScriptError::OpReturn));
    assert_eq!(verify_script(&[], &[OP_0], &tx, 0, 0), Err(ScriptError::EvalFalse));
    assert_eq!(
        verify_script(&[OP_1], &[OP_1, OP_EQUAL], &tx, 0, 0),
        Ok(())
    );
    assert_eq!(
        verify_script(&[], &[OP_1, OP_IF, OP_1], &tx, 0, 0),
        Err(ScriptError::UnbalancedConditional)
    );
}
