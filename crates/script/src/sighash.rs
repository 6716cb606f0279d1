//! Legacy (pre-segwit) signature hashing for transparent inputs.

use bitnode_consensus::Hash256;
use bitnode_primitives::encoding::{Encodable, Encoder};
use bitnode_primitives::hash::sha256d;
use bitnode_primitives::transaction::Transaction;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

const OP_CODESEPARATOR: u8 = 0xab;

/// The digest returned for out-of-range inputs and unmatched
/// SIGHASH_SINGLE outputs; signatures over it are still checked.
pub const SIGHASH_ONE: Hash256 = {
    let mut one = [0u8; 32];
    one[0] = 1;
    one
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SighashType(pub u32);

impl SighashType {
    pub fn base_type(self) -> u32 {
        self.0 & 0x1f
    }

    pub fn has_anyone_can_pay(self) -> bool {
        (self.0 & SIGHASH_ANYONECANPAY) != 0
    }

    pub fn is_defined(self) -> bool {
        matches!(
            self.0 & !SIGHASH_ANYONECANPAY,
            SIGHASH_ALL | SIGHASH_NONE | SIGHASH_SINGLE
        )
    }
}

/// Digest signed by input `input_index` of `tx` for `script_code`.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sighash_type: SighashType,
) -> Hash256 {
    let base = sighash_type.base_type();
    if input_index >= tx.vin.len() || (base == SIGHASH_SINGLE && input_index >= tx.vout.len()) {
        return SIGHASH_ONE;
    }
    let anyone_can_pay = sighash_type.has_anyone_can_pay();
    let blank_sequences = base == SIGHASH_NONE || base == SIGHASH_SINGLE;
    let script_code = strip_code_separators(script_code);

    let mut encoder = Encoder::new();
    encoder.write_i32_le(tx.version);

    let inputs: Vec<usize> = if anyone_can_pay {
        vec![input_index]
    } else {
        (0..tx.vin.len()).collect()
    };
    encoder.write_varint(inputs.len() as u64);
    for idx in inputs {
        let input = &tx.vin[idx];
        input.prevout.consensus_encode(&mut encoder);
        if idx == input_index {
            encoder.write_var_bytes(&script_code);
            encoder.write_u32_le(input.sequence);
        } else {
            encoder.write_varint(0);
            encoder.write_u32_le(if blank_sequences { 0 } else { input.sequence });
        }
    }

    match base {
        SIGHASH_NONE => encoder.write_varint(0),
        SIGHASH_SINGLE => {
            encoder.write_varint(input_index as u64 + 1);
            for _ in 0..input_index {
                encoder.write_i64_le(-1);
                encoder.write_varint(0);
            }
            tx.vout[input_index].consensus_encode(&mut encoder);
        }
        _ => tx.vout.consensus_encode(&mut encoder),
    }

    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(sighash_type.0);
    sha256d(&encoder.into_inner())
}

fn strip_code_separators(script: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(script.len());
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        let width = 1 + push_payload_len(script, cursor);
        let end = (cursor + width).min(script.len());
        if opcode != OP_CODESEPARATOR {
            out.extend_from_slice(&script[cursor..end]);
        }
        cursor = end;
    }
    out
}

/// Length prefix plus payload following the opcode at `pos`.
fn push_payload_len(script: &[u8], pos: usize) -> usize {
    let read = |width: usize| -> usize {
        let bytes = script.get(pos + 1..pos + 1 + width).unwrap_or(&[]);
        let mut buf = [0u8; 4];
        buf[..bytes.len()].copy_from_slice(bytes);
        width + u32::from_le_bytes(buf) as usize
    };
    match script[pos] {
        op @ 0x01..=0x4b => op as usize,
        0x4c => read(1),
        0x4d => read(2),
        0x4e => read(4),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitnode_primitives::outpoint::OutPoint;
    use bitnode_primitives::transaction::{TxIn, TxOut};

    fn two_in_one_out() -> Transaction {
        let input = |n: u8| TxIn {
            prevout: OutPoint::new([n; 32], 0),
            script_sig: Vec::new(),
            sequence: 7,
        };
        Transaction {
            version: 1,
            vin: vec![input(1), input(2)],
            vout: vec![TxOut {
                value: 10,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn single_without_matching_output_signs_one() {
        let tx = two_in_one_out();
        assert_eq!(
            signature_hash(&tx, 1, &[0x51], SighashType(SIGHASH_SINGLE)),
            SIGHASH_ONE
        );
        assert_eq!(signature_hash(&tx, 5, &[0x51], SighashType(SIGHASH_ALL)), SIGHASH_ONE);
    }

    #[test]
    fn anyone_can_pay_ignores_other_inputs() {
        let tx = two_in_one_out();
        let mut changed = tx.clone();
        changed.vin[1].prevout = OutPoint::new([9; 32], 3);
        let kind = SighashType(SIGHASH_ALL | SIGHASH_ANYONECANPAY);
        assert_eq!(
            signature_hash(&tx, 0, &[0x51], kind),
            signature_hash(&changed, 0, &[0x51], kind)
        );
        let all = SighashType(SIGHASH_ALL);
        assert_ne!(
            signature_hash(&tx, 0, &[0x51], all),
            signature_hash(&changed, 0, &[0x51], all)
        );
    }

    #[test]
    fn code_separators_are_not_signed() {
        let tx = two_in_one_out();
        let all = SighashType(SIGHASH_ALL);
        assert_eq!(
            signature_hash(&tx, 0, &[0xab, 0x51, 0xab], all),
            signature_hash(&tx, 0, &[0x51], all)
        );
        // 0xab inside a push is data, not a separator.
        assert_eq!(strip_code_separators(&[0x01, 0xab, 0xab]), vec![0x01, 0xab]);
    }
}
