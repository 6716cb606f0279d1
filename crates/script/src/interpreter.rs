//! Reference interpreter for the standard script forms: pay-to-pubkey,
//! pay-to-pubkey-hash, bare multisig, pay-to-script-hash and
//! CHECKLOCKTIMEVERIFY-guarded spends.
//!
//! Opcodes outside that set fail when executed.

use bitnode_consensus::constants::{
    LOCKTIME_THRESHOLD, MAX_SCRIPT_SIZE, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY,
    SCRIPT_VERIFY_CLEANSTACK, SCRIPT_VERIFY_DERSIG, SCRIPT_VERIFY_LOW_S,
    SCRIPT_VERIFY_MINIMALDATA, SCRIPT_VERIFY_NULLDUMMY, SCRIPT_VERIFY_P2SH,
    SCRIPT_VERIFY_SIGPUSHONLY, SCRIPT_VERIFY_STRICTENC, SEQUENCE_FINAL,
};
use bitnode_primitives::hash::{hash160, sha256, sha256d};
use bitnode_primitives::transaction::Transaction;
use ripemd::{Digest as _, Ripemd160};
use secp256k1::{ecdsa::Signature, Message, PublicKey};
use sha1::Sha1;

use crate::secp::verify_context;
use crate::sighash::{signature_hash, SighashType};
use crate::ScriptFlags;

pub mod opcodes {
    pub const OP_0: u8 = 0x00;
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_PUSHDATA2: u8 = 0x4d;
    pub const OP_PUSHDATA4: u8 = 0x4e;
    pub const OP_1NEGATE: u8 = 0x4f;
    pub const OP_1: u8 = 0x51;
    pub const OP_16: u8 = 0x60;
    pub const OP_NOP: u8 = 0x61;
    pub const OP_IF: u8 = 0x63;
    pub const OP_NOTIF: u8 = 0x64;
    pub const OP_ELSE: u8 = 0x67;
    pub const OP_ENDIF: u8 = 0x68;
    pub const OP_VERIFY: u8 = 0x69;
    pub const OP_RETURN: u8 = 0x6a;
    pub const OP_2DROP: u8 = 0x6d;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_SWAP: u8 = 0x7c;
    pub const OP_SIZE: u8 = 0x82;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_RIPEMD160: u8 = 0xa6;
    pub const OP_SHA1: u8 = 0xa7;
    pub const OP_SHA256: u8 = 0xa8;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_HASH256: u8 = 0xaa;
    pub const OP_CODESEPARATOR: u8 = 0xab;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKSIGVERIFY: u8 = 0xad;
    pub const OP_CHECKMULTISIG: u8 = 0xae;
    pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
    pub const OP_NOP1: u8 = 0xb0;
    pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
    pub const OP_NOP10: u8 = 0xb9;
}

use opcodes::*;

const MAX_PUBKEYS_PER_MULTISIG: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    ScriptSize,
    PushSize,
    StackUnderflow,
    EvalFalse,
    OpReturn,
    BadOpcode(u8),
    UnbalancedConditional,
    Verify,
    EqualVerify,
    SigEncoding,
    SigDer,
    SigHighS,
    SigHashType,
    PubkeyEncoding,
    SigCheck,
    SigPushOnly,
    NullDummy,
    PubkeyCount,
    SigCount,
    NumberOverflow,
    NegativeLockTime,
    UnsatisfiedLockTime,
    MinimalData,
    CleanStack,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::ScriptSize => write!(f, "script too large"),
            ScriptError::PushSize => write!(f, "push exceeds script bounds"),
            ScriptError::StackUnderflow => write!(f, "script stack underflow"),
            ScriptError::EvalFalse => write!(f, "script evaluated to false"),
            ScriptError::OpReturn => write!(f, "OP_RETURN executed"),
            ScriptError::BadOpcode(op) => write!(f, "unsupported opcode 0x{op:02x}"),
            ScriptError::UnbalancedConditional => write!(f, "unbalanced conditional"),
            ScriptError::Verify => write!(f, "OP_VERIFY failed"),
            ScriptError::EqualVerify => write!(f, "OP_EQUALVERIFY failed"),
            ScriptError::SigEncoding => write!(f, "invalid signature encoding"),
            ScriptError::SigDer => write!(f, "non-DER signature"),
            ScriptError::SigHighS => write!(f, "signature S value is high"),
            ScriptError::SigHashType => write!(f, "invalid sighash type"),
            ScriptError::PubkeyEncoding => write!(f, "invalid public key encoding"),
            ScriptError::SigCheck => write!(f, "signature check failed"),
            ScriptError::SigPushOnly => write!(f, "scriptSig is not push-only"),
            ScriptError::NullDummy => write!(f, "multisig dummy element must be empty"),
            ScriptError::PubkeyCount => write!(f, "invalid multisig key count"),
            ScriptError::SigCount => write!(f, "invalid multisig signature count"),
            ScriptError::NumberOverflow => write!(f, "script number overflow"),
            ScriptError::NegativeLockTime => write!(f, "negative locktime"),
            ScriptError::UnsatisfiedLockTime => write!(f, "locktime requirement not satisfied"),
            ScriptError::MinimalData => write!(f, "non-minimal push"),
            ScriptError::CleanStack => write!(f, "stack not clean after evaluation"),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Run `script_sig` then `script_pubkey` (and the redeem script for
/// pay-to-script-hash) for input `input_index` of `tx`.
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    tx: &Transaction,
    input_index: usize,
    flags: ScriptFlags,
) -> Result<(), ScriptError> {
    let pay_to_script_hash = flags & SCRIPT_VERIFY_P2SH != 0 && is_p2sh(script_pubkey);
    if (flags & SCRIPT_VERIFY_SIGPUSHONLY != 0 || pay_to_script_hash) && !is_push_only(script_sig)
    {
        return Err(ScriptError::SigPushOnly);
    }

    let checker = Checker {
        tx,
        input_index,
        flags,
    };

    let mut machine = Machine::new(&checker);
    machine.run(script_sig)?;
    let sig_stack = machine.stack.clone();
    machine.run(script_pubkey)?;
    if !machine.top_is_true() {
        return Err(ScriptError::EvalFalse);
    }

    if pay_to_script_hash {
        let mut redeem_machine = Machine::new(&checker);
        redeem_machine.stack = sig_stack;
        let redeem_script = redeem_machine.pop()?;
        redeem_machine.run(&redeem_script)?;
        if !redeem_machine.top_is_true() {
            return Err(ScriptError::EvalFalse);
        }
        machine = redeem_machine;
    }

    if flags & SCRIPT_VERIFY_CLEANSTACK != 0 && machine.stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }
    Ok(())
}

struct Checker<'a> {
    tx: &'a Transaction,
    input_index: usize,
    flags: ScriptFlags,
}

impl Checker<'_> {
    fn enabled(&self, flag: ScriptFlags) -> bool {
        self.flags & flag != 0
    }

    fn check_sig(&self, sig: &[u8], pubkey: &[u8], script_code: &[u8]) -> Result<bool, ScriptError> {
        let Some((&hash_type, der)) = sig.split_last() else {
            return Ok(false);
        };
        let hash_type = SighashType(u32::from(hash_type));
        if self.enabled(SCRIPT_VERIFY_STRICTENC) {
            if !hash_type.is_defined() {
                return Err(ScriptError::SigHashType);
            }
            if !is_valid_pubkey(pubkey) {
                return Err(ScriptError::PubkeyEncoding);
            }
        }

        let parsed = match Signature::from_der(der) {
            Ok(parsed) => parsed,
            Err(_) if self.enabled(SCRIPT_VERIFY_DERSIG | SCRIPT_VERIFY_STRICTENC) => {
                return Err(ScriptError::SigDer);
            }
            Err(_) => return Ok(false),
        };
        let mut normalized = parsed;
        normalized.normalize_s();
        if self.enabled(SCRIPT_VERIFY_LOW_S) && normalized != parsed {
            return Err(ScriptError::SigHighS);
        }

        let Ok(key) = PublicKey::from_slice(pubkey) else {
            return Ok(false);
        };
        let digest = signature_hash(self.tx, self.input_index, script_code, hash_type);
        let Ok(message) = Message::from_digest_slice(&digest) else {
            return Ok(false);
        };
        Ok(verify_context()
            .verify_ecdsa(&message, &normalized, &key)
            .is_ok())
    }

    fn check_lock_time(&self, lock_time: i64) -> Result<(), ScriptError> {
        if lock_time < 0 {
            return Err(ScriptError::NegativeLockTime);
        }
        let threshold = i64::from(LOCKTIME_THRESHOLD);
        let tx_lock_time = i64::from(self.tx.lock_time);
        if (tx_lock_time < threshold) != (lock_time < threshold) || lock_time > tx_lock_time {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        // A final input would let the transaction bypass its own lock time.
        if self.tx.vin[self.input_index].sequence == SEQUENCE_FINAL {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        Ok(())
    }
}

struct Machine<'c, 'a> {
    stack: Vec<Vec<u8>>,
    checker: &'c Checker<'a>,
}

impl<'c, 'a> Machine<'c, 'a> {
    fn new(checker: &'c Checker<'a>) -> Self {
        Self {
            stack: Vec::new(),
            checker,
        }
    }

    fn pop(&mut self) -> Result<Vec<u8>, ScriptError> {
        self.stack.pop().ok_or(ScriptError::StackUnderflow)
    }

    fn top(&self) -> Result<&Vec<u8>, ScriptError> {
        self.stack.last().ok_or(ScriptError::StackUnderflow)
    }

    fn top_is_true(&self) -> bool {
        self.stack.last().is_some_and(|top| cast_to_bool(top))
    }

    fn push_bool(&mut self, value: bool) {
        self.stack.push(if value { vec![1] } else { Vec::new() });
    }

    fn run(&mut self, script: &[u8]) -> Result<(), ScriptError> {
        if script.len() > MAX_SCRIPT_SIZE {
            return Err(ScriptError::ScriptSize);
        }
        let mut exec_stack: Vec<bool> = Vec::new();
        let mut code_start = 0usize;
        let mut cursor = 0usize;

        while cursor < script.len() {
            let opcode = script[cursor];
            cursor += 1;
            let executing = exec_stack.iter().all(|branch| *branch);

            if opcode <= OP_PUSHDATA4 {
                let data = read_push(script, &mut cursor, opcode)?;
                if executing {
                    if self.checker.enabled(SCRIPT_VERIFY_MINIMALDATA)
                        && !is_minimal_push(&data, opcode)
                    {
                        return Err(ScriptError::MinimalData);
                    }
                    self.stack.push(data);
                }
                continue;
            }

            match opcode {
                OP_IF | OP_NOTIF => {
                    let branch = if executing {
                        let value = cast_to_bool(&self.pop()?);
                        value == (opcode == OP_IF)
                    } else {
                        false
                    };
                    exec_stack.push(branch);
                }
                OP_ELSE => {
                    let branch = exec_stack
                        .last_mut()
                        .ok_or(ScriptError::UnbalancedConditional)?;
                    *branch = !*branch;
                }
                OP_ENDIF => {
                    exec_stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                }
                _ if !executing => {}
                OP_1NEGATE | OP_1..=OP_16 => {
                    let value = i64::from(opcode) - i64::from(OP_1 - 1);
                    self.stack.push(encode_num(value));
                }
                OP_NOP | OP_NOP1 | 0xb2..=OP_NOP10 => {}
                OP_VERIFY => {
                    if !cast_to_bool(&self.pop()?) {
                        return Err(ScriptError::Verify);
                    }
                }
                OP_RETURN => return Err(ScriptError::OpReturn),
                OP_DROP => {
                    self.pop()?;
                }
                OP_2DROP => {
                    self.pop()?;
                    self.pop()?;
                }
                OP_DUP => {
                    let top = self.top()?.clone();
                    self.stack.push(top);
                }
                OP_SWAP => {
                    let len = self.stack.len();
                    if len < 2 {
                        return Err(ScriptError::StackUnderflow);
                    }
                    self.stack.swap(len - 1, len - 2);
                }
                OP_SIZE => {
                    let len = self.top()?.len() as i64;
                    self.stack.push(encode_num(len));
                }
                OP_EQUAL | OP_EQUALVERIFY => {
                    let equal = self.pop()? == self.pop()?;
                    if opcode == OP_EQUALVERIFY {
                        if !equal {
                            return Err(ScriptError::EqualVerify);
                        }
                    } else {
                        self.push_bool(equal);
                    }
                }
                OP_RIPEMD160 => {
                    let data = self.pop()?;
                    self.stack.push(Ripemd160::digest(data).to_vec());
                }
                OP_SHA1 => {
                    let data = self.pop()?;
                    self.stack.push(Sha1::digest(data).to_vec());
                }
                OP_SHA256 => {
                    let data = self.pop()?;
                    self.stack.push(sha256(&data).to_vec());
                }
                OP_HASH160 => {
                    let data = self.pop()?;
                    self.stack.push(hash160(&data).to_vec());
                }
                OP_HASH256 => {
                    let data = self.pop()?;
                    self.stack.push(sha256d(&data).to_vec());
                }
                OP_CODESEPARATOR => code_start = cursor,
                OP_CHECKLOCKTIMEVERIFY => {
                    if self.checker.enabled(SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY) {
                        // Lock times need five bytes to reach past 2^31.
                        let lock_time = decode_num(self.top()?, 5)?;
                        self.checker.check_lock_time(lock_time)?;
                    }
                }
                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    let pubkey = self.pop()?;
                    let sig = self.pop()?;
                    let ok = self.checker.check_sig(&sig, &pubkey, &script[code_start..])?;
                    if opcode == OP_CHECKSIGVERIFY {
                        if !ok {
                            return Err(ScriptError::SigCheck);
                        }
                    } else {
                        self.push_bool(ok);
                    }
                }
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let ok = self.check_multisig(&script[code_start..])?;
                    if opcode == OP_CHECKMULTISIGVERIFY {
                        if !ok {
                            return Err(ScriptError::SigCheck);
                        }
                    } else {
                        self.push_bool(ok);
                    }
                }
                other => return Err(ScriptError::BadOpcode(other)),
            }
        }

        if !exec_stack.is_empty() {
            return Err(ScriptError::UnbalancedConditional);
        }
        Ok(())
    }

    fn check_multisig(&mut self, script_code: &[u8]) -> Result<bool, ScriptError> {
        let key_count = decode_num(&self.pop()?, 4)?;
        if !(0..=MAX_PUBKEYS_PER_MULTISIG).contains(&key_count) {
            return Err(ScriptError::PubkeyCount);
        }
        let mut keys = (0..key_count)
            .map(|_| self.pop())
            .collect::<Result<Vec<_>, _>>()?;
        keys.reverse();

        let sig_count = decode_num(&self.pop()?, 4)?;
        if !(0..=key_count).contains(&sig_count) {
            return Err(ScriptError::SigCount);
        }
        let mut sigs = (0..sig_count)
            .map(|_| self.pop())
            .collect::<Result<Vec<_>, _>>()?;
        sigs.reverse();

        // The historical off-by-one consumes one extra element.
        let dummy = self.pop()?;
        if self.checker.enabled(SCRIPT_VERIFY_NULLDUMMY) && !dummy.is_empty() {
            return Err(ScriptError::NullDummy);
        }

        let mut key_cursor = 0usize;
        for (sig_index, sig) in sigs.iter().enumerate() {
            let sigs_left = sigs.len() - sig_index;
            let mut matched = false;
            while keys.len() - key_cursor >= sigs_left {
                let key = &keys[key_cursor];
                key_cursor += 1;
                if self.checker.check_sig(sig, key, script_code)? {
                    matched = true;
                    break;
                }
            }
            if !matched {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn take<'s>(script: &'s [u8], cursor: &mut usize, len: usize) -> Result<&'s [u8], ScriptError> {
    let end = cursor
        .checked_add(len)
        .filter(|end| *end <= script.len())
        .ok_or(ScriptError::PushSize)?;
    let slice = &script[*cursor..end];
    *cursor = end;
    Ok(slice)
}

fn read_push(script: &[u8], cursor: &mut usize, opcode: u8) -> Result<Vec<u8>, ScriptError> {
    let len = match opcode {
        OP_PUSHDATA1 => take(script, cursor, 1)?[0] as usize,
        OP_PUSHDATA2 => {
            let bytes = take(script, cursor, 2)?;
            u16::from_le_bytes([bytes[0], bytes[1]]) as usize
        }
        OP_PUSHDATA4 => {
            let bytes = take(script, cursor, 4)?;
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
        }
        direct => direct as usize,
    };
    Ok(take(script, cursor, len)?.to_vec())
}

pub fn is_p2sh(script_pubkey: &[u8]) -> bool {
    script_pubkey.len() == 23
        && script_pubkey[0] == OP_HASH160
        && script_pubkey[1] == 0x14
        && script_pubkey[22] == OP_EQUAL
}

pub fn is_push_only(script: &[u8]) -> bool {
    let mut cursor = 0usize;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        if opcode > OP_16 {
            return false;
        }
        if opcode <= OP_PUSHDATA4 && read_push(script, &mut cursor, opcode).is_err() {
            return false;
        }
    }
    true
}

fn cast_to_bool(data: &[u8]) -> bool {
    match data.split_last() {
        None => false,
        Some((last, rest)) => rest.iter().any(|b| *b != 0) || (*last != 0 && *last != 0x80),
    }
}

fn decode_num(data: &[u8], max_len: usize) -> Result<i64, ScriptError> {
    if data.len() > max_len {
        return Err(ScriptError::NumberOverflow);
    }
    let Some((&last, _)) = data.split_last() else {
        return Ok(0);
    };
    let mut magnitude: i64 = 0;
    for (i, byte) in data.iter().enumerate() {
        magnitude |= i64::from(*byte) << (8 * i);
    }
    if last & 0x80 != 0 {
        magnitude &= !(0x80i64 << (8 * (data.len() - 1)));
        return Ok(-magnitude);
    }
    Ok(magnitude)
}

pub fn encode_num(value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut abs = value.unsigned_abs();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if let Some(last) = out.last_mut() {
        if *last & 0x80 != 0 {
            out.push(if value < 0 { 0x80 } else { 0 });
        } else if value < 0 {
            *last |= 0x80;
        }
    }
    out
}

fn is_valid_pubkey(data: &[u8]) -> bool {
    match data.len() {
        33 => data[0] == 0x02 || data[0] == 0x03,
        65 => data[0] == 0x04,
        _ => false,
    }
}

fn is_minimal_push(data: &[u8], opcode: u8) -> bool {
    match data.len() {
        0 => opcode == OP_0,
        1 if (1..=16).contains(&data[0]) => false,
        1 if data[0] == 0x81 => false,
        len @ 1..=75 => opcode as usize == len,
        76..=255 => opcode == OP_PUSHDATA1,
        256..=65_535 => opcode == OP_PUSHDATA2,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_numbers() {
        for value in [0i64, 1, -1, 127, 128, -128, 255, 256, -32_768, 500_000_000] {
            assert_eq!(decode_num(&encode_num(value), 5), Ok(value), "{value}");
        }
        assert_eq!(encode_num(128), vec![0x80, 0x00]);
        assert_eq!(encode_num(-1), vec![0x81]);
        assert_eq!(decode_num(&[1, 2, 3, 4, 5], 4), Err(ScriptError::NumberOverflow));
    }

    #[test]
    fn negative_zero_is_false() {
        assert!(!cast_to_bool(&[]));
        assert!(!cast_to_bool(&[0, 0, 0x80]));
        assert!(cast_to_bool(&[0, 1, 0x80]));
        assert!(cast_to_bool(&[0x01]));
    }

    #[test]
    fn push_only_detection() {
        assert!(is_push_only(&[OP_0, 0x01, 0xff, OP_16, OP_1NEGATE]));
        assert!(!is_push_only(&[OP_DUP]));
        assert!(!is_push_only(&[0x05, 0x01]));
    }

    #[test]
    fn minimal_push_rules() {
        assert!(!is_minimal_push(&[5], 0x01));
        assert!(is_minimal_push(&[0x42], 0x01));
        assert!(!is_minimal_push(&[0x42; 10], OP_PUSHDATA1));
        assert!(is_minimal_push(&[0x42; 80], OP_PUSHDATA1));
    }
}
