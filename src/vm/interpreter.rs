// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! The script interpreter.
//!
//! A stack machine over byte-vector elements. Execution never panics on
//! input: every failure mode collapses into a `false` verdict with an error
//! tag, and the host decides whether that is a consensus or policy event.
//! Executed signature verifications are counted separately from static
//! sigops and reported back through [`ScriptMetrics`].

use crate::consensus::{Money, LOCKTIME_THRESHOLD, SEQUENCE_FINAL};
use crate::primitives::{sha256d, Transaction};
use crate::vm::opcodes::*;
use crate::vm::script::{
    scriptnum_serialize, Instruction, Script, MAX_OPS_PER_SCRIPT, MAX_PUBKEYS_PER_MULTISIG,
    MAX_SCRIPT_ELEMENT_SIZE, MAX_SCRIPT_SIZE,
};
use crate::vm::sighash::{has_forkid, is_defined_hash_type, signature_hash};
use crate::vm::sig_verification::{
    is_der_encoding, is_low_der_signature, is_pubkey_encoding, is_schnorr_sig, verify_ecdsa,
    verify_tx_signature,
};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Combined stack + altstack depth limit
pub const MAX_STACK_SIZE: usize = 1000;

/// Maximum value size for numeric operands
pub const MAX_SCRIPTNUM_SIZE: usize = 4;

pub const SCRIPT_VERIFY_NONE: u32 = 0;
/// Evaluate P2SH subscripts
pub const SCRIPT_VERIFY_P2SH: u32 = 1 << 0;
/// Enforce strict signature and pubkey encodings and defined hash types
pub const SCRIPT_VERIFY_STRICTENC: u32 = 1 << 1;
/// Reject high-S ECDSA signatures
pub const SCRIPT_VERIFY_LOW_S: u32 = 1 << 2;
/// A failed signature check must have been given a null signature
pub const SCRIPT_VERIFY_NULLFAIL: u32 = 1 << 3;
/// Signatures commit to the forkid and the spent amount
pub const SCRIPT_ENABLE_SIGHASH_FORKID: u32 = 1 << 4;
/// The unlocking script must be push-only
pub const SCRIPT_VERIFY_SIGPUSHONLY: u32 = 1 << 5;
/// Exactly one element must remain after evaluation
pub const SCRIPT_VERIFY_CLEANSTACK: u32 = 1 << 6;

/// Everything a block is validated with
pub const MANDATORY_SCRIPT_VERIFY_FLAGS: u32 = SCRIPT_VERIFY_P2SH
    | SCRIPT_VERIFY_STRICTENC
    | SCRIPT_VERIFY_LOW_S
    | SCRIPT_VERIFY_NULLFAIL
    | SCRIPT_ENABLE_SIGHASH_FORKID;

/// Mempool policy adds the stack hygiene rules
pub const STANDARD_SCRIPT_VERIFY_FLAGS: u32 =
    MANDATORY_SCRIPT_VERIFY_FLAGS | SCRIPT_VERIFY_SIGPUSHONLY | SCRIPT_VERIFY_CLEANSTACK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    Ok,
    EvalFalse,
    OpReturn,
    ScriptSize,
    PushSize,
    OpCount,
    StackSize,
    PubkeyCount,
    SigCount,
    Verify,
    EqualVerify,
    CheckSigVerify,
    CheckMultisigVerify,
    CheckDataSigVerify,
    NumEqualVerify,
    BadOpcode,
    DisabledOpcode,
    InvalidStackOperation,
    InvalidAltstackOperation,
    UnbalancedConditional,
    NegativeLocktime,
    UnsatisfiedLocktime,
    SigDer,
    SigHighS,
    SigHashType,
    SigNullFail,
    PubkeyType,
    SigPushOnly,
    CleanStack,
    MinimalNum,
    NumOverflow,
    DivByZero,
    TruncatedPush,
}

/// Per-evaluation accounting reported to the block/tx budgets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptMetrics {
    /// Executed signature verifications (May-2020 style accounting)
    pub sigchecks: u32,
}

/// Host context a signature check needs: the spending transaction, the input
/// being spent, and the interest-adjusted amount the signature commits to.
pub trait SignatureChecker {
    fn check_sig(&self, sig_with_type: &[u8], pubkey: &[u8], script_code: &Script, flags: u32)
        -> bool;
    fn check_data_sig(&self, sig: &[u8], message: &[u8], pubkey: &[u8]) -> bool;
    fn check_lock_time(&self, lock_time: i64) -> bool;
    fn check_sequence(&self, sequence: i64) -> bool;
}

/// Checker with no transaction context; every signature check fails. Used
/// for static analysis and tests.
pub struct NoSignatureChecker;

impl SignatureChecker for NoSignatureChecker {
    fn check_sig(&self, _: &[u8], _: &[u8], _: &Script, _: u32) -> bool {
        false
    }

    fn check_data_sig(&self, _: &[u8], _: &[u8], _: &[u8]) -> bool {
        false
    }

    fn check_lock_time(&self, _: i64) -> bool {
        false
    }

    fn check_sequence(&self, _: i64) -> bool {
        false
    }
}

pub struct TransactionSignatureChecker<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    /// Value of the spent coin with interest applied at validation height
    pub amount: Money,
}

impl SignatureChecker for TransactionSignatureChecker<'_> {
    fn check_sig(
        &self,
        sig_with_type: &[u8],
        pubkey: &[u8],
        script_code: &Script,
        flags: u32,
    ) -> bool {
        let Some((&hash_type_byte, sig)) = sig_with_type.split_last() else {
            return false;
        };
        let hash_type = u32::from(hash_type_byte);
        let forkid_enabled = flags & SCRIPT_ENABLE_SIGHASH_FORKID != 0;
        let digest = signature_hash(
            script_code,
            self.tx,
            self.input_index,
            hash_type,
            self.amount,
            forkid_enabled,
        );
        verify_tx_signature(&digest.0, sig, pubkey).is_ok()
    }

    fn check_data_sig(&self, sig: &[u8], message: &[u8], pubkey: &[u8]) -> bool {
        let digest = Sha256::digest(message);
        let mut msg32 = [0u8; 32];
        msg32.copy_from_slice(&digest);
        if is_schnorr_sig(sig) {
            verify_tx_signature(&msg32, sig, pubkey).is_ok()
        } else {
            verify_ecdsa(&msg32, sig, pubkey).is_ok()
        }
    }

    fn check_lock_time(&self, lock_time: i64) -> bool {
        let tx_lock = i64::from(self.tx.lock_time);
        let same_kind = (tx_lock < i64::from(LOCKTIME_THRESHOLD))
            == (lock_time < i64::from(LOCKTIME_THRESHOLD));
        if !same_kind || lock_time > tx_lock {
            return false;
        }
        self.tx.vin[self.input_index].sequence != SEQUENCE_FINAL
    }

    fn check_sequence(&self, sequence: i64) -> bool {
        const SEQUENCE_LOCKTIME_DISABLE_FLAG: i64 = 1 << 31;
        const SEQUENCE_LOCKTIME_TYPE_FLAG: i64 = 1 << 22;
        const SEQUENCE_LOCKTIME_MASK: i64 = 0x0000_ffff;

        let tx_sequence = i64::from(self.tx.vin[self.input_index].sequence);
        if self.tx.version < 2 {
            return false;
        }
        if tx_sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            return false;
        }

        let mask = SEQUENCE_LOCKTIME_TYPE_FLAG | SEQUENCE_LOCKTIME_MASK;
        let masked_tx = tx_sequence & mask;
        let masked_op = sequence & mask;
        let same_kind = (masked_tx < SEQUENCE_LOCKTIME_TYPE_FLAG)
            == (masked_op < SEQUENCE_LOCKTIME_TYPE_FLAG);
        same_kind && masked_op <= masked_tx
    }
}

fn cast_to_bool(element: &[u8]) -> bool {
    for (i, byte) in element.iter().enumerate() {
        if *byte != 0 {
            // Negative zero counts as false
            return !(i == element.len() - 1 && *byte == 0x80);
        }
    }
    false
}

/// Decode a numeric operand: minimal encoding, at most `max_size` bytes.
fn scriptnum_decode(element: &[u8], max_size: usize) -> Result<i64, ScriptError> {
    if element.len() > max_size {
        return Err(ScriptError::NumOverflow);
    }
    if let Some(&last) = element.last() {
        if last & 0x7f == 0 && (element.len() == 1 || element[element.len() - 2] & 0x80 == 0) {
            return Err(ScriptError::MinimalNum);
        }
    }

    let mut value: i64 = 0;
    for (i, byte) in element.iter().enumerate() {
        value |= i64::from(*byte) << (8 * i);
    }
    if let Some(&last) = element.last() {
        if last & 0x80 != 0 {
            value &= !(0x80i64 << (8 * (element.len() - 1)));
            value = -value;
        }
    }
    Ok(value)
}

struct CheckSigEncoding {
    flags: u32,
}

impl CheckSigEncoding {
    fn check(&self, sig_with_type: &[u8]) -> Result<(), ScriptError> {
        if sig_with_type.is_empty() {
            return Ok(());
        }
        let flags = self.flags;
        let (&hash_type_byte, sig) = sig_with_type.split_last().expect("non-empty");
        let hash_type = u32::from(hash_type_byte);

        if flags & SCRIPT_VERIFY_STRICTENC != 0 {
            if !is_defined_hash_type(hash_type) {
                return Err(ScriptError::SigHashType);
            }
            if flags & SCRIPT_ENABLE_SIGHASH_FORKID != 0 && !has_forkid(hash_type) {
                return Err(ScriptError::SigHashType);
            }
            if flags & SCRIPT_ENABLE_SIGHASH_FORKID == 0 && has_forkid(hash_type) {
                return Err(ScriptError::SigHashType);
            }
        }

        if is_schnorr_sig(sig) {
            return Ok(());
        }
        if flags & (SCRIPT_VERIFY_STRICTENC | SCRIPT_VERIFY_LOW_S) != 0 && !is_der_encoding(sig) {
            return Err(ScriptError::SigDer);
        }
        if flags & SCRIPT_VERIFY_LOW_S != 0 && !is_low_der_signature(sig) {
            return Err(ScriptError::SigHighS);
        }
        Ok(())
    }

    fn check_pubkey(&self, pubkey: &[u8]) -> Result<(), ScriptError> {
        if self.flags & SCRIPT_VERIFY_STRICTENC != 0 && !is_pubkey_encoding(pubkey) {
            return Err(ScriptError::PubkeyType);
        }
        Ok(())
    }
}

macro_rules! pop {
    ($stack:expr) => {
        $stack.pop().ok_or(ScriptError::InvalidStackOperation)?
    };
}

macro_rules! peek {
    ($stack:expr, $depth:expr) => {{
        let len = $stack.len();
        if len <= $depth {
            return Err(ScriptError::InvalidStackOperation);
        }
        &$stack[len - 1 - $depth]
    }};
}

/// Run one script over the given stack.
pub fn eval_script(
    stack: &mut Vec<Vec<u8>>,
    script: &Script,
    flags: u32,
    checker: &dyn SignatureChecker,
    metrics: &mut ScriptMetrics,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }

    let encoding = CheckSigEncoding { flags };
    let mut altstack: Vec<Vec<u8>> = Vec::new();
    let mut exec_stack: Vec<bool> = Vec::new();
    let mut op_count = 0usize;
    let mut code_separator = 0usize;

    let mut iter = script.instructions();
    loop {
        let Some(ins) = iter.next() else { break };
        let ins = ins.map_err(|_| ScriptError::TruncatedPush)?;
        let executing = exec_stack.iter().all(|b| *b);

        if let Instruction::Push(data) = ins {
            if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(ScriptError::PushSize);
            }
            if executing {
                stack.push(data.to_vec());
            }
            if stack.len() + altstack.len() > MAX_STACK_SIZE {
                return Err(ScriptError::StackSize);
            }
            continue;
        }

        let Instruction::Op(op) = ins else { unreachable!() };

        if op > OP_16 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }
        if is_disabled_opcode(op) {
            return Err(ScriptError::DisabledOpcode);
        }
        if matches!(op, OP_VERIF | OP_VERNOTIF) {
            return Err(ScriptError::BadOpcode);
        }

        if !executing && !matches!(op, OP_IF | OP_NOTIF | OP_ELSE | OP_ENDIF) {
            continue;
        }

        match op {
            OP_1NEGATE | OP_1..=OP_16 => {
                let n = decode_small_int(op).expect("small int opcode");
                stack.push(scriptnum_serialize(n));
            }

            OP_NOP | OP_NOP1 | OP_NOP4..=OP_NOP10 => {}

            OP_IF | OP_NOTIF => {
                let mut branch = false;
                if executing {
                    let top = pop!(stack);
                    branch = cast_to_bool(&top);
                    if op == OP_NOTIF {
                        branch = !branch;
                    }
                }
                exec_stack.push(branch);
            }

            OP_ELSE => {
                let top = exec_stack
                    .last_mut()
                    .ok_or(ScriptError::UnbalancedConditional)?;
                *top = !*top;
            }

            OP_ENDIF => {
                exec_stack
                    .pop()
                    .ok_or(ScriptError::UnbalancedConditional)?;
            }

            OP_VERIFY => {
                let top = pop!(stack);
                if !cast_to_bool(&top) {
                    return Err(ScriptError::Verify);
                }
            }

            OP_RETURN => return Err(ScriptError::OpReturn),

            OP_TOALTSTACK => altstack.push(pop!(stack)),
            OP_FROMALTSTACK => {
                stack.push(altstack.pop().ok_or(ScriptError::InvalidAltstackOperation)?);
            }

            OP_2DROP => {
                pop!(stack);
                pop!(stack);
            }
            OP_2DUP => {
                let a = peek!(stack, 1).clone();
                let b = peek!(stack, 0).clone();
                stack.push(a);
                stack.push(b);
            }
            OP_3DUP => {
                let a = peek!(stack, 2).clone();
                let b = peek!(stack, 1).clone();
                let c = peek!(stack, 0).clone();
                stack.push(a);
                stack.push(b);
                stack.push(c);
            }
            OP_2OVER => {
                let a = peek!(stack, 3).clone();
                let b = peek!(stack, 2).clone();
                stack.push(a);
                stack.push(b);
            }
            OP_2ROT => {
                if stack.len() < 6 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let len = stack.len();
                let items: Vec<Vec<u8>> = stack.drain(len - 6..len - 4).collect();
                stack.extend(items);
            }
            OP_2SWAP => {
                if stack.len() < 4 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let len = stack.len();
                stack.swap(len - 4, len - 2);
                stack.swap(len - 3, len - 1);
            }
            OP_IFDUP => {
                let top = peek!(stack, 0).clone();
                if cast_to_bool(&top) {
                    stack.push(top);
                }
            }
            OP_DEPTH => {
                let depth = stack.len() as i64;
                stack.push(scriptnum_serialize(depth));
            }
            OP_DROP => {
                pop!(stack);
            }
            OP_DUP => {
                let top = peek!(stack, 0).clone();
                stack.push(top);
            }
            OP_NIP => {
                if stack.len() < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let len = stack.len();
                stack.remove(len - 2);
            }
            OP_OVER => {
                let item = peek!(stack, 1).clone();
                stack.push(item);
            }
            OP_PICK | OP_ROLL => {
                let n = scriptnum_decode(&pop!(stack), MAX_SCRIPTNUM_SIZE)?;
                if n < 0 || n as usize >= stack.len() {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let idx = stack.len() - 1 - n as usize;
                if op == OP_ROLL {
                    let item = stack.remove(idx);
                    stack.push(item);
                } else {
                    let item = stack[idx].clone();
                    stack.push(item);
                }
            }
            OP_ROT => {
                if stack.len() < 3 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let len = stack.len();
                stack.swap(len - 3, len - 2);
                stack.swap(len - 2, len - 1);
            }
            OP_SWAP => {
                if stack.len() < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let len = stack.len();
                stack.swap(len - 2, len - 1);
            }
            OP_TUCK => {
                if stack.len() < 2 {
                    return Err(ScriptError::InvalidStackOperation);
                }
                let top = peek!(stack, 0).clone();
                let len = stack.len();
                stack.insert(len - 2, top);
            }

            OP_SIZE => {
                let size = peek!(stack, 0).len() as i64;
                stack.push(scriptnum_serialize(size));
            }

            OP_EQUAL | OP_EQUALVERIFY => {
                let b = pop!(stack);
                let a = pop!(stack);
                let equal = a == b;
                if op == OP_EQUALVERIFY {
                    if !equal {
                        return Err(ScriptError::EqualVerify);
                    }
                } else {
                    stack.push(vec![u8::from(equal)]);
                }
            }

            OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                let n = scriptnum_decode(&pop!(stack), MAX_SCRIPTNUM_SIZE)?;
                let result = match op {
                    OP_1ADD => n + 1,
                    OP_1SUB => n - 1,
                    OP_NEGATE => -n,
                    OP_ABS => n.abs(),
                    OP_NOT => i64::from(n == 0),
                    _ => i64::from(n != 0),
                };
                stack.push(scriptnum_serialize(result));
            }

            OP_ADD | OP_SUB | OP_DIV | OP_MOD | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL
            | OP_NUMEQUALVERIFY | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN
            | OP_LESSTHANOREQUAL | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                let b = scriptnum_decode(&pop!(stack), MAX_SCRIPTNUM_SIZE)?;
                let a = scriptnum_decode(&pop!(stack), MAX_SCRIPTNUM_SIZE)?;
                let result = match op {
                    OP_ADD => a + b,
                    OP_SUB => a - b,
                    OP_DIV => {
                        if b == 0 {
                            return Err(ScriptError::DivByZero);
                        }
                        a / b
                    }
                    OP_MOD => {
                        if b == 0 {
                            return Err(ScriptError::DivByZero);
                        }
                        a % b
                    }
                    OP_BOOLAND => i64::from(a != 0 && b != 0),
                    OP_BOOLOR => i64::from(a != 0 || b != 0),
                    OP_NUMEQUAL | OP_NUMEQUALVERIFY => i64::from(a == b),
                    OP_NUMNOTEQUAL => i64::from(a != b),
                    OP_LESSTHAN => i64::from(a < b),
                    OP_GREATERTHAN => i64::from(a > b),
                    OP_LESSTHANOREQUAL => i64::from(a <= b),
                    OP_GREATERTHANOREQUAL => i64::from(a >= b),
                    OP_MIN => a.min(b),
                    _ => a.max(b),
                };
                if op == OP_NUMEQUALVERIFY {
                    if result == 0 {
                        return Err(ScriptError::NumEqualVerify);
                    }
                } else {
                    stack.push(scriptnum_serialize(result));
                }
            }

            OP_WITHIN => {
                let max = scriptnum_decode(&pop!(stack), MAX_SCRIPTNUM_SIZE)?;
                let min = scriptnum_decode(&pop!(stack), MAX_SCRIPTNUM_SIZE)?;
                let x = scriptnum_decode(&pop!(stack), MAX_SCRIPTNUM_SIZE)?;
                stack.push(scriptnum_serialize(i64::from(x >= min && x < max)));
            }

            OP_RIPEMD160 => {
                let top = pop!(stack);
                stack.push(Ripemd160::digest(&top).to_vec());
            }
            OP_SHA256 => {
                let top = pop!(stack);
                stack.push(Sha256::digest(&top).to_vec());
            }
            OP_HASH160 => {
                let top = pop!(stack);
                let sha = Sha256::digest(&top);
                stack.push(Ripemd160::digest(sha).to_vec());
            }
            OP_HASH256 => {
                let top = pop!(stack);
                stack.push(sha256d(&top).0.to_vec());
            }

            OP_CODESEPARATOR => {
                code_separator = iter.pos();
            }

            OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                let pubkey = pop!(stack);
                let sig = pop!(stack);

                encoding.check(&sig)?;
                encoding.check_pubkey(&pubkey)?;

                let script_code = Script(script.as_bytes()[code_separator..].to_vec());
                let mut success = false;
                if !sig.is_empty() {
                    metrics.sigchecks += 1;
                    success = checker.check_sig(&sig, &pubkey, &script_code, flags);
                }
                if !success && flags & SCRIPT_VERIFY_NULLFAIL != 0 && !sig.is_empty() {
                    return Err(ScriptError::SigNullFail);
                }

                if op == OP_CHECKSIGVERIFY {
                    if !success {
                        return Err(ScriptError::CheckSigVerify);
                    }
                } else {
                    stack.push(vec![u8::from(success)]);
                }
            }

            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                let key_count = scriptnum_decode(&pop!(stack), MAX_SCRIPTNUM_SIZE)?;
                if key_count < 0 || key_count as usize > MAX_PUBKEYS_PER_MULTISIG {
                    return Err(ScriptError::PubkeyCount);
                }
                op_count += key_count as usize;
                if op_count > MAX_OPS_PER_SCRIPT {
                    return Err(ScriptError::OpCount);
                }

                let mut pubkeys = Vec::with_capacity(key_count as usize);
                for _ in 0..key_count {
                    pubkeys.push(pop!(stack));
                }
                let sig_count = scriptnum_decode(&pop!(stack), MAX_SCRIPTNUM_SIZE)?;
                if sig_count < 0 || sig_count > key_count {
                    return Err(ScriptError::SigCount);
                }
                let mut sigs = Vec::with_capacity(sig_count as usize);
                for _ in 0..sig_count {
                    sigs.push(pop!(stack));
                }
                // The historical extra element
                pop!(stack);

                for sig in &sigs {
                    encoding.check(sig)?;
                }

                let script_code = Script(script.as_bytes()[code_separator..].to_vec());
                let all_null = sigs.iter().all(Vec::is_empty);
                if !all_null {
                    metrics.sigchecks += key_count as u32;
                }

                let mut success = true;
                let mut sig_idx = 0usize;
                let mut key_idx = 0usize;
                while sig_idx < sigs.len() {
                    if key_idx >= pubkeys.len()
                        || sigs.len() - sig_idx > pubkeys.len() - key_idx
                    {
                        success = false;
                        break;
                    }
                    encoding.check_pubkey(&pubkeys[key_idx])?;
                    let ok = !sigs[sig_idx].is_empty()
                        && checker.check_sig(&sigs[sig_idx], &pubkeys[key_idx], &script_code, flags);
                    if ok {
                        sig_idx += 1;
                    }
                    key_idx += 1;
                }

                if !success && flags & SCRIPT_VERIFY_NULLFAIL != 0 && !all_null {
                    return Err(ScriptError::SigNullFail);
                }

                if op == OP_CHECKMULTISIGVERIFY {
                    if !success {
                        return Err(ScriptError::CheckMultisigVerify);
                    }
                } else {
                    stack.push(vec![u8::from(success)]);
                }
            }

            OP_CHECKDATASIG | OP_CHECKDATASIGVERIFY => {
                let pubkey = pop!(stack);
                let message = pop!(stack);
                let sig = pop!(stack);

                if !sig.is_empty() && flags & (SCRIPT_VERIFY_STRICTENC | SCRIPT_VERIFY_LOW_S) != 0
                {
                    if !is_schnorr_sig(&sig) && !is_der_encoding(&sig) {
                        return Err(ScriptError::SigDer);
                    }
                }
                encoding.check_pubkey(&pubkey)?;

                let mut success = false;
                if !sig.is_empty() {
                    metrics.sigchecks += 1;
                    success = checker.check_data_sig(&sig, &message, &pubkey);
                }
                if !success && flags & SCRIPT_VERIFY_NULLFAIL != 0 && !sig.is_empty() {
                    return Err(ScriptError::SigNullFail);
                }

                if op == OP_CHECKDATASIGVERIFY {
                    if !success {
                        return Err(ScriptError::CheckDataSigVerify);
                    }
                } else {
                    stack.push(vec![u8::from(success)]);
                }
            }

            OP_CHECKLOCKTIMEVERIFY => {
                let lock_time = scriptnum_decode(peek!(stack, 0), 5)?;
                if lock_time < 0 {
                    return Err(ScriptError::NegativeLocktime);
                }
                if !checker.check_lock_time(lock_time) {
                    return Err(ScriptError::UnsatisfiedLocktime);
                }
            }

            OP_CHECKSEQUENCEVERIFY => {
                let sequence = scriptnum_decode(peek!(stack, 0), 5)?;
                if sequence < 0 {
                    return Err(ScriptError::NegativeLocktime);
                }
                if sequence & (1 << 31) == 0 && !checker.check_sequence(sequence) {
                    return Err(ScriptError::UnsatisfiedLocktime);
                }
            }

            _ => return Err(ScriptError::BadOpcode),
        }

        if stack.len() + altstack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

/// Full spend evaluation: unlocking script, locking script, and the P2SH
/// subscript where applicable.
///
/// Returns the contract `(success, sigchecks, error)`; the error is
/// [`ScriptError::Ok`] on success. Never panics on any input.
#[must_use]
pub fn verify_script(
    script_sig: &Script,
    script_pubkey: &Script,
    flags: u32,
    checker: &dyn SignatureChecker,
) -> (bool, u32, ScriptError) {
    let mut metrics = ScriptMetrics::default();
    let result = verify_script_inner(script_sig, script_pubkey, flags, checker, &mut metrics);
    match result {
        Ok(()) => (true, metrics.sigchecks, ScriptError::Ok),
        Err(err) => (false, metrics.sigchecks, err),
    }
}

fn verify_script_inner(
    script_sig: &Script,
    script_pubkey: &Script,
    flags: u32,
    checker: &dyn SignatureChecker,
    metrics: &mut ScriptMetrics,
) -> Result<(), ScriptError> {
    if flags & SCRIPT_VERIFY_SIGPUSHONLY != 0 && !script_sig.is_push_only() {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack: Vec<Vec<u8>> = Vec::new();
    eval_script(&mut stack, script_sig, flags, checker, metrics)?;
    let stack_after_sig = stack.clone();
    eval_script(&mut stack, script_pubkey, flags, checker, metrics)?;

    match stack.last() {
        Some(top) if cast_to_bool(top) => {}
        _ => return Err(ScriptError::EvalFalse),
    }

    if flags & SCRIPT_VERIFY_P2SH != 0 && script_pubkey.is_pay_to_script_hash() {
        if !script_sig.is_push_only() {
            return Err(ScriptError::SigPushOnly);
        }
        stack = stack_after_sig;
        // eval_script of script_sig pushed at least the redeem script,
        // otherwise the outer evaluation could not have succeeded
        let redeem = Script(stack.pop().ok_or(ScriptError::InvalidStackOperation)?);
        eval_script(&mut stack, &redeem, flags, checker, metrics)?;
        match stack.last() {
            Some(top) if cast_to_bool(top) => {}
            _ => return Err(ScriptError::EvalFalse),
        }
    }

    if flags & SCRIPT_VERIFY_CLEANSTACK != 0 {
        debug_assert!(flags & SCRIPT_VERIFY_P2SH != 0);
        if stack.len() != 1 {
            return Err(ScriptError::CleanStack);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::COIN;
    use crate::primitives::transaction::test_util::spend_tx;
    use crate::primitives::OutPoint;
    use crate::vm::sighash::{SIGHASH_ALL, SIGHASH_FORKID};
    use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

    fn run(script: Script) -> Result<Vec<Vec<u8>>, ScriptError> {
        let mut stack = Vec::new();
        let mut metrics = ScriptMetrics::default();
        eval_script(
            &mut stack,
            &script,
            SCRIPT_VERIFY_NONE,
            &NoSignatureChecker,
            &mut metrics,
        )
        .map(|()| stack)
    }

    fn script(bytes: &[u8]) -> Script {
        Script(bytes.to_vec())
    }

    #[test]
    fn arithmetic_and_comparison() {
        let stack = run(script(&[OP_2, OP_3, OP_ADD])).unwrap();
        assert_eq!(stack, vec![vec![5]]);

        let stack = run(script(&[OP_5, OP_3, OP_SUB])).unwrap();
        assert_eq!(stack, vec![vec![2]]);

        let stack = run(script(&[OP_10, OP_3, OP_DIV])).unwrap();
        assert_eq!(stack, vec![vec![3]]);

        let stack = run(script(&[OP_10, OP_3, OP_MOD])).unwrap();
        assert_eq!(stack, vec![vec![1]]);

        assert_eq!(run(script(&[OP_10, OP_0, OP_DIV])), Err(ScriptError::DivByZero));

        let stack = run(script(&[OP_2, OP_3, OP_LESSTHAN])).unwrap();
        assert_eq!(stack, vec![vec![1]]);

        let stack = run(script(&[OP_2, OP_1, OP_4, OP_WITHIN])).unwrap();
        assert_eq!(stack, vec![vec![1]]);
    }

    #[test]
    fn conditionals() {
        let stack = run(script(&[OP_1, OP_IF, OP_2, OP_ELSE, OP_3, OP_ENDIF])).unwrap();
        assert_eq!(stack, vec![vec![2]]);

        let stack = run(script(&[OP_0, OP_IF, OP_2, OP_ELSE, OP_3, OP_ENDIF])).unwrap();
        assert_eq!(stack, vec![vec![3]]);

        let stack = run(script(&[OP_0, OP_NOTIF, OP_2, OP_ENDIF])).unwrap();
        assert_eq!(stack, vec![vec![2]]);

        assert_eq!(
            run(script(&[OP_1, OP_IF, OP_2])),
            Err(ScriptError::UnbalancedConditional)
        );
        assert_eq!(run(script(&[OP_ENDIF])), Err(ScriptError::UnbalancedConditional));
    }

    #[test]
    fn unexecuted_branches_skip_ops_but_not_disabled_ones() {
        let stack = run(script(&[OP_0, OP_IF, OP_VERIFY, OP_ENDIF, OP_7])).unwrap();
        assert_eq!(stack, vec![vec![7]]);

        assert_eq!(
            run(script(&[OP_0, OP_IF, OP_CAT, OP_ENDIF])),
            Err(ScriptError::DisabledOpcode)
        );
    }

    #[test]
    fn stack_manipulation() {
        let stack = run(script(&[OP_1, OP_2, OP_SWAP])).unwrap();
        assert_eq!(stack, vec![vec![2], vec![1]]);

        let stack = run(script(&[OP_1, OP_2, OP_OVER])).unwrap();
        assert_eq!(stack, vec![vec![1], vec![2], vec![1]]);

        let stack = run(script(&[OP_1, OP_2, OP_3, OP_ROT])).unwrap();
        assert_eq!(stack, vec![vec![2], vec![3], vec![1]]);

        let stack = run(script(&[OP_1, OP_2, OP_TUCK])).unwrap();
        assert_eq!(stack, vec![vec![2], vec![1], vec![2]]);

        let stack = run(script(&[OP_1, OP_2, OP_3, OP_2, OP_PICK])).unwrap();
        assert_eq!(stack, vec![vec![1], vec![2], vec![3], vec![1]]);

        let stack = run(script(&[OP_1, OP_2, OP_3, OP_2, OP_ROLL])).unwrap();
        assert_eq!(stack, vec![vec![2], vec![3], vec![1]]);

        let stack = run(script(&[OP_1, OP_TOALTSTACK, OP_2, OP_FROMALTSTACK])).unwrap();
        assert_eq!(stack, vec![vec![2], vec![1]]);

        assert_eq!(run(script(&[OP_DROP])), Err(ScriptError::InvalidStackOperation));
        assert_eq!(
            run(script(&[OP_FROMALTSTACK])),
            Err(ScriptError::InvalidAltstackOperation)
        );
    }

    #[test]
    fn hashing_opcodes() {
        let mut s = Script::new();
        s.push_slice(b"");
        s.push_opcode(OP_SHA256);
        let stack = run(s).unwrap();
        assert_eq!(
            hex::encode(&stack[0]),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );

        let mut s = Script::new();
        s.push_slice(b"");
        s.push_opcode(OP_HASH160);
        let stack = run(s).unwrap();
        assert_eq!(
            hex::encode(&stack[0]),
            "b472a266d0bd89c13706a4132ccfb16f7c3b9fcb"
        );
    }

    #[test]
    fn op_return_fails_evaluation() {
        assert_eq!(run(script(&[OP_1, OP_RETURN])), Err(ScriptError::OpReturn));
    }

    #[test]
    fn op_count_limit() {
        let bytes = vec![OP_NOP; MAX_OPS_PER_SCRIPT + 1];
        assert_eq!(run(Script(bytes)), Err(ScriptError::OpCount));
        let bytes = vec![OP_NOP; MAX_OPS_PER_SCRIPT];
        assert!(run(Script(bytes)).is_ok());
    }

    #[test]
    fn push_size_limit() {
        let mut s = Script::new();
        s.push_slice(&vec![0u8; MAX_SCRIPT_ELEMENT_SIZE]);
        assert!(run(s).is_ok());

        let mut s = Script::new();
        s.push_slice(&vec![0u8; MAX_SCRIPT_ELEMENT_SIZE + 1]);
        assert_eq!(run(s), Err(ScriptError::PushSize));
    }

    #[test]
    fn minimal_number_enforced() {
        // 0x0100 is 1 with a redundant zero byte
        let mut s = Script::new();
        s.push_slice(&[0x01, 0x00]);
        s.push_opcode(OP_1ADD);
        assert_eq!(run(s), Err(ScriptError::MinimalNum));
    }

    fn p2sh_wrap(redeem: &Script) -> (Script, Script) {
        let sha = Sha256::digest(redeem.as_bytes());
        let hash = Ripemd160::digest(sha);
        let mut spk = Script::new();
        spk.push_opcode(OP_HASH160);
        spk.push_slice(&hash);
        spk.push_opcode(OP_EQUAL);

        let mut sig = Script::new();
        sig.push_slice(redeem.as_bytes());
        (sig, spk)
    }

    #[test]
    fn p2sh_spend_executes_redeem_script() {
        let redeem = script(&[OP_2, OP_3, OP_ADD, OP_5, OP_NUMEQUAL]);
        let (sig, spk) = p2sh_wrap(&redeem);

        let (ok, sigchecks, err) =
            verify_script(&sig, &spk, SCRIPT_VERIFY_P2SH, &NoSignatureChecker);
        assert!(ok, "{err:?}");
        assert_eq!(sigchecks, 0);
        assert_eq!(err, ScriptError::Ok);

        // Without the P2SH flag only the hash comparison runs
        let (ok, _, _) = verify_script(&sig, &spk, SCRIPT_VERIFY_NONE, &NoSignatureChecker);
        assert!(ok);
    }

    #[test]
    fn p2sh_failing_redeem_fails() {
        let redeem = script(&[OP_0]);
        let (sig, spk) = p2sh_wrap(&redeem);
        let (ok, _, err) = verify_script(&sig, &spk, SCRIPT_VERIFY_P2SH, &NoSignatureChecker);
        assert!(!ok);
        assert_eq!(err, ScriptError::EvalFalse);
    }

    #[test]
    fn cleanstack_rejects_leftovers() {
        let mut sig = Script::new();
        sig.push_opcode(OP_1);
        sig.push_opcode(OP_1);
        let spk = script(&[OP_NOP]);
        let flags = SCRIPT_VERIFY_P2SH | SCRIPT_VERIFY_CLEANSTACK;
        let (ok, _, err) = verify_script(&sig, &spk, flags, &NoSignatureChecker);
        assert!(!ok);
        assert_eq!(err, ScriptError::CleanStack);
    }

    fn signed_spend() -> (Transaction, Script, Vec<u8>, Vec<u8>) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x22; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk).serialize().to_vec();

        // P2PK-style locking script
        let mut spk = Script::new();
        spk.push_slice(&pk);
        spk.push_opcode(OP_CHECKSIG);

        let tx = spend_tx(OutPoint::new(sha256d(b"prev"), 0), COIN);
        let hash_type = SIGHASH_ALL | SIGHASH_FORKID;
        let digest = signature_hash(&spk, &tx, 0, hash_type, COIN, true);
        let message = Message::from_digest_slice(&digest.0).unwrap();
        let mut sig = secp.sign_ecdsa(&message, &sk).serialize_der().to_vec();
        sig.push(hash_type as u8);
        (tx, spk, sig, pk)
    }

    #[test]
    fn checksig_verifies_real_signature() {
        let (tx, spk, sig, _) = signed_spend();
        let checker = TransactionSignatureChecker {
            tx: &tx,
            input_index: 0,
            amount: COIN,
        };
        let mut script_sig = Script::new();
        script_sig.push_slice(&sig);

        let (ok, sigchecks, err) =
            verify_script(&script_sig, &spk, MANDATORY_SCRIPT_VERIFY_FLAGS, &checker);
        assert!(ok, "{err:?}");
        assert_eq!(sigchecks, 1);
    }

    #[test]
    fn checksig_rejects_wrong_amount_commitment() {
        // The FORKID digest commits to the interest-adjusted amount; a
        // checker with a different amount must fail the signature.
        let (tx, spk, sig, _) = signed_spend();
        let checker = TransactionSignatureChecker {
            tx: &tx,
            input_index: 0,
            amount: COIN + 1,
        };
        let mut script_sig = Script::new();
        script_sig.push_slice(&sig);

        let (ok, _, err) = verify_script(
            &script_sig,
            &spk,
            MANDATORY_SCRIPT_VERIFY_FLAGS & !SCRIPT_VERIFY_NULLFAIL,
            &checker,
        );
        assert!(!ok);
        assert_eq!(err, ScriptError::EvalFalse);
    }

    #[test]
    fn nullfail_turns_bad_signature_into_error() {
        let (tx, spk, sig, _) = signed_spend();
        let checker = TransactionSignatureChecker {
            tx: &tx,
            input_index: 0,
            amount: COIN + 1,
        };
        let mut script_sig = Script::new();
        script_sig.push_slice(&sig);

        let (ok, _, err) =
            verify_script(&script_sig, &spk, MANDATORY_SCRIPT_VERIFY_FLAGS, &checker);
        assert!(!ok);
        assert_eq!(err, ScriptError::SigNullFail);
    }

    #[test]
    fn null_signature_is_clean_false() {
        let (tx, spk, _, _) = signed_spend();
        let checker = TransactionSignatureChecker {
            tx: &tx,
            input_index: 0,
            amount: COIN,
        };
        let mut script_sig = Script::new();
        script_sig.push_slice(&[]);

        let (ok, sigchecks, err) =
            verify_script(&script_sig, &spk, MANDATORY_SCRIPT_VERIFY_FLAGS, &checker);
        assert!(!ok);
        assert_eq!(sigchecks, 0);
        assert_eq!(err, ScriptError::EvalFalse);
    }

    #[test]
    fn strictenc_rejects_missing_forkid_bit() {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x22; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk).serialize().to_vec();
        let mut spk = Script::new();
        spk.push_slice(&pk);
        spk.push_opcode(OP_CHECKSIG);

        let tx = spend_tx(OutPoint::new(sha256d(b"prev"), 0), COIN);
        let digest = signature_hash(&spk, &tx, 0, SIGHASH_ALL, COIN, true);
        let message = Message::from_digest_slice(&digest.0).unwrap();
        let mut sig = secp.sign_ecdsa(&message, &sk).serialize_der().to_vec();
        sig.push(SIGHASH_ALL as u8);

        let checker = TransactionSignatureChecker {
            tx: &tx,
            input_index: 0,
            amount: COIN,
        };
        let mut script_sig = Script::new();
        script_sig.push_slice(&sig);

        let (ok, _, err) =
            verify_script(&script_sig, &spk, MANDATORY_SCRIPT_VERIFY_FLAGS, &checker);
        assert!(!ok);
        assert_eq!(err, ScriptError::SigHashType);
    }

    #[test]
    fn checkdatasig_verifies_message() {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x33; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk).serialize().to_vec();

        let message_data = b"attestation";
        let digest = Sha256::digest(message_data);
        let mut msg32 = [0u8; 32];
        msg32.copy_from_slice(&digest);
        let message = Message::from_digest_slice(&msg32).unwrap();
        let sig = secp.sign_ecdsa(&message, &sk).serialize_der().to_vec();

        let tx = spend_tx(OutPoint::new(sha256d(b"prev"), 0), COIN);
        let checker = TransactionSignatureChecker {
            tx: &tx,
            input_index: 0,
            amount: COIN,
        };

        let mut script_sig = Script::new();
        script_sig.push_slice(&sig);
        script_sig.push_slice(message_data);
        let mut spk = Script::new();
        spk.push_slice(&pk);
        spk.push_opcode(OP_CHECKDATASIG);

        let (ok, sigchecks, err) =
            verify_script(&script_sig, &spk, MANDATORY_SCRIPT_VERIFY_FLAGS, &checker);
        assert!(ok, "{err:?}");
        assert_eq!(sigchecks, 1);
    }

    #[test]
    fn multisig_two_of_three() {
        let secp = Secp256k1::new();
        let keys: Vec<SecretKey> = [[0x41u8; 32], [0x42; 32], [0x43; 32]]
            .iter()
            .map(|b| SecretKey::from_slice(b).unwrap())
            .collect();
        let pubkeys: Vec<Vec<u8>> = keys
            .iter()
            .map(|sk| PublicKey::from_secret_key(&secp, sk).serialize().to_vec())
            .collect();

        let mut spk = Script::new();
        spk.push_opcode(OP_2);
        for pk in &pubkeys {
            spk.push_slice(pk);
        }
        spk.push_opcode(OP_3);
        spk.push_opcode(OP_CHECKMULTISIG);

        let tx = spend_tx(OutPoint::new(sha256d(b"prev"), 0), COIN);
        let hash_type = SIGHASH_ALL | SIGHASH_FORKID;
        let digest = signature_hash(&spk, &tx, 0, hash_type, COIN, true);
        let message = Message::from_digest_slice(&digest.0).unwrap();

        // Sign with keys 0 and 2, in pubkey order
        let mut script_sig = Script::new();
        script_sig.push_slice(&[]);
        for key_idx in [0usize, 2] {
            let mut sig = secp
                .sign_ecdsa(&message, &keys[key_idx])
                .serialize_der()
                .to_vec();
            sig.push(hash_type as u8);
            script_sig.push_slice(&sig);
        }

        let checker = TransactionSignatureChecker {
            tx: &tx,
            input_index: 0,
            amount: COIN,
        };
        let (ok, sigchecks, err) =
            verify_script(&script_sig, &spk, MANDATORY_SCRIPT_VERIFY_FLAGS, &checker);
        assert!(ok, "{err:?}");
        // Executed checks are charged per pubkey for a non-null multisig
        assert_eq!(sigchecks, 3);
    }

    #[test]
    fn multisig_out_of_order_sigs_fail() {
        let secp = Secp256k1::new();
        let keys: Vec<SecretKey> = [[0x41u8; 32], [0x42; 32], [0x43; 32]]
            .iter()
            .map(|b| SecretKey::from_slice(b).unwrap())
            .collect();
        let pubkeys: Vec<Vec<u8>> = keys
            .iter()
            .map(|sk| PublicKey::from_secret_key(&secp, sk).serialize().to_vec())
            .collect();

        let mut spk = Script::new();
        spk.push_opcode(OP_2);
        for pk in &pubkeys {
            spk.push_slice(pk);
        }
        spk.push_opcode(OP_3);
        spk.push_opcode(OP_CHECKMULTISIG);

        let tx = spend_tx(OutPoint::new(sha256d(b"prev"), 0), COIN);
        let hash_type = SIGHASH_ALL | SIGHASH_FORKID;
        let digest = signature_hash(&spk, &tx, 0, hash_type, COIN, true);
        let message = Message::from_digest_slice(&digest.0).unwrap();

        let mut script_sig = Script::new();
        script_sig.push_slice(&[]);
        for key_idx in [2usize, 0] {
            let mut sig = secp
                .sign_ecdsa(&message, &keys[key_idx])
                .serialize_der()
                .to_vec();
            sig.push(hash_type as u8);
            script_sig.push_slice(&sig);
        }

        let checker = TransactionSignatureChecker {
            tx: &tx,
            input_index: 0,
            amount: COIN,
        };
        let (ok, _, _) = verify_script(
            &script_sig,
            &spk,
            MANDATORY_SCRIPT_VERIFY_FLAGS & !SCRIPT_VERIFY_NULLFAIL,
            &checker,
        );
        assert!(!ok);
    }
}
