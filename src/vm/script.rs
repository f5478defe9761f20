// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

use crate::codec::{Decodable, DecodeError, Encodable, Reader};
use crate::vm::opcodes::*;
use bincode::{Decode, Encode};
use std::fmt;

/// Maximum serialized script size in bytes
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum size of a single stack element
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Maximum non-push opcodes executed per script
pub const MAX_OPS_PER_SCRIPT: usize = 201;

/// Maximum keys in a CHECKMULTISIG
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

/// A serialized script: raw opcode bytes. On the wire it is a byte vector
/// with a compact-size prefix.
#[derive(Clone, PartialEq, Eq, Hash, Default, Encode, Decode)]
pub struct Script(pub Vec<u8>);

/// One parsed script instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction<'a> {
    /// A data push, including empty pushes and the small-int opcodes' raw form
    Push(&'a [u8]),
    /// A non-push opcode byte
    Op(u8),
}

impl Script {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a data push with the shortest possible push prefix
    pub fn push_slice(&mut self, data: &[u8]) {
        match data.len() {
            0 => self.0.push(OP_0),
            1 if data[0] == 0x81 => self.0.push(OP_1NEGATE),
            1 if (1..=16).contains(&data[0]) => self.0.push(OP_1 + data[0] - 1),
            len @ 1..=0x4b => {
                self.0.push(len as u8);
                self.0.extend_from_slice(data);
            }
            len @ ..=0xff => {
                self.0.push(OP_PUSHDATA1);
                self.0.push(len as u8);
                self.0.extend_from_slice(data);
            }
            len @ ..=0xffff => {
                self.0.push(OP_PUSHDATA2);
                self.0.extend_from_slice(&(len as u16).to_le_bytes());
                self.0.extend_from_slice(data);
            }
            len => {
                self.0.push(OP_PUSHDATA4);
                self.0.extend_from_slice(&(len as u32).to_le_bytes());
                self.0.extend_from_slice(data);
            }
        }
    }

    /// Append a minimally-encoded integer push
    pub fn push_int(&mut self, n: i64) {
        if let Some(op) = encode_small_int(n) {
            self.0.push(op);
        } else {
            self.push_slice(&scriptnum_serialize(n));
        }
    }

    pub fn push_opcode(&mut self, op: u8) {
        self.0.push(op);
    }

    /// Iterate instructions. Yields an error entry for a push whose
    /// announced length runs past the end of the script.
    pub fn instructions(&self) -> InstructionIter<'_> {
        InstructionIter {
            bytes: &self.0,
            pos: 0,
        }
    }

    /// `OP_HASH160 <20 bytes> OP_EQUAL`
    #[must_use]
    pub fn is_pay_to_script_hash(&self) -> bool {
        self.0.len() == 23
            && self.0[0] == OP_HASH160
            && self.0[1] == 0x14
            && self.0[22] == OP_EQUAL
    }

    /// Provably unspendable: leading OP_RETURN or over the size cap
    #[must_use]
    pub fn is_unspendable(&self) -> bool {
        (!self.0.is_empty() && self.0[0] == OP_RETURN) || self.0.len() > MAX_SCRIPT_SIZE
    }

    /// True if every instruction is a push
    #[must_use]
    pub fn is_push_only(&self) -> bool {
        for ins in self.instructions() {
            match ins {
                Ok(Instruction::Push(_)) => {}
                Ok(Instruction::Op(op)) if op <= OP_16 => {}
                _ => return false,
            }
        }
        true
    }

    /// Count signature operations. With `accurate`, CHECKMULTISIG preceded
    /// by a small-int key count charges that count; otherwise the full 20.
    #[must_use]
    pub fn sig_op_count(&self, accurate: bool) -> u64 {
        let mut count = 0u64;
        let mut last_op = OP_INVALIDOPCODE;
        for ins in self.instructions() {
            let Ok(ins) = ins else { break };
            match ins {
                Instruction::Op(op @ (OP_CHECKSIG | OP_CHECKSIGVERIFY)) => {
                    count += 1;
                    last_op = op;
                }
                Instruction::Op(op @ (OP_CHECKDATASIG | OP_CHECKDATASIGVERIFY)) => {
                    count += 1;
                    last_op = op;
                }
                Instruction::Op(op @ (OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY)) => {
                    if accurate && (OP_1..=OP_16).contains(&last_op) {
                        count += u64::from(last_op - OP_1 + 1);
                    } else {
                        count += MAX_PUBKEYS_PER_MULTISIG as u64;
                    }
                    last_op = op;
                }
                Instruction::Op(op) => last_op = op,
                Instruction::Push(_) => last_op = OP_0,
            }
        }
        count
    }

    /// Sigops charged to a spend of a P2SH output: counted accurately over
    /// the redeem script (the last push of the unlocking script).
    #[must_use]
    pub fn p2sh_sig_op_count(&self, script_sig: &Script) -> u64 {
        if !self.is_pay_to_script_hash() {
            return self.sig_op_count(true);
        }
        if !script_sig.is_push_only() {
            return 0;
        }
        let mut redeem: &[u8] = &[];
        for ins in script_sig.instructions().flatten() {
            match ins {
                Instruction::Push(data) => redeem = data,
                Instruction::Op(_) => return 0,
            }
        }
        Script(redeem.to_vec()).sig_op_count(true)
    }
}

pub struct InstructionIter<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> InstructionIter<'a> {
    /// Byte offset of the next instruction. Lets the interpreter remember
    /// where the last OP_CODESEPARATOR ended for signature hashing.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for InstructionIter<'a> {
    type Item = Result<Instruction<'a>, ScriptParseErr>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let op = self.bytes[self.pos];
        self.pos += 1;

        let push_len = match op {
            0x01..=0x4b => usize::from(op),
            OP_PUSHDATA1 => {
                let Some(&len) = self.bytes.get(self.pos) else {
                    self.pos = self.bytes.len();
                    return Some(Err(ScriptParseErr::TruncatedPush));
                };
                self.pos += 1;
                usize::from(len)
            }
            OP_PUSHDATA2 => {
                let Some(b) = self.bytes.get(self.pos..self.pos + 2) else {
                    self.pos = self.bytes.len();
                    return Some(Err(ScriptParseErr::TruncatedPush));
                };
                self.pos += 2;
                usize::from(u16::from_le_bytes([b[0], b[1]]))
            }
            OP_PUSHDATA4 => {
                let Some(b) = self.bytes.get(self.pos..self.pos + 4) else {
                    self.pos = self.bytes.len();
                    return Some(Err(ScriptParseErr::TruncatedPush));
                };
                self.pos += 4;
                u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
            }
            OP_0 => return Some(Ok(Instruction::Push(&[]))),
            other => return Some(Ok(Instruction::Op(other))),
        };

        let Some(data) = self.bytes.get(self.pos..self.pos + push_len) else {
            self.pos = self.bytes.len();
            return Some(Err(ScriptParseErr::TruncatedPush));
        };
        self.pos += push_len;
        Some(Ok(Instruction::Push(data)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptParseErr {
    TruncatedPush,
}

/// Serialize an integer in the script number format: little-endian,
/// sign-magnitude, minimal length.
#[must_use]
pub fn scriptnum_serialize(value: i64) -> Vec<u8> {
    if value == 0 {
        return vec![];
    }

    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::with_capacity(9);
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }

    // If the high bit of the top byte is set, an extra byte carries the sign;
    // otherwise the sign lives in the top byte itself.
    let last = *out.last().expect("non-zero value");
    if last & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0 });
    } else if negative {
        *out.last_mut().expect("non-zero value") |= 0x80;
    }
    out
}

impl Encodable for Script {
    fn consensus_encode(&self, w: &mut Vec<u8>) {
        self.0.consensus_encode(w);
    }

    fn encoded_size(&self) -> usize {
        self.0.encoded_size()
    }
}

impl Decodable for Script {
    fn consensus_decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self(Vec::<u8>::consensus_decode(r)?))
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Script").field(&hex::encode(&self.0)).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_slice_prefixes() {
        let mut s = Script::new();
        s.push_slice(&[0xaa; 5]);
        assert_eq!(s.0[0], 5);

        let mut s = Script::new();
        s.push_slice(&[0xaa; 0x60]);
        assert_eq!(s.0[0], OP_PUSHDATA1);
        assert_eq!(s.0[1], 0x60);

        let mut s = Script::new();
        s.push_slice(&[0xaa; 0x200]);
        assert_eq!(s.0[0], OP_PUSHDATA2);

        let mut s = Script::new();
        s.push_slice(&[]);
        assert_eq!(s.0, vec![OP_0]);
    }

    #[test]
    fn instruction_iter_roundtrip() {
        let mut s = Script::new();
        s.push_opcode(OP_DUP);
        s.push_slice(&[1, 2, 3]);
        s.push_opcode(OP_EQUALVERIFY);

        let ins: Vec<_> = s.instructions().collect::<Result<_, _>>().unwrap();
        assert_eq!(
            ins,
            vec![
                Instruction::Op(OP_DUP),
                Instruction::Push(&[1, 2, 3]),
                Instruction::Op(OP_EQUALVERIFY),
            ]
        );
    }

    #[test]
    fn truncated_push_surfaces_error() {
        let s = Script(vec![0x4b, 0x01]);
        let results: Vec<_> = s.instructions().collect();
        assert_eq!(results, vec![Err(ScriptParseErr::TruncatedPush)]);
    }

    #[test]
    fn p2sh_detection() {
        let mut s = Script::new();
        s.push_opcode(OP_HASH160);
        s.push_slice(&[0u8; 20]);
        s.push_opcode(OP_EQUAL);
        assert!(s.is_pay_to_script_hash());

        let mut not_p2sh = s.clone();
        not_p2sh.push_opcode(OP_NOP);
        assert!(!not_p2sh.is_pay_to_script_hash());
    }

    #[test]
    fn scriptnum_serialize_minimal() {
        assert_eq!(scriptnum_serialize(0), Vec::<u8>::new());
        assert_eq!(scriptnum_serialize(1), vec![1]);
        assert_eq!(scriptnum_serialize(-1), vec![0x81]);
        assert_eq!(scriptnum_serialize(127), vec![0x7f]);
        assert_eq!(scriptnum_serialize(128), vec![0x80, 0x00]);
        assert_eq!(scriptnum_serialize(-128), vec![0x80, 0x80]);
        assert_eq!(scriptnum_serialize(255), vec![0xff, 0x00]);
        assert_eq!(scriptnum_serialize(256), vec![0x00, 0x01]);
        assert_eq!(scriptnum_serialize(-256), vec![0x00, 0x81]);
    }

    #[test]
    fn sig_op_counting() {
        let mut s = Script::new();
        s.push_opcode(OP_CHECKSIG);
        s.push_opcode(OP_CHECKSIGVERIFY);
        assert_eq!(s.sig_op_count(false), 2);

        let mut multi = Script::new();
        multi.push_opcode(OP_2);
        multi.push_opcode(OP_CHECKMULTISIG);
        assert_eq!(multi.sig_op_count(true), 2);
        assert_eq!(multi.sig_op_count(false), MAX_PUBKEYS_PER_MULTISIG as u64);
    }

    #[test]
    fn p2sh_sigops_count_redeem_script() {
        let mut redeem = Script::new();
        redeem.push_opcode(OP_3);
        redeem.push_opcode(OP_CHECKMULTISIG);

        let mut spk = Script::new();
        spk.push_opcode(OP_HASH160);
        spk.push_slice(&[0u8; 20]);
        spk.push_opcode(OP_EQUAL);

        let mut sig = Script::new();
        sig.push_slice(redeem.as_bytes());

        assert_eq!(spk.p2sh_sig_op_count(&sig), 3);
    }
}
