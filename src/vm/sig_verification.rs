// Copyright (c) 2022 Octavian Oncescu
// Copyright (c) 2022-2024 The Membercoin Core developers
// Licensed under the Apache License, Version 2.0 see LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0 or the MIT license, see
// LICENSE-MIT or http://opensource.org/licenses/MIT

//! Raw signature verification.
//!
//! Transaction signatures are either strict-DER ECDSA or 64-byte Schnorr,
//! both over secp256k1 and distinguished by length. Public keys are the
//! usual 33-byte compressed or 65-byte uncompressed encodings; the Schnorr
//! path drops the parity byte and verifies against the x-only key.

use lazy_static::lazy_static;
use secp256k1::{ecdsa, schnorr, Message, PublicKey, Secp256k1, VerifyOnly, XOnlyPublicKey};

/// Length of a Schnorr transaction signature, sans hash type
pub const SCHNORR_SIG_LEN: usize = 64;

lazy_static! {
    static ref VERIFY_CTX: Secp256k1<VerifyOnly> = Secp256k1::verification_only();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigVerificationErr {
    InvalidSignature,
    InvalidPublicKey,
    InvalidMessage,
}

/// Compressed or uncompressed SEC1 encoding.
#[must_use]
pub fn is_pubkey_encoding(pubkey: &[u8]) -> bool {
    match pubkey.len() {
        33 => matches!(pubkey[0], 0x02 | 0x03),
        65 => pubkey[0] == 0x04,
        _ => false,
    }
}

/// Strict DER (BIP66) structural check over a signature without its hash
/// type byte. An empty signature is valid encoding (it just never verifies).
#[must_use]
pub fn is_der_encoding(sig: &[u8]) -> bool {
    if sig.is_empty() {
        return true;
    }
    if sig.len() < 8 || sig.len() > 72 {
        return false;
    }
    if sig[0] != 0x30 || usize::from(sig[1]) != sig.len() - 2 {
        return false;
    }

    let len_r = usize::from(sig[3]);
    if 5 + len_r >= sig.len() {
        return false;
    }
    let len_s = usize::from(sig[5 + len_r]);
    if len_r + len_s + 6 != sig.len() {
        return false;
    }

    if sig[2] != 0x02 || len_r == 0 {
        return false;
    }
    if sig[4] & 0x80 != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0 && sig[5] & 0x80 == 0 {
        return false;
    }

    if sig[4 + len_r] != 0x02 || len_s == 0 {
        return false;
    }
    if sig[6 + len_r] & 0x80 != 0 {
        return false;
    }
    if len_s > 1 && sig[6 + len_r] == 0 && sig[7 + len_r] & 0x80 == 0 {
        return false;
    }

    true
}

/// Low-S check on a DER signature: the normalized form must equal the input.
#[must_use]
pub fn is_low_der_signature(sig: &[u8]) -> bool {
    let Ok(parsed) = ecdsa::Signature::from_der(sig) else {
        return false;
    };
    let mut normalized = parsed;
    normalized.normalize_s();
    normalized == parsed
}

/// A transaction signature is Schnorr iff its payload is exactly 64 bytes.
#[must_use]
pub fn is_schnorr_sig(sig: &[u8]) -> bool {
    sig.len() == SCHNORR_SIG_LEN
}

pub fn verify_ecdsa(
    msg32: &[u8; 32],
    sig_der: &[u8],
    pubkey: &[u8],
) -> Result<(), SigVerificationErr> {
    let message =
        Message::from_digest_slice(msg32).map_err(|_| SigVerificationErr::InvalidMessage)?;
    let mut sig =
        ecdsa::Signature::from_der(sig_der).map_err(|_| SigVerificationErr::InvalidSignature)?;
    let pubkey =
        PublicKey::from_slice(pubkey).map_err(|_| SigVerificationErr::InvalidPublicKey)?;
    sig.normalize_s();
    VERIFY_CTX
        .verify_ecdsa(&message, &sig, &pubkey)
        .map_err(|_| SigVerificationErr::InvalidSignature)
}

pub fn verify_schnorr(
    msg32: &[u8; 32],
    sig: &[u8],
    pubkey: &[u8],
) -> Result<(), SigVerificationErr> {
    if !is_pubkey_encoding(pubkey) || pubkey.len() != 33 {
        return Err(SigVerificationErr::InvalidPublicKey);
    }
    let message =
        Message::from_digest_slice(msg32).map_err(|_| SigVerificationErr::InvalidMessage)?;
    let sig =
        schnorr::Signature::from_slice(sig).map_err(|_| SigVerificationErr::InvalidSignature)?;
    let xonly = XOnlyPublicKey::from_slice(&pubkey[1..])
        .map_err(|_| SigVerificationErr::InvalidPublicKey)?;
    VERIFY_CTX
        .verify_schnorr(&sig, &message, &xonly)
        .map_err(|_| SigVerificationErr::InvalidSignature)
}

/// Dispatch on signature shape.
pub fn verify_tx_signature(
    msg32: &[u8; 32],
    sig: &[u8],
    pubkey: &[u8],
) -> Result<(), SigVerificationErr> {
    if is_schnorr_sig(sig) {
        verify_schnorr(msg32, sig, pubkey)
    } else {
        verify_ecdsa(msg32, sig, pubkey)
    }
}
