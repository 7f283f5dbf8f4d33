// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Digest primitives: hashing, HMAC, KDFa and context encryption

use aes::Aes128;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb_mode::{Decryptor, Encryptor};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;

use crate::constants::*;
use crate::error::{Result, TpmError};

/// Running hash for one of the supported digest algorithms
#[derive(Clone)]
pub enum HashState {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl HashState {
    pub fn start(alg: TpmAlgId) -> Result<Self> {
        let state = match alg {
            TpmAlgId::Sha1 => HashState::Sha1(Sha1::new()),
            TpmAlgId::Sha256 => HashState::Sha256(Sha256::new()),
            TpmAlgId::Sha384 => HashState::Sha384(Sha384::new()),
            TpmAlgId::Sha512 => HashState::Sha512(Sha512::new()),
            _ => return Err(TpmError::Hash),
        };
        Ok(state)
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            HashState::Sha1(h) => h.update(data),
            HashState::Sha256(h) => h.update(data),
            HashState::Sha384(h) => h.update(data),
            HashState::Sha512(h) => h.update(data),
        }
    }

    pub fn update_u32(&mut self, v: u32) {
        self.update(&v.to_be_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        match self {
            HashState::Sha1(h) => h.finalize().to_vec(),
            HashState::Sha256(h) => h.finalize().to_vec(),
            HashState::Sha384(h) => h.finalize().to_vec(),
            HashState::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// One-shot hash over concatenated parts
pub fn hash(alg: TpmAlgId, parts: &[&[u8]]) -> Result<Vec<u8>> {
    let mut state = HashState::start(alg)?;
    for part in parts {
        state.update(part);
    }
    Ok(state.finish())
}

fn hmac_with<M: Mac + hmac::digest::KeyInit>(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(key)
        .map_err(|_| TpmError::Failure("HMAC key rejected".into()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

/// One-shot HMAC over concatenated parts
pub fn hmac(alg: TpmAlgId, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    match alg {
        TpmAlgId::Sha1 => hmac_with::<Hmac<Sha1>>(key, parts),
        TpmAlgId::Sha256 => hmac_with::<Hmac<Sha256>>(key, parts),
        TpmAlgId::Sha384 => hmac_with::<Hmac<Sha384>>(key, parts),
        TpmAlgId::Sha512 => hmac_with::<Hmac<Sha512>>(key, parts),
        _ => Err(TpmError::Hash),
    }
}

/// Constant-time HMAC check
pub fn hmac_verify(alg: TpmAlgId, key: &[u8], parts: &[&[u8]], expected: &[u8]) -> Result<bool> {
    let computed = hmac(alg, key, parts)?;
    Ok(ct_eq(&computed, expected))
}

/// Constant-time equality; unequal lengths compare unequal
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// SP800-108 counter-mode KDF with HMAC (KDFa)
///
/// Each block is `HMAC(key, i || label || 0x00 || context_u || context_v || bits)`.
pub fn kdfa(
    alg: TpmAlgId,
    key: &[u8],
    label: &[u8],
    context_u: &[u8],
    context_v: &[u8],
    bits: u32,
) -> Result<Vec<u8>> {
    if !alg.is_hash() {
        return Err(TpmError::Hash);
    }
    let bytes = bits.div_ceil(8) as usize;
    let label = label.strip_suffix(&[0]).unwrap_or(label);
    let mut out = Vec::with_capacity(bytes + alg.digest_size());
    let mut counter: u32 = 0;
    while out.len() < bytes {
        counter += 1;
        let block = hmac(
            alg,
            key,
            &[
                &counter.to_be_bytes(),
                label,
                &[0u8],
                context_u,
                context_v,
                &bits.to_be_bytes(),
            ],
        )?;
        out.extend_from_slice(&block);
    }
    out.truncate(bytes);
    if bits % 8 != 0 {
        out[0] &= 0xFF >> (8 - bits % 8);
    }
    Ok(out)
}

/// Derive the AES-128 key and IV protecting a saved session context
fn context_key_iv(
    alg: TpmAlgId,
    proof: &[u8],
    sequence: u64,
    handle: u32,
) -> Result<([u8; CONTEXT_ENCRYPT_KEY_BYTES], [u8; CONTEXT_ENCRYPT_IV_BYTES])> {
    let bits = ((CONTEXT_ENCRYPT_KEY_BYTES + CONTEXT_ENCRYPT_IV_BYTES) * 8) as u32;
    let material = kdfa(
        alg,
        proof,
        CONTEXT_KEY_LABEL,
        &sequence.to_be_bytes(),
        &handle.to_be_bytes(),
        bits,
    )?;
    let mut key = [0u8; CONTEXT_ENCRYPT_KEY_BYTES];
    let mut iv = [0u8; CONTEXT_ENCRYPT_IV_BYTES];
    key.copy_from_slice(&material[..CONTEXT_ENCRYPT_KEY_BYTES]);
    iv.copy_from_slice(&material[CONTEXT_ENCRYPT_KEY_BYTES..]);
    Ok((key, iv))
}

pub fn encrypt_context(
    alg: TpmAlgId,
    proof: &[u8],
    sequence: u64,
    handle: u32,
    data: &mut [u8],
) -> Result<()> {
    let (key, iv) = context_key_iv(alg, proof, sequence, handle)?;
    Encryptor::<Aes128>::new(&key.into(), &iv.into()).encrypt(data);
    Ok(())
}

pub fn decrypt_context(
    alg: TpmAlgId,
    proof: &[u8],
    sequence: u64,
    handle: u32,
    data: &mut [u8],
) -> Result<()> {
    let (key, iv) = context_key_iv(alg, proof, sequence, handle)?;
    Decryptor::<Aes128>::new(&key.into(), &iv.into()).decrypt(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_sizes() {
        for alg in [
            TpmAlgId::Sha1,
            TpmAlgId::Sha256,
            TpmAlgId::Sha384,
            TpmAlgId::Sha512,
        ] {
            assert_eq!(hash(alg, &[b"abc"]).unwrap().len(), alg.digest_size());
        }
        assert_eq!(hash(TpmAlgId::Aes, &[]), Err(TpmError::Hash));
    }

    #[test]
    fn test_sha256_known_answer() {
        let d = hash(TpmAlgId::Sha256, &[b"a", b"bc"]).unwrap();
        assert_eq!(
            hex::encode(d),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hmac_rfc4231_case2() {
        let mac = hmac(
            TpmAlgId::Sha256,
            b"Jefe",
            &[b"what do ya want ", b"for nothing?"],
        )
        .unwrap();
        assert_eq!(
            hex::encode(&mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
        assert!(hmac_verify(
            TpmAlgId::Sha256,
            b"Jefe",
            &[b"what do ya want for nothing?"],
            &mac
        )
        .unwrap());
    }

    #[test]
    fn test_kdfa_length_and_label_terminator() {
        let a = kdfa(TpmAlgId::Sha256, b"key", b"ATH", b"u", b"v", 256).unwrap();
        let b = kdfa(TpmAlgId::Sha256, b"key", b"ATH\0", b"u", b"v", 256).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        let long = kdfa(TpmAlgId::Sha256, b"key", b"ATH", b"u", b"v", 512).unwrap();
        assert_eq!(long.len(), 64);
        let odd = kdfa(TpmAlgId::Sha256, b"key", b"ATH", b"u", b"v", 12).unwrap();
        assert_eq!(odd.len(), 2);
        assert_eq!(odd[0] & 0xF0, 0);
    }

    #[test]
    fn test_context_encryption_reverses() {
        let mut data = b"session state bytes".to_vec();
        encrypt_context(TpmAlgId::Sha256, b"proof", 7, 0x0200_0001, &mut data).unwrap();
        assert_ne!(&data[..], b"session state bytes");
        decrypt_context(TpmAlgId::Sha256, b"proof", 7, 0x0200_0001, &mut data).unwrap();
        assert_eq!(&data[..], b"session state bytes");
    }
}
