// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 data types used by sessions, policies and tickets

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::*;
use crate::error::{Result, TpmError};
use crate::marshal::*;

macro_rules! tpm2b {
    ($(#[$meta:meta])* $name:ident, $max:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name {
            #[serde(with = "serde_human_bytes")]
            pub buffer: Vec<u8>,
        }

        impl $name {
            /// Largest payload this buffer type accepts on the wire
            pub const MAX_SIZE: usize = $max;

            pub fn new(data: impl Into<Vec<u8>>) -> Self {
                Self {
                    buffer: data.into(),
                }
            }

            pub fn empty() -> Self {
                Self { buffer: Vec::new() }
            }

            pub fn len(&self) -> usize {
                self.buffer.len()
            }

            pub fn is_empty(&self) -> bool {
                self.buffer.is_empty()
            }

            pub fn as_slice(&self) -> &[u8] {
                &self.buffer
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.buffer
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(buffer: Vec<u8>) -> Self {
                Self { buffer }
            }
        }

        impl From<&[u8]> for $name {
            fn from(data: &[u8]) -> Self {
                Self {
                    buffer: data.to_vec(),
                }
            }
        }

        impl Marshal for $name {
            fn marshal(&self, buf: &mut CommandBuffer) {
                buf.put_tpm2b(&self.buffer);
            }
        }

        impl Unmarshal for $name {
            fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
                Ok(Self {
                    buffer: buf.get_tpm2b_bounded(Self::MAX_SIZE)?,
                })
            }
        }
    };
}

tpm2b!(
    /// TPM2B_DIGEST - Variable length digest
    Tpm2bDigest,
    MAX_DIGEST_SIZE
);
tpm2b!(
    /// TPM2B_NONCE - nonces and policy references
    Tpm2bNonce,
    MAX_DIGEST_SIZE
);
tpm2b!(
    /// TPM2B_NAME - entity name (hash algorithm id || digest for objects)
    Tpm2bName,
    MAX_NAME_SIZE
);
tpm2b!(
    /// TPM2B_OPERAND - comparison operand for NV and counter/timer checks
    Tpm2bOperand,
    MAX_DIGEST_SIZE
);
tpm2b!(
    /// TPM2B_ENCRYPTED_SECRET - decrypted salt input to session creation
    Tpm2bSalt,
    MAX_DIGEST_SIZE
);

impl Tpm2bDigest {
    /// All-zero digest of the size produced by `alg`
    pub fn zeroed(alg: TpmAlgId) -> Self {
        Self::new(vec![0u8; alg.digest_size()])
    }
}

impl Tpm2bName {
    /// Hash algorithm of a digest-form name, if the name is one
    pub fn digest_alg(&self) -> Option<TpmAlgId> {
        if self.buffer.len() < 2 {
            return None;
        }
        let alg = TpmAlgId::from_u16(u16::from_be_bytes([self.buffer[0], self.buffer[1]]))?;
        (alg.is_hash() && self.buffer.len() == 2 + alg.digest_size()).then_some(alg)
    }

    /// Name of a permanent or NV/session handle (the handle itself)
    pub fn from_handle(handle: u32) -> Self {
        Self::new(handle.to_be_bytes().to_vec())
    }
}

/// TPM2B_AUTH - entity authorization value, wiped on drop
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Tpm2bAuth {
    pub buffer: Vec<u8>,
}

impl Tpm2bAuth {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            buffer: data.into(),
        }
    }

    pub fn empty() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Auth values compare by content with trailing zeros removed
    pub fn trimmed(&self) -> &[u8] {
        let end = self
            .buffer
            .iter()
            .rposition(|b| *b != 0)
            .map_or(0, |i| i + 1);
        &self.buffer[..end]
    }
}

impl std::fmt::Debug for Tpm2bAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tpm2bAuth({} bytes)", self.buffer.len())
    }
}

/// Absolute expiration of a ticket or time-bound policy
///
/// On the wire this is a big-endian u64 whose top bit carries
/// `expires_on_reset`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AuthTimeout {
    pub absolute: u64,
    pub expires_on_reset: bool,
}

impl AuthTimeout {
    pub const WIRE_SIZE: usize = 8;

    pub fn new(absolute: u64, expires_on_reset: bool) -> Self {
        Self {
            absolute: absolute & !EXPIRATION_BIT,
            expires_on_reset,
        }
    }

    pub fn to_wire(self) -> u64 {
        let flag = if self.expires_on_reset {
            EXPIRATION_BIT
        } else {
            0
        };
        (self.absolute & !EXPIRATION_BIT) | flag
    }

    pub fn from_wire(v: u64) -> Self {
        Self {
            absolute: v & !EXPIRATION_BIT,
            expires_on_reset: v & EXPIRATION_BIT != 0,
        }
    }

    /// Encode as the opaque TPM2B_TIMEOUT payload handed to callers
    pub fn to_blob(self) -> Vec<u8> {
        self.to_wire().to_be_bytes().to_vec()
    }

    /// Decode a caller-supplied timeout payload
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let bytes: [u8; 8] = blob
            .try_into()
            .map_err(|_| TpmError::Size("timeout must be 8 bytes"))?;
        Ok(Self::from_wire(u64::from_be_bytes(bytes)))
    }
}

/// TPMT_TK_AUTH / TPMT_TK_VERIFIED
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtTicket {
    pub tag: TpmSt,
    pub hierarchy: u32,
    pub digest: Tpm2bDigest,
}

pub type TpmtTkAuth = TpmtTicket;
pub type TpmtTkVerified = TpmtTicket;

impl TpmtTicket {
    /// Ticket with an empty digest (the "null ticket")
    pub fn null(tag: TpmSt) -> Self {
        Self {
            tag,
            hierarchy: tpm_rh::NULL,
            digest: Tpm2bDigest::empty(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.hierarchy == tpm_rh::NULL && self.digest.is_empty()
    }
}

impl Marshal for TpmtTicket {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.tag.to_u16());
        buf.put_u32(self.hierarchy);
        self.digest.marshal(buf);
    }
}

impl Unmarshal for TpmtTicket {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let tag = TpmSt::from_u16(buf.get_u16()?).ok_or(TpmError::Ticket)?;
        let hierarchy = buf.get_u32()?;
        let digest = Tpm2bDigest::unmarshal(buf)?;
        Ok(Self {
            tag,
            hierarchy,
            digest,
        })
    }
}

/// TPMT_HA - algorithm-tagged digest, as stored in NV for PolicyAuthorizeNV
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtHa {
    pub hash_alg: TpmAlgId,
    pub digest: Vec<u8>,
}

impl Marshal for TpmtHa {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.hash_alg.to_u16());
        buf.put_bytes(&self.digest);
    }
}

impl Unmarshal for TpmtHa {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash_alg = TpmAlgId::from_u16(buf.get_u16()?)
            .filter(|a| a.is_hash())
            .ok_or(TpmError::Hash)?;
        let digest = buf.get_bytes(hash_alg.digest_size())?;
        Ok(Self { hash_alg, digest })
    }
}

/// TPMA_LOCALITY
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TpmaLocality(pub u8);

impl TpmaLocality {
    pub const ZERO: u8 = 1 << 0;
    pub const ONE: u8 = 1 << 1;
    pub const TWO: u8 = 1 << 2;
    pub const THREE: u8 = 1 << 3;
    pub const FOUR: u8 = 1 << 4;
    /// Mask of the bit-field (non-extended) localities
    pub const NORMAL_MASK: u8 = 0x1F;

    /// Values 32..=255 name a single extended locality
    pub fn is_extended(self) -> bool {
        self.0 >= 32
    }

    /// Whether a command issued at `locality` (0..=255) satisfies this lock
    pub fn permits(self, locality: u8) -> bool {
        if self.0 == 0 {
            return true;
        }
        if self.is_extended() {
            return self.0 == locality;
        }
        locality < 5 && self.0 & (1 << locality) != 0
    }
}

/// TPMS_TIME_INFO - time, clock and reset counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmsTimeInfo {
    pub time: u64,
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: bool,
}

impl TpmsTimeInfo {
    pub const WIRE_SIZE: usize = 25;
}

impl Marshal for TpmsTimeInfo {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u64(self.time);
        buf.put_u64(self.clock);
        buf.put_u32(self.reset_count);
        buf.put_u32(self.restart_count);
        buf.put_bool(self.safe);
    }
}

/// TPMT_SYM_DEF - parameter encryption settings for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }

    pub fn aes_128_cfb() -> Self {
        Self {
            algorithm: TpmAlgId::Aes,
            key_bits: 128,
            mode: TpmAlgId::Cfb,
        }
    }

    /// Only AES-CFB and XOR obfuscation are usable for parameter encryption
    pub fn validate(&self) -> Result<()> {
        match self.algorithm {
            TpmAlgId::Null => Ok(()),
            TpmAlgId::Aes if self.mode == TpmAlgId::Cfb => match self.key_bits {
                128 | 192 | 256 => Ok(()),
                _ => Err(TpmError::Value("unsupported AES key size")),
            },
            TpmAlgId::Aes => Err(TpmError::Mode),
            TpmAlgId::Xor if self.mode.is_hash() => Ok(()),
            TpmAlgId::Xor => Err(TpmError::Hash),
            _ => Err(TpmError::Value("unsupported symmetric algorithm")),
        }
    }
}

impl Default for TpmtSymDef {
    fn default() -> Self {
        Self::null()
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.algorithm.to_u16());
        if self.algorithm != TpmAlgId::Null {
            buf.put_u16(self.key_bits);
            buf.put_u16(self.mode.to_u16());
        }
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let algorithm = TpmAlgId::from_u16(buf.get_u16()?).ok_or(TpmError::Value("symmetric"))?;
        if algorithm == TpmAlgId::Null {
            return Ok(Self::null());
        }
        let key_bits = buf.get_u16()?;
        let mode = TpmAlgId::from_u16(buf.get_u16()?).ok_or(TpmError::Mode)?;
        Ok(Self {
            algorithm,
            key_bits,
            mode,
        })
    }
}

/// TPMT_SIGNATURE - a signature with its scheme and digest algorithm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpmtSignature {
    /// Signing scheme; the simulated platform understands `TPM_ALG_HMAC`
    #[serde(with = "alg_serde")]
    pub scheme: TpmAlgId,
    /// Digest algorithm the signer hashed with
    #[serde(with = "alg_serde")]
    pub hash_alg: TpmAlgId,
    #[serde(with = "serde_human_bytes")]
    pub signature: Vec<u8>,
}

/// Serialize algorithm ids by their lowercase mnemonic
pub(crate) mod alg_serde {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use crate::constants::TpmAlgId;

    pub fn name(alg: TpmAlgId) -> &'static str {
        match alg {
            TpmAlgId::Null => "null",
            TpmAlgId::Sha1 => "sha1",
            TpmAlgId::Hmac => "hmac",
            TpmAlgId::Sha256 => "sha256",
            TpmAlgId::Sha384 => "sha384",
            TpmAlgId::Sha512 => "sha512",
            TpmAlgId::Aes => "aes",
            TpmAlgId::Xor => "xor",
            TpmAlgId::Cfb => "cfb",
        }
    }

    pub fn parse(s: &str) -> Option<TpmAlgId> {
        let alg = match s.to_ascii_lowercase().as_str() {
            "null" => TpmAlgId::Null,
            "sha1" => TpmAlgId::Sha1,
            "hmac" => TpmAlgId::Hmac,
            "sha256" => TpmAlgId::Sha256,
            "sha384" => TpmAlgId::Sha384,
            "sha512" => TpmAlgId::Sha512,
            "aes" => TpmAlgId::Aes,
            "xor" => TpmAlgId::Xor,
            "cfb" => TpmAlgId::Cfb,
            _ => return None,
        };
        Some(alg)
    }

    pub fn serialize<S: Serializer>(alg: &TpmAlgId, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(name(*alg))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<TpmAlgId, D::Error> {
        let s = String::deserialize(d)?;
        parse(&s).ok_or_else(|| D::Error::custom(format!("unknown algorithm: {s}")))
    }
}
