// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! TPM 2.0 constants, command codes and response codes used by the
//! session and policy engine

use serde::{Deserialize, Serialize};

/// TPM 2.0 Command Codes (TPM_CC) that the engine folds into digests or
/// refers to when checking authorizations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TpmCc {
    PolicyNv = 0x00000149,
    PolicySecret = 0x00000151,
    PolicySigned = 0x00000160,
    PolicyAuthorize = 0x0000016A,
    PolicyAuthValue = 0x0000016B,
    PolicyCommandCode = 0x0000016C,
    PolicyCounterTimer = 0x0000016D,
    PolicyCpHash = 0x0000016E,
    PolicyLocality = 0x0000016F,
    PolicyNameHash = 0x00000170,
    PolicyOr = 0x00000171,
    PolicyTicket = 0x00000172,
    PolicyRestart = 0x00000180,
    PolicyPhysicalPresence = 0x00000187,
    PolicyGetDigest = 0x00000189,
    PolicyPassword = 0x0000018C,
    PolicyNvWritten = 0x0000018F,
    PolicyTemplate = 0x00000190,
    PolicyAuthorizeNv = 0x00000192,
    StartAuthSession = 0x00000176,
    ContextSave = 0x00000162,
    ContextLoad = 0x00000161,
    FlushContext = 0x00000165,
    NvRead = 0x0000014E,
    NvWrite = 0x00000137,
    Unseal = 0x0000015E,
    Duplicate = 0x0000014B,
    Create = 0x00000153,
    CreatePrimary = 0x00000131,
    CreateLoaded = 0x00000191,
}

impl TpmCc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// First and last command code of the TPM 2.0 command space
pub const TPM_CC_FIRST: u32 = 0x0000011F;
pub const TPM_CC_LAST: u32 = 0x00000197;

/// TPM 2.0 Response Codes (TPM_RC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmRc {
    Success = 0x00000000,
    // Format 0 errors
    Failure = 0x00000101,
    Policy = 0x00000126,
    TooManyContexts = 0x0000012E,
    NvUninitialized = 0x0000014A,
    CpHash = 0x00000151,
    // Format 1 errors (parameter errors)
    Attributes = 0x00000082,
    Hash = 0x00000083,
    Value = 0x00000084,
    Handle = 0x0000008B,
    Range = 0x0000008D,
    AuthFail = 0x0000008E,
    Nonce = 0x0000008F,
    Pp = 0x00000090,
    Scheme = 0x00000092,
    Size = 0x00000095,
    Mode = 0x00000089,
    Signature = 0x0000009B,
    PolicyFail = 0x0000009D,
    Integrity = 0x0000009F,
    Ticket = 0x000000A0,
    Expired = 0x000000A3,
    PolicyCc = 0x000000A4,
    // Warnings
    ContextGap = 0x00000901,
    SessionMemory = 0x00000903,
    SessionHandles = 0x00000905,
    Locality = 0x00000907,
    NvUnavailable = 0x00000923,
}

impl TpmRc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn is_success(self) -> bool {
        matches!(self, TpmRc::Success)
    }

    /// Warnings are recoverable by caller action (retry after freeing
    /// resources)
    pub fn is_warning(self) -> bool {
        self.to_u32() & 0x900 == 0x900
    }
}

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TpmAlgId {
    Null = 0x0010,
    Sha1 = 0x0004,
    Hmac = 0x0005,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Aes = 0x0006,
    Xor = 0x000A,
    Cfb = 0x0043,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0010 => Some(TpmAlgId::Null),
            0x0004 => Some(TpmAlgId::Sha1),
            0x0005 => Some(TpmAlgId::Hmac),
            0x000B => Some(TpmAlgId::Sha256),
            0x000C => Some(TpmAlgId::Sha384),
            0x000D => Some(TpmAlgId::Sha512),
            0x0006 => Some(TpmAlgId::Aes),
            0x000A => Some(TpmAlgId::Xor),
            0x0043 => Some(TpmAlgId::Cfb),
            _ => None,
        }
    }

    pub fn digest_size(self) -> usize {
        match self {
            TpmAlgId::Sha1 => 20,
            TpmAlgId::Sha256 => 32,
            TpmAlgId::Sha384 => 48,
            TpmAlgId::Sha512 => 64,
            _ => 0,
        }
    }

    pub fn is_hash(self) -> bool {
        self.digest_size() != 0
    }
}

/// TPM 2.0 Handle Types (most significant octet of a handle)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmHt {
    Pcr = 0x00,
    NvIndex = 0x01,
    HmacSession = 0x02,
    PolicySession = 0x03,
    Permanent = 0x40,
    Transient = 0x80,
    Persistent = 0x81,
}

impl TpmHt {
    pub fn of(handle: u32) -> Option<Self> {
        match (handle >> 24) as u8 {
            0x00 => Some(TpmHt::Pcr),
            0x01 => Some(TpmHt::NvIndex),
            0x02 => Some(TpmHt::HmacSession),
            0x03 => Some(TpmHt::PolicySession),
            0x40 => Some(TpmHt::Permanent),
            0x80 => Some(TpmHt::Transient),
            0x81 => Some(TpmHt::Persistent),
            _ => None,
        }
    }
}

/// Mask selecting the index part of a handle
pub const HR_HANDLE_MASK: u32 = 0x00FFFFFF;
pub const HMAC_SESSION_FIRST: u32 = 0x02000000;
pub const POLICY_SESSION_FIRST: u32 = 0x03000000;

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const OWNER: u32 = 0x40000001;
    pub const NULL: u32 = 0x40000007;
    pub const LOCKOUT: u32 = 0x4000000A;
    pub const ENDORSEMENT: u32 = 0x4000000B;
    pub const PLATFORM: u32 = 0x4000000C;
    pub const PW: u32 = 0x40000009; // Password authorization
}

/// TPM 2.0 Session Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TpmSe {
    Hmac = 0x00,
    Policy = 0x01,
    Trial = 0x03,
}

impl TpmSe {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(TpmSe::Hmac),
            0x01 => Some(TpmSe::Policy),
            0x03 => Some(TpmSe::Trial),
            _ => None,
        }
    }
}

/// TPM 2.0 Startup Types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
    /// TPM Reset: all session state is discarded
    Clear,
    /// TPM Restart: saved contexts survive, loaded sessions do not
    Restart,
    /// TPM Resume: saved contexts survive, loaded sessions do not
    Resume,
}

/// Structure tags (TPM_ST) used by tickets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    Verified = 0x8022,
    AuthSecret = 0x8023,
    Hashcheck = 0x8024,
    AuthSigned = 0x8025,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x8022 => Some(TpmSt::Verified),
            0x8023 => Some(TpmSt::AuthSecret),
            0x8024 => Some(TpmSt::Hashcheck),
            0x8025 => Some(TpmSt::AuthSigned),
            _ => None,
        }
    }
}

/// Arithmetic and bitwise comparison operators (TPM_EO)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum TpmEo {
    Eq = 0x0000,
    Neq = 0x0001,
    SignedGt = 0x0002,
    UnsignedGt = 0x0003,
    SignedLt = 0x0004,
    UnsignedLt = 0x0005,
    SignedGe = 0x0006,
    UnsignedGe = 0x0007,
    SignedLe = 0x0008,
    UnsignedLe = 0x0009,
    BitSet = 0x000A,
    BitClear = 0x000B,
}

impl TpmEo {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0000 => Some(TpmEo::Eq),
            0x0001 => Some(TpmEo::Neq),
            0x0002 => Some(TpmEo::SignedGt),
            0x0003 => Some(TpmEo::UnsignedGt),
            0x0004 => Some(TpmEo::SignedLt),
            0x0005 => Some(TpmEo::UnsignedLt),
            0x0006 => Some(TpmEo::SignedGe),
            0x0007 => Some(TpmEo::UnsignedGe),
            0x0008 => Some(TpmEo::SignedLe),
            0x0009 => Some(TpmEo::UnsignedLe),
            0x000A => Some(TpmEo::BitSet),
            0x000B => Some(TpmEo::BitClear),
            _ => None,
        }
    }
}

/// Bit 63 of a wire timeout value carries the "expires on reset" flag
pub const EXPIRATION_BIT: u64 = 1 << 63;

/// Size of the largest TPMU_NAME (hash algorithm id + SHA-512 digest)
pub const MAX_NAME_SIZE: usize = 2 + 64;

/// Largest digest any supported hash algorithm produces
pub const MAX_DIGEST_SIZE: usize = 64;

/// Number of digests allowed in a PolicyOR list
pub const POLICY_OR_MIN: usize = 2;
pub const POLICY_OR_MAX: usize = 8;

/// KDFa labels
pub const SESSION_KEY_LABEL: &[u8] = b"ATH";
pub const CONTEXT_KEY_LABEL: &[u8] = b"CONTEXT";

/// Context encryption parameters (AES-128-CFB)
pub const CONTEXT_ENCRYPT_KEY_BYTES: usize = 16;
pub const CONTEXT_ENCRYPT_IV_BYTES: usize = 16;
