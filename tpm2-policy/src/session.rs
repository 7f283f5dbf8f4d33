// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Authorization session records

use crate::constants::*;
use crate::error::{Result, TpmError};
use crate::marshal::*;
use crate::types::*;

/// Size of the bound-entity value kept by bound HMAC sessions
pub const BOUND_ENTITY_SIZE: usize = MAX_NAME_SIZE;

/// State specific to HMAC sessions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HmacState {
    /// Name of the bind entity mixed with its auth value, if bound
    pub bound_entity: Option<Vec<u8>>,
}

/// Command-parameter binding fixed by PolicyCpHash, PolicyNameHash or
/// PolicyTemplate (or a cpHash carried by PolicySigned/PolicySecret)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CommandBinding {
    #[default]
    None,
    CpHash(Tpm2bDigest),
    NameHash(Tpm2bDigest),
    Template(Tpm2bDigest),
}

impl CommandBinding {
    pub fn is_none(&self) -> bool {
        matches!(self, CommandBinding::None)
    }

    fn tag(&self) -> u8 {
        match self {
            CommandBinding::None => 0,
            CommandBinding::CpHash(_) => 1,
            CommandBinding::NameHash(_) => 2,
            CommandBinding::Template(_) => 3,
        }
    }

    fn value(&self) -> &[u8] {
        match self {
            CommandBinding::None => &[],
            CommandBinding::CpHash(d) | CommandBinding::NameHash(d) | CommandBinding::Template(d) => {
                d.as_slice()
            }
        }
    }
}

/// State specific to policy sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyState {
    pub trial: bool,
    /// Running policy digest; always the session hash's digest size
    pub digest: Tpm2bDigest,
    /// The one command this policy may authorize
    pub command_code: Option<u32>,
    pub binding: CommandBinding,
    pub command_locality: TpmaLocality,
    /// TPM time when the session started
    pub start_time: u64,
    /// Clock epoch when the session started
    pub epoch: u32,
    /// Earliest expiration imposed by any assertion; 0 means none
    pub timeout: u64,
    pub auth_value_needed: bool,
    pub password_needed: bool,
    pub pp_required: bool,
    /// Required TPMA_NV_WRITTEN state of the authorized NV index
    pub nv_written: Option<bool>,
}

impl PolicyState {
    pub fn new(hash_alg: TpmAlgId, trial: bool, start_time: u64, epoch: u32) -> Self {
        Self {
            trial,
            digest: Tpm2bDigest::zeroed(hash_alg),
            command_code: None,
            binding: CommandBinding::None,
            command_locality: TpmaLocality::default(),
            start_time,
            epoch,
            timeout: 0,
            auth_value_needed: false,
            password_needed: false,
            pp_required: false,
            nv_written: None,
        }
    }

    /// Back to the Initial state, keeping trial mode, nonce-related timing
    /// and the session's identity
    pub fn reset(&mut self) {
        let size = self.digest.len();
        *self = Self {
            digest: Tpm2bDigest::new(vec![0u8; size]),
            ..Self::new(TpmAlgId::Null, self.trial, self.start_time, self.epoch)
        };
    }
}

/// Per-kind session payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    Hmac(HmacState),
    Policy(PolicyState),
}

/// One authorization session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub kind: SessionKind,
    pub auth_hash_alg: TpmAlgId,
    pub symmetric: TpmtSymDef,
    pub nonce_tpm: Tpm2bNonce,
    pub session_key: Tpm2bAuth,
    pub is_bound: bool,
    pub is_da_bound: bool,
    pub is_lockout_bound: bool,
}

impl Session {
    pub fn is_policy(&self) -> bool {
        matches!(self.kind, SessionKind::Policy(_))
    }

    pub fn is_trial(&self) -> bool {
        matches!(&self.kind, SessionKind::Policy(p) if p.trial)
    }

    pub fn session_type(&self) -> TpmSe {
        match &self.kind {
            SessionKind::Hmac(_) => TpmSe::Hmac,
            SessionKind::Policy(p) if p.trial => TpmSe::Trial,
            SessionKind::Policy(_) => TpmSe::Policy,
        }
    }

    /// Handle range this session's handle is drawn from
    pub fn handle_base(&self) -> u32 {
        match self.kind {
            SessionKind::Hmac(_) => HMAC_SESSION_FIRST,
            SessionKind::Policy(_) => POLICY_SESSION_FIRST,
        }
    }

    pub fn policy(&self) -> Result<&PolicyState> {
        match &self.kind {
            SessionKind::Policy(p) => Ok(p),
            SessionKind::Hmac(_) => Err(TpmError::Handle),
        }
    }

    pub fn policy_mut(&mut self) -> Result<&mut PolicyState> {
        match &mut self.kind {
            SessionKind::Policy(p) => Ok(p),
            SessionKind::Hmac(_) => Err(TpmError::Handle),
        }
    }

    pub fn policy_digest(&self) -> Result<&Tpm2bDigest> {
        Ok(&self.policy()?.digest)
    }

    pub fn is_cp_hash_defined(&self) -> bool {
        matches!(&self.kind, SessionKind::Policy(p) if matches!(p.binding, CommandBinding::CpHash(_)))
    }

    pub fn is_template_set(&self) -> bool {
        matches!(&self.kind, SessionKind::Policy(p) if matches!(p.binding, CommandBinding::Template(_)))
    }
}

const ATTR_BOUND: u8 = 1 << 0;
const ATTR_DA_BOUND: u8 = 1 << 1;
const ATTR_LOCKOUT_BOUND: u8 = 1 << 2;

const POLICY_AUTH_VALUE: u8 = 1 << 0;
const POLICY_PASSWORD: u8 = 1 << 1;
const POLICY_PP: u8 = 1 << 2;

impl Marshal for Session {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u8(self.session_type() as u8);
        buf.put_u16(self.auth_hash_alg.to_u16());
        self.symmetric.marshal(buf);
        self.nonce_tpm.marshal(buf);
        buf.put_tpm2b(self.session_key.as_slice());
        let mut attrs = 0u8;
        if self.is_bound {
            attrs |= ATTR_BOUND;
        }
        if self.is_da_bound {
            attrs |= ATTR_DA_BOUND;
        }
        if self.is_lockout_bound {
            attrs |= ATTR_LOCKOUT_BOUND;
        }
        buf.put_u8(attrs);
        match &self.kind {
            SessionKind::Hmac(h) => {
                buf.put_tpm2b(h.bound_entity.as_deref().unwrap_or_default());
            }
            SessionKind::Policy(p) => {
                p.digest.marshal(buf);
                buf.put_u32(p.command_code.unwrap_or(0));
                buf.put_u8(p.binding.tag());
                buf.put_tpm2b(p.binding.value());
                buf.put_u8(p.command_locality.0);
                buf.put_u64(p.start_time);
                buf.put_u32(p.epoch);
                buf.put_u64(p.timeout);
                let mut flags = 0u8;
                if p.auth_value_needed {
                    flags |= POLICY_AUTH_VALUE;
                }
                if p.password_needed {
                    flags |= POLICY_PASSWORD;
                }
                if p.pp_required {
                    flags |= POLICY_PP;
                }
                buf.put_u8(flags);
                buf.put_u8(match p.nv_written {
                    None => 0,
                    Some(false) => 1,
                    Some(true) => 2,
                });
            }
        }
    }
}

impl Unmarshal for Session {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let session_type = TpmSe::from_u8(buf.get_u8()?).ok_or(TpmError::Integrity)?;
        let auth_hash_alg = TpmAlgId::from_u16(buf.get_u16()?)
            .filter(|a| a.is_hash())
            .ok_or(TpmError::Hash)?;
        let symmetric = TpmtSymDef::unmarshal(buf)?;
        let nonce_tpm = Tpm2bNonce::unmarshal(buf)?;
        let session_key = Tpm2bAuth::new(buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?);
        let attrs = buf.get_u8()?;
        let kind = match session_type {
            TpmSe::Hmac => {
                let bound = buf.get_tpm2b_bounded(BOUND_ENTITY_SIZE)?;
                SessionKind::Hmac(HmacState {
                    bound_entity: (!bound.is_empty()).then_some(bound),
                })
            }
            TpmSe::Policy | TpmSe::Trial => {
                let digest = Tpm2bDigest::unmarshal(buf)?;
                if digest.len() != auth_hash_alg.digest_size() {
                    return Err(TpmError::Integrity);
                }
                let command_code = Some(buf.get_u32()?).filter(|cc| *cc != 0);
                let tag = buf.get_u8()?;
                let value = Tpm2bDigest::new(buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?);
                let binding = match tag {
                    0 => CommandBinding::None,
                    1 => CommandBinding::CpHash(value),
                    2 => CommandBinding::NameHash(value),
                    3 => CommandBinding::Template(value),
                    _ => return Err(TpmError::Integrity),
                };
                let command_locality = TpmaLocality(buf.get_u8()?);
                let start_time = buf.get_u64()?;
                let epoch = buf.get_u32()?;
                let timeout = buf.get_u64()?;
                let flags = buf.get_u8()?;
                let nv_written = match buf.get_u8()? {
                    0 => None,
                    1 => Some(false),
                    2 => Some(true),
                    _ => return Err(TpmError::Integrity),
                };
                SessionKind::Policy(PolicyState {
                    trial: session_type == TpmSe::Trial,
                    digest,
                    command_code,
                    binding,
                    command_locality,
                    start_time,
                    epoch,
                    timeout,
                    auth_value_needed: flags & POLICY_AUTH_VALUE != 0,
                    password_needed: flags & POLICY_PASSWORD != 0,
                    pp_required: flags & POLICY_PP != 0,
                    nv_written,
                })
            }
        };
        Ok(Self {
            kind,
            auth_hash_alg,
            symmetric,
            nonce_tpm,
            session_key,
            is_bound: attrs & ATTR_BOUND != 0,
            is_da_bound: attrs & ATTR_DA_BOUND != 0,
            is_lockout_bound: attrs & ATTR_LOCKOUT_BOUND != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_session(trial: bool) -> Session {
        Session {
            kind: SessionKind::Policy(PolicyState::new(TpmAlgId::Sha256, trial, 10, 7)),
            auth_hash_alg: TpmAlgId::Sha256,
            symmetric: TpmtSymDef::aes_128_cfb(),
            nonce_tpm: Tpm2bNonce::new(vec![0x42; 16]),
            session_key: Tpm2bAuth::empty(),
            is_bound: false,
            is_da_bound: true,
            is_lockout_bound: false,
        }
    }

    #[test]
    fn test_policy_session_survives_marshaling() {
        let mut session = policy_session(false);
        {
            let p = session.policy_mut().unwrap();
            p.command_code = Some(TpmCc::Unseal.to_u32());
            p.binding = CommandBinding::NameHash(Tpm2bDigest::new(vec![9; 32]));
            p.command_locality = TpmaLocality(TpmaLocality::THREE);
            p.timeout = 5000;
            p.password_needed = true;
            p.nv_written = Some(false);
        }
        let restored = Session::from_bytes(&session.to_bytes()).unwrap();
        assert_eq!(restored, session);
    }

    #[test]
    fn test_hmac_session_survives_marshaling() {
        let session = Session {
            kind: SessionKind::Hmac(HmacState {
                bound_entity: Some(vec![1; BOUND_ENTITY_SIZE]),
            }),
            is_bound: true,
            ..policy_session(false)
        };
        let restored = Session::from_bytes(&session.to_bytes()).unwrap();
        assert_eq!(restored, session);
        assert_eq!(restored.handle_base(), HMAC_SESSION_FIRST);
    }

    #[test]
    fn test_reset_keeps_trial_and_timing() {
        let mut state = PolicyState::new(TpmAlgId::Sha384, true, 99, 3);
        state.digest = Tpm2bDigest::new(vec![1; 48]);
        state.command_code = Some(1);
        state.timeout = 5;
        state.reset();
        assert!(state.trial);
        assert_eq!(state.digest, Tpm2bDigest::zeroed(TpmAlgId::Sha384));
        assert_eq!(state.start_time, 99);
        assert_eq!(state.epoch, 3);
        assert_eq!(state.command_code, None);
        assert_eq!(state.timeout, 0);
    }

    #[test]
    fn test_attribute_views() {
        let mut session = policy_session(true);
        assert!(session.is_trial());
        assert!(!session.is_cp_hash_defined());
        session.policy_mut().unwrap().binding =
            CommandBinding::Template(Tpm2bDigest::new(vec![0; 32]));
        assert!(session.is_template_set());
        assert_eq!(session.session_type(), TpmSe::Trial);
    }
}
