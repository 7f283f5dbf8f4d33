// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Assertions that lock the authorized command or check a live condition

use std::cmp::Ordering;

use crate::constants::*;
use crate::crypto;
use crate::error::{Result, TpmError};
use crate::marshal::Marshal;
use crate::platform::{Clock, NvAccess};
use crate::session::{CommandBinding, Session};
use crate::types::*;

use super::extended_digest;

/// Evaluate a TPM_EO comparison between two equal-length big-endian values
pub fn check_condition(operation: TpmEo, a: &[u8], b: &[u8]) -> bool {
    let unsigned = a.cmp(b);
    let signed = signed_cmp(a, b);
    match operation {
        TpmEo::Eq => a == b,
        TpmEo::Neq => a != b,
        TpmEo::SignedGt => signed == Ordering::Greater,
        TpmEo::UnsignedGt => unsigned == Ordering::Greater,
        TpmEo::SignedLt => signed == Ordering::Less,
        TpmEo::UnsignedLt => unsigned == Ordering::Less,
        TpmEo::SignedGe => signed != Ordering::Less,
        TpmEo::UnsignedGe => unsigned != Ordering::Less,
        TpmEo::SignedLe => signed != Ordering::Greater,
        TpmEo::UnsignedLe => unsigned != Ordering::Greater,
        TpmEo::BitSet => a.iter().zip(b).all(|(x, y)| x & y == *y),
        TpmEo::BitClear => a.iter().zip(b).all(|(x, y)| x & y == 0),
    }
}

fn signed_cmp(a: &[u8], b: &[u8]) -> Ordering {
    let negative = |v: &[u8]| v.first().map_or(false, |x| x & 0x80 != 0);
    match (negative(a), negative(b)) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.cmp(b),
    }
}

/// `H(operandB || offset || operation)`, the argument digest shared by
/// PolicyNV and PolicyCounterTimer
fn operand_args(alg: TpmAlgId, operand_b: &[u8], offset: u16, operation: TpmEo) -> Result<Vec<u8>> {
    crypto::hash(
        alg,
        &[
            operand_b,
            &offset.to_be_bytes(),
            &operation.to_u16().to_be_bytes(),
        ],
    )
}

/// TPM2_PolicyCommandCode
pub fn command_code(session: &mut Session, code: u32) -> Result<()> {
    let policy = session.policy()?;
    if policy.command_code.is_some_and(|cc| cc != code) {
        return Err(TpmError::Value("command code already locked"));
    }
    if !(TPM_CC_FIRST..=TPM_CC_LAST).contains(&code) {
        return Err(TpmError::PolicyCc);
    }
    let digest = extended_digest(session, TpmCc::PolicyCommandCode, &[&code.to_be_bytes()])?;
    let policy = session.policy_mut()?;
    policy.digest = digest;
    policy.command_code = Some(code);
    Ok(())
}

/// TPM2_PolicyLocality
pub fn locality(session: &mut Session, locality: TpmaLocality) -> Result<()> {
    let requested = locality.0;
    if requested == 0 {
        return Err(TpmError::Range("locality"));
    }
    let previous = session.policy()?.command_locality;
    if previous.0 != 0 && previous.is_extended() != locality.is_extended() {
        return Err(TpmError::Range("locality"));
    }
    let combined = if locality.is_extended() {
        if previous.0 != 0 && previous.0 != requested {
            return Err(TpmError::Range("locality"));
        }
        requested
    } else {
        let base = if previous.0 == 0 {
            TpmaLocality::NORMAL_MASK
        } else {
            previous.0
        };
        match base & requested {
            0 => return Err(TpmError::Range("locality")),
            bits => bits,
        }
    };
    let digest = extended_digest(session, TpmCc::PolicyLocality, &[&[requested]])?;
    let policy = session.policy_mut()?;
    policy.digest = digest;
    policy.command_locality = TpmaLocality(combined);
    Ok(())
}

/// TPM2_PolicyCounterTimer
pub fn counter_timer<C: Clock + ?Sized>(
    session: &mut Session,
    clock: &C,
    operand_b: &Tpm2bOperand,
    offset: u16,
    operation: TpmEo,
) -> Result<()> {
    session.policy()?;
    if !session.is_trial() {
        let start = offset as usize;
        let end = start + operand_b.len();
        if end > TpmsTimeInfo::WIRE_SIZE {
            return Err(TpmError::Range("offset"));
        }
        if !clock.is_advancing() {
            return Err(TpmError::NvUnavailable);
        }
        let info = clock.time_info().to_bytes();
        if !check_condition(operation, &info[start..end], operand_b.as_slice()) {
            return Err(TpmError::Policy);
        }
    }
    let args = operand_args(session.auth_hash_alg, operand_b.as_slice(), offset, operation)?;
    let digest = extended_digest(session, TpmCc::PolicyCounterTimer, &[&args])?;
    session.policy_mut()?.digest = digest;
    Ok(())
}

/// TPM2_PolicyNV
pub fn nv<P: NvAccess + ?Sized>(
    session: &mut Session,
    platform: &P,
    auth_handle: u32,
    nv_index: u32,
    operand_b: &Tpm2bOperand,
    offset: u16,
    operation: TpmEo,
) -> Result<()> {
    session.policy()?;
    let info = platform.index_info(nv_index)?;
    if !session.is_trial() {
        platform.read_access_check(auth_handle, nv_index)?;
        if offset > info.data_size {
            return Err(TpmError::Value("offset"));
        }
        if ((info.data_size - offset) as usize) < operand_b.len() {
            return Err(TpmError::Size("operandB"));
        }
        let data = platform.read_bytes(nv_index, offset, operand_b.len() as u16)?;
        if !check_condition(operation, &data, operand_b.as_slice()) {
            return Err(TpmError::Policy);
        }
    }
    let args = operand_args(session.auth_hash_alg, operand_b.as_slice(), offset, operation)?;
    let digest = extended_digest(session, TpmCc::PolicyNv, &[&args, info.name.as_slice()])?;
    session.policy_mut()?.digest = digest;
    Ok(())
}

/// TPM2_PolicyCpHash
pub fn cp_hash(session: &mut Session, cp_hash_a: &Tpm2bDigest) -> Result<()> {
    let policy = session.policy()?;
    if cp_hash_a.len() != session.auth_hash_alg.digest_size() {
        return Err(TpmError::Size("cpHashA"));
    }
    match &policy.binding {
        CommandBinding::None => {}
        CommandBinding::CpHash(bound) if bound == cp_hash_a => {}
        _ => return Err(TpmError::CpHash),
    }
    let digest = extended_digest(session, TpmCc::PolicyCpHash, &[cp_hash_a.as_slice()])?;
    let policy = session.policy_mut()?;
    policy.digest = digest;
    policy.binding = CommandBinding::CpHash(cp_hash_a.clone());
    Ok(())
}

/// TPM2_PolicyNameHash
pub fn name_hash(session: &mut Session, name_hash: &Tpm2bDigest) -> Result<()> {
    let policy = session.policy()?;
    if name_hash.len() != session.auth_hash_alg.digest_size() {
        return Err(TpmError::Size("nameHash"));
    }
    if !policy.binding.is_none() {
        return Err(TpmError::CpHash);
    }
    let digest = extended_digest(session, TpmCc::PolicyNameHash, &[name_hash.as_slice()])?;
    let policy = session.policy_mut()?;
    policy.digest = digest;
    policy.binding = CommandBinding::NameHash(name_hash.clone());
    Ok(())
}

/// TPM2_PolicyTemplate
pub fn template(session: &mut Session, template_hash: &Tpm2bDigest) -> Result<()> {
    match &session.policy()?.binding {
        CommandBinding::Template(bound) => {
            if bound != template_hash {
                return Err(TpmError::Value("templateHash"));
            }
        }
        CommandBinding::None => {
            if template_hash.len() != session.auth_hash_alg.digest_size() {
                return Err(TpmError::Size("templateHash"));
            }
        }
        _ => return Err(TpmError::CpHash),
    }
    let digest = extended_digest(session, TpmCc::PolicyTemplate, &[template_hash.as_slice()])?;
    let policy = session.policy_mut()?;
    policy.digest = digest;
    policy.binding = CommandBinding::Template(template_hash.clone());
    Ok(())
}

/// TPM2_PolicyAuthValue: the command must carry an HMAC over the entity's
/// auth value
pub fn auth_value(session: &mut Session) -> Result<()> {
    let digest = extended_digest(session, TpmCc::PolicyAuthValue, &[])?;
    let policy = session.policy_mut()?;
    policy.digest = digest;
    policy.auth_value_needed = true;
    policy.password_needed = false;
    Ok(())
}

/// TPM2_PolicyPassword: the command must carry the plaintext auth value
///
/// Produces the same digest as [`auth_value`].
pub fn password(session: &mut Session) -> Result<()> {
    let digest = extended_digest(session, TpmCc::PolicyAuthValue, &[])?;
    let policy = session.policy_mut()?;
    policy.digest = digest;
    policy.password_needed = true;
    policy.auth_value_needed = false;
    Ok(())
}

/// TPM2_PolicyPhysicalPresence
pub fn physical_presence(session: &mut Session) -> Result<()> {
    let digest = extended_digest(session, TpmCc::PolicyPhysicalPresence, &[])?;
    let policy = session.policy_mut()?;
    policy.digest = digest;
    policy.pp_required = true;
    Ok(())
}

/// TPM2_PolicyNvWritten
pub fn nv_written(session: &mut Session, written_set: bool) -> Result<()> {
    if session
        .policy()?
        .nv_written
        .is_some_and(|required| required != written_set)
    {
        return Err(TpmError::Value("writtenSet"));
    }
    let digest = extended_digest(session, TpmCc::PolicyNvWritten, &[&[written_set as u8]])?;
    let policy = session.policy_mut()?;
    policy.digest = digest;
    policy.nv_written = Some(written_set);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::test_util::policy_session;
    use crate::policy::extend_from;
    use crate::platform::SimPlatform;

    const NV: u32 = 0x0100_0010;

    fn sha256_session(trial: bool) -> Session {
        policy_session(TpmAlgId::Sha256, trial, 0, 1)
    }

    #[test]
    fn test_command_code_digest() {
        let mut s = sha256_session(true);
        command_code(&mut s, TpmCc::Unseal.to_u32()).unwrap();
        let expected = extend_from(
            TpmAlgId::Sha256,
            &[0; 32],
            TpmCc::PolicyCommandCode,
            &[&TpmCc::Unseal.to_u32().to_be_bytes()],
        )
        .unwrap();
        assert_eq!(s.policy_digest().unwrap(), &expected);
        assert_eq!(s.policy().unwrap().command_code, Some(0x15E));
    }

    #[test]
    fn test_command_code_conflict_leaves_session_unchanged() {
        let mut s = sha256_session(false);
        command_code(&mut s, TpmCc::Unseal.to_u32()).unwrap();
        let before = s.clone();
        assert!(matches!(
            command_code(&mut s, TpmCc::NvRead.to_u32()),
            Err(TpmError::Value(_))
        ));
        assert_eq!(command_code(&mut sha256_session(false), 0), Err(TpmError::PolicyCc));
        assert_eq!(s, before);
        command_code(&mut s, TpmCc::Unseal.to_u32()).unwrap();
        assert_ne!(s.policy_digest(), before.policy_digest());
    }

    #[test]
    fn test_locality_narrowing() {
        let mut s = sha256_session(false);
        locality(&mut s, TpmaLocality(TpmaLocality::ONE | TpmaLocality::THREE)).unwrap();
        locality(&mut s, TpmaLocality(TpmaLocality::THREE | TpmaLocality::FOUR)).unwrap();
        assert_eq!(s.policy().unwrap().command_locality, TpmaLocality(TpmaLocality::THREE));
        let before = s.clone();
        assert!(matches!(
            locality(&mut s, TpmaLocality(TpmaLocality::ZERO)),
            Err(TpmError::Range(_))
        ));
        assert!(matches!(locality(&mut s, TpmaLocality(40)), Err(TpmError::Range(_))));
        assert!(matches!(locality(&mut s, TpmaLocality(0)), Err(TpmError::Range(_))));
        assert_eq!(s, before);
    }

    #[test]
    fn test_extended_locality_must_repeat() {
        let mut s = sha256_session(false);
        locality(&mut s, TpmaLocality(64)).unwrap();
        locality(&mut s, TpmaLocality(64)).unwrap();
        assert!(matches!(locality(&mut s, TpmaLocality(65)), Err(TpmError::Range(_))));
    }

    #[test]
    fn test_binding_exclusivity() {
        let d = Tpm2bDigest::new(vec![3; 32]);
        let mut s = sha256_session(false);
        cp_hash(&mut s, &d).unwrap();
        cp_hash(&mut s, &d).unwrap();
        assert_eq!(
            cp_hash(&mut s, &Tpm2bDigest::new(vec![4; 32])),
            Err(TpmError::CpHash)
        );
        assert_eq!(name_hash(&mut s, &d), Err(TpmError::CpHash));
        assert_eq!(template(&mut s, &d), Err(TpmError::CpHash));

        let mut s = sha256_session(false);
        template(&mut s, &d).unwrap();
        template(&mut s, &d).unwrap();
        assert!(matches!(
            template(&mut s, &Tpm2bDigest::new(vec![4; 32])),
            Err(TpmError::Value(_))
        ));
        assert_eq!(cp_hash(&mut s, &d), Err(TpmError::CpHash));
        assert!(s.is_template_set());

        let mut s = sha256_session(false);
        assert!(matches!(
            name_hash(&mut s, &Tpm2bDigest::new(vec![1; 20])),
            Err(TpmError::Size(_))
        ));
    }

    #[test]
    fn test_password_and_auth_value_share_digest() {
        let mut a = sha256_session(true);
        let mut b = sha256_session(true);
        auth_value(&mut a).unwrap();
        password(&mut b).unwrap();
        assert_eq!(a.policy_digest(), b.policy_digest());
        assert!(a.policy().unwrap().auth_value_needed);
        assert!(b.policy().unwrap().password_needed);
        auth_value(&mut b).unwrap();
        assert!(!b.policy().unwrap().password_needed);
    }

    #[test]
    fn test_nv_written_conflict() {
        let mut s = sha256_session(false);
        nv_written(&mut s, true).unwrap();
        nv_written(&mut s, true).unwrap();
        assert!(matches!(nv_written(&mut s, false), Err(TpmError::Value(_))));
    }

    #[test]
    fn test_check_condition() {
        assert!(check_condition(TpmEo::Eq, &[1, 2], &[1, 2]));
        assert!(check_condition(TpmEo::UnsignedGt, &[0x80], &[0x01]));
        assert!(check_condition(TpmEo::SignedLt, &[0x80], &[0x01]));
        assert!(check_condition(TpmEo::SignedGe, &[0x01], &[0x01]));
        assert!(check_condition(TpmEo::BitSet, &[0b1110], &[0b0110]));
        assert!(!check_condition(TpmEo::BitSet, &[0b1000], &[0b0110]));
        assert!(check_condition(TpmEo::BitClear, &[0b1000], &[0b0110]));
    }

    #[test]
    fn test_counter_timer() {
        let mut sim = SimPlatform::new();
        sim.set_time(10_000);
        let mut s = sha256_session(false);
        let operand = Tpm2bOperand::new(5_000u64.to_be_bytes().to_vec());
        counter_timer(&mut s, &sim, &operand, 0, TpmEo::UnsignedGt).unwrap();
        assert_eq!(
            counter_timer(&mut s, &sim, &operand, 0, TpmEo::UnsignedLt),
            Err(TpmError::Policy)
        );
        assert!(matches!(
            counter_timer(&mut s, &sim, &operand, 20, TpmEo::Eq),
            Err(TpmError::Range(_))
        ));

        // trial sessions only record the comparison
        let mut t = sha256_session(true);
        let mut r = sha256_session(false);
        counter_timer(&mut t, &sim, &operand, 0, TpmEo::UnsignedGt).unwrap();
        counter_timer(&mut r, &sim, &operand, 0, TpmEo::UnsignedGt).unwrap();
        assert_eq!(t.policy_digest(), r.policy_digest());
    }

    #[test]
    fn test_nv_assertion() {
        let mut sim = SimPlatform::new();
        sim.define_nv(NV, 8);
        let operand = Tpm2bOperand::new(vec![0xAA, 0xBB]);
        let mut s = sha256_session(false);
        assert_eq!(
            nv(&mut s, &sim, NV, NV, &operand, 0, TpmEo::Eq),
            Err(TpmError::NvUninitialized)
        );
        sim.write_nv(NV, 2, &[0xAA, 0xBB]).unwrap();
        assert_eq!(
            nv(&mut s, &sim, NV, NV, &operand, 0, TpmEo::Eq),
            Err(TpmError::Policy)
        );
        assert!(matches!(
            nv(&mut s, &sim, NV, NV, &operand, 7, TpmEo::Eq),
            Err(TpmError::Size(_))
        ));
        assert!(matches!(
            nv(&mut s, &sim, NV, NV, &operand, 9, TpmEo::Eq),
            Err(TpmError::Value(_))
        ));
        assert_eq!(s.policy_digest().unwrap(), &Tpm2bDigest::zeroed(TpmAlgId::Sha256));
        nv(&mut s, &sim, NV, NV, &operand, 2, TpmEo::Eq).unwrap();

        let mut t = sha256_session(true);
        sim.set_nv_readable(NV, false);
        nv(&mut t, &sim, NV, NV, &operand, 2, TpmEo::Eq).unwrap();
        assert_eq!(t.policy_digest(), s.policy_digest());
    }
}
