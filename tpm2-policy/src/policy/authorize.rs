// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Indirection: PolicyAuthorize and PolicyAuthorizeNV replace the running
//! digest with one that names who approved it

use tracing::debug;

use crate::constants::*;
use crate::crypto;
use crate::error::{Result, TpmError};
use crate::marshal::{ResponseBuffer, Unmarshal};
use crate::platform::{EntityResolver, HierarchyProofs, NvAccess, SignatureVerifier};
use crate::session::Session;
use crate::ticket;
use crate::types::*;

use super::ContextUpdate;

/// Digest a policy authority signs to approve `approved_policy`
pub fn approval_digest(
    name_alg: TpmAlgId,
    approved_policy: &[u8],
    policy_ref: &[u8],
) -> Result<Vec<u8>> {
    crypto::hash(name_alg, &[approved_policy, policy_ref])
}

/// TPM2_VerifySignature: check a signature and mint the ticket
/// PolicyAuthorize consumes
pub fn verify_signature<P>(
    platform: &P,
    key_handle: u32,
    digest: &[u8],
    signature: &TpmtSignature,
) -> Result<TpmtTkVerified>
where
    P: EntityResolver + SignatureVerifier + HierarchyProofs + ?Sized,
{
    let key = platform.resolve(key_handle)?;
    platform.verify(key, digest, signature)?;
    let name = platform.name_of(key)?;
    ticket::compute_verified_ticket(platform, platform.hierarchy_of(key), digest, name.as_slice())
}

/// Parameters of TPM2_PolicyAuthorize
#[derive(Debug, Clone)]
pub struct AuthorizeParams {
    pub approved_policy: Tpm2bDigest,
    pub policy_ref: Tpm2bNonce,
    pub key_sign: Tpm2bName,
    pub check_ticket: TpmtTkVerified,
}

/// TPM2_PolicyAuthorize
pub fn authorize<P: HierarchyProofs + ?Sized>(
    session: &mut Session,
    platform: &P,
    params: &AuthorizeParams,
) -> Result<()> {
    let policy = session.policy()?;
    if params.check_ticket.tag != TpmSt::Verified {
        return Err(TpmError::Ticket);
    }
    if !policy.trial {
        let key_sign = params.key_sign.as_slice();
        let name_alg = key_sign
            .get(..2)
            .and_then(|b| TpmAlgId::from_u16(u16::from_be_bytes([b[0], b[1]])))
            .filter(|alg| alg.is_hash())
            .ok_or(TpmError::Hash)?;
        if key_sign.len() - 2 != name_alg.digest_size() {
            return Err(TpmError::Size("keySign"));
        }
        if policy.digest != params.approved_policy {
            return Err(TpmError::Value("approvedPolicy"));
        }
        let a_hash = approval_digest(
            name_alg,
            params.approved_policy.as_slice(),
            params.policy_ref.as_slice(),
        )?;
        let expected = ticket::compute_verified_ticket(
            platform,
            params.check_ticket.hierarchy,
            &a_hash,
            key_sign,
        )?;
        if !crypto::ct_eq(expected.digest.as_slice(), params.check_ticket.digest.as_slice()) {
            return Err(TpmError::Value("checkTicket"));
        }
    }
    ContextUpdate {
        cc: TpmCc::PolicyAuthorize,
        name: params.key_sign.as_slice(),
        policy_ref: Some(params.policy_ref.as_slice()),
        cp_hash: &[],
        timeout: 0,
    }
    .apply_cleared(session)?;
    debug!("policy authorized by key {}", hex::encode(params.key_sign.as_slice()));
    Ok(())
}

/// TPM2_PolicyAuthorizeNV: the approved digest is the TPMT_HA stored in
/// `nv_index`
pub fn authorize_nv<P: NvAccess + ?Sized>(
    session: &mut Session,
    platform: &P,
    auth_handle: u32,
    nv_index: u32,
) -> Result<()> {
    let policy = session.policy()?;
    let info = platform.index_info(nv_index)?;
    if !policy.trial {
        platform.read_access_check(auth_handle, nv_index)?;
        let size = info.data_size.min((2 + MAX_DIGEST_SIZE) as u16);
        let stored = platform.read_bytes(nv_index, 0, size)?;
        let approved = TpmtHa::unmarshal(&mut ResponseBuffer::new(&stored))?;
        if approved.hash_alg != session.auth_hash_alg {
            return Err(TpmError::Hash);
        }
        if approved.digest != policy.digest.as_slice() {
            return Err(TpmError::Value("policy digest does not match NV contents"));
        }
    }
    ContextUpdate {
        cc: TpmCc::PolicyAuthorizeNv,
        name: info.name.as_slice(),
        policy_ref: None,
        cp_hash: &[],
        timeout: 0,
    }
    .apply_cleared(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::Marshal;
    use crate::platform::{Clock, SimPlatform};
    use crate::policy::test_util::policy_session;
    use crate::policy::{command_code, extend_from};

    const AUTHORITY: u32 = 0x8100_0100;
    const NV: u32 = 0x0150_0000;

    fn approved_session(sim: &SimPlatform, trial: bool) -> Session {
        let mut s = policy_session(TpmAlgId::Sha256, trial, 0, sim.epoch());
        command_code(&mut s, TpmCc::Unseal.to_u32()).unwrap();
        s
    }

    fn params_for(sim: &SimPlatform, key_sign: &Tpm2bName, approved: &Tpm2bDigest) -> AuthorizeParams {
        let a_hash = approval_digest(TpmAlgId::Sha256, approved.as_slice(), b"v1").unwrap();
        let sig = sim.sign(AUTHORITY, TpmAlgId::Sha256, &a_hash).unwrap();
        AuthorizeParams {
            approved_policy: approved.clone(),
            policy_ref: Tpm2bNonce::new(&b"v1"[..]),
            key_sign: key_sign.clone(),
            check_ticket: verify_signature(sim, AUTHORITY, &a_hash, &sig).unwrap(),
        }
    }

    #[test]
    fn test_authorize_replaces_digest() {
        let mut sim = SimPlatform::new();
        let key_sign = sim.add_signing_key(AUTHORITY, b"authority");
        let mut s = approved_session(&sim, false);
        let approved = s.policy_digest().unwrap().clone();
        authorize(&mut s, &sim, &params_for(&sim, &key_sign, &approved)).unwrap();

        let inner = extend_from(
            TpmAlgId::Sha256,
            &[0; 32],
            TpmCc::PolicyAuthorize,
            &[key_sign.as_slice()],
        )
        .unwrap();
        let expected = crypto::hash(TpmAlgId::Sha256, &[inner.as_slice(), b"v1"]).unwrap();
        assert_eq!(s.policy_digest().unwrap().as_slice(), expected.as_slice());
        // command code lock survives the digest replacement
        assert_eq!(s.policy().unwrap().command_code, Some(TpmCc::Unseal.to_u32()));

        let mut trial = policy_session(TpmAlgId::Sha256, true, 0, sim.epoch());
        authorize(&mut trial, &sim, &params_for(&sim, &key_sign, &approved)).unwrap();
        assert_eq!(trial.policy_digest(), s.policy_digest());
    }

    #[test]
    fn test_authorize_failures() {
        let mut sim = SimPlatform::new();
        let key_sign = sim.add_signing_key(AUTHORITY, b"authority");
        let mut s = approved_session(&sim, false);
        let approved = s.policy_digest().unwrap().clone();
        let good = params_for(&sim, &key_sign, &approved);

        let mut p = good.clone();
        p.approved_policy = Tpm2bDigest::new(vec![1; 32]);
        assert!(matches!(authorize(&mut s, &sim, &p), Err(TpmError::Value(_))));

        let mut p = good.clone();
        p.check_ticket.digest = Tpm2bDigest::new(vec![0; 32]);
        assert!(matches!(authorize(&mut s, &sim, &p), Err(TpmError::Value(_))));

        let mut p = good.clone();
        p.check_ticket.tag = TpmSt::AuthSigned;
        assert_eq!(authorize(&mut s, &sim, &p), Err(TpmError::Ticket));

        let mut p = good.clone();
        p.key_sign = Tpm2bName::from_handle(AUTHORITY);
        assert_eq!(authorize(&mut s, &sim, &p), Err(TpmError::Hash));

        let mut p = good;
        p.policy_ref = Tpm2bNonce::empty();
        assert!(matches!(authorize(&mut s, &sim, &p), Err(TpmError::Value(_))));
        assert_eq!(s.policy_digest().unwrap(), &approved);
    }

    #[test]
    fn test_authorize_nv() {
        let mut sim = SimPlatform::new();
        let nv_name = sim.define_nv(NV, 2 + 32);
        let mut s = approved_session(&sim, false);
        let approved = TpmtHa {
            hash_alg: TpmAlgId::Sha256,
            digest: s.policy_digest().unwrap().as_slice().to_vec(),
        };
        assert_eq!(authorize_nv(&mut s, &sim, NV, NV), Err(TpmError::NvUninitialized));

        sim.write_nv(NV, 0, &TpmtHa { digest: vec![0; 32], ..approved.clone() }.to_bytes())
            .unwrap();
        assert!(matches!(authorize_nv(&mut s, &sim, NV, NV), Err(TpmError::Value(_))));

        sim.write_nv(NV, 0, &approved.to_bytes()).unwrap();
        authorize_nv(&mut s, &sim, NV, NV).unwrap();
        let expected = extend_from(
            TpmAlgId::Sha256,
            &[0; 32],
            TpmCc::PolicyAuthorizeNv,
            &[nv_name.as_slice()],
        )
        .unwrap();
        assert_eq!(s.policy_digest().unwrap(), &expected);

        let mut sha1 = policy_session(TpmAlgId::Sha1, false, 0, sim.epoch());
        assert_eq!(authorize_nv(&mut sha1, &sim, NV, NV), Err(TpmError::Hash));
    }
}
