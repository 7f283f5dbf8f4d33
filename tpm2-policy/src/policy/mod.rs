// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Policy assertions
//!
//! Every assertion folds its command code and parameters into the
//! session's running digest:
//!
//! ```text
//! policyDigest_new := H(policyDigest_old || TPM_CC || parameters)
//! ```
//!
//! Real sessions also check the live condition the assertion names;
//! trial sessions only accumulate the digest. Each assertion validates
//! everything before it touches the session, so a failed assertion leaves
//! the session unchanged.

mod assertions;
mod authorize;
mod check;
mod or;
mod signed;

pub use assertions::*;
pub use authorize::*;
pub use check::*;
pub use or::*;
pub use signed::*;

use crate::constants::*;
use crate::crypto::{self, HashState};
use crate::error::Result;
use crate::session::{CommandBinding, Session};
use crate::types::Tpm2bDigest;

/// `H(base || cc || parts...)`
pub(crate) fn extend_from(
    alg: TpmAlgId,
    base: &[u8],
    cc: TpmCc,
    parts: &[&[u8]],
) -> Result<Tpm2bDigest> {
    let mut state = HashState::start(alg)?;
    state.update(base);
    state.update_u32(cc.to_u32());
    for part in parts {
        state.update(part);
    }
    Ok(Tpm2bDigest::new(state.finish()))
}

/// Extend the session's current digest
pub(crate) fn extended_digest(
    session: &Session,
    cc: TpmCc,
    parts: &[&[u8]],
) -> Result<Tpm2bDigest> {
    extend_from(
        session.auth_hash_alg,
        session.policy_digest()?.as_slice(),
        cc,
        parts,
    )
}

/// Shared digest and state update for assertions that name an entity
pub(crate) struct ContextUpdate<'a> {
    pub cc: TpmCc,
    pub name: &'a [u8],
    /// Present (possibly empty) for assertions that carry a policyRef
    pub policy_ref: Option<&'a [u8]>,
    pub cp_hash: &'a [u8],
    pub timeout: u64,
}

impl ContextUpdate<'_> {
    /// Digest after this update, starting from `base`
    fn digest_from(&self, alg: TpmAlgId, base: &[u8]) -> Result<Tpm2bDigest> {
        let digest = extend_from(alg, base, self.cc, &[self.name])?;
        match self.policy_ref {
            Some(policy_ref) => Ok(Tpm2bDigest::new(crypto::hash(
                alg,
                &[digest.as_slice(), policy_ref],
            )?)),
            None => Ok(digest),
        }
    }

    /// Apply on top of the current digest
    pub fn apply(self, session: &mut Session) -> Result<()> {
        let digest = self.digest_from(session.auth_hash_alg, session.policy_digest()?.as_slice())?;
        self.commit(session, digest)
    }

    /// Apply on top of a zero digest (PolicyAuthorize, PolicyAuthorizeNV)
    pub fn apply_cleared(self, session: &mut Session) -> Result<()> {
        let alg = session.auth_hash_alg;
        let digest = self.digest_from(alg, Tpm2bDigest::zeroed(alg).as_slice())?;
        self.commit(session, digest)
    }

    fn commit(self, session: &mut Session, digest: Tpm2bDigest) -> Result<()> {
        let policy = session.policy_mut()?;
        policy.digest = digest;
        if !self.cp_hash.is_empty() {
            policy.binding = CommandBinding::CpHash(Tpm2bDigest::new(self.cp_hash));
        }
        if self.timeout != 0 && (policy.timeout == 0 || self.timeout < policy.timeout) {
            policy.timeout = self.timeout;
        }
        Ok(())
    }
}

/// TPM2_PolicyRestart: back to the Initial state
pub fn restart(session: &mut Session) -> Result<()> {
    session.policy_mut()?.reset();
    Ok(())
}

/// TPM2_PolicyGetDigest
pub fn get_digest(session: &Session) -> Result<Tpm2bDigest> {
    Ok(session.policy_digest()?.clone())
}
