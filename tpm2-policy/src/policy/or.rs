// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use crate::constants::*;
use crate::error::{Result, TpmError};
use crate::session::Session;
use crate::types::Tpm2bDigest;

use super::extend_from;

/// Digest PolicyOR produces for `branches`, independent of the session
pub fn or_digest(alg: TpmAlgId, branches: &[Tpm2bDigest]) -> Result<Tpm2bDigest> {
    let parts: Vec<&[u8]> = branches.iter().map(Tpm2bDigest::as_slice).collect();
    extend_from(alg, Tpm2bDigest::zeroed(alg).as_slice(), TpmCc::PolicyOr, &parts)
}

/// TPM2_PolicyOR
///
/// A real session must currently hold one of the branch digests. Only the
/// digest is replaced; locks set by earlier assertions stay.
pub fn or(session: &mut Session, branches: &[Tpm2bDigest]) -> Result<()> {
    if !(POLICY_OR_MIN..=POLICY_OR_MAX).contains(&branches.len()) {
        return Err(TpmError::Size("pHashList"));
    }
    let policy = session.policy()?;
    if !policy.trial && !branches.iter().any(|b| *b == policy.digest) {
        return Err(TpmError::PolicyFail);
    }
    let digest = or_digest(session.auth_hash_alg, branches)?;
    session.policy_mut()?.digest = digest;
    Ok(())
}
