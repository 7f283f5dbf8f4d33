// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! PolicySigned, PolicySecret and PolicyTicket

use tracing::debug;

use crate::constants::*;
use crate::crypto;
use crate::error::{Result, TpmError};
use crate::platform::Platform;
use crate::session::Session;
use crate::ticket::{self, IssuedTicket};
use crate::types::*;

use super::ContextUpdate;

/// Parameters of TPM2_PolicySigned
#[derive(Debug, Clone)]
pub struct SignedParams {
    pub auth_object: u32,
    /// Session nonce the signer covered; empty for a nonce-less authorization
    pub nonce_tpm: Tpm2bNonce,
    pub cp_hash_a: Tpm2bDigest,
    pub policy_ref: Tpm2bNonce,
    /// Seconds; negative requests a ticket
    pub expiration: i32,
    pub auth: TpmtSignature,
}

/// Digest the authorizing key signs for PolicySigned
pub fn signed_digest(
    hash_alg: TpmAlgId,
    nonce_tpm: &[u8],
    expiration: i32,
    cp_hash_a: &[u8],
    policy_ref: &[u8],
) -> Result<Vec<u8>> {
    if !hash_alg.is_hash() {
        return Err(TpmError::Scheme);
    }
    crypto::hash(
        hash_alg,
        &[
            nonce_tpm,
            &(expiration as u32).to_be_bytes(),
            cp_hash_a,
            policy_ref,
        ],
    )
}

/// TPM2_PolicySigned
pub fn signed<P: Platform + ?Sized>(
    session: &mut Session,
    platform: &P,
    params: &SignedParams,
) -> Result<IssuedTicket> {
    let policy = session.policy()?;
    ticket::check_cp_hash_size(session, params.cp_hash_a.as_slice())?;
    let entity = platform.resolve(params.auth_object)?;
    let name = platform.name_of(entity)?;
    let trial = policy.trial;
    let mut auth_timeout = 0;
    if !trial {
        auth_timeout = ticket::compute_auth_timeout(
            policy,
            params.expiration,
            params.nonce_tpm.as_slice(),
            platform.now_ms(),
        );
        ticket::parameter_checks(
            session,
            platform,
            auth_timeout,
            params.cp_hash_a.as_slice(),
            params.nonce_tpm.as_slice(),
        )?;
        let a_hash = signed_digest(
            params.auth.hash_alg,
            params.nonce_tpm.as_slice(),
            params.expiration,
            params.cp_hash_a.as_slice(),
            params.policy_ref.as_slice(),
        )?;
        platform.verify(entity, &a_hash, &params.auth)?;
    }
    let issued = if params.expiration < 0 && !trial {
        ticket::issue_ticket(
            platform,
            TpmSt::AuthSigned,
            platform.hierarchy_of(entity),
            auth_timeout,
            params.nonce_tpm.as_slice(),
            params.cp_hash_a.as_slice(),
            params.policy_ref.as_slice(),
            name.as_slice(),
        )?
    } else {
        IssuedTicket::none(TpmSt::AuthSigned)
    };
    ContextUpdate {
        cc: TpmCc::PolicySigned,
        name: name.as_slice(),
        policy_ref: Some(params.policy_ref.as_slice()),
        cp_hash: params.cp_hash_a.as_slice(),
        timeout: auth_timeout,
    }
    .apply(session)?;
    debug!("policy signed by {:#010x}", params.auth_object);
    Ok(issued)
}

/// Parameters of TPM2_PolicySecret
#[derive(Debug, Clone)]
pub struct SecretParams {
    pub auth_handle: u32,
    /// Auth value presented for `auth_handle`
    pub auth_value: Tpm2bAuth,
    pub nonce_tpm: Tpm2bNonce,
    pub cp_hash_a: Tpm2bDigest,
    pub policy_ref: Tpm2bNonce,
    pub expiration: i32,
}

/// TPM2_PolicySecret
///
/// Trial sessions skip the auth value check along with the other live
/// conditions.
pub fn secret<P: Platform + ?Sized>(
    session: &mut Session,
    platform: &P,
    params: &SecretParams,
) -> Result<IssuedTicket> {
    let policy = session.policy()?;
    ticket::check_cp_hash_size(session, params.cp_hash_a.as_slice())?;
    let entity = platform.resolve(params.auth_handle)?;
    let name = platform.name_of(entity)?;
    let trial = policy.trial;
    let mut auth_timeout = 0;
    if !trial {
        let expected = platform.auth_value_of(entity)?;
        if !crypto::ct_eq(expected.trimmed(), params.auth_value.trimmed()) {
            return Err(TpmError::AuthFail);
        }
        auth_timeout = ticket::compute_auth_timeout(
            policy,
            params.expiration,
            params.nonce_tpm.as_slice(),
            platform.now_ms(),
        );
        ticket::parameter_checks(
            session,
            platform,
            auth_timeout,
            params.cp_hash_a.as_slice(),
            params.nonce_tpm.as_slice(),
        )?;
    }
    let issued = if params.expiration < 0 && !trial {
        ticket::issue_ticket(
            platform,
            TpmSt::AuthSecret,
            platform.hierarchy_of(entity),
            auth_timeout,
            params.nonce_tpm.as_slice(),
            params.cp_hash_a.as_slice(),
            params.policy_ref.as_slice(),
            name.as_slice(),
        )?
    } else {
        IssuedTicket::none(TpmSt::AuthSecret)
    };
    ContextUpdate {
        cc: TpmCc::PolicySecret,
        name: name.as_slice(),
        policy_ref: Some(params.policy_ref.as_slice()),
        cp_hash: params.cp_hash_a.as_slice(),
        timeout: auth_timeout,
    }
    .apply(session)?;
    Ok(issued)
}

/// Parameters of TPM2_PolicyTicket
#[derive(Debug, Clone)]
pub struct TicketParams {
    /// Timeout payload returned alongside the ticket
    pub timeout: Vec<u8>,
    pub cp_hash_a: Tpm2bDigest,
    pub policy_ref: Tpm2bNonce,
    pub auth_name: Tpm2bName,
    pub ticket: TpmtTkAuth,
}

/// TPM2_PolicyTicket: replay a PolicySigned or PolicySecret via its ticket
pub fn ticket<P: Platform + ?Sized>(
    session: &mut Session,
    platform: &P,
    params: &TicketParams,
) -> Result<()> {
    ticket::check_cp_hash_size(session, params.cp_hash_a.as_slice())?;
    if session.policy()?.trial {
        return Err(TpmError::Attributes("trial session cannot redeem a ticket"));
    }
    let timeout = AuthTimeout::from_blob(&params.timeout)?;
    let cc = match params.ticket.tag {
        TpmSt::AuthSigned => TpmCc::PolicySigned,
        TpmSt::AuthSecret => TpmCc::PolicySecret,
        _ => return Err(TpmError::Ticket),
    };
    ticket::parameter_checks(
        session,
        platform,
        timeout.absolute,
        params.cp_hash_a.as_slice(),
        &[],
    )?;
    ticket::verify_auth_ticket(
        platform,
        &params.ticket,
        timeout,
        params.cp_hash_a.as_slice(),
        params.policy_ref.as_slice(),
        params.auth_name.as_slice(),
    )?;
    ContextUpdate {
        cc,
        name: params.auth_name.as_slice(),
        policy_ref: Some(params.policy_ref.as_slice()),
        cp_hash: params.cp_hash_a.as_slice(),
        timeout: timeout.absolute,
    }
    .apply(session)
}
