// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Tickets and time-bound authorization checks
//!
//! An auth ticket stands in for a completed PolicySigned or PolicySecret.
//! Its digest is an HMAC under the hierarchy proof, so only this device can
//! mint one, and it binds the timeout, the clock epoch and (for tickets
//! that expire on reset) the reset count.

use tracing::debug;

use crate::constants::*;
use crate::crypto;
use crate::error::{Result, TpmError};
use crate::platform::{Clock, HierarchyProofs};
use crate::session::{CommandBinding, PolicyState, Session};
use crate::types::*;

/// Algorithm used for ticket HMACs
pub const TICKET_HASH_ALG: TpmAlgId = TpmAlgId::Sha256;

/// Absolute timeout for a PolicySigned/PolicySecret expiration
///
/// With a nonce the expiration counts from the session start; without one
/// it counts from the current second of TPM time. Zero means no timeout.
pub fn compute_auth_timeout(
    policy: &PolicyState,
    expiration: i32,
    nonce_tpm: &[u8],
    now_ms: u64,
) -> u64 {
    if expiration == 0 {
        return 0;
    }
    let seconds = expiration.unsigned_abs() as u64 * 1000;
    if nonce_tpm.is_empty() {
        (now_ms - now_ms % 1000) + seconds
    } else {
        policy.start_time + seconds
    }
}

/// A cpHashA, when given, must be a digest of the session hash algorithm.
/// Checked for trial sessions too.
pub fn check_cp_hash_size(session: &Session, cp_hash: &[u8]) -> Result<()> {
    if !cp_hash.is_empty() && cp_hash.len() != session.auth_hash_alg.digest_size() {
        return Err(TpmError::Size("cpHashA"));
    }
    Ok(())
}

/// Live checks shared by PolicySigned, PolicySecret and PolicyTicket
///
/// Callers skip this for trial sessions.
pub fn parameter_checks<C: Clock + ?Sized>(
    session: &Session,
    clock: &C,
    auth_timeout: u64,
    cp_hash: &[u8],
    nonce: &[u8],
) -> Result<()> {
    let policy = session.policy()?;
    if !nonce.is_empty() && !crypto::ct_eq(nonce, session.nonce_tpm.as_slice()) {
        return Err(TpmError::Nonce);
    }
    if auth_timeout != 0 {
        if !clock.is_advancing() {
            return Err(TpmError::NvUnavailable);
        }
        if auth_timeout < clock.now_ms() || policy.epoch != clock.epoch() {
            return Err(TpmError::Expired);
        }
    }
    check_cp_hash_size(session, cp_hash)?;
    if !cp_hash.is_empty() {
        match &policy.binding {
            CommandBinding::None => {}
            CommandBinding::CpHash(bound) if bound.as_slice() == cp_hash => {}
            _ => return Err(TpmError::CpHash),
        }
    }
    Ok(())
}

/// Caller-visible fields an auth ticket covers
#[derive(Debug, Clone, Copy)]
pub struct AuthTicketFields<'a> {
    pub tag: TpmSt,
    pub hierarchy: u32,
    pub timeout: AuthTimeout,
    pub cp_hash: &'a [u8],
    pub policy_ref: &'a [u8],
    pub auth_name: &'a [u8],
}

/// HMAC over the ticket fields, keyed by the hierarchy proof
pub fn compute_auth_ticket<P: Clock + HierarchyProofs + ?Sized>(
    platform: &P,
    fields: &AuthTicketFields<'_>,
) -> Result<TpmtTkAuth> {
    let proof = platform.proof(fields.hierarchy)?;
    let timeout = fields.timeout.absolute;
    let tag = fields.tag.to_u16().to_be_bytes();
    let timeout_bytes = timeout.to_be_bytes();
    let epoch = platform.epoch().to_be_bytes();
    let reset_count = platform.total_reset_count().to_be_bytes();
    let mut parts: Vec<&[u8]> = vec![
        &tag,
        fields.cp_hash,
        fields.policy_ref,
        fields.auth_name,
        &timeout_bytes,
    ];
    if timeout != 0 {
        parts.push(&epoch);
        if fields.timeout.expires_on_reset {
            parts.push(&reset_count);
        }
    }
    let digest = crypto::hmac(TICKET_HASH_ALG, &proof, &parts)?;
    Ok(TpmtTicket {
        tag: fields.tag,
        hierarchy: fields.hierarchy,
        digest: Tpm2bDigest::new(digest),
    })
}

/// Output of PolicySigned/PolicySecret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedTicket {
    /// Opaque TPM2B_TIMEOUT payload, empty when no ticket was produced
    pub timeout: Vec<u8>,
    pub ticket: TpmtTkAuth,
}

impl IssuedTicket {
    pub fn none(tag: TpmSt) -> Self {
        Self {
            timeout: Vec::new(),
            ticket: TpmtTicket::null(tag),
        }
    }

    pub fn is_none(&self) -> bool {
        self.timeout.is_empty() && self.ticket.is_null()
    }
}

/// Mint a ticket after a successful real PolicySigned/PolicySecret with a
/// negative expiration
pub fn issue_ticket<P: Clock + HierarchyProofs + ?Sized>(
    platform: &P,
    tag: TpmSt,
    hierarchy: u32,
    auth_timeout: u64,
    nonce_tpm: &[u8],
    cp_hash: &[u8],
    policy_ref: &[u8],
    auth_name: &[u8],
) -> Result<IssuedTicket> {
    let timeout = AuthTimeout::new(auth_timeout, nonce_tpm.is_empty());
    let ticket = compute_auth_ticket(
        platform,
        &AuthTicketFields {
            tag,
            hierarchy,
            timeout,
            cp_hash,
            policy_ref,
            auth_name,
        },
    )?;
    debug!(
        "issued {:?} ticket, timeout {} (expires on reset: {})",
        tag, timeout.absolute, timeout.expires_on_reset
    );
    Ok(IssuedTicket {
        timeout: timeout.to_blob(),
        ticket,
    })
}

/// Recompute and compare a caller-supplied auth ticket
pub fn verify_auth_ticket<P: Clock + HierarchyProofs + ?Sized>(
    platform: &P,
    ticket: &TpmtTkAuth,
    timeout: AuthTimeout,
    cp_hash: &[u8],
    policy_ref: &[u8],
    auth_name: &[u8],
) -> Result<()> {
    let expected = compute_auth_ticket(
        platform,
        &AuthTicketFields {
            tag: ticket.tag,
            hierarchy: ticket.hierarchy,
            timeout,
            cp_hash,
            policy_ref,
            auth_name,
        },
    )
    .map_err(|err| match err {
        TpmError::Value(_) => TpmError::Ticket,
        other => other,
    })?;
    if crypto::ct_eq(expected.digest.as_slice(), ticket.digest.as_slice()) {
        Ok(())
    } else {
        Err(TpmError::Ticket)
    }
}

/// TPMT_TK_VERIFIED for a digest signed by `key_name`
pub fn compute_verified_ticket<P: HierarchyProofs + ?Sized>(
    platform: &P,
    hierarchy: u32,
    digest: &[u8],
    key_name: &[u8],
) -> Result<TpmtTkVerified> {
    let proof = platform.proof(hierarchy)?;
    let tag = TpmSt::Verified.to_u16().to_be_bytes();
    let mac = crypto::hmac(TICKET_HASH_ALG, &proof, &[&tag, digest, key_name])?;
    Ok(TpmtTicket {
        tag: TpmSt::Verified,
        hierarchy,
        digest: Tpm2bDigest::new(mac),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SimPlatform;
    use crate::session::SessionKind;

    fn session(start_time: u64, epoch: u32) -> Session {
        Session {
            kind: SessionKind::Policy(PolicyState::new(TpmAlgId::Sha256, false, start_time, epoch)),
            auth_hash_alg: TpmAlgId::Sha256,
            symmetric: TpmtSymDef::null(),
            nonce_tpm: Tpm2bNonce::new(vec![7; 16]),
            session_key: Tpm2bAuth::empty(),
            is_bound: false,
            is_da_bound: false,
            is_lockout_bound: false,
        }
    }

    #[test]
    fn test_auth_timeout() {
        let s = session(2_500, 1);
        let p = s.policy().unwrap();
        assert_eq!(compute_auth_timeout(p, 0, &[1], 9_999), 0);
        assert_eq!(compute_auth_timeout(p, 10, &[1], 9_999), 12_500);
        assert_eq!(compute_auth_timeout(p, -10, &[1], 9_999), 12_500);
        assert_eq!(compute_auth_timeout(p, -10, &[], 9_999), 19_000);
    }

    #[test]
    fn test_parameter_checks() {
        let mut sim = SimPlatform::new();
        sim.set_time(1_000);
        let s = session(0, sim.epoch());
        assert!(parameter_checks(&s, &sim, 5_000, &[], &[7; 16]).is_ok());
        assert_eq!(
            parameter_checks(&s, &sim, 0, &[], &[8; 16]),
            Err(TpmError::Nonce)
        );
        assert_eq!(
            parameter_checks(&s, &sim, 500, &[], &[]),
            Err(TpmError::Expired)
        );
        assert!(matches!(
            parameter_checks(&s, &sim, 0, &[1; 20], &[]),
            Err(TpmError::Size(_))
        ));
        sim.set_advancing(false);
        assert_eq!(
            parameter_checks(&s, &sim, 5_000, &[], &[]),
            Err(TpmError::NvUnavailable)
        );
        sim.set_advancing(true);
        sim.bump_epoch();
        assert_eq!(
            parameter_checks(&s, &sim, 5_000, &[], &[]),
            Err(TpmError::Expired)
        );
    }

    #[test]
    fn test_bound_cp_hash_must_match() {
        let sim = SimPlatform::new();
        let mut s = session(0, sim.epoch());
        s.policy_mut().unwrap().binding = CommandBinding::CpHash(Tpm2bDigest::new(vec![1; 32]));
        assert!(parameter_checks(&s, &sim, 0, &[1; 32], &[]).is_ok());
        assert_eq!(
            parameter_checks(&s, &sim, 0, &[2; 32], &[]),
            Err(TpmError::CpHash)
        );
        s.policy_mut().unwrap().binding = CommandBinding::NameHash(Tpm2bDigest::new(vec![1; 32]));
        assert_eq!(
            parameter_checks(&s, &sim, 0, &[1; 32], &[]),
            Err(TpmError::CpHash)
        );
    }

    #[test]
    fn test_ticket_round_trip() {
        let sim = SimPlatform::new();
        let issued = issue_ticket(
            &sim,
            TpmSt::AuthSigned,
            tpm_rh::OWNER,
            60_000,
            &[],
            b"",
            b"ref",
            b"name",
        )
        .unwrap();
        let timeout = AuthTimeout::from_blob(&issued.timeout).unwrap();
        assert!(timeout.expires_on_reset);
        assert!(verify_auth_ticket(&sim, &issued.ticket, timeout, b"", b"ref", b"name").is_ok());
        assert_eq!(
            verify_auth_ticket(&sim, &issued.ticket, timeout, b"", b"other", b"name"),
            Err(TpmError::Ticket)
        );
        let shifted = AuthTimeout::new(timeout.absolute + 1, true);
        assert_eq!(
            verify_auth_ticket(&sim, &issued.ticket, shifted, b"", b"ref", b"name"),
            Err(TpmError::Ticket)
        );
    }

    #[test]
    fn test_reset_invalidates_expires_on_reset_ticket() {
        let mut sim = SimPlatform::new();
        let fields = AuthTicketFields {
            tag: TpmSt::AuthSecret,
            hierarchy: tpm_rh::OWNER,
            timeout: AuthTimeout::new(1_000, true),
            cp_hash: &[],
            policy_ref: &[],
            auth_name: b"n",
        };
        let before = compute_auth_ticket(&sim, &fields).unwrap();
        sim.reset();
        let after = compute_auth_ticket(&sim, &fields).unwrap();
        assert_ne!(before.digest, after.digest);
    }

    #[test]
    fn test_verified_ticket_binds_key_name() {
        let sim = SimPlatform::new();
        let a = compute_verified_ticket(&sim, tpm_rh::OWNER, b"digest", b"key-a").unwrap();
        let b = compute_verified_ticket(&sim, tpm_rh::OWNER, b"digest", b"key-b").unwrap();
        assert_eq!(a.tag, TpmSt::Verified);
        assert_ne!(a.digest, b.digest);
    }
}
