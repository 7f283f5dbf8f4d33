// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use tpm2_policy::platform::Clock;
use tpm2_policy::policy::{
    self, AuthRole, AuthorizeParams, AuthorizedCommand, EntityAuth, SignedParams, TicketParams,
};
use tpm2_policy::{
    AuthTimeout, PolicyScript, PolicyStep, SessionConfig, SessionManager, SimPlatform,
    StartSession, Tpm2bDigest, Tpm2bNonce, TpmAlgId, TpmCc, TpmError,
};

const SEALED: u32 = 0x8000_0010;
const SIGNER: u32 = 0x8100_0020;

fn unseal_command() -> AuthorizedCommand {
    AuthorizedCommand {
        command_code: TpmCc::Unseal.to_u32(),
        auth_handle: SEALED,
        role: AuthRole::User,
        locality: 0,
        physical_presence: false,
        cp_hash: Tpm2bDigest::empty(),
        name_hash: Tpm2bDigest::empty(),
        template_hash: None,
    }
}

fn signed_params(sim: &SimPlatform, nonce: &[u8], expiration: i32) -> SignedParams {
    let a_hash = policy::signed_digest(TpmAlgId::Sha256, nonce, expiration, &[], &[]).unwrap();
    SignedParams {
        auth_object: SIGNER,
        nonce_tpm: Tpm2bNonce::new(nonce),
        cp_hash_a: Tpm2bDigest::empty(),
        policy_ref: Tpm2bNonce::empty(),
        expiration,
        auth: sim.sign(SIGNER, TpmAlgId::Sha256, &a_hash).unwrap(),
    }
}

#[test]
fn test_command_code_conflict_keeps_digest() {
    let sim = SimPlatform::new();
    let mut mgr = SessionManager::new(SessionConfig::default()).unwrap();
    let s = mgr
        .create_session(&sim, StartSession::policy(TpmAlgId::Sha256))
        .unwrap()
        .handle;
    mgr.execute(s, |s| policy::command_code(s, TpmCc::Unseal.to_u32()))
        .unwrap();
    let before = mgr.execute(s, |s| policy::get_digest(s)).unwrap();
    let err = mgr
        .execute(s, |s| policy::command_code(s, TpmCc::NvRead.to_u32()))
        .unwrap_err();
    assert!(matches!(err, TpmError::Value(_)));
    assert!(!mgr.in_failure_mode());
    assert_eq!(mgr.execute(s, |s| policy::get_digest(s)).unwrap(), before);
}

#[test]
fn test_script_digest_authorizes_real_session() {
    let mut sim = SimPlatform::new();
    let signer_name = sim.add_signing_key(SIGNER, b"release signer");
    let script = PolicyScript::new(
        TpmAlgId::Sha256,
        vec![
            PolicyStep::Signed {
                key_name: signer_name,
                policy_ref: Tpm2bNonce::empty(),
            },
            PolicyStep::CommandCode {
                code: TpmCc::Unseal.to_u32(),
            },
        ],
    );
    let auth_policy = script.digest().unwrap();
    sim.add_object(SEALED, b"", TpmAlgId::Sha256, auth_policy.as_slice());

    let mut mgr = SessionManager::new(SessionConfig::default()).unwrap();
    let started = mgr
        .create_session(&sim, StartSession::policy(TpmAlgId::Sha256))
        .unwrap();
    let params = signed_params(&sim, started.nonce_tpm.as_slice(), 0);
    mgr.execute(started.handle, |s| policy::signed(s, &sim, &params))
        .unwrap();
    mgr.execute(started.handle, |s| {
        policy::command_code(s, TpmCc::Unseal.to_u32())
    })
    .unwrap();

    let session = mgr.get_session(started.handle).unwrap();
    assert_eq!(session.policy_digest().unwrap(), &auth_policy);
    assert_eq!(
        policy::check_authorization(session, &sim, &unseal_command()),
        Ok(EntityAuth::PolicyOnly)
    );
}

#[test]
fn test_epoch_bump_invalidates_tickets_and_timeouts() {
    let mut sim = SimPlatform::new();
    sim.set_time(10_000);
    let signer_name = sim.add_signing_key(SIGNER, b"signer");
    let mut mgr = SessionManager::new(SessionConfig::default()).unwrap();
    let first = mgr
        .create_session(&sim, StartSession::policy(TpmAlgId::Sha256))
        .unwrap()
        .handle;
    let second = mgr
        .create_session(&sim, StartSession::policy(TpmAlgId::Sha256))
        .unwrap()
        .handle;

    let issued = mgr
        .execute(first, |s| policy::signed(s, &sim, &signed_params(&sim, &[], -300)))
        .unwrap();
    let timeout = AuthTimeout::from_blob(&issued.timeout).unwrap();
    assert!(timeout.absolute > sim.now_ms());

    let redeem = TicketParams {
        timeout: issued.timeout.clone(),
        cp_hash_a: Tpm2bDigest::empty(),
        policy_ref: Tpm2bNonce::empty(),
        auth_name: signer_name,
        ticket: issued.ticket.clone(),
    };
    sim.bump_epoch();
    assert_eq!(
        mgr.execute(second, |s| policy::ticket(s, &sim, &redeem)),
        Err(TpmError::Expired)
    );

    let digest = mgr.execute(first, |s| policy::get_digest(s)).unwrap();
    sim.add_object(SEALED, b"", TpmAlgId::Sha256, digest.as_slice());
    let session = mgr.get_session(first).unwrap();
    assert_eq!(
        policy::check_authorization(session, &sim, &unseal_command()),
        Err(TpmError::Expired)
    );
}

#[test]
fn test_authorized_policy_flow() {
    let mut sim = SimPlatform::new();
    let authority = sim.add_signing_key(SIGNER, b"policy authority");
    let authorize_only = PolicyScript::new(
        TpmAlgId::Sha256,
        vec![PolicyStep::Authorize {
            key_name: authority.clone(),
            policy_ref: Tpm2bNonce::empty(),
        }],
    )
    .digest()
    .unwrap();
    sim.add_object(SEALED, b"", TpmAlgId::Sha256, authorize_only.as_slice());

    // any approved inner policy works; here physical presence
    let inner = PolicyScript::new(TpmAlgId::Sha256, vec![PolicyStep::PhysicalPresence])
        .digest()
        .unwrap();
    let a_hash = policy::approval_digest(TpmAlgId::Sha256, inner.as_slice(), &[]).unwrap();
    let signature = sim.sign(SIGNER, TpmAlgId::Sha256, &a_hash).unwrap();
    let check_ticket = policy::verify_signature(&sim, SIGNER, &a_hash, &signature).unwrap();

    let mut mgr = SessionManager::new(SessionConfig::default()).unwrap();
    let s = mgr
        .create_session(&sim, StartSession::policy(TpmAlgId::Sha256))
        .unwrap()
        .handle;
    mgr.execute(s, policy::physical_presence).unwrap();
    let params = AuthorizeParams {
        approved_policy: inner,
        policy_ref: Tpm2bNonce::empty(),
        key_sign: authority,
        check_ticket,
    };
    mgr.execute(s, |s| policy::authorize(s, &sim, &params)).unwrap();

    let session = mgr.get_session(s).unwrap();
    let command = AuthorizedCommand {
        physical_presence: true,
        ..unseal_command()
    };
    assert_eq!(
        policy::check_authorization(session, &sim, &command),
        Ok(EntityAuth::PolicyOnly)
    );
    assert_eq!(
        policy::check_authorization(session, &sim, &unseal_command()),
        Err(TpmError::Pp)
    );
}
