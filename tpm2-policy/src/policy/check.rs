// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Use of a policy session to authorize a command

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::*;
use crate::error::{Result, TpmError};
use crate::platform::{Clock, EntityResolver, NvAccess};
use crate::session::{CommandBinding, Session};
use crate::types::Tpm2bDigest;

/// Which authorization role the command requires for the entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthRole {
    #[default]
    User,
    Admin,
    Dup,
}

/// The command a policy session is presented with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedCommand {
    pub command_code: u32,
    /// Entity whose authPolicy the session must satisfy
    pub auth_handle: u32,
    pub role: AuthRole,
    pub locality: u8,
    pub physical_presence: bool,
    /// cpHash of the command, computed with the session's hash algorithm
    pub cp_hash: Tpm2bDigest,
    /// Digest of the command's handle names
    pub name_hash: Tpm2bDigest,
    /// Digest of the creation template, for object-creating commands
    pub template_hash: Option<Tpm2bDigest>,
}

/// What the caller must still prove beyond the policy itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityAuth {
    /// The policy alone authorizes the command
    PolicyOnly,
    /// An HMAC keyed with the entity's auth value (PolicyAuthValue)
    Hmac,
    /// The plaintext auth value (PolicyPassword)
    Password,
}

/// Check a policy session against the command it is authorizing
pub fn check_authorization<P>(
    session: &Session,
    platform: &P,
    command: &AuthorizedCommand,
) -> Result<EntityAuth>
where
    P: Clock + EntityResolver + NvAccess + ?Sized,
{
    let policy = session.policy()?;
    if policy.trial {
        return Err(TpmError::PolicyFail);
    }
    if command.command_code == TpmCc::PolicySecret.to_u32()
        && !policy.password_needed
        && !policy.auth_value_needed
    {
        return Err(TpmError::Mode);
    }

    let entity = platform.resolve(command.auth_handle)?;
    let (policy_alg, auth_policy) = platform.auth_policy_of(entity)?;
    if policy_alg != session.auth_hash_alg || auth_policy != policy.digest {
        debug!("policy digest mismatch for {:#010x}", command.auth_handle);
        return Err(TpmError::PolicyFail);
    }

    if policy.timeout != 0 {
        if !platform.is_advancing() {
            return Err(TpmError::NvUnavailable);
        }
        if policy.timeout < platform.now_ms() || policy.epoch != platform.epoch() {
            return Err(TpmError::Expired);
        }
    }

    match policy.command_code {
        Some(cc) if cc != command.command_code => return Err(TpmError::PolicyCc),
        None if command.role != AuthRole::User => return Err(TpmError::PolicyFail),
        _ => {}
    }

    if !policy.command_locality.permits(command.locality) {
        return Err(TpmError::Locality);
    }
    if policy.pp_required && !command.physical_presence {
        return Err(TpmError::Pp);
    }

    let bound = match &policy.binding {
        CommandBinding::None => true,
        CommandBinding::CpHash(d) => *d == command.cp_hash,
        CommandBinding::NameHash(d) => *d == command.name_hash,
        CommandBinding::Template(d) => command.template_hash.as_ref() == Some(d),
    };
    if !bound {
        return Err(TpmError::PolicyFail);
    }

    if let Some(required) = policy.nv_written {
        if TpmHt::of(command.auth_handle) != Some(TpmHt::NvIndex)
            || platform.index_info(command.auth_handle)?.written != required
        {
            return Err(TpmError::PolicyFail);
        }
    }

    Ok(if policy.password_needed {
        EntityAuth::Password
    } else if policy.auth_value_needed {
        EntityAuth::Hmac
    } else {
        EntityAuth::PolicyOnly
    })
}
