// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Declarative policy descriptions
//!
//! A [`PolicyScript`] lists assertions in the order a policy session would
//! execute them. [`PolicyScript::digest`] replays them on a trial session,
//! producing the value to put in an object's authPolicy. Entities are
//! given by name since a trial session never touches the real objects.
//!
//! ```json
//! {
//!   "hash": "sha256",
//!   "steps": [
//!     { "assert": "or", "branches": [
//!         [{ "assert": "auth_value" }],
//!         [{ "assert": "signed", "key_name": "000b..." }]
//!     ]},
//!     { "assert": "command_code", "code": 350 }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SessionConfig;
use crate::constants::*;
use crate::error::{Result, TpmError};
use crate::manager::{SessionManager, StartSession};
use crate::platform::SimPlatform;
use crate::policy::{self, AuthorizeParams, SecretParams, SignedParams};
use crate::session::Session;
use crate::types::*;

const ENTITY_BASE: u32 = 0x80FF_0000;
const NV_BASE: u32 = 0x01FF_0000;

/// One assertion of a policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "assert", rename_all = "snake_case")]
pub enum PolicyStep {
    CommandCode {
        code: u32,
    },
    Locality {
        locality: TpmaLocality,
    },
    CounterTimer {
        operand_b: Tpm2bOperand,
        #[serde(default)]
        offset: u16,
        operation: TpmEo,
    },
    Nv {
        nv_name: Tpm2bName,
        operand_b: Tpm2bOperand,
        #[serde(default)]
        offset: u16,
        operation: TpmEo,
    },
    CpHash {
        cp_hash: Tpm2bDigest,
    },
    NameHash {
        name_hash: Tpm2bDigest,
    },
    Template {
        template_hash: Tpm2bDigest,
    },
    AuthValue,
    Password,
    PhysicalPresence,
    NvWritten {
        written_set: bool,
    },
    Signed {
        key_name: Tpm2bName,
        #[serde(default)]
        policy_ref: Tpm2bNonce,
    },
    Secret {
        entity_name: Tpm2bName,
        #[serde(default)]
        policy_ref: Tpm2bNonce,
    },
    Authorize {
        key_name: Tpm2bName,
        #[serde(default)]
        policy_ref: Tpm2bNonce,
    },
    AuthorizeNv {
        nv_name: Tpm2bName,
    },
    Or {
        branches: Vec<Vec<PolicyStep>>,
    },
}

fn default_hash() -> TpmAlgId {
    TpmAlgId::Sha256
}

/// An ordered list of assertions and the session hash algorithm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyScript {
    #[serde(with = "crate::types::alg_serde", default = "default_hash")]
    pub hash: TpmAlgId,
    pub steps: Vec<PolicyStep>,
}

impl PolicyScript {
    pub fn new(hash: TpmAlgId, steps: Vec<PolicyStep>) -> Self {
        Self { hash, steps }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Policy digest a real session satisfying every step would hold
    pub fn digest(&self) -> Result<Tpm2bDigest> {
        if !self.hash.is_hash() {
            return Err(TpmError::Hash);
        }
        let mut evaluator = Evaluator::default();
        let mut manager = SessionManager::new(SessionConfig::default())
            .map_err(|err| TpmError::Failure(err.to_string()))?;
        let started = manager.create_session(&evaluator.sim, StartSession::trial(self.hash))?;
        let result = manager
            .execute(started.handle, |session| evaluator.run(session, &self.steps))
            .and_then(|()| manager.execute(started.handle, |session| policy::get_digest(session)));
        manager.flush(started.handle)?;
        let digest = result?;
        debug!("policy script evaluated to {}", hex::encode(digest.as_slice()));
        Ok(digest)
    }
}

/// Trial evaluation context: a simulated platform populated on demand
/// with the entities the steps name
#[derive(Default)]
struct Evaluator {
    sim: SimPlatform,
    next_entity: u32,
    next_nv: u32,
}

impl Evaluator {
    fn entity(&mut self, name: &Tpm2bName) -> u32 {
        let handle = ENTITY_BASE + self.next_entity;
        self.next_entity += 1;
        self.sim.add_named_entity(handle, name.clone());
        handle
    }

    fn nv_index(&mut self, name: &Tpm2bName) -> u32 {
        let index = NV_BASE + self.next_nv;
        self.next_nv += 1;
        self.sim.define_nv_named(index, name.clone(), 0);
        index
    }

    fn run(&mut self, session: &mut Session, steps: &[PolicyStep]) -> Result<()> {
        steps.iter().try_for_each(|step| self.step(session, step))
    }

    fn step(&mut self, session: &mut Session, step: &PolicyStep) -> Result<()> {
        match step {
            PolicyStep::CommandCode { code } => policy::command_code(session, *code),
            PolicyStep::Locality { locality } => policy::locality(session, *locality),
            PolicyStep::CounterTimer {
                operand_b,
                offset,
                operation,
            } => policy::counter_timer(session, &self.sim, operand_b, *offset, *operation),
            PolicyStep::Nv {
                nv_name,
                operand_b,
                offset,
                operation,
            } => {
                let index = self.nv_index(nv_name);
                policy::nv(session, &self.sim, index, index, operand_b, *offset, *operation)
            }
            PolicyStep::CpHash { cp_hash } => policy::cp_hash(session, cp_hash),
            PolicyStep::NameHash { name_hash } => policy::name_hash(session, name_hash),
            PolicyStep::Template { template_hash } => policy::template(session, template_hash),
            PolicyStep::AuthValue => policy::auth_value(session),
            PolicyStep::Password => policy::password(session),
            PolicyStep::PhysicalPresence => policy::physical_presence(session),
            PolicyStep::NvWritten { written_set } => policy::nv_written(session, *written_set),
            PolicyStep::Signed {
                key_name,
                policy_ref,
            } => {
                let params = SignedParams {
                    auth_object: self.entity(key_name),
                    nonce_tpm: Tpm2bNonce::empty(),
                    cp_hash_a: Tpm2bDigest::empty(),
                    policy_ref: policy_ref.clone(),
                    expiration: 0,
                    auth: TpmtSignature {
                        scheme: TpmAlgId::Null,
                        hash_alg: TpmAlgId::Null,
                        signature: Vec::new(),
                    },
                };
                policy::signed(session, &self.sim, &params).map(drop)
            }
            PolicyStep::Secret {
                entity_name,
                policy_ref,
            } => {
                let params = SecretParams {
                    auth_handle: self.entity(entity_name),
                    auth_value: Tpm2bAuth::empty(),
                    nonce_tpm: Tpm2bNonce::empty(),
                    cp_hash_a: Tpm2bDigest::empty(),
                    policy_ref: policy_ref.clone(),
                    expiration: 0,
                };
                policy::secret(session, &self.sim, &params).map(drop)
            }
            PolicyStep::Authorize {
                key_name,
                policy_ref,
            } => {
                let params = AuthorizeParams {
                    approved_policy: session.policy_digest()?.clone(),
                    policy_ref: policy_ref.clone(),
                    key_sign: key_name.clone(),
                    check_ticket: TpmtTicket::null(TpmSt::Verified),
                };
                policy::authorize(session, &self.sim, &params)
            }
            PolicyStep::AuthorizeNv { nv_name } => {
                let index = self.nv_index(nv_name);
                policy::authorize_nv(session, &self.sim, index, index)
            }
            PolicyStep::Or { branches } => {
                let mut digests = Vec::with_capacity(branches.len());
                for branch in branches {
                    let mut fork = session.clone();
                    self.run(&mut fork, branch)?;
                    digests.push(fork.policy_digest()?.clone());
                }
                policy::or(session, &digests)
            }
        }
    }
}
