// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Interfaces the session engine consumes from the rest of the device
//!
//! The object table, NV storage, clock and signature primitives live
//! outside this crate. [`SimPlatform`] is an in-memory stand-in used by
//! tests and the `policy-digest` tool.

use std::collections::HashMap;

use tracing::debug;

use crate::constants::*;
use crate::crypto;
use crate::error::{Result, TpmError};
use crate::types::*;

/// Opaque reference to a resolved entity (object, NV index or hierarchy)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityRef(pub u32);

impl EntityRef {
    pub fn handle(self) -> u32 {
        self.0
    }
}

/// Device time sources
pub trait Clock {
    /// Milliseconds of TPM time since the last reset
    fn now_ms(&self) -> u64;
    /// Nonce that changes whenever time continuity is lost
    fn epoch(&self) -> u32;
    /// False while the clock is stopped (for example after an NV failure)
    fn is_advancing(&self) -> bool;
    /// Count of TPM resets, folded into tickets and context integrity
    fn total_reset_count(&self) -> u64;
    /// Snapshot compared by PolicyCounterTimer
    fn time_info(&self) -> TpmsTimeInfo;
}

/// Object and hierarchy table
pub trait EntityResolver {
    fn resolve(&self, handle: u32) -> Result<EntityRef>;
    fn name_of(&self, entity: EntityRef) -> Result<Tpm2bName>;
    fn auth_value_of(&self, entity: EntityRef) -> Result<Tpm2bAuth>;
    /// Hash algorithm and policy digest guarding the entity
    fn auth_policy_of(&self, entity: EntityRef) -> Result<(TpmAlgId, Tpm2bDigest)>;
    /// Hierarchy whose proof backs tickets involving this entity
    fn hierarchy_of(&self, entity: EntityRef) -> u32;
    /// Entities exempt from dictionary-attack protection
    fn is_da_exempt(&self, entity: EntityRef) -> bool;
}

/// Public attributes of an NV index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvIndexInfo {
    pub name: Tpm2bName,
    pub data_size: u16,
    pub written: bool,
}

/// NV storage
pub trait NvAccess {
    fn index_info(&self, index: u32) -> Result<NvIndexInfo>;
    fn read_access_check(&self, auth_handle: u32, index: u32) -> Result<()>;
    fn read_bytes(&self, index: u32, offset: u16, len: u16) -> Result<Vec<u8>>;
}

/// Asymmetric or HMAC signature validation
pub trait SignatureVerifier {
    fn verify(&self, key: EntityRef, digest: &[u8], signature: &TpmtSignature) -> Result<()>;
}

/// Per-hierarchy secret values used as ticket and context HMAC keys
pub trait HierarchyProofs {
    fn proof(&self, hierarchy: u32) -> Result<Vec<u8>>;
}

/// Everything the session manager needs from the device
pub trait Platform: Clock + EntityResolver + NvAccess + SignatureVerifier + HierarchyProofs {}

impl<T> Platform for T where T: Clock + EntityResolver + NvAccess + SignatureVerifier + HierarchyProofs
{}

// ===== In-memory platform =====

#[derive(Debug, Clone)]
struct SimEntity {
    name: Tpm2bName,
    auth: Tpm2bAuth,
    policy_alg: TpmAlgId,
    auth_policy: Tpm2bDigest,
    hierarchy: u32,
    da_exempt: bool,
    /// HMAC signing key for simulated keyed objects
    signing_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct SimNvIndex {
    name: Tpm2bName,
    data: Vec<u8>,
    written: bool,
    readable: bool,
}

/// In-memory platform with HMAC-based "signatures"
#[derive(Debug, Clone)]
pub struct SimPlatform {
    now_ms: u64,
    epoch: u32,
    advancing: bool,
    reset_count: u32,
    restart_count: u32,
    total_reset_count: u64,
    clock_offset: u64,
    entities: HashMap<u32, SimEntity>,
    nv: HashMap<u32, SimNvIndex>,
    proofs: HashMap<u32, Vec<u8>>,
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPlatform {
    pub fn new() -> Self {
        let mut sim = Self {
            now_ms: 0,
            epoch: 1,
            advancing: true,
            reset_count: 0,
            restart_count: 0,
            total_reset_count: 0,
            clock_offset: 0,
            entities: HashMap::new(),
            nv: HashMap::new(),
            proofs: HashMap::new(),
        };
        for hierarchy in [
            tpm_rh::OWNER,
            tpm_rh::ENDORSEMENT,
            tpm_rh::PLATFORM,
            tpm_rh::NULL,
            tpm_rh::LOCKOUT,
        ] {
            let proof = crypto::hash(TpmAlgId::Sha256, &[b"sim proof", &hierarchy.to_be_bytes()])
                .unwrap_or_default();
            sim.proofs.insert(hierarchy, proof);
            sim.entities.insert(
                hierarchy,
                SimEntity {
                    name: Tpm2bName::from_handle(hierarchy),
                    auth: Tpm2bAuth::empty(),
                    policy_alg: TpmAlgId::Null,
                    auth_policy: Tpm2bDigest::empty(),
                    hierarchy,
                    da_exempt: hierarchy != tpm_rh::LOCKOUT,
                    signing_key: None,
                },
            );
        }
        sim
    }

    // ----- clock control -----

    pub fn advance(&mut self, ms: u64) {
        if self.advancing {
            self.now_ms += ms;
        }
    }

    pub fn set_time(&mut self, ms: u64) {
        self.now_ms = ms;
    }

    pub fn set_advancing(&mut self, advancing: bool) {
        self.advancing = advancing;
    }

    /// Lose time continuity: a new epoch invalidates time-bound authorizations
    pub fn bump_epoch(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        debug!(epoch = self.epoch, "simulated clock epoch changed");
    }

    /// Simulated TPM Reset
    pub fn reset(&mut self) {
        self.now_ms = 0;
        self.reset_count += 1;
        self.restart_count = 0;
        self.total_reset_count += 1;
        self.bump_epoch();
    }

    pub fn set_clock_offset(&mut self, offset: u64) {
        self.clock_offset = offset;
    }

    // ----- entity table -----

    /// Add a keyed object whose signatures are HMACs under `signing_key`
    pub fn add_signing_key(&mut self, handle: u32, signing_key: &[u8]) -> Tpm2bName {
        let name = Self::digest_name(&[b"key", signing_key]);
        self.entities.insert(
            handle,
            SimEntity {
                name: name.clone(),
                auth: Tpm2bAuth::empty(),
                policy_alg: TpmAlgId::Null,
                auth_policy: Tpm2bDigest::empty(),
                hierarchy: tpm_rh::OWNER,
                da_exempt: false,
                signing_key: Some(signing_key.to_vec()),
            },
        );
        name
    }

    /// Add an object with an auth value and optional policy
    pub fn add_object(
        &mut self,
        handle: u32,
        auth: &[u8],
        policy_alg: TpmAlgId,
        auth_policy: &[u8],
    ) -> Tpm2bName {
        let name = Self::digest_name(&[b"object", &handle.to_be_bytes(), auth_policy]);
        self.entities.insert(
            handle,
            SimEntity {
                name: name.clone(),
                auth: Tpm2bAuth::new(auth),
                policy_alg,
                auth_policy: Tpm2bDigest::new(auth_policy),
                hierarchy: tpm_rh::OWNER,
                da_exempt: false,
                signing_key: None,
            },
        );
        name
    }

    /// Add an entity known only by its name, as trial evaluation needs
    pub fn add_named_entity(&mut self, handle: u32, name: Tpm2bName) {
        self.entities.insert(
            handle,
            SimEntity {
                name,
                auth: Tpm2bAuth::empty(),
                policy_alg: TpmAlgId::Null,
                auth_policy: Tpm2bDigest::empty(),
                hierarchy: tpm_rh::OWNER,
                da_exempt: false,
                signing_key: None,
            },
        );
    }

    pub fn set_hierarchy_auth(&mut self, hierarchy: u32, auth: &[u8]) {
        if let Some(e) = self.entities.get_mut(&hierarchy) {
            e.auth = Tpm2bAuth::new(auth);
        }
    }

    pub fn set_da_exempt(&mut self, handle: u32, exempt: bool) {
        if let Some(e) = self.entities.get_mut(&handle) {
            e.da_exempt = exempt;
        }
    }

    /// Produce the signature a holder of `handle`'s key would send
    pub fn sign(&self, handle: u32, hash_alg: TpmAlgId, digest: &[u8]) -> Result<TpmtSignature> {
        let key = self
            .entities
            .get(&handle)
            .and_then(|e| e.signing_key.as_ref())
            .ok_or(TpmError::Handle)?;
        Ok(TpmtSignature {
            scheme: TpmAlgId::Hmac,
            hash_alg,
            signature: crypto::hmac(hash_alg, key, &[digest])?,
        })
    }

    // ----- NV -----

    pub fn define_nv(&mut self, index: u32, data_size: u16) -> Tpm2bName {
        let name = Self::digest_name(&[b"nv", &index.to_be_bytes(), &data_size.to_be_bytes()]);
        self.nv.insert(
            index,
            SimNvIndex {
                name: name.clone(),
                data: vec![0u8; data_size as usize],
                written: false,
                readable: true,
            },
        );
        name
    }

    /// Define an index under a caller-chosen name
    pub fn define_nv_named(&mut self, index: u32, name: Tpm2bName, data_size: u16) {
        self.nv.insert(
            index,
            SimNvIndex {
                name,
                data: vec![0u8; data_size as usize],
                written: false,
                readable: true,
            },
        );
    }

    pub fn write_nv(&mut self, index: u32, offset: usize, bytes: &[u8]) -> Result<()> {
        let nv = self.nv.get_mut(&index).ok_or(TpmError::Handle)?;
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= nv.data.len())
            .ok_or(TpmError::Range("NV write past end of index"))?;
        nv.data[offset..end].copy_from_slice(bytes);
        nv.written = true;
        Ok(())
    }

    pub fn set_nv_readable(&mut self, index: u32, readable: bool) {
        if let Some(nv) = self.nv.get_mut(&index) {
            nv.readable = readable;
        }
    }

    fn digest_name(parts: &[&[u8]]) -> Tpm2bName {
        let mut name = TpmAlgId::Sha256.to_u16().to_be_bytes().to_vec();
        name.extend(crypto::hash(TpmAlgId::Sha256, parts).unwrap_or_default());
        Tpm2bName::new(name)
    }

    fn entity(&self, entity: EntityRef) -> Result<&SimEntity> {
        self.entities.get(&entity.0).ok_or(TpmError::Handle)
    }
}

impl Clock for SimPlatform {
    fn now_ms(&self) -> u64 {
        self.now_ms
    }

    fn epoch(&self) -> u32 {
        self.epoch
    }

    fn is_advancing(&self) -> bool {
        self.advancing
    }

    fn total_reset_count(&self) -> u64 {
        self.total_reset_count
    }

    fn time_info(&self) -> TpmsTimeInfo {
        TpmsTimeInfo {
            time: self.now_ms,
            clock: self.clock_offset + self.now_ms,
            reset_count: self.reset_count,
            restart_count: self.restart_count,
            safe: true,
        }
    }
}

impl EntityResolver for SimPlatform {
    fn resolve(&self, handle: u32) -> Result<EntityRef> {
        if self.entities.contains_key(&handle) || self.nv.contains_key(&handle) {
            Ok(EntityRef(handle))
        } else {
            Err(TpmError::Handle)
        }
    }

    fn name_of(&self, entity: EntityRef) -> Result<Tpm2bName> {
        if let Some(nv) = self.nv.get(&entity.0) {
            return Ok(nv.name.clone());
        }
        Ok(self.entity(entity)?.name.clone())
    }

    fn auth_value_of(&self, entity: EntityRef) -> Result<Tpm2bAuth> {
        if self.nv.contains_key(&entity.0) {
            return Ok(Tpm2bAuth::empty());
        }
        Ok(self.entity(entity)?.auth.clone())
    }

    fn auth_policy_of(&self, entity: EntityRef) -> Result<(TpmAlgId, Tpm2bDigest)> {
        let e = self.entity(entity)?;
        Ok((e.policy_alg, e.auth_policy.clone()))
    }

    fn hierarchy_of(&self, entity: EntityRef) -> u32 {
        self.entities
            .get(&entity.0)
            .map_or(tpm_rh::OWNER, |e| e.hierarchy)
    }

    fn is_da_exempt(&self, entity: EntityRef) -> bool {
        self.entities.get(&entity.0).map_or(true, |e| e.da_exempt)
    }
}

impl NvAccess for SimPlatform {
    fn index_info(&self, index: u32) -> Result<NvIndexInfo> {
        let nv = self.nv.get(&index).ok_or(TpmError::Handle)?;
        Ok(NvIndexInfo {
            name: nv.name.clone(),
            data_size: nv.data.len() as u16,
            written: nv.written,
        })
    }

    fn read_access_check(&self, _auth_handle: u32, index: u32) -> Result<()> {
        let nv = self.nv.get(&index).ok_or(TpmError::Handle)?;
        if !nv.readable {
            return Err(TpmError::AuthFail);
        }
        if !nv.written {
            return Err(TpmError::NvUninitialized);
        }
        Ok(())
    }

    fn read_bytes(&self, index: u32, offset: u16, len: u16) -> Result<Vec<u8>> {
        let nv = self.nv.get(&index).ok_or(TpmError::Handle)?;
        let start = offset as usize;
        let end = start + len as usize;
        nv.data
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or(TpmError::Range("NV read past end of index"))
    }
}

impl SignatureVerifier for SimPlatform {
    fn verify(&self, key: EntityRef, digest: &[u8], signature: &TpmtSignature) -> Result<()> {
        if signature.scheme != TpmAlgId::Hmac {
            return Err(TpmError::Scheme);
        }
        let signing_key = self
            .entity(key)?
            .signing_key
            .as_ref()
            .ok_or(TpmError::Attributes("entity is not a signing key"))?;
        if crypto::hmac_verify(signature.hash_alg, signing_key, &[digest], &signature.signature)? {
            Ok(())
        } else {
            Err(TpmError::Signature)
        }
    }
}

impl HierarchyProofs for SimPlatform {
    fn proof(&self, hierarchy: u32) -> Result<Vec<u8>> {
        self.proofs
            .get(&hierarchy)
            .cloned()
            .ok_or(TpmError::Value("unknown hierarchy"))
    }
}
