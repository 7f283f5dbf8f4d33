// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Session manager
//!
//! Owns the loaded-session slots, the context identity registry and the
//! context counter. The command dispatcher holds one `SessionManager` and
//! passes it by mutable reference into every session-related command.

use rand::RngCore;
use tracing::{debug, error, info};

use crate::config::{ConfigError, SessionConfig};
use crate::constants::*;
use crate::context::{ActiveId, ContextRegistry, SlotState};
use crate::crypto;
use crate::error::{Result, TpmError};
use crate::marshal::*;
use crate::platform::Platform;
use crate::session::*;
use crate::slots::SlotRegistry;
use crate::types::*;

/// Parameters of TPM2_StartAuthSession that reach the session core
#[derive(Debug, Clone)]
pub struct StartSession {
    pub session_type: TpmSe,
    pub auth_hash: TpmAlgId,
    pub nonce_caller: Tpm2bNonce,
    pub symmetric: TpmtSymDef,
    /// Entity whose auth value keys the session, or `TPM_RH_NULL`
    pub bind: u32,
    /// Decrypted salt, empty for unsalted sessions
    pub salt: Tpm2bSalt,
}

impl StartSession {
    /// Unbound, unsalted session without parameter encryption
    pub fn new(session_type: TpmSe, auth_hash: TpmAlgId, nonce_caller: impl Into<Vec<u8>>) -> Self {
        Self {
            session_type,
            auth_hash,
            nonce_caller: Tpm2bNonce::new(nonce_caller),
            symmetric: TpmtSymDef::null(),
            bind: tpm_rh::NULL,
            salt: Tpm2bSalt::empty(),
        }
    }

    pub fn policy(auth_hash: TpmAlgId) -> Self {
        Self::new(TpmSe::Policy, auth_hash, vec![0u8; auth_hash.digest_size()])
    }

    pub fn trial(auth_hash: TpmAlgId) -> Self {
        Self::new(TpmSe::Trial, auth_hash, vec![0u8; auth_hash.digest_size()])
    }

    pub fn hmac(auth_hash: TpmAlgId) -> Self {
        Self::new(TpmSe::Hmac, auth_hash, vec![0u8; auth_hash.digest_size()])
    }

    pub fn with_bind(mut self, bind: u32) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_salt(mut self, salt: impl Into<Vec<u8>>) -> Self {
        self.salt = Tpm2bSalt::new(salt);
        self
    }

    pub fn with_symmetric(mut self, symmetric: TpmtSymDef) -> Self {
        self.symmetric = symmetric;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedSession {
    pub handle: u32,
    pub nonce_tpm: Tpm2bNonce,
}

/// TPMS_CONTEXT - a saved session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsContext {
    pub sequence: u64,
    pub saved_handle: u32,
    pub hierarchy: u32,
    /// TPM2B integrity HMAC followed by the encrypted session
    pub context_blob: Vec<u8>,
}

impl Marshal for TpmsContext {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u64(self.sequence);
        buf.put_u32(self.saved_handle);
        buf.put_u32(self.hierarchy);
        buf.put_tpm2b(&self.context_blob);
    }
}

impl Unmarshal for TpmsContext {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            sequence: buf.get_u64()?,
            saved_handle: buf.get_u32()?,
            hierarchy: buf.get_u32()?,
            context_blob: buf.get_tpm2b()?,
        })
    }
}

/// Handle list returned by the capability queries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleList {
    pub handles: Vec<u32>,
    pub more_data: bool,
}

pub struct SessionManager {
    config: SessionConfig,
    slots: SlotRegistry<Session>,
    contexts: ContextRegistry,
    /// Handle range of each active entry (HMAC or policy)
    bases: Vec<u32>,
    failure: Option<String>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            slots: SlotRegistry::with_capacity(config.max_loaded_sessions),
            contexts: ContextRegistry::new(
                config.max_active_sessions,
                config.max_loaded_sessions,
                config.context_slot,
            ),
            bases: vec![0; config.max_active_sessions],
            config,
            failure: None,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn contexts(&self) -> &ContextRegistry {
        &self.contexts
    }

    // ===== Failure mode =====

    pub fn in_failure_mode(&self) -> bool {
        self.failure.is_some()
    }

    fn guard(&self) -> Result<()> {
        match &self.failure {
            Some(reason) => Err(TpmError::Failure(reason.clone())),
            None => Ok(()),
        }
    }

    fn latch<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() && self.failure.is_none() {
                error!("entering failure mode: {err}");
                self.failure = Some(err.to_string());
            }
        }
        result
    }

    // ===== Handles =====

    fn active_id(&self, handle: u32) -> Result<ActiveId> {
        let base = match TpmHt::of(handle) {
            Some(TpmHt::HmacSession) => HMAC_SESSION_FIRST,
            Some(TpmHt::PolicySession) => POLICY_SESSION_FIRST,
            _ => return Err(TpmError::Handle),
        };
        let index = handle & HR_HANDLE_MASK;
        if index as usize >= self.contexts.capacity() {
            return Err(TpmError::Handle);
        }
        let id = ActiveId(index);
        match self.contexts.state(id) {
            Some(SlotState::Free) | None => Err(TpmError::Handle),
            _ if self.bases[index as usize] != base => Err(TpmError::Handle),
            _ => Ok(id),
        }
    }

    fn handle_of(&self, id: ActiveId) -> u32 {
        self.bases[id.0 as usize] | id.0
    }

    pub fn is_loaded(&self, handle: u32) -> bool {
        self.active_id(handle)
            .ok()
            .and_then(|id| self.contexts.state(id))
            .is_some_and(|s| matches!(s, SlotState::Loaded(_)))
    }

    pub fn is_saved(&self, handle: u32) -> bool {
        self.active_id(handle)
            .ok()
            .and_then(|id| self.contexts.state(id))
            .is_some_and(|s| matches!(s, SlotState::Saved(_)))
    }

    /// Handle of the saved session that must be reloaded first to clear a
    /// context gap
    pub fn oldest_saved(&self) -> Option<u32> {
        self.contexts.oldest().map(|id| self.handle_of(id))
    }

    // ===== Lifecycle =====

    pub fn create_session<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        params: StartSession,
    ) -> Result<StartedSession> {
        self.guard()?;
        let result = self.create_session_inner(platform, params);
        self.latch(result)
    }

    fn create_session_inner<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        params: StartSession,
    ) -> Result<StartedSession> {
        let hash = params.auth_hash;
        if !hash.is_hash() {
            return Err(TpmError::Hash);
        }
        let nonce_len = params.nonce_caller.len();
        if nonce_len < self.config.nonce_min_size || nonce_len > hash.digest_size() {
            return Err(TpmError::Size("nonceCaller"));
        }
        params.symmetric.validate()?;
        let bind = match params.bind {
            tpm_rh::NULL => None,
            handle => Some(platform.resolve(handle)?),
        };

        let id = self.contexts.begin_create(self.slots.free_count())?;

        let mut nonce_tpm = vec![0u8; nonce_len];
        rand::thread_rng().fill_bytes(&mut nonce_tpm);
        let nonce_tpm = Tpm2bNonce::new(nonce_tpm);

        let session_key = if bind.is_some() || !params.salt.is_empty() {
            let mut key = match bind {
                Some(entity) => platform.auth_value_of(entity)?.trimmed().to_vec(),
                None => Vec::new(),
            };
            key.extend_from_slice(params.salt.as_slice());
            let derived = crypto::kdfa(
                hash,
                &key,
                SESSION_KEY_LABEL,
                nonce_tpm.as_slice(),
                params.nonce_caller.as_slice(),
                (hash.digest_size() * 8) as u32,
            );
            zeroize::Zeroize::zeroize(&mut key);
            Tpm2bAuth::new(derived?)
        } else {
            Tpm2bAuth::empty()
        };

        let kind = match params.session_type {
            TpmSe::Hmac => SessionKind::Hmac(HmacState {
                bound_entity: match bind {
                    Some(entity) => Some(bound_entity_value(platform, entity)?),
                    None => None,
                },
            }),
            TpmSe::Policy | TpmSe::Trial => SessionKind::Policy(PolicyState::new(
                hash,
                params.session_type == TpmSe::Trial,
                platform.now_ms(),
                platform.epoch(),
            )),
        };
        let is_da_bound = bind.is_some_and(|e| !platform.is_da_exempt(e));
        let session = Session {
            kind,
            auth_hash_alg: hash,
            symmetric: params.symmetric,
            nonce_tpm: nonce_tpm.clone(),
            session_key,
            is_bound: bind.is_some() && params.session_type == TpmSe::Hmac,
            is_da_bound,
            is_lockout_bound: is_da_bound && params.bind == tpm_rh::LOCKOUT,
        };
        let base = session.handle_base();

        let slot = self.slots.allocate(session)?;
        self.contexts.mark_loaded(id, slot);
        self.bases[id.0 as usize] = base;
        let handle = self.handle_of(id);
        info!("session {handle:#010x} created ({:?})", params.session_type);
        Ok(StartedSession { handle, nonce_tpm })
    }

    pub fn get_session(&self, handle: u32) -> Result<&Session> {
        self.guard()?;
        let id = self.active_id(handle)?;
        match self.contexts.state(id) {
            Some(SlotState::Loaded(slot)) => self.slots.get(slot).ok_or(TpmError::Handle),
            _ => Err(TpmError::Handle),
        }
    }

    pub fn get_session_mut(&mut self, handle: u32) -> Result<&mut Session> {
        self.guard()?;
        let id = self.active_id(handle)?;
        match self.contexts.state(id) {
            Some(SlotState::Loaded(slot)) => self.slots.get_mut(slot).ok_or(TpmError::Handle),
            _ => Err(TpmError::Handle),
        }
    }

    /// Run one command's worth of work against a loaded session
    ///
    /// Fatal errors returned by `f` latch the manager into failure mode.
    pub fn execute<T>(
        &mut self,
        handle: u32,
        f: impl FnOnce(&mut Session) -> Result<T>,
    ) -> Result<T> {
        let result = self.get_session_mut(handle).and_then(f);
        self.latch(result)
    }

    pub fn flush(&mut self, handle: u32) -> Result<()> {
        self.guard()?;
        let id = self.active_id(handle)?;
        if let Some(slot) = self.contexts.flush(id) {
            self.slots.release(slot);
        }
        self.bases[id.0 as usize] = 0;
        info!("session {handle:#010x} flushed");
        Ok(())
    }

    // ===== Context save/load =====

    pub fn save<P: Platform + ?Sized>(&mut self, platform: &P, handle: u32) -> Result<TpmsContext> {
        self.guard()?;
        let result = self.save_inner(platform, handle);
        self.latch(result)
    }

    fn save_inner<P: Platform + ?Sized>(&mut self, platform: &P, handle: u32) -> Result<TpmsContext> {
        let id = self.active_id(handle)?;
        let Some(SlotState::Loaded(slot)) = self.contexts.state(id) else {
            return Err(TpmError::Handle);
        };
        let sequence = self.contexts.check_save(id)?;
        let session = self.slots.get(slot).ok_or(TpmError::Handle)?;
        let context_blob = self.seal_context(platform, sequence, handle, session)?;

        let (saved_sequence, slot) = self.contexts.save(id)?;
        debug_assert_eq!(saved_sequence, sequence);
        self.slots.release(slot);
        Ok(TpmsContext {
            sequence,
            saved_handle: handle,
            hierarchy: tpm_rh::NULL,
            context_blob,
        })
    }

    fn seal_context<P: Platform + ?Sized>(
        &self,
        platform: &P,
        sequence: u64,
        handle: u32,
        session: &Session,
    ) -> Result<Vec<u8>> {
        let alg = self.config.context_hash;
        let proof = platform.proof(tpm_rh::NULL)?;
        let mut plain = CommandBuffer::new();
        plain.put_u64(sequence);
        session.marshal(&mut plain);
        let mut encrypted = plain.into_vec();
        crypto::encrypt_context(alg, &proof, sequence, handle, &mut encrypted)?;
        let integrity = context_integrity(alg, &proof, platform, sequence, handle, &encrypted)?;
        let mut blob = CommandBuffer::new();
        blob.put_tpm2b(&integrity);
        blob.put_bytes(&encrypted);
        Ok(blob.into_vec())
    }

    pub fn load<P: Platform + ?Sized>(&mut self, platform: &P, context: &TpmsContext) -> Result<u32> {
        self.guard()?;
        let result = self.load_inner(platform, context);
        self.latch(result)
    }

    fn load_inner<P: Platform + ?Sized>(&mut self, platform: &P, context: &TpmsContext) -> Result<u32> {
        if context.hierarchy != tpm_rh::NULL {
            return Err(TpmError::Value("session contexts belong to TPM_RH_NULL"));
        }
        let handle = context.saved_handle;
        let id = self.active_id(handle)?;
        if !self.contexts.sequence_is_valid(id, context.sequence) {
            return Err(TpmError::Handle);
        }
        let session = self.unseal_context(platform, context)?;
        if session.handle_base() != self.bases[id.0 as usize] {
            return Err(TpmError::Handle);
        }

        self.contexts.begin_load(id, self.slots.free_count())?;
        let slot = self.slots.allocate(session)?;
        self.contexts.mark_loaded(id, slot);
        debug!(
            "session {handle:#010x} loaded from context {}",
            context.sequence
        );
        Ok(handle)
    }

    fn unseal_context<P: Platform + ?Sized>(&self, platform: &P, context: &TpmsContext) -> Result<Session> {
        let alg = self.config.context_hash;
        let proof = platform.proof(tpm_rh::NULL)?;
        let mut buf = ResponseBuffer::new(&context.context_blob);
        let integrity = buf
            .get_tpm2b_bounded(MAX_DIGEST_SIZE)
            .map_err(|_| TpmError::Integrity)?;
        let mut data = buf.get_bytes(buf.remaining())?;
        let expected = context_integrity(
            alg,
            &proof,
            platform,
            context.sequence,
            context.saved_handle,
            &data,
        )?;
        if !crypto::ct_eq(&expected, &integrity) {
            return Err(TpmError::Integrity);
        }
        crypto::decrypt_context(alg, &proof, context.sequence, context.saved_handle, &mut data)?;
        let mut plain = ResponseBuffer::new(&data);
        let fingerprint = plain.get_u64().map_err(|_| TpmError::Integrity)?;
        if fingerprint != context.sequence {
            return Err(TpmError::Integrity);
        }
        let session = Session::unmarshal(&mut plain).map_err(|_| TpmError::Integrity)?;
        plain.finish().map_err(|_| TpmError::Integrity)?;
        Ok(session)
    }

    // ===== Startup =====

    /// Apply TPM2_Startup semantics to the session state
    pub fn startup(&mut self, startup: Startup) -> Result<()> {
        let clear = startup == Startup::Clear;
        if !clear {
            self.guard()?;
        }
        self.slots.clear();
        self.contexts.startup(clear);
        for (id, state) in self.contexts.iter() {
            if state == SlotState::Free {
                self.bases[id.0 as usize] = 0;
            }
        }
        if clear {
            self.failure = None;
        }
        info!(?startup, "session state initialized");
        Ok(())
    }

    // ===== Capabilities =====

    fn collect_handles(&self, start: u32, count: usize, want_loaded: bool) -> HandleList {
        let mut list = HandleList::default();
        let first = (start & HR_HANDLE_MASK) as usize;
        for (id, state) in self.contexts.iter().skip(first) {
            let matches = match state {
                SlotState::Loaded(_) => want_loaded,
                SlotState::Saved(_) => !want_loaded,
                SlotState::Free => false,
            };
            if !matches {
                continue;
            }
            if list.handles.len() == count {
                list.more_data = true;
                break;
            }
            list.handles.push(self.handle_of(id));
        }
        list
    }

    /// Loaded session handles starting at `start`, at most `count`
    pub fn loaded_handles(&self, start: u32, count: usize) -> HandleList {
        self.collect_handles(start, count, true)
    }

    /// Saved session handles starting at `start`, at most `count`
    pub fn saved_handles(&self, start: u32, count: usize) -> HandleList {
        self.collect_handles(start, count, false)
    }

    pub fn loaded_count(&self) -> usize {
        self.slots.occupied_count()
    }

    pub fn loaded_available(&self) -> usize {
        self.slots.free_count()
    }

    pub fn active_count(&self) -> usize {
        self.contexts.active_count()
    }

    pub fn active_available(&self) -> usize {
        self.contexts.capacity() - self.contexts.active_count()
    }

    // ===== Bound sessions =====

    /// Whether `session_handle` is an HMAC session bound to `entity_handle`
    /// with the entity's current auth value
    pub fn is_bound_to<P: Platform + ?Sized>(
        &self,
        platform: &P,
        session_handle: u32,
        entity_handle: u32,
    ) -> Result<bool> {
        let session = self.get_session(session_handle)?;
        let SessionKind::Hmac(HmacState {
            bound_entity: Some(bound),
        }) = &session.kind
        else {
            return Ok(false);
        };
        let entity = platform.resolve(entity_handle)?;
        Ok(crypto::ct_eq(bound, &bound_entity_value(platform, entity)?))
    }
}

/// Entity name, zero padded, with the auth value XORed into the tail
fn bound_entity_value<P: Platform + ?Sized>(
    platform: &P,
    entity: crate::platform::EntityRef,
) -> Result<Vec<u8>> {
    let name = platform.name_of(entity)?;
    let auth = platform.auth_value_of(entity)?;
    let auth = auth.trimmed();
    let mut value = vec![0u8; BOUND_ENTITY_SIZE];
    if name.len() > BOUND_ENTITY_SIZE || auth.len() > BOUND_ENTITY_SIZE {
        return Err(TpmError::Size("bind entity"));
    }
    value[..name.len()].copy_from_slice(name.as_slice());
    let tail = BOUND_ENTITY_SIZE - auth.len();
    for (v, a) in value[tail..].iter_mut().zip(auth) {
        *v ^= a;
    }
    Ok(value)
}

fn context_integrity<P: Platform + ?Sized>(
    alg: TpmAlgId,
    proof: &[u8],
    platform: &P,
    sequence: u64,
    handle: u32,
    encrypted: &[u8],
) -> Result<Vec<u8>> {
    crypto::hmac(
        alg,
        proof,
        &[
            &platform.total_reset_count().to_be_bytes(),
            &sequence.to_be_bytes(),
            &handle.to_be_bytes(),
            encrypted,
        ],
    )
}
